use anyhow::{anyhow, bail, Context, Result};
use chrono::DateTime;

use crate::config::normalize_symbols;
use crate::rollup::RollupRequest;

pub const USAGE: &str = "\
usage: tick-rollup [run]
       tick-rollup rollup --from <RFC3339> [--to <RFC3339>] [--symbols A,B]

  run      stream trades and persist minute bars (default)
  rollup   rebuild bars from the tick log; --to defaults to now and is
           clamped behind the live path";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Rollup(RollupArgs),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupArgs {
    pub from_ms: i64,
    pub to_ms: Option<i64>,
    pub symbols: Option<Vec<String>>,
}

impl RollupArgs {
    pub fn to_request(&self, now_ms: i64) -> RollupRequest {
        RollupRequest {
            from_ms: self.from_ms,
            to_ms: self.to_ms.unwrap_or(now_ms),
            symbols: self.symbols.clone(),
        }
    }
}

fn parse_instant(flag: &str, raw: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .with_context(|| format!("{} expects an RFC 3339 timestamp, got '{}'", flag, raw))
}

/// Parse arguments after the program name.
pub fn parse_args(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Run);
    };
    match first.as_str() {
        "run" => {
            if let Some(extra) = args.get(1) {
                bail!("`run` takes no arguments, got `{}`", extra);
            }
            Ok(Command::Run)
        }
        "rollup" => parse_rollup(&args[1..]).map(Command::Rollup),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => bail!("unknown subcommand `{}`. expected one of: run|rollup", other),
    }
}

fn parse_rollup(args: &[String]) -> Result<RollupArgs> {
    let mut from_ms = None;
    let mut to_ms = None;
    let mut symbols = None;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| anyhow!("`{}` requires a value", flag))?;
        match flag.as_str() {
            "--from" => from_ms = Some(parse_instant(flag, value)?),
            "--to" => to_ms = Some(parse_instant(flag, value)?),
            "--symbols" => {
                let list = normalize_symbols(value.split(','));
                if list.is_empty() {
                    bail!("--symbols is empty");
                }
                symbols = Some(list);
            }
            other => bail!("unknown rollup flag `{}`", other),
        }
    }

    let from_ms = from_ms.ok_or_else(|| anyhow!("`rollup` requires --from"))?;
    if let Some(to) = to_ms {
        if to <= from_ms {
            bail!("--to must be after --from");
        }
    }
    Ok(RollupArgs {
        from_ms,
        to_ms,
        symbols,
    })
}
