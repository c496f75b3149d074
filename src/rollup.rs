//! Batch recomputation of minute bars from the durable tick log.

use crate::aggregate::aggregate_all;
use crate::bar_store::writer::PersistenceGateway;
use crate::bar_store::BarStore;
use crate::error::AppError;
use crate::model::tick::{minute_of, MINUTE_MS};

const WRITE_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupRequest {
    pub from_ms: i64,
    pub to_ms: i64,
    /// `None` rolls up every symbol in the log.
    pub symbols: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupReport {
    /// Effective half-open range after minute alignment and clamping.
    pub from_ms: i64,
    pub to_ms: i64,
    pub clamped: bool,
    pub ticks_read: u64,
    pub bars_written: u64,
    pub bars_dropped: u64,
}

pub struct RollupJob {
    gateway: PersistenceGateway<BarStore>,
    source: String,
    safety_lag_minutes: i64,
}

impl RollupJob {
    pub fn new(gateway: PersistenceGateway<BarStore>, source: &str, safety_lag_minutes: u32) -> Self {
        Self {
            gateway,
            source: source.to_string(),
            safety_lag_minutes: i64::from(safety_lag_minutes.max(1)),
        }
    }

    pub fn gateway(&self) -> &PersistenceGateway<BarStore> {
        &self.gateway
    }

    pub fn into_gateway(self) -> PersistenceGateway<BarStore> {
        self.gateway
    }

    /// Latest exclusive end the job may touch at `now_ms`.
    pub fn safe_end_ms(&self, now_ms: i64) -> i64 {
        (minute_of(now_ms) - self.safety_lag_minutes) * MINUTE_MS
    }

    /// Rebuild every bar in `[from, to)` from the tick log and upsert it.
    ///
    /// `from` is floored and `to` is floored to minute boundaries, so only
    /// whole windows are recomputed. Minutes with no ticks are left alone.
    pub fn run(&mut self, request: &RollupRequest, now_ms: i64) -> Result<RollupReport, AppError> {
        let from_ms = minute_of(request.from_ms) * MINUTE_MS;
        let mut to_ms = minute_of(request.to_ms) * MINUTE_MS;
        let safe_end = self.safe_end_ms(now_ms);
        let clamped = to_ms > safe_end;
        if clamped {
            tracing::warn!(
                requested_to_ms = to_ms,
                safe_end_ms = safe_end,
                "Rollup end clamped to stay behind the live path"
            );
            to_ms = safe_end;
        }

        let mut report = RollupReport {
            from_ms,
            to_ms,
            clamped,
            ..RollupReport::default()
        };
        if from_ms >= to_ms {
            tracing::info!(from_ms, to_ms, "Rollup range is empty");
            return Ok(report);
        }

        let symbols: Option<Vec<String>> = request.symbols.as_ref().map(|list| {
            list.iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        });
        let ticks = self
            .gateway
            .sink()
            .load_ticks(from_ms, to_ms, symbols.as_deref())?;
        report.ticks_read = ticks.len() as u64;

        let bars = aggregate_all(ticks, &self.source);
        for chunk in bars.chunks(WRITE_CHUNK) {
            if self.gateway.write_bars(chunk) {
                report.bars_written += chunk.len() as u64;
            } else {
                report.bars_dropped += chunk.len() as u64;
            }
        }

        tracing::info!(
            from_ms,
            to_ms,
            ticks = report.ticks_read,
            bars_written = report.bars_written,
            bars_dropped = report.bars_dropped,
            "Rollup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar_store::writer::RetryPolicy;

    fn job(lag: u32) -> RollupJob {
        let store = BarStore::open_in_memory().unwrap();
        RollupJob::new(PersistenceGateway::new(store, RetryPolicy::default()), "rollup", lag)
    }

    #[test]
    fn safe_end_trails_now_by_lag() {
        let j = job(2);
        assert_eq!(j.safe_end_ms(10 * MINUTE_MS + 30_000), 8 * MINUTE_MS);
    }

    #[test]
    fn zero_lag_is_raised_to_one_window() {
        let j = job(0);
        assert_eq!(j.safe_end_ms(10 * MINUTE_MS), 9 * MINUTE_MS);
    }

    #[test]
    fn range_entirely_in_the_future_does_nothing() {
        let mut j = job(2);
        let req = RollupRequest {
            from_ms: 9 * MINUTE_MS,
            to_ms: 12 * MINUTE_MS,
            symbols: None,
        };
        let report = j.run(&req, 10 * MINUTE_MS).unwrap();
        assert!(report.clamped);
        assert_eq!(report.to_ms, 8 * MINUTE_MS);
        assert_eq!(report.bars_written, 0);
    }
}
