pub mod aggregate;
pub mod bar_store;
pub mod binance;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod rollup;
