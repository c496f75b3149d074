pub mod buffer;
pub mod service;

pub use buffer::{ClosedWindow, PushOutcome, TickBuffer};
pub use service::{IngestConfig, IngestService, IngestStats};
