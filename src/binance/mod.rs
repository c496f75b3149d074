pub mod normalizer;
pub mod types;
pub mod ws;
