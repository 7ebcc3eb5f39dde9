pub mod candles;
pub mod config;
pub mod dedup;
pub mod fallback;
pub(crate) mod pipeline;
pub mod remote;
pub mod stabilizer;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod types;
