// Module naming follows project convention (MPMC = Multi-Producer Multi-Consumer)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Debug;
#[allow(non_snake_case)]
pub mod MPMC;
#[allow(non_snake_case)]
pub mod Source;
#[allow(non_snake_case)]
pub mod Stream;
#[allow(non_snake_case)]
pub mod Transport;

pub mod config;
pub mod error;
pub mod logging;

pub use error::{ConfigError, GateError, PipelineError, SinkError, SourceError, TransportError};
