//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod process;
pub mod runtime;
pub mod telemetry;
