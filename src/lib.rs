//! Remote fan-out execution and Redis/MongoDB cluster lifecycle orchestration.

pub mod admin;
pub mod bench;
pub mod conf;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod load;
pub mod report;
pub mod resolver;
pub mod sweep;
pub mod topology;
pub mod types;

pub use error::{DeployError, ExecError, Result};
