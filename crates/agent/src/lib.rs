//! The tricorder agent: sniffs traffic on a configured device, reconstructs
//! protocol messages, and serves paired latency observations to the
//! coordinator over gRPC.

pub mod capture;
pub mod config;
pub mod error;
pub mod rpc;

pub use config::Config;
pub use error::AgentError;
pub use rpc::AgentHandle;
