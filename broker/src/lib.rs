pub mod config;
pub mod error;
pub mod handles;
pub mod host;
pub mod local;
pub mod registry;
pub mod server;

pub use config::BrokerConfig;
pub use error::BrokerError;
pub use local::LocalTransport;
pub use registry::{Limits, Registry, SessionId};
