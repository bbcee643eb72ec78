//! Meshlink client: resilient connector with circuit breaking, capped
//! exponential reconnection, event listening, and a multi-server facade.

pub mod breaker;
pub mod config;
pub mod connector;
pub mod error;
pub mod multi;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::ConnectorConfig;
pub use connector::{ClientConnector, EventHandler};
pub use error::ClientError;
pub use multi::{Agenda, MultiServerClient};
