//! Meshlink server: authenticated method dispatch, capability discovery,
//! and pub/sub event streaming over HTTP/WebSocket.

pub mod auth;
pub mod dispatch;
pub mod events;
pub mod network;
pub mod registry;
pub mod resources;

pub use auth::AuthProvider;
pub use dispatch::DispatchServer;
pub use events::EventBroker;
pub use network::{NetworkConfig, NetworkModule};
pub use registry::{MethodHandler, MethodRegistry};
pub use resources::{register_resource_methods, ResourceStore};
