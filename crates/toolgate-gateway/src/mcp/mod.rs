//! MCP protocol surface
//!
//! - `handler` - the rmcp `ServerHandler` serving aggregated capabilities
//! - `context` - per-request session identification
//! - `notifier` - pushes `list_changed` notifications to connected peers

pub mod context;
pub mod handler;
pub mod notifier;

pub use handler::GatewayHandler;
pub use notifier::ChangeNotifier;
