pub mod cli;
pub mod config;
pub mod ipc;
pub mod observability;
pub mod store;

use std::sync::Arc;

use config::{DaemonConfig, HotConfig};
use ipc::event::EventBroadcaster;
use store::TaskStore;

/// Shared application state passed to every RPC handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    /// Exclusive owner of the task collection and its on-disk file.
    pub store: Arc<TaskStore>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub started_at: std::time::Instant,
    /// Local WebSocket auth token.  Every new connection must send a
    /// `daemon.auth` RPC with this token before any other method call.
    /// Empty string means auth is disabled (test configurations).
    pub auth_token: String,
    /// Hot-reloadable config fields (None when the watcher could not start).
    pub hot_config: Option<Arc<tokio::sync::RwLock<HotConfig>>>,
}
