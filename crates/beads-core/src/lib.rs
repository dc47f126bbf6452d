//! Subscription registry, refresh scheduler, change watcher, connection
//! sessions, and mutation handlers for the beads bridge daemon.

pub mod dispatch;
pub mod error;
pub mod ids;
pub mod mutation;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod watcher;

pub use dispatch::{dispatch, parse_frame, ConnectionCtx};
pub use error::DispatchError;
pub use registry::{RegistryHandle, RegistryService};
pub use scheduler::{SchedulerHandle, DEFAULT_DEBOUNCE};
pub use session::{
    ConnectionId, ConnectionSink, ListFilters, SessionHandle, SessionService, SessionSnapshot,
};
pub use watcher::ChangeWatcher;
