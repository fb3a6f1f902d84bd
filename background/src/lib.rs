//! Background component for pagetrail
//!
//! Watches tab activity, decides which visits are worth indexing and writes
//! them to the page index, and migrates the legacy index while the user is
//! idle.
//!
//! - [`TabStateManager`] owns per-tab visit state and pending tasks
//! - [`VisitSchedulingService`] runs the two-stage indexing protocol
//! - [`MigrationManager`] drives the idle-gated legacy migration

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod collaborators;
pub mod errors;
pub mod events;
pub mod migration;
pub mod scheduler;
pub mod signals;
pub mod tab_state;

pub use collaborators::{
    ConfigLogPolicy, FavIconFetcher, HttpFavIconFetcher, LogPolicy, Notifier, PageExtractor,
    ReportedPageExtractor, TabSignals, TracingNotifier,
};
pub use errors::{HandlerError, HandlerResult};
pub use events::{ChangedFields, RawTabEvent, TabChangedEvent, TabId, TabSnapshot};
pub use migration::MigrationManager;
pub use scheduler::VisitSchedulingService;
pub use signals::{ChannelTabSignals, IdleState, idle_channel};
pub use tab_state::{ScrollState, TabState, TabStateManager};
