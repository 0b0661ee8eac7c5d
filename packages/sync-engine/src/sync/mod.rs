//! Background Sync Scheduler (component D, §4.4).

pub mod background_handoff;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod scheduler;

pub use background_handoff::run_background_sync;
pub use protocol::{FnTransport, HttpTransport, SyncTransport};
pub use queue::SyncQueue;
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerChangeObserver, SchedulerCore, SchedulerHandle, SchedulerPolicy, SchedulerState};
