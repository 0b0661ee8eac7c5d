//! Bridges OS-level background-execution callbacks into a sync round
//! (§6.4 "host capabilities"). The host platform (iOS background fetch,
//! Android `WorkManager`, a desktop timer) calls [`run_background_sync`]
//! from whatever wake-up mechanism it has; this module knows nothing about
//! the mechanism itself.

use std::time::Duration;

use super::scheduler::SchedulerHandle;

/// Runs one bounded sync round and returns once it completes or the budget
/// elapses, whichever is first. Background OS schedulers often grant only
/// a few seconds of wall-clock time before suspending the process.
pub async fn run_background_sync(scheduler: &SchedulerHandle, budget: Duration) -> bool {
    tokio::select! {
        () = scheduler.sync_all() => true,
        () = tokio::time::sleep(budget) => false,
    }
}
