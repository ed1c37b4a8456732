//! Periodic idle session reaper
//!
//! At most one reaper runs per [`SessionManager`]. It calls
//! [`SessionManager::cleanup`] on every tick until its cancellation token
//! fires. A sweep that has started runs to completion before the
//! cancellation is observed.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::manager::SessionManager;

/// Interval between idle sweeps when none is configured
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Marks a manager's reaper slot as taken until dropped
struct ReaperSlot {
    sessions: Arc<SessionManager>,
}

impl ReaperSlot {
    fn acquire(sessions: &Arc<SessionManager>) -> Option<Self> {
        sessions
            .reaper_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            sessions: Arc::clone(sessions),
        })
    }
}

impl Drop for ReaperSlot {
    fn drop(&mut self) {
        self.sessions.reaper_running.store(false, Ordering::Release);
    }
}

impl SessionManager {
    /// Spawn the periodic idle sweep.
    ///
    /// Returns `None` without spawning when a reaper is already running for
    /// this manager.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let Some(slot) = ReaperSlot::acquire(self) else {
            tracing::warn!("Idle session reaper already running");
            return None;
        };
        Some(tokio::spawn(run_reaper(slot, interval, cancel)))
    }

    pub fn is_reaper_running(&self) -> bool {
        self.reaper_running.load(Ordering::Acquire)
    }
}

async fn run_reaper(slot: ReaperSlot, interval: Duration, cancel: CancellationToken) {
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Starting idle session reaper (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                slot.sessions.cleanup().await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Idle session reaper shutting down");
                break;
            }
        }
    }
}
