//! One-shot timer that re-enables the PSM filter after it was switched off
//! because of an unidentified device.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::domain::models::ServerEvent;
use crate::infrastructure::bluetooth::transport::PsmFilter;

pub struct FilterAutoResetTimer {
    filter: Arc<dyn PsmFilter>,
    runtime: Handle,
    event_sender: mpsc::UnboundedSender<ServerEvent>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl FilterAutoResetTimer {
    pub fn new(
        filter: Arc<dyn PsmFilter>,
        runtime: Handle,
        event_sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            filter,
            runtime,
            event_sender,
            pending: Mutex::new(None),
        }
    }

    /// Arm the timer; an already armed timer is restarted with `delay`
    ///
    /// The delay counts from this call, not from when the task first runs.
    pub fn start(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let filter = Arc::clone(&self.filter);
        let sender = self.event_sender.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            match filter.set_patch_enabled(true) {
                Ok(()) => {
                    info!("Filter re-enabled");
                    let _ = sender.send(ServerEvent::FilterReEnabled);
                }
                Err(e) => error!("Re-enabling filter failed: {}", e),
            }
        });

        if let Some(previous) = self.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(task) = self.lock().take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FilterAutoResetTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::loopback::{CompletionMode, LoopbackTransport};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let transport = Arc::new(LoopbackTransport::new(CompletionMode::Manual));
        transport.set_patch_enabled(false).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = FilterAutoResetTimer::new(transport.clone(), Handle::current(), tx);

        timer.start(Duration::from_secs(30));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!transport.filter_enabled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(transport.filter_enabled());
        assert!(!timer.is_armed());
        assert_eq!(rx.recv().await, Some(ServerEvent::FilterReEnabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_counts_from_arming() {
        let transport = Arc::new(LoopbackTransport::new(CompletionMode::Manual));
        transport.set_patch_enabled(false).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let timer = FilterAutoResetTimer::new(transport.clone(), Handle::current(), tx);

        // Clock moves before the timer task is first polled
        timer.start(Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!transport.filter_enabled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(transport.filter_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_pending_timer() {
        let transport = Arc::new(LoopbackTransport::new(CompletionMode::Manual));
        transport.set_patch_enabled(false).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let timer = FilterAutoResetTimer::new(transport.clone(), Handle::current(), tx);

        timer.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        timer.start(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!transport.filter_enabled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.filter_enabled());
        assert_eq!(transport.filter_toggles(), vec![false, true]);
    }
}
