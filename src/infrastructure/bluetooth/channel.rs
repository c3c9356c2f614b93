//! L2CAP channel state machine
//!
//! ```text
//! Initialized ──open submitted──▶ Connecting ──opened──▶ Connected
//!                                    │                      │
//!                           disconnect requested    disconnect requested
//!                                    ▼                      ▼
//!                                 Disconnecting ◀───────────┘
//!                                    │
//!                              close completed
//!                                    ▼
//!                               Disconnected
//! ```
//!
//! A failed open leaves the channel in `Connecting` and tears the owning
//! record down instead. An open that was never submitted because a
//! disconnect raced it finishes the channel directly. A disconnect requested while the open is still
//! pending is recorded and acted upon when the open completes.
//!
//! [`ChannelStatus::step`] is the pure transition function; [`L2capChannel`]
//! applies it under the channel lock and maintains the disconnected signal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::domain::models::{BthAddr, ChannelHandle, ChannelKind};
use crate::infrastructure::bluetooth::request::RequestSlot;

pub use crate::domain::models::ConnectionState;

/// Result of an open request as seen by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    Failed,
    /// Opened by the remote, but refused locally (pairing precondition unmet)
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    OpenSubmitted,
    OpenAborted,
    OpenCompleted(OpenOutcome),
    DisconnectRequested,
    CloseCompleted,
}

/// Side effect the caller performs after releasing the channel lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    ActivateQueues,
    /// Disconnect recorded, close will follow the pending open
    DeferClose,
    SubmitClose,
    Teardown,
    CloseAndTeardown,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub open_pending: bool,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Initialized,
            open_pending: false,
        }
    }
}

impl ChannelStatus {
    pub fn step(self, event: ChannelEvent) -> (ChannelStatus, Effect) {
        use ChannelEvent::*;
        use ConnectionState::*;

        let settled = ChannelStatus {
            open_pending: false,
            ..self
        };
        let to = |state| ChannelStatus {
            state,
            open_pending: false,
        };

        match (self.state, event) {
            (Initialized, OpenSubmitted) if !self.open_pending => (
                ChannelStatus {
                    state: Connecting,
                    open_pending: true,
                },
                Effect::None,
            ),
            (Connecting, OpenAborted) if self.open_pending => (settled, Effect::None),
            // Teardown already waits on this channel; nothing left to close
            (Disconnecting, OpenAborted) if self.open_pending => {
                (to(Disconnected), Effect::None)
            }

            (Connecting, OpenCompleted(OpenOutcome::Opened)) if self.open_pending => {
                (to(Connected), Effect::ActivateQueues)
            }
            (Connecting, OpenCompleted(OpenOutcome::Failed)) if self.open_pending => {
                (settled, Effect::Teardown)
            }
            (Connecting, OpenCompleted(OpenOutcome::Refused)) if self.open_pending => {
                (to(Disconnecting), Effect::CloseAndTeardown)
            }
            (Disconnecting, OpenCompleted(OpenOutcome::Failed)) if self.open_pending => {
                (to(Disconnected), Effect::Teardown)
            }
            (Disconnecting, OpenCompleted(_)) if self.open_pending => {
                (settled, Effect::SubmitClose)
            }

            (Connecting, DisconnectRequested) if self.open_pending => (
                ChannelStatus {
                    state: Disconnecting,
                    open_pending: true,
                },
                Effect::DeferClose,
            ),
            (Connected, DisconnectRequested) => (to(Disconnecting), Effect::SubmitClose),

            (Disconnecting, CloseCompleted) if !self.open_pending => {
                (to(Disconnected), Effect::None)
            }

            _ => (self, Effect::Ignored),
        }
    }
}

/// Outcome of applying one event to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: ConnectionState,
    pub next: ConnectionState,
    pub effect: Effect,
}

struct ChannelInner {
    status: ChannelStatus,
    handle: ChannelHandle,
}

pub struct L2capChannel {
    kind: ChannelKind,
    address: BthAddr,
    inner: Mutex<ChannelInner>,
    request: Arc<RequestSlot>,
    /// `true` unless a disconnect is in progress
    disconnected: watch::Sender<bool>,
}

impl L2capChannel {
    pub fn new(kind: ChannelKind, address: BthAddr) -> Self {
        let (disconnected, _) = watch::channel(true);
        Self {
            kind,
            address,
            inner: Mutex::new(ChannelInner {
                status: ChannelStatus::default(),
                handle: ChannelHandle::default(),
            }),
            request: Arc::new(RequestSlot::new()),
            disconnected,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().status.state
    }

    pub fn status(&self) -> ChannelStatus {
        self.lock().status
    }

    pub fn handle(&self) -> ChannelHandle {
        self.lock().handle
    }

    pub fn request_slot(&self) -> &Arc<RequestSlot> {
        &self.request
    }

    /// Store the transport handle and move to `Connecting`
    ///
    /// Only an `Initialized` channel accepts an open; otherwise the current
    /// state is returned untouched.
    pub fn begin_open(&self, handle: ChannelHandle) -> Result<(), ConnectionState> {
        let mut inner = self.lock();
        let (next, effect) = inner.status.step(ChannelEvent::OpenSubmitted);
        if effect == Effect::Ignored {
            return Err(inner.status.state);
        }
        inner.handle = handle;
        inner.status = next;
        drop(inner);

        debug!(
            "{} channel of {}: Initialized -> Connecting",
            self.kind, self.address
        );
        Ok(())
    }

    pub fn apply(&self, event: ChannelEvent) -> Transition {
        self.apply_with(|| event)
    }

    /// Apply the event produced by `decide`, which runs under the channel lock
    pub fn apply_with(&self, decide: impl FnOnce() -> ChannelEvent) -> Transition {
        let mut inner = self.lock();
        let event = decide();
        let previous = inner.status.state;
        let (next, effect) = inner.status.step(event);
        inner.status = next;

        if previous != next.state {
            match next.state {
                ConnectionState::Disconnecting => {
                    self.disconnected.send_replace(false);
                }
                ConnectionState::Disconnected => {
                    self.disconnected.send_replace(true);
                }
                _ => {}
            }
        }
        drop(inner);

        if effect == Effect::Ignored {
            trace!(
                "{} channel of {}: {:?} ignored in {:?}",
                self.kind,
                self.address,
                event,
                previous
            );
        } else {
            debug!(
                "{} channel of {}: {:?} -> {:?} on {:?} ({:?})",
                self.kind, self.address, previous, next.state, event, effect
            );
        }

        Transition {
            previous,
            next: next.state,
            effect,
        }
    }

    pub fn is_disconnect_signaled(&self) -> bool {
        *self.disconnected.borrow()
    }

    /// Wait until no disconnect is in progress on this channel
    pub async fn wait_disconnected(&self) {
        let mut receiver = self.disconnected.subscribe();
        // The sender lives as long as `self`
        let _ = receiver.wait_for(|disconnected| *disconnected).await;
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status(state: ConnectionState, open_pending: bool) -> ChannelStatus {
        ChannelStatus {
            state,
            open_pending,
        }
    }

    #[test]
    fn test_open_success_path() {
        let (s, e) = ChannelStatus::default().step(ChannelEvent::OpenSubmitted);
        assert_eq!(s, status(ConnectionState::Connecting, true));
        assert_eq!(e, Effect::None);

        let (s, e) = s.step(ChannelEvent::OpenCompleted(OpenOutcome::Opened));
        assert_eq!(s, status(ConnectionState::Connected, false));
        assert_eq!(e, Effect::ActivateQueues);

        let (s, e) = s.step(ChannelEvent::DisconnectRequested);
        assert_eq!(s.state, ConnectionState::Disconnecting);
        assert_eq!(e, Effect::SubmitClose);

        let (s, e) = s.step(ChannelEvent::CloseCompleted);
        assert_eq!(s.state, ConnectionState::Disconnected);
        assert_eq!(e, Effect::None);
    }

    #[test]
    fn test_failed_open_tears_down_without_disconnect() {
        let s = status(ConnectionState::Connecting, true);
        let (s, e) = s.step(ChannelEvent::OpenCompleted(OpenOutcome::Failed));
        assert_eq!(s, status(ConnectionState::Connecting, false));
        assert_eq!(e, Effect::Teardown);

        // Nothing left to close
        let (s, e) = s.step(ChannelEvent::DisconnectRequested);
        assert_eq!(s.state, ConnectionState::Connecting);
        assert_eq!(e, Effect::Ignored);
    }

    #[test]
    fn test_disconnect_while_connecting_defers_close() {
        let s = status(ConnectionState::Connecting, true);
        let (s, e) = s.step(ChannelEvent::DisconnectRequested);
        assert_eq!(s, status(ConnectionState::Disconnecting, true));
        assert_eq!(e, Effect::DeferClose);

        // A close completion cannot be accepted before the open has finished
        let (s, e) = s.step(ChannelEvent::CloseCompleted);
        assert_eq!(e, Effect::Ignored);

        let (s, e) = s.step(ChannelEvent::OpenCompleted(OpenOutcome::Opened));
        assert_eq!(s, status(ConnectionState::Disconnecting, false));
        assert_eq!(e, Effect::SubmitClose);
    }

    #[test]
    fn test_disconnecting_open_failure_finishes_channel() {
        let s = status(ConnectionState::Disconnecting, true);
        let (s, e) = s.step(ChannelEvent::OpenCompleted(OpenOutcome::Failed));
        assert_eq!(s.state, ConnectionState::Disconnected);
        assert_eq!(e, Effect::Teardown);
    }

    #[test]
    fn test_aborted_open_after_disconnect_finishes_channel() {
        let s = status(ConnectionState::Disconnecting, true);
        let (s, e) = s.step(ChannelEvent::OpenAborted);
        assert_eq!(s, status(ConnectionState::Disconnected, false));
        assert_eq!(e, Effect::None);
    }

    #[test]
    fn test_refused_open_closes_channel() {
        let s = status(ConnectionState::Connecting, true);
        let (s, e) = s.step(ChannelEvent::OpenCompleted(OpenOutcome::Refused));
        assert_eq!(s.state, ConnectionState::Disconnecting);
        assert_eq!(e, Effect::CloseAndTeardown);
    }

    #[test]
    fn test_states_never_regress() {
        let events = [
            ChannelEvent::OpenSubmitted,
            ChannelEvent::OpenAborted,
            ChannelEvent::OpenCompleted(OpenOutcome::Opened),
            ChannelEvent::OpenCompleted(OpenOutcome::Failed),
            ChannelEvent::OpenCompleted(OpenOutcome::Refused),
            ChannelEvent::DisconnectRequested,
            ChannelEvent::CloseCompleted,
        ];
        let states = [
            ConnectionState::Initialized,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ];

        for state in states {
            for open_pending in [false, true] {
                for event in events {
                    let (next, _) = status(state, open_pending).step(event);
                    assert!(
                        next.state >= state,
                        "{:?} regressed to {:?} on {:?}",
                        state,
                        next.state,
                        event
                    );
                }
            }
        }

        for event in events {
            let (next, effect) = status(ConnectionState::Disconnected, false).step(event);
            assert_eq!(next.state, ConnectionState::Disconnected);
            assert_eq!(effect, Effect::Ignored);
        }
    }

    #[test]
    fn test_channel_signal_follows_disconnect() {
        let channel = L2capChannel::new(ChannelKind::Control, BthAddr(1));
        assert!(channel.is_disconnect_signaled());

        channel.begin_open(ChannelHandle(3)).unwrap();
        assert_eq!(channel.handle(), ChannelHandle(3));
        assert_eq!(
            channel.begin_open(ChannelHandle(4)),
            Err(ConnectionState::Connecting)
        );

        channel.apply(ChannelEvent::OpenCompleted(OpenOutcome::Opened));
        let t = channel.apply(ChannelEvent::DisconnectRequested);
        assert_eq!(t.previous, ConnectionState::Connected);
        assert!(!channel.is_disconnect_signaled());

        channel.apply(ChannelEvent::CloseCompleted);
        assert!(channel.is_disconnect_signaled());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_disconnected_blocks_until_close() {
        let channel = Arc::new(L2capChannel::new(ChannelKind::Interrupt, BthAddr(2)));
        channel.begin_open(ChannelHandle(5)).unwrap();
        channel.apply(ChannelEvent::OpenCompleted(OpenOutcome::Opened));
        channel.apply(ChannelEvent::DisconnectRequested);

        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.wait_disconnected().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        channel.apply(ChannelEvent::CloseCompleted);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
