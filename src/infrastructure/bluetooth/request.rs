//! Reusable request slot
//!
//! Each channel owns exactly one slot. Open and close requests of a channel
//! go through it, so at most one of them is ever outstanding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

use crate::domain::error::{BrbStatus, TransportError};
use crate::infrastructure::bluetooth::protocol::{Brb, BrbType};
use crate::infrastructure::bluetooth::transport::{ProfileDriverInterface, SubmitError};

pub struct RequestSlot {
    in_flight: AtomicBool,
    block: Mutex<Option<Brb>>,
}

impl RequestSlot {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            block: Mutex::new(None),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Reset the slot's block for `kind`, let `fill` populate it and submit it
    ///
    /// Fails with [`TransportError::Busy`] while a prior request is in flight.
    /// `on_complete` receives the final status and the submitted block; the
    /// slot is free again by the time it runs.
    pub fn submit<F, C>(
        self: &Arc<Self>,
        transport: &dyn ProfileDriverInterface,
        kind: BrbType,
        fill: F,
        on_complete: C,
    ) -> Result<(), TransportError>
    where
        F: FnOnce(&mut Brb),
        C: FnOnce(BrbStatus, &Brb) + Send + 'static,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::Busy);
        }

        let mut brb = self
            .take_block()
            .unwrap_or_else(|| Brb::new(kind));
        transport.reuse_brb(&mut brb, kind);
        fill(&mut brb);
        trace!("Submitting {:?} for {}", kind, brb.address());

        let slot = Arc::clone(self);
        let completion = Box::new(move |status: BrbStatus, brb: Brb| {
            let context = brb.clone();
            slot.release(brb);
            on_complete(status, &context);
        });

        match transport.send_brb_async(brb, completion) {
            Ok(()) => Ok(()),
            Err(SubmitError { error, brb }) => {
                self.release(brb);
                Err(error)
            }
        }
    }

    fn take_block(&self) -> Option<Brb> {
        self.block
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn release(&self, brb: Brb) {
        *self.block.lock().unwrap_or_else(PoisonError::into_inner) = Some(brb);
        self.in_flight.store(false, Ordering::Release);
    }
}

impl Default for RequestSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BthAddr, ChannelHandle};
    use crate::infrastructure::bluetooth::loopback::{CompletionMode, LoopbackTransport};
    use crate::infrastructure::bluetooth::protocol::CloseChannel;
    use std::sync::atomic::AtomicUsize;

    fn close_fill(brb: &mut Brb) {
        *brb = Brb::CloseChannel(CloseChannel {
            address: BthAddr(0xAA),
            channel_handle: ChannelHandle(7),
            client_context: 1,
        });
    }

    #[test]
    fn test_slot_rejects_second_submission_while_in_flight() {
        let transport = LoopbackTransport::new(CompletionMode::Manual);
        let slot = Arc::new(RequestSlot::new());

        slot.submit(&transport, BrbType::CloseChannel, close_fill, |_, _| {})
            .unwrap();
        assert!(slot.is_in_flight());

        let second = slot.submit(&transport, BrbType::CloseChannel, close_fill, |_, _| {});
        assert_eq!(second, Err(TransportError::Busy));
        assert_eq!(transport.pending_count(), 1);

        transport.complete_next(Ok(()));
        assert!(!slot.is_in_flight());
        slot.submit(&transport, BrbType::CloseChannel, close_fill, |_, _| {})
            .unwrap();
    }

    #[test]
    fn test_completion_runs_once_with_context() {
        let transport = LoopbackTransport::new(CompletionMode::Manual);
        let slot = Arc::new(RequestSlot::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        slot.submit(&transport, BrbType::CloseChannel, close_fill, move |status, brb| {
            assert_eq!(status, Err(TransportError::DeviceNotConnected));
            assert_eq!(brb.channel_handle(), ChannelHandle(7));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        transport.complete_next(Err(TransportError::DeviceNotConnected));
        assert!(transport.complete_next(Ok(())).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submission_failure_frees_slot() {
        let transport = LoopbackTransport::new(CompletionMode::Manual);
        transport.fail_next_submit(TransportError::InsufficientResources);
        let slot = Arc::new(RequestSlot::new());

        let result = slot.submit(&transport, BrbType::CloseChannel, close_fill, |_, _| {
            panic!("completion must not run for a refused submission");
        });
        assert_eq!(result, Err(TransportError::InsufficientResources));
        assert!(!slot.is_in_flight());
        assert_eq!(transport.pending_count(), 0);
    }
}
