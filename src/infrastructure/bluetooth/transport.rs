//! Profile driver contract
//!
//! Everything below the connection core: name resolution, asynchronous
//! request submission, request block management, queue activation and the
//! PSM filter switch.

use std::sync::Arc;

use crate::domain::error::{BrbStatus, TransportError};
use crate::domain::models::{BthAddr, HidQueue};
use crate::infrastructure::bluetooth::connection::ConnectionRecord;
use crate::infrastructure::bluetooth::protocol::{Brb, BrbType};

/// Invoked exactly once per successfully submitted request block
pub type BrbCompletion = Box<dyn FnOnce(BrbStatus, Brb) + Send + 'static>;

/// A submission the driver refused; the block is handed back to the caller
#[derive(Debug)]
pub struct SubmitError {
    pub error: TransportError,
    pub brb: Brb,
}

pub trait ProfileDriverInterface: Send + Sync {
    /// Query the radio for the remote device name
    fn resolve_remote_name(&self, address: BthAddr) -> Result<String, TransportError>;

    /// Submit a request block; `completion` runs later on a driver context
    fn send_brb_async(&self, brb: Brb, completion: BrbCompletion) -> Result<(), SubmitError>;

    fn allocate_brb(&self, kind: BrbType) -> Result<Brb, TransportError>;

    fn free_brb(&self, brb: Brb);

    /// Reset a previously used block for a new request of `kind`
    fn reuse_brb(&self, brb: &mut Brb, kind: BrbType) {
        *brb = Brb::new(kind);
    }

    /// Start dispatching `queue` of `record` once its channel is connected
    fn queue_ready_notify(
        &self,
        queue: HidQueue,
        record: &Arc<ConnectionRecord>,
    ) -> Result<(), TransportError>;
}

/// The lower filter that remaps HID PSMs to this server
pub trait PsmFilter: Send + Sync {
    fn set_patch_enabled(&self, enabled: bool) -> Result<(), TransportError>;
}
