//! In-memory profile driver
//!
//! Stands in for the radio stack: remote names come from a table, request
//! blocks are either held until released by the caller (`Manual`) or
//! completed on their own tokio task (`Spawned`). Every interaction is
//! recorded so hosts and tests can inspect what the core asked for.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::domain::error::{BrbStatus, TransportError};
use crate::domain::models::{BthAddr, ChannelHandle, HidQueue};
use crate::infrastructure::bluetooth::connection::ConnectionRecord;
use crate::infrastructure::bluetooth::protocol::{Brb, BrbType};
use crate::infrastructure::bluetooth::transport::{
    BrbCompletion, ProfileDriverInterface, PsmFilter, SubmitError,
};

pub enum CompletionMode {
    /// Completions wait in a queue until released explicitly
    Manual,
    /// Each completion runs on its own task
    Spawned(Handle),
}

struct PendingBrb {
    brb: Brb,
    completion: BrbCompletion,
}

pub struct LoopbackTransport {
    mode: CompletionMode,
    remote_names: Mutex<HashMap<BthAddr, String>>,
    pending: Mutex<VecDeque<PendingBrb>>,
    submitted: Mutex<Vec<Brb>>,
    spawned_status: Mutex<HashMap<BrbType, BrbStatus>>,
    queue_registrations: Mutex<Vec<(BthAddr, HidQueue)>>,
    outstanding_allocations: AtomicUsize,
    filter_enabled: AtomicBool,
    filter_toggles: Mutex<Vec<bool>>,
    fail_next_submit: Mutex<Option<TransportError>>,
    fail_name_resolution: AtomicBool,
    fail_allocations: AtomicBool,
    fail_queue_registration: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            remote_names: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            spawned_status: Mutex::new(HashMap::new()),
            queue_registrations: Mutex::new(Vec::new()),
            outstanding_allocations: AtomicUsize::new(0),
            filter_enabled: AtomicBool::new(true),
            filter_toggles: Mutex::new(Vec::new()),
            fail_next_submit: Mutex::new(None),
            fail_name_resolution: AtomicBool::new(false),
            fail_allocations: AtomicBool::new(false),
            fail_queue_registration: AtomicBool::new(false),
        }
    }

    pub fn set_remote_name(&self, address: BthAddr, name: impl Into<String>) {
        lock(&self.remote_names).insert(address, name.into());
    }

    /// Status used for blocks of `kind` in `Spawned` mode (default success)
    pub fn set_spawned_status(&self, kind: BrbType, status: BrbStatus) {
        lock(&self.spawned_status).insert(kind, status);
    }

    pub fn fail_next_submit(&self, error: TransportError) {
        *lock(&self.fail_next_submit) = Some(error);
    }

    /// Fail name resolution even for addresses with a known name
    pub fn fail_name_resolution(&self, fail: bool) {
        self.fail_name_resolution.store(fail, Ordering::SeqCst);
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queue_registration(&self, fail: bool) {
        self.fail_queue_registration.store(fail, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Blocks awaiting completion, oldest first
    pub fn pending(&self) -> Vec<Brb> {
        lock(&self.pending).iter().map(|p| p.brb.clone()).collect()
    }

    /// Every block ever submitted, in submission order
    pub fn submitted(&self) -> Vec<Brb> {
        lock(&self.submitted).clone()
    }

    pub fn queue_registrations(&self) -> Vec<(BthAddr, HidQueue)> {
        lock(&self.queue_registrations).clone()
    }

    pub fn outstanding_allocations(&self) -> usize {
        self.outstanding_allocations.load(Ordering::SeqCst)
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter_enabled.load(Ordering::SeqCst)
    }

    pub fn filter_toggles(&self) -> Vec<bool> {
        lock(&self.filter_toggles).clone()
    }

    /// Complete the oldest pending block
    pub fn complete_next(&self, status: BrbStatus) -> Option<Brb> {
        self.complete_where(|_| true, status)
    }

    /// Complete the oldest pending block on `handle` of type `kind`
    pub fn complete_for(
        &self,
        kind: BrbType,
        handle: ChannelHandle,
        status: BrbStatus,
    ) -> Option<Brb> {
        self.complete_where(
            |brb| brb.kind() == kind && brb.channel_handle() == handle,
            status,
        )
    }

    /// Complete the oldest pending block matching `predicate`
    ///
    /// The completion runs on the calling thread, outside internal locks.
    pub fn complete_where(
        &self,
        predicate: impl Fn(&Brb) -> bool,
        status: BrbStatus,
    ) -> Option<Brb> {
        let entry = {
            let mut pending = lock(&self.pending);
            let index = pending.iter().position(|p| predicate(&p.brb))?;
            pending.remove(index)?
        };
        let brb = entry.brb.clone();
        trace!("Completing {:?} for {} with {:?}", brb.kind(), brb.address(), status);
        (entry.completion)(status, entry.brb);
        Some(brb)
    }

    /// Complete pending blocks until none are left, including ones
    /// submitted by the completions themselves
    pub fn complete_all(&self, status: BrbStatus) -> usize {
        let mut completed = 0;
        while self.complete_next(status.clone()).is_some() {
            completed += 1;
        }
        completed
    }
}

impl ProfileDriverInterface for LoopbackTransport {
    fn resolve_remote_name(&self, address: BthAddr) -> Result<String, TransportError> {
        if self.fail_name_resolution.load(Ordering::SeqCst) {
            return Err(TransportError::Cancelled);
        }
        lock(&self.remote_names)
            .get(&address)
            .cloned()
            .ok_or(TransportError::DeviceNotConnected)
    }

    fn send_brb_async(&self, brb: Brb, completion: BrbCompletion) -> Result<(), SubmitError> {
        if let Some(error) = lock(&self.fail_next_submit).take() {
            debug!("Refusing {:?} for {}: {}", brb.kind(), brb.address(), error);
            return Err(SubmitError { error, brb });
        }

        lock(&self.submitted).push(brb.clone());

        match &self.mode {
            CompletionMode::Manual => {
                lock(&self.pending).push_back(PendingBrb { brb, completion });
            }
            CompletionMode::Spawned(runtime) => {
                let status = lock(&self.spawned_status)
                    .get(&brb.kind())
                    .cloned()
                    .unwrap_or(Ok(()));
                runtime.spawn(async move {
                    tokio::task::yield_now().await;
                    completion(status, brb);
                });
            }
        }
        Ok(())
    }

    fn allocate_brb(&self, kind: BrbType) -> Result<Brb, TransportError> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(TransportError::InsufficientResources);
        }
        self.outstanding_allocations.fetch_add(1, Ordering::SeqCst);
        Ok(Brb::new(kind))
    }

    fn free_brb(&self, _brb: Brb) {
        self.outstanding_allocations.fetch_sub(1, Ordering::SeqCst);
    }

    fn queue_ready_notify(
        &self,
        queue: HidQueue,
        record: &Arc<ConnectionRecord>,
    ) -> Result<(), TransportError> {
        if self.fail_queue_registration.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidDeviceState);
        }
        lock(&self.queue_registrations).push((record.address(), queue));
        Ok(())
    }
}

impl PsmFilter for LoopbackTransport {
    fn set_patch_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        self.filter_enabled.store(enabled, Ordering::SeqCst);
        lock(&self.filter_toggles).push(enabled);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
