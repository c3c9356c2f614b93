//! Registry of connection records, keyed by remote address

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::error::{L2capError, L2capResult};
use crate::domain::models::{BthAddr, DeviceType};
use crate::infrastructure::bluetooth::connection::{
    ConnectionRecord, DestroyCallback, DeviceContextHeader,
};

pub struct ConnectionRegistry {
    header: Arc<DeviceContextHeader>,
    /// Insertion ordered; at most one entry per address
    records: Arc<Mutex<Vec<Arc<ConnectionRecord>>>>,
    teardowns: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(header: Arc<DeviceContextHeader>) -> Self {
        Self {
            header,
            records: Arc::new(Mutex::new(Vec::new())),
            teardowns: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create and insert a record for `address`
    pub fn create(
        &self,
        address: BthAddr,
        device_type: DeviceType,
        remote_name: String,
        destroy_callback: Option<DestroyCallback>,
    ) -> L2capResult<Arc<ConnectionRecord>> {
        let mut records = lock(&self.records);
        if records.iter().any(|r| r.address() == address) {
            return Err(L2capError::AlreadyRegistered(address));
        }

        let record = Arc::new(ConnectionRecord::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(&self.header),
            address,
            device_type,
            remote_name,
            destroy_callback,
        ));
        records.push(Arc::clone(&record));

        info!(
            "Connection record {} created for {} ({})",
            record.id(),
            address,
            device_type
        );
        Ok(record)
    }

    pub fn find_by_address(&self, address: BthAddr) -> Option<Arc<ConnectionRecord>> {
        lock(&self.records)
            .iter()
            .find(|r| r.address() == address)
            .cloned()
    }

    /// Destroy a record
    ///
    /// Disconnects both channels, waits on the runtime until no close is in
    /// flight, then removes the entry and runs the destroy callback. Safe to
    /// call from completion callbacks and more than once; returns `false` if
    /// the record was already being destroyed.
    pub fn destroy(&self, record: &Arc<ConnectionRecord>) -> bool {
        if !record.mark_destroying() {
            debug!("Record {} of {} already destroying", record.id(), record.address());
            return false;
        }
        debug!("Destroying record {} of {}", record.id(), record.address());

        let records = Arc::clone(&self.records);
        let record = Arc::clone(record);
        let teardown = self.header.runtime.spawn(async move {
            record.teardown().await;

            // Generation check: only remove this very record
            lock(&records).retain(|r| !Arc::ptr_eq(r, &record));
            record.run_destroy_callback();
            info!(
                "Connection record {} of {} destroyed",
                record.id(),
                record.address()
            );
        });

        let mut teardowns = lock(&self.teardowns);
        teardowns.retain(|t| !t.is_finished());
        teardowns.push(teardown);
        true
    }

    /// Wait for every teardown started so far
    pub async fn wait_for_teardowns(&self) {
        let pending: Vec<_> = lock(&self.teardowns).drain(..).collect();
        for teardown in pending {
            let _ = teardown.await;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<BthAddr> {
        lock(&self.records).iter().map(|r| r.address()).collect()
    }

    /// Snapshot of all records in insertion order
    pub fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        lock(&self.records).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ChannelHandle, ChannelKind};
    use crate::infrastructure::bluetooth::channel::{ChannelEvent, ConnectionState, OpenOutcome};
    use crate::infrastructure::bluetooth::loopback::{CompletionMode, LoopbackTransport};
    use crate::infrastructure::bluetooth::protocol::BrbType;
    use std::sync::atomic::AtomicUsize;
    use tokio::runtime::Handle;

    fn registry(transport: Arc<LoopbackTransport>) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(DeviceContextHeader {
            transport,
            runtime: Handle::current(),
        }))
    }

    #[tokio::test]
    async fn test_one_record_per_address() {
        let registry = registry(Arc::new(LoopbackTransport::new(CompletionMode::Manual)));
        let first = registry
            .create(BthAddr(1), DeviceType::Sixaxis, "a".into(), None)
            .unwrap();
        registry
            .create(BthAddr(2), DeviceType::Motion, "b".into(), None)
            .unwrap();

        assert!(matches!(
            registry.create(BthAddr(1), DeviceType::Wireless, "c".into(), None),
            Err(L2capError::AlreadyRegistered(BthAddr(1)))
        ));
        assert_eq!(registry.addresses(), vec![BthAddr(1), BthAddr(2)]);

        let found = registry.find_by_address(BthAddr(1)).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert!(registry.find_by_address(BthAddr(3)).is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let registry = registry(Arc::new(LoopbackTransport::new(CompletionMode::Manual)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let record = registry
            .create(
                BthAddr(1),
                DeviceType::Sixaxis,
                "a".into(),
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        assert!(registry.destroy(&record));
        assert!(!registry.destroy(&record));
        registry.wait_for_teardowns().await;

        assert!(registry.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_waits_for_close_completion() {
        let transport = Arc::new(LoopbackTransport::new(CompletionMode::Manual));
        let registry = registry(Arc::clone(&transport));
        let record = registry
            .create(BthAddr(1), DeviceType::Sixaxis, "a".into(), None)
            .unwrap();

        record.control().begin_open(ChannelHandle(10)).unwrap();
        record
            .control()
            .apply(ChannelEvent::OpenCompleted(OpenOutcome::Opened));

        registry.destroy(&record);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // Close submitted, record still registered until it completes
        assert_eq!(transport.pending_count(), 1);
        assert_eq!(transport.pending()[0].kind(), BrbType::CloseChannel);
        assert_eq!(registry.len(), 1);
        assert_eq!(record.control().state(), ConnectionState::Disconnecting);

        transport.complete_next(Ok(()));
        registry.wait_for_teardowns().await;

        assert!(registry.is_empty());
        assert_eq!(record.control().state(), ConnectionState::Disconnected);
        assert_eq!(record.channel(ChannelKind::Interrupt).state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn test_destroy_during_open_submission_completes() {
        let transport = Arc::new(LoopbackTransport::new(CompletionMode::Manual));
        let registry = registry(Arc::clone(&transport));
        let record = registry
            .create(BthAddr(1), DeviceType::Sixaxis, "a".into(), None)
            .unwrap();

        // Destroyed between admission and a failed open submission
        record.control().begin_open(ChannelHandle(10)).unwrap();
        registry.destroy(&record);
        tokio::task::yield_now().await;
        assert_eq!(record.control().state(), ConnectionState::Disconnecting);

        record.control().apply(ChannelEvent::OpenAborted);
        assert_eq!(record.control().state(), ConnectionState::Disconnected);

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            registry.wait_for_teardowns(),
        )
        .await
        .unwrap();
        assert!(registry.is_empty());
        assert_eq!(transport.pending_count(), 0);
    }
}
