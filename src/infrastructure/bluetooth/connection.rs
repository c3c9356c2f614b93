//! Per-device connection record
//!
//! Aggregates the HID Control and HID Interrupt channels of one remote
//! device together with its identification data.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::domain::error::BrbStatus;
use crate::domain::models::{BthAddr, ChannelKind, DeviceType};
use crate::infrastructure::bluetooth::channel::{
    ChannelEvent, ConnectionState, Effect, L2capChannel,
};
use crate::infrastructure::bluetooth::protocol::{Brb, BrbType, CloseChannel};
use crate::infrastructure::bluetooth::transport::ProfileDriverInterface;

/// Invoked once a destroyed record has finished tearing down
pub type DestroyCallback = Box<dyn Fn(&ConnectionRecord) + Send + Sync>;

/// State shared by the server and all of its records
pub struct DeviceContextHeader {
    pub transport: Arc<dyn ProfileDriverInterface>,
    /// Runtime that executes deferred teardown and timers
    pub runtime: Handle,
}

pub struct ConnectionRecord {
    id: u64,
    address: BthAddr,
    device_type: DeviceType,
    remote_name: String,
    control: L2capChannel,
    interrupt: L2capChannel,
    header: Arc<DeviceContextHeader>,
    destroy_callback: Option<DestroyCallback>,
    destroying: AtomicBool,
}

impl ConnectionRecord {
    pub(crate) fn new(
        id: u64,
        header: Arc<DeviceContextHeader>,
        address: BthAddr,
        device_type: DeviceType,
        remote_name: String,
        destroy_callback: Option<DestroyCallback>,
    ) -> Self {
        Self {
            id,
            address,
            device_type,
            remote_name,
            control: L2capChannel::new(ChannelKind::Control, address),
            interrupt: L2capChannel::new(ChannelKind::Interrupt, address),
            header,
            destroy_callback,
            destroying: AtomicBool::new(false),
        }
    }

    /// Generation id, unique per record for the lifetime of the registry
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> BthAddr {
        self.address
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn control(&self) -> &L2capChannel {
        &self.control
    }

    pub fn interrupt(&self) -> &L2capChannel {
        &self.interrupt
    }

    pub fn channel(&self, kind: ChannelKind) -> &L2capChannel {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Interrupt => &self.interrupt,
        }
    }

    pub fn header(&self) -> &Arc<DeviceContextHeader> {
        &self.header
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    /// Both channels connected, traffic may flow
    pub fn is_ready(&self) -> bool {
        self.control.state() == ConnectionState::Connected
            && self.interrupt.state() == ConnectionState::Connected
    }

    /// Mark for destruction; only the first caller wins
    pub(crate) fn mark_destroying(&self) -> bool {
        !self.destroying.swap(true, Ordering::AcqRel)
    }

    /// Instruct a channel to disconnect
    ///
    /// Returns `false` if the channel was in no state to disconnect. A close
    /// requested while the open is still pending is sent once the open
    /// completes.
    pub fn request_disconnect(self: &Arc<Self>, kind: ChannelKind) -> bool {
        let transition = self.channel(kind).apply(ChannelEvent::DisconnectRequested);
        match transition.effect {
            Effect::DeferClose => {
                debug!(
                    "{} channel of {} still connecting, close deferred",
                    kind, self.address
                );
                true
            }
            Effect::SubmitClose => {
                self.submit_close(kind);
                true
            }
            _ => false,
        }
    }

    /// Send CLOSE_CHANNEL over the channel's request slot
    pub(crate) fn submit_close(self: &Arc<Self>, kind: ChannelKind) {
        let channel = self.channel(kind);
        let address = self.address;
        let handle = channel.handle();
        let context = self.id;
        let record = Arc::clone(self);

        let result = channel.request_slot().submit(
            self.header.transport.as_ref(),
            BrbType::CloseChannel,
            |brb| {
                *brb = Brb::CloseChannel(CloseChannel {
                    address,
                    channel_handle: handle,
                    client_context: context,
                })
            },
            move |status, _| record.on_close_completed(kind, status),
        );

        // The device may already be gone, which is fine
        if let Err(e) = result {
            warn!(
                "CLOSE_CHANNEL for {} channel of {} not submitted: {}",
                kind, address, e
            );
            self.on_close_completed(kind, Err(e));
        }
    }

    pub(crate) fn on_close_completed(&self, kind: ChannelKind, status: BrbStatus) {
        if let Err(e) = &status {
            debug!(
                "CLOSE_CHANNEL for {} channel of {} completed with {}",
                kind, self.address, e
            );
        }
        let transition = self.channel(kind).apply(ChannelEvent::CloseCompleted);
        if transition.next == ConnectionState::Disconnected {
            info!("{} channel of {} disconnected", kind, self.address);
        }
    }

    /// Disconnect both channels and wait until neither has a close in flight
    pub(crate) async fn teardown(self: &Arc<Self>) {
        self.request_disconnect(ChannelKind::Interrupt);
        self.request_disconnect(ChannelKind::Control);

        self.interrupt.wait_disconnected().await;
        self.control.wait_disconnected().await;
    }

    pub(crate) fn run_destroy_callback(&self) {
        if let Some(callback) = &self.destroy_callback {
            callback(self);
        }
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("device_type", &self.device_type)
            .field("remote_name", &self.remote_name)
            .field("control", &self.control.state())
            .field("interrupt", &self.interrupt.state())
            .field("destroying", &self.is_destroying())
            .finish()
    }
}
