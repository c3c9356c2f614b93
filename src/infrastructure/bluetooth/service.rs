//! L2CAP Server Module
//!
//! Accepts or denies incoming HID connections, drives both channels of an
//! accepted device through the open handshake and tears devices down on
//! disconnect or failure.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::error::{BrbStatus, L2capError, L2capResult, TransportError};
use crate::domain::identification;
use crate::domain::models::{
    BthAddr, ChannelIndication, ChannelKind, DenyReason, DeviceType, DisconnectReason, HidQueue,
    Indication, IndicationParameters, ServerEvent,
};
use crate::domain::settings::{Settings, SettingsService};
use crate::infrastructure::bluetooth::channel::{
    ChannelEvent, ConnectionState, Effect, OpenOutcome,
};
use crate::infrastructure::bluetooth::connection::{
    ConnectionRecord, DestroyCallback, DeviceContextHeader,
};
use crate::infrastructure::bluetooth::filter::FilterAutoResetTimer;
use crate::infrastructure::bluetooth::protocol::{
    self, Brb, BrbType, CallbackFlags, OpenChannelResponse, CF_ROLE_EITHER,
    CONNECT_RSP_RESULT_PSM_NEG, CONNECT_RSP_RESULT_SUCCESS, INCOMING_QUEUE_DEPTH,
};
use crate::infrastructure::bluetooth::registry::ConnectionRegistry;
use crate::infrastructure::bluetooth::transport::{
    ProfileDriverInterface, PsmFilter, SubmitError,
};

/// Outcome of an incoming connection
#[derive(Debug)]
pub enum Admission {
    /// Open response submitted for this record
    Accepted(Arc<ConnectionRecord>),
    /// Deny response submitted
    Denied(DenyReason),
}

struct ServerInner {
    header: Arc<DeviceContextHeader>,
    filter: Arc<dyn PsmFilter>,
    settings: Arc<Mutex<SettingsService>>,
    registry: ConnectionRegistry,
    auto_reset_timer: FilterAutoResetTimer,
    event_sender: mpsc::UnboundedSender<ServerEvent>,
}

/// HID L2CAP server for PS3 peripherals
#[derive(Clone)]
pub struct L2capServer {
    inner: Arc<ServerInner>,
}

impl L2capServer {
    pub fn new(
        transport: Arc<dyn ProfileDriverInterface>,
        filter: Arc<dyn PsmFilter>,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<ServerEvent>,
        runtime: Handle,
    ) -> Self {
        let header = Arc::new(DeviceContextHeader {
            transport,
            runtime: runtime.clone(),
        });
        let auto_reset_timer =
            FilterAutoResetTimer::new(Arc::clone(&filter), runtime, event_sender.clone());

        Self {
            inner: Arc::new(ServerInner {
                registry: ConnectionRegistry::new(Arc::clone(&header)),
                header,
                filter,
                settings,
                auto_reset_timer,
                event_sender,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn auto_reset_timer(&self) -> &FilterAutoResetTimer {
        &self.inner.auto_reset_timer
    }

    fn transport(&self) -> &dyn ProfileDriverInterface {
        self.inner.header.transport.as_ref()
    }

    fn send_event(&self, event: ServerEvent) {
        let _ = self.inner.event_sender.send(event);
    }

    /// Entry point for server-level indications
    ///
    /// Connect requests are handled on a blocking-capable background task;
    /// its handle is returned so callers may await the admission result.
    pub fn on_server_indication(
        &self,
        indication: Indication,
    ) -> Option<JoinHandle<L2capResult<Admission>>> {
        match indication {
            Indication::RemoteConnect(params) => Some(self.handle_remote_connect_async(params)),
            Indication::RemoteDisconnect { address } => {
                match self.registry().find_by_address(address) {
                    Some(record) => self.on_channel_indication(
                        &record,
                        ChannelKind::Control,
                        ChannelIndication::RemoteDisconnect {
                            reason: DisconnectReason::HciDisconnect,
                        },
                    ),
                    None => debug!("Disconnect indication for unknown device {}", address),
                }
                None
            }
            Indication::Unknown(code) => {
                debug!("Unhandled server indication {:#x}", code);
                None
            }
        }
    }

    /// Run [`Self::handle_incoming_connection`] as a single-shot background task
    pub fn handle_remote_connect_async(
        &self,
        params: IndicationParameters,
    ) -> JoinHandle<L2capResult<Admission>> {
        let server = self.clone();
        self.inner
            .header
            .runtime
            .spawn_blocking(move || server.handle_incoming_connection(&params))
    }

    /// Admit or deny an incoming connection and answer it
    ///
    /// Refusals are answered with a deny response and reported as
    /// [`Admission::Denied`]; an error is returned only if no answer could
    /// be submitted.
    pub fn handle_incoming_connection(
        &self,
        params: &IndicationParameters,
    ) -> L2capResult<Admission> {
        info!(
            "Incoming connection from {} on PSM {:#06x}",
            params.address, params.psm
        );

        match self.admit(params) {
            Ok((record, kind)) => self.submit_open(params, record, kind),
            Err(e) => match e.deny_reason() {
                Some(reason) => {
                    warn!("Dropping connection: {}", e);
                    self.deny_incoming_connection(params, reason)
                }
                None => Err(e),
            },
        }
    }

    /// Find or create the record for the remote and move the addressed
    /// channel to `Connecting`
    fn admit(
        &self,
        params: &IndicationParameters,
    ) -> L2capResult<(Arc<ConnectionRecord>, ChannelKind)> {
        let address = params.address;
        let settings = self.refresh_settings();

        let kind =
            ChannelKind::from_psm(params.psm).ok_or(L2capError::UnsupportedPsm(params.psm))?;

        let record = match self.registry().find_by_address(address) {
            Some(record) if record.is_destroying() => {
                return Err(L2capError::RecordDestroying(address))
            }
            Some(record) => {
                debug!("Reusing connection record {} of {}", record.id(), address);
                record
            }
            None => self.create_record(address, &settings)?,
        };

        record
            .channel(kind)
            .begin_open(params.connection_handle)
            .map_err(|state| L2capError::InvalidChannelState {
                address,
                kind,
                state,
            })?;

        Ok((record, kind))
    }

    fn create_record(
        &self,
        address: BthAddr,
        settings: &Settings,
    ) -> L2capResult<Arc<ConnectionRecord>> {
        let remote_name = self
            .transport()
            .resolve_remote_name(address)
            .map_err(|source| L2capError::NameResolution { address, source })?;
        info!("Device {} name: {}", address, remote_name);

        let device_type = identification::classify(&remote_name, settings);
        if device_type == DeviceType::Unknown {
            self.auto_disable_filter(settings);
            return Err(L2capError::Unidentified {
                address,
                name: remote_name,
            });
        }

        match self.registry().create(
            address,
            device_type,
            remote_name.clone(),
            Some(self.destroy_callback()),
        ) {
            Ok(record) => {
                self.send_event(ServerEvent::RecordCreated {
                    address,
                    device_type,
                    remote_name,
                });
                Ok(record)
            }
            // Lost a race against a concurrent indication for the same device
            Err(L2capError::AlreadyRegistered(_)) => {
                match self.registry().find_by_address(address) {
                    Some(record) if !record.is_destroying() => Ok(record),
                    _ => Err(L2capError::AlreadyRegistered(address)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Accept the channel by submitting the open response through its slot
    fn submit_open(
        &self,
        params: &IndicationParameters,
        record: Arc<ConnectionRecord>,
        kind: ChannelKind,
    ) -> L2capResult<Admission> {
        let channel = record.channel(kind);
        let server = self.clone();
        let completed = Arc::clone(&record);
        let result = channel.request_slot().submit(
            self.transport(),
            BrbType::OpenChannelResponse,
            |brb| *brb = Brb::OpenChannelResponse(open_channel_response(params, record.id())),
            move |status, _| server.on_open_completed(&completed, kind, status),
        );

        if let Err(e) = result {
            error!(
                "Submitting open response for {} channel of {} failed with {}",
                kind,
                record.address(),
                e
            );
            channel.apply(ChannelEvent::OpenAborted);
            self.registry().destroy(&record);
            return Err(match e {
                TransportError::Busy => L2capError::RequestInFlight(kind),
                other => L2capError::Transport(other),
            });
        }

        Ok(Admission::Accepted(record))
    }

    /// Refuse a connection request with a PSM-negative response
    pub fn deny_incoming_connection(
        &self,
        params: &IndicationParameters,
        reason: DenyReason,
    ) -> L2capResult<Admission> {
        let mut brb = self
            .transport()
            .allocate_brb(BrbType::OpenChannelResponse)
            .map_err(|e| {
                error!("Failed to allocate deny response: {}", e);
                L2capError::Transport(e)
            })?;

        if let Brb::OpenChannelResponse(response) = &mut brb {
            *response = OpenChannelResponse {
                address: params.address,
                psm: params.psm,
                channel_handle: params.connection_handle,
                response: CONNECT_RSP_RESULT_PSM_NEG,
                channel_flags: CF_ROLE_EITHER,
                ..Default::default()
            };
        }

        let transport = Arc::clone(&self.inner.header.transport);
        let submitted = self.transport().send_brb_async(
            brb,
            Box::new(move |status, brb| {
                debug!("Deny response for {} completed with {:?}", brb.address(), status);
                transport.free_brb(brb);
            }),
        );

        match submitted {
            Ok(()) => {
                info!("Connection from {} denied ({:?})", params.address, reason);
                self.send_event(ServerEvent::ConnectionDenied {
                    address: params.address,
                    reason,
                });
                Ok(Admission::Denied(reason))
            }
            Err(SubmitError { error, brb }) => {
                error!("Submitting deny response failed with {}", error);
                self.transport().free_brb(brb);
                Err(L2capError::Transport(error))
            }
        }
    }

    /// Instruct a channel of `record` to disconnect
    pub fn request_disconnect(&self, record: &Arc<ConnectionRecord>, kind: ChannelKind) -> bool {
        record.request_disconnect(kind)
    }

    /// Per-channel indication registered through the open response
    pub fn on_channel_indication(
        &self,
        record: &Arc<ConnectionRecord>,
        kind: ChannelKind,
        indication: ChannelIndication,
    ) {
        match indication {
            ChannelIndication::RemoteDisconnect { reason } => {
                info!(
                    "Remote disconnect on {} channel of {} ({:?})",
                    kind,
                    record.address(),
                    reason
                );
                record.request_disconnect(ChannelKind::Interrupt);
                record.request_disconnect(ChannelKind::Control);
                self.registry().destroy(record);
            }
            ChannelIndication::QosChanged => {
                debug!("QoS changed on {} channel of {}", kind, record.address());
            }
        }
    }

    /// Destroy every record and wait for their teardown
    pub async fn shutdown(&self) {
        info!("Shutting down, {} device(s) connected", self.registry().len());
        self.inner.auto_reset_timer.cancel();
        for record in self.registry().records() {
            self.registry().destroy(&record);
        }
        self.registry().wait_for_teardowns().await;
    }

    fn refresh_settings(&self) -> Settings {
        let mut service = self
            .inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = service.reload() {
            warn!("Refreshing settings failed: {}", e);
        }
        service.get().clone()
    }

    fn auto_disable_filter(&self, settings: &Settings) {
        if !settings.auto_disable_filter {
            return;
        }

        if let Err(e) = self.inner.filter.set_patch_enabled(false) {
            error!("Disabling filter failed with {}", e);
            return;
        }
        info!("Filter disabled");
        self.send_event(ServerEvent::FilterDisabled);

        if settings.auto_enable_filter {
            info!(
                "Filter disabled, re-enabling in {} seconds",
                settings.auto_enable_filter_delay
            );
            self.inner
                .auto_reset_timer
                .start(Duration::from_secs(u64::from(settings.auto_enable_filter_delay)));
        }
    }

    fn destroy_callback(&self) -> DestroyCallback {
        let sender = self.inner.event_sender.clone();
        Box::new(move |record| {
            let _ = sender.send(ServerEvent::RecordDestroyed {
                address: record.address(),
            });
        })
    }

    fn on_open_completed(&self, record: &Arc<ConnectionRecord>, kind: ChannelKind, status: BrbStatus) {
        let address = record.address();
        if let Err(e) = &status {
            error!("{} channel of {} connection failed with {}", kind, address, e);
        }

        let channel = record.channel(kind);
        let transition = match kind {
            ChannelKind::Control => channel.apply(ChannelEvent::OpenCompleted(outcome(&status))),
            // Control channel is expected to be established by now
            ChannelKind::Interrupt => channel.apply_with(|| {
                let outcome = match outcome(&status) {
                    OpenOutcome::Opened => match record.control().state() {
                        ConnectionState::Connected => OpenOutcome::Opened,
                        control_state => {
                            error!(
                                "HID Control channel of {} in invalid state {:?}, dropping connection",
                                address, control_state
                            );
                            OpenOutcome::Refused
                        }
                    },
                    other => other,
                };
                ChannelEvent::OpenCompleted(outcome)
            }),
        };

        match transition.effect {
            Effect::ActivateQueues => {
                info!("{} channel of {} connection established", kind, address);
                self.send_event(ServerEvent::ChannelConnected { address, kind });
                self.activate_queues(record, kind);
                if kind == ChannelKind::Interrupt {
                    self.send_event(ServerEvent::DeviceReady {
                        address,
                        device_type: record.device_type(),
                    });
                }
            }
            Effect::SubmitClose => {
                debug!("{} channel of {} opened after disconnect request", kind, address);
                record.submit_close(kind);
            }
            Effect::CloseAndTeardown => {
                record.submit_close(kind);
                self.registry().destroy(record);
            }
            Effect::Teardown => {
                self.registry().destroy(record);
            }
            _ => {}
        }
    }

    /// Channel connected, queues ready to start processing
    fn activate_queues(&self, record: &Arc<ConnectionRecord>, kind: ChannelKind) {
        for queue in HidQueue::for_channel(kind) {
            // Connection stays up; the queue simply won't dispatch
            if let Err(e) = self.transport().queue_ready_notify(queue, record) {
                error!(
                    "Queue ready notification ({:?}) for {} failed with {}",
                    queue,
                    record.address(),
                    e
                );
            }
        }
    }
}

fn outcome(status: &BrbStatus) -> OpenOutcome {
    match status {
        Ok(()) => OpenOutcome::Opened,
        Err(_) => OpenOutcome::Failed,
    }
}

/// Accepting response for an HID channel
fn open_channel_response(params: &IndicationParameters, client_context: u64) -> OpenChannelResponse {
    let config = protocol::hid_channel_config();
    OpenChannelResponse {
        address: params.address,
        psm: params.psm,
        channel_handle: params.connection_handle,
        response: CONNECT_RSP_RESULT_SUCCESS,
        channel_flags: CF_ROLE_EITHER,
        config_out: config,
        config_in: config,
        incoming_queue_depth: INCOMING_QUEUE_DEPTH,
        callback_flags: CallbackFlags::DISCONNECT | CallbackFlags::CONFIG_QOS,
        client_context,
    }
}
