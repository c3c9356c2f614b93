use thiserror::Error;

use crate::domain::models::{BthAddr, ChannelKind, ConnectionState, DenyReason};

/// Failures reported by the profile driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device is not connected")]
    DeviceNotConnected,

    #[error("insufficient resources")]
    InsufficientResources,

    #[error("request rejected by remote (result {0:#06x})")]
    Rejected(u16),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid device state")]
    InvalidDeviceState,

    #[error("request slot is busy")]
    Busy,

    #[error("{0}")]
    Other(String),
}

/// Completion status handed to request callbacks
pub type BrbStatus = Result<(), TransportError>;

/// Errors of the connection admission core
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("remote name of {address} could not be resolved: {source}")]
    NameResolution {
        address: BthAddr,
        #[source]
        source: TransportError,
    },

    #[error("remote name {name:?} of {address} matches no supported device")]
    Unidentified { address: BthAddr, name: String },

    #[error("unsupported PSM {0:#06x}")]
    UnsupportedPsm(u16),

    #[error("{0} channel already has a request in flight")]
    RequestInFlight(ChannelKind),

    #[error("{kind} channel of {address} is {state:?}, cannot open")]
    InvalidChannelState {
        address: BthAddr,
        kind: ChannelKind,
        state: ConnectionState,
    },

    #[error("connection record for {0} already registered")]
    AlreadyRegistered(BthAddr),

    #[error("connection record for {0} is being destroyed")]
    RecordDestroying(BthAddr),

    #[error("transport request failed: {0}")]
    Transport(#[from] TransportError),
}

impl L2capError {
    /// Reason to answer the remote with, if this error refuses a connection
    /// rather than failing it
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::NameResolution { .. } => Some(DenyReason::NameUnresolved),
            Self::Unidentified { .. } => Some(DenyReason::NotIdentified),
            Self::UnsupportedPsm(_) => Some(DenyReason::UnsupportedPsm),
            Self::InvalidChannelState { .. }
            | Self::AlreadyRegistered(_)
            | Self::RecordDestroying(_) => Some(DenyReason::ChannelBusy),
            Self::RequestInFlight(_) | Self::Transport(_) => None,
        }
    }
}

pub type L2capResult<T> = Result<T, L2capError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_reasons() {
        let err = L2capError::NameResolution {
            address: BthAddr(1),
            source: TransportError::DeviceNotConnected,
        };
        assert_eq!(err.deny_reason(), Some(DenyReason::NameUnresolved));
        assert_eq!(
            L2capError::RecordDestroying(BthAddr(1)).deny_reason(),
            Some(DenyReason::ChannelBusy)
        );
        assert_eq!(
            L2capError::from(TransportError::InsufficientResources).deny_reason(),
            None
        );
    }

    #[test]
    fn test_messages_render_address() {
        let err = L2capError::Unidentified {
            address: BthAddr(0xAABB),
            name: "Headset".into(),
        };
        assert_eq!(
            err.to_string(),
            "remote name \"Headset\" of 00000000AABB matches no supported device"
        );
    }
}
