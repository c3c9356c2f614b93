use serde::{Deserialize, Serialize};
use std::fmt;

/// HID Control PSM as remapped by the PSM filter
pub const PSM_DS3_HID_CONTROL: u16 = 0x5053;

/// HID Interrupt PSM as remapped by the PSM filter
pub const PSM_DS3_HID_INTERRUPT: u16 = 0x5055;

/// Bluetooth device address (48 significant bits)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BthAddr(pub u64);

impl fmt::Display for BthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

/// Opaque transport identifier of one L2CAP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelHandle(pub u64);

/// Device family, derived from the advertised remote name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Unknown,
    Sixaxis,
    Navigation,
    Motion,
    Wireless,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::Sixaxis => "SIXAXIS",
            Self::Navigation => "NAVIGATION",
            Self::Motion => "MOTION",
            Self::Wireless => "WIRELESS",
        };
        f.write_str(name)
    }
}

/// The two logical channels every HID device opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Control,
    Interrupt,
}

impl ChannelKind {
    pub fn psm(self) -> u16 {
        match self {
            Self::Control => PSM_DS3_HID_CONTROL,
            Self::Interrupt => PSM_DS3_HID_INTERRUPT,
        }
    }

    pub fn from_psm(psm: u16) -> Option<Self> {
        match psm {
            PSM_DS3_HID_CONTROL => Some(Self::Control),
            PSM_DS3_HID_INTERRUPT => Some(Self::Interrupt),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("HID Control"),
            Self::Interrupt => f.write_str("HID Interrupt"),
        }
    }
}

/// Lifecycle state of one channel; states only ever move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Traffic queues activated once a channel is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HidQueue {
    ControlRead,
    ControlWrite,
    InterruptRead,
    InterruptWrite,
}

impl HidQueue {
    /// Read and write queue of a channel, in registration order
    pub fn for_channel(kind: ChannelKind) -> [HidQueue; 2] {
        match kind {
            ChannelKind::Control => [Self::ControlRead, Self::ControlWrite],
            ChannelKind::Interrupt => [Self::InterruptRead, Self::InterruptWrite],
        }
    }
}

/// Parameters of an incoming connect indication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicationParameters {
    pub address: BthAddr,
    pub connection_handle: ChannelHandle,
    pub psm: u16,
}

/// Server-level indications delivered by the profile driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Indication {
    RemoteConnect(IndicationParameters),
    RemoteDisconnect { address: BthAddr },
    Unknown(u32),
}

/// Per-channel indications requested via the open response callback flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelIndication {
    RemoteDisconnect { reason: DisconnectReason },
    QosChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    HciDisconnect,
    L2capDisconnect,
    LinkLoss,
    Unknown,
}

/// Why an incoming connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    NameUnresolved,
    NotIdentified,
    UnsupportedPsm,
    ChannelBusy,
}

/// Events published to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ConnectionDenied {
        address: BthAddr,
        reason: DenyReason,
    },
    RecordCreated {
        address: BthAddr,
        device_type: DeviceType,
        remote_name: String,
    },
    ChannelConnected {
        address: BthAddr,
        kind: ChannelKind,
    },
    DeviceReady {
        address: BthAddr,
        device_type: DeviceType,
    },
    RecordDestroyed {
        address: BthAddr,
    },
    FilterDisabled,
    FilterReEnabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(BthAddr(0x0019_C1AB_CDEF).to_string(), "0019C1ABCDEF");
    }

    #[test]
    fn test_psm_mapping() {
        assert_eq!(ChannelKind::from_psm(0x5053), Some(ChannelKind::Control));
        assert_eq!(ChannelKind::from_psm(0x5055), Some(ChannelKind::Interrupt));
        assert_eq!(ChannelKind::from_psm(0x11), None);
        assert_eq!(ChannelKind::Interrupt.psm(), 0x5055);
    }
}
