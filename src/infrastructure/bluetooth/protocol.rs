//! L2CAP protocol definitions
//!
//! PSMs, configuration limits and the request blocks (BRBs) exchanged with
//! the profile driver.

use crate::domain::models::{BthAddr, ChannelHandle};

pub use crate::domain::models::{PSM_DS3_HID_CONTROL, PSM_DS3_HID_INTERRUPT};

pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_MAX_MTU: u16 = 0xFFFF;
pub const L2CAP_MIN_FLUSHTO: u16 = 1;
pub const L2CAP_DEFAULT_FLUSHTO: u16 = 0xFFFF;

/// Max count of MTUs kept buffered before incoming data is discarded
pub const INCOMING_QUEUE_DEPTH: u32 = 10;

pub const CONNECT_RSP_RESULT_SUCCESS: u16 = 0x0000;
pub const CONNECT_RSP_RESULT_PSM_NEG: u16 = 0x0002;

pub const CF_ROLE_EITHER: u32 = 0x0000;

pub const CFG_MTU: u32 = 0x0001;

/// Indications requested from the profile driver for an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallbackFlags(u32);

impl CallbackFlags {
    pub const NONE: Self = Self(0);
    pub const DISCONNECT: Self = Self(0x0001);
    pub const CONFIG_QOS: Self = Self(0x0004);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for CallbackFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range {
    pub min: u16,
    pub max: u16,
    pub preferred: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelConfig {
    pub flags: u32,
    pub mtu: Range,
    pub flush_to: Range,
    pub link_to: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrbType {
    OpenChannelResponse,
    CloseChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpenChannelResponse {
    pub address: BthAddr,
    pub psm: u16,
    pub channel_handle: ChannelHandle,
    pub response: u16,
    pub channel_flags: u32,
    pub config_out: ChannelConfig,
    pub config_in: ChannelConfig,
    pub incoming_queue_depth: u32,
    pub callback_flags: CallbackFlags,
    /// Opaque caller context, the generation id of the owning record
    pub client_context: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseChannel {
    pub address: BthAddr,
    pub channel_handle: ChannelHandle,
    pub client_context: u64,
}

/// Bluetooth request block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Brb {
    OpenChannelResponse(OpenChannelResponse),
    CloseChannel(CloseChannel),
}

impl Brb {
    /// A zeroed block of the given type
    pub fn new(kind: BrbType) -> Self {
        match kind {
            BrbType::OpenChannelResponse => Self::OpenChannelResponse(Default::default()),
            BrbType::CloseChannel => Self::CloseChannel(Default::default()),
        }
    }

    pub fn kind(&self) -> BrbType {
        match self {
            Self::OpenChannelResponse(_) => BrbType::OpenChannelResponse,
            Self::CloseChannel(_) => BrbType::CloseChannel,
        }
    }

    pub fn address(&self) -> BthAddr {
        match self {
            Self::OpenChannelResponse(brb) => brb.address,
            Self::CloseChannel(brb) => brb.address,
        }
    }

    pub fn channel_handle(&self) -> ChannelHandle {
        match self {
            Self::OpenChannelResponse(brb) => brb.channel_handle,
            Self::CloseChannel(brb) => brb.channel_handle,
        }
    }

    pub fn as_open_response(&self) -> Option<&OpenChannelResponse> {
        match self {
            Self::OpenChannelResponse(brb) => Some(brb),
            _ => None,
        }
    }
}

/// Outbound/inbound configuration for accepted HID channels
///
/// The MTU is pinned to the maximum in both directions.
pub fn hid_channel_config() -> ChannelConfig {
    ChannelConfig {
        flags: CFG_MTU,
        mtu: Range {
            min: L2CAP_MAX_MTU,
            max: L2CAP_MAX_MTU,
            preferred: L2CAP_MAX_MTU,
        },
        flush_to: Range {
            min: L2CAP_MIN_FLUSHTO,
            max: L2CAP_DEFAULT_FLUSHTO,
            preferred: L2CAP_DEFAULT_FLUSHTO,
        },
        link_to: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_flags() {
        let flags = CallbackFlags::DISCONNECT | CallbackFlags::CONFIG_QOS;
        assert!(flags.contains(CallbackFlags::DISCONNECT));
        assert!(flags.contains(CallbackFlags::CONFIG_QOS));
        assert!(!CallbackFlags::NONE.contains(CallbackFlags::DISCONNECT));
        assert_eq!(flags.bits(), 0x0005);
    }

    #[test]
    fn test_new_brb_is_zeroed() {
        let brb = Brb::new(BrbType::CloseChannel);
        assert_eq!(brb.kind(), BrbType::CloseChannel);
        assert_eq!(brb.address(), BthAddr(0));
        assert!(brb.as_open_response().is_none());
    }

    #[test]
    fn test_hid_config_pins_mtu() {
        let config = hid_channel_config();
        assert_eq!(config.mtu.min, L2CAP_MAX_MTU);
        assert_eq!(config.mtu.max, L2CAP_MAX_MTU);
        assert_eq!(config.flush_to.preferred, L2CAP_DEFAULT_FLUSHTO);
    }
}
