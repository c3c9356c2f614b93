//! BthPS3 L2CAP server core
//!
//! Decides whether incoming HID connections from PS3 peripherals are
//! admitted and drives their Control and Interrupt channels from open to
//! teardown.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{L2capError, L2capResult, TransportError};
pub use domain::models::{BthAddr, ChannelKind, DeviceType, ServerEvent};
pub use domain::settings::{Settings, SettingsService};
pub use infrastructure::bluetooth::{Admission, L2capServer};
