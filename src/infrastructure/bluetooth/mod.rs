//! Bluetooth Module
//!
//! L2CAP connection admission and channel lifecycle for PS3 peripherals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      L2capServer                         │
//! │   (admission, open/close completions, indications)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌────────────┐ ┌─────────────┐ ┌────────────┐
//! │  Registry  │ │ Connection  │ │   Filter   │
//! │            │ │   Record    │ │  auto-reset│
//! │ - by addr  │ │ - Control   │ │   timer    │
//! │ - teardown │ │ - Interrupt │ │            │
//! └────────────┘ └──────┬──────┘ └────────────┘
//!                       │
//!                       ▼
//!            ┌─────────────────────┐
//!            │ Channel + Request   │
//!            │ slot ─▶ Transport   │
//!            └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - PSMs, response codes and request block layouts
//! - [`transport`] - Traits for the profile driver and the PSM filter
//! - [`request`] - Single in-flight request slot per channel
//! - [`channel`] - Channel state machine
//! - [`connection`] - Per-device record pairing both channels
//! - [`registry`] - Records keyed by address, deferred teardown
//! - [`filter`] - Filter re-enable timer
//! - [`service`] - Admission controller
//! - [`loopback`] - In-memory transport for dry runs and tests

pub mod channel;
pub mod connection;
pub mod filter;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod service;
pub mod transport;

pub use service::{Admission, L2capServer};
