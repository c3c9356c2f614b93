//! Domain types: addresses, device identification, settings and errors.

pub mod error;
pub mod identification;
pub mod models;
pub mod settings;
