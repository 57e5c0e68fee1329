//! IEC 60870-5-101 application layer as carried by IEC 60870-5-104.
//!
//! Only the application service data unit is modelled here. APCI framing,
//! sequence numbers and the TCP session belong to the transport that hosts
//! the plugin.

pub mod error;
pub mod frame;

pub use error::{Error, Result};
