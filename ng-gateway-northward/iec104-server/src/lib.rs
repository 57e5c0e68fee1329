pub mod codec;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod interrogation;
pub mod plugin;
pub mod protocol;
pub mod reading;
pub mod registry;
pub mod tracker;
pub mod transport;
pub mod types;

pub use config::Iec104ServerConfig;
pub use dispatch::{ControlDestination, SouthForwarder};
pub use error::{Iec104ServerError, Iec104ServerResult};
pub use plugin::Iec104ServerPlugin;
pub use reading::{Reading, ReadingField, ReadingValue};
pub use transport::{ConnectionEvent, ConnectionId, MasterConnection, SlaveTransport};
