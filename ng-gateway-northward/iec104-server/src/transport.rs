//! Seam towards the IEC 60870-5-104 link layer.
//!
//! APCI framing, sequence numbers, the k/w window, t0..t3 and TLS are owned by the
//! hosting transport. The plugin only sees ASDUs and connection lifecycle events.

use crate::{error::Iec104ServerResult, protocol::frame::asdu::{Asdu, Cause}};
use std::fmt;

pub type ConnectionId = u64;

/// One accepted client (master) connection.
pub trait MasterConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Remote address, for diagnostics only
    fn peer(&self) -> String;

    fn send_asdu(&self, asdu: Asdu) -> Iec104ServerResult<()>;

    /// Sends `asdu` back as an activation confirmation.
    fn send_act_con(&self, asdu: &Asdu, negative: bool) -> Iec104ServerResult<()> {
        let mut resp = asdu.mirror(Cause::ActivationCon);
        resp.set_negative(negative);
        self.send_asdu(resp)
    }

    /// Sends `asdu` back as an activation termination, keeping its P/N bit.
    fn send_act_term(&self, asdu: &Asdu) -> Iec104ServerResult<()> {
        self.send_asdu(asdu.mirror(Cause::ActivationTerm))
    }
}

/// The listening side of the link.
pub trait SlaveTransport: Send + Sync {
    fn start(&self) -> Iec104ServerResult<()>;

    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Queues `asdu` for every active connection.
    fn enqueue_asdu(&self, asdu: Asdu) -> Iec104ServerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    /// STARTDT received
    Activated,
    /// STOPDT received
    Deactivated,
}

impl ConnectionEvent {
    /// Whether outstanding commands of the connection can no longer be answered.
    #[inline]
    pub fn ends_data_transfer(&self) -> bool {
        matches!(self, ConnectionEvent::Closed | ConnectionEvent::Deactivated)
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionEvent::Opened => "opened",
            ConnectionEvent::Closed => "closed",
            ConnectionEvent::Activated => "activated",
            ConnectionEvent::Deactivated => "deactivated",
        };
        f.write_str(s)
    }
}
