//! Commands forwarded to the south side and awaiting its acknowledgement.

use crate::{
    protocol::frame::asdu::{Asdu, CommonAddr, InfoObjAddr, TypeID},
    transport::{ConnectionId, MasterConnection},
};
use chrono::Utc;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    WaitActCon,
    WaitActTerm,
}

/// One in-flight command. Owns the snapshot of the request used for the replies.
pub struct OutstandingCommand {
    handle: CommandHandle,
    asdu: Asdu,
    ioa: InfoObjAddr,
    connection: Arc<dyn MasterConnection>,
    is_select: bool,
    state: CommandState,
    deadline_ms: i64,
}

impl OutstandingCommand {
    #[inline]
    fn matches(&self, type_id: TypeID, ca: CommonAddr, ioa: InfoObjAddr) -> bool {
        self.asdu.type_id() == type_id && self.asdu.common_addr() == ca && self.ioa == ioa
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn is_select(&self) -> bool {
        self.is_select
    }
}

impl fmt::Debug for OutstandingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutstandingCommand")
            .field("handle", &self.handle)
            .field("type_id", &self.asdu.type_id())
            .field("ca", &self.asdu.common_addr())
            .field("ioa", &self.ioa)
            .field("connection", &self.connection.id())
            .field("is_select", &self.is_select)
            .field("state", &self.state)
            .field("deadline_ms", &self.deadline_ms)
            .finish()
    }
}

/// Reply to send once the tracker lock is released.
enum Reply {
    ActCon(bool),
    ActTerm(bool),
}

/// Tracks commands from activation to termination.
///
/// Entries are keyed by (type id, CA, IOA) only, so concurrent commands to one
/// point resolve in registration order.
pub struct CommandTracker {
    exec_timeout_ms: i64,
    next_handle: AtomicU64,
    entries: Mutex<Vec<OutstandingCommand>>,
}

impl CommandTracker {
    pub fn new(exec_timeout_secs: u64) -> Self {
        Self {
            exec_timeout_ms: (exec_timeout_secs as i64).saturating_mul(1000),
            next_handle: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Vec<OutstandingCommand>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts tracking `asdu`, the confirmation to send back, for `connection`.
    pub fn register(
        &self,
        asdu: &Asdu,
        ioa: InfoObjAddr,
        connection: Arc<dyn MasterConnection>,
        is_select: bool,
    ) -> CommandHandle {
        self.register_at(asdu, ioa, connection, is_select, Utc::now().timestamp_millis())
    }

    pub fn register_at(
        &self,
        asdu: &Asdu,
        ioa: InfoObjAddr,
        connection: Arc<dyn MasterConnection>,
        is_select: bool,
        now_ms: i64,
    ) -> CommandHandle {
        let handle = CommandHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            type_id = %asdu.type_id(),
            ca = asdu.common_addr(),
            ioa,
            connection = connection.id(),
            is_select,
            "Tracking command"
        );
        self.lock().push(OutstandingCommand {
            handle,
            asdu: asdu.clone(),
            ioa,
            connection,
            is_select,
            state: CommandState::WaitActCon,
            deadline_ms: now_ms.saturating_add(self.exec_timeout_ms),
        });
        handle
    }

    /// Forgets a command without replying.
    pub fn remove(&self, handle: CommandHandle) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|c| c.handle != handle);
        entries.len() != before
    }

    /// Handles the south side confirmation of a command. Returns false when no
    /// command waits for it.
    pub fn resolve_act_con(
        &self,
        type_id: TypeID,
        ca: CommonAddr,
        ioa: InfoObjAddr,
        negative: bool,
    ) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        let resolved = {
            let mut entries = self.lock();
            let Some(idx) = entries
                .iter()
                .position(|c| c.state == CommandState::WaitActCon && c.matches(type_id, ca, ioa))
            else {
                drop(entries);
                warn!(%type_id, ca, ioa, "ACT-CON for unknown command");
                return false;
            };
            if negative || entries[idx].is_select {
                let cmd = entries.remove(idx);
                (cmd.asdu, cmd.connection)
            } else {
                let cmd = &mut entries[idx];
                cmd.state = CommandState::WaitActTerm;
                cmd.deadline_ms = now_ms.saturating_add(self.exec_timeout_ms);
                (cmd.asdu.clone(), Arc::clone(&cmd.connection))
            }
        };
        Self::reply(&resolved.0, resolved.1.as_ref(), Reply::ActCon(negative));
        true
    }

    /// Handles the south side termination of a command and forgets it.
    pub fn resolve_act_term(
        &self,
        type_id: TypeID,
        ca: CommonAddr,
        ioa: InfoObjAddr,
        negative: bool,
    ) -> bool {
        let resolved = {
            let mut entries = self.lock();
            match entries.iter().position(|c| c.matches(type_id, ca, ioa)) {
                Some(idx) => entries.remove(idx),
                None => {
                    drop(entries);
                    warn!(%type_id, ca, ioa, "ACT-TERM for unknown command");
                    return false;
                }
            }
        };
        Self::reply(&resolved.asdu, resolved.connection.as_ref(), Reply::ActTerm(negative));
        true
    }

    /// Drops every command whose deadline is before `now_ms`. No reply is sent.
    pub fn sweep_timeouts(&self, now_ms: i64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|c| {
            let alive = c.deadline_ms >= now_ms;
            if !alive {
                warn!(
                    type_id = %c.asdu.type_id(),
                    ca = c.asdu.common_addr(),
                    ioa = c.ioa,
                    state = ?c.state,
                    connection = c.connection.id(),
                    "Command execution timed out"
                );
            }
            alive
        });
        before - entries.len()
    }

    pub fn remove_all_for_connection(&self, connection: ConnectionId) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|c| c.connection.id() != connection);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(connection, removed, "Dropped commands of connection");
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    fn reply(asdu: &Asdu, connection: &dyn MasterConnection, reply: Reply) {
        let res = match reply {
            Reply::ActCon(negative) => connection.send_act_con(asdu, negative),
            Reply::ActTerm(negative) => {
                let mut asdu = asdu.clone();
                asdu.set_negative(negative);
                connection.send_act_term(&asdu)
            }
        };
        if let Err(e) = res {
            error!(
                type_id = %asdu.type_id(),
                ca = asdu.common_addr(),
                connection = connection.id(),
                "Failed to answer command: {e}"
            );
        }
    }
}
