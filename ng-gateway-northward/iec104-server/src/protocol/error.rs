use super::frame::asdu::{CauseOfTransmission, InfoObjAddr, TypeID};
use anyhow::anyhow;
use std::result::Result as StdResult;
use thiserror::Error;

pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("asdu: [type identifier: {0:?}] doesn't match call or time tag")]
    ErrTypeIDNotMatch(TypeID),
    #[error("asdu: [cause of transmission: {0:?}] for command not standard requirement")]
    ErrCmdCause(CauseOfTransmission),
    #[error("asdu: information object address {addr} does not fit into {size} byte(s)")]
    ErrInfoObjAddrRange { addr: InfoObjAddr, size: usize },
    #[error("asdu: common address {0} does not fit into the configured size")]
    ErrCommonAddrRange(u16),
    #[error("asdu: information object of {0} byte(s) exceeds the asdu size limit")]
    ErrAsduFull(usize),
    #[error("asdu: information object is truncated")]
    ErrTruncated,
    #[error("cp56time2a: invalid calendar value")]
    ErrInvalidTime,
    #[error("anyhow error: {0}")]
    ErrAnyHow(#[from] anyhow::Error),
}

impl From<()> for Error {
    fn from(_: ()) -> Self {
        Error::ErrAnyHow(anyhow!("conversion error"))
    }
}
