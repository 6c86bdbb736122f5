//! The closed error taxonomy every fallible operation in the core returns.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every kind of failure the dispatch core and its collaborators can report.
///
/// Closed by design: new failure modes are modeled by mapping onto one of
/// these, not by growing the set. The loop only special-cases
/// [`Error::PeerRemoved`] (continue) and [`Error::Term`] (exit); every other
/// variant is logged and treated as recoverable unless otherwise noted at
/// the call site.
#[derive(Debug, Error)]
pub enum Error {
    #[error("memory allocation failed")]
    Memory,

    #[error("failed to duplicate file descriptor")]
    Dup,

    #[error("invalid parameter")]
    Param,

    #[error("value out of range")]
    Range,

    #[error("no pts/dts available")]
    NoPtsDts,

    #[error("create failed")]
    Create,

    #[error("start failed")]
    Start,

    #[error("failed to read monotonic time")]
    GetTime,

    #[error("not ready")]
    NotReady,

    #[error("file descriptor error")]
    Fd,

    #[error("decode failed")]
    Decode,

    #[error("peer removed")]
    PeerRemoved,

    #[error("log error")]
    Log,

    #[error("terminating")]
    Term,

    #[error("not supported")]
    NotSupported,

    #[error("stop failed")]
    Stop,

    #[error("capture driver error")]
    Capture,

    #[error("mutex poisoned")]
    Mutex,

    #[error("pipe error")]
    Pipe,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
