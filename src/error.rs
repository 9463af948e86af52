use thiserror::Error;

use crate::type_alias::*;

/// Startup and control-plane errors surfaced to the caller.
///
/// Invariant violations (wrong-thread use, impossible state transitions) are
/// programming errors and panic instead of appearing here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("a Nexus instance already exists in this process")]
    NexusAlreadyExists,

    #[error("invalid Rpc id {0}")]
    InvalidRpcId(RpcId),

    #[error("Rpc id {0} is already registered with the Nexus")]
    RpcIdInUse(RpcId),

    #[error("invalid physical port {port} (limit {limit})")]
    InvalidPhyPort { port: u8, limit: u8 },

    #[error("invalid NUMA node {node} (limit {limit})")]
    InvalidNumaNode { node: usize, limit: usize },

    #[error("this transport requires a privileged caller")]
    InsufficientPrivilege,

    #[error("requested {requested} background threads (limit {limit})")]
    TooManyBgThreads { requested: usize, limit: usize },

    #[error("a background request handler or continuation needs at least one background thread")]
    BgThreadsRequired,

    #[error("hostname {0:?} does not fit in a session endpoint")]
    HostnameTooLong(String),

    #[error("malformed session management packet")]
    MalformedSmPkt,

    #[error("no session with number {0}")]
    InvalidSessNum(SessNum),

    #[error("session {0} is in the wrong state for this operation")]
    InvalidSessState(SessNum),

    #[error("session {0} has outstanding requests")]
    SessionBusy(SessNum),

    #[error("session limit reached")]
    TooManySessions,

    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
