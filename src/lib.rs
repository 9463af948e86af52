//! Concurrency and session-management core of a user-space RPC runtime for
//! microsecond-scale datacenter communication.
//!
//! Peers open logical sessions over a lossless fabric and exchange typed
//! request/response messages in pre-registered, huge-page-backed buffers;
//! out-of-band UDP carries only session establishment and teardown. The
//! [`Nexus`] is the per-process singleton owning background workers and the
//! session-management demultiplexer; each [`Rpc`] is a single-threaded
//! endpoint owning its sessions, window slots, and buffer allocator.

mod error;
mod handler;
mod msgbuf;
mod nexus;
mod pkthdr;
mod rpc;
mod session;
mod smpkt;
pub mod transport;
pub mod type_alias;
mod util;

pub use self::error::{Error, Result};
pub use self::handler::{
    ContFunc, ReqFunc, ReqFuncKind, ReqFuncTable, ReqHandle, RespHandle, SmEventType, SmHandler,
};
pub use self::msgbuf::MsgBuf;
pub use self::nexus::Nexus;
pub use self::rpc::Rpc;
pub use self::smpkt::{
    SessionEndpoint, SessionMgmtPkt, SmErrType, SmPktType, ENDPOINT_WIRE_LEN, MAX_HOSTNAME_LEN,
    SM_PKT_WIRE_LEN, TRANSPORT_BLOB_LEN,
};

#[cfg(test)]
mod tests;
