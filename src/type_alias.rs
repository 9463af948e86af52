//! Type aliases and protocol-wide constants.

/// [`u8`]: Rpc endpoint identifier, unique within a Nexus.
/// Note that this identifies `Rpc` instances (control-plane), not RPC requests (data-plane).
pub type RpcId = u8;

/// [`u16`]: Session number, an index into the owning `Rpc`'s session vector.
pub type SessNum = u16;

/// [`u8`]: Request type identifier.
pub type ReqType = u8;

/// [`u64`] (23 bits on the wire): request index within a session slot.
pub(crate) type ReqIdx = u64;

/// [`usize`]: dense small-integer thread id assigned by the thread-local registry.
pub type TinyTid = usize;

/// Reserved invalid [`RpcId`].
pub const INVALID_RPC_ID: RpcId = 0xff;

/// Session number placeholder used before the peer has assigned one.
pub const INVALID_SESS_NUM: SessNum = SessNum::MAX;

/// Maximum physical ports per NIC.
pub const MAX_PHY_PORTS: u8 = 16;

/// Maximum NUMA nodes per machine.
pub const MAX_NUMA_NODES: usize = 8;
