use std::mem;

use crate::error::Error;
use crate::msgbuf::MsgBuf;
use crate::pkthdr::PacketHeader;
use crate::smpkt::TRANSPORT_BLOB_LEN;

/// Opaque registered-memory handle, as returned by [`Transport::reg_mem`].
pub type MemoryHandle = u32;

/// An item to transmit.
pub struct TxItem<Tp: Transport> {
    /// Peer for this packet.
    pub peer: *const Tp::Peer,

    /// Message buffer; its packet header must be filled.
    pub msgbuf: *const MsgBuf,
}

/// Capability abstraction over the lossless-fabric datapath.
///
/// The core consumes this interface and never names a concrete transport.
/// Methods are not fault-tolerant: datapath errors are expected to panic,
/// while creation and peer resolution report [`Error`]s.
pub trait Transport: Sized + 'static {
    /// Peer addressing type, used for sending data.
    /// Can contain data dependent on local resources.
    type Peer: Sized;

    /// Whether creating this transport needs a privileged caller.
    /// `Rpc` construction fails early for unprivileged callers when set.
    const REQUIRES_PRIVILEGED_CALLER: bool;

    /// Receive ring size, in packets. The `Rpc` pre-allocates this many
    /// registered MTU-sized buffers and hands them over through
    /// [`Transport::init_hugepage_structures`].
    const RX_RING_SIZE: usize;

    /// Create a new instance bound to a physical port on a NUMA node.
    ///
    /// The instance must be able to register memory immediately; everything
    /// that needs registered buffers itself is deferred to
    /// [`Transport::init_hugepage_structures`].
    fn new(phy_port: u8, numa_node: usize) -> Result<Self, Error>;

    /// Return the MTU of the transport.
    fn mtu() -> usize;

    /// Return the maximum amount of application data in a packet.
    #[inline(always)]
    fn max_data_per_pkt() -> usize {
        Self::mtu() - mem::size_of::<PacketHeader>()
    }

    /// Complete initialization with huge-page-backed receive buffers.
    fn init_hugepage_structures(&mut self, rx_ring: Vec<MsgBuf>) -> Result<(), Error>;

    /// Export the addressing blob carried in session endpoints.
    fn endpoint_blob(&self) -> [u8; TRANSPORT_BLOB_LEN];

    /// Resolve a peer from an addressing blob received from a remote endpoint.
    fn make_peer(&mut self, blob: &[u8; TRANSPORT_BLOB_LEN]) -> Result<Self::Peer, Error>;

    /// Register memory so that it is accessible by the transport.
    ///
    /// # Safety
    ///
    /// The memory region `[buf, buf + len)` must be valid for access.
    unsafe fn reg_mem(&mut self, buf: *mut u8, len: usize) -> MemoryHandle;

    /// Deregister a memory region registered with [`Transport::reg_mem`].
    fn dereg_mem(&mut self, handle: MemoryHandle);

    /// Transmit a batch of packets.
    ///
    /// # Safety
    ///
    /// Every item must point to a valid peer and a valid `MsgBuf` whose
    /// packet header is filled.
    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]);

    /// Poll for received packets. Return the number available via
    /// [`Transport::rx_next`].
    fn rx_burst(&mut self) -> usize;

    /// Return the next received packet as a borrowed `MsgBuf` whose packet
    /// header sits right before the data. The backing ring entry is recycled
    /// by later `rx_burst` calls, after the consumer has released the packet.
    fn rx_next(&mut self) -> Option<MsgBuf>;
}
