#![allow(clippy::type_complexity)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::net::UdpSocket;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::{thread, time};

use simple_logger::SimpleLogger;

use super::transport::*;
use super::type_alias::*;
use super::*;

mod corners;

static PORT: AtomicU16 = AtomicU16::new(31850);

fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

/// One Nexus per process: tests that create one must not overlap.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn test_guard() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
    guard
}

// ---- In-process loopback transport ----------------------------------------

type Inbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Endpoint id 0 never resolves; unknown nonzero ids resolve to a sink.
fn fabric() -> &'static Mutex<HashMap<u32, Inbox>> {
    static FABRIC: OnceLock<Mutex<HashMap<u32, Inbox>>> = OnceLock::new();
    FABRIC.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_EP_ID: AtomicU32 = AtomicU32::new(1);

pub(self) struct FakePeer {
    inbox: Inbox,
}

/// Loopback transport: `tx_burst` copies packets straight into the peer's
/// inbox, `rx_burst` copies them into this endpoint's receive ring.
pub(self) struct FakeTransport {
    ep_id: u32,
    inbox: Inbox,
    rx_ring: Vec<MsgBuf>,
    rx_head: usize,
    rx_pending: VecDeque<(usize, usize)>,
    next_handle: MemoryHandle,
}

impl Transport for FakeTransport {
    type Peer = FakePeer;

    const REQUIRES_PRIVILEGED_CALLER: bool = false;
    const RX_RING_SIZE: usize = 4096;

    fn new(phy_port: u8, _numa_node: usize) -> Result<Self> {
        if phy_port > 1 {
            return Err(Error::Transport(format!("no such port: {}", phy_port)));
        }
        let ep_id = NEXT_EP_ID.fetch_add(1, Ordering::SeqCst);
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        fabric().lock().unwrap().insert(ep_id, inbox.clone());
        Ok(Self {
            ep_id,
            inbox,
            rx_ring: Vec::new(),
            rx_head: 0,
            rx_pending: VecDeque::new(),
            next_handle: 1,
        })
    }

    fn mtu() -> usize {
        1024
    }

    fn init_hugepage_structures(&mut self, rx_ring: Vec<MsgBuf>) -> Result<()> {
        assert_eq!(rx_ring.len(), Self::RX_RING_SIZE);
        self.rx_ring = rx_ring;
        Ok(())
    }

    fn endpoint_blob(&self) -> [u8; TRANSPORT_BLOB_LEN] {
        let mut blob = [0u8; TRANSPORT_BLOB_LEN];
        blob[..4].copy_from_slice(&self.ep_id.to_le_bytes());
        blob
    }

    fn make_peer(&mut self, blob: &[u8; TRANSPORT_BLOB_LEN]) -> Result<FakePeer> {
        let ep_id = u32::from_le_bytes(blob[..4].try_into().unwrap());
        if ep_id == 0 {
            return Err(Error::Transport("unresolvable endpoint".to_owned()));
        }
        let inbox = fabric().lock().unwrap().get(&ep_id).cloned();
        Ok(FakePeer {
            // A vanished endpoint becomes a sink: packets go nowhere.
            inbox: inbox.unwrap_or_default(),
        })
    }

    unsafe fn reg_mem(&mut self, _buf: *mut u8, _len: usize) -> MemoryHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn dereg_mem(&mut self, _handle: MemoryHandle) {}

    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]) {
        for item in items {
            let msgbuf = &*item.msgbuf;
            let total = std::mem::size_of::<crate::pkthdr::PacketHeader>() + msgbuf.len();
            let bytes =
                std::slice::from_raw_parts(msgbuf.pkt_hdr() as *const u8, total).to_vec();
            (*item.peer).inbox.lock().unwrap().push_back(bytes);
        }
    }

    fn rx_burst(&mut self) -> usize {
        let hdr_len = std::mem::size_of::<crate::pkthdr::PacketHeader>();
        let mut n = 0;
        while let Some(bytes) = self.inbox.lock().unwrap().pop_front() {
            assert!(bytes.len() >= hdr_len);
            let entry = self.rx_head;
            self.rx_head = (self.rx_head + 1) % self.rx_ring.len();

            let ring_buf = &self.rx_ring[entry];
            assert!(bytes.len() - hdr_len <= ring_buf.capacity());
            // SAFETY: the ring entry has header room plus `capacity` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    ring_buf.pkt_hdr() as *mut u8,
                    bytes.len(),
                )
            };
            self.rx_pending.push_back((entry, bytes.len() - hdr_len));
            n += 1;
        }
        n
    }

    fn rx_next(&mut self) -> Option<MsgBuf> {
        let (entry, data_len) = self.rx_pending.pop_front()?;
        let ring_buf = &self.rx_ring[entry];
        // SAFETY: the ring entry holds a filled header followed by data.
        Some(unsafe {
            MsgBuf::borrowed(
                NonNull::new(ring_buf.pkt_hdr() as *mut u8).unwrap(),
                data_len,
                ring_buf.handle(),
            )
        })
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        fabric().lock().unwrap().remove(&self.ep_id);
    }
}

// ---- Callback recording ----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(self) enum Event {
    Sm(SessNum, SmEventType, SmErrType),
    Completion(usize),
}

/// Context handed to callbacks through the opaque pointer. Creator-thread
/// callbacks only; background continuations use [`BgCtx`].
#[derive(Default)]
pub(self) struct TestCtx {
    events: RefCell<Vec<Event>>,

    /// Expected response payload per tag, for content-checking continuations.
    expected: RefCell<HashMap<usize, Vec<u8>>>,
}

impl TestCtx {
    pub fn as_ptr(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn sm_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Sm(..)))
            .collect()
    }

    pub fn completions(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Completion(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }
}

pub(self) fn sm_recorder() -> SmHandler {
    Box::new(|sess_num, event, err, ctx| {
        // SAFETY: tests pass a `TestCtx` outliving the Rpc.
        let ctx = unsafe { &*(ctx as *const TestCtx) };
        ctx.events.borrow_mut().push(Event::Sm(sess_num, event, err));
    })
}

pub(self) fn sm_ignore() -> SmHandler {
    Box::new(|_, _, _, _| {})
}

/// Foreground continuation: check the response payload against the tag and
/// record completion.
pub(self) fn record_cont(resp: RespHandle<FakeTransport>, ctx: *mut c_void, tag: usize) {
    // SAFETY: same as `sm_recorder`.
    let ctx = unsafe { &*(ctx as *const TestCtx) };
    assert_eq!(unsafe { resp.resp_buf().as_slice() }, &tag.to_le_bytes()[..]);
    ctx.events.borrow_mut().push(Event::Completion(tag));
}

/// Continuation that checks the response against `TestCtx::expected`.
pub(self) fn record_cont_expected(resp: RespHandle<FakeTransport>, ctx: *mut c_void, tag: usize) {
    // SAFETY: same as `sm_recorder`.
    let ctx = unsafe { &*(ctx as *const TestCtx) };
    {
        let expected = ctx.expected.borrow();
        assert_eq!(unsafe { resp.resp_buf().as_slice() }, expected[&tag].as_slice());
    }
    ctx.events.borrow_mut().push(Event::Completion(tag));
}

/// Context for continuations running on background threads.
#[derive(Default)]
pub(self) struct BgCtx {
    completions: Mutex<Vec<usize>>,
    sm_events: Mutex<Vec<Event>>,
}

impl BgCtx {
    pub fn as_ptr(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }
}

pub(self) fn sm_recorder_bg() -> SmHandler {
    Box::new(|sess_num, event, err, ctx| {
        // SAFETY: tests pass a `BgCtx` outliving the Rpc.
        let ctx = unsafe { &*(ctx as *const BgCtx) };
        ctx.sm_events
            .lock()
            .unwrap()
            .push(Event::Sm(sess_num, event, err));
    })
}

pub(self) fn record_cont_bg(resp: RespHandle<FakeTransport>, ctx: *mut c_void, tag: usize) {
    // SAFETY: tests pass a `BgCtx` outliving the Rpc.
    let ctx = unsafe { &*(ctx as *const BgCtx) };
    assert_eq!(unsafe { resp.resp_buf().as_slice() }, &tag.to_le_bytes()[..]);
    ctx.completions.lock().unwrap().push(tag);
}

// ---- Event-loop pumping ----------------------------------------------------

const PUMP_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Poll the given Rpcs until `done` holds, panicking on timeout.
pub(self) fn pump_until(
    rpcs: &[&Rpc<FakeTransport>],
    what: &str,
    mut done: impl FnMut() -> bool,
) {
    let start = time::Instant::now();
    loop {
        for rpc in rpcs {
            rpc.progress();
        }
        if done() {
            return;
        }
        assert!(start.elapsed() < PUMP_TIMEOUT, "timed out waiting for {}", what);
        thread::yield_now();
    }
}

/// Poll the given Rpcs for a little while, expecting nothing to change.
pub(self) fn pump_for(rpcs: &[&Rpc<FakeTransport>], dur: time::Duration) {
    let start = time::Instant::now();
    while start.elapsed() < dur {
        for rpc in rpcs {
            rpc.progress();
        }
        thread::yield_now();
    }
}

/// An echo-style request payload: the tag, little-endian.
pub(self) fn payload(tag: usize) -> Vec<u8> {
    tag.to_le_bytes().to_vec()
}

/// Send a crafted session-management packet to a Nexus listener.
pub(self) fn send_raw_sm_pkt(nexus: &Nexus<FakeTransport>, pkt: &SessionMgmtPkt) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.send_to(&pkt.to_bytes(), nexus.uri()).unwrap();
}
