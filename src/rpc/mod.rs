mod sm_handlers;

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::net::UdpSocket;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use quanta::Instant;

use crate::error::{Error, Result};
use crate::handler::*;
use crate::msgbuf::MsgBuf;
use crate::nexus::*;
use crate::pkthdr::*;
use crate::session::*;
use crate::smpkt::*;
use crate::transport::*;
use crate::type_alias::*;
use crate::util::likely::*;
use crate::util::mt_list::MtList;
use crate::util::slab::MsgAllocator;

/// Maximum live sessions per Rpc.
const MAX_SESSIONS: usize = 1024;

/// Retransmit interval for in-flight session-management requests. Retry
/// *policy* (give-up, backoff) belongs to the layer above; duplicates are
/// absorbed by the idempotent handlers on the peer.
const SM_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// An in-flight session-management request of a client session.
struct SmRetryEntry {
    sess_num: SessNum,
    pkt: SessionMgmtPkt,
    last_tx: Instant,
}

/// A finished background request whose response awaits transmission.
pub(crate) struct BgRespItem<Tp: Transport>(*mut SSlot<Tp>);

// SAFETY: the slot stays valid until the creator thread consumes the item.
unsafe impl<Tp: Transport> Send for BgRespItem<Tp> {}

/// Interior-mutable state of an [`Rpc`] instance, touched only by the
/// creator thread.
struct RpcInterior<Tp: Transport> {
    /// Sessions, indexed by session number. Boxed so slot back-references
    /// stay stable; buried sessions leave an empty slot behind.
    sessions: Vec<Option<Box<Session<Tp>>>>,

    /// Message buffer allocator; destroyed before the transport.
    allocator: Rc<MsgAllocator>,

    /// The fabric transport.
    tp: Tp,

    /// Management retry queue; only client sessions ever appear here.
    sm_retry_queue: Vec<SmRetryEntry>,
}

/// A single-threaded RPC endpoint bound to one NIC port and one Rpc id.
///
/// All public operations, and the destructor, must run on the thread that
/// created the instance. The only cross-thread ingress paths are the
/// session-management inbox filled by the Nexus listener and the background
/// lists drained by workers.
pub struct Rpc<Tp: Transport> {
    /// Id of this Rpc, unique within the Nexus.
    id: RpcId,

    /// The Nexus this Rpc is registered with.
    nexus: Arc<Nexus<Tp>>,

    /// Opaque application context passed to every callback.
    context: *mut c_void,

    /// Session-management event callback.
    sm_handler: SmHandler,

    /// The creator thread.
    creator: ThreadId,

    /// Event-loop re-entrance tracking for the destructor check.
    in_event_loop: Cell<bool>,

    /// Session management packet sender.
    /// An independent socket; only *inbound* packets go through the Nexus.
    sm_tx: UdpSocket,

    /// Inbox registered with the Nexus.
    hook: NexusHook<Tp>,

    /// Responses finished by background workers, awaiting transmission.
    bg_resp_list: MtList<BgRespItem<Tp>>,

    /// Interior-mutable state of this Rpc.
    state: RefCell<RpcInterior<Tp>>,

    /// Pending packet transmissions.
    ///
    /// Placed in a separate `RefCell` so response posting does not need to
    /// re-borrow `RpcInterior`.
    pending_tx: RefCell<Vec<TxItem<Tp>>>,
}

// Safety checks.
impl<Tp: Transport> Rpc<Tp> {
    #[cfg(not(feature = "skip_safety_checks"))]
    #[inline(always)]
    fn do_thread_check(&self) {
        #[inline(never)]
        #[cold]
        fn thread_check_fail() -> ! {
            panic!("Rpc must not be used on a different thread than it was created on");
        }

        if thread::current().id() != self.creator {
            thread_check_fail()
        }
    }

    #[cfg(feature = "skip_safety_checks")]
    #[inline(always)]
    fn do_thread_check(&self) {}
}

// Construction & accessors.
impl<Tp: Transport> Rpc<Tp> {
    /// Create a new `Rpc` bound to the given Nexus under a unique id,
    /// operating on the given physical port and NUMA node.
    ///
    /// `context` is handed back verbatim to request handlers, continuations,
    /// and the session-management callback.
    pub fn new(
        nexus: &Arc<Nexus<Tp>>,
        context: *mut c_void,
        id: RpcId,
        sm_handler: SmHandler,
        phy_port: u8,
        numa_node: usize,
    ) -> Result<Self> {
        if Tp::REQUIRES_PRIVILEGED_CALLER && unsafe { libc::geteuid() } != 0 {
            return Err(Error::InsufficientPrivilege);
        }
        if id == INVALID_RPC_ID {
            return Err(Error::InvalidRpcId(id));
        }
        if phy_port >= MAX_PHY_PORTS {
            return Err(Error::InvalidPhyPort {
                port: phy_port,
                limit: MAX_PHY_PORTS,
            });
        }
        if numa_node >= MAX_NUMA_NODES {
            return Err(Error::InvalidNumaNode {
                node: numa_node,
                limit: MAX_NUMA_NODES,
            });
        }

        // The transport comes up in two steps: creation only enables memory
        // registration, which the allocator needs; the receive ring then
        // completes initialization from allocator-backed buffers.
        let mut tp = Tp::new(phy_port, numa_node)?;
        let allocator = MsgAllocator::new();
        let rx_ring = (0..Tp::RX_RING_SIZE)
            .map(|_| {
                let buf = allocator.alloc(Tp::mtu(), &mut tp);
                MsgBuf::owned(buf, Tp::max_data_per_pkt())
            })
            .collect();
        if let Err(e) = tp.init_hugepage_structures(rx_ring) {
            allocator.destroy(&mut tp);
            return Err(e);
        }

        let sm_tx = match UdpSocket::bind((nexus.hostname(), 0)) {
            Ok(socket) => socket,
            Err(e) => {
                allocator.destroy(&mut tp);
                return Err(e.into());
            }
        };

        // Claims the id; fails on duplicates.
        let hook = match nexus.register_hook(id) {
            Ok(hook) => hook,
            Err(e) => {
                allocator.destroy(&mut tp);
                return Err(e);
            }
        };

        nexus.tls_registry().ensure_init();

        log::debug!("Rpc {}: created on port {}, NUMA node {}", id, phy_port, numa_node);
        Ok(Self {
            id,
            nexus: nexus.clone(),
            context,
            sm_handler,
            creator: thread::current().id(),
            in_event_loop: Cell::new(false),
            sm_tx,
            hook,
            bg_resp_list: MtList::new(),
            state: RefCell::new(RpcInterior {
                sessions: Vec::new(),
                allocator,
                tp,
                sm_retry_queue: Vec::new(),
            }),
            pending_tx: RefCell::new(Vec::new()),
        })
    }

    /// Return the id of this Rpc instance.
    #[inline(always)]
    pub fn id(&self) -> RpcId {
        self.id
    }

    /// Return the Nexus this Rpc is bound to.
    #[inline(always)]
    pub fn nexus(&self) -> &Arc<Nexus<Tp>> {
        &self.nexus
    }

    /// Return the number of live (non-buried) sessions.
    pub fn num_sessions(&self) -> usize {
        self.state.borrow().sessions.iter().flatten().count()
    }

    /// Allocate a `MsgBuf` for at most `len` bytes of application data in
    /// registered memory, with room for the packet header.
    ///
    /// The buffer starts with length `len` and uninitialized contents.
    pub fn alloc_msgbuf(&self, len: usize) -> MsgBuf {
        self.do_thread_check();
        assert!(
            len <= Tp::max_data_per_pkt(),
            "message of {} bytes does not fit in one packet",
            len
        );

        let state = &mut *self.state.borrow_mut();
        let buf = state
            .allocator
            .alloc(len + std::mem::size_of::<PacketHeader>(), &mut state.tp);
        MsgBuf::owned(buf, len)
    }
}

// Session control plane.
impl<Tp: Transport> Rpc<Tp> {
    /// Open a client session towards `(remote_hostname, remote_rpc_id)`.
    ///
    /// Returns the local session number immediately; the connect request
    /// goes out asynchronously and the session-management callback reports
    /// the outcome. The event loop must be polled for progress.
    pub fn create_session(&self, remote_hostname: &str, remote_rpc_id: RpcId) -> Result<SessNum> {
        self.do_thread_check();
        if remote_rpc_id == INVALID_RPC_ID {
            return Err(Error::InvalidRpcId(remote_rpc_id));
        }
        if remote_hostname.len() >= MAX_HOSTNAME_LEN {
            return Err(Error::HostnameTooLong(remote_hostname.to_owned()));
        }

        let state = &mut *self.state.borrow_mut();
        let sess_num = match state.sessions.iter().position(Option::is_none) {
            Some(idx) => idx,
            None if state.sessions.len() < MAX_SESSIONS => {
                state.sessions.push(None);
                state.sessions.len() - 1
            }
            None => return Err(Error::TooManySessions),
        } as SessNum;

        let mut client = SessionEndpoint::new(self.nexus.hostname(), self.id, sess_num);
        client.transport_blob = state.tp.endpoint_blob();
        let server = SessionEndpoint::new(remote_hostname, remote_rpc_id, INVALID_SESS_NUM);

        let session = Session::new(
            SessionRole::Client,
            client,
            server,
            &state.allocator,
            &mut state.tp,
        );
        state.sessions[sess_num as usize] = Some(session);

        let pkt = SessionMgmtPkt {
            pkt_type: SmPktType::ConnectReq,
            err_type: SmErrType::NoError,
            client,
            server,
        };
        self.send_sm_pkt(&pkt);
        state.sm_retry_queue.push(SmRetryEntry {
            sess_num,
            pkt,
            last_tx: Instant::now(),
        });

        log::debug!(
            "Rpc {}: session {} connecting to {:?}",
            self.id,
            sess_num,
            server
        );
        Ok(sess_num)
    }

    /// Disconnect a connected, quiescent client session.
    ///
    /// The disconnect request goes out asynchronously; the callback reports
    /// `Disconnected` once the peer responds, after which the session number
    /// is dead.
    pub fn disconnect_session(&self, sess_num: SessNum) -> Result<()> {
        self.do_thread_check();

        let state = &mut *self.state.borrow_mut();
        let session = state
            .sessions
            .get_mut(sess_num as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidSessNum(sess_num))?;
        if !session.is_client() || session.state() != SessionState::Connected {
            return Err(Error::InvalidSessState(sess_num));
        }
        if !session.is_quiescent() {
            return Err(Error::SessionBusy(sess_num));
        }

        session.advance(SessionState::DisconnectInProgress);
        let pkt = SessionMgmtPkt {
            pkt_type: SmPktType::DisconnectReq,
            err_type: SmErrType::NoError,
            client: session.client,
            server: session.server,
        };
        self.send_sm_pkt(&pkt);
        state.sm_retry_queue.push(SmRetryEntry {
            sess_num,
            pkt,
            last_tx: Instant::now(),
        });

        log::debug!("Rpc {}: session {} disconnecting", self.id, sess_num);
        Ok(())
    }

    /// Detach and destroy a session, leaving its slot empty.
    ///
    /// Releases every registered buffer the window slots own (the
    /// preallocated response buffers; rx/tx views are dropped with them).
    /// No callback for this session ever fires again.
    fn bury_session(&self, state: &mut RpcInterior<Tp>, sess_num: SessNum) {
        let mut session = state.sessions[sess_num as usize]
            .take()
            .expect("burying an empty session slot");
        if session.is_client() {
            debug_assert!(
                !Self::retryq_contains(state, sess_num),
                "burying a session still in the retry queue"
            );
        }

        for sslot in session.sslots.iter_mut() {
            sslot.rx_msgbuf = None;
            sslot.tx_msgbuf = None;
            // Returns the registered memory to the allocator.
            sslot.pre_resp_msgbuf = None;
        }

        log::debug!("Rpc {}: buried session {}", self.id, sess_num);
        drop(session);
    }

    fn retryq_contains(state: &RpcInterior<Tp>, sess_num: SessNum) -> bool {
        state.sm_retry_queue.iter().any(|e| e.sess_num == sess_num)
    }

    fn retryq_remove(state: &mut RpcInterior<Tp>, sess_num: SessNum) {
        state.sm_retry_queue.retain(|e| e.sess_num != sess_num);
    }

    /// Send a session-management packet to the peer it addresses:
    /// requests go to the server's host, responses to the client's.
    fn send_sm_pkt(&self, pkt: &SessionMgmtPkt) {
        let dst = if pkt.pkt_type.is_req() {
            pkt.server.hostname_str()
        } else {
            pkt.client.hostname_str()
        };
        match self.nexus.sm_peer_addr(dst) {
            Ok(addr) => {
                if let Err(e) = self.sm_tx.send_to(&pkt.to_bytes(), addr) {
                    log::error!("Rpc {}: failed to send SM packet to {}: {}", self.id, dst, e);
                }
            }
            Err(e) => log::error!("Rpc {}: cannot resolve SM peer {}: {}", self.id, dst, e),
        }
    }
}

// Request datapath.
impl<Tp: Transport> Rpc<Tp> {
    /// Enqueue a request on a connected client session.
    ///
    /// `cont` runs when the response arrives, with `tag` passed back; with
    /// `cont_in_bg` it runs on a background thread instead of the event
    /// loop. The request buffer must stay alive and unmodified until then.
    /// Requests exceeding the session's free window slots are backlogged and
    /// admitted in FIFO order.
    pub fn enqueue_request(
        &self,
        sess_num: SessNum,
        req_type: ReqType,
        req_msgbuf: &MsgBuf,
        cont: ContFunc<Tp>,
        tag: usize,
        cont_in_bg: bool,
    ) -> Result<()> {
        self.do_thread_check();
        if cont_in_bg && self.nexus.num_bg_threads() == 0 {
            return Err(Error::BgThreadsRequired);
        }
        assert!(
            req_msgbuf.len() <= Tp::max_data_per_pkt(),
            "request does not fit in one packet"
        );

        let state = &mut *self.state.borrow_mut();
        let session = state
            .sessions
            .get_mut(sess_num as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidSessNum(sess_num))?;
        if !session.is_client() || session.state() != SessionState::Connected {
            return Err(Error::InvalidSessState(sess_num));
        }

        // Joining a non-empty backlog keeps per-session FIFO order.
        let free_slot = session.sslots.iter().position(SSlot::is_free);
        match free_slot {
            Some(idx) if session.req_backlog.is_empty() => {
                self.fill_and_send_request(
                    session,
                    idx,
                    req_type,
                    req_msgbuf.clone_borrowed(),
                    cont,
                    tag,
                    cont_in_bg,
                );
            }
            _ => session.req_backlog.push_back(PendingRequest {
                req_type,
                req_msgbuf: req_msgbuf.clone_borrowed(),
                cont,
                tag,
                cont_in_bg,
            }),
        }
        Ok(())
    }

    /// Occupy a free slot with a request and queue its packet for TX.
    fn fill_and_send_request(
        &self,
        session: &mut Session<Tp>,
        sslot_idx: usize,
        req_type: ReqType,
        req_msgbuf: MsgBuf,
        cont: ContFunc<Tp>,
        tag: usize,
        cont_in_bg: bool,
    ) {
        let dst_sess_num = session.server.sess_num;
        let peer: *const Tp::Peer = session.peer.as_ref().unwrap();

        let sslot = &mut session.sslots[sslot_idx];
        debug_assert!(sslot.is_free());
        sslot.req_idx += SESSION_REQ_WINDOW as ReqIdx;
        sslot.req_type = req_type;
        sslot.clt_save.cont = Some(cont);
        sslot.clt_save.tag = tag;
        sslot.clt_save.cont_in_bg = cont_in_bg;

        // SAFETY: the header slot right before the data is part of the same
        // allocation; see `MsgBuf`.
        unsafe {
            ptr::write(
                req_msgbuf.pkt_hdr(),
                PacketHeader::new(
                    req_type,
                    req_msgbuf.len() as u32,
                    dst_sess_num,
                    PktType::Req,
                    sslot.req_idx,
                ),
            )
        };
        sslot.tx_msgbuf = Some(req_msgbuf);

        self.pending_tx.borrow_mut().push(TxItem {
            peer,
            msgbuf: sslot.tx_msgbuf.as_ref().unwrap(),
        });
    }

    /// Hand a long-running invocation to a background worker. Selection is
    /// by Rpc id, so one Rpc's items always serialize on the same worker.
    fn submit_bg(&self, kind: BgWorkItemKind, sslot: *mut SSlot<Tp>) {
        let num_bg = self.hook.bg_lists.len();
        debug_assert!(num_bg > 0, "background submission without workers");
        self.hook.bg_lists[self.id as usize % num_bg].push(BgWorkItem {
            kind,
            rpc_id: self.id,
            rpc: self,
            context: self.context,
            sslot,
        });
    }

    /// Called by background workers once a request handler has finished.
    ///
    /// # Safety
    ///
    /// `rpc` and `sslot` must be alive; only the background-response list of
    /// the Rpc is touched, which is the one field safe to share.
    pub(crate) unsafe fn bg_enqueue_response(rpc: *const Self, sslot: *mut SSlot<Tp>) {
        (*ptr::addr_of!((*rpc).bg_resp_list)).push(BgRespItem(sslot));
    }

    /// Write the response header for a finished request slot and queue the
    /// preallocated response buffer for TX.
    ///
    /// # Safety
    ///
    /// The slot and its session must be alive, with the response filled.
    unsafe fn post_response(&self, sslot: *mut SSlot<Tp>) {
        let sslot = &mut *sslot;
        let session = &*sslot.session;
        let resp = sslot.pre_resp_msgbuf.as_ref().unwrap();

        ptr::write(
            resp.pkt_hdr(),
            PacketHeader::new(
                sslot.req_type,
                resp.len() as u32,
                session.client.sess_num,
                PktType::Resp,
                sslot.req_idx,
            ),
        );
        self.pending_tx.borrow_mut().push(TxItem {
            peer: session.peer.as_ref().unwrap(),
            msgbuf: resp,
        });
    }
}

// Event-loop internals.
impl<Tp: Transport> Rpc<Tp> {
    /// Process an incoming request packet (server side).
    fn process_request(&self, state: &mut RpcInterior<Tp>, hdr: &PacketHeader, rx: MsgBuf) {
        let sess_num = hdr.dst_sess_num();
        let session = match state
            .sessions
            .get_mut(sess_num as usize)
            .and_then(Option::as_mut)
        {
            Some(s) if s.is_server() && s.state() == SessionState::Connected => s,
            _ => {
                log::warn!(
                    "Rpc {}: dropping request for non-ready session {}",
                    self.id,
                    sess_num
                );
                return;
            }
        };

        let sslot_idx = (hdr.req_idx() % SESSION_REQ_WINDOW as ReqIdx) as usize;
        let sslot = &mut session.sslots[sslot_idx];
        if unlikely(hdr.req_idx() <= sslot.req_idx) {
            log::debug!(
                "Rpc {}: dropping duplicate request (index {})",
                self.id,
                hdr.req_idx()
            );
            return;
        }
        if unlikely(sslot.rx_msgbuf.is_some()) {
            log::warn!(
                "Rpc {}: dropping request for busy slot {} of session {}",
                self.id,
                sslot_idx,
                sess_num
            );
            return;
        }

        let Some(req_func) = self.nexus.req_funcs().get(hdr.req_type()) else {
            log::warn!(
                "Rpc {}: received request for unknown request type {}",
                self.id,
                hdr.req_type()
            );
            return;
        };

        sslot.req_idx = hdr.req_idx();
        sslot.req_type = hdr.req_type();
        sslot.rx_msgbuf = Some(rx);
        let sslot: *mut SSlot<Tp> = sslot;

        if req_func.is_background() {
            self.submit_bg(BgWorkItemKind::Request, sslot);
        } else {
            let mut handle = ReqHandle::new(sslot);
            (req_func.func)(&mut handle, self.context);
            // SAFETY: the slot is alive; the handler has filled the response.
            unsafe {
                (*sslot).bury_rx();
                self.post_response(sslot);
            }
        }
    }

    /// Process an incoming response packet (client side).
    fn process_response(&self, state: &mut RpcInterior<Tp>, hdr: &PacketHeader, rx: MsgBuf) {
        let sess_num = hdr.dst_sess_num();
        let session = match state
            .sessions
            .get_mut(sess_num as usize)
            .and_then(Option::as_mut)
        {
            Some(s) if s.is_client() && s.state() == SessionState::Connected => s,
            _ => {
                log::warn!(
                    "Rpc {}: dropping response for non-ready session {}",
                    self.id,
                    sess_num
                );
                return;
            }
        };

        let sslot_idx = (hdr.req_idx() % SESSION_REQ_WINDOW as ReqIdx) as usize;
        let sslot = &mut session.sslots[sslot_idx];
        if unlikely(sslot.req_idx != hdr.req_idx() || sslot.clt_save.cont.is_none()) {
            log::debug!(
                "Rpc {}: dropping duplicate or stale response (index {})",
                self.id,
                hdr.req_idx()
            );
            return;
        }

        // The request is fully delivered: the transmit side is at rest.
        sslot.tx_msgbuf = None;
        sslot.rx_msgbuf = Some(rx);
        let sslot: *mut SSlot<Tp> = sslot;

        if unsafe { (*sslot).clt_save.cont_in_bg } {
            self.submit_bg(BgWorkItemKind::Continuation, sslot);
        } else {
            // SAFETY: the slot is alive; dropping the handle inside the
            // continuation releases the rx buffer and frees the slot.
            let sslot = unsafe { &mut *sslot };
            let cont = sslot.clt_save.cont.take().unwrap();
            let tag = sslot.clt_save.tag;
            cont(RespHandle::new(sslot), self.context, tag);
        }
    }

    /// Receive a burst of datapath packets and dispatch them.
    fn process_rx(&self) {
        let state = &mut *self.state.borrow_mut();

        let n = state.tp.rx_burst();
        for _ in 0..n {
            let rx = state.tp.rx_next().expect("failed to fetch received packet");
            // SAFETY: the header is byte-aligned and sits right before data.
            let hdr = unsafe { ptr::read(rx.pkt_hdr()) };

            match hdr.pkt_type() {
                PktType::Req => self.process_request(state, &hdr, rx),
                PktType::Resp => self.process_response(state, &hdr, rx),
            }
        }
    }

    /// Transmit responses finished by background workers.
    fn process_bg_responses(&self) {
        let items = self.bg_resp_list.lock().take();
        for BgRespItem(sslot) in items {
            // SAFETY: slots of live sessions; the worker filled the response.
            unsafe { self.post_response(sslot) };
        }
    }

    /// Retransmit session-management requests that have been in flight for
    /// longer than the retry interval.
    fn process_sm_retries(&self, state: &mut RpcInterior<Tp>) {
        for entry in state.sm_retry_queue.iter_mut() {
            if entry.last_tx.elapsed() >= SM_RETRY_INTERVAL {
                log::debug!(
                    "Rpc {}: retransmitting {:?} for session {}",
                    self.id,
                    entry.pkt.pkt_type,
                    entry.sess_num
                );
                self.send_sm_pkt(&entry.pkt);
                entry.last_tx = Instant::now();
            }
        }
    }

    /// Admit backlogged requests into freed window slots, per session and in
    /// FIFO order.
    fn process_backlog(&self, state: &mut RpcInterior<Tp>) {
        for session in state.sessions.iter_mut().flatten() {
            if session.state() != SessionState::Connected {
                continue;
            }
            while !session.req_backlog.is_empty() {
                let Some(idx) = session.sslots.iter().position(SSlot::is_free) else {
                    break;
                };
                let pending = session.req_backlog.pop_front().unwrap();
                self.fill_and_send_request(
                    session,
                    idx,
                    pending.req_type,
                    pending.req_msgbuf,
                    pending.cont,
                    pending.tag,
                    pending.cont_in_bg,
                );
            }
        }
    }

    /// Transmit pending packets.
    fn process_tx(&self) {
        let state = &mut *self.state.borrow_mut();
        let mut pending_tx = self.pending_tx.borrow_mut();
        if unlikely(!pending_tx.is_empty()) {
            // SAFETY: items point into live sessions' slots and peers, which
            // cannot be buried while their packets are pending.
            unsafe { state.tp.tx_burst(&pending_tx) };
            pending_tx.clear();
        }
    }

    /// Run one iteration of the event loop:
    /// - drain the session-management inbox,
    /// - transmit responses finished by background workers,
    /// - receive and dispatch datapath packets,
    /// - retransmit in-flight session-management requests,
    /// - admit backlogged requests, and flush pending transmissions.
    pub fn progress(&self) {
        self.do_thread_check();
        self.in_event_loop.set(true);

        if unlikely(self.hook.sm_pkt_list.size_relaxed() > 0) {
            self.handle_session_management();
        }
        if self.bg_resp_list.size_relaxed() > 0 {
            self.process_bg_responses();
        }
        self.process_rx();
        {
            let state = &mut *self.state.borrow_mut();
            self.process_sm_retries(state);
            self.process_backlog(state);
        }
        self.process_tx();

        self.in_event_loop.set(false);
    }
}

impl<Tp: Transport> Drop for Rpc<Tp> {
    fn drop(&mut self) {
        // An Rpc can only be destroyed from its creator thread, outside the
        // event loop.
        self.do_thread_check();
        #[cfg(not(feature = "skip_safety_checks"))]
        if self.in_event_loop.get() {
            panic!("Rpc {} destroyed from within its event loop", self.id);
        }

        {
            let state = &mut *self.state.borrow_mut();

            // Every session must have reached `Disconnected` (and been
            // buried) before destruction.
            if let Some(session) = state.sessions.iter().flatten().next() {
                panic!(
                    "Rpc {} destroyed with live session {}",
                    self.id,
                    session.local_sess_num()
                );
            }

            // The allocator deregisters its slabs through the transport, so
            // it goes first; the transport is dropped with the state.
            let RpcInterior { allocator, tp, .. } = state;
            allocator.destroy(tp);
        }

        self.nexus.unregister_hook(self.id);
        log::debug!("Rpc {}: destroyed", self.id);
    }
}
