mod bg_thread;
mod hook;

use std::io::ErrorKind as IoErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::{thread, time};

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub(crate) use self::bg_thread::*;
pub(crate) use self::hook::*;
use crate::error::{Error, Result};
use crate::handler::ReqFuncTable;
use crate::smpkt::{SessionMgmtPkt, MAX_HOSTNAME_LEN, SM_PKT_WIRE_LEN};
use crate::transport::Transport;
use crate::type_alias::*;
use crate::util::mt_list::MtList;
use crate::util::tls_registry::TlsRegistry;

static NEXUS_CREATED: AtomicBool = AtomicBool::new(false);

/// Session-management part of [`Nexus`]: the UDP listener state and the
/// hook table it dispatches into.
struct NexusSm {
    uri: SocketAddr,
    hooks: DashMap<RpcId, Arc<MtList<SessionMgmtPkt>>, RandomState>,
    sm_should_stop: AtomicBool,
}

impl NexusSm {
    /// Listen on the given socket for session-management packets.
    fn listen(self: Arc<Self>, socket: UdpSocket) {
        // One spare byte, so oversized datagrams decode as malformed instead
        // of being silently truncated to a valid length.
        let mut buf = [0u8; SM_PKT_WIRE_LEN + 1];
        while !self.sm_should_stop.load(Ordering::Relaxed) {
            let (amt, src) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e)
                    if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(e) => panic!("failed to receive UDP packet: {}", e),
            };
            // UDP is unreliable, so malformed datagrams are simply dropped.
            let Ok(pkt) = SessionMgmtPkt::from_bytes(&buf[..amt]) else {
                log::debug!("Nexus SM: ignoring malformed packet from {}", src);
                continue;
            };

            let dst = pkt.dst_rpc_id();
            match self.hooks.get(&dst) {
                Some(list) => {
                    log::trace!("Nexus SM: posting {:?} packet to Rpc {}", pkt.pkt_type, dst);
                    list.push(pkt);
                }
                None => log::debug!("Nexus SM: dropping packet for unregistered Rpc {}", dst),
            };
        }
    }
}

/// One background worker owned by the Nexus.
struct BgWorker<Tp: Transport> {
    kill_switch: Arc<AtomicBool>,
    req_list: Arc<MtList<BgWorkItem<Tp>>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// A per-process singleton owning the background worker pool, the tiny
/// thread id registry, and the session-management packet demultiplexer.
///
/// `Rpc` endpoints register themselves here and share one Nexus per process.
pub struct Nexus<Tp: Transport> {
    hostname: String,
    sm_port: u16,

    req_funcs: Arc<ReqFuncTable<Tp>>,
    tls_registry: Arc<TlsRegistry>,

    sm: Arc<NexusSm>,
    sm_thread: Option<thread::JoinHandle<()>>,

    bg_workers: Vec<BgWorker<Tp>>,
}

impl<Tp: Transport> Nexus<Tp> {
    /// Maximum number of background threads.
    pub const MAX_BG_THREADS: usize = 8;

    const SOCKET_READ_TIMEOUT: time::Duration = time::Duration::from_millis(100);

    /// Create the Nexus.
    ///
    /// `req_funcs` is the request-type table; it is immutable from here on.
    /// Handlers flagged background require `num_bg_threads > 0`.
    pub fn new(
        hostname: &str,
        sm_port: u16,
        num_bg_threads: usize,
        req_funcs: ReqFuncTable<Tp>,
    ) -> Result<Arc<Self>> {
        if hostname.len() >= MAX_HOSTNAME_LEN {
            return Err(Error::HostnameTooLong(hostname.to_owned()));
        }
        if num_bg_threads > Self::MAX_BG_THREADS {
            return Err(Error::TooManyBgThreads {
                requested: num_bg_threads,
                limit: Self::MAX_BG_THREADS,
            });
        }
        if req_funcs.has_background_funcs() && num_bg_threads == 0 {
            return Err(Error::BgThreadsRequired);
        }

        if NEXUS_CREATED.swap(true, Ordering::SeqCst) {
            return Err(Error::NexusAlreadyExists);
        }

        let socket = match UdpSocket::bind((hostname, sm_port)) {
            Ok(socket) => socket,
            Err(e) => {
                NEXUS_CREATED.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        socket
            .set_read_timeout(Some(Self::SOCKET_READ_TIMEOUT))
            .expect("failed to set UDP read timeout");
        let uri = socket.local_addr().expect("failed to read UDP local addr");

        let req_funcs = Arc::new(req_funcs);
        let tls_registry = Arc::new(TlsRegistry::new());

        // Spawn the workers and wait until each has claimed its tiny thread
        // id, so no later registrant can race a worker out of its slot.
        let ready = Arc::new(AtomicUsize::new(0));
        let bg_workers: Vec<_> = (0..num_bg_threads)
            .map(|index| {
                let kill_switch = Arc::new(AtomicBool::new(false));
                let req_list = Arc::new(MtList::new());
                let ctx = BgThreadCtx {
                    index,
                    kill_switch: kill_switch.clone(),
                    tls_registry: tls_registry.clone(),
                    req_funcs: req_funcs.clone(),
                    req_list: req_list.clone(),
                    ready: ready.clone(),
                };
                BgWorker {
                    kill_switch,
                    req_list,
                    thread: Some(thread::spawn(move || bg_thread_main(ctx))),
                }
            })
            .collect();
        while ready.load(Ordering::SeqCst) < num_bg_threads {
            thread::yield_now();
        }

        let sm = Arc::new(NexusSm {
            uri,
            hooks: DashMap::with_capacity_and_hasher(256, RandomState::new()),
            sm_should_stop: AtomicBool::new(false),
        });
        let sm_thread = {
            let sm = sm.clone();
            thread::spawn(move || sm.listen(socket))
        };

        log::debug!(
            "Nexus created at {}:{} with {} background threads",
            hostname,
            sm_port,
            num_bg_threads
        );
        Ok(Arc::new(Self {
            hostname: hostname.to_owned(),
            sm_port,
            req_funcs,
            tls_registry,
            sm,
            sm_thread: Some(sm_thread),
            bg_workers,
        }))
    }

    /// Get the hostname this Nexus was created with.
    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Get the UDP port the session-management listener is bound to.
    /// Peers are assumed to listen on the same port.
    #[inline]
    pub fn sm_port(&self) -> u16 {
        self.sm_port
    }

    /// Get the socket address the session-management listener is bound to.
    #[inline]
    pub fn uri(&self) -> SocketAddr {
        self.sm.uri
    }
}

impl<Tp: Transport> Nexus<Tp> {
    /// Register an inbox for the given Rpc id.
    pub(crate) fn register_hook(&self, rpc_id: RpcId) -> Result<NexusHook<Tp>> {
        let sm_pkt_list = Arc::new(MtList::new());
        match self.sm.hooks.entry(rpc_id) {
            Entry::Occupied(_) => return Err(Error::RpcIdInUse(rpc_id)),
            Entry::Vacant(entry) => entry.insert(sm_pkt_list.clone()),
        };
        Ok(NexusHook {
            rpc_id,
            sm_pkt_list,
            bg_lists: self.bg_workers.iter().map(|w| w.req_list.clone()).collect(),
        })
    }

    /// Revoke the inbox registration for the given Rpc id.
    pub(crate) fn unregister_hook(&self, rpc_id: RpcId) {
        self.sm.hooks.remove(&rpc_id);
    }

    #[inline(always)]
    pub(crate) fn req_funcs(&self) -> &Arc<ReqFuncTable<Tp>> {
        &self.req_funcs
    }

    #[inline(always)]
    pub(crate) fn tls_registry(&self) -> &Arc<TlsRegistry> {
        &self.tls_registry
    }

    #[inline(always)]
    pub(crate) fn num_bg_threads(&self) -> usize {
        self.bg_workers.len()
    }

    /// Resolve an SM peer address: the peer's hostname, on the shared
    /// management port.
    pub(crate) fn sm_peer_addr(&self, hostname: &str) -> Result<SocketAddr> {
        (hostname, self.sm_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(IoErrorKind::AddrNotAvailable.into()))
    }
}

impl<Tp: Transport> Drop for Nexus<Tp> {
    fn drop(&mut self) {
        // Workers first: each exits once its list is drained.
        for worker in self.bg_workers.iter() {
            worker.kill_switch.store(true, Ordering::SeqCst);
        }
        for worker in self.bg_workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }

        self.sm.sm_should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.sm_thread.take() {
            let _ = thread.join();
        }

        // Hooks are expected to have been unregistered by their Rpcs.
        if !self.sm.hooks.is_empty() {
            log::error!(
                "Nexus destroyed with {} hooks still registered",
                self.sm.hooks.len()
            );
            self.sm.hooks.clear();
        }

        NEXUS_CREATED.store(false, Ordering::SeqCst);
    }
}
