use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::{thread, time};

use crate::handler::{ReqFuncTable, ReqHandle, RespHandle};
use crate::rpc::Rpc;
use crate::session::SSlot;
use crate::transport::Transport;
use crate::type_alias::*;
use crate::util::mt_list::MtList;
use crate::util::tls_registry::TlsRegistry;

/// What a background work item invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BgWorkItemKind {
    /// A long-running request handler.
    Request,

    /// A client continuation.
    Continuation,
}

/// A deferred handler or continuation invocation, handed from a datapath
/// thread to a background worker.
pub(crate) struct BgWorkItem<Tp: Transport> {
    pub kind: BgWorkItemKind,

    /// Id of the owning Rpc, for diagnostics.
    pub rpc_id: RpcId,

    /// The owning Rpc. Only its background-response list is touched from the
    /// worker; everything else on the Rpc stays creator-thread-only.
    pub rpc: *const Rpc<Tp>,

    /// Opaque application context.
    pub context: *mut c_void,

    /// The slot carrying the request or response.
    pub sslot: *mut SSlot<Tp>,
}

// SAFETY: the raw pointers stay valid until the item is consumed; the Rpc
// cannot be destroyed with sessions (and thus work items) outstanding.
unsafe impl<Tp: Transport> Send for BgWorkItem<Tp> {}

/// Everything one background worker needs.
pub(crate) struct BgThreadCtx<Tp: Transport> {
    /// Index the Nexus assigned to this worker.
    pub index: usize,

    /// Set by the Nexus at shutdown.
    pub kill_switch: Arc<AtomicBool>,

    /// Thread registry of the owning Nexus.
    pub tls_registry: Arc<TlsRegistry>,

    /// The request-type table, immutable after Nexus startup.
    pub req_funcs: Arc<ReqFuncTable<Tp>>,

    /// This worker's private work-item list.
    pub req_list: Arc<MtList<BgWorkItem<Tp>>>,

    /// Incremented once this worker has registered its tiny thread id.
    pub ready: Arc<AtomicUsize>,
}

const IDLE_SLEEP: time::Duration = time::Duration::from_micros(1);

/// Background worker loop.
///
/// Exits only once the kill switch is set *and* the work list has drained,
/// so every item pushed before shutdown is invoked exactly once.
pub(crate) fn bg_thread_main<Tp: Transport>(ctx: BgThreadCtx<Tp>) {
    ctx.tls_registry.init();

    // Work-item lists are indexed interchangeably by the worker's Nexus
    // index and its tiny thread id, so the two must agree.
    let tiny_tid = ctx.tls_registry.tid();
    assert!(
        tiny_tid == ctx.index,
        "background thread id mismatch: Nexus-assigned index is {}, but tiny thread id is {}",
        ctx.index,
        tiny_tid
    );
    ctx.ready.fetch_add(1, Ordering::SeqCst);
    log::debug!("background thread {} running", ctx.index);

    loop {
        if ctx.req_list.size_relaxed() == 0 {
            if ctx.kill_switch.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let items = ctx.req_list.lock().take();
        for item in items {
            // SAFETY: the slot stays alive until the item is consumed.
            let sslot = unsafe { &mut *item.sslot };
            debug_assert!(sslot.rx_msgbuf.is_some(), "work item without rx buffer");

            match item.kind {
                BgWorkItemKind::Request => {
                    debug_assert!(sslot.tx_msgbuf.is_none());
                    log::trace!(
                        "background thread {}: request handler for Rpc {}, request index {}",
                        ctx.index,
                        item.rpc_id,
                        sslot.req_idx
                    );

                    // Registration was checked at submission.
                    let req_func = ctx.req_funcs.get(sslot.req_type).unwrap();
                    let mut handle = ReqHandle::new(item.sslot);
                    (req_func.func)(&mut handle, item.context);

                    // The handler is done with the request; hand the filled
                    // response slot back to the creator thread for transmit.
                    sslot.bury_rx();
                    // SAFETY: the Rpc outlives its outstanding work items.
                    unsafe { Rpc::bg_enqueue_response(item.rpc, item.sslot) };
                }
                BgWorkItemKind::Continuation => {
                    log::trace!(
                        "background thread {}: continuation for Rpc {}, request index {}",
                        ctx.index,
                        item.rpc_id,
                        sslot.req_idx
                    );

                    let cont = sslot.clt_save.cont.take().unwrap();
                    let tag = sslot.clt_save.tag;
                    // The continuation releases the rx buffer by dropping the
                    // handle; the datapath thread may recycle the slot right
                    // after, so it must not be touched here again.
                    cont(RespHandle::new(item.sslot), item.context, tag);
                }
            }
        }
    }

    log::debug!("background thread {} exiting", ctx.index);
}
