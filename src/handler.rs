//! Request handlers, continuations, and the handles passed to them.

use std::array;
use std::ffi::c_void;

use crate::msgbuf::MsgBuf;
use crate::session::SSlot;
use crate::smpkt::SmErrType;
use crate::transport::Transport;
use crate::type_alias::*;

/// Events delivered to the session-management callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    /// The session connected successfully.
    Connected,

    /// The peer refused the connection; the error type carries its reason.
    ConnectFailed,

    /// The session disconnected.
    Disconnected,
}

/// Per-Rpc session-management callback:
/// `(local_session_num, event_type, err_type, context)`.
///
/// Always invoked on the Rpc's creator thread.
pub type SmHandler = Box<dyn Fn(SessNum, SmEventType, SmErrType, *mut c_void)>;

/// Continuation invoked when a response arrives for a client request:
/// `(response_handle, context, tag)`.
///
/// The continuation owns the release of the response buffer; dropping the
/// [`RespHandle`] performs it.
pub type ContFunc<Tp> = fn(RespHandle<Tp>, *mut c_void, usize);

/// Where a request handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqFuncKind {
    /// Short handler, invoked inline on the Rpc's event loop.
    Foreground,

    /// Long-running handler, dispatched to a background thread.
    Background,
}

/// A registered request handler.
pub struct ReqFunc<Tp: Transport> {
    pub(crate) func: Box<dyn Fn(&mut ReqHandle<Tp>, *mut c_void) + Send + Sync>,
    pub(crate) kind: ReqFuncKind,
}

impl<Tp: Transport> ReqFunc<Tp> {
    #[inline(always)]
    pub(crate) fn is_background(&self) -> bool {
        self.kind == ReqFuncKind::Background
    }
}

/// Request-type table: maps 8-bit request types to handlers.
///
/// Built by the application, handed to the Nexus at construction, and
/// immutable afterwards, so Rpcs and background threads read it without
/// synchronization.
pub struct ReqFuncTable<Tp: Transport> {
    funcs: [Option<ReqFunc<Tp>>; ReqType::MAX as usize + 1],
}

impl<Tp: Transport> ReqFuncTable<Tp> {
    pub fn new() -> Self {
        Self {
            funcs: array::from_fn(|_| None),
        }
    }

    /// Register a handler for the given request type.
    ///
    /// # Panics
    ///
    /// Panic if the request type already has a handler.
    pub fn set<F>(&mut self, req_type: ReqType, kind: ReqFuncKind, func: F) -> &mut Self
    where
        F: Fn(&mut ReqHandle<Tp>, *mut c_void) + Send + Sync + 'static,
    {
        assert!(
            self.funcs[req_type as usize].is_none(),
            "request type {} already has a handler",
            req_type
        );
        self.funcs[req_type as usize] = Some(ReqFunc {
            func: Box::new(func),
            kind,
        });
        self
    }

    #[inline(always)]
    pub(crate) fn get(&self, req_type: ReqType) -> Option<&ReqFunc<Tp>> {
        self.funcs[req_type as usize].as_ref()
    }

    /// Return `true` if any registered handler is background-flagged.
    pub(crate) fn has_background_funcs(&self) -> bool {
        self.funcs
            .iter()
            .flatten()
            .any(|func| func.is_background())
    }
}

impl<Tp: Transport> Default for ReqFuncTable<Tp> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an in-progress request, passed to request handlers.
///
/// Valid only for the duration of the handler call. The handler fills the
/// response buffer (and sets its length); transmission happens after it
/// returns.
pub struct ReqHandle<Tp: Transport> {
    sslot: *mut SSlot<Tp>,
}

impl<Tp: Transport> ReqHandle<Tp> {
    #[inline(always)]
    pub(crate) fn new(sslot: *mut SSlot<Tp>) -> Self {
        Self { sslot }
    }

    /// Return the type of this request.
    #[inline(always)]
    pub fn req_type(&self) -> ReqType {
        // SAFETY: the slot outlives the handler call.
        unsafe { (*self.sslot).req_type }
    }

    /// Return the request buffer.
    #[inline(always)]
    pub fn req_buf(&self) -> &MsgBuf {
        // SAFETY: the slot outlives the handler call, and its rx buffer is
        // set before the handler is invoked.
        unsafe { (*self.sslot).rx_msgbuf.as_ref().unwrap() }
    }

    /// Return the preallocated response buffer.
    ///
    /// This buffer accommodates at most MTU-sized data.
    #[inline(always)]
    pub fn resp_buf(&mut self) -> &mut MsgBuf {
        // SAFETY: the slot outlives the handler call.
        unsafe { (*self.sslot).pre_resp_msgbuf.as_mut().unwrap() }
    }
}

/// Handle to a received response, passed to continuations.
///
/// Dropping the handle releases the response buffer and lets the datapath
/// recycle the window slot, so a continuation must not hold it beyond the
/// response data's useful life.
pub struct RespHandle<Tp: Transport> {
    sslot: *mut SSlot<Tp>,
}

impl<Tp: Transport> RespHandle<Tp> {
    #[inline(always)]
    pub(crate) fn new(sslot: *mut SSlot<Tp>) -> Self {
        Self { sslot }
    }

    /// Return the response buffer.
    #[inline(always)]
    pub fn resp_buf(&self) -> &MsgBuf {
        // SAFETY: the slot's rx buffer stays set until this handle drops.
        unsafe { (*self.sslot).rx_msgbuf.as_ref().unwrap() }
    }
}

impl<Tp: Transport> Drop for RespHandle<Tp> {
    fn drop(&mut self) {
        // SAFETY: the datapath does not recycle the slot before this release.
        unsafe { (*self.sslot).bury_rx() };
    }
}
