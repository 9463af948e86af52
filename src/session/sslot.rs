use crate::handler::ContFunc;
use crate::msgbuf::MsgBuf;
use crate::session::Session;
use crate::transport::Transport;
use crate::type_alias::*;

/// Client-side state saved between sending a request and running its
/// continuation.
pub(crate) struct ClientSaveInfo<Tp: Transport> {
    /// Saved continuation, taken exactly once when invoked.
    pub cont: Option<ContFunc<Tp>>,

    /// Opaque tag passed back to the continuation.
    pub tag: usize,

    /// Run the continuation on a background thread.
    pub cont_in_bg: bool,
}

/// A per-request window entry of a session.
pub(crate) struct SSlot<Tp: Transport> {
    /// Back-reference to the owning session. Stable because sessions are
    /// heap-boxed; set right after boxing.
    pub session: *mut Session<Tp>,

    /// Received request (server) or response (client) being processed.
    pub rx_msgbuf: Option<MsgBuf>,

    /// In-flight transmit buffer. `None` whenever the slot is at rest.
    pub tx_msgbuf: Option<MsgBuf>,

    /// Preallocated MTU-sized response buffer, released when the session is
    /// buried.
    pub pre_resp_msgbuf: Option<MsgBuf>,

    /// Request type of the current occupant.
    pub req_type: ReqType,

    /// Request index of the current occupant; advances by the window size on
    /// reuse, so `req_idx % W` identifies the slot.
    pub req_idx: ReqIdx,

    /// Client-only saved continuation state.
    pub clt_save: ClientSaveInfo<Tp>,
}

impl<Tp: Transport> SSlot<Tp> {
    pub(super) fn new(slot_idx: usize, pre_resp_msgbuf: MsgBuf) -> Self {
        Self {
            session: std::ptr::null_mut(),
            rx_msgbuf: None,
            tx_msgbuf: None,
            pre_resp_msgbuf: Some(pre_resp_msgbuf),
            req_type: 0,
            req_idx: slot_idx as ReqIdx,
            clt_save: ClientSaveInfo {
                cont: None,
                tag: 0,
                cont_in_bg: false,
            },
        }
    }

    /// Return `true` if the slot has no outstanding request.
    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.tx_msgbuf.is_none() && self.rx_msgbuf.is_none() && self.clt_save.cont.is_none()
    }

    /// Release the receive buffer, making the slot reusable once the
    /// transmit side is also clear.
    #[inline]
    pub fn bury_rx(&mut self) {
        self.rx_msgbuf = None;
    }
}
