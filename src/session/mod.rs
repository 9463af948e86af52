mod sslot;

use std::collections::VecDeque;
use std::rc::Rc;

pub(crate) use self::sslot::*;
use crate::handler::ContFunc;
use crate::msgbuf::MsgBuf;
use crate::smpkt::SessionEndpoint;
use crate::transport::Transport;
use crate::type_alias::*;
use crate::util::slab::MsgAllocator;

/// Per-session request window size.
pub(crate) const SESSION_REQ_WINDOW: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRole {
    Client,
    Server,
}

/// Session lifecycle state.
///
/// `ConnectInProgress → Connected → DisconnectInProgress → Disconnected`,
/// with a failure edge `ConnectInProgress → Disconnected`. `Disconnected` is
/// terminal and sessions never move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    ConnectInProgress,
    Connected,
    DisconnectInProgress,
    Disconnected,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (ConnectInProgress, Connected)
                | (ConnectInProgress, Disconnected)
                | (Connected, DisconnectInProgress)
                | (DisconnectInProgress, Disconnected)
        )
    }
}

/// A request waiting for a free window slot.
pub(crate) struct PendingRequest<Tp: Transport> {
    pub req_type: ReqType,
    pub req_msgbuf: MsgBuf,
    pub cont: ContFunc<Tp>,
    pub tag: usize,
    pub cont_in_bg: bool,
}

/// One end of a logical connection between two Rpc endpoints.
pub(crate) struct Session<Tp: Transport> {
    /// Role of this session, immutable after creation.
    role: SessionRole,

    /// Lifecycle state.
    state: SessionState,

    /// Client-side endpoint.
    pub client: SessionEndpoint,

    /// Server-side endpoint.
    pub server: SessionEndpoint,

    /// Resolved remote peer, present once addressing is known.
    pub peer: Option<Tp::Peer>,

    /// Request window.
    pub sslots: [SSlot<Tp>; SESSION_REQ_WINDOW],

    /// Requests waiting for a free slot, admitted in FIFO order.
    pub req_backlog: VecDeque<PendingRequest<Tp>>,

    /// Client-only: suppress the disconnect callback for sessions that were
    /// never successfully connected.
    pub sm_callbacks_disabled: bool,
}

impl<Tp: Transport> Session<Tp> {
    /// Create a new boxed session with its window slots and preallocated
    /// response buffers. The box is what makes slot back-references stable.
    pub fn new(
        role: SessionRole,
        client: SessionEndpoint,
        server: SessionEndpoint,
        allocator: &Rc<MsgAllocator>,
        tp: &mut Tp,
    ) -> Box<Self> {
        let sslots = std::array::from_fn(|i| {
            let buf = allocator.alloc(
                Tp::max_data_per_pkt() + std::mem::size_of::<crate::pkthdr::PacketHeader>(),
                tp,
            );
            SSlot::new(i, MsgBuf::owned(buf, Tp::max_data_per_pkt()))
        });

        let mut session = Box::new(Self {
            role,
            state: SessionState::ConnectInProgress,
            client,
            server,
            peer: None,
            sslots,
            req_backlog: VecDeque::new(),
            sm_callbacks_disabled: false,
        });

        let backref: *mut Session<Tp> = &mut *session;
        for sslot in session.sslots.iter_mut() {
            sslot.session = backref;
        }
        session
    }

    #[inline(always)]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    #[inline(always)]
    pub fn is_server(&self) -> bool {
        self.role == SessionRole::Server
    }

    #[inline(always)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The session number in the owning Rpc's session vector.
    #[inline]
    pub fn local_sess_num(&self) -> SessNum {
        match self.role {
            SessionRole::Client => self.client.sess_num,
            SessionRole::Server => self.server.sess_num,
        }
    }

    /// Advance the lifecycle state machine.
    ///
    /// # Panics
    ///
    /// Panic on any transition not in the state diagram; that is a protocol
    /// handling bug, not an operational condition.
    pub fn advance(&mut self, next: SessionState) {
        assert!(
            self.state.can_advance_to(next),
            "illegal session state transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Return `true` if every slot is at rest and no request is backlogged.
    pub fn is_quiescent(&self) -> bool {
        self.req_backlog.is_empty() && self.sslots.iter().all(|s| s.is_free())
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn legal_transitions() {
        for (from, to) in [
            (ConnectInProgress, Connected),
            (ConnectInProgress, Disconnected),
            (Connected, DisconnectInProgress),
            (DisconnectInProgress, Disconnected),
        ] {
            assert!(from.can_advance_to(to), "{:?} -> {:?}", from, to);
        }
    }

    #[test]
    fn no_backward_or_skipping_transitions() {
        for (from, to) in [
            (Connected, ConnectInProgress),
            (Connected, Disconnected),
            (Disconnected, ConnectInProgress),
            (Disconnected, Connected),
            (DisconnectInProgress, Connected),
            (ConnectInProgress, DisconnectInProgress),
        ] {
            assert!(!from.can_advance_to(to), "{:?} -> {:?}", from, to);
        }
    }
}
