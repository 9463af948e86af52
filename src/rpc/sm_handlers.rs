//! Handlers for session-management connect/disconnect requests and responses.
//!
//! Duplicate packets are possible under at-least-once UDP delivery, so every
//! handler is idempotent: replays against unchanged state reproduce the same
//! response (byte-for-byte for requests) or are discarded without effect.

use super::*;

impl<Tp: Transport> Rpc<Tp> {
    /// Drain and dispatch the session-management inbox.
    ///
    /// Runs under the inbox lock: dispatch each packet by type, then free
    /// them all by clearing the list.
    pub(super) fn handle_session_management(&self) {
        let state = &mut *self.state.borrow_mut();

        let mut guard = self.hook.sm_pkt_list.lock();
        for pkt in guard.iter() {
            debug_assert_eq!(pkt.dst_rpc_id(), self.id, "mis-dispatched SM packet");
            // The sender of a packet cannot be this Rpc.
            debug_assert!(
                if pkt.pkt_type.is_req() {
                    pkt.client.rpc_id != self.id
                        || pkt.client.hostname_str() != self.nexus.hostname()
                } else {
                    pkt.server.rpc_id != self.id
                        || pkt.server.hostname_str() != self.nexus.hostname()
                },
                "received an SM packet sent by this Rpc"
            );

            match pkt.pkt_type {
                SmPktType::ConnectReq => self.handle_connect_req(state, pkt),
                SmPktType::ConnectResp => self.handle_connect_resp(state, pkt),
                SmPktType::DisconnectReq => self.handle_disconnect_req(state, pkt),
                SmPktType::DisconnectResp => self.handle_disconnect_resp(state, pkt),
            }
        }
        guard.clear();
    }

    /// Server-side connect request.
    fn handle_connect_req(&self, state: &mut RpcInterior<Tp>, pkt: &SessionMgmtPkt) {
        debug_assert_eq!(pkt.pkt_type, SmPktType::ConnectReq);
        debug_assert_eq!(pkt.server.rpc_id, self.id);
        if pkt.server.hostname_str() != self.nexus.hostname() {
            log::warn!(
                "Rpc {}: ignoring connect request addressed to {:?}",
                self.id,
                pkt.server
            );
            return;
        }

        // A duplicate of an already-handled request: resend the identical
        // success response without touching the session.
        if let Some(session) = state
            .sessions
            .iter()
            .flatten()
            .find(|s| s.is_server() && s.client == pkt.client)
        {
            log::debug!(
                "Rpc {}: duplicate connect request from {:?}, resending response",
                self.id,
                pkt.client
            );
            let resp = SessionMgmtPkt {
                pkt_type: SmPktType::ConnectResp,
                err_type: SmErrType::NoError,
                client: pkt.client,
                server: session.server,
            };
            self.send_sm_pkt(&resp);
            return;
        }

        let free_idx = state.sessions.iter().position(Option::is_none);
        if free_idx.is_none() && state.sessions.len() >= MAX_SESSIONS {
            log::warn!(
                "Rpc {}: refusing connect request from {:?}: too many sessions",
                self.id,
                pkt.client
            );
            self.send_sm_pkt(&pkt.to_response(SmErrType::TooManySessions));
            return;
        }

        let peer = match state.tp.make_peer(&pkt.client.transport_blob) {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!(
                    "Rpc {}: refusing connect request from {:?}: cannot resolve peer: {}",
                    self.id,
                    pkt.client,
                    e
                );
                self.send_sm_pkt(&pkt.to_response(SmErrType::RoutingResolutionFailure));
                return;
            }
        };

        let sess_num = match free_idx {
            Some(idx) => idx,
            None => {
                state.sessions.push(None);
                state.sessions.len() - 1
            }
        } as SessNum;

        let mut server = pkt.server;
        server.sess_num = sess_num;
        server.transport_blob = state.tp.endpoint_blob();

        let mut session = Session::new(
            SessionRole::Server,
            pkt.client,
            server,
            &state.allocator,
            &mut state.tp,
        );
        session.peer = Some(peer);
        session.advance(SessionState::Connected);
        state.sessions[sess_num as usize] = Some(session);

        log::debug!(
            "Rpc {}: session {} connected to client {:?}",
            self.id,
            sess_num,
            pkt.client
        );
        let resp = SessionMgmtPkt {
            pkt_type: SmPktType::ConnectResp,
            err_type: SmErrType::NoError,
            client: pkt.client,
            server,
        };
        self.send_sm_pkt(&resp);
    }

    /// Client-side connect response.
    fn handle_connect_resp(&self, state: &mut RpcInterior<Tp>, pkt: &SessionMgmtPkt) {
        debug_assert_eq!(pkt.pkt_type, SmPktType::ConnectResp);

        let sess_num = pkt.client.sess_num;
        match state.sessions.get(sess_num as usize).and_then(Option::as_ref) {
            None => {
                log::debug!(
                    "Rpc {}: ignoring connect response for non-existent session {}",
                    self.id,
                    sess_num
                );
                return;
            }
            Some(session)
                if !session.is_client() || session.state() != SessionState::ConnectInProgress =>
            {
                log::debug!(
                    "Rpc {}: ignoring connect response for session {} in state {:?}",
                    self.id,
                    sess_num,
                    session.state()
                );
                return;
            }
            Some(_) => {}
        }

        // First response for this session: the connect request is in flight.
        debug_assert!(Self::retryq_contains(state, sess_num));
        Self::retryq_remove(state, sess_num);

        let session = state.sessions[sess_num as usize].as_mut().unwrap();
        let err_type = if pkt.err_type == SmErrType::NoError {
            match state.tp.make_peer(&pkt.server.transport_blob) {
                Ok(peer) => {
                    session.server = pkt.server;
                    session.peer = Some(peer);
                    SmErrType::NoError
                }
                Err(e) => {
                    log::error!(
                        "Rpc {}: session {} accepted by peer but peer is unresolvable: {}",
                        self.id,
                        sess_num,
                        e
                    );
                    SmErrType::RoutingResolutionFailure
                }
            }
        } else {
            log::warn!(
                "Rpc {}: session {} refused by remote peer: {:?}",
                self.id,
                sess_num,
                pkt.err_type
            );
            pkt.err_type
        };

        if err_type == SmErrType::NoError {
            session.advance(SessionState::Connected);
            (self.sm_handler)(sess_num, SmEventType::Connected, SmErrType::NoError, self.context);
        } else {
            session.advance(SessionState::Disconnected);
            (self.sm_handler)(sess_num, SmEventType::ConnectFailed, err_type, self.context);
            self.bury_session(state, sess_num);
        }
    }

    /// Server-side disconnect request.
    ///
    /// The session has been idle since the client sent the request: the
    /// client received responses for all outstanding requests, so no slot
    /// locking is needed.
    fn handle_disconnect_req(&self, state: &mut RpcInterior<Tp>, pkt: &SessionMgmtPkt) {
        debug_assert_eq!(pkt.pkt_type, SmPktType::DisconnectReq);
        debug_assert_eq!(pkt.server.rpc_id, self.id);
        debug_assert_eq!(pkt.server.hostname_str(), self.nexus.hostname());

        let sess_num = pkt.server.sess_num;
        let session = state
            .sessions
            .get(sess_num as usize)
            .and_then(Option::as_ref);
        let Some(session) = session else {
            // Already disconnected; the response was lost. Resend it.
            log::debug!(
                "Rpc {}: duplicate disconnect request for session {}, resending response",
                self.id,
                sess_num
            );
            self.send_sm_pkt(&pkt.to_response(SmErrType::NoError));
            return;
        };

        // A live session should match the endpoints the client knows. Under
        // at-least-once delivery a stale request can land on a slot that was
        // recycled by an unrelated session; absorb it like a duplicate.
        if session.is_client() || session.server != pkt.server || session.client != pkt.client {
            debug_assert!(false, "disconnect request endpoint mismatch");
            log::warn!(
                "Rpc {}: ignoring disconnect request with mismatched endpoints for session {}",
                self.id,
                sess_num
            );
            return;
        }

        // Responses for all slots should have been sent by now.
        if session
            .sslots
            .iter()
            .any(|s| s.rx_msgbuf.is_some() || s.tx_msgbuf.is_some())
        {
            debug_assert!(false, "disconnect request for a session with active slots");
            log::warn!(
                "Rpc {}: ignoring disconnect request for busy session {}",
                self.id,
                sess_num
            );
            return;
        }

        log::debug!("Rpc {}: session {} disconnected by client", self.id, sess_num);
        self.send_sm_pkt(&pkt.to_response(SmErrType::NoError));
        self.bury_session(state, sess_num);
    }

    /// Client-side disconnect response.
    ///
    /// No slot locking needed: the session has been idle since the
    /// disconnect request was sent.
    fn handle_disconnect_resp(&self, state: &mut RpcInterior<Tp>, pkt: &SessionMgmtPkt) {
        debug_assert_eq!(pkt.pkt_type, SmPktType::DisconnectResp);

        let sess_num = pkt.client.sess_num;
        let Some(session) = state
            .sessions
            .get_mut(sess_num as usize)
            .and_then(Option::as_mut)
        else {
            // Duplicate response; the session is gone and the callback must
            // not fire again.
            debug_assert!(!Self::retryq_contains(state, sess_num));
            log::debug!(
                "Rpc {}: ignoring disconnect response for disconnected session {}",
                self.id,
                sess_num
            );
            return;
        };

        // A first disconnect response finds the session disconnecting, with
        // matching endpoints. A stale response can land on a slot that was
        // recycled by an unrelated session; discard it like the empty-slot
        // duplicate above.
        if session.state() != SessionState::DisconnectInProgress
            || session.server != pkt.server
            || session.client != pkt.client
        {
            debug_assert!(false, "disconnect response for a session not disconnecting");
            log::debug!(
                "Rpc {}: ignoring stale disconnect response for session {}",
                self.id,
                sess_num
            );
            return;
        }

        // Disconnects cannot fail.
        if pkt.err_type != SmErrType::NoError {
            debug_assert!(false, "disconnect response carrying an error");
            log::warn!(
                "Rpc {}: ignoring disconnect response with error {:?} for session {}",
                self.id,
                pkt.err_type,
                sess_num
            );
            return;
        }

        debug_assert!(Self::retryq_contains(state, sess_num));
        Self::retryq_remove(state, sess_num);

        let session = state.sessions[sess_num as usize].as_mut().unwrap();
        session.advance(SessionState::Disconnected);

        if !session.sm_callbacks_disabled {
            log::debug!("Rpc {}: session {} disconnected", self.id, sess_num);
            (self.sm_handler)(
                sess_num,
                SmEventType::Disconnected,
                SmErrType::NoError,
                self.context,
            );
        } else {
            log::debug!(
                "Rpc {}: session {} disconnected; callback disabled because the \
                 session was never connected successfully",
                self.id,
                sess_num
            );
        }
        self.bury_session(state, sess_num);
    }
}
