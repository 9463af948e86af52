//! Session-management wire format.
//!
//! These datagrams travel over the out-of-band UDP channel and must be
//! preserved bit-exactly for interop across peers: a fixed-size struct of
//! packet type, error type, two pad bytes, then the client and server
//! endpoints. Fields are encoded little-endian at fixed offsets; a
//! self-describing codec would not give the required layout.

use std::fmt;

use crate::error::Error;
use crate::type_alias::*;

/// Maximum hostname length carried in a session endpoint, including NUL padding.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Length of the opaque transport-addressing blob in a session endpoint.
pub const TRANSPORT_BLOB_LEN: usize = 32;

/// Wire length of one encoded [`SessionEndpoint`]:
/// hostname, rpc id, one pad byte, session number, transport blob.
pub const ENDPOINT_WIRE_LEN: usize = MAX_HOSTNAME_LEN + 1 + 1 + 2 + TRANSPORT_BLOB_LEN;

/// Wire length of one encoded [`SessionMgmtPkt`].
pub const SM_PKT_WIRE_LEN: usize = 4 + 2 * ENDPOINT_WIRE_LEN;

/// Session-management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
}

impl SmPktType {
    /// Return `true` for the two request types.
    #[inline]
    pub fn is_req(self) -> bool {
        matches!(self, Self::ConnectReq | Self::DisconnectReq)
    }

    fn from_wire(val: u8) -> Result<Self, Error> {
        match val {
            0 => Ok(Self::ConnectReq),
            1 => Ok(Self::ConnectResp),
            2 => Ok(Self::DisconnectReq),
            3 => Ok(Self::DisconnectResp),
            _ => Err(Error::MalformedSmPkt),
        }
    }
}

/// Session-management error type, carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErrType {
    NoError = 0,
    TooManySessions = 1,
    InvalidRemoteRpcId = 2,
    RoutingResolutionFailure = 3,
}

impl SmErrType {
    fn from_wire(val: u8) -> Result<Self, Error> {
        match val {
            0 => Ok(Self::NoError),
            1 => Ok(Self::TooManySessions),
            2 => Ok(Self::InvalidRemoteRpcId),
            3 => Ok(Self::RoutingResolutionFailure),
            _ => Err(Error::MalformedSmPkt),
        }
    }
}

/// One end of a session: hostname, Rpc id, session number, and the
/// transport's opaque addressing blob.
///
/// Two endpoints compare equal iff all four fields match.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub hostname: [u8; MAX_HOSTNAME_LEN],
    pub rpc_id: RpcId,
    pub sess_num: SessNum,
    pub transport_blob: [u8; TRANSPORT_BLOB_LEN],
}

impl SessionEndpoint {
    /// Build an endpoint with a zeroed transport blob.
    ///
    /// # Panics
    ///
    /// Panic if the hostname does not fit; `Nexus` validates hostnames at
    /// construction, so this indicates a caller bug.
    pub fn new(hostname: &str, rpc_id: RpcId, sess_num: SessNum) -> Self {
        assert!(
            hostname.len() < MAX_HOSTNAME_LEN,
            "hostname {:?} too long for a session endpoint",
            hostname
        );
        let mut buf = [0u8; MAX_HOSTNAME_LEN];
        buf[..hostname.len()].copy_from_slice(hostname.as_bytes());
        Self {
            hostname: buf,
            rpc_id,
            sess_num,
            transport_blob: [0u8; TRANSPORT_BLOB_LEN],
        }
    }

    /// The hostname as a string, NUL padding stripped.
    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_HOSTNAME_LEN);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("<invalid>")
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), ENDPOINT_WIRE_LEN);
        buf[..MAX_HOSTNAME_LEN].copy_from_slice(&self.hostname);
        buf[MAX_HOSTNAME_LEN] = self.rpc_id;
        buf[MAX_HOSTNAME_LEN + 1] = 0;
        buf[MAX_HOSTNAME_LEN + 2..MAX_HOSTNAME_LEN + 4]
            .copy_from_slice(&self.sess_num.to_le_bytes());
        buf[MAX_HOSTNAME_LEN + 4..].copy_from_slice(&self.transport_blob);
    }

    fn decode(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), ENDPOINT_WIRE_LEN);
        let mut hostname = [0u8; MAX_HOSTNAME_LEN];
        hostname.copy_from_slice(&buf[..MAX_HOSTNAME_LEN]);
        let mut transport_blob = [0u8; TRANSPORT_BLOB_LEN];
        transport_blob.copy_from_slice(&buf[MAX_HOSTNAME_LEN + 4..]);
        Self {
            hostname,
            rpc_id: buf[MAX_HOSTNAME_LEN],
            sess_num: SessNum::from_le_bytes([
                buf[MAX_HOSTNAME_LEN + 2],
                buf[MAX_HOSTNAME_LEN + 3],
            ]),
            transport_blob,
        }
    }
}

impl fmt::Debug for SessionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, Rpc {}, session {}]",
            self.hostname_str(),
            self.rpc_id,
            self.sess_num
        )
    }
}

/// A session-management datagram.
///
/// Allocated by the Nexus UDP listener, transferred to the target Rpc's
/// hook, and dropped by the Rpc after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMgmtPkt {
    pub pkt_type: SmPktType,
    pub err_type: SmErrType,
    pub client: SessionEndpoint,
    pub server: SessionEndpoint,
}

impl SessionMgmtPkt {
    /// Encode into the fixed wire layout.
    pub fn to_bytes(&self) -> [u8; SM_PKT_WIRE_LEN] {
        let mut buf = [0u8; SM_PKT_WIRE_LEN];
        buf[0] = self.pkt_type as u8;
        buf[1] = self.err_type as u8;
        self.client.encode(&mut buf[4..4 + ENDPOINT_WIRE_LEN]);
        self.server.encode(&mut buf[4 + ENDPOINT_WIRE_LEN..]);
        buf
    }

    /// Decode from the fixed wire layout. Any other length is malformed.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != SM_PKT_WIRE_LEN {
            return Err(Error::MalformedSmPkt);
        }
        Ok(Self {
            pkt_type: SmPktType::from_wire(buf[0])?,
            err_type: SmErrType::from_wire(buf[1])?,
            client: SessionEndpoint::decode(&buf[4..4 + ENDPOINT_WIRE_LEN]),
            server: SessionEndpoint::decode(&buf[4 + ENDPOINT_WIRE_LEN..]),
        })
    }

    /// Build the response to this request, carrying the given error type.
    ///
    /// Endpoints are copied verbatim, so replaying a request against
    /// unchanged state reproduces the response byte-for-byte.
    pub fn to_response(&self, err_type: SmErrType) -> Self {
        let pkt_type = match self.pkt_type {
            SmPktType::ConnectReq => SmPktType::ConnectResp,
            SmPktType::DisconnectReq => SmPktType::DisconnectResp,
            _ => panic!("cannot respond to a response packet"),
        };
        Self {
            pkt_type,
            err_type,
            client: self.client,
            server: self.server,
        }
    }

    /// The Rpc id this packet should be dispatched to: the server's for
    /// requests, the client's for responses.
    #[inline]
    pub(crate) fn dst_rpc_id(&self) -> RpcId {
        if self.pkt_type.is_req() {
            self.server.rpc_id
        } else {
            self.client.rpc_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pkt() -> SessionMgmtPkt {
        let mut client = SessionEndpoint::new("alpha.example.com", 1, 7);
        client.transport_blob[0] = 0xaa;
        let server = SessionEndpoint::new("beta.example.com", 9, 3);
        SessionMgmtPkt {
            pkt_type: SmPktType::ConnectReq,
            err_type: SmErrType::NoError,
            client,
            server,
        }
    }

    #[test]
    fn wire_len() {
        assert_eq!(ENDPOINT_WIRE_LEN, 100);
        assert_eq!(SM_PKT_WIRE_LEN, 204);
        assert_eq!(sample_pkt().to_bytes().len(), SM_PKT_WIRE_LEN);
    }

    #[test]
    fn roundtrip() {
        let pkt = sample_pkt();
        let decoded = SessionMgmtPkt::from_bytes(&pkt.to_bytes()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn bad_length_rejected() {
        let bytes = sample_pkt().to_bytes();
        assert!(SessionMgmtPkt::from_bytes(&bytes[..SM_PKT_WIRE_LEN - 1]).is_err());
        let mut longer = bytes.to_vec();
        longer.push(0);
        assert!(SessionMgmtPkt::from_bytes(&longer).is_err());
    }

    #[test]
    fn bad_type_rejected() {
        let mut bytes = sample_pkt().to_bytes();
        bytes[0] = 0x7f;
        assert!(SessionMgmtPkt::from_bytes(&bytes).is_err());
    }

    #[test]
    fn response_is_deterministic() {
        let pkt = sample_pkt();
        let r1 = pkt.to_response(SmErrType::NoError);
        let r2 = pkt.to_response(SmErrType::NoError);
        assert_eq!(r1.to_bytes(), r2.to_bytes());
        assert_eq!(r1.pkt_type, SmPktType::ConnectResp);
        assert_eq!(r1.dst_rpc_id(), pkt.client.rpc_id);
    }

    #[test]
    fn endpoint_equality_covers_all_fields() {
        let a = SessionEndpoint::new("host", 1, 2);
        let mut b = a;
        assert_eq!(a, b);
        b.transport_blob[5] = 1;
        assert_ne!(a, b);
    }
}
