use std::sync::Arc;

use crate::nexus::BgWorkItem;
use crate::smpkt::SessionMgmtPkt;
use crate::transport::Transport;
use crate::type_alias::RpcId;
use crate::util::mt_list::MtList;

/// Per-Rpc inbox, returned by hook registration and owned by the Rpc.
///
/// The Nexus keeps only the shared SM packet list under this Rpc id; dropping
/// the hook after unregistration revokes the last cross-thread path into the
/// Rpc.
pub(crate) struct NexusHook<Tp: Transport> {
    /// Id of the owning Rpc.
    pub rpc_id: RpcId,

    /// Session-management packets posted by the Nexus UDP listener.
    pub sm_pkt_list: Arc<MtList<SessionMgmtPkt>>,

    /// One work-item list per background thread, shared with the workers.
    pub bg_lists: Vec<Arc<MtList<BgWorkItem<Tp>>>>,
}
