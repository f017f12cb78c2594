#![allow(dead_code)]

use std::sync::Arc;

use verbway::ibverbs::address::{AddressHandleAttribute, GidType};
use verbway::ibverbs::completion::{
    GenericCompletionQueue, WorkCompletion, WorkCompletionOperationType, WorkCompletionStatus,
};
use verbway::ibverbs::device::DeviceList;
use verbway::ibverbs::device_context::{DeviceContext, Mtu};
use verbway::ibverbs::loopback;
use verbway::ibverbs::queue_pair::{QueuePair, QueuePairAttribute, QueuePairState};
use verbway::ibverbs::AccessFlags;

pub fn remote_access() -> AccessFlags {
    AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead | AccessFlags::RemoteAtomic
}

/// Install the loopback provider and open its only device.
pub fn context() -> Arc<DeviceContext> {
    loopback::install().unwrap();
    let devices = DeviceList::new().unwrap();
    devices.get(0).unwrap().open().unwrap()
}

pub fn init_attr() -> QueuePairAttribute {
    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::Init)
        .setup_pkey_index(0)
        .setup_port(1)
        .setup_access_flags(remote_access());
    attr
}

/// RTR towards `dest_qp_num`, routed through the first RoCE v1 entry of the GID table.
pub fn rtr_attr(ctx: &DeviceContext, dest_qp_num: u32) -> QueuePairAttribute {
    let gid_entries = ctx.query_gid_table().unwrap();
    let gid = gid_entries
        .iter()
        .find(|&&gid| !gid.gid().is_unicast_link_local() || gid.gid_type() == GidType::RoceV1)
        .unwrap();

    let mut ah_attr = AddressHandleAttribute::new();
    ah_attr
        .setup_dest_lid(1)
        .setup_port(1)
        .setup_service_level(1)
        .setup_grh_src_gid_index(gid.gid_index().try_into().unwrap())
        .setup_grh_dest_gid(&gid.gid())
        .setup_grh_hop_limit(64);

    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::ReadyToReceive)
        .setup_path_mtu(Mtu::Mtu1024)
        .setup_dest_qp_num(dest_qp_num)
        .setup_rq_psn(1)
        .setup_max_dest_read_atomic(1)
        .setup_min_rnr_timer(0)
        .setup_address_vector(&ah_attr);
    attr
}

pub fn rts_attr() -> QueuePairAttribute {
    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::ReadyToSend)
        .setup_sq_psn(1)
        .setup_timeout(12)
        .setup_retry_cnt(7)
        .setup_rnr_retry(7)
        .setup_max_read_atomic(1);
    attr
}

/// Walk a reliable connection queue pair from RESET to RTS, connected to `dest_qp_num`.
pub fn bring_up<Q: QueuePair>(ctx: &DeviceContext, qp: &mut Q, dest_qp_num: u32) {
    qp.modify(&init_attr()).unwrap();
    qp.modify(&rtr_attr(ctx, dest_qp_num)).unwrap();
    qp.modify(&rts_attr()).unwrap();
    assert_eq!(qp.state(), QueuePairState::ReadyToSend);
}

/// The fields of a completion, copied out of the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub status: WorkCompletionStatus,
    pub opcode: WorkCompletionOperationType,
    pub byte_len: u32,
    pub imm_data: Option<u32>,
    pub qp_num: u32,
    pub timestamp: Option<u64>,
}

/// Drain everything `cq` holds right now.
pub fn drain(cq: &mut GenericCompletionQueue) -> Vec<Completion> {
    let Some(mut poller) = cq.start_poll().unwrap() else {
        return Vec::new();
    };
    let mut completions = Vec::new();
    while let Some(wc) = poller.next() {
        completions.push(Completion {
            wr_id: wc.wr_id(),
            status: wc.status(),
            opcode: wc.opcode(),
            byte_len: wc.byte_len(),
            imm_data: wc.imm_data(),
            qp_num: wc.qp_num(),
            timestamp: wc.completion_timestamp(),
        });
    }
    poller.end();
    completions
}
