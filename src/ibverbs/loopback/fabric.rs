//! State shared by every loopback object, and the engine that executes work requests.
use std::collections::{HashMap, VecDeque};
use std::ffi::c_int;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::slice;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

use rdma_mummy_sys::{
    ibv_qp, ibv_qp_attr, ibv_qp_cap, ibv_qp_state, ibv_qp_type, ibv_send_flags, ibv_sge, ibv_wc_flags, ibv_wc_opcode,
    ibv_wc_status,
};

use super::GID_TABLE;
use crate::ibverbs::qp_state::{check_transition, QueuePairAttributeMask as Mask, QueuePairState};
use crate::ibverbs::queue_pair::{QueuePairType, SendOperationFlags};
use crate::ibverbs::AccessFlags;

/// Receive buffers of datagram queue pairs start with room for the global routing header.
pub(super) const GRH_LEN: usize = 40;

const SIGNALED: u32 = ibv_send_flags::IBV_SEND_SIGNALED.0 as u32;
const WITH_IMM: u32 = ibv_wc_flags::IBV_WC_WITH_IMM.0 as u32;
const WITH_GRH: u32 = ibv_wc_flags::IBV_WC_GRH.0 as u32;

static FABRIC: LazyLock<Mutex<Fabric>> = LazyLock::new(Default::default);
static CLOCK: LazyLock<quanta::Clock> = LazyLock::new(quanta::Clock::new);

pub(super) fn fabric() -> MutexGuard<'static, Fabric> {
    FABRIC.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered memory region, addressed by its IOVA.
pub(super) struct Region {
    pub(super) pd: usize,
    pub(super) addr: usize,
    pub(super) len: usize,
    pub(super) iova: u64,
    pub(super) access: AccessFlags,
}

impl Region {
    fn host(&self, addr: u64, len: usize) -> Option<*mut u8> {
        let offset = usize::try_from(addr.checked_sub(self.iova)?).ok()?;
        (offset.checked_add(len)? <= self.len).then_some((self.addr + offset) as *mut u8)
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Cqe {
    pub(super) wr_id: u64,
    pub(super) status: u32,
    pub(super) opcode: u32,
    pub(super) byte_len: u32,
    /// Network byte order, as carried on the wire.
    pub(super) imm_data: u32,
    pub(super) flags: u32,
    pub(super) qp_num: u32,
    pub(super) src_qp: u32,
    pub(super) timestamp: u64,
    /// Send queue sequence number this entry frees up to once it is consumed.
    retires: Option<(u32, u64)>,
}

impl Cqe {
    pub(super) fn vendor_err(&self) -> u32 {
        // mlx5 syndromes, so logs look familiar
        match self.status {
            ibv_wc_status::IBV_WC_SUCCESS => 0,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => 0x01,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => 0x04,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => 0x05,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => 0x12,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => 0x13,
            ibv_wc_status::IBV_WC_REM_OP_ERR => 0x14,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => 0x15,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => 0x16,
            _ => 0x22,
        }
    }
}

/// A completion queue: entries not yet consumed, and the one an extended poll is looking at.
pub(super) struct Ring {
    pub(super) context: usize,
    pub(super) timestamps: bool,
    entries: VecDeque<Cqe>,
    pub(super) current: Option<Cqe>,
}

impl Ring {
    pub(super) fn new(context: usize, timestamps: bool) -> Self {
        Ring {
            context,
            timestamps,
            entries: VecDeque::new(),
            current: None,
        }
    }
}

pub(super) enum Operation {
    Send { imm: Option<u32> },
    Write { rkey: u32, remote_addr: u64, imm: Option<u32> },
    Read { rkey: u32, remote_addr: u64 },
    CompareSwap { rkey: u32, remote_addr: u64, compare: u64, swap: u64 },
    FetchAdd { rkey: u32, remote_addr: u64, add: u64 },
    Unsupported,
}

impl Operation {
    fn opcode(&self) -> u32 {
        match self {
            Operation::Send { .. } | Operation::Unsupported => ibv_wc_opcode::IBV_WC_SEND,
            Operation::Write { .. } => ibv_wc_opcode::IBV_WC_RDMA_WRITE,
            Operation::Read { .. } => ibv_wc_opcode::IBV_WC_RDMA_READ,
            Operation::CompareSwap { .. } => ibv_wc_opcode::IBV_WC_COMP_SWAP,
            Operation::FetchAdd { .. } => ibv_wc_opcode::IBV_WC_FETCH_ADD,
        }
    }

    fn send_op(&self) -> SendOperationFlags {
        match self {
            Operation::Send { imm: None } => SendOperationFlags::Send,
            Operation::Send { imm: Some(_) } => SendOperationFlags::SendWithImmediate,
            Operation::Write { imm: None, .. } => SendOperationFlags::Write,
            Operation::Write { imm: Some(_), .. } => SendOperationFlags::WriteWithImmediate,
            Operation::Read { .. } => SendOperationFlags::Read,
            Operation::CompareSwap { .. } => SendOperationFlags::AtomicCompareAndSwap,
            Operation::FetchAdd { .. } => SendOperationFlags::AtomicFetchAndAdd,
            Operation::Unsupported => SendOperationFlags::none(),
        }
    }
}

pub(super) enum Payload {
    Gather(Vec<ibv_sge>),
    Inline(Vec<u8>),
}

pub(super) struct Datagram {
    pub(super) remote_qpn: u32,
    pub(super) remote_qkey: u32,
}

pub(super) struct WorkRequest {
    pub(super) wr_id: u64,
    pub(super) flags: u32,
    pub(super) op: Operation,
    pub(super) payload: Payload,
    pub(super) ud: Option<Datagram>,
}

pub(super) struct RecvRequest {
    pub(super) wr_id: u64,
    pub(super) sges: Vec<ibv_sge>,
}

/// The emulated side of a queue pair.
pub(super) struct Endpoint {
    pub(super) raw: usize,
    pub(super) pd: usize,
    pub(super) qp_type: u32,
    pub(super) send_cq: usize,
    pub(super) recv_cq: usize,
    pub(super) cap: ibv_qp_cap,
    pub(super) sq_sig_all: bool,
    /// Operations enabled for `ibv_wr_*` construction, `None` for queue pairs created classically.
    pub(super) send_ops: Option<SendOperationFlags>,
    pub(super) attr: ibv_qp_attr,
    recv_queue: VecDeque<RecvRequest>,
    sq_posted: u64,
    sq_retired: u64,
    pub(super) batch: Vec<WorkRequest>,
    pub(super) submission_calls: u64,
    pub(super) modify_calls: u64,
}

impl Endpoint {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        raw: *mut ibv_qp, pd: usize, qp_type: u32, send_cq: usize, recv_cq: usize, cap: ibv_qp_cap, sq_sig_all: bool,
        send_ops: Option<SendOperationFlags>,
    ) -> Self {
        Endpoint {
            raw: raw as usize,
            pd,
            qp_type,
            send_cq,
            recv_cq,
            cap,
            sq_sig_all,
            send_ops,
            attr: reset_attr(),
            recv_queue: VecDeque::new(),
            sq_posted: 0,
            sq_retired: 0,
            batch: Vec::new(),
            submission_calls: 0,
            modify_calls: 0,
        }
    }

    pub(super) fn state(&self) -> QueuePairState {
        QueuePairState::from(self.attr.qp_state)
    }

    fn reliable(&self) -> bool {
        self.qp_type == ibv_qp_type::IBV_QPT_RC
    }

    fn receiving(&self) -> bool {
        matches!(
            self.state(),
            QueuePairState::ReadyToReceive | QueuePairState::ReadyToSend | QueuePairState::SendQueueDrain
        )
    }

    /// Checks done synchronously by `ibv_post_send`, `staged` requests of the same batch are
    /// ahead of `wr`.
    fn admit(&self, wr: &WorkRequest, staged: usize) -> Result<(), c_int> {
        match self.state() {
            QueuePairState::ReadyToSend | QueuePairState::SendQueueDrain | QueuePairState::Error => {},
            _ => return Err(libc::EINVAL),
        }
        if self.sq_posted - self.sq_retired + staged as u64 >= u64::from(self.cap.max_send_wr) {
            return Err(libc::ENOMEM);
        }
        match &wr.payload {
            Payload::Gather(sges) if sges.len() > self.cap.max_send_sge as usize => return Err(libc::EINVAL),
            Payload::Inline(data)
                if data.len() > self.cap.max_inline_data as usize
                    || !matches!(wr.op, Operation::Send { .. } | Operation::Write { .. }) =>
            {
                return Err(libc::EINVAL)
            },
            _ => {},
        }
        let allowed = match self.qp_type {
            ibv_qp_type::IBV_QPT_RC => !matches!(wr.op, Operation::Unsupported),
            ibv_qp_type::IBV_QPT_UC => matches!(wr.op, Operation::Send { .. } | Operation::Write { .. }),
            ibv_qp_type::IBV_QPT_UD => matches!(wr.op, Operation::Send { .. }) && wr.ud.is_some(),
            _ => false,
        };
        if !allowed {
            return Err(libc::EINVAL);
        }
        if let Some(send_ops) = self.send_ops {
            if !send_ops.contains(wr.op.send_op()) {
                return Err(libc::EINVAL);
            }
        }
        Ok(())
    }

    fn apply(&mut self, attr: &ibv_qp_attr, mask: Mask) {
        let own = &mut self.attr;
        if mask.contains(Mask::AccessFlags) {
            own.qp_access_flags = attr.qp_access_flags;
        }
        if mask.contains(Mask::PartitionKeyIndex) {
            own.pkey_index = attr.pkey_index;
        }
        if mask.contains(Mask::Port) {
            own.port_num = attr.port_num;
        }
        if mask.contains(Mask::QueueKey) {
            own.qkey = attr.qkey;
        }
        if mask.contains(Mask::AddressVector) {
            own.ah_attr = attr.ah_attr;
        }
        if mask.contains(Mask::PathMtu) {
            own.path_mtu = attr.path_mtu;
        }
        if mask.contains(Mask::Timeout) {
            own.timeout = attr.timeout;
        }
        if mask.contains(Mask::RetryCount) {
            own.retry_cnt = attr.retry_cnt;
        }
        if mask.contains(Mask::ResponderNotReadyRetryCount) {
            own.rnr_retry = attr.rnr_retry;
        }
        if mask.contains(Mask::ReceiveQueuePacketSequenceNumber) {
            own.rq_psn = attr.rq_psn;
        }
        if mask.contains(Mask::SendQueuePacketSequenceNumber) {
            own.sq_psn = attr.sq_psn;
        }
        if mask.contains(Mask::MaxReadAtomic) {
            own.max_rd_atomic = attr.max_rd_atomic;
        }
        if mask.contains(Mask::MaxDestinationReadAtomic) {
            own.max_dest_rd_atomic = attr.max_dest_rd_atomic;
        }
        if mask.contains(Mask::MinResponderNotReadyTimer) {
            own.min_rnr_timer = attr.min_rnr_timer;
        }
        if mask.contains(Mask::DestinationQueuePairNumber) {
            own.dest_qp_num = attr.dest_qp_num;
        }
    }

    /// Mirror the state into the `ibv_qp` the application reads it from.
    fn publish_state(&self) {
        unsafe { (*(self.raw as *mut ibv_qp)).state = self.attr.qp_state };
    }
}

fn reset_attr() -> ibv_qp_attr {
    let mut attr: ibv_qp_attr = unsafe { MaybeUninit::zeroed().assume_init() };
    attr.qp_state = ibv_qp_state::IBV_QPS_RESET;
    attr
}

/// Whether an RTR path from GID `sgid_index` to `dgid` can be resolved on the loopback port.
pub(super) fn route_resolves(sgid_index: u8, dgid: [u8; 16]) -> bool {
    usize::from(sgid_index) < GID_TABLE.len() && GID_TABLE.contains(&dgid)
}

#[derive(Default)]
pub(super) struct Fabric {
    serial: u32,
    /// Protection domain to context.
    pub(super) domains: HashMap<usize, usize>,
    /// Keyed by lkey, which is also the rkey.
    pub(super) regions: HashMap<u32, Region>,
    pub(super) endpoints: HashMap<u32, Endpoint>,
    pub(super) rings: HashMap<usize, Ring>,
    /// Address handle to protection domain.
    pub(super) handles: HashMap<usize, usize>,
}

impl Fabric {
    /// Handles, keys and queue pair numbers all come from one counter.
    pub(super) fn next_serial(&mut self) -> u32 {
        self.serial += 1;
        // QP0 and QP1 are reserved
        0x100 + self.serial
    }

    pub(super) fn context_busy(&self, context: usize) -> bool {
        self.domains.values().any(|&ctx| ctx == context) || self.rings.values().any(|ring| ring.context == context)
    }

    pub(super) fn domain_busy(&self, pd: usize) -> bool {
        self.regions.values().any(|region| region.pd == pd)
            || self.endpoints.values().any(|qp| qp.pd == pd)
            || self.handles.values().any(|&owner| owner == pd)
    }

    pub(super) fn ring_busy(&self, cq: usize) -> bool {
        self.endpoints.values().any(|qp| qp.send_cq == cq || qp.recv_cq == cq)
    }

    pub(super) fn count_submission(&mut self, qp_num: u32) {
        if let Some(qp) = self.endpoints.get_mut(&qp_num) {
            qp.submission_calls += 1;
        }
    }

    pub(super) fn modify(&mut self, qp_num: u32, attr: &ibv_qp_attr, mask: c_int) -> c_int {
        let Some(qp) = self.endpoints.get_mut(&qp_num) else {
            return libc::EINVAL;
        };
        qp.modify_calls += 1;

        let mask = Mask { bits: mask };
        let cur = qp.state();
        let next = if mask.contains(Mask::State) {
            QueuePairState::from(attr.qp_state)
        } else {
            cur
        };
        if check_transition(QueuePairType::from(qp.qp_type), cur, next, mask).is_err() {
            return libc::EINVAL;
        }
        if mask.contains(Mask::Port) && attr.port_num != super::PORT_NUM {
            return libc::EINVAL;
        }
        if mask.contains(Mask::AddressVector) {
            let ah_attr = &attr.ah_attr;
            if ah_attr.is_global == 0 {
                return libc::EINVAL;
            }
            if !route_resolves(ah_attr.grh.sgid_index, unsafe { ah_attr.grh.dgid.raw }) {
                return libc::ETIMEDOUT;
            }
        }

        if next == QueuePairState::Reset {
            qp.attr = reset_attr();
            qp.recv_queue.clear();
            qp.batch.clear();
            qp.sq_retired = qp.sq_posted;
        } else {
            qp.apply(attr, mask);
            qp.attr.qp_state = next as u32;
        }
        qp.publish_state();
        if next == QueuePairState::Error {
            self.flush_receives(qp_num);
        }
        0
    }

    pub(super) fn query(&self, qp_num: u32) -> Option<&Endpoint> {
        let qp = self.endpoints.get(&qp_num)?;
        qp.publish_state();
        Some(qp)
    }

    pub(super) fn receive(&mut self, qp_num: u32, recv: RecvRequest) -> Result<(), c_int> {
        let qp = self.endpoints.get_mut(&qp_num).ok_or(libc::EINVAL)?;
        match qp.state() {
            QueuePairState::Reset => return Err(libc::EINVAL),
            QueuePairState::Error => {
                let recv_cq = qp.recv_cq;
                self.push(recv_cq, flushed(qp_num, recv.wr_id));
                return Ok(());
            },
            _ => {},
        }
        if recv.sges.len() > qp.cap.max_recv_sge as usize {
            return Err(libc::EINVAL);
        }
        if qp.recv_queue.len() >= qp.cap.max_recv_wr as usize {
            return Err(libc::ENOMEM);
        }
        qp.recv_queue.push_back(recv);
        Ok(())
    }

    /// Admit and execute one request of an `ibv_post_send` chain.
    pub(super) fn submit(&mut self, qp_num: u32, wr: WorkRequest) -> Result<(), c_int> {
        self.endpoints.get(&qp_num).ok_or(libc::EINVAL)?.admit(&wr, 0)?;
        self.execute(qp_num, wr);
        Ok(())
    }

    /// `ibv_wr_complete`: the staged batch is admitted as a whole or not at all.
    pub(super) fn commit(&mut self, qp_num: u32) -> c_int {
        let Some(qp) = self.endpoints.get_mut(&qp_num) else {
            return libc::EINVAL;
        };
        qp.submission_calls += 1;
        let batch = mem::take(&mut qp.batch);
        for (staged, wr) in batch.iter().enumerate() {
            if let Err(errno) = qp.admit(wr, staged) {
                return errno;
            }
        }
        for wr in batch {
            self.execute(qp_num, wr);
        }
        0
    }

    pub(super) fn push(&mut self, cq: usize, mut cqe: Cqe) {
        if let Some(ring) = self.rings.get_mut(&cq) {
            if ring.timestamps {
                cqe.timestamp = CLOCK.raw();
            }
            ring.entries.push_back(cqe);
        }
    }

    /// Consume the oldest entry of `cq`, freeing the send queue slots it covers.
    pub(super) fn take(&mut self, cq: usize) -> Option<Cqe> {
        let cqe = self.rings.get_mut(&cq)?.entries.pop_front()?;
        if let Some((qp_num, seq)) = cqe.retires {
            if let Some(qp) = self.endpoints.get_mut(&qp_num) {
                qp.sq_retired = qp.sq_retired.max(seq);
            }
        }
        Some(cqe)
    }

    fn execute(&mut self, qp_num: u32, wr: WorkRequest) {
        let Some(qp) = self.endpoints.get_mut(&qp_num) else {
            return;
        };
        qp.sq_posted += 1;
        let seq = qp.sq_posted;
        let signaled = qp.sq_sig_all || wr.flags & SIGNALED != 0;
        let in_error = qp.state() == QueuePairState::Error;
        let send_cq = qp.send_cq;

        let outcome = if in_error {
            Err(ibv_wc_status::IBV_WC_WR_FLUSH_ERR)
        } else {
            self.transfer(qp_num, &wr)
        };
        let (status, byte_len) = match outcome {
            Ok(byte_len) => (ibv_wc_status::IBV_WC_SUCCESS, byte_len),
            Err(status) => (status, 0),
        };
        if signaled || status != ibv_wc_status::IBV_WC_SUCCESS {
            self.push(
                send_cq,
                Cqe {
                    wr_id: wr.wr_id,
                    status,
                    opcode: wr.op.opcode(),
                    byte_len,
                    imm_data: 0,
                    flags: 0,
                    qp_num,
                    src_qp: 0,
                    timestamp: 0,
                    retires: Some((qp_num, seq)),
                },
            );
        }
        if status != ibv_wc_status::IBV_WC_SUCCESS && !in_error {
            self.fail(qp_num);
        }
    }

    fn transfer(&mut self, qp_num: u32, wr: &WorkRequest) -> Result<u32, u32> {
        let qp = &self.endpoints[&qp_num];
        let (pd, reliable) = (qp.pd, qp.reliable());

        match wr.op {
            Operation::Send { imm } => {
                let data = self.gather(pd, &wr.payload)?;
                match self.peer(qp_num, wr.ud.as_ref()) {
                    Some(peer) => self.arrive(qp_num, peer, Some(&data), data.len(), imm)?,
                    None if reliable => return Err(ibv_wc_status::IBV_WC_RETRY_EXC_ERR),
                    None => {},
                }
                Ok(data.len() as u32)
            },
            Operation::Write { rkey, remote_addr, imm } => {
                let data = self.gather(pd, &wr.payload)?;
                let Some(peer) = self.peer(qp_num, None) else {
                    return if reliable {
                        Err(ibv_wc_status::IBV_WC_RETRY_EXC_ERR)
                    } else {
                        Ok(data.len() as u32)
                    };
                };
                match self.remote(peer, rkey, remote_addr, data.len(), AccessFlags::RemoteWrite) {
                    Ok(dst) if !data.is_empty() => unsafe { ptr::copy(data.as_ptr(), dst, data.len()) },
                    Ok(_) => {},
                    Err(status) if reliable => return Err(status),
                    // UC drops what it cannot place
                    Err(_) => return Ok(data.len() as u32),
                }
                if imm.is_some() {
                    self.arrive(qp_num, peer, None, data.len(), imm)?;
                }
                Ok(data.len() as u32)
            },
            Operation::Read { rkey, remote_addr } => {
                let Payload::Gather(sges) = &wr.payload else {
                    return Err(ibv_wc_status::IBV_WC_LOC_QP_OP_ERR);
                };
                let len = sges.iter().map(|sge| sge.length as usize).sum::<usize>();
                let peer = self.peer(qp_num, None).ok_or(ibv_wc_status::IBV_WC_RETRY_EXC_ERR)?;
                let src = self.remote(peer, rkey, remote_addr, len, AccessFlags::RemoteRead)?;
                let data = if len == 0 {
                    Vec::new()
                } else {
                    unsafe { slice::from_raw_parts(src, len) }.to_vec()
                };
                self.scatter(pd, sges, 0, &data)?;
                Ok(len as u32)
            },
            Operation::CompareSwap {
                rkey,
                remote_addr,
                compare,
                swap,
            } => self.atomic(qp_num, wr, rkey, remote_addr, |old| if old == compare { swap } else { old }),
            Operation::FetchAdd { rkey, remote_addr, add } => {
                self.atomic(qp_num, wr, rkey, remote_addr, |old| old.wrapping_add(add))
            },
            Operation::Unsupported => Err(ibv_wc_status::IBV_WC_LOC_QP_OP_ERR),
        }
    }

    fn atomic(
        &mut self, qp_num: u32, wr: &WorkRequest, rkey: u32, remote_addr: u64, update: impl FnOnce(u64) -> u64,
    ) -> Result<u32, u32> {
        let pd = self.endpoints[&qp_num].pd;
        let Payload::Gather(sges) = &wr.payload else {
            return Err(ibv_wc_status::IBV_WC_LOC_QP_OP_ERR);
        };
        if sges.iter().map(|sge| sge.length as usize).sum::<usize>() != mem::size_of::<u64>() {
            return Err(ibv_wc_status::IBV_WC_LOC_LEN_ERR);
        }
        if remote_addr % 8 != 0 {
            return Err(ibv_wc_status::IBV_WC_REM_INV_REQ_ERR);
        }
        let peer = self.peer(qp_num, None).ok_or(ibv_wc_status::IBV_WC_RETRY_EXC_ERR)?;
        let dst = self
            .remote(peer, rkey, remote_addr, mem::size_of::<u64>(), AccessFlags::RemoteAtomic)?
            .cast::<u64>();
        let old = unsafe { dst.read_unaligned() };
        unsafe { dst.write_unaligned(update(old)) };
        self.scatter(pd, sges, 0, &old.to_ne_bytes())?;
        Ok(mem::size_of::<u64>() as u32)
    }

    /// The queue pair a request of `qp_num` lands on, if it exists and is able to receive.
    fn peer(&self, qp_num: u32, ud: Option<&Datagram>) -> Option<u32> {
        let qp = &self.endpoints[&qp_num];
        let peer_num = match ud {
            Some(ud) => ud.remote_qpn,
            None => qp.attr.dest_qp_num,
        };
        let peer = self.endpoints.get(&peer_num)?;
        let qkey_matches = ud.map_or(true, |ud| ud.remote_qkey == peer.attr.qkey);
        (peer.qp_type == qp.qp_type && peer.receiving() && qkey_matches).then_some(peer_num)
    }

    /// Consume a receive request of `peer` for a message of `byte_len` bytes, scattering `data`
    /// into it unless the payload was already placed by an RDMA write.
    fn arrive(
        &mut self, sender: u32, peer: u32, data: Option<&[u8]>, byte_len: usize, imm: Option<u32>,
    ) -> Result<(), u32> {
        let target = self.endpoints.get_mut(&peer).ok_or(ibv_wc_status::IBV_WC_RETRY_EXC_ERR)?;
        let reliable = target.reliable();
        let Some(recv) = target.recv_queue.pop_front() else {
            return if reliable {
                Err(ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR)
            } else {
                Ok(())
            };
        };
        let (pd, recv_cq, datagram) = (target.pd, target.recv_cq, target.qp_type == ibv_qp_type::IBV_QPT_UD);
        let skip = if datagram { GRH_LEN } else { 0 };

        let placed = match data {
            Some(data) => self.scatter(pd, &recv.sges, skip, data),
            None => Ok(()),
        };
        let mut flags = if imm.is_some() { WITH_IMM } else { 0 };
        if datagram {
            flags |= WITH_GRH;
        }
        let opcode = if data.is_some() {
            ibv_wc_opcode::IBV_WC_RECV
        } else {
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM
        };
        let status = match placed {
            Ok(()) => ibv_wc_status::IBV_WC_SUCCESS,
            Err(status) => status,
        };
        self.push(
            recv_cq,
            Cqe {
                wr_id: recv.wr_id,
                status,
                opcode,
                byte_len: (skip + byte_len) as u32,
                imm_data: imm.unwrap_or(0),
                flags,
                qp_num: peer,
                src_qp: sender,
                timestamp: 0,
                retires: None,
            },
        );

        match placed {
            Ok(()) => Ok(()),
            Err(status) => {
                self.fail(peer);
                match status {
                    _ if !reliable => Ok(()),
                    ibv_wc_status::IBV_WC_LOC_LEN_ERR => Err(ibv_wc_status::IBV_WC_REM_INV_REQ_ERR),
                    _ => Err(ibv_wc_status::IBV_WC_REM_OP_ERR),
                }
            },
        }
    }

    fn gather(&self, pd: usize, payload: &Payload) -> Result<Vec<u8>, u32> {
        match payload {
            Payload::Inline(data) => Ok(data.clone()),
            Payload::Gather(sges) => {
                let mut data = Vec::with_capacity(sges.iter().map(|sge| sge.length as usize).sum());
                for sge in sges.iter().filter(|sge| sge.length > 0) {
                    let src = self.local(pd, sge, AccessFlags::none())?;
                    data.extend_from_slice(unsafe { slice::from_raw_parts(src, sge.length as usize) });
                }
                Ok(data)
            },
        }
    }

    fn scatter(&self, pd: usize, sges: &[ibv_sge], skip: usize, data: &[u8]) -> Result<(), u32> {
        let capacity = sges.iter().map(|sge| sge.length as usize).sum::<usize>();
        if skip + data.len() > capacity {
            return Err(ibv_wc_status::IBV_WC_LOC_LEN_ERR);
        }
        let targets = sges
            .iter()
            .filter(|sge| sge.length > 0)
            .map(|sge| Ok((self.local(pd, sge, AccessFlags::LocalWrite)?, sge.length as usize)))
            .collect::<Result<Vec<_>, u32>>()?;

        let (mut skip, mut data) = (skip, data);
        for (dst, len) in targets {
            if data.is_empty() {
                break;
            }
            if skip >= len {
                skip -= len;
                continue;
            }
            let count = (len - skip).min(data.len());
            unsafe { ptr::copy(data.as_ptr(), dst.add(skip), count) };
            data = &data[count..];
            skip = 0;
        }
        Ok(())
    }

    fn local(&self, pd: usize, sge: &ibv_sge, need: AccessFlags) -> Result<*mut u8, u32> {
        self.regions
            .get(&sge.lkey)
            .filter(|region| region.pd == pd && region.access.contains(need))
            .and_then(|region| region.host(sge.addr, sge.length as usize))
            .ok_or(ibv_wc_status::IBV_WC_LOC_PROT_ERR)
    }

    fn remote(&self, peer: u32, rkey: u32, addr: u64, len: usize, need: AccessFlags) -> Result<*mut u8, u32> {
        let target = &self.endpoints[&peer];
        if !AccessFlags::from(target.attr.qp_access_flags as i32).contains(need) {
            return Err(ibv_wc_status::IBV_WC_REM_ACCESS_ERR);
        }
        self.regions
            .get(&rkey)
            .filter(|region| region.pd == target.pd && region.access.contains(need))
            .and_then(|region| region.host(addr, len))
            .ok_or(ibv_wc_status::IBV_WC_REM_ACCESS_ERR)
    }

    /// Move `qp_num` to the error state, flushing its receive queue.
    fn fail(&mut self, qp_num: u32) {
        if let Some(qp) = self.endpoints.get_mut(&qp_num) {
            // `ibv_qp::state` is only refreshed by modify and query, like on hardware
            qp.attr.qp_state = ibv_qp_state::IBV_QPS_ERR;
        }
        self.flush_receives(qp_num);
    }

    fn flush_receives(&mut self, qp_num: u32) {
        let Some(qp) = self.endpoints.get_mut(&qp_num) else {
            return;
        };
        let recv_cq = qp.recv_cq;
        let pending = mem::take(&mut qp.recv_queue);
        for recv in pending {
            self.push(recv_cq, flushed(qp_num, recv.wr_id));
        }
    }
}

fn flushed(qp_num: u32, wr_id: u64) -> Cqe {
    Cqe {
        wr_id,
        status: ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
        opcode: ibv_wc_opcode::IBV_WC_RECV,
        byte_len: 0,
        imm_data: 0,
        flags: 0,
        qp_num,
        src_qp: 0,
        timestamp: 0,
        retires: None,
    }
}
