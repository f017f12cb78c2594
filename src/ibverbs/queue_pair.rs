//! A [`QueuePair`] is a pair of send queue and recv queue, considered as the basic transport
//! interface for RDMA communication.
//!
//! Work requests are built inside a posting scope. [`QueuePair::start_post_send`] borrows the queue
//! pair mutably, so one queue pair has at most one [`PostSendGuard`] at a time:
//!
//! ```compile_fail
//! # use verbway::ibverbs::queue_pair::{GenericQueuePair, QueuePair};
//! fn two_guards(qp: &mut GenericQueuePair) {
//!     let first = qp.start_post_send();
//!     let second = qp.start_post_send();
//!     drop((first, second));
//! }
//! ```
//!
//! and one guard fills one work request at a time:
//!
//! ```compile_fail
//! # use verbway::ibverbs::queue_pair::{GenericQueuePair, PostSendGuard, QueuePair, WorkRequestFlags};
//! fn two_handles(qp: &mut GenericQueuePair) {
//!     let mut guard = qp.start_post_send();
//!     let first = guard.construct_wr(1, WorkRequestFlags::Signaled);
//!     let second = guard.construct_wr(2, WorkRequestFlags::Signaled);
//!     drop((first, second));
//! }
//! ```
use std::fmt;
use std::io::{self, IoSlice};
use std::mem::MaybeUninit;
use std::ptr::{self, null_mut, NonNull};
use std::sync::Arc;

use bitmask_enum::bitmask;
use rdma_mummy_sys::{
    ibv_ah, ibv_data_buf, ibv_qp, ibv_qp_attr, ibv_qp_cap, ibv_qp_create_send_ops_flags, ibv_qp_ex, ibv_qp_init_attr,
    ibv_qp_init_attr_ex, ibv_qp_init_attr_mask, ibv_qp_type, ibv_recv_wr, ibv_rx_hash_conf, ibv_send_flags,
    ibv_send_wr, ibv_sge, ibv_wr_opcode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use super::qp_state::{QueuePairAttributeMask, QueuePairState};

use super::address::{AddressHandle, AddressHandleAttribute, Gid};
use super::completion::{CompletionQueue, GenericCompletionQueue};
use super::device_context::Mtu;
use super::errno_result;
use super::in_flight::{RegionLedger, WorkQueue};
use super::memory_region::{MemoryRegion, RegionRangeError};
use super::protection_domain::ProtectionDomain;
use super::qp_state::{check_transition, TransitionError};
use super::symbols::{verbs, ExtendedVerbs};
use super::AccessFlags;

/// Error returned by [`QueuePairBuilder::build`] and its variants for creating a new RDMA QP.
#[derive(Debug, thiserror::Error)]
#[error("failed to create {qp_type:?} queue pair")]
#[non_exhaustive]
pub struct CreateQueuePairError {
    pub qp_type: QueuePairType,
    #[source]
    pub source: CreateQueuePairErrorKind,
}

/// The enum type for [`CreateQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateQueuePairErrorKind {
    #[error("{0} completion queue must be configured before building a queue pair")]
    MissingCompletionQueue(&'static str),
    #[error("invalid queue pair capabilities or type")]
    InvalidArgument,
    #[error("not enough resources to create the queue pair")]
    ResourceExhausted,
    #[error("not permitted to create this type of queue pair")]
    PermissionDenied,
    #[error("the extended queue pair interface is not available")]
    ExtendedUnavailable,
    #[error(transparent)]
    Ibverbs(io::Error),
}

impl From<io::Error> for CreateQueuePairErrorKind {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => CreateQueuePairErrorKind::InvalidArgument,
            Some(libc::ENOMEM) => CreateQueuePairErrorKind::ResourceExhausted,
            Some(libc::EPERM | libc::EACCES) => CreateQueuePairErrorKind::PermissionDenied,
            _ => CreateQueuePairErrorKind::Ibverbs(err),
        }
    }
}

impl CreateQueuePairError {
    fn unsupported(&self) -> bool {
        match &self.source {
            CreateQueuePairErrorKind::ExtendedUnavailable => true,
            CreateQueuePairErrorKind::Ibverbs(err) => err.raw_os_error() == Some(libc::EOPNOTSUPP),
            _ => false,
        }
    }
}

/// Error returned by [`QueuePair::destroy`].
#[derive(Debug, thiserror::Error)]
#[error("failed to destroy queue pair")]
#[non_exhaustive]
pub struct DestroyQueuePairError(#[from] pub DestroyQueuePairErrorKind);

/// The enum type for [`DestroyQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum DestroyQueuePairErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`QueuePair::query`] for querying a RDMA QP's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query queue pair")]
#[non_exhaustive]
pub struct QueryQueuePairError(#[from] pub QueryQueuePairErrorKind);

/// The enum type for [`QueryQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryQueuePairErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`QueuePair::modify`] for modifying a RDMA QP's attributes.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub struct ModifyQueuePairError(#[from] pub ModifyQueuePairErrorKind);

/// The enum type for [`ModifyQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ModifyQueuePairErrorKind {
    #[error("modify queue pair failed")]
    Ibverbs(#[from] io::Error),
    /// Rejected before calling into the native layer.
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("resolve route timed out, source gid index: {sgid_index}, destination gid: {gid}")]
    ResolveRouteTimedout {
        sgid_index: u8,
        gid: Gid,
        source: io::Error,
    },
    #[error("network unreachable, source gid index: {sgid_index}, destination gid: {gid}")]
    NetworkUnreachable {
        sgid_index: u8,
        gid: Gid,
        source: io::Error,
    },
}

impl ModifyQueuePairErrorKind {
    // Route errors only come out of resolving the address vector on the way into RTR.
    fn from_native(attr: &QueuePairAttribute, next_state: QueuePairState, err: io::Error) -> Self {
        let resolves_route = next_state == QueuePairState::ReadyToReceive
            && attr.attr_mask.contains(QueuePairAttributeMask::AddressVector);
        if !resolves_route {
            return ModifyQueuePairErrorKind::Ibverbs(err);
        }
        let sgid_index = attr.attr.ah_attr.grh.sgid_index;
        let gid = attr.attr.ah_attr.grh.dgid.into();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => ModifyQueuePairErrorKind::ResolveRouteTimedout {
                sgid_index,
                gid,
                source: err,
            },
            Some(libc::ENETUNREACH) => ModifyQueuePairErrorKind::NetworkUnreachable {
                sgid_index,
                gid,
                source: err,
            },
            _ => ModifyQueuePairErrorKind::Ibverbs(err),
        }
    }
}

impl From<TransitionError> for ModifyQueuePairError {
    fn from(err: TransitionError) -> Self {
        ModifyQueuePairErrorKind::Transition(err).into()
    }
}

/// Error returned by [`PostSendGuard::post`] for posting Work Requests to QP's send queue.
///
/// The hardware may take a prefix of the batch before it stops, `accepted` tells how many work
/// requests were posted and will produce completions.
#[derive(Debug, thiserror::Error)]
#[error("failed to post send work requests, {accepted} accepted")]
#[non_exhaustive]
pub struct PostSendError {
    pub accepted: usize,
    #[source]
    pub source: PostSendErrorKind,
}

/// The enum type for [`PostSendError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostSendErrorKind {
    #[error("post send failed")]
    Ibverbs(#[source] io::Error),
    #[error("invalid value provided in work request")]
    InvalidWorkRequest(#[source] io::Error),
    #[error("invalid value provided in queue pair")]
    InvalidQueuePair(#[source] io::Error),
    #[error("send queue is full or not enough resources to complete this operation")]
    NotEnoughResources(#[source] io::Error),
}

impl From<io::Error> for PostSendErrorKind {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => PostSendErrorKind::InvalidWorkRequest(err),
            Some(libc::ENOMEM) => PostSendErrorKind::NotEnoughResources(err),
            Some(libc::EFAULT) => PostSendErrorKind::InvalidQueuePair(err),
            _ => PostSendErrorKind::Ibverbs(err),
        }
    }
}

/// Error returned by [`PostRecvGuard::post`] for posting Work Requests to QP's recv queue.
#[derive(Debug, thiserror::Error)]
#[error("failed to post receive work requests, {accepted} accepted")]
#[non_exhaustive]
pub struct PostRecvError {
    pub accepted: usize,
    #[source]
    pub source: PostRecvErrorKind,
}

/// The enum type for [`PostRecvError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostRecvErrorKind {
    #[error("post receive failed")]
    Ibverbs(#[source] io::Error),
    #[error("invalid value provided in work request")]
    InvalidWorkRequest(#[source] io::Error),
    #[error("invalid value provided in queue pair")]
    InvalidQueuePair(#[source] io::Error),
    #[error("receive queue is full or not enough resources to complete this operation")]
    NotEnoughResources(#[source] io::Error),
}

impl From<io::Error> for PostRecvErrorKind {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => PostRecvErrorKind::InvalidWorkRequest(err),
            Some(libc::ENOMEM) => PostRecvErrorKind::NotEnoughResources(err),
            Some(libc::EFAULT) => PostRecvErrorKind::InvalidQueuePair(err),
            _ => PostRecvErrorKind::Ibverbs(err),
        }
    }
}

/// The requested transport service type of a QP.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueuePairType {
    /// A reliable connection is a connection created between a single local QP and a single remote
    /// QP and that can guarantee that messages are delivered at most once, in order and without
    /// corruption between the local and remote QP's.
    ReliableConnection = ibv_qp_type::IBV_QPT_RC,
    /// An unreliable connection consists of a one-to-one correspondence between two QPs. Packets
    /// are sent from one QP to the other but no acknowledgments are generated by the desination QP.
    UnreliableConnection = ibv_qp_type::IBV_QPT_UC,
    /// Unreliable datagrams allow a source QP to send each message to one of many destination QPs.
    UnreliableDatagram = ibv_qp_type::IBV_QPT_UD,
    /// Raw packet QP allows an application build a complete packet including L2 headers.
    RawPacket = ibv_qp_type::IBV_QPT_RAW_PACKET,
    /// Extended Reliable Connection QP, for detailed information, you could take this [commit] and
    /// this [PDF] as references.
    ///
    /// [commit]: https://github.com/linux-rdma/rdma-core/commit/c7e3e61052dd756c394d8fbccbc498aa4eebbd37
    /// [PDF]: https://downloads.openfabrics.org/Media/SC07/2007_SC_Nov_XRC.pdf
    ///
    ReliableConnectionExtendedSend = ibv_qp_type::IBV_QPT_XRC_SEND,
    ReliableConnectionExtendedRecv = ibv_qp_type::IBV_QPT_XRC_RECV,
}

impl From<u32> for QueuePairType {
    fn from(qp_type: u32) -> Self {
        match qp_type {
            ibv_qp_type::IBV_QPT_RC => QueuePairType::ReliableConnection,
            ibv_qp_type::IBV_QPT_UC => QueuePairType::UnreliableConnection,
            ibv_qp_type::IBV_QPT_UD => QueuePairType::UnreliableDatagram,
            ibv_qp_type::IBV_QPT_RAW_PACKET => QueuePairType::RawPacket,
            ibv_qp_type::IBV_QPT_XRC_SEND => QueuePairType::ReliableConnectionExtendedSend,
            ibv_qp_type::IBV_QPT_XRC_RECV => QueuePairType::ReliableConnectionExtendedRecv,
            _ => panic!("Unknown qp type: {qp_type}"),
        }
    }
}

/// Controls operations could be used of a [`ExtendedQueuePair`]. It's either 0 or
/// the bitwise `OR` of one or more of the following flags. Used in
/// [`QueuePairBuilder::setup_send_ops_flags`].
#[bitmask(u64)]
#[bitmask_config(vec_debug)]
pub enum SendOperationFlags {
    Write = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_RDMA_WRITE.0 as _,
    WriteWithImmediate = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_RDMA_WRITE_WITH_IMM.0 as _,
    Send = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_SEND.0 as _,
    SendWithImmediate = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_SEND_WITH_IMM.0 as _,
    Read = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_RDMA_READ.0 as _,
    AtomicCompareAndSwap = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_ATOMIC_CMP_AND_SWP.0 as _,
    AtomicFetchAndAdd = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_ATOMIC_FETCH_AND_ADD.0 as _,
    LocalInvalidate = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_LOCAL_INV.0 as _,
    BindMemoryWindow = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_BIND_MW.0 as _,
    SendWithInvalidate = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_SEND_WITH_INV.0 as _,
    TcpSegmentationOffload = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_TSO.0 as _,
    Flush = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_FLUSH.0 as _,
    AtomicWrite = ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_ATOMIC_WRITE.0 as _,
}

/// Operation type of the Work Request.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkRequestOperationType {
    Send = ibv_wr_opcode::IBV_WR_SEND,
    SendWithImmediate = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
    Write = ibv_wr_opcode::IBV_WR_RDMA_WRITE,
    WriteWithImmediate = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
    Read = ibv_wr_opcode::IBV_WR_RDMA_READ,
    AtomicCompareAndSwap = ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP,
    AtomicFetchAndAdd = ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD,
    LocalInvalidate = ibv_wr_opcode::IBV_WR_LOCAL_INV,
    BindMemoryWindow = ibv_wr_opcode::IBV_WR_BIND_MW,
    SendWithInvalidate = ibv_wr_opcode::IBV_WR_SEND_WITH_INV,
    TcpSegmentationOffload = ibv_wr_opcode::IBV_WR_TSO,
    Driver1 = ibv_wr_opcode::IBV_WR_DRIVER1,
    Flush = ibv_wr_opcode::IBV_WR_FLUSH,
    AtomicWrite = ibv_wr_opcode::IBV_WR_ATOMIC_WRITE,
}

impl From<u32> for WorkRequestOperationType {
    fn from(opcode: u32) -> Self {
        match opcode {
            ibv_wr_opcode::IBV_WR_SEND => WorkRequestOperationType::Send,
            ibv_wr_opcode::IBV_WR_SEND_WITH_IMM => WorkRequestOperationType::SendWithImmediate,
            ibv_wr_opcode::IBV_WR_RDMA_WRITE => WorkRequestOperationType::Write,
            ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM => WorkRequestOperationType::WriteWithImmediate,
            ibv_wr_opcode::IBV_WR_RDMA_READ => WorkRequestOperationType::Read,
            ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP => WorkRequestOperationType::AtomicCompareAndSwap,
            ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD => WorkRequestOperationType::AtomicFetchAndAdd,
            ibv_wr_opcode::IBV_WR_LOCAL_INV => WorkRequestOperationType::LocalInvalidate,
            ibv_wr_opcode::IBV_WR_BIND_MW => WorkRequestOperationType::BindMemoryWindow,
            ibv_wr_opcode::IBV_WR_SEND_WITH_INV => WorkRequestOperationType::SendWithInvalidate,
            ibv_wr_opcode::IBV_WR_TSO => WorkRequestOperationType::TcpSegmentationOffload,
            ibv_wr_opcode::IBV_WR_DRIVER1 => WorkRequestOperationType::Driver1,
            ibv_wr_opcode::IBV_WR_FLUSH => WorkRequestOperationType::Flush,
            ibv_wr_opcode::IBV_WR_ATOMIC_WRITE => WorkRequestOperationType::AtomicWrite,
            _ => panic!("Unknown work request opcode: {opcode}"),
        }
    }
}

/// Flags of the Work Request properties.
#[bitmask(u32)]
#[bitmask_config(vec_debug)]
pub enum WorkRequestFlags {
    /// Wait for every earlier RDMA Read and atomic on this QP to complete before starting.
    Fence = ibv_send_flags::IBV_SEND_FENCE.0,
    /// Generate a completion for this request. Unsignaled requests only complete on error.
    Signaled = ibv_send_flags::IBV_SEND_SIGNALED.0,
    Solicited = ibv_send_flags::IBV_SEND_SOLICITED.0,
    Inline = ibv_send_flags::IBV_SEND_INLINE.0,
    IpChecksum = ibv_send_flags::IBV_SEND_IP_CSUM.0,
}

/// Unified interface for operations over RDMA QPs.
#[allow(private_bounds)]
pub trait QueuePair {
    /// # Safety
    ///
    /// Return the basic handle of QP; we mark this method unsafe because the lifetime of `ibv_qp`
    /// is not associated with the return value.
    unsafe fn qp(&self) -> NonNull<ibv_qp>;

    /// Modify the [QueuePair]'s attributes.
    ///
    /// The attribute mask is checked against the transition first, so a missing or forbidden
    /// attribute comes back as [`ModifyQueuePairErrorKind::Transition`] without calling into the
    /// native layer. An attribute without [`QueuePairAttributeMask::State`] keeps the current
    /// state.
    fn modify(&mut self, attr: &QueuePairAttribute) -> Result<(), ModifyQueuePairError> {
        let cur_state = self.state();
        let next_state = if attr.attr_mask.contains(QueuePairAttributeMask::State) {
            attr.attr.qp_state.into()
        } else {
            cur_state
        };
        check_transition(self.qp_type(), cur_state, next_state, attr.attr_mask)?;

        // ibv_qp_attr does not impl Clone trait, so we use struct update syntax here
        let mut qp_attr = ibv_qp_attr { ..attr.attr };
        let ret = unsafe { (verbs().modify_qp)(self.qp().as_ptr(), &mut qp_attr, attr.attr_mask.bits) };
        match errno_result(ret) {
            Ok(()) => {
                debug!(qp_num = self.qp_number(), ?cur_state, ?next_state, "QueuePair::modify");
                Ok(())
            },
            Err(err) => Err(ModifyQueuePairErrorKind::from_native(attr, next_state, err).into()),
        }
    }

    /// Query the [QueuePair]'s attributes. Specify the attributes to query by providing a mask.
    fn query(
        &self, mask: QueuePairAttributeMask,
    ) -> Result<(QueuePairAttribute, QueuePairInitAttribute), QueryQueuePairError> {
        let mut attr = QueuePairAttribute::default();
        let mut init_attr = QueuePairInitAttribute::default();

        attr.attr_mask = mask;

        let ret = unsafe {
            (verbs().query_qp)(
                self.qp().as_ptr(),
                &mut attr.attr as *mut _,
                mask.bits(),
                &mut init_attr.init_attr as *mut _,
            )
        };
        errno_result(ret).map_err(QueryQueuePairErrorKind::from)?;
        Ok((attr, init_attr))
    }

    /// Get the [QueuePair]'s state.
    fn state(&self) -> QueuePairState {
        unsafe { self.qp().as_ref().state.into() }
    }

    /// Get the [QueuePair]'s number.
    fn qp_number(&self) -> u32 {
        unsafe { self.qp().as_ref().qp_num }
    }

    /// Get the [QueuePair]'s transport type.
    fn qp_type(&self) -> QueuePairType {
        unsafe { self.qp().as_ref().qp_type.into() }
    }

    /// Could be [`ExtendedPostSendGuard`], [`BasicPostSendGuard`] or [`GenericPostSendGuard`].
    type Guard<'g>: PostSendGuard
    where
        Self: 'g;

    /// Starts a post send operation, every [`QueuePair`] holds only one [`PostSendGuard`] at the
    /// same time.
    //
    // RPITIT could be used here, but with lifetime bound, there could be problems.
    //
    // Ref: https://github.com/rust-lang/rust/issues/128752
    //      https://github.com/rust-lang/rust/issues/91611
    //
    fn start_post_send(&mut self) -> Self::Guard<'_>;

    /// Starts a post receive operation, every [`QueuePair`] holds only one [`PostRecvGuard`] at the
    /// same time.
    fn start_post_recv(&mut self) -> PostRecvGuard<'_>;

    /// Destroy the queue pair now and report the native result, instead of the warning a failed
    /// destroy in [`Drop`] produces.
    fn destroy(self) -> Result<(), DestroyQueuePairError>
    where
        Self: Sized;
}

mod private_traits {
    use std::io::IoSlice;
    use std::sync::Arc;

    use crate::ibverbs::address::AddressHandle;
    use crate::ibverbs::memory_region::MemoryRegion;
    use rdma_mummy_sys::ibv_sge;

    // This is the private part of PostSendGuard, which is a workaround for pub trait
    // not being able to have private functions.
    //
    // Ref: https://stackoverflow.com/questions/53204327/how-to-have-a-private-part-of-a-trait
    //
    pub trait PostSendGuard {
        fn setup_send(&mut self);

        fn setup_send_imm(&mut self, imm_data: u32);

        fn setup_ud_addr(&mut self, ah: &AddressHandle, remote_qpn: u32, remote_qkey: u32);

        fn setup_write(&mut self, rkey: u32, remote_addr: u64);

        fn setup_write_imm(&mut self, rkey: u32, remote_addr: u64, imm_data: u32);

        fn setup_read(&mut self, rkey: u32, remote_addr: u64);

        fn setup_atomic_cmp_swp(&mut self, rkey: u32, remote_addr: u64, compare: u64, swap: u64);

        fn setup_atomic_fetch_add(&mut self, rkey: u32, remote_addr: u64, add: u64);

        fn setup_inline_data(&mut self, buf: &[u8]);

        fn setup_inline_data_list(&mut self, bufs: &[IoSlice<'_>]);

        unsafe fn setup_sge(&mut self, lkey: u32, addr: u64, length: u32);

        unsafe fn setup_sge_list(&mut self, sg_list: &[ibv_sge]);

        fn pin_region(&mut self, region: &Arc<MemoryRegion>);
    }
}

/// A [`PostSendGuard`] that can be used to construct and post send RDMA Work Requests.
///
/// Work requests constructed but not posted are discarded when the guard drops.
pub trait PostSendGuard: private_traits::PostSendGuard {
    /// Construct a new [`WorkRequestHandle`] for setting up a new RDMA Work Request, every
    /// [`QueuePair`] holds only one [`WorkRequestHandle`] at the same time.
    fn construct_wr(&mut self, wr_id: u64, wr_flags: WorkRequestFlags) -> WorkRequestHandle<'_, Self>;

    /// Post all previously setuped RDMA Work Requests into the [`QueuePair`]'s send queue with a
    /// single native call.
    fn post(self) -> Result<(), PostSendError>;
}

/// A handle that user would use to fill the concrete information of the RDMA Work Request.
pub struct WorkRequestHandle<'g, G: PostSendGuard + ?Sized> {
    guard: &'g mut G,
}

/// Setup scatter gather entry (sge) for a Work Request.
pub trait SetScatterGatherEntry {
    /// # Safety
    ///
    /// Set a local buffer to the request; note that the lifetime of the buffer associated with the
    /// sge is managed by the caller.
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32);
    /// # Safety
    ///
    /// Set a list of local buffers to the request; note that the lifetime of the buffer associated
    /// with the sge is managed by the caller.
    unsafe fn setup_sge_list(self, sg_list: &[ibv_sge]);

    /// Set `len` bytes starting `offset` bytes into `region` as the local buffer. The work request
    /// keeps a share of `region` until its completion, or a later one of the same queue, is polled,
    /// so the region cannot be deregistered under the hardware.
    fn setup_sge_from(self, region: &Arc<MemoryRegion>, offset: usize, len: u32) -> Result<(), RegionRangeError>;
}

/// Setup inline data for a Work Request.
pub trait SetInlineData {
    /// Attach data to current Work Request by `memcpy` the `buf` into it.
    fn setup_inline_data(self, buf: &[u8]);

    /// Attach data to current Work Request by `memcpy` the `bufs` into it continuously.
    fn setup_inline_data_list(self, bufs: &[IoSlice<'_>]);
}

/// A handle to set the local buffer of an RDMA Send or Write, either registered memory or inline
/// data.
pub struct LocalBufferHandle<'g, G: PostSendGuard + ?Sized> {
    guard: &'g mut G,
}

impl<G: PostSendGuard + ?Sized> SetInlineData for LocalBufferHandle<'_, G> {
    fn setup_inline_data(self, buf: &[u8]) {
        self.guard.setup_inline_data(buf);
    }

    fn setup_inline_data_list(self, bufs: &[IoSlice<'_>]) {
        self.guard.setup_inline_data_list(bufs);
    }
}

impl<G: PostSendGuard + ?Sized> SetScatterGatherEntry for LocalBufferHandle<'_, G> {
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32) {
        self.guard.setup_sge(lkey, addr, length);
    }

    unsafe fn setup_sge_list(self, sg_list: &[ibv_sge]) {
        self.guard.setup_sge_list(sg_list);
    }

    fn setup_sge_from(self, region: &Arc<MemoryRegion>, offset: usize, len: u32) -> Result<(), RegionRangeError> {
        let sge = region.checked_sge(offset, len)?;
        self.guard.pin_region(region);
        unsafe { self.guard.setup_sge(sge.lkey, sge.addr, sge.length) };
        Ok(())
    }
}

/// A handle to set the local buffer an RDMA Read or atomic writes its result into. The result
/// lands in registered memory, so inline data is not offered.
pub struct ScatterGatherHandle<'g, G: PostSendGuard + ?Sized> {
    guard: &'g mut G,
}

impl<G: PostSendGuard + ?Sized> SetScatterGatherEntry for ScatterGatherHandle<'_, G> {
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32) {
        self.guard.setup_sge(lkey, addr, length);
    }

    unsafe fn setup_sge_list(self, sg_list: &[ibv_sge]) {
        self.guard.setup_sge_list(sg_list);
    }

    fn setup_sge_from(self, region: &Arc<MemoryRegion>, offset: usize, len: u32) -> Result<(), RegionRangeError> {
        let sge = region.checked_sge(offset, len)?;
        self.guard.pin_region(region);
        unsafe { self.guard.setup_sge(sge.lkey, sge.addr, sge.length) };
        Ok(())
    }
}

impl<'g, G: PostSendGuard + ?Sized> WorkRequestHandle<'g, G> {
    pub fn setup_send(self) -> LocalBufferHandle<'g, G> {
        self.guard.setup_send();
        LocalBufferHandle { guard: self.guard }
    }

    /// Send with immediate data, `imm_data` is given in host order.
    pub fn setup_send_imm(self, imm_data: u32) -> LocalBufferHandle<'g, G> {
        self.guard.setup_send_imm(imm_data);
        LocalBufferHandle { guard: self.guard }
    }

    /// Address the datagram, only meaningful for [`QueuePairType::UnreliableDatagram`].
    pub fn setup_ud_addr(self, ah: &AddressHandle, remote_qpn: u32, remote_qkey: u32) -> Self {
        let WorkRequestHandle { guard } = self;
        guard.setup_ud_addr(ah, remote_qpn, remote_qkey);
        WorkRequestHandle { guard }
    }

    pub fn setup_write(self, rkey: u32, remote_addr: u64) -> LocalBufferHandle<'g, G> {
        self.guard.setup_write(rkey, remote_addr);
        LocalBufferHandle { guard: self.guard }
    }

    /// Write with immediate data, `imm_data` is given in host order.
    pub fn setup_write_imm(self, rkey: u32, remote_addr: u64, imm_data: u32) -> LocalBufferHandle<'g, G> {
        self.guard.setup_write_imm(rkey, remote_addr, imm_data);
        LocalBufferHandle { guard: self.guard }
    }

    pub fn setup_read(self, rkey: u32, remote_addr: u64) -> ScatterGatherHandle<'g, G> {
        self.guard.setup_read(rkey, remote_addr);
        ScatterGatherHandle { guard: self.guard }
    }

    /// Compare the 8 bytes at `remote_addr` with `compare` and replace them with `swap` if they
    /// match. The original value is written to the local buffer.
    pub fn setup_atomic_cmp_swp(
        self, rkey: u32, remote_addr: u64, compare: u64, swap: u64,
    ) -> ScatterGatherHandle<'g, G> {
        self.guard.setup_atomic_cmp_swp(rkey, remote_addr, compare, swap);
        ScatterGatherHandle { guard: self.guard }
    }

    /// Add `add` to the 8 bytes at `remote_addr`. The original value is written to the local
    /// buffer.
    pub fn setup_atomic_fetch_add(self, rkey: u32, remote_addr: u64, add: u64) -> ScatterGatherHandle<'g, G> {
        self.guard.setup_atomic_fetch_add(rkey, remote_addr, add);
        ScatterGatherHandle { guard: self.guard }
    }
}

/// Reusable storage for the work request chain of a [`BasicQueuePair`], so that posting does not
/// allocate once the vectors have grown.
#[derive(Default)]
struct SendScratch {
    wrs: Vec<ibv_send_wr>,
    sges: Vec<ibv_sge>,
    inline: Vec<u8>,
    // (index into `sges`, offset into `inline`)
    inline_sges: Vec<(usize, usize)>,
}

impl SendScratch {
    fn clear(&mut self) {
        self.wrs.clear();
        self.sges.clear();
        self.inline.clear();
        self.inline_sges.clear();
    }

    fn last_wr(&mut self) -> &mut ibv_send_wr {
        let index = self.wrs.len().saturating_sub(1);
        &mut self.wrs[index]
    }

    fn push_inline(&mut self, bytes: impl IntoIterator<Item = u8>) {
        let offset = self.inline.len();
        self.inline.extend(bytes);
        let length = (self.inline.len() - offset) as u32;

        // the address is patched in at post time, `inline` may still move
        self.inline_sges.push((self.sges.len(), offset));
        self.sges.push(ibv_sge { addr: 0, length, lkey: 0 });

        let wr = self.last_wr();
        wr.send_flags |= WorkRequestFlags::Inline.bits;
        wr.num_sge = 1;
    }
}

#[derive(Default)]
struct RecvScratch {
    wrs: Vec<ibv_recv_wr>,
    sges: Vec<ibv_sge>,
}

/// The legacy [`QueuePair`] created with [`QueuePairBuilder::build`] (`ibv_create_qp`), which
/// builds a chain of `ibv_send_wr` and posts it with `ibv_post_send`.
pub struct BasicQueuePair {
    pub(crate) qp: NonNull<ibv_qp>,
    released: bool,
    send: SendScratch,
    recv: RecvScratch,
    // dropped after the native queue pair is destroyed
    send_regions: RegionLedger,
    recv_regions: RegionLedger,
    _pd: Arc<ProtectionDomain>,
    _send_cq: GenericCompletionQueue,
    _recv_cq: GenericCompletionQueue,
}

unsafe impl Send for BasicQueuePair {}
unsafe impl Sync for BasicQueuePair {}

impl Drop for BasicQueuePair {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = destroy_qp(self.qp) {
            warn!(qp_num = self.qp_number(), error = %err, "failed to destroy queue pair");
        }
    }
}

fn destroy_qp(qp: NonNull<ibv_qp>) -> io::Result<()> {
    debug!(qp_num = unsafe { qp.as_ref().qp_num }, "QueuePair::destroy");
    errno_result(unsafe { (verbs().destroy_qp)(qp.as_ptr()) })
}

impl QueuePair for BasicQueuePair {
    unsafe fn qp(&self) -> NonNull<ibv_qp> {
        self.qp
    }

    type Guard<'g>
        = BasicPostSendGuard<'g>
    where
        Self: 'g;

    fn start_post_send(&mut self) -> Self::Guard<'_> {
        self.send.clear();
        self.send_regions.begin();
        BasicPostSendGuard {
            qp: self.qp,
            scratch: &mut self.send,
            regions: &mut self.send_regions,
        }
    }

    fn start_post_recv(&mut self) -> PostRecvGuard<'_> {
        PostRecvGuard::new(self.qp, &mut self.recv, &mut self.recv_regions)
    }

    fn destroy(mut self) -> Result<(), DestroyQueuePairError> {
        self.released = true;
        Ok(destroy_qp(self.qp)?)
    }
}

impl fmt::Debug for BasicQueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicQueuePair")
            .field("qp", &self.qp)
            .field("qp_num", &self.qp_number())
            .finish()
    }
}

/// The extended [`QueuePair`] created with [`QueuePairBuilder::build_ex`] (`ibv_create_qp_ex`),
/// which writes work requests straight into the send queue through the `ibv_wr_*` entry points.
pub struct ExtendedQueuePair {
    pub(crate) qp_ex: NonNull<ibv_qp_ex>,
    ops: &'static ExtendedVerbs,
    released: bool,
    data_bufs: Vec<ibv_data_buf>,
    recv: RecvScratch,
    send_regions: RegionLedger,
    recv_regions: RegionLedger,
    _pd: Arc<ProtectionDomain>,
    _send_cq: GenericCompletionQueue,
    _recv_cq: GenericCompletionQueue,
}

unsafe impl Send for ExtendedQueuePair {}
unsafe impl Sync for ExtendedQueuePair {}

impl Drop for ExtendedQueuePair {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = destroy_qp(unsafe { self.qp() }) {
            warn!(qp_num = self.qp_number(), error = %err, "failed to destroy queue pair");
        }
    }
}

impl QueuePair for ExtendedQueuePair {
    unsafe fn qp(&self) -> NonNull<ibv_qp> {
        NonNull::new_unchecked(ptr::addr_of_mut!((*self.qp_ex.as_ptr()).qp_base))
    }

    type Guard<'g>
        = ExtendedPostSendGuard<'g>
    where
        Self: 'g;

    fn start_post_send(&mut self) -> Self::Guard<'_> {
        unsafe { (self.ops.wr_start)(self.qp_ex.as_ptr()) };
        self.send_regions.begin();

        ExtendedPostSendGuard {
            qp_ex: self.qp_ex,
            ops: self.ops,
            data_bufs: &mut self.data_bufs,
            regions: &mut self.send_regions,
            ud_addr: None,
            completed: false,
        }
    }

    fn start_post_recv(&mut self) -> PostRecvGuard<'_> {
        let qp = unsafe { self.qp() };
        PostRecvGuard::new(qp, &mut self.recv, &mut self.recv_regions)
    }

    fn destroy(mut self) -> Result<(), DestroyQueuePairError> {
        self.released = true;
        Ok(destroy_qp(unsafe { self.qp() })?)
    }
}

impl fmt::Debug for ExtendedQueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedQueuePair")
            .field("qp_ex", &self.qp_ex)
            .field("qp_num", &self.qp_number())
            .finish()
    }
}

/// A factory for creating [`BasicQueuePair`] and [`ExtendedQueuePair`] with the specified
/// parameters.
pub struct QueuePairBuilder {
    init_attr: ibv_qp_init_attr_ex,
    pd: Arc<ProtectionDomain>,
    send_cq: Option<GenericCompletionQueue>,
    recv_cq: Option<GenericCompletionQueue>,
}

impl QueuePairBuilder {
    pub fn new(pd: &Arc<ProtectionDomain>) -> QueuePairBuilder {
        QueuePairBuilder {
            init_attr: ibv_qp_init_attr_ex {
                qp_context: null_mut(),
                send_cq: null_mut(),
                recv_cq: null_mut(),
                srq: null_mut(),
                cap: ibv_qp_cap {
                    max_send_wr: 16,
                    max_recv_wr: 16,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    max_inline_data: 0,
                },
                qp_type: QueuePairType::ReliableConnection as _,
                sq_sig_all: 0,
                // when building an extended qp instead of a basic qp, we need to pass in
                // these essential attributes.
                comp_mask: ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_PD.0
                    | ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_SEND_OPS_FLAGS.0,
                pd: pd.pd.as_ptr(),
                xrcd: null_mut(),
                create_flags: 0,
                max_tso_header: 0,
                rwq_ind_tbl: null_mut(),
                rx_hash_conf: unsafe { MaybeUninit::<ibv_rx_hash_conf>::zeroed().assume_init() },
                source_qpn: 0,
                // unless user specified, we assume every extended qp would support send,
                // write and read, just as what basic qp supports.
                send_ops_flags: (SendOperationFlags::Send
                    | SendOperationFlags::SendWithImmediate
                    | SendOperationFlags::Write
                    | SendOperationFlags::WriteWithImmediate
                    | SendOperationFlags::Read)
                    .into(),
            },
            pd: Arc::clone(pd),
            send_cq: None,
            recv_cq: None,
        }
    }

    /// Setup the requested QP type.
    pub fn setup_qp_type(&mut self, qp_type: QueuePairType) -> &mut Self {
        self.init_attr.qp_type = qp_type as u32;
        self
    }

    /// Setup the maximum number of outstanding RDMA Work Requests that can be posted to the
    /// **send queue** in the QP.
    pub fn setup_max_send_wr(&mut self, max_send_wr: u32) -> &mut Self {
        self.init_attr.cap.max_send_wr = max_send_wr;
        self
    }

    /// Setup the maximum number of outstanding RDMA Work Requests that can be posted to the
    /// **recv queue** in the QP.
    pub fn setup_max_recv_wr(&mut self, max_recv_wr: u32) -> &mut Self {
        self.init_attr.cap.max_recv_wr = max_recv_wr;
        self
    }

    /// Setup the maximum number of scatter / gather elements in any RDMA Work Request that can be
    /// posted to the **send queue** in the QP.
    pub fn setup_max_send_sge(&mut self, max_send_sge: u32) -> &mut Self {
        self.init_attr.cap.max_send_sge = max_send_sge;
        self
    }

    /// Setup the maximum number of scatter / gather elements in any RDMA Work Request that can be
    /// posted to the **recv queue** in the QP.
    pub fn setup_max_recv_sge(&mut self, max_recv_sge: u32) -> &mut Self {
        self.init_attr.cap.max_recv_sge = max_recv_sge;
        self
    }

    /// Setup the maximum message size that can be posted inline (in the RDMA Work Request) to the
    /// send queue.
    pub fn setup_max_inline_data(&mut self, max_inline_data: u32) -> &mut Self {
        self.init_attr.cap.max_inline_data = max_inline_data;
        self
    }

    /// Generate a completion for every send work request, whether it is signaled or not.
    pub fn setup_sq_sig_all(&mut self, sq_sig_all: bool) -> &mut Self {
        self.init_attr.sq_sig_all = sq_sig_all as _;
        self
    }

    /// Setup the [`CompletionQueue`] to be associated with the QP's send queue, could be the same
    /// one for [`setup_recv_cq`].
    ///
    /// [`setup_recv_cq`]: QueuePairBuilder::setup_recv_cq
    ///
    pub fn setup_send_cq<C>(&mut self, send_cq: C) -> &mut Self
    where
        C: Into<GenericCompletionQueue>,
    {
        let cq = send_cq.into();
        unsafe {
            self.init_attr.send_cq = cq.cq().as_ptr();
        }
        self.send_cq = Some(cq);
        self
    }

    /// Setup the [`CompletionQueue`] to be associated with the QP's recv queue, could be the same
    /// one for [`setup_send_cq`].
    ///
    /// [`setup_send_cq`]: QueuePairBuilder::setup_send_cq
    ///
    pub fn setup_recv_cq<C>(&mut self, recv_cq: C) -> &mut Self
    where
        C: Into<GenericCompletionQueue>,
    {
        let cq = recv_cq.into();
        unsafe {
            self.init_attr.recv_cq = cq.cq().as_ptr();
        }
        self.recv_cq = Some(cq);
        self
    }

    /// Setup the operations could be used of a [`ExtendedQueuePair`].
    pub fn setup_send_ops_flags(&mut self, send_ops_flags: SendOperationFlags) -> &mut Self {
        self.init_attr.send_ops_flags = send_ops_flags.bits;
        self
    }

    fn qp_type(&self) -> QueuePairType {
        self.init_attr.qp_type.into()
    }

    fn error(&self, source: CreateQueuePairErrorKind) -> CreateQueuePairError {
        CreateQueuePairError {
            qp_type: self.qp_type(),
            source,
        }
    }

    fn region_ledgers(
        qp: NonNull<ibv_qp>, send_cq: &GenericCompletionQueue, recv_cq: &GenericCompletionQueue,
    ) -> (RegionLedger, RegionLedger) {
        let qp_num = unsafe { qp.as_ref().qp_num };
        (
            RegionLedger::new(send_cq.in_flight(), qp_num, WorkQueue::Send),
            RegionLedger::new(recv_cq.in_flight(), qp_num, WorkQueue::Recv),
        )
    }

    fn completion_queues(&self) -> Result<(GenericCompletionQueue, GenericCompletionQueue), CreateQueuePairError> {
        let send_cq = self
            .send_cq
            .clone()
            .ok_or_else(|| self.error(CreateQueuePairErrorKind::MissingCompletionQueue("send")))?;
        let recv_cq = self
            .recv_cq
            .clone()
            .ok_or_else(|| self.error(CreateQueuePairErrorKind::MissingCompletionQueue("receive")))?;
        Ok((send_cq, recv_cq))
    }

    /// Create a [`BasicQueuePair`] with `ibv_create_qp`.
    pub fn build(&self) -> Result<BasicQueuePair, CreateQueuePairError> {
        let (send_cq, recv_cq) = self.completion_queues()?;

        let mut init_attr = ibv_qp_init_attr {
            qp_context: null_mut(),
            send_cq: self.init_attr.send_cq,
            recv_cq: self.init_attr.recv_cq,
            srq: null_mut(),
            cap: self.init_attr.cap,
            qp_type: self.init_attr.qp_type,
            sq_sig_all: self.init_attr.sq_sig_all,
        };
        let qp = unsafe { (verbs().create_qp)(self.init_attr.pd, &mut init_attr) };
        let qp = NonNull::new(qp).ok_or_else(|| self.error(io::Error::last_os_error().into()))?;
        debug!(
            qp_num = unsafe { qp.as_ref().qp_num },
            qp_type = ?self.qp_type(),
            max_send_wr = init_attr.cap.max_send_wr,
            max_recv_wr = init_attr.cap.max_recv_wr,
            "QueuePairBuilder::build"
        );
        let (send_regions, recv_regions) = Self::region_ledgers(qp, &send_cq, &recv_cq);

        Ok(BasicQueuePair {
            qp,
            released: false,
            send: SendScratch::default(),
            recv: RecvScratch::default(),
            send_regions,
            recv_regions,
            _pd: Arc::clone(&self.pd),
            _send_cq: send_cq,
            _recv_cq: recv_cq,
        })
    }

    /// Create a [`ExtendedQueuePair`] with `ibv_create_qp_ex`.
    pub fn build_ex(&self) -> Result<ExtendedQueuePair, CreateQueuePairError> {
        let (send_cq, recv_cq) = self.completion_queues()?;
        let ops = verbs()
            .extended()
            .ok_or_else(|| self.error(CreateQueuePairErrorKind::ExtendedUnavailable))?;

        let mut attr = self.init_attr;
        let qp = unsafe { (ops.create_qp_ex)(self.pd.context().context.as_ptr(), &mut attr) };
        let qp = NonNull::new(qp).ok_or_else(|| self.error(io::Error::last_os_error().into()))?;

        let Some(qp_ex) = NonNull::new(unsafe { (ops.qp_to_qp_ex)(qp.as_ptr()) }) else {
            let err = io::Error::last_os_error();
            if let Err(destroy_err) = destroy_qp(qp) {
                warn!(error = %destroy_err, "failed to destroy queue pair without extended interface");
            }
            return Err(self.error(err.into()));
        };
        debug!(
            qp_num = unsafe { qp.as_ref().qp_num },
            qp_type = ?self.qp_type(),
            send_ops_flags = ?SendOperationFlags { bits: self.init_attr.send_ops_flags },
            "QueuePairBuilder::build_ex"
        );
        let (send_regions, recv_regions) = Self::region_ledgers(qp, &send_cq, &recv_cq);

        Ok(ExtendedQueuePair {
            qp_ex,
            ops,
            released: false,
            data_bufs: Vec::new(),
            recv: RecvScratch::default(),
            send_regions,
            recv_regions,
            _pd: Arc::clone(&self.pd),
            _send_cq: send_cq,
            _recv_cq: recv_cq,
        })
    }

    /// Create an extended queue pair when the library and device support it, else a basic one.
    pub fn build_generic(&self) -> Result<GenericQueuePair, CreateQueuePairError> {
        match self.build_ex() {
            Ok(qp) => Ok(qp.into()),
            Err(err) if err.unsupported() => {
                debug!(reason = %err.source, "falling back to a basic queue pair");
                self.build().map(Into::into)
            },
            Err(err) => Err(err),
        }
    }
}

/// Describe the attributes of a [`QueuePair`], could be used for getting current [`QueuePair`]
/// attributes with [`QueuePair::query`] or modifying current [`QueuePair`] attributes with
/// [`QueuePair::modify`].
///
/// Every setter also records its bit in [`attr_mask`](Self::attr_mask).
pub struct QueuePairAttribute {
    pub(crate) attr: ibv_qp_attr,
    pub(crate) attr_mask: QueuePairAttributeMask,
}

impl Default for QueuePairAttribute {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueuePairAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePairAttribute")
            .field("attr_mask", &self.attr_mask)
            .field("qp_state", &self.attr.qp_state)
            .field("dest_qp_num", &self.attr.dest_qp_num)
            .finish()
    }
}

impl QueuePairAttribute {
    pub fn new() -> Self {
        QueuePairAttribute {
            attr: unsafe { MaybeUninit::zeroed().assume_init() },
            attr_mask: QueuePairAttributeMask { bits: 0 },
        }
    }

    /// Initialize attr from an existing one, this is useful when we interact with RDMA CM, or other
    /// existing libraries.
    pub fn from(attr: &ibv_qp_attr, attr_mask: i32) -> Self {
        QueuePairAttribute {
            attr: ibv_qp_attr { ..*attr },
            attr_mask: QueuePairAttributeMask { bits: attr_mask },
        }
    }

    /// The attributes set so far.
    pub fn attr_mask(&self) -> QueuePairAttributeMask {
        self.attr_mask
    }

    /// Setup the next [`QueuePair`] state, note that not all state transitions
    /// are valid, you could take [qp state machine] as a reference.
    ///
    /// [qp state machine]: https://www.rdmamojo.com/2012/05/05/qp-state-machine/
    ///
    pub fn setup_state(&mut self, state: QueuePairState) -> &mut Self {
        self.attr.qp_state = state as _;
        self.attr_mask |= QueuePairAttributeMask::State;
        self
    }

    /// Get the [`QueuePair`] state you filled in or queried from [`QueuePair::query`].
    pub fn state(&self) -> QueuePairState {
        self.attr.qp_state.into()
    }

    /// Setup the primary `p_key` index.
    pub fn setup_pkey_index(&mut self, pkey_index: u16) -> &mut Self {
        self.attr.pkey_index = pkey_index;
        self.attr_mask |= QueuePairAttributeMask::PartitionKeyIndex;
        self
    }

    pub fn pkey_index(&self) -> u16 {
        self.attr.pkey_index
    }

    /// Setup the primary physical port number associated with this [`QueuePair`].
    ///
    /// # Notice
    ///
    /// RDMA port number starts with `1`.
    ///
    pub fn setup_port(&mut self, port_num: u8) -> &mut Self {
        self.attr.port_num = port_num;
        self.attr_mask |= QueuePairAttributeMask::Port;
        self
    }

    pub fn port(&self) -> u8 {
        self.attr.port_num
    }

    /// Setup the queue key (QKey) for this [`QueuePair`], only valid for
    /// [`UnreliableDatagram`](QueuePairType::UnreliableDatagram) [`QueuePair`]s.
    pub fn setup_qkey(&mut self, qkey: u32) -> &mut Self {
        self.attr.qkey = qkey;
        self.attr_mask |= QueuePairAttributeMask::QueueKey;
        self
    }

    pub fn qkey(&self) -> u32 {
        self.attr.qkey
    }

    /// Setup allowed remote operations for incoming packets. It's either 0 or
    /// the bitwise `OR` of one or more of the following flags.
    ///
    /// - [`AccessFlags::RemoteWrite`]: Allowing incoming RDMA Writes on this [`QueuePair`]
    /// - [`AccessFlags::RemoteRead`]: Allowing incoming RDMA Reads on this [`QueuePair`]
    /// - [`AccessFlags::RemoteAtomic`]: Allowing incoming Atomic operations on this [`QueuePair`]
    ///
    /// # Notice
    ///
    /// Only valid for [`ReliableConnection`] and [`UnreliableConnection`] [`QueuePair`]s.
    ///
    /// [`ReliableConnection`]: QueuePairType::ReliableConnection
    /// [`UnreliableConnection`]: QueuePairType::UnreliableConnection
    ///
    pub fn setup_access_flags(&mut self, access_flags: AccessFlags) -> &mut Self {
        self.attr.qp_access_flags = access_flags.bits as _;
        self.attr_mask |= QueuePairAttributeMask::AccessFlags;
        self
    }

    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from(self.attr.qp_access_flags as i32)
    }

    /// Setup the path MTU, which is the maximum payload size of a packet that can be transferred in
    /// the path.
    pub fn setup_path_mtu(&mut self, path_mtu: Mtu) -> &mut Self {
        self.attr.path_mtu = path_mtu as _;
        self.attr_mask |= QueuePairAttributeMask::PathMtu;
        self
    }

    pub fn path_mtu(&self) -> Mtu {
        self.attr.path_mtu.into()
    }

    /// Setup the destination [`QueuePair`] number for setting up a new connection, 24 bits only.
    /// After connection set up, you could only send data to / recv data from this [`QueuePair`]
    /// number.
    pub fn setup_dest_qp_num(&mut self, dest_qp_num: u32) -> &mut Self {
        self.attr.dest_qp_num = dest_qp_num;
        self.attr_mask |= QueuePairAttributeMask::DestinationQueuePairNumber;
        self
    }

    pub fn dest_qp_num(&self) -> u32 {
        self.attr.dest_qp_num
    }

    /// Setup the initial Packet Sequence Number (PSN) expected in received packets, which has to
    /// match the remote side's sq psn. 24 bits only.
    pub fn setup_rq_psn(&mut self, rq_psn: u32) -> &mut Self {
        self.attr.rq_psn = rq_psn;
        self.attr_mask |= QueuePairAttributeMask::ReceiveQueuePacketSequenceNumber;
        self
    }

    pub fn rq_psn(&self) -> u32 {
        self.attr.rq_psn
    }

    /// Setup the initial Packet Sequence Number (PSN) to be used in sent packets from this
    /// [`QueuePair`], 24 bits only.
    pub fn setup_sq_psn(&mut self, sq_psn: u32) -> &mut Self {
        self.attr.sq_psn = sq_psn;
        self.attr_mask |= QueuePairAttributeMask::SendQueuePacketSequenceNumber;
        self
    }

    pub fn sq_psn(&self) -> u32 {
        self.attr.sq_psn
    }

    /// Setup the number of RDMA Read & atomic operations outstanding at any time that can be
    /// handled by this [`QueuePair`] as an **initiator**.
    pub fn setup_max_read_atomic(&mut self, max_read_atomic: u8) -> &mut Self {
        self.attr.max_rd_atomic = max_read_atomic;
        self.attr_mask |= QueuePairAttributeMask::MaxReadAtomic;
        self
    }

    pub fn max_read_atomic(&self) -> u8 {
        self.attr.max_rd_atomic
    }

    /// Setup the number of RDMA Read & atomic operations outstanding at any time that can be
    /// handled by this [`QueuePair`] as a **destination**.
    pub fn setup_max_dest_read_atomic(&mut self, max_dest_read_atomic: u8) -> &mut Self {
        self.attr.max_dest_rd_atomic = max_dest_read_atomic;
        self.attr_mask |= QueuePairAttributeMask::MaxDestinationReadAtomic;
        self
    }

    pub fn max_dest_read_atomic(&self) -> u8 {
        self.attr.max_dest_rd_atomic
    }

    /// Setup the minimum Receiver Not Ready (RNR) NACK timeout.
    pub fn setup_min_rnr_timer(&mut self, min_rnr_timer: u8) -> &mut Self {
        self.attr.min_rnr_timer = min_rnr_timer;
        self.attr_mask |= QueuePairAttributeMask::MinResponderNotReadyTimer;
        self
    }

    pub fn min_rnr_timer(&self) -> u8 {
        self.attr.min_rnr_timer
    }

    /// Setup the minimum time a [`QueuePair`] waits for an ACK / NACK before retransmitting,
    /// `4.096 * 2 ^ timeout` usec. `0` waits forever.
    pub fn setup_timeout(&mut self, timeout: u8) -> &mut Self {
        self.attr.timeout = timeout;
        self.attr_mask |= QueuePairAttributeMask::Timeout;
        self
    }

    pub fn timeout(&self) -> u8 {
        self.attr.timeout
    }

    /// Setup how many times a packet is resent before reporting
    /// [`RetryCounterExceededError`](super::completion::WorkCompletionStatus::RetryCounterExceededError).
    pub fn setup_retry_cnt(&mut self, retry_cnt: u8) -> &mut Self {
        self.attr.retry_cnt = retry_cnt;
        self.attr_mask |= QueuePairAttributeMask::RetryCount;
        self
    }

    pub fn retry_cnt(&self) -> u8 {
        self.attr.retry_cnt
    }

    /// Setup how many times a packet is resent after an RNR NACK, `7` retries forever.
    pub fn setup_rnr_retry(&mut self, rnr_retry: u8) -> &mut Self {
        self.attr.rnr_retry = rnr_retry;
        self.attr_mask |= QueuePairAttributeMask::ResponderNotReadyRetryCount;
        self
    }

    pub fn rnr_retry(&self) -> u8 {
        self.attr.rnr_retry
    }

    /// Setup the address vector of the primary path which describes the path information of the
    /// remote [`QueuePair`], for detailed information, you could take [`AddressHandleAttribute`] as
    /// a reference.
    pub fn setup_address_vector(&mut self, ah_attr: &AddressHandleAttribute) -> &mut Self {
        self.attr.ah_attr = ah_attr.attr;
        self.attr_mask |= QueuePairAttributeMask::AddressVector;
        self
    }

    pub fn address_vector(&self) -> AddressHandleAttribute {
        AddressHandleAttribute {
            attr: self.attr.ah_attr,
        }
    }
}

/// Describes the requested attributes of a newly created [`QueuePair`].
pub struct QueuePairInitAttribute {
    init_attr: ibv_qp_init_attr,
}

impl Default for QueuePairInitAttribute {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuePairInitAttribute {
    pub fn new() -> Self {
        QueuePairInitAttribute {
            init_attr: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    pub fn max_send_wr(&self) -> u32 {
        self.init_attr.cap.max_send_wr
    }

    pub fn max_recv_wr(&self) -> u32 {
        self.init_attr.cap.max_recv_wr
    }

    pub fn max_send_sge(&self) -> u32 {
        self.init_attr.cap.max_send_sge
    }

    pub fn max_recv_sge(&self) -> u32 {
        self.init_attr.cap.max_recv_sge
    }

    /// The maximum message size (in bytes) that can be posted inline to the Send Queue. 0, if no
    /// inline message is requested.
    pub fn max_inline_data(&self) -> u32 {
        self.init_attr.cap.max_inline_data
    }

    pub fn sq_sig_all(&self) -> bool {
        self.init_attr.sq_sig_all != 0
    }
}

/// The basic [`PostSendGuard`] that works for [`BasicQueuePair`], chaining `ibv_send_wr`s.
pub struct BasicPostSendGuard<'qp> {
    qp: NonNull<ibv_qp>,
    scratch: &'qp mut SendScratch,
    regions: &'qp mut RegionLedger,
}

impl Drop for BasicPostSendGuard<'_> {
    fn drop(&mut self) {
        self.scratch.clear();
        self.regions.abort();
    }
}

impl PostSendGuard for BasicPostSendGuard<'_> {
    fn construct_wr(&mut self, wr_id: u64, wr_flags: WorkRequestFlags) -> WorkRequestHandle<'_, Self> {
        self.scratch.wrs.push(ibv_send_wr {
            wr_id,
            next: null_mut(),
            sg_list: null_mut(),
            num_sge: 0,
            opcode: 0,
            send_flags: wr_flags.bits,
            ..unsafe { MaybeUninit::zeroed().assume_init() }
        });
        self.regions.construct(wr_id);

        WorkRequestHandle { guard: self }
    }

    /// Post all previously setuped RDMA Work Requests into the [`BasicQueuePair`]'s send queue,
    /// using `ibv_post_send`.
    fn post(self) -> Result<(), PostSendError> {
        let scratch = &mut *self.scratch;
        if scratch.wrs.is_empty() {
            return Ok(());
        }

        for &(sge, offset) in &scratch.inline_sges {
            scratch.sges[sge].addr = scratch.inline[offset..].as_ptr() as u64;
        }

        let mut sge_index = 0;
        let count = scratch.wrs.len();
        let wrs = scratch.wrs.as_mut_ptr();
        for i in 0..count {
            let wr = &mut scratch.wrs[i];
            // Set up the linked list
            wr.next = if i + 1 < count { unsafe { wrs.add(i + 1) } } else { null_mut() };

            // Set up the sg_list
            if wr.num_sge > 0 {
                wr.sg_list = unsafe { scratch.sges.as_mut_ptr().add(sge_index) };
                sge_index += wr.num_sge as usize;
            }
        }

        let mut bad_wr: *mut ibv_send_wr = null_mut();
        let ret = unsafe { (verbs().post_send)(self.qp.as_ptr(), wrs, &mut bad_wr) };
        let result = errno_result(ret).map_err(|err| PostSendError {
            accepted: accepted_before(wrs, bad_wr),
            source: err.into(),
        });
        self.regions.commit(result.as_ref().map_or_else(|err| err.accepted, |_| count));
        result
    }
}

fn accepted_before<T>(head: *mut T, bad: *mut T) -> usize {
    if bad.is_null() {
        0
    } else {
        // bad_wr points into the chain we handed over
        unsafe { bad.offset_from(head) }.max(0) as usize
    }
}

impl private_traits::PostSendGuard for BasicPostSendGuard<'_> {
    fn setup_send(&mut self) {
        self.scratch.last_wr().opcode = WorkRequestOperationType::Send as _;
    }

    fn setup_send_imm(&mut self, imm_data: u32) {
        let wr = self.scratch.last_wr();
        wr.opcode = WorkRequestOperationType::SendWithImmediate as _;
        wr.imm_data_invalidated_rkey_union.imm_data = imm_data.to_be();
    }

    fn setup_ud_addr(&mut self, ah: &AddressHandle, remote_qpn: u32, remote_qkey: u32) {
        let wr = self.scratch.last_wr();
        wr.wr.ud.ah = ah.ah().as_ptr();
        wr.wr.ud.remote_qpn = remote_qpn;
        wr.wr.ud.remote_qkey = remote_qkey;
    }

    fn setup_write(&mut self, rkey: u32, remote_addr: u64) {
        let wr = self.scratch.last_wr();
        wr.opcode = WorkRequestOperationType::Write as _;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
    }

    fn setup_write_imm(&mut self, rkey: u32, remote_addr: u64, imm_data: u32) {
        let wr = self.scratch.last_wr();
        wr.opcode = WorkRequestOperationType::WriteWithImmediate as _;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        wr.imm_data_invalidated_rkey_union.imm_data = imm_data.to_be();
    }

    fn setup_read(&mut self, rkey: u32, remote_addr: u64) {
        let wr = self.scratch.last_wr();
        wr.opcode = WorkRequestOperationType::Read as _;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
    }

    fn setup_atomic_cmp_swp(&mut self, rkey: u32, remote_addr: u64, compare: u64, swap: u64) {
        let wr = self.scratch.last_wr();
        wr.opcode = WorkRequestOperationType::AtomicCompareAndSwap as _;
        wr.wr.atomic.remote_addr = remote_addr;
        wr.wr.atomic.rkey = rkey;
        wr.wr.atomic.compare_add = compare;
        wr.wr.atomic.swap = swap;
    }

    fn setup_atomic_fetch_add(&mut self, rkey: u32, remote_addr: u64, add: u64) {
        let wr = self.scratch.last_wr();
        wr.opcode = WorkRequestOperationType::AtomicFetchAndAdd as _;
        wr.wr.atomic.remote_addr = remote_addr;
        wr.wr.atomic.rkey = rkey;
        wr.wr.atomic.compare_add = add;
    }

    // Inline data is copied into the scratch buffer right away, the caller may reuse its buffer
    // before posting. That is one copy more than the native inline path, in exchange for the same
    // interface on both queue pair flavours.
    fn setup_inline_data(&mut self, buf: &[u8]) {
        self.scratch.push_inline(buf.iter().copied());
    }

    // Most providers copy an inline list into one contiguous buffer behind a single sge, do the
    // same.
    fn setup_inline_data_list(&mut self, bufs: &[IoSlice<'_>]) {
        self.scratch
            .push_inline(bufs.iter().flat_map(|slice| slice.iter().copied()));
    }

    unsafe fn setup_sge(&mut self, lkey: u32, addr: u64, length: u32) {
        self.scratch.sges.push(ibv_sge { addr, length, lkey });
        self.scratch.last_wr().num_sge = 1;
    }

    unsafe fn setup_sge_list(&mut self, sg_list: &[ibv_sge]) {
        self.scratch.sges.extend_from_slice(sg_list);
        self.scratch.last_wr().num_sge = sg_list.len() as _;
    }

    fn pin_region(&mut self, region: &Arc<MemoryRegion>) {
        self.regions.pin(region);
    }
}

/// The extended [`PostSendGuard`] that works for [`ExtendedQueuePair`], writing each work request
/// into the send queue as it is built. Nothing reaches the hardware before [`post`] rings the
/// doorbell, dropping the guard aborts the batch.
///
/// [`post`]: PostSendGuard::post
pub struct ExtendedPostSendGuard<'qp> {
    qp_ex: NonNull<ibv_qp_ex>,
    ops: &'static ExtendedVerbs,
    data_bufs: &'qp mut Vec<ibv_data_buf>,
    regions: &'qp mut RegionLedger,
    // ibv_wr_set_ud_addr applies to the request the opcode call opened, so it waits for it
    ud_addr: Option<(NonNull<ibv_ah>, u32, u32)>,
    completed: bool,
}

impl ExtendedPostSendGuard<'_> {
    fn apply_ud_addr(&mut self) {
        if let Some((ah, remote_qpn, remote_qkey)) = self.ud_addr.take() {
            unsafe { (self.ops.wr_set_ud_addr)(self.qp_ex.as_ptr(), ah.as_ptr(), remote_qpn, remote_qkey) };
        }
    }
}

impl PostSendGuard for ExtendedPostSendGuard<'_> {
    fn construct_wr(&mut self, wr_id: u64, wr_flags: WorkRequestFlags) -> WorkRequestHandle<'_, Self> {
        unsafe {
            self.qp_ex.as_mut().wr_id = wr_id;
            self.qp_ex.as_mut().wr_flags = wr_flags.bits;
        }
        self.ud_addr = None;
        self.regions.construct(wr_id);
        WorkRequestHandle { guard: self }
    }

    /// Post all previously setuped RDMA Work Requests with `ibv_wr_complete`. The batch is posted
    /// as a whole or not at all, so `accepted` is `0` on failure.
    fn post(mut self) -> Result<(), PostSendError> {
        self.completed = true;
        let ret = unsafe { (self.ops.wr_complete)(self.qp_ex.as_ptr()) };
        let result = errno_result(ret).map_err(|err| PostSendError {
            accepted: 0,
            source: err.into(),
        });
        self.regions.commit(if result.is_ok() { usize::MAX } else { 0 });
        result
    }
}

impl Drop for ExtendedPostSendGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            unsafe { (self.ops.wr_abort)(self.qp_ex.as_ptr()) };
        }
        self.regions.abort();
    }
}

impl private_traits::PostSendGuard for ExtendedPostSendGuard<'_> {
    fn setup_send(&mut self) {
        unsafe { (self.ops.wr_send)(self.qp_ex.as_ptr()) };
        self.apply_ud_addr();
    }

    fn setup_send_imm(&mut self, imm_data: u32) {
        unsafe { (self.ops.wr_send_imm)(self.qp_ex.as_ptr(), imm_data.to_be()) };
        self.apply_ud_addr();
    }

    fn setup_ud_addr(&mut self, ah: &AddressHandle, remote_qpn: u32, remote_qkey: u32) {
        self.ud_addr = Some((ah.ah(), remote_qpn, remote_qkey));
    }

    fn setup_write(&mut self, rkey: u32, remote_addr: u64) {
        unsafe { (self.ops.wr_rdma_write)(self.qp_ex.as_ptr(), rkey, remote_addr) };
    }

    fn setup_write_imm(&mut self, rkey: u32, remote_addr: u64, imm_data: u32) {
        unsafe { (self.ops.wr_rdma_write_imm)(self.qp_ex.as_ptr(), rkey, remote_addr, imm_data.to_be()) };
    }

    fn setup_read(&mut self, rkey: u32, remote_addr: u64) {
        unsafe { (self.ops.wr_rdma_read)(self.qp_ex.as_ptr(), rkey, remote_addr) };
    }

    fn setup_atomic_cmp_swp(&mut self, rkey: u32, remote_addr: u64, compare: u64, swap: u64) {
        unsafe { (self.ops.wr_atomic_cmp_swp)(self.qp_ex.as_ptr(), rkey, remote_addr, compare, swap) };
    }

    fn setup_atomic_fetch_add(&mut self, rkey: u32, remote_addr: u64, add: u64) {
        unsafe { (self.ops.wr_atomic_fetch_add)(self.qp_ex.as_ptr(), rkey, remote_addr, add) };
    }

    fn setup_inline_data(&mut self, buf: &[u8]) {
        unsafe { (self.ops.wr_set_inline_data)(self.qp_ex.as_ptr(), buf.as_ptr() as _, buf.len()) }
    }

    fn setup_inline_data_list(&mut self, bufs: &[IoSlice<'_>]) {
        self.data_bufs.clear();
        self.data_bufs.extend(bufs.iter().map(|x| ibv_data_buf {
            addr: x.as_ptr() as _,
            length: x.len(),
        }));

        unsafe { (self.ops.wr_set_inline_data_list)(self.qp_ex.as_ptr(), self.data_bufs.len(), self.data_bufs.as_ptr()) };
    }

    unsafe fn setup_sge(&mut self, lkey: u32, addr: u64, length: u32) {
        (self.ops.wr_set_sge)(self.qp_ex.as_ptr(), lkey, addr, length);
    }

    unsafe fn setup_sge_list(&mut self, sg_list: &[ibv_sge]) {
        (self.ops.wr_set_sge_list)(self.qp_ex.as_ptr(), sg_list.len(), sg_list.as_ptr());
    }

    fn pin_region(&mut self, region: &Arc<MemoryRegion>) {
        self.regions.pin(region);
    }
}

/// A [`PostRecvGuard`] that can be used to construct and post recv RDMA Work Requests.
pub struct PostRecvGuard<'qp> {
    qp: NonNull<ibv_qp>,
    scratch: &'qp mut RecvScratch,
    regions: &'qp mut RegionLedger,
}

impl Drop for PostRecvGuard<'_> {
    fn drop(&mut self) {
        self.scratch.wrs.clear();
        self.scratch.sges.clear();
        self.regions.abort();
    }
}

impl<'qp> PostRecvGuard<'qp> {
    fn new(qp: NonNull<ibv_qp>, scratch: &'qp mut RecvScratch, regions: &'qp mut RegionLedger) -> Self {
        scratch.wrs.clear();
        scratch.sges.clear();
        regions.begin();
        PostRecvGuard { qp, scratch, regions }
    }

    /// Construct a new [`RecvWorkRequestHandle`] for setting up a new RDMA Work Request, every
    /// [`QueuePair`] holds only one [`RecvWorkRequestHandle`] at the same time.
    pub fn construct_wr<'g>(&'g mut self, wr_id: u64) -> RecvWorkRequestHandle<'g, 'qp> {
        self.scratch.wrs.push(ibv_recv_wr {
            wr_id,
            next: null_mut(),
            sg_list: null_mut(),
            num_sge: 0,
        });
        self.regions.construct(wr_id);

        RecvWorkRequestHandle { guard: self }
    }

    /// Post all previously setuped receive Work Requests with `ibv_post_recv`.
    pub fn post(self) -> Result<(), PostRecvError> {
        let scratch = &mut *self.scratch;
        if scratch.wrs.is_empty() {
            return Ok(());
        }

        let mut sge_index = 0;
        let count = scratch.wrs.len();
        let wrs = scratch.wrs.as_mut_ptr();
        for i in 0..count {
            let wr = &mut scratch.wrs[i];
            wr.next = if i + 1 < count { unsafe { wrs.add(i + 1) } } else { null_mut() };
            if wr.num_sge > 0 {
                wr.sg_list = unsafe { scratch.sges.as_mut_ptr().add(sge_index) };
                sge_index += wr.num_sge as usize;
            }
        }

        let mut bad_wr: *mut ibv_recv_wr = null_mut();
        let ret = unsafe { (verbs().post_recv)(self.qp.as_ptr(), wrs, &mut bad_wr) };
        let result = errno_result(ret).map_err(|err| PostRecvError {
            accepted: accepted_before(wrs, bad_wr),
            source: err.into(),
        });
        self.regions.commit(result.as_ref().map_or_else(|err| err.accepted, |_| count));
        result
    }
}

/// A handle that user would use to fill the concrete information of the **recv** RDMA Work Request.
pub struct RecvWorkRequestHandle<'g, 'qp> {
    guard: &'g mut PostRecvGuard<'qp>,
}

impl SetScatterGatherEntry for RecvWorkRequestHandle<'_, '_> {
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32) {
        if let Some(wr) = self.guard.scratch.wrs.last_mut() {
            wr.num_sge = 1;
            self.guard.scratch.sges.push(ibv_sge { addr, length, lkey });
        }
    }

    unsafe fn setup_sge_list(self, sg_list: &[ibv_sge]) {
        if let Some(wr) = self.guard.scratch.wrs.last_mut() {
            wr.num_sge = sg_list.len() as _;
            self.guard.scratch.sges.extend_from_slice(sg_list);
        }
    }

    fn setup_sge_from(self, region: &Arc<MemoryRegion>, offset: usize, len: u32) -> Result<(), RegionRangeError> {
        let sge = region.checked_sge(offset, len)?;
        self.guard.regions.pin(region);
        unsafe { self.setup_sge(sge.lkey, sge.addr, sge.length) };
        Ok(())
    }
}

/// A unified interface for [`BasicQueuePair`] and [`ExtendedQueuePair`], implemented with enum
/// dispatching.
#[derive(Debug)]
pub enum GenericQueuePair {
    /// Variant for a Basic Queue Pair
    Basic(BasicQueuePair),
    /// Variant for an Extended Queue Pair
    Extended(ExtendedQueuePair),
}

impl GenericQueuePair {
    pub fn is_extended(&self) -> bool {
        matches!(self, GenericQueuePair::Extended(_))
    }
}

impl QueuePair for GenericQueuePair {
    unsafe fn qp(&self) -> NonNull<ibv_qp> {
        match self {
            GenericQueuePair::Basic(qp) => qp.qp(),
            GenericQueuePair::Extended(qp) => qp.qp(),
        }
    }

    fn start_post_recv(&mut self) -> PostRecvGuard<'_> {
        match self {
            GenericQueuePair::Basic(qp) => qp.start_post_recv(),
            GenericQueuePair::Extended(qp) => qp.start_post_recv(),
        }
    }

    type Guard<'g>
        = GenericPostSendGuard<'g>
    where
        Self: 'g;

    fn start_post_send(&mut self) -> Self::Guard<'_> {
        match self {
            GenericQueuePair::Basic(qp) => GenericPostSendGuard::Basic(qp.start_post_send()),
            GenericQueuePair::Extended(qp) => GenericPostSendGuard::Extended(qp.start_post_send()),
        }
    }

    fn destroy(self) -> Result<(), DestroyQueuePairError> {
        match self {
            GenericQueuePair::Basic(qp) => qp.destroy(),
            GenericQueuePair::Extended(qp) => qp.destroy(),
        }
    }
}

/// A unified interface for [`BasicPostSendGuard`] and [`ExtendedPostSendGuard`], implemented with
/// enum dispatching.
pub enum GenericPostSendGuard<'g> {
    Basic(BasicPostSendGuard<'g>),
    Extended(ExtendedPostSendGuard<'g>),
}

macro_rules! dispatch_guard {
    ($self:ident, $guard:ident => $body:expr) => {
        match $self {
            GenericPostSendGuard::Basic($guard) => $body,
            GenericPostSendGuard::Extended($guard) => $body,
        }
    };
}

impl PostSendGuard for GenericPostSendGuard<'_> {
    fn construct_wr(&mut self, wr_id: u64, wr_flags: WorkRequestFlags) -> WorkRequestHandle<'_, Self> {
        dispatch_guard!(self, guard => {
            guard.construct_wr(wr_id, wr_flags);
        });
        WorkRequestHandle { guard: self }
    }

    fn post(self) -> Result<(), PostSendError> {
        dispatch_guard!(self, guard => guard.post())
    }
}

impl private_traits::PostSendGuard for GenericPostSendGuard<'_> {
    fn setup_send(&mut self) {
        dispatch_guard!(self, guard => guard.setup_send())
    }

    fn setup_send_imm(&mut self, imm_data: u32) {
        dispatch_guard!(self, guard => guard.setup_send_imm(imm_data))
    }

    fn setup_ud_addr(&mut self, ah: &AddressHandle, remote_qpn: u32, remote_qkey: u32) {
        dispatch_guard!(self, guard => guard.setup_ud_addr(ah, remote_qpn, remote_qkey))
    }

    fn setup_write(&mut self, rkey: u32, remote_addr: u64) {
        dispatch_guard!(self, guard => guard.setup_write(rkey, remote_addr))
    }

    fn setup_write_imm(&mut self, rkey: u32, remote_addr: u64, imm_data: u32) {
        dispatch_guard!(self, guard => guard.setup_write_imm(rkey, remote_addr, imm_data))
    }

    fn setup_read(&mut self, rkey: u32, remote_addr: u64) {
        dispatch_guard!(self, guard => guard.setup_read(rkey, remote_addr))
    }

    fn setup_atomic_cmp_swp(&mut self, rkey: u32, remote_addr: u64, compare: u64, swap: u64) {
        dispatch_guard!(self, guard => guard.setup_atomic_cmp_swp(rkey, remote_addr, compare, swap))
    }

    fn setup_atomic_fetch_add(&mut self, rkey: u32, remote_addr: u64, add: u64) {
        dispatch_guard!(self, guard => guard.setup_atomic_fetch_add(rkey, remote_addr, add))
    }

    fn setup_inline_data(&mut self, buf: &[u8]) {
        dispatch_guard!(self, guard => guard.setup_inline_data(buf))
    }

    fn setup_inline_data_list(&mut self, bufs: &[IoSlice<'_>]) {
        dispatch_guard!(self, guard => guard.setup_inline_data_list(bufs))
    }

    unsafe fn setup_sge(&mut self, lkey: u32, addr: u64, length: u32) {
        dispatch_guard!(self, guard => guard.setup_sge(lkey, addr, length))
    }

    unsafe fn setup_sge_list(&mut self, sg_list: &[ibv_sge]) {
        dispatch_guard!(self, guard => guard.setup_sge_list(sg_list))
    }

    fn pin_region(&mut self, region: &Arc<MemoryRegion>) {
        dispatch_guard!(self, guard => guard.pin_region(region))
    }
}

impl From<BasicQueuePair> for GenericQueuePair {
    fn from(qp: BasicQueuePair) -> Self {
        GenericQueuePair::Basic(qp)
    }
}

impl From<ExtendedQueuePair> for GenericQueuePair {
    fn from(qp: ExtendedQueuePair) -> Self {
        GenericQueuePair::Extended(qp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::address::GidType;
    use crate::ibverbs::device::DeviceList;
    use crate::ibverbs::device_context::DeviceContext;
    use crate::ibverbs::loopback;
    use rstest::rstest;

    fn context() -> Arc<DeviceContext> {
        loopback::install().unwrap();
        DeviceList::new().unwrap().get(0).unwrap().open().unwrap()
    }

    fn rtr_attr(ctx: &DeviceContext, dest_qp_num: u32) -> QueuePairAttribute {
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
            .setup_rq_psn(1024)
            .setup_max_dest_read_atomic(0)
            .setup_min_rnr_timer(0)
            .setup_address_vector(&ah_attr);
        attr
    }

    fn init_attr() -> QueuePairAttribute {
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::Init)
            .setup_pkey_index(0)
            .setup_port(1)
            .setup_access_flags(AccessFlags::RemoteWrite);
        attr
    }

    #[test]
    fn test_query_qp() -> anyhow::Result<()> {
        let ctx = context();
        let pd = ctx.alloc_pd()?;
        let cq = GenericCompletionQueue::from(ctx.create_cq_builder().setup_cqe(2).build_ex()?);

        let mut qp = pd
            .create_qp_builder()
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq.clone())
            .build()?;
        assert_eq!(qp.state(), QueuePairState::Reset);
        assert_eq!(qp.qp_type(), QueuePairType::ReliableConnection);

        qp.modify(&init_attr())?;
        qp.modify(&rtr_attr(&ctx, 1024))?;
        assert_eq!(qp.state(), QueuePairState::ReadyToReceive);

        let mask = QueuePairAttributeMask::AccessFlags
            | QueuePairAttributeMask::PathMtu
            | QueuePairAttributeMask::DestinationQueuePairNumber
            | QueuePairAttributeMask::Port;
        let (attr, init_attr) = qp.query(mask)?;

        assert_eq!(attr.access_flags(), AccessFlags::RemoteWrite);
        assert_eq!(attr.dest_qp_num(), 1024);
        assert_eq!(attr.path_mtu(), Mtu::Mtu1024);
        assert_eq!(attr.port(), 1);

        assert!(init_attr.max_send_wr() >= 16);
        assert!(init_attr.max_recv_wr() >= 16);
        assert!(init_attr.max_send_sge() >= 1);
        assert!(init_attr.max_recv_sge() >= 1);
        assert!(!init_attr.sq_sig_all());
        Ok(())
    }

    #[test]
    fn test_post_recv_errors() -> anyhow::Result<()> {
        let ctx = context();
        let pd = ctx.alloc_pd()?;
        let mut memory = [0u8; 16];
        let mr = unsafe {
            pd.reg_mr(
                memory.as_mut_ptr() as usize,
                memory.len(),
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
            )?
        };
        let cq = ctx.create_cq_builder().setup_cqe(2).build_generic()?;

        let mut qp = pd
            .create_qp_builder()
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq.clone())
            .setup_max_recv_wr(1)
            .build_generic()?;

        let mut guard = qp.start_post_recv();
        unsafe { guard.construct_wr(1).setup_sge(mr.lkey(), mr.get_ptr() as u64, 1) };
        match guard.post() {
            Err(PostRecvError {
                accepted: 0,
                source: PostRecvErrorKind::InvalidWorkRequest(_),
            }) => {},
            other => panic!("Expected InvalidWorkRequest error, got: {other:?}"),
        }

        qp.modify(&init_attr())?;
        qp.modify(&rtr_attr(&ctx, 1024))?;

        let mut guard = qp.start_post_recv();
        for i in 0..128 {
            unsafe { guard.construct_wr(i).setup_sge(mr.lkey(), mr.get_ptr() as u64, 1) };
        }
        match guard.post() {
            Err(PostRecvError {
                accepted: 1,
                source: PostRecvErrorKind::NotEnoughResources(_),
            }) => {},
            other => panic!("Expected NotEnoughResources error, got: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_modify_is_validated_before_the_native_call() -> anyhow::Result<()> {
        let ctx = context();
        let pd = ctx.alloc_pd()?;
        let cq = ctx.create_cq_builder().build_generic()?;
        let mut qp = pd
            .create_qp_builder()
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq)
            .build_generic()?;
        let before = loopback::modify_calls(qp.qp_number());

        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::Init)
            .setup_pkey_index(0)
            .setup_access_flags(AccessFlags::RemoteWrite)
            .setup_qkey(7);
        let err = qp.modify(&attr).unwrap_err();
        match err.0 {
            ModifyQueuePairErrorKind::Transition(TransitionError::InvalidAttributeMask {
                cur_state: QueuePairState::Reset,
                next_state: QueuePairState::Init,
                invalid,
                needed,
            }) => {
                assert_eq!(invalid, QueuePairAttributeMask::QueueKey);
                assert_eq!(needed, QueuePairAttributeMask::Port);
            },
            other => panic!("Expected InvalidAttributeMask, got: {other:?}"),
        }
        assert_eq!(loopback::modify_calls(qp.qp_number()), before);
        assert_eq!(qp.state(), QueuePairState::Reset);

        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::ReadyToSend);
        assert!(matches!(
            qp.modify(&attr).unwrap_err().0,
            ModifyQueuePairErrorKind::Transition(TransitionError::InvalidTransition { .. })
        ));
        Ok(())
    }

    #[rstest]
    #[case::routing_index_out_of_table(9, None)]
    #[case::foreign_destination(0, Some("fd00::42"))]
    fn test_unresolvable_route_times_out(
        #[case] sgid_index: u8, #[case] dest: Option<&str>,
    ) -> anyhow::Result<()> {
        let ctx = context();
        let pd = ctx.alloc_pd()?;
        let cq = ctx.create_cq_builder().build()?;
        let mut qp = pd
            .create_qp_builder()
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq)
            .build()?;
        qp.modify(&init_attr())?;

        let mut attr = rtr_attr(&ctx, 1024);
        let mut ah_attr = attr.address_vector();
        ah_attr.setup_grh_src_gid_index(sgid_index);
        if let Some(dest) = dest {
            ah_attr.setup_grh_dest_gid(&dest.parse::<std::net::Ipv6Addr>()?.into());
        }
        attr.setup_address_vector(&ah_attr);

        match qp.modify(&attr).unwrap_err().0 {
            ModifyQueuePairErrorKind::ResolveRouteTimedout { sgid_index: index, gid, source } => {
                assert_eq!(index, sgid_index);
                assert_eq!(gid, ah_attr.dest_gid());
                assert_eq!(source.raw_os_error(), Some(libc::ETIMEDOUT));
            },
            other => panic!("Expected ResolveRouteTimedout, got: {other:?}"),
        }
        assert_eq!(qp.state(), QueuePairState::Init);
        Ok(())
    }

    #[test]
    fn test_build_without_completion_queue() -> anyhow::Result<()> {
        let ctx = context();
        let pd = ctx.alloc_pd()?;
        let cq = ctx.create_cq_builder().build()?;

        let err = pd.create_qp_builder().setup_send_cq(cq).build().unwrap_err();
        assert_eq!(err.qp_type, QueuePairType::ReliableConnection);
        assert!(matches!(err.source, CreateQueuePairErrorKind::MissingCompletionQueue("receive")));
        Ok(())
    }

    #[test]
    fn test_queue_pair_keeps_completion_queue_alive() -> anyhow::Result<()> {
        let ctx = context();
        let pd = ctx.alloc_pd()?;
        let cq = ctx.create_cq_builder().build_ex()?;
        let qp = pd
            .create_qp_builder()
            .setup_qp_type(QueuePairType::UnreliableDatagram)
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq.clone())
            .build_ex()?;
        assert_eq!(qp.qp_type(), QueuePairType::UnreliableDatagram);

        let cq = match cq.destroy().unwrap_err().0 {
            crate::ibverbs::completion::DestroyCompletionQueueErrorKind::InUse { shares: 2, cq } => cq,
            other => panic!("Expected InUse, got: {other:?}"),
        };
        qp.destroy()?;
        cq.destroy()?;
        Ok(())
    }

    #[test]
    fn test_dropped_guard_discards_work_requests() -> anyhow::Result<()> {
        let ctx = context();
        let pd = ctx.alloc_pd()?;
        let cq = ctx.create_cq_builder().build()?;
        let mut qp = pd
            .create_qp_builder()
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq)
            .build()?;

        {
            let mut guard = qp.start_post_send();
            guard.construct_wr(1, WorkRequestFlags::Signaled).setup_send().setup_inline_data(b"dropped");
        }
        assert!(qp.send.wrs.is_empty());
        assert!(qp.send.inline.is_empty());

        // posting an empty batch never reaches the native layer
        let calls = loopback::submission_calls(qp.qp_number());
        qp.start_post_send().post()?;
        assert_eq!(loopback::submission_calls(qp.qp_number()), calls);
        Ok(())
    }

    #[test]
    fn test_inline_data_is_copied_at_construction() {
        let mut scratch = SendScratch::default();
        scratch.wrs.push(unsafe { MaybeUninit::zeroed().assume_init() });
        scratch.push_inline(b"abc".iter().copied());
        scratch.wrs.push(unsafe { MaybeUninit::zeroed().assume_init() });
        let parts = [IoSlice::new(b"de"), IoSlice::new(b"f")];
        scratch.push_inline(parts.iter().flat_map(|slice| slice.iter().copied()));

        assert_eq!(scratch.inline, b"abcdef");
        assert_eq!(scratch.inline_sges, vec![(0, 0), (1, 3)]);
        assert_eq!(scratch.sges[1].length, 3);
        assert_eq!(scratch.wrs[1].send_flags & WorkRequestFlags::Inline.bits, WorkRequestFlags::Inline.bits);
    }

    #[rstest]
    #[case(QueuePairType::ReliableConnection)]
    #[case(QueuePairType::UnreliableConnection)]
    #[case(QueuePairType::UnreliableDatagram)]
    #[case(QueuePairType::ReliableConnectionExtendedSend)]
    fn test_qp_type_serde(#[case] qp_type: QueuePairType) {
        let json = serde_json::to_string(&qp_type).unwrap();
        assert_eq!(serde_json::from_str::<QueuePairType>(&json).unwrap(), qp_type);
        assert_eq!(QueuePairType::from(qp_type as u32), qp_type);
    }

    #[rstest]
    #[case::rtr_timeout(QueuePairState::ReadyToReceive, true, libc::ETIMEDOUT, "route timed out")]
    #[case::rtr_unreachable(QueuePairState::ReadyToReceive, true, libc::ENETUNREACH, "unreachable")]
    #[case::rtr_other(QueuePairState::ReadyToReceive, true, libc::EINVAL, "native")]
    #[case::rtr_without_address(QueuePairState::ReadyToReceive, false, libc::ETIMEDOUT, "native")]
    #[case::rts_timeout(QueuePairState::ReadyToSend, false, libc::ETIMEDOUT, "native")]
    #[case::rts_unreachable(QueuePairState::ReadyToSend, true, libc::ENETUNREACH, "native")]
    fn test_route_errors_map_only_into_rtr(
        #[case] next_state: QueuePairState, #[case] with_address: bool, #[case] errno: i32, #[case] expected: &str,
    ) {
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(next_state);
        if with_address {
            attr.setup_address_vector(&AddressHandleAttribute::new());
        }

        let kind = ModifyQueuePairErrorKind::from_native(&attr, next_state, io::Error::from_raw_os_error(errno));
        let mapped = match kind {
            ModifyQueuePairErrorKind::ResolveRouteTimedout { .. } => "route timed out",
            ModifyQueuePairErrorKind::NetworkUnreachable { .. } => "unreachable",
            ModifyQueuePairErrorKind::Ibverbs(err) => {
                assert_eq!(err.raw_os_error(), Some(errno));
                "native"
            },
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(mapped, expected);
    }
}
