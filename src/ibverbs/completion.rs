//! Completion queues and the cursor-style protocol for draining them.
//!
//! A drain starts with `start_poll`, which yields `None` when nothing completed. The returned
//! poller is a cursor over [`WorkCompletion`]s and hands the consumed entries back to the
//! hardware when it ends, either through [`BasicPoller::end`] (and friends) or on drop.
//!
//! [`BasicPoller`] copies completions out and is an [`Iterator`]. [`ExtendedPoller`] and
//! [`GenericPoller`] are lending cursors: a completion they return reads the hardware entry under
//! the cursor, so it borrows the poller and is gone once the cursor moves.
//!
//! ```compile_fail
//! # use verbway::ibverbs::completion::{ExtendedCompletionQueue, WorkCompletion};
//! fn keep_a_completion(cq: &mut ExtendedCompletionQueue) -> u64 {
//!     let mut poller = cq.start_poll().unwrap().unwrap();
//!     let first = poller.next().unwrap();
//!     let _second = poller.next();
//!     first.wr_id()
//! }
//! ```
//!
//! Completion queue handles are cheap to clone. Every queue pair bound to a CQ holds a clone, so
//! the CQ outlives its queue pairs.
use std::fmt;
use std::io;
use std::mem::{self, offset_of, MaybeUninit};
use std::num::NonZeroU32;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitmask_enum::bitmask;
use rdma_mummy_sys::{
    ibv_cq, ibv_cq_ex, ibv_cq_init_attr_ex, ibv_create_cq_wc_flags, ibv_poll_cq_attr, ibv_wc, ibv_wc_flags,
    ibv_wc_opcode, ibv_wc_status,
};
use tracing::{debug, warn};

use super::device_context::DeviceContext;
use super::errno_result;
use super::in_flight::{InFlightRegistry, WorkQueue};
use super::symbols::{verbs, ExtendedVerbs};

/// Error returned by [`CompletionQueueBuilder::build`] and its variants.
#[derive(Debug, thiserror::Error)]
#[error("failed to create completion queue (cqe={cqe})")]
#[non_exhaustive]
pub struct CreateCompletionQueueError {
    pub cqe: u32,
    #[source]
    pub source: CreateCompletionQueueErrorKind,
}

/// The enum type for [`CreateCompletionQueueError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateCompletionQueueErrorKind {
    #[error("invalid completion queue attributes")]
    InvalidArgument,
    #[error("not enough resources to create the completion queue")]
    ResourceExhausted,
    #[error("the extended completion queue interface is not available")]
    ExtendedUnavailable,
    #[error(transparent)]
    Ibverbs(io::Error),
}

impl From<io::Error> for CreateCompletionQueueErrorKind {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => CreateCompletionQueueErrorKind::InvalidArgument,
            Some(libc::ENOMEM) => CreateCompletionQueueErrorKind::ResourceExhausted,
            _ => CreateCompletionQueueErrorKind::Ibverbs(err),
        }
    }
}

impl CreateCompletionQueueError {
    fn unsupported(&self) -> bool {
        match &self.source {
            CreateCompletionQueueErrorKind::ExtendedUnavailable => true,
            CreateCompletionQueueErrorKind::Ibverbs(err) => err.raw_os_error() == Some(libc::EOPNOTSUPP),
            _ => false,
        }
    }
}

/// Error returned by `destroy` on the completion queue handles.
#[derive(Debug, thiserror::Error)]
#[error("failed to destroy completion queue")]
#[non_exhaustive]
pub struct DestroyCompletionQueueError(#[from] pub DestroyCompletionQueueErrorKind);

/// The enum type for [`DestroyCompletionQueueError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DestroyCompletionQueueErrorKind {
    #[error("completion queue is still shared by {shares} other handles")]
    InUse { shares: usize, cq: GenericCompletionQueue },
    #[error(transparent)]
    Ibverbs(#[from] io::Error),
}

/// Error returned by `start_poll`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PollCompletionQueueError {
    #[error("poll completion queue failed")]
    Ibverbs(#[from] io::Error),
    #[error("completion queue is already being drained through another handle")]
    DrainInProgress,
}

/// A completion carrying a failure status, from [`WorkCompletion::result`].
///
/// After such a completion a reliable connection queue pair is in the error state and has to be
/// recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("work request {wr_id} completed with {status:?} (vendor_err={vendor_err:#x})")]
pub struct WorkCompletionError {
    pub wr_id: u64,
    pub status: WorkCompletionStatus,
    pub vendor_err: u32,
}

macro_rules! native_enum {
    ($(#[$meta:meta])* pub enum $name:ident : $what:literal { $($variant:ident = $value:path,)* }) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                match value {
                    $($value => $name::$variant,)*
                    _ => panic!(concat!("Unknown ", $what, ": {}"), value),
                }
            }
        }
    };
}

native_enum! {
    /// The status of a [`WorkCompletion`].
    pub enum WorkCompletionStatus : "work completion status" {
        Success = ibv_wc_status::IBV_WC_SUCCESS,
        LocalLengthError = ibv_wc_status::IBV_WC_LOC_LEN_ERR,
        LocalQueuePairOperationError = ibv_wc_status::IBV_WC_LOC_QP_OP_ERR,
        LocalEndToEndContextOperationError = ibv_wc_status::IBV_WC_LOC_EEC_OP_ERR,
        LocalProtectionError = ibv_wc_status::IBV_WC_LOC_PROT_ERR,
        WorkRequestFlushedError = ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
        MemoryWindowBindError = ibv_wc_status::IBV_WC_MW_BIND_ERR,
        BadResponseError = ibv_wc_status::IBV_WC_BAD_RESP_ERR,
        LocalAccessError = ibv_wc_status::IBV_WC_LOC_ACCESS_ERR,
        RemoteInvalidRequestError = ibv_wc_status::IBV_WC_REM_INV_REQ_ERR,
        RemoteAccessError = ibv_wc_status::IBV_WC_REM_ACCESS_ERR,
        RemoteOperationError = ibv_wc_status::IBV_WC_REM_OP_ERR,
        RetryCounterExceededError = ibv_wc_status::IBV_WC_RETRY_EXC_ERR,
        ResponderNotReadyRetryCounterExceededError = ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR,
        LocalReliableDatagramDomainViolationError = ibv_wc_status::IBV_WC_LOC_RDD_VIOL_ERR,
        RemoteInvalidReliableDatagramRequest = ibv_wc_status::IBV_WC_REM_INV_RD_REQ_ERR,
        RemoteAbortedError = ibv_wc_status::IBV_WC_REM_ABORT_ERR,
        InvalidEndToEndContextNumberError = ibv_wc_status::IBV_WC_INV_EECN_ERR,
        InvalidEndToEndContextStateError = ibv_wc_status::IBV_WC_INV_EEC_STATE_ERR,
        FatalError = ibv_wc_status::IBV_WC_FATAL_ERR,
        ResponseTimeoutError = ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR,
        GeneralError = ibv_wc_status::IBV_WC_GENERAL_ERR,
        TagMatchingError = ibv_wc_status::IBV_WC_TM_ERR,
        TagMatchingRendezvousIncomplete = ibv_wc_status::IBV_WC_TM_RNDV_INCOMPLETE,
    }
}

native_enum! {
    /// The operation a [`WorkCompletion`] reports on. Receive side completions have the
    /// [`Receive`](Self::Receive) bit set.
    pub enum WorkCompletionOperationType : "work completion opcode" {
        Send = ibv_wc_opcode::IBV_WC_SEND,
        Write = ibv_wc_opcode::IBV_WC_RDMA_WRITE,
        Read = ibv_wc_opcode::IBV_WC_RDMA_READ,
        CompareAndSwap = ibv_wc_opcode::IBV_WC_COMP_SWAP,
        FetchAndAdd = ibv_wc_opcode::IBV_WC_FETCH_ADD,
        BindMemoryWindow = ibv_wc_opcode::IBV_WC_BIND_MW,
        LocalInvalidate = ibv_wc_opcode::IBV_WC_LOCAL_INV,
        TcpSegmentationOffload = ibv_wc_opcode::IBV_WC_TSO,
        Flush = ibv_wc_opcode::IBV_WC_FLUSH,
        AtomicWrite = ibv_wc_opcode::IBV_WC_ATOMIC_WRITE,
        Receive = ibv_wc_opcode::IBV_WC_RECV,
        ReceiveWithImmediate = ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM,
        TagMatchingAdd = ibv_wc_opcode::IBV_WC_TM_ADD,
        TagMatchingDelete = ibv_wc_opcode::IBV_WC_TM_DEL,
        TagMatchingSync = ibv_wc_opcode::IBV_WC_TM_SYNC,
        TagMatchingReceive = ibv_wc_opcode::IBV_WC_TM_RECV,
        TagMatchingNoTag = ibv_wc_opcode::IBV_WC_TM_NO_TAG,
        Driver1 = ibv_wc_opcode::IBV_WC_DRIVER1,
        Driver2 = ibv_wc_opcode::IBV_WC_DRIVER2,
        Driver3 = ibv_wc_opcode::IBV_WC_DRIVER3,
    }
}

/// The fields an extended completion queue is asked to report.
#[bitmask(u64)]
#[bitmask_config(vec_debug)]
pub enum CreateCompletionQueueWorkCompletionFlags {
    ByteLength = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_BYTE_LEN.0 as _,
    ImmediateData = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_IMM.0 as _,
    QueuePairNumber = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_QP_NUM.0 as _,
    SourceQueuePair = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_SRC_QP.0 as _,
    SourceLocalIdentifier = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_SLID.0 as _,
    ServiceLevel = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_SL.0 as _,
    DestinationLocalIdentifierPathBits = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_DLID_PATH_BITS.0 as _,
    CompletionTimestamp = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_COMPLETION_TIMESTAMP.0 as _,
    CustomerVlan = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_CVLAN.0 as _,
    FlowTag = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_FLOW_TAG.0 as _,
    TagMatchingInformation = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_TM_INFO.0 as _,
    CompletionTimestampWallclock = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_COMPLETION_TIMESTAMP_WALLCLOCK.0 as _,

    StandardFlags = CreateCompletionQueueWorkCompletionFlags::ByteLength.bits
        | CreateCompletionQueueWorkCompletionFlags::ImmediateData.bits
        | CreateCompletionQueueWorkCompletionFlags::QueuePairNumber.bits
        | CreateCompletionQueueWorkCompletionFlags::SourceQueuePair.bits
        | CreateCompletionQueueWorkCompletionFlags::SourceLocalIdentifier.bits
        | CreateCompletionQueueWorkCompletionFlags::ServiceLevel.bits
        | CreateCompletionQueueWorkCompletionFlags::DestinationLocalIdentifierPathBits.bits,
}

const WITH_IMM: u32 = ibv_wc_flags::IBV_WC_WITH_IMM.0 as u32;

/// Read access to one completion, whichever queue it came from.
///
/// Reads on an extended completion go to the hardware entry under the cursor, the borrow checker
/// keeps them from outliving it.
pub trait WorkCompletion {
    /// The identifier the work request was posted with.
    fn wr_id(&self) -> u64;

    fn status(&self) -> WorkCompletionStatus;

    fn opcode(&self) -> WorkCompletionOperationType;

    fn vendor_err(&self) -> u32;

    /// Number of bytes transferred, meaningful for receives, reads and atomics.
    fn byte_len(&self) -> u32;

    /// Immediate data carried by a send or write with immediate, in host order.
    fn imm_data(&self) -> Option<u32>;

    /// Number of the local queue pair the work request belonged to.
    fn qp_num(&self) -> u32;

    /// Hardware timestamp of the completion, in device clock ticks.
    ///
    /// Only extended completion queues created with
    /// [`setup_completion_timestamp`](CompletionQueueBuilder::setup_completion_timestamp) report
    /// it.
    fn completion_timestamp(&self) -> Option<u64>;

    /// `Ok` for successful completions, the failure otherwise.
    fn result(&self) -> Result<(), WorkCompletionError> {
        match self.status() {
            WorkCompletionStatus::Success => Ok(()),
            status => Err(WorkCompletionError {
                wr_id: self.wr_id(),
                status,
                vendor_err: self.vendor_err(),
            }),
        }
    }
}

/// Access to the native completion queue.
pub trait CompletionQueue {
    /// # Safety
    ///
    /// return the basic handle of CQ;
    /// we mark this method unsafe because the lifetime of ibv_cq is not
    /// associated with the return value.
    unsafe fn cq(&self) -> NonNull<ibv_cq>;
}

/// State shared by every clone of one completion queue.
struct CompletionQueueInner {
    cq: NonNull<ibv_cq>,
    // resolved when the queue was created with the extended interface
    extended: Option<&'static ExtendedVerbs>,
    timestamps: bool,
    draining: AtomicBool,
    // regions pinned by work requests completing here
    in_flight: Arc<InFlightRegistry>,
    released: bool,
    _context: Arc<DeviceContext>,
}

unsafe impl Send for CompletionQueueInner {}
unsafe impl Sync for CompletionQueueInner {}

impl fmt::Debug for CompletionQueueInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("cq", &self.cq)
            .field("extended", &self.extended.is_some())
            .field("timestamps", &self.timestamps)
            .finish()
    }
}

impl Drop for CompletionQueueInner {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = errno_result(unsafe { (verbs().destroy_cq)(self.cq.as_ptr()) }) {
            warn!(error = %err, "failed to destroy completion queue");
        }
    }
}

impl CompletionQueueInner {
    fn begin_drain(&self) -> Result<(), PollCompletionQueueError> {
        self.draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| PollCompletionQueueError::DrainInProgress)
    }

    fn finish_drain(&self) {
        self.draining.store(false, Ordering::Release);
    }

    /// Destroy the queue if `inner` is the last share, else hand it back with the share count.
    fn destroy(inner: Arc<Self>) -> Result<Result<(), io::Error>, (usize, Arc<Self>)> {
        let mut inner = Arc::try_unwrap(inner).map_err(|inner| (Arc::strong_count(&inner) - 1, inner))?;
        inner.released = true;
        debug!(extended = inner.extended.is_some(), "CompletionQueue::destroy");
        Ok(errno_result(unsafe { (verbs().destroy_cq)(inner.cq.as_ptr()) }))
    }
}

/// A completion queue created with the classic `ibv_create_cq`, drained in batches through
/// `ibv_poll_cq`.
///
/// `ibv_poll_cq` takes completions off the ring in batches. Entries of a batch the caller did not
/// read before ending the drain stay buffered in this handle and come first on its next
/// [`start_poll`](Self::start_poll).
pub struct BasicCompletionQueue {
    inner: Arc<CompletionQueueInner>,
    wcs: Vec<ibv_wc>,
    // first entry of `wcs` not handed out yet
    next_wc: usize,
}

impl fmt::Debug for BasicCompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCompletionQueue")
            .field("inner", &self.inner)
            .field("poll_batch", &self.wcs.capacity())
            .finish()
    }
}

impl Clone for BasicCompletionQueue {
    fn clone(&self) -> Self {
        BasicCompletionQueue {
            inner: Arc::clone(&self.inner),
            wcs: Vec::with_capacity(self.wcs.capacity()),
            next_wc: 0,
        }
    }
}

impl CompletionQueue for BasicCompletionQueue {
    unsafe fn cq(&self) -> NonNull<ibv_cq> {
        self.inner.cq
    }
}

impl BasicCompletionQueue {
    /// Start draining the queue.
    ///
    /// Returns `Ok(None)` if nothing completed. Only one poller can exist per handle:
    ///
    /// ```compile_fail
    /// # use verbway::ibverbs::completion::BasicCompletionQueue;
    /// fn two_pollers(cq: &mut BasicCompletionQueue) {
    ///     let first = cq.start_poll().unwrap();
    ///     let second = cq.start_poll().unwrap();
    ///     drop((first, second));
    /// }
    /// ```
    ///
    /// Clones of the handle share the queue, draining through two of them at once fails with
    /// [`PollCompletionQueueError::DrainInProgress`].
    pub fn start_poll(&mut self) -> Result<Option<BasicPoller<'_>>, PollCompletionQueueError> {
        self.inner.begin_drain()?;
        let buffered = self.next_wc < self.wcs.len();
        let mut poller = BasicPoller {
            cq: self,
            state: BasicPollerState::Ready,
        };
        if buffered {
            return Ok(Some(poller));
        }
        match poller.fill() {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(poller)),
            Err(err) => Err(err.into()),
        }
    }

    /// Setup how many completions one `ibv_poll_cq` call may return, `32` by default.
    pub fn setup_poll_batch(&mut self, size: NonZeroU32) {
        let mut wcs = Vec::with_capacity(size.get() as usize);
        wcs.extend_from_slice(&self.wcs[self.next_wc..]);
        self.wcs = wcs;
        self.next_wc = 0;
    }

    /// Destroy the completion queue now.
    ///
    /// Fails with [`DestroyCompletionQueueErrorKind::InUse`] while clones, including the ones
    /// held by queue pairs, are alive.
    pub fn destroy(self) -> Result<(), DestroyCompletionQueueError> {
        let BasicCompletionQueue { inner, wcs, next_wc } = self;
        match CompletionQueueInner::destroy(inner) {
            Ok(result) => Ok(result?),
            Err((shares, inner)) => Err(DestroyCompletionQueueErrorKind::InUse {
                shares,
                cq: GenericCompletionQueue::Basic(BasicCompletionQueue { inner, wcs, next_wc }),
            }
            .into()),
        }
    }
}

/// A completion queue created with `ibv_create_cq_ex`, drained entry by entry through
/// `ibv_start_poll` / `ibv_next_poll` / `ibv_end_poll` without copying.
#[derive(Clone)]
pub struct ExtendedCompletionQueue {
    inner: Arc<CompletionQueueInner>,
    ops: &'static ExtendedVerbs,
}

impl fmt::Debug for ExtendedCompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedCompletionQueue").field("inner", &self.inner).finish()
    }
}

impl CompletionQueue for ExtendedCompletionQueue {
    unsafe fn cq(&self) -> NonNull<ibv_cq> {
        self.inner.cq
    }
}

impl ExtendedCompletionQueue {
    fn cq_ex(&self) -> NonNull<ibv_cq_ex> {
        self.inner.cq.cast()
    }

    /// Start draining the queue, positioned at the first completion.
    ///
    /// Returns `Ok(None)` if nothing completed. As with [`BasicCompletionQueue::start_poll`], one
    /// handle yields one poller at a time.
    ///
    /// ```compile_fail
    /// # use verbway::ibverbs::completion::ExtendedCompletionQueue;
    /// fn two_pollers(cq: &mut ExtendedCompletionQueue) {
    ///     let first = cq.start_poll().unwrap();
    ///     let second = cq.start_poll().unwrap();
    ///     drop((first, second));
    /// }
    /// ```
    pub fn start_poll(&mut self) -> Result<Option<ExtendedPoller<'_>>, PollCompletionQueueError> {
        self.inner.begin_drain()?;
        let mut attr = MaybeUninit::<ibv_poll_cq_attr>::zeroed();
        let ret = unsafe { (self.ops.start_poll)(self.cq_ex().as_ptr(), attr.as_mut_ptr()) };

        match ret {
            0 => Ok(Some(ExtendedPoller {
                cq: self,
                is_first: true,
                exhausted: false,
                ended: false,
            })),
            libc::ENOENT => {
                self.inner.finish_drain();
                Ok(None)
            },
            err => {
                self.inner.finish_drain();
                Err(io::Error::from_raw_os_error(err).into())
            },
        }
    }

    /// Whether completions carry a hardware timestamp.
    pub fn has_completion_timestamp(&self) -> bool {
        self.inner.timestamps
    }

    /// Destroy the completion queue now, see [`BasicCompletionQueue::destroy`].
    pub fn destroy(self) -> Result<(), DestroyCompletionQueueError> {
        let ops = self.ops;
        match CompletionQueueInner::destroy(self.inner) {
            Ok(result) => Ok(result?),
            Err((shares, inner)) => Err(DestroyCompletionQueueErrorKind::InUse {
                shares,
                cq: GenericCompletionQueue::Extended(ExtendedCompletionQueue { inner, ops }),
            }
            .into()),
        }
    }
}

/// A factory for creating [`BasicCompletionQueue`]s and [`ExtendedCompletionQueue`]s.
pub struct CompletionQueueBuilder {
    context: Arc<DeviceContext>,
    init_attr: ibv_cq_init_attr_ex,
    poll_batch: NonZeroU32,
}

impl CompletionQueueBuilder {
    pub(crate) fn new(context: &Arc<DeviceContext>) -> Self {
        let mut init_attr: ibv_cq_init_attr_ex = unsafe { mem::zeroed() };
        init_attr.cqe = 1024;
        init_attr.cq_context = ptr::null_mut();
        init_attr.channel = ptr::null_mut();
        init_attr.wc_flags = CreateCompletionQueueWorkCompletionFlags::StandardFlags.bits();

        CompletionQueueBuilder {
            context: Arc::clone(context),
            init_attr,
            poll_batch: NonZeroU32::MIN.saturating_add(31),
        }
    }

    /// Setup the minimum number of entries the queue holds, `1024` by default.
    pub fn setup_cqe(&mut self, cqe: u32) -> &mut Self {
        self.init_attr.cqe = cqe;
        self
    }

    /// Setup the fields an extended queue reports.
    pub fn setup_wc_flags(&mut self, wc_flags: CreateCompletionQueueWorkCompletionFlags) -> &mut Self {
        self.init_attr.wc_flags = wc_flags.bits();
        self
    }

    /// Ask an extended queue to timestamp each completion.
    pub fn setup_completion_timestamp(&mut self, enable: bool) -> &mut Self {
        let flags = CreateCompletionQueueWorkCompletionFlags {
            bits: self.init_attr.wc_flags,
        };
        let flags = if enable {
            flags | CreateCompletionQueueWorkCompletionFlags::CompletionTimestamp
        } else {
            flags.and(CreateCompletionQueueWorkCompletionFlags::CompletionTimestamp.not())
        };
        self.init_attr.wc_flags = flags.bits();
        self
    }

    /// Setup how many entries one `ibv_poll_cq` call of a basic queue fetches.
    pub fn setup_poll_batch(&mut self, poll_batch: NonZeroU32) -> &mut Self {
        self.poll_batch = poll_batch;
        self
    }

    fn wants_timestamps(&self) -> bool {
        CreateCompletionQueueWorkCompletionFlags {
            bits: self.init_attr.wc_flags,
        }
            .contains(CreateCompletionQueueWorkCompletionFlags::CompletionTimestamp)
    }

    fn error(&self, source: CreateCompletionQueueErrorKind) -> CreateCompletionQueueError {
        CreateCompletionQueueError {
            cqe: self.init_attr.cqe,
            source,
        }
    }

    fn inner(&self, cq: NonNull<ibv_cq>, extended: Option<&'static ExtendedVerbs>) -> Arc<CompletionQueueInner> {
        Arc::new(CompletionQueueInner {
            cq,
            timestamps: extended.is_some() && self.wants_timestamps(),
            extended,
            draining: AtomicBool::new(false),
            in_flight: Arc::default(),
            released: false,
            _context: Arc::clone(&self.context),
        })
    }

    /// Create a [`BasicCompletionQueue`] with `ibv_create_cq`.
    pub fn build(&self) -> Result<BasicCompletionQueue, CreateCompletionQueueError> {
        let cq = unsafe {
            (verbs().create_cq)(
                self.context.context.as_ptr(),
                self.init_attr.cqe as _,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        let cq = NonNull::new(cq).ok_or_else(|| self.error(io::Error::last_os_error().into()))?;
        debug!(cqe = self.init_attr.cqe, "CompletionQueueBuilder::build");

        Ok(BasicCompletionQueue {
            inner: self.inner(cq, None),
            wcs: Vec::with_capacity(self.poll_batch.get() as usize),
            next_wc: 0,
        })
    }

    /// Create an [`ExtendedCompletionQueue`] with `ibv_create_cq_ex`.
    pub fn build_ex(&self) -> Result<ExtendedCompletionQueue, CreateCompletionQueueError> {
        let ops = verbs()
            .extended()
            .ok_or_else(|| self.error(CreateCompletionQueueErrorKind::ExtendedUnavailable))?;

        // ibv_create_cq_ex requires a mutable pointer
        let mut init_attr = self.init_attr;
        let cq_ex = unsafe { (ops.create_cq_ex)(self.context.context.as_ptr(), &mut init_attr) };
        let cq_ex = NonNull::new(cq_ex).ok_or_else(|| self.error(io::Error::last_os_error().into()))?;
        debug!(
            cqe = self.init_attr.cqe,
            timestamps = self.wants_timestamps(),
            "CompletionQueueBuilder::build_ex"
        );

        Ok(ExtendedCompletionQueue {
            inner: self.inner(cq_ex.cast(), Some(ops)),
            ops,
        })
    }

    /// Create an extended queue when the library and device support it, else a basic one.
    pub fn build_generic(&self) -> Result<GenericCompletionQueue, CreateCompletionQueueError> {
        match self.build_ex() {
            Ok(cq) => Ok(cq.into()),
            Err(err) if err.unsupported() => {
                debug!(reason = %err.source, "falling back to a basic completion queue");
                self.build().map(Into::into)
            },
            Err(err) => Err(err),
        }
    }
}

/// A completion copied out of the queue by `ibv_poll_cq`.
#[derive(Clone, Copy)]
pub struct BasicWorkCompletion {
    wc: ibv_wc,
}

impl fmt::Debug for BasicWorkCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicWorkCompletion")
            .field("wr_id", &self.wc.wr_id)
            .field("status", &self.wc.status)
            .field("opcode", &self.wc.opcode)
            .field("byte_len", &self.wc.byte_len)
            .finish()
    }
}

impl WorkCompletion for BasicWorkCompletion {
    fn wr_id(&self) -> u64 {
        self.wc.wr_id
    }

    fn status(&self) -> WorkCompletionStatus {
        self.wc.status.into()
    }

    fn opcode(&self) -> WorkCompletionOperationType {
        self.wc.opcode.into()
    }

    fn vendor_err(&self) -> u32 {
        self.wc.vendor_err
    }

    fn byte_len(&self) -> u32 {
        self.wc.byte_len
    }

    fn imm_data(&self) -> Option<u32> {
        if self.wc.wc_flags & WITH_IMM == 0 {
            return None;
        }
        // imm_data shares an anonymous union with invalidated_rkey right after byte_len
        let raw = unsafe {
            ptr::from_ref(&self.wc)
                .cast::<u8>()
                .add(offset_of!(ibv_wc, byte_len) + mem::size_of::<u32>())
                .cast::<u32>()
                .read_unaligned()
        };
        Some(u32::from_be(raw))
    }

    fn qp_num(&self) -> u32 {
        self.wc.qp_num
    }

    fn completion_timestamp(&self) -> Option<u64> {
        None
    }
}

/// A completion still sitting in the hardware queue, fields are read on demand.
///
/// Borrows the [`ExtendedPoller`] that returned it.
pub struct ExtendedWorkCompletion<'poller> {
    cq: NonNull<ibv_cq_ex>,
    ops: &'static ExtendedVerbs,
    timestamps: bool,
    _poller: std::marker::PhantomData<&'poller mut ()>,
}

impl WorkCompletion for ExtendedWorkCompletion<'_> {
    fn wr_id(&self) -> u64 {
        unsafe { self.cq.as_ref().wr_id }
    }

    fn status(&self) -> WorkCompletionStatus {
        unsafe { self.cq.as_ref().status }.into()
    }

    fn opcode(&self) -> WorkCompletionOperationType {
        unsafe { (self.ops.wc_read_opcode)(self.cq.as_ptr()) }.into()
    }

    fn vendor_err(&self) -> u32 {
        unsafe { (self.ops.wc_read_vendor_err)(self.cq.as_ptr()) }
    }

    fn byte_len(&self) -> u32 {
        unsafe { (self.ops.wc_read_byte_len)(self.cq.as_ptr()) }
    }

    fn imm_data(&self) -> Option<u32> {
        let flags = unsafe { (self.ops.wc_read_wc_flags)(self.cq.as_ptr()) };
        (flags & WITH_IMM != 0).then(|| u32::from_be(unsafe { (self.ops.wc_read_imm_data)(self.cq.as_ptr()) }))
    }

    fn qp_num(&self) -> u32 {
        unsafe { (self.ops.wc_read_qp_num)(self.cq.as_ptr()) }
    }

    fn completion_timestamp(&self) -> Option<u64> {
        self.timestamps
            .then(|| unsafe { (self.ops.wc_read_completion_ts)(self.cq.as_ptr()) })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BasicPollerState {
    // Ready means the last ibv_poll_cq filled the whole batch, more completions are likely
    // waiting, so poll again once the batch is consumed.
    Ready,
    // Drained means the last ibv_poll_cq returned a partial batch, return None after the user
    // consumed it.
    Drained,
    // Empty means the queue is *likely* empty, the next call to next() polls once more.
    Empty,
}

/// Drains a [`BasicCompletionQueue`] batch by batch.
pub struct BasicPoller<'cq> {
    cq: &'cq mut BasicCompletionQueue,
    state: BasicPollerState,
}

impl BasicPoller<'_> {
    fn fill(&mut self) -> io::Result<usize> {
        let wcs = &mut self.cq.wcs;
        let batch = wcs.capacity();
        let ret = unsafe { (verbs().poll_cq)(self.cq.inner.cq.as_ptr(), batch as _, wcs.as_mut_ptr()) };
        if ret < 0 {
            unsafe { wcs.set_len(0) };
            self.cq.next_wc = 0;
            return Err(io::Error::from_raw_os_error(-ret));
        }
        unsafe { wcs.set_len(ret as usize) };
        self.cq.next_wc = 0;
        self.state = match ret as usize {
            0 => BasicPollerState::Empty,
            n if n < batch => BasicPollerState::Drained,
            _ => BasicPollerState::Ready,
        };
        Ok(ret as usize)
    }

    /// End the drain. Dropping the poller does the same.
    pub fn end(self) {}

    fn retire(&self, wc: ibv_wc) -> BasicWorkCompletion {
        let in_flight = &self.cq.inner.in_flight;
        if in_flight.is_tracking() {
            in_flight.retire(wc.qp_num, wc.wr_id, WorkQueue::of_completion(wc.status, wc.opcode));
        }
        BasicWorkCompletion { wc }
    }
}

impl Drop for BasicPoller<'_> {
    fn drop(&mut self) {
        self.cq.inner.finish_drain();
    }
}

impl Iterator for BasicPoller<'_> {
    type Item = BasicWorkCompletion;

    fn next(&mut self) -> Option<Self::Item> {
        use BasicPollerState::*;

        if self.cq.next_wc < self.cq.wcs.len() {
            let wc = self.cq.wcs[self.cq.next_wc];
            self.cq.next_wc += 1;
            return Some(self.retire(wc));
        }

        if self.state == Drained {
            // report the end of this round once, a later next() polls again
            self.state = Empty;
            return None;
        }

        match self.fill() {
            Ok(n) if n > 0 => {
                self.cq.next_wc = 1;
                Some(self.retire(self.cq.wcs[0]))
            },
            _ => {
                self.state = Empty;
                None
            },
        }
    }
}

/// Walks an [`ExtendedCompletionQueue`] entry by entry.
pub struct ExtendedPoller<'cq> {
    cq: &'cq mut ExtendedCompletionQueue,
    is_first: bool,
    exhausted: bool,
    ended: bool,
}

impl ExtendedPoller<'_> {
    /// End the drain and release the consumed entries to the hardware. Dropping the poller does
    /// the same.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            unsafe { (self.cq.ops.end_poll)(self.cq.cq_ex().as_ptr()) };
            self.cq.inner.finish_drain();
        }
    }
}

impl Drop for ExtendedPoller<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl ExtendedPoller<'_> {
    /// Move the cursor to the next completion.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<ExtendedWorkCompletion<'_>> {
        if self.exhausted {
            return None;
        }
        if self.is_first {
            self.is_first = false;
        } else if unsafe { (self.cq.ops.next_poll)(self.cq.cq_ex().as_ptr()) } != 0 {
            self.exhausted = true;
            return None;
        }
        let in_flight = &self.cq.inner.in_flight;
        if in_flight.is_tracking() {
            let cq = self.cq.cq_ex().as_ptr();
            unsafe {
                let status = (*cq).status;
                let opcode = if status == ibv_wc_status::IBV_WC_SUCCESS {
                    (self.cq.ops.wc_read_opcode)(cq)
                } else {
                    0
                };
                let qp_num = (self.cq.ops.wc_read_qp_num)(cq);
                in_flight.retire(qp_num, (*cq).wr_id, WorkQueue::of_completion(status, opcode));
            }
        }
        Some(ExtendedWorkCompletion {
            cq: self.cq.cq_ex(),
            ops: self.cq.ops,
            timestamps: self.cq.inner.timestamps,
            _poller: std::marker::PhantomData,
        })
    }
}

/// Either kind of completion queue, as picked by [`CompletionQueueBuilder::build_generic`].
#[derive(Debug, Clone)]
pub enum GenericCompletionQueue {
    /// Variant for a Basic CQ
    Basic(BasicCompletionQueue),
    /// Variant for an Extended CQ
    Extended(ExtendedCompletionQueue),
}

impl CompletionQueue for GenericCompletionQueue {
    unsafe fn cq(&self) -> NonNull<ibv_cq> {
        match self {
            GenericCompletionQueue::Basic(cq) => cq.cq(),
            GenericCompletionQueue::Extended(cq) => cq.cq(),
        }
    }
}

impl GenericCompletionQueue {
    pub fn start_poll(&mut self) -> Result<Option<GenericPoller<'_>>, PollCompletionQueueError> {
        match self {
            GenericCompletionQueue::Basic(cq) => cq.start_poll().map(|poller| poller.map(GenericPoller::Basic)),
            GenericCompletionQueue::Extended(cq) => cq.start_poll().map(|poller| poller.map(GenericPoller::Extended)),
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, GenericCompletionQueue::Extended(_))
    }

    pub(crate) fn in_flight(&self) -> &Arc<InFlightRegistry> {
        match self {
            GenericCompletionQueue::Basic(cq) => &cq.inner.in_flight,
            GenericCompletionQueue::Extended(cq) => &cq.inner.in_flight,
        }
    }

    pub fn destroy(self) -> Result<(), DestroyCompletionQueueError> {
        match self {
            GenericCompletionQueue::Basic(cq) => cq.destroy(),
            GenericCompletionQueue::Extended(cq) => cq.destroy(),
        }
    }
}

impl From<BasicCompletionQueue> for GenericCompletionQueue {
    fn from(cq: BasicCompletionQueue) -> Self {
        GenericCompletionQueue::Basic(cq)
    }
}

impl From<ExtendedCompletionQueue> for GenericCompletionQueue {
    fn from(cq: ExtendedCompletionQueue) -> Self {
        GenericCompletionQueue::Extended(cq)
    }
}

pub enum GenericPoller<'cq> {
    Basic(BasicPoller<'cq>),
    Extended(ExtendedPoller<'cq>),
}

impl GenericPoller<'_> {
    pub fn end(self) {
        match self {
            GenericPoller::Basic(poller) => poller.end(),
            GenericPoller::Extended(poller) => poller.end(),
        }
    }
}

impl GenericPoller<'_> {
    /// Move the cursor to the next completion, see [`ExtendedPoller::next`].
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<GenericWorkCompletion<'_>> {
        match self {
            GenericPoller::Basic(poller) => poller.next().map(GenericWorkCompletion::Basic),
            GenericPoller::Extended(poller) => poller.next().map(GenericWorkCompletion::Extended),
        }
    }
}

pub enum GenericWorkCompletion<'poller> {
    Basic(BasicWorkCompletion),
    Extended(ExtendedWorkCompletion<'poller>),
}

macro_rules! dispatch_wc {
    ($self:ident, $wc:ident => $body:expr) => {
        match $self {
            GenericWorkCompletion::Basic($wc) => $body,
            GenericWorkCompletion::Extended($wc) => $body,
        }
    };
}

impl WorkCompletion for GenericWorkCompletion<'_> {
    fn wr_id(&self) -> u64 {
        dispatch_wc!(self, wc => wc.wr_id())
    }

    fn status(&self) -> WorkCompletionStatus {
        dispatch_wc!(self, wc => wc.status())
    }

    fn opcode(&self) -> WorkCompletionOperationType {
        dispatch_wc!(self, wc => wc.opcode())
    }

    fn vendor_err(&self) -> u32 {
        dispatch_wc!(self, wc => wc.vendor_err())
    }

    fn byte_len(&self) -> u32 {
        dispatch_wc!(self, wc => wc.byte_len())
    }

    fn imm_data(&self) -> Option<u32> {
        dispatch_wc!(self, wc => wc.imm_data())
    }

    fn qp_num(&self) -> u32 {
        dispatch_wc!(self, wc => wc.qp_num())
    }

    fn completion_timestamp(&self) -> Option<u64> {
        dispatch_wc!(self, wc => wc.completion_timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::device::DeviceList;
    use crate::ibverbs::loopback;
    use proptest::prelude::*;

    fn context() -> Arc<DeviceContext> {
        loopback::install().unwrap();
        let devices = DeviceList::new().unwrap();
        devices.get(0).unwrap().open().unwrap()
    }

    proptest! {
        #[test]
        fn test_work_completion_operation_type_conversion(opcode in 0u32..=256u32) {
            if let Ok(wc_op_type) = std::panic::catch_unwind(|| WorkCompletionOperationType::from(opcode)) {
                prop_assert_eq!(opcode, wc_op_type as u32);
            } else {
                prop_assert!((opcode < ibv_wc_opcode::IBV_WC_RECV && opcode > ibv_wc_opcode::IBV_WC_ATOMIC_WRITE) || (opcode > ibv_wc_opcode::IBV_WC_DRIVER3));
            }
        }

        #[test]
        fn test_work_completion_status_conversion(status in 0u32..=32u32) {
            if let Ok(wc_status) = std::panic::catch_unwind(|| WorkCompletionStatus::from(status)) {
                prop_assert_eq!(status, wc_status as u32);
            } else {
                prop_assert!(status > ibv_wc_status::IBV_WC_TM_RNDV_INCOMPLETE);
            }
        }
    }

    #[test]
    fn test_result_carries_failure() {
        let mut wc: ibv_wc = unsafe { mem::zeroed() };
        wc.wr_id = 42;
        wc.status = ibv_wc_status::IBV_WC_RETRY_EXC_ERR;
        wc.vendor_err = 0x81;
        let wc = BasicWorkCompletion { wc };

        let err = wc.result().unwrap_err();
        assert_eq!(err.wr_id, 42);
        assert_eq!(err.status, WorkCompletionStatus::RetryCounterExceededError);
        assert_eq!(err.vendor_err, 0x81);
        assert!(err.to_string().contains("RetryCounterExceededError"));
        assert_eq!(wc.imm_data(), None);
        assert_eq!(wc.completion_timestamp(), None);
    }

    #[test]
    fn test_completion_timestamp_flag() {
        let ctx = context();
        let mut builder = ctx.create_cq_builder();
        assert!(!builder.wants_timestamps());
        builder.setup_completion_timestamp(true);
        assert!(builder.wants_timestamps());
        assert!(builder.build_ex().unwrap().has_completion_timestamp());
        builder.setup_completion_timestamp(false);
        assert!(!builder.build_ex().unwrap().has_completion_timestamp());
    }

    #[test]
    fn test_empty_queue_polls_none() {
        let ctx = context();
        let mut basic = ctx.create_cq_builder().setup_cqe(8).build().unwrap();
        assert!(basic.start_poll().unwrap().is_none());

        let mut extended = ctx.create_cq_builder().build_generic().unwrap();
        assert!(extended.is_extended());
        assert!(extended.start_poll().unwrap().is_none());
        // an empty drain releases the queue for the next one
        assert!(extended.start_poll().unwrap().is_none());
    }

    #[test]
    fn test_destroy_in_use() {
        let ctx = context();
        let cq = ctx.create_cq_builder().build_ex().unwrap();
        let shared = cq.clone();

        let DestroyCompletionQueueErrorKind::InUse { shares, cq } = cq.destroy().unwrap_err().0 else {
            panic!("expected InUse");
        };
        assert_eq!(shares, 1);
        drop(shared);
        cq.destroy().unwrap();
    }
}
