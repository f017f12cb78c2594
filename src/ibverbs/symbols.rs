//! Runtime resolution of the libibverbs entry points.
//!
//! The crate never links against libibverbs. Instead, the first operation that needs a verb
//! resolves every entry point by name from a [`SymbolSource`] (normally the shared library found
//! through [`LibraryConfig`]) into a [`VerbsTable`], which then lives for the rest of the process.
//! Entry points that rdma-core only ships as `static inline` helpers are looked up through small
//! shims around the `rdma_mummy_sys` wrappers.
use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::OnceLock;

use rdma_mummy_sys::{
    ibv_ah, ibv_ah_attr, ibv_comp_channel, ibv_context, ibv_cq, ibv_cq_ex, ibv_cq_init_attr_ex, ibv_data_buf,
    ibv_device, ibv_device_attr, ibv_gid, ibv_gid_entry, ibv_mr, ibv_pd, ibv_poll_cq_attr, ibv_port_attr, ibv_qp,
    ibv_qp_attr, ibv_qp_ex, ibv_qp_init_attr, ibv_qp_init_attr_ex, ibv_recv_wr, ibv_send_wr, ibv_sge, ibv_wc,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Something entry points can be looked up from by their exported name.
///
/// Implemented by [`SharedLibrary`] for the real rdma-core libraries and, with the `loopback`
/// feature, by the in-process `loopback` provider.
pub trait SymbolSource: Send + Sync {
    /// Name of the library, used in errors and logs.
    fn library(&self) -> &str;

    /// Look up an entry point, returns `None` if it is not exported.
    fn lookup(&self, symbol: &CStr) -> Option<NonNull<c_void>>;
}

/// Where to look for the native libraries.
///
/// Candidates are tried in order and the first one `dlopen` accepts wins. The defaults can be
/// overridden with the `VERBWAY_LIBIBVERBS` / `VERBWAY_LIBRDMACM` environment variables, or by
/// deserializing this struct from the application's own configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub ibverbs: Vec<String>,
    pub rdmacm: Vec<String>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        LibraryConfig {
            ibverbs: vec!["libibverbs.so.1".to_owned(), "libibverbs.so".to_owned()],
            rdmacm: vec!["librdmacm.so.1".to_owned(), "librdmacm.so".to_owned()],
        }
    }
}

impl LibraryConfig {
    pub const IBVERBS_ENV: &'static str = "VERBWAY_LIBIBVERBS";
    pub const RDMACM_ENV: &'static str = "VERBWAY_LIBRDMACM";

    /// The default candidates, with each list replaced by its environment variable when set.
    pub fn from_env() -> Self {
        let mut config = LibraryConfig::default();
        if let Some(path) = std::env::var_os(Self::IBVERBS_ENV) {
            config.ibverbs = vec![path.to_string_lossy().into_owned()];
        }
        if let Some(path) = std::env::var_os(Self::RDMACM_ENV) {
            config.rdmacm = vec![path.to_string_lossy().into_owned()];
        }
        config
    }
}

/// Error returned when a symbol table could not be built.
///
/// The error is cached together with the table slot, hence `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to resolve native entry points")]
#[non_exhaustive]
pub struct ResolveSymbolError(#[from] pub ResolveSymbolErrorKind);

/// The enum type for [`ResolveSymbolError`].
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ResolveSymbolErrorKind {
    #[error("no loadable library among {candidates:?}: {reason}")]
    LibraryNotFound { candidates: Vec<String>, reason: String },
    #[error("required symbol `{symbol}` is missing from {library}")]
    MissingSymbol { symbol: String, library: String },
    #[error("symbol table was already resolved from {library}")]
    AlreadyResolved { library: String },
}

impl ResolveSymbolError {
    /// Name of the missing entry point, if that is why resolution failed.
    pub fn missing_symbol(&self) -> Option<&str> {
        match &self.0 {
            ResolveSymbolErrorKind::MissingSymbol { symbol, .. } => Some(symbol),
            _ => None,
        }
    }
}

/// A `dlopen`ed shared object.
///
/// The handle is never closed: resolved function pointers are kept in process-wide tables.
pub struct SharedLibrary {
    handle: NonNull<c_void>,
    name: String,
    inline: Option<fn(&CStr) -> Option<NonNull<c_void>>>,
}

unsafe impl Send for SharedLibrary {}
unsafe impl Sync for SharedLibrary {}

impl fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLibrary").field("name", &self.name).finish()
    }
}

impl SharedLibrary {
    /// Open the first loadable library among `candidates`.
    pub fn open(candidates: &[String]) -> Result<SharedLibrary, ResolveSymbolError> {
        let mut reasons = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Ok(path) = CString::new(candidate.as_str()) else {
                reasons.push(format!("{candidate}: path contains a NUL byte"));
                continue;
            };
            let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
            match NonNull::new(handle) {
                Some(handle) => {
                    debug!(library = candidate.as_str(), "SharedLibrary::open");
                    return Ok(SharedLibrary {
                        handle,
                        name: candidate.clone(),
                        inline: None,
                    });
                },
                None => reasons.push(format!("{candidate}: {}", dlerror_message())),
            }
        }
        Err(ResolveSymbolErrorKind::LibraryNotFound {
            candidates: candidates.to_vec(),
            reason: reasons.join("; "),
        }
        .into())
    }

    /// Serve the names in `inline` from Rust shims instead of `dlsym`.
    pub(crate) fn with_inline(mut self, inline: fn(&CStr) -> Option<NonNull<c_void>>) -> Self {
        self.inline = Some(inline);
        self
    }
}

impl SymbolSource for SharedLibrary {
    fn library(&self) -> &str {
        &self.name
    }

    fn lookup(&self, symbol: &CStr) -> Option<NonNull<c_void>> {
        if let Some(shim) = self.inline.and_then(|inline| inline(symbol)) {
            // header-only helpers dispatch through the provider's function pointers, they only
            // exist if the library implements the interface they belong to
            return self.exports(inline_anchor(symbol)).then_some(shim);
        }
        NonNull::new(unsafe { libc::dlsym(self.handle.as_ptr(), symbol.as_ptr()) })
    }
}

impl SharedLibrary {
    fn exports(&self, symbol: &CStr) -> bool {
        !unsafe { libc::dlsym(self.handle.as_ptr(), symbol.as_ptr()) }.is_null()
    }
}

fn inline_anchor(symbol: &CStr) -> &'static CStr {
    let bytes = symbol.to_bytes();
    if bytes.starts_with(b"ibv_wr_")
        || bytes.starts_with(b"ibv_wc_read_")
        || bytes.ends_with(b"_poll")
        || bytes.ends_with(b"_ex")
    {
        c"ibv_qp_to_qp_ex"
    } else {
        c"ibv_open_device"
    }
}

fn dlerror_message() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dlopen error".to_owned()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// Look up `symbol` and reinterpret it as the function pointer type `F`.
///
/// # Safety
///
/// `F` must be an `unsafe extern "C" fn` type matching the native prototype of `symbol`.
pub(crate) unsafe fn required<F: Copy>(source: &dyn SymbolSource, symbol: &CStr) -> Result<F, ResolveSymbolError> {
    optional(source, symbol).ok_or_else(|| {
        ResolveSymbolErrorKind::MissingSymbol {
            symbol: symbol.to_string_lossy().into_owned(),
            library: source.library().to_owned(),
        }
        .into()
    })
}

/// Like [`required`], but absence is not an error.
///
/// # Safety
///
/// See [`required`].
pub(crate) unsafe fn optional<F: Copy>(source: &dyn SymbolSource, symbol: &CStr) -> Option<F> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*mut c_void>());
    source
        .lookup(symbol)
        .map(|ptr| mem::transmute_copy::<*mut c_void, F>(&ptr.as_ptr()))
}

pub(crate) type GetDeviceListFn = unsafe extern "C" fn(*mut c_int) -> *mut *mut ibv_device;
pub(crate) type FreeDeviceListFn = unsafe extern "C" fn(*mut *mut ibv_device);
pub(crate) type GetDeviceNameFn = unsafe extern "C" fn(*mut ibv_device) -> *const c_char;
pub(crate) type GetDeviceGuidFn = unsafe extern "C" fn(*mut ibv_device) -> u64;
pub(crate) type OpenDeviceFn = unsafe extern "C" fn(*mut ibv_device) -> *mut ibv_context;
pub(crate) type CloseDeviceFn = unsafe extern "C" fn(*mut ibv_context) -> c_int;
pub(crate) type QueryDeviceFn = unsafe extern "C" fn(*mut ibv_context, *mut ibv_device_attr) -> c_int;
pub(crate) type QueryPortFn = unsafe extern "C" fn(*mut ibv_context, u8, *mut ibv_port_attr) -> c_int;
pub(crate) type QueryGidFn = unsafe extern "C" fn(*mut ibv_context, u8, c_int, *mut ibv_gid) -> c_int;
pub(crate) type QueryGidTableFn = unsafe extern "C" fn(*mut ibv_context, *mut ibv_gid_entry, usize, u32, usize) -> isize;
pub(crate) type AllocPdFn = unsafe extern "C" fn(*mut ibv_context) -> *mut ibv_pd;
pub(crate) type DeallocPdFn = unsafe extern "C" fn(*mut ibv_pd) -> c_int;
pub(crate) type RegMrFn = unsafe extern "C" fn(*mut ibv_pd, *mut c_void, usize, c_int) -> *mut ibv_mr;
pub(crate) type RegMrIova2Fn = unsafe extern "C" fn(*mut ibv_pd, *mut c_void, usize, u64, c_uint) -> *mut ibv_mr;
pub(crate) type DeregMrFn = unsafe extern "C" fn(*mut ibv_mr) -> c_int;
pub(crate) type CreateCqFn =
    unsafe extern "C" fn(*mut ibv_context, c_int, *mut c_void, *mut ibv_comp_channel, c_int) -> *mut ibv_cq;
pub(crate) type DestroyCqFn = unsafe extern "C" fn(*mut ibv_cq) -> c_int;
pub(crate) type PollCqFn = unsafe extern "C" fn(*mut ibv_cq, c_int, *mut ibv_wc) -> c_int;
pub(crate) type CreateQpFn = unsafe extern "C" fn(*mut ibv_pd, *mut ibv_qp_init_attr) -> *mut ibv_qp;
pub(crate) type DestroyQpFn = unsafe extern "C" fn(*mut ibv_qp) -> c_int;
pub(crate) type ModifyQpFn = unsafe extern "C" fn(*mut ibv_qp, *mut ibv_qp_attr, c_int) -> c_int;
pub(crate) type QueryQpFn = unsafe extern "C" fn(*mut ibv_qp, *mut ibv_qp_attr, c_int, *mut ibv_qp_init_attr) -> c_int;
pub(crate) type PostSendFn = unsafe extern "C" fn(*mut ibv_qp, *mut ibv_send_wr, *mut *mut ibv_send_wr) -> c_int;
pub(crate) type PostRecvFn = unsafe extern "C" fn(*mut ibv_qp, *mut ibv_recv_wr, *mut *mut ibv_recv_wr) -> c_int;
pub(crate) type CreateAhFn = unsafe extern "C" fn(*mut ibv_pd, *mut ibv_ah_attr) -> *mut ibv_ah;
pub(crate) type DestroyAhFn = unsafe extern "C" fn(*mut ibv_ah) -> c_int;

pub(crate) type CreateCqExFn = unsafe extern "C" fn(*mut ibv_context, *mut ibv_cq_init_attr_ex) -> *mut ibv_cq_ex;
pub(crate) type CreateQpExFn = unsafe extern "C" fn(*mut ibv_context, *mut ibv_qp_init_attr_ex) -> *mut ibv_qp;
pub(crate) type QpToQpExFn = unsafe extern "C" fn(*mut ibv_qp) -> *mut ibv_qp_ex;
pub(crate) type StartPollFn = unsafe extern "C" fn(*mut ibv_cq_ex, *mut ibv_poll_cq_attr) -> c_int;
pub(crate) type NextPollFn = unsafe extern "C" fn(*mut ibv_cq_ex) -> c_int;
pub(crate) type EndPollFn = unsafe extern "C" fn(*mut ibv_cq_ex);
pub(crate) type WcReadU32Fn = unsafe extern "C" fn(*mut ibv_cq_ex) -> u32;
pub(crate) type WcReadU64Fn = unsafe extern "C" fn(*mut ibv_cq_ex) -> u64;
pub(crate) type WrFn = unsafe extern "C" fn(*mut ibv_qp_ex);
pub(crate) type WrCompleteFn = unsafe extern "C" fn(*mut ibv_qp_ex) -> c_int;
pub(crate) type WrSendImmFn = unsafe extern "C" fn(*mut ibv_qp_ex, u32);
pub(crate) type WrRdmaFn = unsafe extern "C" fn(*mut ibv_qp_ex, u32, u64);
pub(crate) type WrRdmaImmFn = unsafe extern "C" fn(*mut ibv_qp_ex, u32, u64, u32);
pub(crate) type WrAtomicCmpSwpFn = unsafe extern "C" fn(*mut ibv_qp_ex, u32, u64, u64, u64);
pub(crate) type WrAtomicFetchAddFn = unsafe extern "C" fn(*mut ibv_qp_ex, u32, u64, u64);
pub(crate) type WrSetSgeFn = unsafe extern "C" fn(*mut ibv_qp_ex, u32, u64, u32);
pub(crate) type WrSetSgeListFn = unsafe extern "C" fn(*mut ibv_qp_ex, usize, *const ibv_sge);
pub(crate) type WrSetInlineDataFn = unsafe extern "C" fn(*mut ibv_qp_ex, *mut c_void, usize);
pub(crate) type WrSetInlineDataListFn = unsafe extern "C" fn(*mut ibv_qp_ex, usize, *const ibv_data_buf);
pub(crate) type WrSetUdAddrFn = unsafe extern "C" fn(*mut ibv_qp_ex, *mut ibv_ah, u32, u32);

/// The classic libibverbs entry points, always present.
pub struct VerbsTable {
    source: String,
    pub(crate) get_device_list: GetDeviceListFn,
    pub(crate) free_device_list: FreeDeviceListFn,
    pub(crate) get_device_name: GetDeviceNameFn,
    pub(crate) get_device_guid: GetDeviceGuidFn,
    pub(crate) open_device: OpenDeviceFn,
    pub(crate) close_device: CloseDeviceFn,
    pub(crate) query_device: QueryDeviceFn,
    pub(crate) query_port: QueryPortFn,
    pub(crate) query_gid: QueryGidFn,
    pub(crate) alloc_pd: AllocPdFn,
    pub(crate) dealloc_pd: DeallocPdFn,
    pub(crate) reg_mr: RegMrFn,
    pub(crate) dereg_mr: DeregMrFn,
    pub(crate) create_cq: CreateCqFn,
    pub(crate) destroy_cq: DestroyCqFn,
    pub(crate) poll_cq: PollCqFn,
    pub(crate) create_qp: CreateQpFn,
    pub(crate) destroy_qp: DestroyQpFn,
    pub(crate) modify_qp: ModifyQpFn,
    pub(crate) query_qp: QueryQpFn,
    pub(crate) post_send: PostSendFn,
    pub(crate) post_recv: PostRecvFn,
    pub(crate) create_ah: CreateAhFn,
    pub(crate) destroy_ah: DestroyAhFn,
    // private or newer entry points, each with a classic fallback
    pub(crate) query_gid_table: Option<QueryGidTableFn>,
    pub(crate) reg_mr_iova2: Option<RegMrIova2Fn>,
    pub(crate) extended: Option<ExtendedVerbs>,
}

/// The extended CQ/QP interface: cursor polling and `ibv_wr_*` work request construction.
pub(crate) struct ExtendedVerbs {
    pub(crate) create_cq_ex: CreateCqExFn,
    pub(crate) create_qp_ex: CreateQpExFn,
    pub(crate) qp_to_qp_ex: QpToQpExFn,
    pub(crate) start_poll: StartPollFn,
    pub(crate) next_poll: NextPollFn,
    pub(crate) end_poll: EndPollFn,
    pub(crate) wc_read_opcode: WcReadU32Fn,
    pub(crate) wc_read_vendor_err: WcReadU32Fn,
    pub(crate) wc_read_byte_len: WcReadU32Fn,
    pub(crate) wc_read_imm_data: WcReadU32Fn,
    pub(crate) wc_read_qp_num: WcReadU32Fn,
    pub(crate) wc_read_wc_flags: WcReadU32Fn,
    pub(crate) wc_read_completion_ts: WcReadU64Fn,
    pub(crate) wr_start: WrFn,
    pub(crate) wr_complete: WrCompleteFn,
    pub(crate) wr_abort: WrFn,
    pub(crate) wr_send: WrFn,
    pub(crate) wr_send_imm: WrSendImmFn,
    pub(crate) wr_rdma_write: WrRdmaFn,
    pub(crate) wr_rdma_write_imm: WrRdmaImmFn,
    pub(crate) wr_rdma_read: WrRdmaFn,
    pub(crate) wr_atomic_cmp_swp: WrAtomicCmpSwpFn,
    pub(crate) wr_atomic_fetch_add: WrAtomicFetchAddFn,
    pub(crate) wr_set_sge: WrSetSgeFn,
    pub(crate) wr_set_sge_list: WrSetSgeListFn,
    pub(crate) wr_set_inline_data: WrSetInlineDataFn,
    pub(crate) wr_set_inline_data_list: WrSetInlineDataListFn,
    pub(crate) wr_set_ud_addr: WrSetUdAddrFn,
}

impl fmt::Debug for VerbsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerbsTable")
            .field("source", &self.source)
            .field("query_gid_table", &self.query_gid_table.is_some())
            .field("reg_mr_iova2", &self.reg_mr_iova2.is_some())
            .field("extended", &self.extended.is_some())
            .finish()
    }
}

impl VerbsTable {
    /// Resolve every entry point from `source`.
    pub fn resolve(source: &dyn SymbolSource) -> Result<VerbsTable, ResolveSymbolError> {
        let library = source.library();
        let table = unsafe {
            VerbsTable {
                source: library.to_owned(),
                get_device_list: required(source, c"ibv_get_device_list")?,
                free_device_list: required(source, c"ibv_free_device_list")?,
                get_device_name: required(source, c"ibv_get_device_name")?,
                get_device_guid: required(source, c"ibv_get_device_guid")?,
                open_device: required(source, c"ibv_open_device")?,
                close_device: required(source, c"ibv_close_device")?,
                query_device: required(source, c"ibv_query_device")?,
                query_port: required(source, c"ibv_query_port")?,
                query_gid: required(source, c"ibv_query_gid")?,
                alloc_pd: required(source, c"ibv_alloc_pd")?,
                dealloc_pd: required(source, c"ibv_dealloc_pd")?,
                reg_mr: required(source, c"ibv_reg_mr")?,
                dereg_mr: required(source, c"ibv_dereg_mr")?,
                create_cq: required(source, c"ibv_create_cq")?,
                destroy_cq: required(source, c"ibv_destroy_cq")?,
                poll_cq: required(source, c"ibv_poll_cq")?,
                create_qp: required(source, c"ibv_create_qp")?,
                destroy_qp: required(source, c"ibv_destroy_qp")?,
                modify_qp: required(source, c"ibv_modify_qp")?,
                query_qp: required(source, c"ibv_query_qp")?,
                post_send: required(source, c"ibv_post_send")?,
                post_recv: required(source, c"ibv_post_recv")?,
                create_ah: required(source, c"ibv_create_ah")?,
                destroy_ah: required(source, c"ibv_destroy_ah")?,
                query_gid_table: optional(source, c"_ibv_query_gid_table"),
                reg_mr_iova2: optional(source, c"ibv_reg_mr_iova2"),
                extended: match ExtendedVerbs::resolve(source) {
                    Ok(extended) => Some(extended),
                    Err(err) => {
                        warn!(library, error = %err, "extended verbs unavailable, using classic entry points");
                        None
                    },
                },
            }
        };
        if table.query_gid_table.is_none() {
            warn!(library, "_ibv_query_gid_table unavailable, GID table will be queried per index");
        }
        debug!(
            library,
            extended = table.extended.is_some(),
            reg_mr_iova2 = table.reg_mr_iova2.is_some(),
            "VerbsTable::resolve"
        );
        Ok(table)
    }

    /// Name of the library this table was resolved from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the extended CQ/QP entry points resolved.
    pub fn has_extended(&self) -> bool {
        self.extended.is_some()
    }

    pub(crate) fn extended(&self) -> Option<&ExtendedVerbs> {
        self.extended.as_ref()
    }
}

impl ExtendedVerbs {
    unsafe fn resolve(source: &dyn SymbolSource) -> Result<ExtendedVerbs, ResolveSymbolError> {
        Ok(ExtendedVerbs {
            qp_to_qp_ex: required(source, c"ibv_qp_to_qp_ex")?,
            create_cq_ex: required(source, c"ibv_create_cq_ex")?,
            create_qp_ex: required(source, c"ibv_create_qp_ex")?,
            start_poll: required(source, c"ibv_start_poll")?,
            next_poll: required(source, c"ibv_next_poll")?,
            end_poll: required(source, c"ibv_end_poll")?,
            wc_read_opcode: required(source, c"ibv_wc_read_opcode")?,
            wc_read_vendor_err: required(source, c"ibv_wc_read_vendor_err")?,
            wc_read_byte_len: required(source, c"ibv_wc_read_byte_len")?,
            wc_read_imm_data: required(source, c"ibv_wc_read_imm_data")?,
            wc_read_qp_num: required(source, c"ibv_wc_read_qp_num")?,
            wc_read_wc_flags: required(source, c"ibv_wc_read_wc_flags")?,
            wc_read_completion_ts: required(source, c"ibv_wc_read_completion_ts")?,
            wr_start: required(source, c"ibv_wr_start")?,
            wr_complete: required(source, c"ibv_wr_complete")?,
            wr_abort: required(source, c"ibv_wr_abort")?,
            wr_send: required(source, c"ibv_wr_send")?,
            wr_send_imm: required(source, c"ibv_wr_send_imm")?,
            wr_rdma_write: required(source, c"ibv_wr_rdma_write")?,
            wr_rdma_write_imm: required(source, c"ibv_wr_rdma_write_imm")?,
            wr_rdma_read: required(source, c"ibv_wr_rdma_read")?,
            wr_atomic_cmp_swp: required(source, c"ibv_wr_atomic_cmp_swp")?,
            wr_atomic_fetch_add: required(source, c"ibv_wr_atomic_fetch_add")?,
            wr_set_sge: required(source, c"ibv_wr_set_sge")?,
            wr_set_sge_list: required(source, c"ibv_wr_set_sge_list")?,
            wr_set_inline_data: required(source, c"ibv_wr_set_inline_data")?,
            wr_set_inline_data_list: required(source, c"ibv_wr_set_inline_data_list")?,
            wr_set_ud_addr: required(source, c"ibv_wr_set_ud_addr")?,
        })
    }
}

static VERBS: OnceLock<Result<VerbsTable, ResolveSymbolError>> = OnceLock::new();

/// Resolve the process-wide table from `source`, unless it was resolved already.
///
/// Installing the same source twice is allowed. Installing a different source once the table
/// exists fails with [`ResolveSymbolErrorKind::AlreadyResolved`].
pub fn install_verbs(source: &dyn SymbolSource) -> Result<&'static VerbsTable, ResolveSymbolError> {
    let mut resolved_here = false;
    let slot = VERBS.get_or_init(|| {
        resolved_here = true;
        VerbsTable::resolve(source)
    });
    match slot {
        Ok(table) if resolved_here || table.source == source.library() => Ok(table),
        Ok(table) => Err(ResolveSymbolErrorKind::AlreadyResolved {
            library: table.source.clone(),
        }
        .into()),
        Err(err) => Err(err.clone()),
    }
}

/// The process-wide table, resolving it from the system libibverbs on first use.
pub fn try_verbs() -> Result<&'static VerbsTable, ResolveSymbolError> {
    VERBS
        .get_or_init(|| {
            let config = LibraryConfig::from_env();
            let library = SharedLibrary::open(&config.ibverbs)?.with_inline(native_inline);
            VerbsTable::resolve(&library)
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Like [`try_verbs`], but an unresolved table is fatal.
pub(crate) fn verbs() -> &'static VerbsTable {
    match try_verbs() {
        Ok(table) => table,
        Err(err) => panic!("libibverbs entry points are unresolved: {err}: {}", err.0),
    }
}

/// Shims for the libibverbs helpers that only exist as `static inline` functions in the headers.
fn native_inline(symbol: &CStr) -> Option<NonNull<c_void>> {
    use shim::*;

    let ptr = match symbol.to_bytes() {
        b"ibv_query_port" => query_port as QueryPortFn as *mut c_void,
        b"ibv_poll_cq" => poll_cq as PollCqFn as *mut c_void,
        b"ibv_post_send" => post_send as PostSendFn as *mut c_void,
        b"ibv_post_recv" => post_recv as PostRecvFn as *mut c_void,
        b"ibv_create_cq_ex" => create_cq_ex as CreateCqExFn as *mut c_void,
        b"ibv_create_qp_ex" => create_qp_ex as CreateQpExFn as *mut c_void,
        b"ibv_start_poll" => start_poll as StartPollFn as *mut c_void,
        b"ibv_next_poll" => next_poll as NextPollFn as *mut c_void,
        b"ibv_end_poll" => end_poll as EndPollFn as *mut c_void,
        b"ibv_wc_read_opcode" => wc_read_opcode as WcReadU32Fn as *mut c_void,
        b"ibv_wc_read_vendor_err" => wc_read_vendor_err as WcReadU32Fn as *mut c_void,
        b"ibv_wc_read_byte_len" => wc_read_byte_len as WcReadU32Fn as *mut c_void,
        b"ibv_wc_read_imm_data" => wc_read_imm_data as WcReadU32Fn as *mut c_void,
        b"ibv_wc_read_qp_num" => wc_read_qp_num as WcReadU32Fn as *mut c_void,
        b"ibv_wc_read_wc_flags" => wc_read_wc_flags as WcReadU32Fn as *mut c_void,
        b"ibv_wc_read_completion_ts" => wc_read_completion_ts as WcReadU64Fn as *mut c_void,
        b"ibv_wr_start" => wr_start as WrFn as *mut c_void,
        b"ibv_wr_complete" => wr_complete as WrCompleteFn as *mut c_void,
        b"ibv_wr_abort" => wr_abort as WrFn as *mut c_void,
        b"ibv_wr_send" => wr_send as WrFn as *mut c_void,
        b"ibv_wr_send_imm" => wr_send_imm as WrSendImmFn as *mut c_void,
        b"ibv_wr_rdma_write" => wr_rdma_write as WrRdmaFn as *mut c_void,
        b"ibv_wr_rdma_write_imm" => wr_rdma_write_imm as WrRdmaImmFn as *mut c_void,
        b"ibv_wr_rdma_read" => wr_rdma_read as WrRdmaFn as *mut c_void,
        b"ibv_wr_atomic_cmp_swp" => wr_atomic_cmp_swp as WrAtomicCmpSwpFn as *mut c_void,
        b"ibv_wr_atomic_fetch_add" => wr_atomic_fetch_add as WrAtomicFetchAddFn as *mut c_void,
        b"ibv_wr_set_sge" => wr_set_sge as WrSetSgeFn as *mut c_void,
        b"ibv_wr_set_sge_list" => wr_set_sge_list as WrSetSgeListFn as *mut c_void,
        b"ibv_wr_set_inline_data" => wr_set_inline_data as WrSetInlineDataFn as *mut c_void,
        b"ibv_wr_set_inline_data_list" => wr_set_inline_data_list as WrSetInlineDataListFn as *mut c_void,
        b"ibv_wr_set_ud_addr" => wr_set_ud_addr as WrSetUdAddrFn as *mut c_void,
        _ => return None,
    };
    NonNull::new(ptr)
}

mod shim {
    use std::ffi::{c_int, c_void};

    use rdma_mummy_sys::{
        ibv_ah, ibv_context, ibv_cq, ibv_cq_ex, ibv_cq_init_attr_ex, ibv_data_buf, ibv_poll_cq_attr, ibv_port_attr,
        ibv_qp, ibv_qp_ex, ibv_qp_init_attr_ex, ibv_recv_wr, ibv_send_wr, ibv_sge, ibv_wc,
    };

    pub(super) unsafe extern "C" fn query_port(context: *mut ibv_context, port_num: u8, attr: *mut ibv_port_attr) -> c_int {
        rdma_mummy_sys::ibv_query_port(context, port_num, attr)
    }

    pub(super) unsafe extern "C" fn poll_cq(cq: *mut ibv_cq, num_entries: c_int, wc: *mut ibv_wc) -> c_int {
        rdma_mummy_sys::ibv_poll_cq(cq, num_entries, wc)
    }

    pub(super) unsafe extern "C" fn post_send(
        qp: *mut ibv_qp, wr: *mut ibv_send_wr, bad_wr: *mut *mut ibv_send_wr,
    ) -> c_int {
        rdma_mummy_sys::ibv_post_send(qp, wr, bad_wr)
    }

    pub(super) unsafe extern "C" fn post_recv(
        qp: *mut ibv_qp, wr: *mut ibv_recv_wr, bad_wr: *mut *mut ibv_recv_wr,
    ) -> c_int {
        rdma_mummy_sys::ibv_post_recv(qp, wr, bad_wr)
    }

    pub(super) unsafe extern "C" fn create_cq_ex(
        context: *mut ibv_context, attr: *mut ibv_cq_init_attr_ex,
    ) -> *mut ibv_cq_ex {
        rdma_mummy_sys::ibv_create_cq_ex(context, attr)
    }

    pub(super) unsafe extern "C" fn create_qp_ex(context: *mut ibv_context, attr: *mut ibv_qp_init_attr_ex) -> *mut ibv_qp {
        rdma_mummy_sys::ibv_create_qp_ex(context, attr)
    }

    pub(super) unsafe extern "C" fn start_poll(cq: *mut ibv_cq_ex, attr: *mut ibv_poll_cq_attr) -> c_int {
        rdma_mummy_sys::ibv_start_poll(cq, attr)
    }

    pub(super) unsafe extern "C" fn next_poll(cq: *mut ibv_cq_ex) -> c_int {
        rdma_mummy_sys::ibv_next_poll(cq)
    }

    pub(super) unsafe extern "C" fn end_poll(cq: *mut ibv_cq_ex) {
        rdma_mummy_sys::ibv_end_poll(cq)
    }

    pub(super) unsafe extern "C" fn wc_read_opcode(cq: *mut ibv_cq_ex) -> u32 {
        rdma_mummy_sys::ibv_wc_read_opcode(cq) as u32
    }

    pub(super) unsafe extern "C" fn wc_read_vendor_err(cq: *mut ibv_cq_ex) -> u32 {
        rdma_mummy_sys::ibv_wc_read_vendor_err(cq)
    }

    pub(super) unsafe extern "C" fn wc_read_byte_len(cq: *mut ibv_cq_ex) -> u32 {
        rdma_mummy_sys::ibv_wc_read_byte_len(cq)
    }

    pub(super) unsafe extern "C" fn wc_read_imm_data(cq: *mut ibv_cq_ex) -> u32 {
        rdma_mummy_sys::ibv_wc_read_imm_data(cq)
    }

    pub(super) unsafe extern "C" fn wc_read_qp_num(cq: *mut ibv_cq_ex) -> u32 {
        rdma_mummy_sys::ibv_wc_read_qp_num(cq)
    }

    pub(super) unsafe extern "C" fn wc_read_wc_flags(cq: *mut ibv_cq_ex) -> u32 {
        rdma_mummy_sys::ibv_wc_read_wc_flags(cq) as u32
    }

    pub(super) unsafe extern "C" fn wc_read_completion_ts(cq: *mut ibv_cq_ex) -> u64 {
        rdma_mummy_sys::ibv_wc_read_completion_ts(cq)
    }

    pub(super) unsafe extern "C" fn wr_start(qp: *mut ibv_qp_ex) {
        rdma_mummy_sys::ibv_wr_start(qp)
    }

    pub(super) unsafe extern "C" fn wr_complete(qp: *mut ibv_qp_ex) -> c_int {
        rdma_mummy_sys::ibv_wr_complete(qp)
    }

    pub(super) unsafe extern "C" fn wr_abort(qp: *mut ibv_qp_ex) {
        rdma_mummy_sys::ibv_wr_abort(qp)
    }

    pub(super) unsafe extern "C" fn wr_send(qp: *mut ibv_qp_ex) {
        rdma_mummy_sys::ibv_wr_send(qp)
    }

    pub(super) unsafe extern "C" fn wr_send_imm(qp: *mut ibv_qp_ex, imm_data: u32) {
        rdma_mummy_sys::ibv_wr_send_imm(qp, imm_data)
    }

    pub(super) unsafe extern "C" fn wr_rdma_write(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64) {
        rdma_mummy_sys::ibv_wr_rdma_write(qp, rkey, remote_addr)
    }

    pub(super) unsafe extern "C" fn wr_rdma_write_imm(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64, imm_data: u32) {
        rdma_mummy_sys::ibv_wr_rdma_write_imm(qp, rkey, remote_addr, imm_data)
    }

    pub(super) unsafe extern "C" fn wr_rdma_read(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64) {
        rdma_mummy_sys::ibv_wr_rdma_read(qp, rkey, remote_addr)
    }

    pub(super) unsafe extern "C" fn wr_atomic_cmp_swp(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64, compare: u64, swap: u64) {
        rdma_mummy_sys::ibv_wr_atomic_cmp_swp(qp, rkey, remote_addr, compare, swap)
    }

    pub(super) unsafe extern "C" fn wr_atomic_fetch_add(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64, add: u64) {
        rdma_mummy_sys::ibv_wr_atomic_fetch_add(qp, rkey, remote_addr, add)
    }

    pub(super) unsafe extern "C" fn wr_set_sge(qp: *mut ibv_qp_ex, lkey: u32, addr: u64, length: u32) {
        rdma_mummy_sys::ibv_wr_set_sge(qp, lkey, addr, length)
    }

    pub(super) unsafe extern "C" fn wr_set_sge_list(qp: *mut ibv_qp_ex, num_sge: usize, sg_list: *const ibv_sge) {
        rdma_mummy_sys::ibv_wr_set_sge_list(qp, num_sge, sg_list)
    }

    pub(super) unsafe extern "C" fn wr_set_inline_data(qp: *mut ibv_qp_ex, addr: *mut c_void, length: usize) {
        rdma_mummy_sys::ibv_wr_set_inline_data(qp, addr, length)
    }

    pub(super) unsafe extern "C" fn wr_set_inline_data_list(qp: *mut ibv_qp_ex, num_buf: usize, buf_list: *const ibv_data_buf) {
        rdma_mummy_sys::ibv_wr_set_inline_data_list(qp, num_buf, buf_list)
    }

    pub(super) unsafe extern "C" fn wr_set_ud_addr(qp: *mut ibv_qp_ex, ah: *mut ibv_ah, remote_qpn: u32, remote_qkey: u32) {
        rdma_mummy_sys::ibv_wr_set_ud_addr(qp, ah, remote_qpn, remote_qkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn library_config_defaults_round_trip_through_serde() {
        let config = LibraryConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: LibraryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
        assert_eq!(back.ibverbs[0], "libibverbs.so.1");
    }

    #[test]
    fn library_config_fills_missing_lists_with_defaults() {
        let config: LibraryConfig = serde_json::from_str(r#"{"ibverbs": ["/opt/rdma/lib/libibverbs.so.1"]}"#).unwrap();
        assert_eq!(config.ibverbs, vec!["/opt/rdma/lib/libibverbs.so.1".to_owned()]);
        assert_eq!(config.rdmacm, LibraryConfig::default().rdmacm);
    }

    #[test]
    fn open_reports_every_candidate() {
        let candidates = vec!["/nonexistent/libibverbs.so.1".to_owned(), "libverbway-missing.so".to_owned()];
        let err = SharedLibrary::open(&candidates).unwrap_err();
        match err.0 {
            ResolveSymbolErrorKind::LibraryNotFound { candidates: tried, reason } => {
                assert_eq!(tried, candidates);
                assert!(reason.contains("/nonexistent/libibverbs.so.1"));
                assert!(reason.contains("libverbway-missing.so"));
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[rstest]
    #[case(c"ibv_post_send", true)]
    #[case(c"ibv_wr_rdma_write", true)]
    #[case(c"ibv_wc_read_completion_ts", true)]
    #[case(c"ibv_open_device", false)]
    #[case(c"rdma_create_id", false)]
    fn inline_shims_cover_header_only_verbs(#[case] symbol: &CStr, #[case] shimmed: bool) {
        assert_eq!(native_inline(symbol).is_some(), shimmed);
    }

    #[test]
    fn missing_symbol_is_named() {
        let err: ResolveSymbolError = ResolveSymbolErrorKind::MissingSymbol {
            symbol: "ibv_create_qp".to_owned(),
            library: "libibverbs.so.1".to_owned(),
        }
        .into();
        assert_eq!(err.missing_symbol(), Some("ibv_create_qp"));
        assert_eq!(
            err.0.to_string(),
            "required symbol `ibv_create_qp` is missing from libibverbs.so.1"
        );
    }
}
