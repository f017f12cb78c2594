//! Runtime resolution of the librdmacm entry points, built the same way as the verbs table in
//! [`crate::ibverbs::symbols`].
use std::ffi::{c_int, c_void};
use std::fmt;
use std::sync::OnceLock;

use rdma_mummy_sys::{ibv_qp_attr, rdma_cm_event, rdma_cm_id, rdma_conn_param, rdma_event_channel, rdma_port_space};
use tracing::debug;

use crate::ibverbs::symbols::{
    required, LibraryConfig, ResolveSymbolError, ResolveSymbolErrorKind, SharedLibrary, SymbolSource,
};

pub(crate) type CreateEventChannelFn = unsafe extern "C" fn() -> *mut rdma_event_channel;
pub(crate) type DestroyEventChannelFn = unsafe extern "C" fn(*mut rdma_event_channel);
pub(crate) type CreateIdFn =
    unsafe extern "C" fn(*mut rdma_event_channel, *mut *mut rdma_cm_id, *mut c_void, rdma_port_space::Type) -> c_int;
pub(crate) type DestroyIdFn = unsafe extern "C" fn(*mut rdma_cm_id) -> c_int;
pub(crate) type BindAddrFn = unsafe extern "C" fn(*mut rdma_cm_id, *mut libc::sockaddr) -> c_int;
pub(crate) type ResolveAddrFn =
    unsafe extern "C" fn(*mut rdma_cm_id, *mut libc::sockaddr, *mut libc::sockaddr, c_int) -> c_int;
pub(crate) type ResolveRouteFn = unsafe extern "C" fn(*mut rdma_cm_id, c_int) -> c_int;
pub(crate) type ListenFn = unsafe extern "C" fn(*mut rdma_cm_id, c_int) -> c_int;
pub(crate) type ConnectFn = unsafe extern "C" fn(*mut rdma_cm_id, *mut rdma_conn_param) -> c_int;
pub(crate) type RejectFn = unsafe extern "C" fn(*mut rdma_cm_id, *const c_void, u8) -> c_int;
pub(crate) type IdFn = unsafe extern "C" fn(*mut rdma_cm_id) -> c_int;
pub(crate) type GetCmEventFn = unsafe extern "C" fn(*mut rdma_event_channel, *mut *mut rdma_cm_event) -> c_int;
pub(crate) type AckCmEventFn = unsafe extern "C" fn(*mut rdma_cm_event) -> c_int;
pub(crate) type InitQpAttrFn = unsafe extern "C" fn(*mut rdma_cm_id, *mut ibv_qp_attr, *mut c_int) -> c_int;

/// The librdmacm entry points.
pub struct CmTable {
    source: String,
    pub(crate) create_event_channel: CreateEventChannelFn,
    pub(crate) destroy_event_channel: DestroyEventChannelFn,
    pub(crate) create_id: CreateIdFn,
    pub(crate) destroy_id: DestroyIdFn,
    pub(crate) bind_addr: BindAddrFn,
    pub(crate) resolve_addr: ResolveAddrFn,
    pub(crate) resolve_route: ResolveRouteFn,
    pub(crate) listen: ListenFn,
    pub(crate) connect: ConnectFn,
    pub(crate) accept: ConnectFn,
    pub(crate) reject: RejectFn,
    pub(crate) establish: IdFn,
    pub(crate) disconnect: IdFn,
    pub(crate) get_cm_event: GetCmEventFn,
    pub(crate) ack_cm_event: AckCmEventFn,
    pub(crate) init_qp_attr: InitQpAttrFn,
}

impl fmt::Debug for CmTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmTable").field("source", &self.source).finish()
    }
}

impl CmTable {
    /// Resolve every entry point from `source`.
    pub fn resolve(source: &dyn SymbolSource) -> Result<CmTable, ResolveSymbolError> {
        let table = unsafe {
            CmTable {
                source: source.library().to_owned(),
                create_event_channel: required(source, c"rdma_create_event_channel")?,
                destroy_event_channel: required(source, c"rdma_destroy_event_channel")?,
                create_id: required(source, c"rdma_create_id")?,
                destroy_id: required(source, c"rdma_destroy_id")?,
                bind_addr: required(source, c"rdma_bind_addr")?,
                resolve_addr: required(source, c"rdma_resolve_addr")?,
                resolve_route: required(source, c"rdma_resolve_route")?,
                listen: required(source, c"rdma_listen")?,
                connect: required(source, c"rdma_connect")?,
                accept: required(source, c"rdma_accept")?,
                reject: required(source, c"rdma_reject")?,
                establish: required(source, c"rdma_establish")?,
                disconnect: required(source, c"rdma_disconnect")?,
                get_cm_event: required(source, c"rdma_get_cm_event")?,
                ack_cm_event: required(source, c"rdma_ack_cm_event")?,
                init_qp_attr: required(source, c"rdma_init_qp_attr")?,
            }
        };
        debug!(library = table.source.as_str(), "CmTable::resolve");
        Ok(table)
    }

    /// Name of the library this table was resolved from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

static RDMACM: OnceLock<Result<CmTable, ResolveSymbolError>> = OnceLock::new();

/// Resolve the process-wide connection manager table from `source`, unless it was resolved
/// already. Same rules as [`install_verbs`](crate::ibverbs::symbols::install_verbs).
pub fn install_rdmacm(source: &dyn SymbolSource) -> Result<&'static CmTable, ResolveSymbolError> {
    let mut resolved_here = false;
    let slot = RDMACM.get_or_init(|| {
        resolved_here = true;
        CmTable::resolve(source)
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

/// The process-wide table, resolving it from the system librdmacm on first use.
pub fn try_rdmacm() -> Result<&'static CmTable, ResolveSymbolError> {
    RDMACM
        .get_or_init(|| {
            let config = LibraryConfig::from_env();
            CmTable::resolve(&SharedLibrary::open(&config.rdmacm)?)
        })
        .as_ref()
        .map_err(Clone::clone)
}

pub(crate) fn rdmacm() -> &'static CmTable {
    match try_rdmacm() {
        Ok(table) => table,
        Err(err) => panic!("librdmacm entry points are unresolved: {err}: {}", err.0),
    }
}
