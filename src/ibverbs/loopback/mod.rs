//! An in-process RDMA provider for machines without RDMA hardware.
//!
//! The loopback provider serves the libibverbs and librdmacm entry points from Rust functions,
//! so the process-wide tables are built through the same [`SymbolSource`] path as with the real
//! libraries. It emulates a single RoCE device, [`DEVICE_NAME`], with one active port.
//!
//! Work requests are executed synchronously when they are posted, between queue pairs of the same
//! process. Keys, access flags, bounds, queue pair states, queue capacity and receive queue
//! consumption are all checked, and failures are reported with the completion status a NIC would
//! produce.
//!
//! ```
//! use verbway::ibverbs::device::DeviceList;
//! use verbway::ibverbs::loopback;
//!
//! loopback::install().unwrap();
//! let devices = DeviceList::new().unwrap();
//! assert_eq!(devices.get(0).unwrap().name(), loopback::DEVICE_NAME);
//! ```
use std::ffi::{c_void, CStr, CString};
use std::ptr::NonNull;

use tracing::debug;

use super::device_context::Guid;
use super::symbols::{install_verbs, ResolveSymbolError, SymbolSource, VerbsTable};
use crate::rdmacm::symbols::install_rdmacm;

mod cm;
mod fabric;
mod verbs;

use verbs::Export;

/// Name of the emulated device.
pub const DEVICE_NAME: &str = "loop0";

/// Node GUID of the emulated device.
pub const DEVICE_GUID: Guid = Guid(0x0002_c9ff_fe00_0001);

pub(crate) const PORT_NUM: u8 = 1;

/// The GID table of the port: a link local RoCE v1 GID derived from [`DEVICE_GUID`], and the
/// IPv4 mapped loopback address as RoCE v2 GID.
pub(crate) const GID_TABLE: [[u8; 16]; 2] = [
    [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x02, 0x02, 0xc9, 0xff, 0xfe, 0x00, 0x00, 0x01],
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 127, 0, 0, 1],
];

/// The libibverbs entry points of the loopback device.
///
/// Besides [`LoopbackVerbs::new`], which exports everything a recent rdma-core does, the source
/// can mimic older or stripped down libraries, which is how the fallback paths are exercised.
#[derive(Debug, Clone)]
pub struct LoopbackVerbs {
    library: String,
    extended: bool,
    private: bool,
    hidden: Option<CString>,
}

impl Default for LoopbackVerbs {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackVerbs {
    pub fn new() -> Self {
        LoopbackVerbs {
            library: "loopback".to_owned(),
            extended: true,
            private: true,
            hidden: None,
        }
    }

    /// A library with neither the extended CQ/QP interface nor the private entry points.
    pub fn classic_only() -> Self {
        LoopbackVerbs {
            library: "loopback-classic".to_owned(),
            extended: false,
            private: false,
            hidden: None,
        }
    }

    /// Stop exporting `symbol`.
    pub fn without(mut self, symbol: &CStr) -> Self {
        self.hidden = Some(symbol.to_owned());
        self
    }
}

impl SymbolSource for LoopbackVerbs {
    fn library(&self) -> &str {
        &self.library
    }

    fn lookup(&self, symbol: &CStr) -> Option<NonNull<c_void>> {
        if self.hidden.as_deref() == Some(symbol) {
            return None;
        }
        let (export, ptr) = verbs::lookup(symbol.to_bytes())?;
        let exported = match export {
            Export::Classic => true,
            Export::Private => self.private,
            Export::Extended => self.extended,
        };
        exported.then_some(ptr).and_then(NonNull::new)
    }
}

/// The librdmacm entry points of the loopback device, see [`crate::rdmacm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackCm;

impl SymbolSource for LoopbackCm {
    fn library(&self) -> &str {
        "loopback-rdmacm"
    }

    fn lookup(&self, symbol: &CStr) -> Option<NonNull<c_void>> {
        cm::lookup(symbol.to_bytes()).and_then(NonNull::new)
    }
}

/// Install the loopback provider into the process-wide verbs and connection manager tables.
///
/// Idempotent, but fails once either table was resolved from another library.
pub fn install() -> Result<&'static VerbsTable, ResolveSymbolError> {
    let verbs = install_verbs(&LoopbackVerbs::new())?;
    let rdmacm = install_rdmacm(&LoopbackCm)?;
    debug!(verbs = verbs.source(), rdmacm = rdmacm.source(), "loopback::install");
    Ok(verbs)
}

/// How many times work requests were handed to the queue pair `qp_num`: one per
/// `ibv_post_send` call or per completed `ibv_wr_start` batch.
pub fn submission_calls(qp_num: u32) -> u64 {
    fabric::fabric()
        .endpoints
        .get(&qp_num)
        .map_or(0, |endpoint| endpoint.submission_calls)
}

/// How many times `ibv_modify_qp` reached the queue pair `qp_num`.
pub fn modify_calls(qp_num: u32) -> u64 {
    fabric::fabric()
        .endpoints
        .get(&qp_num)
        .map_or(0, |endpoint| endpoint.modify_calls)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use rstest::rstest;

    use super::*;
    use crate::ibverbs::symbols::ResolveSymbolErrorKind;
    use crate::rdmacm::symbols::CmTable;

    #[rstest]
    #[case(c"ibv_post_send", true, true)]
    #[case(c"ibv_wr_start", true, false)]
    #[case(c"ibv_start_poll", true, false)]
    #[case(c"_ibv_query_gid_table", true, false)]
    #[case(c"ibv_reg_mr_iova2", true, false)]
    #[case(c"ibv_fork_init", false, false)]
    fn test_exports(#[case] symbol: &CStr, #[case] full: bool, #[case] classic: bool) {
        assert_eq!(LoopbackVerbs::new().lookup(symbol).is_some(), full);
        assert_eq!(LoopbackVerbs::classic_only().lookup(symbol).is_some(), classic);
    }

    #[test]
    fn test_classic_only_resolves_without_extended_verbs() {
        let table = VerbsTable::resolve(&LoopbackVerbs::classic_only()).unwrap();
        assert!(!table.has_extended());
        assert_eq!(table.source(), "loopback-classic");
        assert!(table.query_gid_table.is_none());
        assert!(table.reg_mr_iova2.is_none());
    }

    #[test]
    fn test_hidden_symbol_is_named() {
        let err = VerbsTable::resolve(&LoopbackVerbs::new().without(c"ibv_poll_cq")).unwrap_err();
        assert_eq!(err.missing_symbol(), Some("ibv_poll_cq"));
        match err.0 {
            ResolveSymbolErrorKind::MissingSymbol { library, .. } => assert_eq!(library, "loopback"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_hiding_an_extended_symbol_only_disables_the_extension() {
        let table = VerbsTable::resolve(&LoopbackVerbs::new().without(c"ibv_wr_abort")).unwrap();
        assert!(!table.has_extended());
        assert!(table.reg_mr_iova2.is_some());
    }

    #[test]
    fn test_cm_table_resolves() {
        let table = CmTable::resolve(&LoopbackCm).unwrap();
        assert_eq!(table.source(), "loopback-rdmacm");
    }

    #[test]
    fn test_gid_table_matches_guid() {
        let link_local = Ipv6Addr::from(GID_TABLE[0]);
        let interface_id = u64::from_be_bytes(GID_TABLE[0][8..].try_into().unwrap());
        assert_eq!(link_local.segments()[0], 0xfe80);
        // the universal/local bit is flipped in modified EUI-64
        assert_eq!(interface_id ^ (1 << 57), DEVICE_GUID.as_u64());
        assert_eq!(Ipv6Addr::from(GID_TABLE[1]).to_ipv4_mapped(), Some([127, 0, 0, 1].into()));
    }

    #[test]
    fn test_install_is_idempotent() {
        let first = install().unwrap();
        let second = install().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.source(), "loopback");
    }
}
