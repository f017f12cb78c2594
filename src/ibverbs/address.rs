//! GIDs, GID table entries and address handles, the routing side of RDMA.
use std::ffi::CStr;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::Ipv6Addr;
use std::ptr::NonNull;
use std::sync::Arc;

use libc::IF_NAMESIZE;
use rdma_mummy_sys::{
    ibv_ah, ibv_ah_attr, ibv_gid, ibv_gid_entry, ibv_global_route, IBV_GID_TYPE_IB, IBV_GID_TYPE_ROCE_V1,
    IBV_GID_TYPE_ROCE_V2,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::errno_result;
use super::protection_domain::ProtectionDomain;
use super::symbols::verbs;

/// A 128-bit Global Identifier, the layer 3 address of a port. On RoCE v2 it is the IPv6 (or
/// IPv4-mapped) address of the netdev.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Gid {
    pub raw: [u8; 16],
}

impl AsMut<ibv_gid> for Gid {
    fn as_mut(&mut self) -> &mut ibv_gid {
        unsafe { &mut *self.raw.as_mut_ptr().cast::<ibv_gid>() }
    }
}

impl From<ibv_gid> for Gid {
    fn from(gid: ibv_gid) -> Self {
        Self {
            raw: unsafe { gid.raw },
        }
    }
}

impl From<Gid> for ibv_gid {
    fn from(mut gid: Gid) -> Self {
        *gid.as_mut()
    }
}

impl From<Gid> for Ipv6Addr {
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.raw)
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Gid { raw: addr.octets() }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, pair) in self.raw.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl Gid {
    pub fn is_zero(&self) -> bool {
        u128::from_ne_bytes(self.raw) == 0
    }

    pub fn is_unicast_link_local(&self) -> bool {
        self.raw[0] == 0xfe && self.raw[1] & 0xc0 == 0x80
    }

    fn to_hex(self) -> String {
        use std::fmt::Write;

        self.raw.iter().fold(String::with_capacity(32), |mut hex, b| {
            let _ = write!(hex, "{b:02x}");
            hex
        })
    }

    fn from_hex(hex: &str) -> Result<Gid, String> {
        if hex.len() != 32 {
            return Err(format!("invalid gid length: expected 32 hex chars, got {}", hex.len()));
        }
        let mut gid = Gid::default();
        for (i, byte) in gid.raw.iter_mut().enumerate() {
            *byte = hex
                .get(i * 2..i * 2 + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex digits at offset {}", i * 2))?;
        }
        Ok(gid)
    }
}

/// How the GID is used on the wire.
#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum GidType {
    InfiniBand = IBV_GID_TYPE_IB,
    RoceV1 = IBV_GID_TYPE_ROCE_V1,
    RoceV2 = IBV_GID_TYPE_ROCE_V2,
}

impl From<u32> for GidType {
    fn from(gid_type: u32) -> Self {
        match gid_type {
            IBV_GID_TYPE_IB => GidType::InfiniBand,
            IBV_GID_TYPE_ROCE_V1 => GidType::RoceV1,
            IBV_GID_TYPE_ROCE_V2 => GidType::RoceV2,
            _ => panic!("Unknown Gid type: {gid_type}"),
        }
    }
}

/// One row of a device's GID table, see
/// [`DeviceContext::query_gid_table`](super::device_context::DeviceContext::query_gid_table).
///
/// Serialized with the GID as a 32 digit hex string so entries can be exchanged out of band.
#[repr(transparent)]
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "GidEntryRecord", into = "GidEntryRecord")]
pub struct GidEntry(pub(crate) ibv_gid_entry);

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GidEntryRecord {
    gid: String,
    gid_index: u32,
    port_num: u32,
    gid_type: u32,
    ndev_ifindex: u32,
}

impl From<GidEntry> for GidEntryRecord {
    fn from(entry: GidEntry) -> Self {
        GidEntryRecord {
            gid: entry.gid().to_hex(),
            gid_index: entry.0.gid_index,
            port_num: entry.0.port_num,
            gid_type: entry.0.gid_type,
            ndev_ifindex: entry.0.ndev_ifindex,
        }
    }
}

impl TryFrom<GidEntryRecord> for GidEntry {
    type Error = String;

    fn try_from(record: GidEntryRecord) -> Result<Self, Self::Error> {
        Ok(GidEntry(ibv_gid_entry {
            gid: Gid::from_hex(&record.gid)?.into(),
            gid_index: record.gid_index,
            port_num: record.port_num,
            gid_type: record.gid_type,
            ndev_ifindex: record.ndev_ifindex,
        }))
    }
}

impl Default for GidEntry {
    fn default() -> Self {
        GidEntry(ibv_gid_entry {
            gid: Gid::default().into(),
            gid_index: 0,
            port_num: 1,
            gid_type: 0,
            ndev_ifindex: 0,
        })
    }
}

impl fmt::Debug for GidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GidEntry")
            .field("gid", &self.gid().to_string())
            .field("gid_index", &self.gid_index())
            .field("port_num", &self.port_num())
            .field("gid_type", &self.0.gid_type)
            .field("ndev_ifindex", &self.netdev_index())
            .finish()
    }
}

impl GidEntry {
    #[inline]
    pub fn gid_index(&self) -> u32 {
        self.0.gid_index
    }

    #[inline]
    pub fn port_num(&self) -> u32 {
        self.0.port_num
    }

    #[inline]
    pub fn gid_type(&self) -> GidType {
        self.0.gid_type.into()
    }

    /// Interface index of the netdev this GID belongs to, `0` if none.
    #[inline]
    pub fn netdev_index(&self) -> u32 {
        self.0.ndev_ifindex
    }

    /// Name of the netdev this GID belongs to.
    pub fn netdev_name(&self) -> io::Result<String> {
        let mut buf = [0u8; IF_NAMESIZE];

        let name = unsafe { libc::if_indextoname(self.netdev_index(), buf.as_mut_ptr().cast()) };
        if name.is_null() {
            return Err(io::Error::last_os_error());
        }

        let name = CStr::from_bytes_until_nul(&buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(name.to_string_lossy().into_owned())
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        Gid::from(self.0.gid)
    }
}

/// The path description used by UD sends through an [`AddressHandle`], and embedded in the RTR
/// transition of connected QPs.
#[derive(Clone, Copy)]
pub struct AddressHandleAttribute {
    pub(crate) attr: ibv_ah_attr,
}

impl Default for AddressHandleAttribute {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AddressHandleAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressHandleAttribute")
            .field("dlid", &self.attr.dlid)
            .field("sl", &self.attr.sl)
            .field("port_num", &self.attr.port_num)
            .field("is_global", &self.attr.is_global)
            .field("dgid", &self.dest_gid().to_string())
            .field("sgid_index", &self.src_gid_index())
            .field("hop_limit", &self.attr.grh.hop_limit)
            .finish()
    }
}

impl AddressHandleAttribute {
    pub fn new() -> Self {
        AddressHandleAttribute {
            attr: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    pub fn setup_dest_lid(&mut self, dest_lid: u16) -> &mut Self {
        self.attr.dlid = dest_lid;
        self
    }

    pub fn setup_service_level(&mut self, sl: u8) -> &mut Self {
        self.attr.sl = sl;
        self
    }

    pub fn setup_port(&mut self, port_num: u8) -> &mut Self {
        self.attr.port_num = port_num;
        self
    }

    pub fn setup_static_rate(&mut self, static_rate: u8) -> &mut Self {
        self.attr.static_rate = static_rate;
        self
    }

    /// Setup the whole global routing header at once.
    pub fn setup_grh(
        &mut self, dest_gid: &Gid, flow_label: u32, src_gid_index: u8, hop_limit: u8, traffic_class: u8,
    ) -> &mut Self {
        self.attr.grh = ibv_global_route {
            dgid: (*dest_gid).into(),
            flow_label,
            sgid_index: src_gid_index,
            hop_limit,
            traffic_class,
        };
        self.attr.is_global = 1;
        self
    }

    pub fn setup_grh_dest_gid(&mut self, dest_gid: &Gid) -> &mut Self {
        self.attr.grh.dgid = (*dest_gid).into();
        self.attr.is_global = 1;
        self
    }

    pub fn setup_grh_src_gid_index(&mut self, src_gid_index: u8) -> &mut Self {
        self.attr.grh.sgid_index = src_gid_index;
        self.attr.is_global = 1;
        self
    }

    pub fn setup_grh_hop_limit(&mut self, hop_limit: u8) -> &mut Self {
        self.attr.grh.hop_limit = hop_limit;
        self.attr.is_global = 1;
        self
    }

    pub fn setup_grh_traffic_class(&mut self, traffic_class: u8) -> &mut Self {
        self.attr.grh.traffic_class = traffic_class;
        self.attr.is_global = 1;
        self
    }

    pub fn dest_gid(&self) -> Gid {
        self.attr.grh.dgid.into()
    }

    pub fn src_gid_index(&self) -> u8 {
        self.attr.grh.sgid_index
    }

    pub fn port(&self) -> u8 {
        self.attr.port_num
    }

    pub fn is_global(&self) -> bool {
        self.attr.is_global != 0
    }
}

/// Error returned by [`ProtectionDomain::create_ah`].
#[derive(Debug, thiserror::Error)]
#[error("failed to create address handle (port_num={port_num}, sgid_index={sgid_index}, dgid={dgid})")]
#[non_exhaustive]
pub struct CreateAddressHandleError {
    pub port_num: u8,
    pub sgid_index: u8,
    pub dgid: Gid,
    pub source: CreateAddressHandleErrorKind,
}

/// The enum type for [`CreateAddressHandleError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateAddressHandleErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`AddressHandle::destroy`].
#[derive(Debug, thiserror::Error)]
#[error("failed to destroy address handle")]
#[non_exhaustive]
pub struct DestroyAddressHandleError(#[from] pub DestroyAddressHandleErrorKind);

/// The enum type for [`DestroyAddressHandleError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DestroyAddressHandleErrorKind {
    #[error("address handle is still shared by {shares} other handles")]
    InUse { shares: usize, handle: Arc<AddressHandle> },
    #[error(transparent)]
    Ibverbs(#[from] io::Error),
}

/// A resolved path to a remote port, the destination of UD sends.
#[derive(Debug)]
pub struct AddressHandle {
    ah: NonNull<ibv_ah>,
    attr: AddressHandleAttribute,
    released: bool,
    _pd: Arc<ProtectionDomain>,
}

unsafe impl Send for AddressHandle {}
unsafe impl Sync for AddressHandle {}

impl AddressHandle {
    pub(crate) fn create(
        pd: &Arc<ProtectionDomain>, attr: &AddressHandleAttribute,
    ) -> Result<Arc<AddressHandle>, CreateAddressHandleError> {
        let mut raw_attr = attr.attr;
        let ah = unsafe { (verbs().create_ah)(pd.pd.as_ptr(), &mut raw_attr) };
        let ah = NonNull::new(ah).ok_or_else(|| CreateAddressHandleError {
            port_num: attr.port(),
            sgid_index: attr.src_gid_index(),
            dgid: attr.dest_gid(),
            source: io::Error::last_os_error().into(),
        })?;
        debug!(dgid = %attr.dest_gid(), sgid_index = attr.src_gid_index(), "AddressHandle::create");
        Ok(Arc::new(AddressHandle {
            ah,
            attr: *attr,
            released: false,
            _pd: Arc::clone(pd),
        }))
    }

    pub(crate) fn ah(&self) -> NonNull<ibv_ah> {
        self.ah
    }

    /// The attributes this handle was created with.
    pub fn attr(&self) -> &AddressHandleAttribute {
        &self.attr
    }

    /// Destroy the address handle now, fails while work requests or other clones hold it.
    pub fn destroy(self: Arc<Self>) -> Result<(), DestroyAddressHandleError> {
        let mut handle = Arc::try_unwrap(self).map_err(|handle| DestroyAddressHandleErrorKind::InUse {
            shares: Arc::strong_count(&handle) - 1,
            handle,
        })?;
        handle.released = true;
        errno_result(unsafe { (verbs().destroy_ah)(handle.ah.as_ptr()) })?;
        Ok(())
    }
}

impl Drop for AddressHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = errno_result(unsafe { (verbs().destroy_ah)(self.ah.as_ptr()) }) {
            warn!(dgid = %self.attr.dest_gid(), error = %err, "failed to destroy address handle");
        }
    }
}
