//! The device context is used for querying RDMA device attributes and creating the initial
//! resources.
use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::Ipv6Addr;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_mummy_sys::{
    ibv_context, ibv_device_attr, ibv_gid_entry, ibv_mtu, ibv_port_attr, ibv_port_state, IBV_GID_TYPE_IB,
    IBV_GID_TYPE_ROCE_V1, IBV_GID_TYPE_ROCE_V2, IBV_LINK_LAYER_ETHERNET, IBV_LINK_LAYER_INFINIBAND,
    IBV_LINK_LAYER_UNSPECIFIED,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::address::{Gid, GidEntry};
use super::completion::CompletionQueueBuilder;
use super::device::{device_name, DeviceInfo, TransportType};
use super::errno_result;
use super::protection_domain::ProtectionDomain;
use super::symbols::verbs;

/// Error returned by [`DeviceContext::alloc_pd`] for allocating a new RDMA PD.
#[derive(Debug, thiserror::Error)]
#[error("failed to alloc protection domain")]
#[non_exhaustive]
pub struct AllocateProtectionDomainError(#[from] pub AllocateProtectionDomainErrorKind);

/// The enum type for [`AllocateProtectionDomainError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum AllocateProtectionDomainErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`DeviceContext::close`].
#[derive(Debug, thiserror::Error)]
#[error("failed to close device context")]
#[non_exhaustive]
pub struct CloseDeviceError(#[from] pub CloseDeviceErrorKind);

/// The enum type for [`CloseDeviceError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CloseDeviceErrorKind {
    /// Protection domains, completion queues or other clones still hold the context, it is handed
    /// back untouched.
    #[error("device context is still shared by {shares} other handles")]
    InUse { shares: usize, context: Arc<DeviceContext> },
    #[error(transparent)]
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`DeviceContext::query_device`] for querying device context's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query device")]
#[non_exhaustive]
pub struct QueryDeviceError(#[from] pub QueryDeviceErrorKind);

/// The enum type for [`QueryDeviceError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryDeviceErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`DeviceContext::query_port`] for querying physical port's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query port (port_num={port_num})")]
#[non_exhaustive]
pub struct QueryPortError {
    pub port_num: u8,
    pub source: QueryPortErrorKind,
}

/// The enum type for [`QueryPortError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryPortErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`DeviceContext::query_gid_table`] for querying RDMA device's GID table, which
/// includes all GID entries on an RDMA device.
#[derive(Debug, thiserror::Error)]
#[error("failed to query GID table")]
#[non_exhaustive]
pub struct QueryGidTableError(#[from] pub QueryGidTableErrorKind);

/// The enum type for [`QueryGidTableError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryGidTableErrorKind {
    Ibverbs(#[from] io::Error),
    QueryDevice(#[from] QueryDeviceError),
    QueryPort(#[from] QueryPortError),
    QueryGid(#[from] QueryGidError),
    #[error("invalid device name")]
    InvalidDeviceName,
}

/// Error returned by [`DeviceContext::query_gid`] for querying a GID by its index.
#[derive(Debug, thiserror::Error)]
#[error("failed to query GID (port_num={port_num}, gid_index={gid_index})")]
#[non_exhaustive]
pub struct QueryGidError {
    pub port_num: u8,
    pub gid_index: u32,
    pub source: QueryGidErrorKind,
}

/// The enum type for [`QueryGidError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryGidErrorKind {
    Ibverbs(#[from] io::Error),
}

/// A Global Unique Indentifier (GUID) for the RDMA device. Usually assigned to the device by its
/// vendor during the manufacturing, may contain part of the MAC address on the ethernet device.
///
/// Stored in host byte order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(pub(crate) u64);

impl Guid {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Guid {
    fn from(guid: u64) -> Self {
        Guid(guid)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}:{:04x}:{:04x}",
            (self.0 >> 48) & 0xFFFF,
            (self.0 >> 32) & 0xFFFF,
            (self.0 >> 16) & 0xFFFF,
            self.0 & 0xFFFF
        )
    }
}

/// RDMA Maximum Transmission Units (MTU). Only five sizes exist and they count the RDMA payload
/// alone, the ethernet MTU of a RoCE netdev has to leave room for the headers on top (`4200` for
/// [`Mtu::Mtu4096`], for example).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mtu {
    Mtu256 = ibv_mtu::IBV_MTU_256,
    Mtu512 = ibv_mtu::IBV_MTU_512,
    Mtu1024 = ibv_mtu::IBV_MTU_1024,
    Mtu2048 = ibv_mtu::IBV_MTU_2048,
    Mtu4096 = ibv_mtu::IBV_MTU_4096,
}

impl Mtu {
    /// Payload size in bytes.
    pub fn bytes(&self) -> u32 {
        128 << (*self as u32)
    }
}

impl From<u32> for Mtu {
    fn from(mtu: u32) -> Self {
        match mtu {
            ibv_mtu::IBV_MTU_256 => Mtu::Mtu256,
            ibv_mtu::IBV_MTU_512 => Mtu::Mtu512,
            ibv_mtu::IBV_MTU_1024 => Mtu::Mtu1024,
            ibv_mtu::IBV_MTU_2048 => Mtu::Mtu2048,
            ibv_mtu::IBV_MTU_4096 => Mtu::Mtu4096,
            _ => panic!("Unknown MTU value: {mtu}"),
        }
    }
}

/// The link layer protocol of physical port.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkLayer {
    Unspecified = IBV_LINK_LAYER_UNSPECIFIED,
    InfiniBand = IBV_LINK_LAYER_INFINIBAND,
    Ethernet = IBV_LINK_LAYER_ETHERNET,
}

impl From<u8> for LinkLayer {
    fn from(link: u8) -> Self {
        match link {
            IBV_LINK_LAYER_UNSPECIFIED => LinkLayer::Unspecified,
            IBV_LINK_LAYER_INFINIBAND => LinkLayer::InfiniBand,
            IBV_LINK_LAYER_ETHERNET => LinkLayer::Ethernet,
            _ => panic!("Unknown link layer value: {link}"),
        }
    }
}

/// The logical state of a port.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortState {
    Nop = ibv_port_state::IBV_PORT_NOP,
    /// The physical link is down, packets handed to the link layer are discarded.
    Down = ibv_port_state::IBV_PORT_DOWN,
    /// The physical link is up but the subnet manager has not configured the logical link yet.
    Initializing = ibv_port_state::IBV_PORT_INIT,
    /// Configured by the subnet manager, only management packets may be sent.
    Armed = ibv_port_state::IBV_PORT_ARMED,
    /// All packet types can be sent and received.
    Active = ibv_port_state::IBV_PORT_ACTIVE,
    /// Was active, the physical link failed and may recover within a timeout.
    ActiveDefer = ibv_port_state::IBV_PORT_ACTIVE_DEFER,
}

impl From<u32> for PortState {
    fn from(port_state: u32) -> Self {
        match port_state {
            ibv_port_state::IBV_PORT_NOP => PortState::Nop,
            ibv_port_state::IBV_PORT_DOWN => PortState::Down,
            ibv_port_state::IBV_PORT_INIT => PortState::Initializing,
            ibv_port_state::IBV_PORT_ARMED => PortState::Armed,
            ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
            ibv_port_state::IBV_PORT_ACTIVE_DEFER => PortState::ActiveDefer,
            _ => panic!("Unknown port state value: {port_state}"),
        }
    }
}

/// The attributes of a port of an RDMA device context.
pub struct PortAttr {
    attr: ibv_port_attr,
}

impl PortAttr {
    /// Get the maximum MTU supported by this port.
    pub fn max_mtu(&self) -> Mtu {
        self.attr.max_mtu.into()
    }

    /// Get the maximum MTU enabled on this port to transmit and receive.
    pub fn active_mtu(&self) -> Mtu {
        self.attr.active_mtu.into()
    }

    /// Get the length of GID table of this port.
    pub fn gid_tbl_len(&self) -> i32 {
        self.attr.gid_tbl_len
    }

    /// Get the base LID of this port, always `0` on RoCE ports.
    pub fn lid(&self) -> u16 {
        self.attr.lid
    }

    /// Get the largest message this port can transfer.
    pub fn max_msg_sz(&self) -> u32 {
        self.attr.max_msg_sz
    }

    /// Get the link layer protocol used by this port.
    pub fn link_layer(&self) -> LinkLayer {
        self.attr.link_layer.into()
    }

    /// Get the logical port status of this port.
    pub fn port_state(&self) -> PortState {
        self.attr.state.into()
    }
}

/// The attributes of an RDMA device that is associated with a context.
pub struct DeviceAttr {
    attr: ibv_device_attr,
}

impl DeviceAttr {
    /// Get the number of physical ports on this device.
    pub fn phys_port_cnt(&self) -> u8 {
        self.attr.phys_port_cnt
    }

    /// Get the largest memory region this device can register.
    pub fn max_mr_size(&self) -> u64 {
        self.attr.max_mr_size
    }

    /// Get the maximum number of queue pairs.
    pub fn max_qp(&self) -> i32 {
        self.attr.max_qp
    }

    /// Get the maximum number of outstanding work requests on any queue.
    pub fn max_qp_wr(&self) -> i32 {
        self.attr.max_qp_wr
    }

    /// Get the maximum number of entries of a completion queue.
    pub fn max_cqe(&self) -> i32 {
        self.attr.max_cqe
    }

    /// Get the maximum number of scatter / gather entries per work request.
    pub fn max_sge(&self) -> i32 {
        self.attr.max_sge
    }

    /// Get the IEEE device's vendor.
    pub fn vendor_id(&self) -> u32 {
        self.attr.vendor_id
    }

    /// Get the device's Part ID, as supplied by the vendor.
    pub fn vendor_part_id(&self) -> u32 {
        self.attr.vendor_part_id
    }

    /// Get the firmware version of the RDMA device, it would be empty string if no version filled.
    pub fn firmware_version(&self) -> String {
        self.attr
            .fw_ver
            .iter()
            .take_while(|&&c| c > 0)
            .map(|&c| c as u8 as char)
            .collect()
    }

    /// Get the hardware version of the RDMA device, as supplied by the vendor.
    pub fn hardware_version(&self) -> u32 {
        self.attr.hw_ver
    }

    /// Get the [`Guid`] of this device.
    pub fn node_guid(&self) -> Guid {
        Guid(u64::from_be(self.attr.node_guid))
    }

    /// Get the [`Guid`] associated with this RDMA device and other devices which are part of a
    /// single system.
    pub fn sys_image_guid(&self) -> Guid {
        Guid(u64::from_be(self.attr.sys_image_guid))
    }
}

/// A context of the RDMA device, could be used to query its resources or creating PD or CQ.
///
/// Every resource created from a context keeps an [`Arc`] share of it, so the native context is
/// only closed after all of them are gone.
#[derive(Debug)]
pub struct DeviceContext {
    pub(crate) context: NonNull<ibv_context>,
    // contexts handed out by the connection manager are closed by librdmacm
    owned: bool,
    released: bool,
}

unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if self.owned && !self.released {
            if let Err(err) = self.close_native() {
                warn!(device = self.name(), error = %err, "failed to close device context");
            }
        }
    }
}

impl DeviceContext {
    pub(crate) unsafe fn open(device: *mut rdma_mummy_sys::ibv_device) -> io::Result<Arc<DeviceContext>> {
        let context = NonNull::new((verbs().open_device)(device)).ok_or_else(io::Error::last_os_error)?;
        debug!(device = device_name(device), "DeviceContext::open");
        Ok(Arc::new(DeviceContext {
            context,
            owned: true,
            released: false,
        }))
    }

    /// Wrap a context that belongs to librdmacm.
    pub(crate) fn borrowed(context: NonNull<ibv_context>) -> DeviceContext {
        DeviceContext {
            context,
            owned: false,
            released: false,
        }
    }

    fn close_native(&self) -> io::Result<()> {
        errno_result(unsafe { (verbs().close_device)(self.context.as_ptr()) })
    }

    /// Close the context now.
    ///
    /// Fails with [`CloseDeviceErrorKind::InUse`] while other shares are alive, including the ones
    /// kept by protection domains and completion queues created from it.
    pub fn close(self: Arc<Self>) -> Result<(), CloseDeviceError> {
        let mut context = Arc::try_unwrap(self).map_err(|context| CloseDeviceErrorKind::InUse {
            shares: Arc::strong_count(&context) - 1,
            context,
        })?;
        context.released = true;
        debug!(device = context.name(), "DeviceContext::close");
        if context.owned {
            context.close_native()?;
        }
        Ok(())
    }

    /// Allocate a protection domain.
    pub fn alloc_pd(self: &Arc<Self>) -> Result<Arc<ProtectionDomain>, AllocateProtectionDomainError> {
        let pd = unsafe { (verbs().alloc_pd)(self.context.as_ptr()) };
        let pd = NonNull::new(pd).ok_or_else(|| AllocateProtectionDomainErrorKind::Ibverbs(io::Error::last_os_error()))?;

        Ok(Arc::new(ProtectionDomain::new(Arc::clone(self), pd)))
    }

    /// Create a factory for creating [`BasicCompletionQueue`] and [`ExtendedCompletionQueue`].
    ///
    /// [`BasicCompletionQueue`]: crate::ibverbs::completion::BasicCompletionQueue
    /// [`ExtendedCompletionQueue`]: crate::ibverbs::completion::ExtendedCompletionQueue
    ///
    pub fn create_cq_builder(self: &Arc<Self>) -> CompletionQueueBuilder {
        CompletionQueueBuilder::new(self)
    }

    /// Query the attributes of the RDMA device.
    pub fn query_device(&self) -> Result<DeviceAttr, QueryDeviceError> {
        let mut attr = MaybeUninit::<ibv_device_attr>::zeroed();
        unsafe {
            match (verbs().query_device)(self.context.as_ptr(), attr.as_mut_ptr()) {
                0 => Ok(DeviceAttr {
                    attr: attr.assume_init(),
                }),
                ret => Err(QueryDeviceErrorKind::Ibverbs(io::Error::from_raw_os_error(ret)).into()),
            }
        }
    }

    /// Query the attributes of a physical port.
    pub fn query_port(&self, port_num: u8) -> Result<PortAttr, QueryPortError> {
        let mut attr = MaybeUninit::<ibv_port_attr>::zeroed();
        unsafe {
            match (verbs().query_port)(self.context.as_ptr(), port_num, attr.as_mut_ptr()) {
                0 => Ok(PortAttr {
                    attr: attr.assume_init(),
                }),
                ret => Err(QueryPortError {
                    port_num,
                    source: io::Error::from_raw_os_error(ret).into(),
                }),
            }
        }
    }

    /// Query the [`Gid`] of the GID specified by GID index and port number.
    pub fn query_gid(&self, port_num: u8, gid_index: u32) -> Result<Gid, QueryGidError> {
        let mut gid = Gid::default();
        unsafe {
            match (verbs().query_gid)(self.context.as_ptr(), port_num, gid_index as i32, gid.as_mut()) {
                0 => Ok(gid),
                ret => Err(QueryGidError {
                    port_num,
                    gid_index,
                    source: io::Error::from_raw_os_error(ret).into(),
                }),
            }
        }
    }

    /// Query all [`GidEntry`]s on a RDMA device.
    ///
    /// Uses the private `_ibv_query_gid_table` entry point when libibverbs exports it, otherwise
    /// queries every index and reads the GID types and netdevs from sysfs.
    pub fn query_gid_table(&self) -> Result<Vec<GidEntry>, QueryGidTableError> {
        let Some(query_gid_table) = verbs().query_gid_table else {
            return self.query_gid_table_fallback();
        };
        let dev_attr = self.query_device()?;

        // The entries array has to be able to hold every valid GID of every port.
        let mut size = 0;
        for port_num in 1..=dev_attr.phys_port_cnt() {
            size += self.query_port(port_num)?.gid_tbl_len().max(0) as usize;
        }

        let mut entries = vec![GidEntry::default(); size];
        let valid_size = unsafe {
            query_gid_table(
                self.context.as_ptr(),
                entries.as_mut_ptr() as _,
                entries.len(),
                0,
                mem::size_of::<ibv_gid_entry>(),
            )
        };

        if valid_size == -(libc::EOPNOTSUPP as isize) {
            return self.query_gid_table_fallback();
        }
        if valid_size < 0 {
            return Err(QueryGidTableErrorKind::Ibverbs(io::Error::from_raw_os_error(-valid_size as i32)).into());
        }

        entries.truncate(valid_size as usize);
        Ok(entries)
    }

    pub(crate) fn query_gid_table_fallback(&self) -> Result<Vec<GidEntry>, QueryGidTableError> {
        let name = self.name();
        if name.is_empty() {
            return Err(QueryGidTableErrorKind::InvalidDeviceName.into());
        }

        let dev_attr = self.query_device()?;
        let mut res = Vec::new();

        for port_num in 1..=dev_attr.phys_port_cnt() {
            let port_attr = self.query_port(port_num)?;
            let ports_dir = format!("/sys/class/infiniband/{name}/ports/{port_num}/gid_attrs");

            for gid_index in 0..port_attr.gid_tbl_len().max(0) as u32 {
                let gid = self.query_gid(port_num, gid_index)?;
                if gid.is_zero() {
                    continue;
                }

                let gid_type = match fs::read_to_string(format!("{ports_dir}/types/{gid_index}")) {
                    Ok(sysfs) => sysfs_gid_type(sysfs.trim_ascii_end(), port_attr.link_layer()),
                    Err(_) => guess_gid_type(&gid, port_attr.link_layer()),
                };

                let ndev_ifindex = fs::read_to_string(format!("{ports_dir}/ndevs/{gid_index}"))
                    .ok()
                    .and_then(|netdev| CString::new(netdev.trim_ascii_end()).ok())
                    .map_or(0, |netdev| unsafe { libc::if_nametoindex(netdev.as_ptr()) });

                res.push(GidEntry(ibv_gid_entry {
                    gid: gid.into(),
                    gid_index,
                    port_num: port_num.into(),
                    gid_type,
                    ndev_ifindex,
                }))
            }
        }

        Ok(res)
    }
}

fn sysfs_gid_type(sysfs: &str, link_layer: LinkLayer) -> u32 {
    match sysfs {
        "RoCE v2" => IBV_GID_TYPE_ROCE_V2,
        _ if link_layer == LinkLayer::InfiniBand => IBV_GID_TYPE_IB,
        _ => IBV_GID_TYPE_ROCE_V1,
    }
}

// Without sysfs there is nothing authoritative left, RoCE v2 GIDs are derived from IP addresses
// and the IPv6 link-local one is the RoCE v1 default.
fn guess_gid_type(gid: &Gid, link_layer: LinkLayer) -> u32 {
    if link_layer == LinkLayer::InfiniBand {
        return IBV_GID_TYPE_IB;
    }
    let addr = Ipv6Addr::from(*gid);
    if addr.to_ipv4_mapped().is_some() || !gid.is_unicast_link_local() {
        IBV_GID_TYPE_ROCE_V2
    } else {
        IBV_GID_TYPE_ROCE_V1
    }
}

impl DeviceInfo for DeviceContext {
    fn name(&self) -> String {
        unsafe { device_name(self.context.as_ref().device) }
    }

    fn guid(&self) -> Guid {
        Guid(u64::from_be(unsafe { (verbs().get_device_guid)(self.context.as_ref().device) }))
    }

    fn transport_type(&self) -> TransportType {
        unsafe { (*self.context.as_ref().device).transport_type.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::address::GidType;
    use crate::ibverbs::device;
    use crate::ibverbs::loopback;
    use rstest::rstest;

    fn open_loopback() -> Arc<DeviceContext> {
        loopback::install().unwrap();
        let device_list = device::DeviceList::new().unwrap();
        let ctx = device_list.get(0).unwrap().open().unwrap();
        ctx
    }

    #[rstest]
    #[case(ibv_mtu::IBV_MTU_256, Mtu::Mtu256, 256)]
    #[case(ibv_mtu::IBV_MTU_512, Mtu::Mtu512, 512)]
    #[case(ibv_mtu::IBV_MTU_1024, Mtu::Mtu1024, 1024)]
    #[case(ibv_mtu::IBV_MTU_2048, Mtu::Mtu2048, 2048)]
    #[case(ibv_mtu::IBV_MTU_4096, Mtu::Mtu4096, 4096)]
    fn test_mtu_conversion(#[case] raw: u32, #[case] mtu: Mtu, #[case] bytes: u32) {
        assert_eq!(Mtu::from(raw), mtu);
        assert_eq!(mtu.bytes(), bytes);
    }

    #[test]
    #[should_panic(expected = "Unknown MTU value")]
    fn test_invalid_mtu_conversion() {
        let _ = Mtu::from(999);
    }

    #[test]
    fn test_mtu_serde() {
        assert_eq!(serde_json::to_string(&Mtu::Mtu4096).unwrap(), "\"Mtu4096\"");
        let mtu: Mtu = serde_json::from_str("\"Mtu1024\"").unwrap();
        assert_eq!(mtu, Mtu::Mtu1024);
    }

    #[test]
    fn test_link_layer_conversion() {
        assert_eq!(LinkLayer::from(IBV_LINK_LAYER_UNSPECIFIED), LinkLayer::Unspecified);
        assert_eq!(LinkLayer::from(IBV_LINK_LAYER_INFINIBAND), LinkLayer::InfiniBand);
        assert_eq!(LinkLayer::from(IBV_LINK_LAYER_ETHERNET), LinkLayer::Ethernet);
    }

    #[test]
    fn test_port_state_conversion() {
        assert_eq!(PortState::from(0), PortState::Nop);
        assert_eq!(PortState::from(1), PortState::Down);
        assert_eq!(PortState::from(2), PortState::Initializing);
        assert_eq!(PortState::from(3), PortState::Armed);
        assert_eq!(PortState::from(4), PortState::Active);
        assert_eq!(PortState::from(5), PortState::ActiveDefer);
    }

    #[test]
    fn test_guid_display() {
        assert_eq!(Guid(0x0002_c903_00a1_b2c3).to_string(), "0002:c903:00a1:b2c3");
    }

    #[test]
    fn test_query_device_and_port() {
        let ctx = open_loopback();

        let dev_attr = ctx.query_device().unwrap();
        assert_eq!(dev_attr.phys_port_cnt(), 1);
        assert!(dev_attr.max_qp_wr() > 0);
        assert!(dev_attr.max_cqe() > 0);
        assert!(dev_attr.max_mr_size() > 0);
        assert_eq!(dev_attr.node_guid(), ctx.guid());

        let port_attr = ctx.query_port(1).unwrap();
        assert_eq!(port_attr.port_state(), PortState::Active);
        assert_eq!(port_attr.link_layer(), LinkLayer::Ethernet);
        assert_eq!(port_attr.active_mtu(), Mtu::Mtu1024);
        assert_eq!(port_attr.gid_tbl_len(), 2);
        assert_eq!(port_attr.lid(), 0);
    }

    #[test]
    fn test_query_gid_table_fallback() {
        let ctx = open_loopback();

        let gid_entries = ctx.query_gid_table().unwrap();
        let gid_entries_fallback = ctx.query_gid_table_fallback().unwrap();

        assert_eq!(gid_entries.len(), gid_entries_fallback.len());
        for (entry, fallback) in gid_entries.iter().zip(&gid_entries_fallback) {
            assert_eq!(entry.gid(), fallback.gid());
            assert_eq!(entry.gid_index(), fallback.gid_index());
            assert_eq!(entry.gid_type(), fallback.gid_type());
            assert_eq!(entry.port_num(), fallback.port_num());
        }
        assert_eq!(gid_entries[0].gid_type(), GidType::RoceV1);
        assert_eq!(gid_entries[1].gid_type(), GidType::RoceV2);
    }

    #[test]
    fn test_query_port_error() {
        let invalid_port_num: u8 = 255;
        let ctx = open_loopback();
        let error = ctx.query_port(invalid_port_num).err().unwrap();
        assert_eq!(error.port_num, invalid_port_num);
        match error.source {
            QueryPortErrorKind::Ibverbs(err) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
        };
    }

    #[test]
    fn test_query_gid_error() {
        let ctx = open_loopback();
        let error = ctx.query_gid(1, 16).unwrap_err();
        assert_eq!((error.port_num, error.gid_index), (1, 16));
        assert_eq!(error.to_string(), "failed to query GID (port_num=1, gid_index=16)");
    }

    #[test]
    fn test_get_device_info_from_context() {
        loopback::install().unwrap();
        let device_list = device::DeviceList::new().unwrap();
        for device in &device_list {
            let ctx = device.open().unwrap();
            assert_eq!(ctx.name(), device.name());
            assert_eq!(ctx.guid(), device.guid());
            assert_eq!(ctx.transport_type(), device.transport_type());
        }
    }

    #[test]
    fn test_close_hands_back_shared_context() {
        let ctx = open_loopback();
        let pd = ctx.alloc_pd().unwrap();

        let err = Arc::clone(&ctx).close().unwrap_err();
        let CloseDeviceErrorKind::InUse { shares, context } = err.0 else {
            panic!("expected InUse");
        };
        // `ctx` itself and the protection domain
        assert_eq!(shares, 2);
        drop(context);

        pd.dealloc().unwrap();
        ctx.close().unwrap();
    }
}
