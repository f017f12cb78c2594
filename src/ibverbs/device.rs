//! The device is used for creating a device context, everything about RDMA starts here.
use std::ops::Index;
use std::sync::Arc;
use std::{ffi::CStr, io, marker::PhantomData};

use rdma_mummy_sys::{ibv_device, ibv_transport_type};

use super::device_context::{DeviceContext, Guid};
use super::symbols::verbs;

/// Error returned by [`DeviceList::new`] for getting a new [`DeviceList`].
#[derive(Debug, thiserror::Error)]
#[error("failed to get device list")]
#[non_exhaustive]
pub struct GetDeviceListError(#[from] pub GetDeviceListErrorKind);

/// The enum type for [`GetDeviceListError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum GetDeviceListErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`Device::open`] for open the device to create a [`DeviceContext`].
#[derive(Debug, thiserror::Error)]
#[error("failed to open device {name}")]
#[non_exhaustive]
pub struct OpenDeviceError {
    pub name: String,
    #[source]
    pub source: OpenDeviceErrorKind,
}

/// The enum type for [`OpenDeviceError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum OpenDeviceErrorKind {
    Ibverbs(#[from] io::Error),
}

/// The RDMA device list which contains all RDMA devices based on the environment configuration.
pub struct DeviceList {
    devices: *mut *mut ibv_device,
    num_devices: usize,
}

impl DeviceList {
    /// Get a new RDMA device list based on current environment.
    ///
    /// # Panics
    ///
    /// Panics if the libibverbs entry points could not be resolved, see
    /// [`try_verbs`](super::symbols::try_verbs) for checking that beforehand.
    pub fn new() -> Result<DeviceList, GetDeviceListError> {
        let mut num_devices: i32 = 0;
        let devices = unsafe { (verbs().get_device_list)(&mut num_devices as *mut _) };
        if devices.is_null() {
            return Err(GetDeviceListErrorKind::Ibverbs(io::Error::last_os_error()).into());
        }

        Ok(DeviceList {
            devices,
            num_devices: num_devices.max(0) as usize,
        })
    }

    /// Get a device list iterator.
    pub fn iter(&self) -> DeviceListIter<'_> {
        DeviceListIter {
            current: 0,
            total: self.num_devices,
            devices: self,
        }
    }

    /// Get a device list slice from current device list.
    pub fn as_device_slice<'list>(&'list self) -> &'list [Device<'list>] {
        unsafe { std::slice::from_raw_parts(self.devices as *const Device<'list>, self.num_devices) }
    }

    /// Get the device from device list by index.
    pub fn get(&self, index: usize) -> Option<Device<'_>> {
        if index >= self.num_devices {
            return None;
        }
        let device = unsafe { *self.devices.add(index) };
        (!device.is_null()).then(|| Device::new(device, self))
    }

    /// Find a device by its name, for example, `mlx5_0`.
    pub fn find(&self, name: &str) -> Option<Device<'_>> {
        self.iter().find(|device| device.name() == name)
    }

    /// Get the device list length.
    pub fn len(&self) -> usize {
        self.num_devices
    }

    /// Check if current device list is empty.
    pub fn is_empty(&self) -> bool {
        self.num_devices == 0
    }
}

impl<'list> Index<usize> for &'list DeviceList {
    type Output = Device<'list>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.as_device_slice()[index]
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { (verbs().free_device_list)(self.devices) };
    }
}

impl<'list> IntoIterator for &'list DeviceList {
    type Item = <DeviceListIter<'list> as Iterator>::Item;
    type IntoIter = DeviceListIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The iterator of the [`DeviceList`].
pub struct DeviceListIter<'list> {
    current: usize,
    total: usize,
    devices: &'list DeviceList,
}

impl<'list> Iterator for DeviceListIter<'list> {
    type Item = Device<'list>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.total {
            return None;
        }
        let device = unsafe { *self.devices.devices.add(self.current) };
        self.current += 1;
        Some(Device::new(device, self.devices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.current;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for DeviceListIter<'_> {}

/// The underlying transport type of the device.
#[repr(i32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TransportType {
    Unknown = ibv_transport_type::IBV_TRANSPORT_UNKNOWN,
    InfiniBand = ibv_transport_type::IBV_TRANSPORT_IB,
    IWarp = ibv_transport_type::IBV_TRANSPORT_IWARP,
    Usnic = ibv_transport_type::IBV_TRANSPORT_USNIC,
    UsnicUdp = ibv_transport_type::IBV_TRANSPORT_USNIC_UDP,
    Unspecified = ibv_transport_type::IBV_TRANSPORT_UNSPECIFIED,
}

impl From<i32> for TransportType {
    fn from(trans: i32) -> Self {
        match trans {
            ibv_transport_type::IBV_TRANSPORT_UNKNOWN => TransportType::Unknown,
            ibv_transport_type::IBV_TRANSPORT_IB => TransportType::InfiniBand,
            ibv_transport_type::IBV_TRANSPORT_IWARP => TransportType::IWarp,
            ibv_transport_type::IBV_TRANSPORT_USNIC => TransportType::Usnic,
            ibv_transport_type::IBV_TRANSPORT_USNIC_UDP => TransportType::UsnicUdp,
            ibv_transport_type::IBV_TRANSPORT_UNSPECIFIED => TransportType::Unspecified,
            _ => panic!("Unknown transport type value: {trans}"),
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::InfiniBand => write!(f, "InfiniBand"),
            TransportType::IWarp => write!(f, "iWARP"),
            TransportType::Usnic => write!(f, "usNIC"),
            TransportType::UsnicUdp => write!(f, "usNIC UDP"),
            TransportType::Unspecified => write!(f, "Unspecified"),
            TransportType::Unknown => write!(f, "Invalid transport"),
        }
    }
}

/// A safe wrapper around a raw RDMA device pointer.
///
/// The lifetime parameter ensures that a Device cannot outlive the DeviceList
/// from which it was derived.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct Device<'list> {
    device: *mut ibv_device,
    _dev_list: PhantomData<&'list ()>,
}

impl Device<'_> {
    pub(crate) fn new(device: *mut ibv_device, _devices: &DeviceList) -> Self {
        Device {
            device,
            _dev_list: PhantomData,
        }
    }

    /// Open the device to create a [`DeviceContext`] for querying / creating all other RDMA
    /// resources later.
    pub fn open(&self) -> Result<Arc<DeviceContext>, OpenDeviceError> {
        unsafe { DeviceContext::open(self.device) }.map_err(|err| OpenDeviceError {
            name: self.name(),
            source: err.into(),
        })
    }
}

/// Trait for common device information access.
pub trait DeviceInfo {
    /// Get the name of the device, for example, `mlx5_0`.
    fn name(&self) -> String;

    /// Get the GUID of the device.
    fn guid(&self) -> Guid;

    /// Get the transport type of the device.
    fn transport_type(&self) -> TransportType;
}

impl DeviceInfo for Device<'_> {
    fn name(&self) -> String {
        unsafe { device_name(self.device) }
    }

    fn guid(&self) -> Guid {
        // libibverbs hands out the GUID in network byte order
        Guid(u64::from_be(unsafe { (verbs().get_device_guid)(self.device) }))
    }

    fn transport_type(&self) -> TransportType {
        unsafe { (*self.device).transport_type.into() }
    }
}

pub(crate) unsafe fn device_name(device: *mut ibv_device) -> String {
    let name = (verbs().get_device_name)(device);
    if name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::loopback;
    use rdma_mummy_sys::{_ibv_device_ops, ibv_node_type};
    use std::ffi::CString;

    #[test]
    fn test_transport_type_names() {
        use ibv_transport_type::*;

        let table = [
            (IBV_TRANSPORT_UNKNOWN, "Invalid transport"),
            (IBV_TRANSPORT_IB, "InfiniBand"),
            (IBV_TRANSPORT_IWARP, "iWARP"),
            (IBV_TRANSPORT_USNIC, "usNIC"),
            (IBV_TRANSPORT_USNIC_UDP, "usNIC UDP"),
            (IBV_TRANSPORT_UNSPECIFIED, "Unspecified"),
        ];
        for (raw, name) in table {
            let transport = TransportType::from(raw);
            assert_eq!(transport as i32, raw);
            assert_eq!(transport.to_string(), name);
        }
    }

    #[test]
    #[should_panic(expected = "Unknown transport type value")]
    fn test_invalid_transport_type_conversion() {
        let _ = TransportType::from(999);
    }

    #[test]
    fn test_iterations() {
        loopback::install().unwrap();
        // Mock some `ibv_device` on heap
        let dev_num = 8;
        let mut ibv_dev_ptrs: Vec<*mut ibv_device> = Vec::with_capacity(dev_num);
        for i in 0..dev_num {
            let mut ibv_dev = Box::new(ibv_device {
                _ops: _ibv_device_ops {
                    _dummy1: None,
                    _dummy2: None,
                },
                node_type: ibv_node_type::IBV_NODE_CA,
                transport_type: ibv_transport_type::IBV_TRANSPORT_IB,
                name: [0; 64usize],
                dev_name: [0; 64usize],
                dev_path: [0; 256usize],
                ibdev_path: [0; 256usize],
            });
            for (j, &b) in CString::new(format!("mock{i}")).unwrap().as_bytes().iter().enumerate() {
                ibv_dev.name[j] = b as std::os::raw::c_char;
            }
            ibv_dev_ptrs.push(Box::into_raw(ibv_dev));
        }
        let dev_list = DeviceList {
            devices: ibv_dev_ptrs.as_mut_ptr(),
            num_devices: dev_num,
        };

        assert_eq!(dev_list.len(), dev_num);
        assert!(!dev_list.is_empty());
        for i in 0..dev_num {
            let expect_name = format!("mock{i}");
            assert_eq!(dev_list.get(i).unwrap().name(), expect_name);
            assert_eq!((&dev_list)[i].name(), expect_name);
        }
        assert_eq!(dev_list.find("mock5").unwrap().device, ibv_dev_ptrs[5]);
        assert!(dev_list.find("mock9").is_none());

        // Iterator
        let mut iter = dev_list.iter();
        assert_eq!(iter.len(), dev_num);
        for i in 0..dev_num {
            assert_eq!(iter.next().unwrap().name(), format!("mock{i}"));
        }
        assert!(iter.next().is_none());

        for dev in &dev_list {
            assert_eq!(dev.transport_type(), TransportType::InfiniBand);
        }

        // the mock list was not allocated by the provider, it must not reach `free_device_list`
        std::mem::forget(dev_list);
        for dev in ibv_dev_ptrs {
            drop(unsafe { Box::from_raw(dev) });
        }
    }

    #[test]
    fn test_loopback_device_identity() {
        loopback::install().unwrap();
        let devices = DeviceList::new().unwrap();

        assert_eq!(devices.len(), 1);
        assert!(devices.get(devices.len()).is_none());

        let device = devices.get(0).unwrap();
        assert_eq!(device.name(), loopback::DEVICE_NAME);
        assert_eq!(device.guid(), loopback::DEVICE_GUID);
        assert_eq!(device.transport_type(), TransportType::InfiniBand);
        assert_eq!(device.guid().to_string(), "0002:c9ff:fe00:0001");
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn test_out_of_bound_index() {
        loopback::install().unwrap();
        let devices = DeviceList::new().unwrap();

        let _ = (&devices)[devices.len()];
    }
}
