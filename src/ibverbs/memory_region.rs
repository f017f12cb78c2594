//! Users need to register memory they allocated as memory region for accessing it later.
use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_mummy_sys::{ibv_mr, ibv_sge};
use tracing::{debug, warn};

use super::errno_result;
use super::protection_domain::ProtectionDomain;
use super::symbols::verbs;
use super::AccessFlags;

/// Error returned by [`ProtectionDomain::reg_mr`] for registering a new RDMA MR.
#[derive(Debug, thiserror::Error)]
#[error("failed to register memory region (addr={addr:#x}, len={len}, access={access:?})")]
#[non_exhaustive]
pub struct RegisterMemoryRegionError {
    pub addr: usize,
    pub len: usize,
    pub access: AccessFlags,
    #[source]
    pub source: RegisterMemoryRegionErrorKind,
}

/// The enum type for [`RegisterMemoryRegionError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegisterMemoryRegionErrorKind {
    #[error("invalid address, length or access flags")]
    InvalidArgument,
    #[error("not enough resources to pin the region")]
    ResourceExhausted,
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Ibverbs(io::Error),
}

impl From<io::Error> for RegisterMemoryRegionErrorKind {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => RegisterMemoryRegionErrorKind::InvalidArgument,
            Some(libc::ENOMEM) => RegisterMemoryRegionErrorKind::ResourceExhausted,
            Some(libc::EPERM | libc::EACCES) => RegisterMemoryRegionErrorKind::PermissionDenied,
            _ => RegisterMemoryRegionErrorKind::Ibverbs(err),
        }
    }
}

/// Error returned by [`MemoryRegion::deregister`].
#[derive(Debug, thiserror::Error)]
#[error("failed to deregister memory region")]
#[non_exhaustive]
pub struct DeregisterMemoryRegionError(#[from] pub DeregisterMemoryRegionErrorKind);

/// The enum type for [`DeregisterMemoryRegionError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DeregisterMemoryRegionErrorKind {
    #[error("memory region is still shared by {shares} other handles")]
    InUse { shares: usize, region: Arc<MemoryRegion> },
    #[error(transparent)]
    Ibverbs(#[from] io::Error),
}

/// Error returned by `setup_sge_from` when the range does not fit in the region.
#[derive(Debug, thiserror::Error)]
#[error("range of {len} bytes at offset {offset} exceeds the {region_len} byte memory region")]
#[non_exhaustive]
pub struct RegionRangeError {
    pub offset: usize,
    pub len: u32,
    pub region_len: usize,
}

/// A registered memory region abstraction that wraps an RDMA memory region.
///
/// Posting a scatter/gather entry with `setup_sge_from` pins a share of the region to the work
/// request until its completion is polled or the queue pair is destroyed, so
/// [`MemoryRegion::deregister`] refuses to run while the hardware may still access it. Entries set
/// up from raw keys carry no such share, keep a clone of the [`Arc`] yourself for those.
#[derive(Debug)]
pub struct MemoryRegion {
    mr: NonNull<ibv_mr>,
    iova: u64,
    released: bool,
    pd: Arc<ProtectionDomain>,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = errno_result(unsafe { (verbs().dereg_mr)(self.mr.as_ptr()) }) {
            warn!(lkey = self.lkey(), error = %err, "failed to deregister memory region");
        }
    }
}

impl MemoryRegion {
    /// Returns the RDMA local key.
    pub fn lkey(&self) -> u32 {
        unsafe { self.mr.as_ref().lkey }
    }

    /// Returns the RDMA remote key.
    pub fn rkey(&self) -> u32 {
        unsafe { self.mr.as_ref().rkey }
    }

    /// Returns the length of the registered region.
    pub fn region_len(&self) -> usize {
        unsafe { self.mr.as_ref().length }
    }

    /// Returns the starting pointer of the registered memory.
    pub fn get_ptr(&self) -> usize {
        unsafe { self.mr.as_ref().addr as _ }
    }

    /// The address remote peers and scatter/gather entries use for the first byte of the region.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    /// A scatter/gather entry covering `len` bytes starting `offset` bytes into the region, or
    /// `None` if that range is not inside the region.
    pub fn sge(&self, offset: usize, len: u32) -> Option<ibv_sge> {
        let end = offset.checked_add(len as usize)?;
        if end > self.region_len() {
            return None;
        }
        Some(ibv_sge {
            addr: self.iova + offset as u64,
            length: len,
            lkey: self.lkey(),
        })
    }

    pub(crate) fn checked_sge(&self, offset: usize, len: u32) -> Result<ibv_sge, RegionRangeError> {
        self.sge(offset, len).ok_or_else(|| RegionRangeError {
            offset,
            len,
            region_len: self.region_len(),
        })
    }

    /// Deregister the region now.
    ///
    /// Fails with [`DeregisterMemoryRegionErrorKind::InUse`] while other shares exist, handing
    /// the region back to the caller.
    pub fn deregister(self: Arc<Self>) -> Result<(), DeregisterMemoryRegionError> {
        let mut region = Arc::try_unwrap(self).map_err(|region| DeregisterMemoryRegionErrorKind::InUse {
            shares: Arc::strong_count(&region) - 1,
            region,
        })?;
        region.released = true;
        debug!(lkey = region.lkey(), "MemoryRegion::deregister");
        errno_result(unsafe { (verbs().dereg_mr)(region.mr.as_ptr()) })?;
        Ok(())
    }
}

impl MemoryRegion {
    /// # Safety
    ///
    /// The caller must ensure that `ptr` is valid for `len` bytes
    /// and that the memory remains accessible and unmodified as needed.
    pub(crate) unsafe fn reg_mr(
        pd: Arc<ProtectionDomain>, ptr: usize, len: usize, iova: u64, access: AccessFlags,
    ) -> Result<Arc<Self>, RegisterMemoryRegionError> {
        let table = verbs();
        let mr = match table.reg_mr_iova2 {
            Some(reg_mr_iova2) => reg_mr_iova2(pd.pd.as_ptr(), ptr as *mut c_void, len, iova, access.bits() as u32),
            None if iova == ptr as u64 => (table.reg_mr)(pd.pd.as_ptr(), ptr as *mut c_void, len, access.bits()),
            None => {
                return Err(RegisterMemoryRegionError {
                    addr: ptr,
                    len,
                    access,
                    source: RegisterMemoryRegionErrorKind::Ibverbs(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
                })
            },
        };

        let mr = NonNull::new(mr).ok_or_else(|| RegisterMemoryRegionError {
            addr: ptr,
            len,
            access,
            source: io::Error::last_os_error().into(),
        })?;
        let region = MemoryRegion {
            mr,
            iova,
            released: false,
            pd,
        };
        debug!(lkey = region.lkey(), rkey = region.rkey(), len, "MemoryRegion::reg_mr");
        Ok(Arc::new(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::device::DeviceList;
    use crate::ibverbs::loopback;

    fn domain() -> Arc<ProtectionDomain> {
        loopback::install().unwrap();
        let devices = DeviceList::new().unwrap();
        let ctx = devices.get(0).unwrap().open().unwrap();
        ctx.alloc_pd().unwrap()
    }

    #[test]
    fn test_sge_bounds() {
        let pd = domain();
        let mut buf = vec![0u8; 128];
        let mr = unsafe { pd.reg_mr(buf.as_mut_ptr() as _, buf.len(), AccessFlags::LocalWrite) }.unwrap();

        assert_eq!(mr.region_len(), 128);
        assert_eq!(mr.get_ptr(), buf.as_ptr() as usize);
        let sge = mr.sge(64, 64).unwrap();
        assert_eq!(sge.addr, buf.as_ptr() as u64 + 64);
        assert_eq!(sge.lkey, mr.lkey());
        assert!(mr.sge(65, 64).is_none());
        assert!(mr.sge(usize::MAX, 1).is_none());
    }

    #[test]
    fn test_sge_uses_iova() {
        let pd = domain();
        let mut buf = vec![0u8; 32];
        let mr = unsafe {
            pd.reg_mr_with_iova(buf.as_mut_ptr() as _, buf.len(), 0x1000, AccessFlags::LocalWrite | AccessFlags::RemoteRead)
        }
        .unwrap();
        assert_eq!(mr.iova(), 0x1000);
        assert_eq!(mr.sge(8, 8).unwrap().addr, 0x1008);
    }

    #[test]
    fn test_remote_write_requires_local_write() {
        let pd = domain();
        let mut buf = vec![0u8; 32];
        let err = unsafe { pd.reg_mr(buf.as_mut_ptr() as _, buf.len(), AccessFlags::RemoteWrite) }.unwrap_err();
        assert!(matches!(err.source, RegisterMemoryRegionErrorKind::InvalidArgument));
        assert_eq!(err.len, 32);
    }

    #[test]
    fn test_deregister_in_use() {
        let pd = domain();
        let mut buf = vec![0u8; 32];
        let mr = unsafe { pd.reg_mr(buf.as_mut_ptr() as _, buf.len(), AccessFlags::LocalWrite) }.unwrap();
        let in_flight = Arc::clone(&mr);

        let DeregisterMemoryRegionErrorKind::InUse { shares, region } = mr.deregister().unwrap_err().0 else {
            panic!("expected InUse");
        };
        assert_eq!(shares, 1);
        assert_eq!(region.lkey(), in_flight.lkey());
        drop(in_flight);
        region.deregister().unwrap();
    }
}
