//! A protection domain is used to associate [`QueuePair`]s with [`MemoryRegion`]s, as a means for
//! enabling and controlling network adapter access to Host System memory.
//!
//! [`QueuePair`]: crate::ibverbs::queue_pair::QueuePair
//!
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_mummy_sys::ibv_pd;
use tracing::{debug, warn};

use super::address::{AddressHandle, AddressHandleAttribute, CreateAddressHandleError};
use super::device_context::DeviceContext;
use super::errno_result;
use super::memory_region::{MemoryRegion, RegisterMemoryRegionError};
use super::queue_pair::QueuePairBuilder;
use super::symbols::verbs;
use super::AccessFlags;

/// Error returned by [`ProtectionDomain::dealloc`].
#[derive(Debug, thiserror::Error)]
#[error("failed to dealloc protection domain")]
#[non_exhaustive]
pub struct DeallocProtectionDomainError(#[from] pub DeallocProtectionDomainErrorKind);

/// The enum type for [`DeallocProtectionDomainError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DeallocProtectionDomainErrorKind {
    #[error("protection domain is still shared by {shares} other handles")]
    InUse {
        shares: usize,
        domain: Arc<ProtectionDomain>,
    },
    #[error(transparent)]
    Ibverbs(#[from] io::Error),
}

/// A protection domain that could be used to creating RDMA QP and RDMA MR on it to associate them
/// together.
///
/// Memory regions, queue pairs and address handles keep an [`Arc`] share of their domain, which in
/// turn keeps the [`DeviceContext`] alive.
#[derive(Debug)]
pub struct ProtectionDomain {
    pub(crate) pd: NonNull<ibv_pd>,
    released: bool,
    context: Arc<DeviceContext>,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = errno_result(unsafe { (verbs().dealloc_pd)(self.pd.as_ptr()) }) {
            warn!(error = %err, "failed to dealloc protection domain");
        }
    }
}

impl ProtectionDomain {
    pub(crate) fn new(context: Arc<DeviceContext>, pd: NonNull<ibv_pd>) -> Self {
        debug!("ProtectionDomain::new");
        ProtectionDomain {
            pd,
            released: false,
            context,
        }
    }

    /// The device context this domain was allocated on.
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// Dealloc the domain now.
    ///
    /// Fails with [`DeallocProtectionDomainErrorKind::InUse`] while memory regions, queue pairs,
    /// address handles or clones still hold it, handing the domain back.
    pub fn dealloc(self: Arc<Self>) -> Result<(), DeallocProtectionDomainError> {
        let mut domain = Arc::try_unwrap(self).map_err(|domain| DeallocProtectionDomainErrorKind::InUse {
            shares: Arc::strong_count(&domain) - 1,
            domain,
        })?;
        domain.released = true;
        debug!("ProtectionDomain::dealloc");
        errno_result(unsafe { (verbs().dealloc_pd)(domain.pd.as_ptr()) })?;
        Ok(())
    }

    /// Register a memory region that was allocated outside this module.
    ///
    /// The region is addressed by its virtual address, i.e. the IOVA equals `ptr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` is valid for `len` bytes
    /// and that the memory remains accessible and unmodified as needed.
    pub unsafe fn reg_mr(
        self: &Arc<Self>, ptr: usize, len: usize, access: AccessFlags,
    ) -> Result<Arc<MemoryRegion>, RegisterMemoryRegionError> {
        MemoryRegion::reg_mr(Arc::clone(self), ptr, len, ptr as u64, access)
    }

    /// Register a memory region whose remote address space starts at `iova` instead of `ptr`.
    ///
    /// # Safety
    ///
    /// See [`ProtectionDomain::reg_mr`]. Device memory (e.g. accelerator memory exported by a
    /// peer-memory driver) may be passed as long as the driver accepts it.
    pub unsafe fn reg_mr_with_iova(
        self: &Arc<Self>, ptr: usize, len: usize, iova: u64, access: AccessFlags,
    ) -> Result<Arc<MemoryRegion>, RegisterMemoryRegionError> {
        MemoryRegion::reg_mr(Arc::clone(self), ptr, len, iova, access)
    }

    /// Create a [`QueuePairBuilder`] for building QPs on this protection domain
    /// later.
    pub fn create_qp_builder(self: &Arc<Self>) -> QueuePairBuilder {
        QueuePairBuilder::new(self)
    }

    /// Create an address handle for sending to the port `attr` describes.
    pub fn create_ah(
        self: &Arc<Self>, attr: &AddressHandleAttribute,
    ) -> Result<Arc<AddressHandle>, CreateAddressHandleError> {
        AddressHandle::create(self, attr)
    }
}
