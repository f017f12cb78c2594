pub mod address;
pub mod completion;
pub mod device;
pub mod device_context;
mod in_flight;
#[cfg(feature = "loopback")]
pub mod loopback;
pub mod memory_region;
pub mod protection_domain;
pub mod qp_state;
pub mod queue_pair;
pub mod symbols;

use std::ffi::c_int;
use std::io;

use bitmask_enum::bitmask;
use rdma_mummy_sys::ibv_access_flags;

#[bitmask(i32)]
#[bitmask_config(vec_debug)]
pub enum AccessFlags {
    LocalWrite = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as _,
    RemoteWrite = ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0 as _,
    RemoteRead = ibv_access_flags::IBV_ACCESS_REMOTE_READ.0 as _,
    RemoteAtomic = ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0 as _,
    MemoryWindowBind = ibv_access_flags::IBV_ACCESS_MW_BIND.0 as _,
    ZeroBased = ibv_access_flags::IBV_ACCESS_ZERO_BASED.0 as _,
    OnDemand = ibv_access_flags::IBV_ACCESS_ON_DEMAND.0 as _,
    HugeTlb = ibv_access_flags::IBV_ACCESS_HUGETLB.0 as _,
    FlushGlobal = ibv_access_flags::IBV_ACCESS_FLUSH_GLOBAL.0 as _,
    FlushPersistent = ibv_access_flags::IBV_ACCESS_FLUSH_PERSISTENT.0 as _,
    RelaxedOrdering = ibv_access_flags::IBV_ACCESS_RELAXED_ORDERING.0 as _,
}

/// Turn the return value of a verb that reports failure through its return code into a result.
///
/// Most verbs return the errno value directly, a few return `-1` and leave it in `errno`.
pub(crate) fn errno_result(ret: c_int) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        ret if ret > 0 => Err(io::Error::from_raw_os_error(ret)),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_result_prefers_the_returned_code() {
        assert!(errno_result(0).is_ok());
        assert_eq!(errno_result(libc::EBUSY).unwrap_err().raw_os_error(), Some(libc::EBUSY));
    }

    #[test]
    fn access_flags_debug_lists_names() {
        let flags = AccessFlags::LocalWrite | AccessFlags::RemoteRead;
        let text = format!("{flags:?}");
        assert!(text.contains("LocalWrite"));
        assert!(text.contains("RemoteRead"));
    }
}
