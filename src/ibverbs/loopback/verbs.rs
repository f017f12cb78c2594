//! The libibverbs entry points of the loopback device.
use std::ffi::{c_char, c_int, c_uint, c_void};
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::slice;
use std::sync::OnceLock;

use rdma_mummy_sys::{
    ibv_ah, ibv_ah_attr, ibv_atomic_cap, ibv_comp_channel, ibv_context, ibv_cq, ibv_cq_ex, ibv_cq_init_attr_ex,
    ibv_create_cq_wc_flags, ibv_data_buf, ibv_device, ibv_device_attr, ibv_gid, ibv_gid_entry, ibv_mr, ibv_mtu,
    ibv_node_type, ibv_pd, ibv_poll_cq_attr, ibv_port_attr, ibv_port_state, ibv_qp, ibv_qp_attr, ibv_qp_cap,
    ibv_qp_ex, ibv_qp_init_attr, ibv_qp_init_attr_ex, ibv_qp_init_attr_mask, ibv_qp_state, ibv_qp_type, ibv_recv_wr,
    ibv_send_flags, ibv_send_wr, ibv_sge, ibv_transport_type, ibv_wc, ibv_wr_opcode, IBV_GID_TYPE_ROCE_V1,
    IBV_GID_TYPE_ROCE_V2, IBV_LINK_LAYER_ETHERNET,
};

use super::fabric::{fabric, Cqe, Datagram, Endpoint, Operation, Payload, RecvRequest, Region, Ring, WorkRequest};
use super::{DEVICE_GUID, DEVICE_NAME, GID_TABLE, PORT_NUM};
use crate::ibverbs::queue_pair::SendOperationFlags;
use crate::ibverbs::symbols::*;
use crate::ibverbs::AccessFlags;

pub(super) const MAX_QP_WR: u32 = 4096;
pub(super) const MAX_SGE: u32 = 16;
pub(super) const MAX_INLINE_DATA: u32 = 256;
pub(super) const MAX_CQE: c_int = 1 << 16;

const INLINE: u32 = ibv_send_flags::IBV_SEND_INLINE.0 as u32;
const WITH_COMPLETION_TIMESTAMP: u64 = ibv_create_cq_wc_flags::IBV_WC_EX_WITH_COMPLETION_TIMESTAMP.0 as u64;

/// Which group of entry points a symbol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Export {
    Classic,
    /// Private or newer entry points the crate has a fallback for.
    Private,
    Extended,
}

macro_rules! exports {
    ($symbol:expr; $($kind:ident $name:literal => $func:ident as $ty:ty,)*) => {
        match $symbol {
            $($name => Some((Export::$kind, $func as $ty as *mut c_void)),)*
            _ => None,
        }
    };
}

pub(super) fn lookup(symbol: &[u8]) -> Option<(Export, *mut c_void)> {
    exports! { symbol;
        Classic b"ibv_get_device_list" => get_device_list as GetDeviceListFn,
        Classic b"ibv_free_device_list" => free_device_list as FreeDeviceListFn,
        Classic b"ibv_get_device_name" => get_device_name as GetDeviceNameFn,
        Classic b"ibv_get_device_guid" => get_device_guid as GetDeviceGuidFn,
        Classic b"ibv_open_device" => open_device as OpenDeviceFn,
        Classic b"ibv_close_device" => close_device as CloseDeviceFn,
        Classic b"ibv_query_device" => query_device as QueryDeviceFn,
        Classic b"ibv_query_port" => query_port as QueryPortFn,
        Classic b"ibv_query_gid" => query_gid as QueryGidFn,
        Classic b"ibv_alloc_pd" => alloc_pd as AllocPdFn,
        Classic b"ibv_dealloc_pd" => dealloc_pd as DeallocPdFn,
        Classic b"ibv_reg_mr" => reg_mr as RegMrFn,
        Classic b"ibv_dereg_mr" => dereg_mr as DeregMrFn,
        Classic b"ibv_create_cq" => create_cq as CreateCqFn,
        Classic b"ibv_destroy_cq" => destroy_cq as DestroyCqFn,
        Classic b"ibv_poll_cq" => poll_cq as PollCqFn,
        Classic b"ibv_create_qp" => create_qp as CreateQpFn,
        Classic b"ibv_destroy_qp" => destroy_qp as DestroyQpFn,
        Classic b"ibv_modify_qp" => modify_qp as ModifyQpFn,
        Classic b"ibv_query_qp" => query_qp as QueryQpFn,
        Classic b"ibv_post_send" => post_send as PostSendFn,
        Classic b"ibv_post_recv" => post_recv as PostRecvFn,
        Classic b"ibv_create_ah" => create_ah as CreateAhFn,
        Classic b"ibv_destroy_ah" => destroy_ah as DestroyAhFn,
        Private b"_ibv_query_gid_table" => query_gid_table as QueryGidTableFn,
        Private b"ibv_reg_mr_iova2" => reg_mr_iova2 as RegMrIova2Fn,
        Extended b"ibv_create_cq_ex" => create_cq_ex as CreateCqExFn,
        Extended b"ibv_create_qp_ex" => create_qp_ex as CreateQpExFn,
        Extended b"ibv_qp_to_qp_ex" => qp_to_qp_ex as QpToQpExFn,
        Extended b"ibv_start_poll" => start_poll as StartPollFn,
        Extended b"ibv_next_poll" => next_poll as NextPollFn,
        Extended b"ibv_end_poll" => end_poll as EndPollFn,
        Extended b"ibv_wc_read_opcode" => wc_read_opcode as WcReadU32Fn,
        Extended b"ibv_wc_read_vendor_err" => wc_read_vendor_err as WcReadU32Fn,
        Extended b"ibv_wc_read_byte_len" => wc_read_byte_len as WcReadU32Fn,
        Extended b"ibv_wc_read_imm_data" => wc_read_imm_data as WcReadU32Fn,
        Extended b"ibv_wc_read_qp_num" => wc_read_qp_num as WcReadU32Fn,
        Extended b"ibv_wc_read_wc_flags" => wc_read_wc_flags as WcReadU32Fn,
        Extended b"ibv_wc_read_completion_ts" => wc_read_completion_ts as WcReadU64Fn,
        Extended b"ibv_wr_start" => wr_start as WrFn,
        Extended b"ibv_wr_complete" => wr_complete as WrCompleteFn,
        Extended b"ibv_wr_abort" => wr_abort as WrFn,
        Extended b"ibv_wr_send" => wr_send as WrFn,
        Extended b"ibv_wr_send_imm" => wr_send_imm as WrSendImmFn,
        Extended b"ibv_wr_rdma_write" => wr_rdma_write as WrRdmaFn,
        Extended b"ibv_wr_rdma_write_imm" => wr_rdma_write_imm as WrRdmaImmFn,
        Extended b"ibv_wr_rdma_read" => wr_rdma_read as WrRdmaFn,
        Extended b"ibv_wr_atomic_cmp_swp" => wr_atomic_cmp_swp as WrAtomicCmpSwpFn,
        Extended b"ibv_wr_atomic_fetch_add" => wr_atomic_fetch_add as WrAtomicFetchAddFn,
        Extended b"ibv_wr_set_sge" => wr_set_sge as WrSetSgeFn,
        Extended b"ibv_wr_set_sge_list" => wr_set_sge_list as WrSetSgeListFn,
        Extended b"ibv_wr_set_inline_data" => wr_set_inline_data as WrSetInlineDataFn,
        Extended b"ibv_wr_set_inline_data_list" => wr_set_inline_data_list as WrSetInlineDataListFn,
        Extended b"ibv_wr_set_ud_addr" => wr_set_ud_addr as WrSetUdAddrFn,
    }
}

fn set_errno(errno: c_int) {
    unsafe { *libc::__errno_location() = errno };
}

/// Fail a verb that returns a pointer.
fn null_with<T>(errno: c_int) -> *mut T {
    set_errno(errno);
    ptr::null_mut()
}

fn zeroed<T>() -> T {
    unsafe { MaybeUninit::zeroed().assume_init() }
}

fn copy_str(dst: &mut [c_char], src: &str) {
    // keep the trailing NUL
    let len = dst.len() - 1;
    for (dst, &byte) in dst[..len].iter_mut().zip(src.as_bytes()) {
        *dst = byte as c_char;
    }
}

/// The one loopback device, alive for the rest of the process.
pub(super) fn device() -> *mut ibv_device {
    static DEVICE: OnceLock<usize> = OnceLock::new();
    *DEVICE.get_or_init(|| {
        let mut device: ibv_device = zeroed();
        device.node_type = ibv_node_type::IBV_NODE_CA;
        device.transport_type = ibv_transport_type::IBV_TRANSPORT_IB;
        copy_str(&mut device.name, DEVICE_NAME);
        copy_str(&mut device.dev_name, "uverbs0");
        copy_str(&mut device.dev_path, "/sys/class/infiniband_verbs/uverbs0");
        copy_str(&mut device.ibdev_path, &format!("/sys/class/infiniband/{DEVICE_NAME}"));
        Box::into_raw(Box::new(device)) as usize
    }) as *mut ibv_device
}

unsafe extern "C" fn get_device_list(num_devices: *mut c_int) -> *mut *mut ibv_device {
    if !num_devices.is_null() {
        *num_devices = 1;
    }
    Box::into_raw(Box::new([device(), ptr::null_mut()])).cast()
}

unsafe extern "C" fn free_device_list(list: *mut *mut ibv_device) {
    if !list.is_null() {
        drop(Box::from_raw(list.cast::<[*mut ibv_device; 2]>()));
    }
}

unsafe extern "C" fn get_device_name(device: *mut ibv_device) -> *const c_char {
    (*device).name.as_ptr()
}

unsafe extern "C" fn get_device_guid(_device: *mut ibv_device) -> u64 {
    DEVICE_GUID.0.to_be()
}

pub(super) unsafe extern "C" fn open_device(device: *mut ibv_device) -> *mut ibv_context {
    if device != self::device() {
        return null_with(libc::ENODEV);
    }
    let mut context: ibv_context = zeroed();
    context.device = device;
    context.cmd_fd = -1;
    context.async_fd = -1;
    context.num_comp_vectors = 1;
    Box::into_raw(Box::new(context))
}

unsafe extern "C" fn close_device(context: *mut ibv_context) -> c_int {
    if fabric().context_busy(context as usize) {
        return libc::EBUSY;
    }
    drop(Box::from_raw(context));
    0
}

unsafe extern "C" fn query_device(_context: *mut ibv_context, attr: *mut ibv_device_attr) -> c_int {
    let mut dev_attr: ibv_device_attr = zeroed();
    copy_str(&mut dev_attr.fw_ver, "1.0.0");
    dev_attr.node_guid = DEVICE_GUID.0.to_be();
    dev_attr.sys_image_guid = DEVICE_GUID.0.to_be();
    dev_attr.max_mr_size = 1 << 40;
    dev_attr.page_size_cap = 4096;
    dev_attr.max_qp = 1 << 16;
    dev_attr.max_qp_wr = MAX_QP_WR as c_int;
    dev_attr.max_sge = MAX_SGE as c_int;
    dev_attr.max_sge_rd = MAX_SGE as c_int;
    dev_attr.max_cq = 1 << 16;
    dev_attr.max_cqe = MAX_CQE;
    dev_attr.max_mr = 1 << 16;
    dev_attr.max_pd = 1 << 16;
    dev_attr.max_qp_rd_atom = 16;
    dev_attr.max_qp_init_rd_atom = 16;
    dev_attr.max_res_rd_atom = 1 << 20;
    dev_attr.atomic_cap = ibv_atomic_cap::IBV_ATOMIC_HCA;
    dev_attr.max_ah = 1 << 16;
    dev_attr.max_pkeys = 1;
    dev_attr.phys_port_cnt = 1;
    attr.write(dev_attr);
    0
}

unsafe extern "C" fn query_port(_context: *mut ibv_context, port_num: u8, attr: *mut ibv_port_attr) -> c_int {
    if port_num != PORT_NUM {
        return libc::EINVAL;
    }
    let mut port_attr: ibv_port_attr = zeroed();
    port_attr.state = ibv_port_state::IBV_PORT_ACTIVE;
    port_attr.max_mtu = ibv_mtu::IBV_MTU_4096;
    port_attr.active_mtu = ibv_mtu::IBV_MTU_1024;
    port_attr.gid_tbl_len = GID_TABLE.len() as c_int;
    port_attr.max_msg_sz = 1 << 30;
    port_attr.pkey_tbl_len = 1;
    port_attr.max_vl_num = 1;
    // LinkUp
    port_attr.phys_state = 5;
    port_attr.link_layer = IBV_LINK_LAYER_ETHERNET;
    attr.write(port_attr);
    0
}

unsafe extern "C" fn query_gid(_context: *mut ibv_context, port_num: u8, index: c_int, gid: *mut ibv_gid) -> c_int {
    let Some(raw) = usize::try_from(index).ok().and_then(|index| GID_TABLE.get(index)) else {
        set_errno(libc::EINVAL);
        return -1;
    };
    if port_num != PORT_NUM {
        set_errno(libc::EINVAL);
        return -1;
    }
    (*gid).raw = *raw;
    0
}

unsafe extern "C" fn query_gid_table(
    _context: *mut ibv_context, entries: *mut ibv_gid_entry, max_entries: usize, _flags: u32, entry_size: usize,
) -> isize {
    if entry_size != mem::size_of::<ibv_gid_entry>() || max_entries < GID_TABLE.len() {
        return -(libc::EINVAL as isize);
    }
    let ndev_ifindex = libc::if_nametoindex(c"lo".as_ptr());
    for (index, raw) in GID_TABLE.iter().enumerate() {
        let mut entry: ibv_gid_entry = zeroed();
        entry.gid.raw = *raw;
        entry.gid_index = index as u32;
        entry.port_num = PORT_NUM.into();
        entry.gid_type = if index == 0 {
            IBV_GID_TYPE_ROCE_V1
        } else {
            IBV_GID_TYPE_ROCE_V2
        };
        entry.ndev_ifindex = ndev_ifindex;
        entries.add(index).write(entry);
    }
    GID_TABLE.len() as isize
}

pub(super) unsafe extern "C" fn alloc_pd(context: *mut ibv_context) -> *mut ibv_pd {
    let mut fabric = fabric();
    let mut pd: ibv_pd = zeroed();
    pd.context = context;
    pd.handle = fabric.next_serial();
    let pd = Box::into_raw(Box::new(pd));
    fabric.domains.insert(pd as usize, context as usize);
    pd
}

unsafe extern "C" fn dealloc_pd(pd: *mut ibv_pd) -> c_int {
    let mut fabric = fabric();
    if fabric.domain_busy(pd as usize) {
        return libc::EBUSY;
    }
    fabric.domains.remove(&(pd as usize));
    drop(Box::from_raw(pd));
    0
}

unsafe extern "C" fn reg_mr(pd: *mut ibv_pd, addr: *mut c_void, length: usize, access: c_int) -> *mut ibv_mr {
    reg_mr_iova2(pd, addr, length, addr as u64, access as c_uint)
}

unsafe extern "C" fn reg_mr_iova2(
    pd: *mut ibv_pd, addr: *mut c_void, length: usize, iova: u64, access: c_uint,
) -> *mut ibv_mr {
    let access = AccessFlags::from(access as i32);
    let remote_modify = access.intersects(AccessFlags::RemoteWrite | AccessFlags::RemoteAtomic);
    if remote_modify && !access.contains(AccessFlags::LocalWrite) {
        return null_with(libc::EINVAL);
    }
    if addr.is_null() && length > 0 {
        return null_with(libc::EFAULT);
    }

    let mut fabric = fabric();
    let key = fabric.next_serial();
    fabric.regions.insert(
        key,
        Region {
            pd: pd as usize,
            addr: addr as usize,
            len: length,
            iova,
            access,
        },
    );
    let mut mr: ibv_mr = zeroed();
    mr.context = (*pd).context;
    mr.pd = pd;
    mr.addr = addr;
    mr.length = length;
    mr.handle = key;
    mr.lkey = key;
    mr.rkey = key;
    Box::into_raw(Box::new(mr))
}

unsafe extern "C" fn dereg_mr(mr: *mut ibv_mr) -> c_int {
    fabric().regions.remove(&(*mr).lkey);
    drop(Box::from_raw(mr));
    0
}

unsafe fn new_cq(context: *mut ibv_context, cqe: c_int, timestamps: bool) -> *mut ibv_cq_ex {
    if !(1..=MAX_CQE).contains(&cqe) {
        return null_with(libc::EINVAL);
    }
    let mut fabric = fabric();
    let mut cq: ibv_cq_ex = zeroed();
    cq.context = context;
    cq.cqe = cqe;
    cq.handle = fabric.next_serial();
    let cq = Box::into_raw(Box::new(cq));
    fabric.rings.insert(cq as usize, Ring::new(context as usize, timestamps));
    cq
}

// every CQ is allocated as an `ibv_cq_ex`, whose head has the layout of an `ibv_cq`
unsafe extern "C" fn create_cq(
    context: *mut ibv_context, cqe: c_int, _cq_context: *mut c_void, _channel: *mut ibv_comp_channel,
    _comp_vector: c_int,
) -> *mut ibv_cq {
    new_cq(context, cqe, false).cast()
}

unsafe extern "C" fn create_cq_ex(context: *mut ibv_context, attr: *mut ibv_cq_init_attr_ex) -> *mut ibv_cq_ex {
    let attr = &*attr;
    new_cq(
        context,
        attr.cqe as c_int,
        attr.wc_flags & WITH_COMPLETION_TIMESTAMP != 0,
    )
}

unsafe extern "C" fn destroy_cq(cq: *mut ibv_cq) -> c_int {
    let mut fabric = fabric();
    if fabric.ring_busy(cq as usize) {
        return libc::EBUSY;
    }
    fabric.rings.remove(&(cq as usize));
    drop(Box::from_raw(cq.cast::<ibv_cq_ex>()));
    0
}

unsafe fn write_wc(wc: *mut ibv_wc, cqe: &Cqe) {
    let mut out: ibv_wc = zeroed();
    out.wr_id = cqe.wr_id;
    out.status = cqe.status;
    out.opcode = cqe.opcode;
    out.vendor_err = cqe.vendor_err();
    out.byte_len = cqe.byte_len;
    out.qp_num = cqe.qp_num;
    out.src_qp = cqe.src_qp;
    out.wc_flags = cqe.flags;
    wc.write(out);
    // the immediate data union follows `byte_len`
    let imm = ptr::addr_of_mut!((*wc).byte_len).add(1);
    imm.write(cqe.imm_data);
}

unsafe extern "C" fn poll_cq(cq: *mut ibv_cq, num_entries: c_int, wc: *mut ibv_wc) -> c_int {
    let mut fabric = fabric();
    let mut polled = 0;
    while polled < num_entries {
        let Some(cqe) = fabric.take(cq as usize) else {
            break;
        };
        write_wc(wc.add(polled as usize), &cqe);
        polled += 1;
    }
    polled
}

unsafe fn advance(cq: *mut ibv_cq_ex) -> c_int {
    let mut fabric = fabric();
    let cqe = fabric.take(cq as usize);
    let Some(ring) = fabric.rings.get_mut(&(cq as usize)) else {
        return libc::EINVAL;
    };
    ring.current = cqe;
    match cqe {
        Some(cqe) => {
            (*cq).wr_id = cqe.wr_id;
            (*cq).status = cqe.status;
            0
        },
        None => libc::ENOENT,
    }
}

unsafe extern "C" fn start_poll(cq: *mut ibv_cq_ex, _attr: *mut ibv_poll_cq_attr) -> c_int {
    advance(cq)
}

unsafe extern "C" fn next_poll(cq: *mut ibv_cq_ex) -> c_int {
    advance(cq)
}

unsafe extern "C" fn end_poll(cq: *mut ibv_cq_ex) {
    if let Some(ring) = fabric().rings.get_mut(&(cq as usize)) {
        ring.current = None;
    }
}

fn read_current<T: Default>(cq: *mut ibv_cq_ex, read: impl FnOnce(&Cqe) -> T) -> T {
    fabric()
        .rings
        .get(&(cq as usize))
        .and_then(|ring| ring.current.as_ref())
        .map_or_else(T::default, read)
}

unsafe extern "C" fn wc_read_opcode(cq: *mut ibv_cq_ex) -> u32 {
    read_current(cq, |cqe| cqe.opcode)
}

unsafe extern "C" fn wc_read_vendor_err(cq: *mut ibv_cq_ex) -> u32 {
    read_current(cq, Cqe::vendor_err)
}

unsafe extern "C" fn wc_read_byte_len(cq: *mut ibv_cq_ex) -> u32 {
    read_current(cq, |cqe| cqe.byte_len)
}

unsafe extern "C" fn wc_read_imm_data(cq: *mut ibv_cq_ex) -> u32 {
    read_current(cq, |cqe| cqe.imm_data)
}

unsafe extern "C" fn wc_read_qp_num(cq: *mut ibv_cq_ex) -> u32 {
    read_current(cq, |cqe| cqe.qp_num)
}

unsafe extern "C" fn wc_read_wc_flags(cq: *mut ibv_cq_ex) -> u32 {
    read_current(cq, |cqe| cqe.flags)
}

unsafe extern "C" fn wc_read_completion_ts(cq: *mut ibv_cq_ex) -> u64 {
    read_current(cq, |cqe| cqe.timestamp)
}

/// Everything `ibv_create_qp` and `ibv_create_qp_ex` have in common.
#[allow(clippy::too_many_arguments)]
unsafe fn new_qp(
    context: *mut ibv_context, pd: *mut ibv_pd, send_cq: *mut ibv_cq, recv_cq: *mut ibv_cq, cap: ibv_qp_cap,
    qp_type: u32, sq_sig_all: bool, send_ops: Option<SendOperationFlags>,
) -> *mut ibv_qp {
    match qp_type {
        ibv_qp_type::IBV_QPT_RC | ibv_qp_type::IBV_QPT_UC | ibv_qp_type::IBV_QPT_UD => {},
        ibv_qp_type::IBV_QPT_RAW_PACKET => return null_with(libc::EPERM),
        _ => return null_with(libc::EOPNOTSUPP),
    }
    if pd.is_null() || send_cq.is_null() || recv_cq.is_null() {
        return null_with(libc::EINVAL);
    }
    if cap.max_send_wr > MAX_QP_WR
        || cap.max_recv_wr > MAX_QP_WR
        || cap.max_send_sge > MAX_SGE
        || cap.max_recv_sge > MAX_SGE
        || cap.max_inline_data > MAX_INLINE_DATA
    {
        return null_with(libc::EINVAL);
    }

    let mut fabric = fabric();
    if !fabric.rings.contains_key(&(send_cq as usize)) || !fabric.rings.contains_key(&(recv_cq as usize)) {
        return null_with(libc::EINVAL);
    }
    let qp_num = fabric.next_serial();
    // an `ibv_qp_ex` starts with its `ibv_qp`, classic queue pairs get the same allocation
    let mut qp_ex: ibv_qp_ex = zeroed();
    let qp = &mut qp_ex.qp_base;
    qp.context = context;
    qp.pd = pd;
    qp.send_cq = send_cq;
    qp.recv_cq = recv_cq;
    qp.handle = qp_num;
    qp.qp_num = qp_num;
    qp.state = ibv_qp_state::IBV_QPS_RESET;
    qp.qp_type = qp_type;
    let qp = Box::into_raw(Box::new(qp_ex)).cast::<ibv_qp>();

    fabric.endpoints.insert(
        qp_num,
        Endpoint::new(
            qp,
            pd as usize,
            qp_type,
            send_cq as usize,
            recv_cq as usize,
            cap,
            sq_sig_all,
            send_ops,
        ),
    );
    qp
}

unsafe extern "C" fn create_qp(pd: *mut ibv_pd, init_attr: *mut ibv_qp_init_attr) -> *mut ibv_qp {
    let init_attr = &*init_attr;
    if pd.is_null() {
        return null_with(libc::EINVAL);
    }
    new_qp(
        (*pd).context,
        pd,
        init_attr.send_cq,
        init_attr.recv_cq,
        init_attr.cap,
        init_attr.qp_type,
        init_attr.sq_sig_all != 0,
        None,
    )
}

unsafe extern "C" fn create_qp_ex(context: *mut ibv_context, attr: *mut ibv_qp_init_attr_ex) -> *mut ibv_qp {
    let attr = &*attr;
    if attr.comp_mask & ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_PD.0 as u32 == 0 {
        return null_with(libc::EINVAL);
    }
    let send_ops = (attr.comp_mask & ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_SEND_OPS_FLAGS.0 as u32 != 0)
        .then_some(SendOperationFlags { bits: attr.send_ops_flags });
    new_qp(
        context,
        attr.pd,
        attr.send_cq,
        attr.recv_cq,
        attr.cap,
        attr.qp_type,
        attr.sq_sig_all != 0,
        send_ops,
    )
}

unsafe extern "C" fn qp_to_qp_ex(qp: *mut ibv_qp) -> *mut ibv_qp_ex {
    let extended = fabric()
        .endpoints
        .get(&(*qp).qp_num)
        .is_some_and(|endpoint| endpoint.send_ops.is_some());
    if extended {
        qp.cast()
    } else {
        null_with(libc::EOPNOTSUPP)
    }
}

unsafe extern "C" fn destroy_qp(qp: *mut ibv_qp) -> c_int {
    if fabric().endpoints.remove(&(*qp).qp_num).is_none() {
        return libc::EINVAL;
    }
    drop(Box::from_raw(qp.cast::<ibv_qp_ex>()));
    0
}

unsafe extern "C" fn modify_qp(qp: *mut ibv_qp, attr: *mut ibv_qp_attr, attr_mask: c_int) -> c_int {
    fabric().modify((*qp).qp_num, &*attr, attr_mask)
}

unsafe extern "C" fn query_qp(
    qp: *mut ibv_qp, attr: *mut ibv_qp_attr, _attr_mask: c_int, init_attr: *mut ibv_qp_init_attr,
) -> c_int {
    let fabric = fabric();
    let Some(endpoint) = fabric.query((*qp).qp_num) else {
        return libc::EINVAL;
    };
    let mut current = ibv_qp_attr { ..endpoint.attr };
    current.cur_qp_state = current.qp_state;
    current.cap = endpoint.cap;
    attr.write(current);

    init_attr.write(ibv_qp_init_attr {
        qp_context: ptr::null_mut(),
        send_cq: endpoint.send_cq as *mut ibv_cq,
        recv_cq: endpoint.recv_cq as *mut ibv_cq,
        srq: ptr::null_mut(),
        cap: endpoint.cap,
        qp_type: endpoint.qp_type,
        sq_sig_all: endpoint.sq_sig_all.into(),
    });
    0
}

unsafe fn sge_slice<'a>(sg_list: *const ibv_sge, num_sge: usize) -> &'a [ibv_sge] {
    if sg_list.is_null() || num_sge == 0 {
        &[]
    } else {
        slice::from_raw_parts(sg_list, num_sge)
    }
}

/// Inline data is read from the buffers at post time, keys are ignored.
unsafe fn copy_inline(bufs: impl Iterator<Item = (u64, usize)>) -> Payload {
    let mut data = Vec::new();
    for (addr, len) in bufs.filter(|&(_, len)| len > 0) {
        data.extend_from_slice(slice::from_raw_parts(addr as *const u8, len));
    }
    Payload::Inline(data)
}

unsafe fn classic_request(wr: &ibv_send_wr, qp_type: u32) -> WorkRequest {
    let sges = sge_slice(wr.sg_list, wr.num_sge.max(0) as usize);
    let payload = if wr.send_flags & INLINE != 0 {
        copy_inline(sges.iter().map(|sge| (sge.addr, sge.length as usize)))
    } else {
        Payload::Gather(sges.to_vec())
    };
    let imm = wr.imm_data_invalidated_rkey_union.imm_data;
    let (rdma, atomic) = (wr.wr.rdma, wr.wr.atomic);

    let op = match wr.opcode {
        ibv_wr_opcode::IBV_WR_SEND => Operation::Send { imm: None },
        ibv_wr_opcode::IBV_WR_SEND_WITH_IMM => Operation::Send { imm: Some(imm) },
        ibv_wr_opcode::IBV_WR_RDMA_WRITE => Operation::Write {
            rkey: rdma.rkey,
            remote_addr: rdma.remote_addr,
            imm: None,
        },
        ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM => Operation::Write {
            rkey: rdma.rkey,
            remote_addr: rdma.remote_addr,
            imm: Some(imm),
        },
        ibv_wr_opcode::IBV_WR_RDMA_READ => Operation::Read {
            rkey: rdma.rkey,
            remote_addr: rdma.remote_addr,
        },
        ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP => Operation::CompareSwap {
            rkey: atomic.rkey,
            remote_addr: atomic.remote_addr,
            compare: atomic.compare_add,
            swap: atomic.swap,
        },
        ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD => Operation::FetchAdd {
            rkey: atomic.rkey,
            remote_addr: atomic.remote_addr,
            add: atomic.compare_add,
        },
        _ => Operation::Unsupported,
    };
    let ud = (qp_type == ibv_qp_type::IBV_QPT_UD).then(|| Datagram {
        remote_qpn: wr.wr.ud.remote_qpn,
        remote_qkey: wr.wr.ud.remote_qkey,
    });

    WorkRequest {
        wr_id: wr.wr_id,
        flags: wr.send_flags,
        op,
        payload,
        ud,
    }
}

unsafe extern "C" fn post_send(qp: *mut ibv_qp, wr: *mut ibv_send_wr, bad_wr: *mut *mut ibv_send_wr) -> c_int {
    let (qp_num, qp_type) = ((*qp).qp_num, (*qp).qp_type);
    let mut fabric = fabric();
    fabric.count_submission(qp_num);

    let mut cur = wr;
    while !cur.is_null() {
        if let Err(errno) = fabric.submit(qp_num, classic_request(&*cur, qp_type)) {
            *bad_wr = cur;
            return errno;
        }
        cur = (*cur).next;
    }
    0
}

unsafe extern "C" fn post_recv(qp: *mut ibv_qp, wr: *mut ibv_recv_wr, bad_wr: *mut *mut ibv_recv_wr) -> c_int {
    let qp_num = (*qp).qp_num;
    let mut fabric = fabric();

    let mut cur = wr;
    while !cur.is_null() {
        let recv = RecvRequest {
            wr_id: (*cur).wr_id,
            sges: sge_slice((*cur).sg_list, (*cur).num_sge.max(0) as usize).to_vec(),
        };
        if let Err(errno) = fabric.receive(qp_num, recv) {
            *bad_wr = cur;
            return errno;
        }
        cur = (*cur).next;
    }
    0
}

unsafe extern "C" fn create_ah(pd: *mut ibv_pd, attr: *mut ibv_ah_attr) -> *mut ibv_ah {
    let attr = &*attr;
    // RoCE ports only route with a GRH
    if attr.port_num != PORT_NUM || attr.is_global == 0 || usize::from(attr.grh.sgid_index) >= GID_TABLE.len() {
        return null_with(libc::EINVAL);
    }
    let mut fabric = fabric();
    let mut ah: ibv_ah = zeroed();
    ah.context = (*pd).context;
    ah.pd = pd;
    ah.handle = fabric.next_serial();
    let ah = Box::into_raw(Box::new(ah));
    fabric.handles.insert(ah as usize, pd as usize);
    ah
}

unsafe extern "C" fn destroy_ah(ah: *mut ibv_ah) -> c_int {
    fabric().handles.remove(&(ah as usize));
    drop(Box::from_raw(ah));
    0
}

unsafe fn qp_num(qp: *mut ibv_qp_ex) -> u32 {
    (*qp).qp_base.qp_num
}

/// Start a new staged request from the `wr_id` and `wr_flags` the application set.
unsafe fn stage(qp: *mut ibv_qp_ex, op: Operation) {
    let wr = WorkRequest {
        wr_id: (*qp).wr_id,
        flags: (*qp).wr_flags,
        op,
        payload: Payload::Gather(Vec::new()),
        ud: None,
    };
    if let Some(endpoint) = fabric().endpoints.get_mut(&qp_num(qp)) {
        endpoint.batch.push(wr);
    }
}

/// Amend the last staged request, ignored if there is none like on hardware.
unsafe fn amend(qp: *mut ibv_qp_ex, update: impl FnOnce(&mut WorkRequest)) {
    if let Some(wr) = fabric()
        .endpoints
        .get_mut(&qp_num(qp))
        .and_then(|endpoint| endpoint.batch.last_mut())
    {
        update(wr);
    }
}

unsafe extern "C" fn wr_start(qp: *mut ibv_qp_ex) {
    if let Some(endpoint) = fabric().endpoints.get_mut(&qp_num(qp)) {
        endpoint.batch.clear();
    }
}

unsafe extern "C" fn wr_complete(qp: *mut ibv_qp_ex) -> c_int {
    fabric().commit(qp_num(qp))
}

unsafe extern "C" fn wr_abort(qp: *mut ibv_qp_ex) {
    wr_start(qp);
}

unsafe extern "C" fn wr_send(qp: *mut ibv_qp_ex) {
    stage(qp, Operation::Send { imm: None });
}

unsafe extern "C" fn wr_send_imm(qp: *mut ibv_qp_ex, imm_data: u32) {
    stage(qp, Operation::Send { imm: Some(imm_data) });
}

unsafe extern "C" fn wr_rdma_write(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64) {
    stage(
        qp,
        Operation::Write {
            rkey,
            remote_addr,
            imm: None,
        },
    );
}

unsafe extern "C" fn wr_rdma_write_imm(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64, imm_data: u32) {
    stage(
        qp,
        Operation::Write {
            rkey,
            remote_addr,
            imm: Some(imm_data),
        },
    );
}

unsafe extern "C" fn wr_rdma_read(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64) {
    stage(qp, Operation::Read { rkey, remote_addr });
}

unsafe extern "C" fn wr_atomic_cmp_swp(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64, compare: u64, swap: u64) {
    stage(
        qp,
        Operation::CompareSwap {
            rkey,
            remote_addr,
            compare,
            swap,
        },
    );
}

unsafe extern "C" fn wr_atomic_fetch_add(qp: *mut ibv_qp_ex, rkey: u32, remote_addr: u64, add: u64) {
    stage(qp, Operation::FetchAdd { rkey, remote_addr, add });
}

unsafe extern "C" fn wr_set_sge(qp: *mut ibv_qp_ex, lkey: u32, addr: u64, length: u32) {
    amend(qp, |wr| wr.payload = Payload::Gather(vec![ibv_sge { addr, length, lkey }]));
}

unsafe extern "C" fn wr_set_sge_list(qp: *mut ibv_qp_ex, num_sge: usize, sg_list: *const ibv_sge) {
    let sges = sge_slice(sg_list, num_sge).to_vec();
    amend(qp, |wr| wr.payload = Payload::Gather(sges));
}

unsafe extern "C" fn wr_set_inline_data(qp: *mut ibv_qp_ex, addr: *mut c_void, length: usize) {
    let payload = copy_inline([(addr as u64, length)].into_iter());
    amend(qp, |wr| wr.payload = payload);
}

unsafe extern "C" fn wr_set_inline_data_list(qp: *mut ibv_qp_ex, num_buf: usize, buf_list: *const ibv_data_buf) {
    let bufs = if buf_list.is_null() || num_buf == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(buf_list, num_buf)
    };
    let payload = copy_inline(bufs.iter().map(|buf| (buf.addr as u64, buf.length)));
    amend(qp, |wr| wr.payload = payload);
}

unsafe extern "C" fn wr_set_ud_addr(qp: *mut ibv_qp_ex, _ah: *mut ibv_ah, remote_qpn: u32, remote_qkey: u32) {
    amend(qp, |wr| {
        wr.ud = Some(Datagram {
            remote_qpn,
            remote_qkey,
        })
    });
}
