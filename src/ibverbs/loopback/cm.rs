//! The librdmacm entry points of the loopback device.
//!
//! Identifiers live in one process-wide registry. Every event is queued on the destination
//! channel and announced with one byte on the channel's pipe, whose read end is the channel fd.
//! `rdma_get_cm_event` consumes one byte per event, so blocking, `O_NONBLOCK` and `poll(2)`
//! behave like they do with the kernel's event channel.
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_int, c_void};
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;
use std::slice;
use std::sync::{LazyLock, Mutex, MutexGuard, OnceLock, PoisonError};

use os_socketaddr::OsSocketAddr;
use rdma_mummy_sys::{
    ibv_context, ibv_gid, ibv_mtu, ibv_qp_attr, ibv_qp_state, rdma_cm_event, rdma_cm_event_type, rdma_cm_id,
    rdma_conn_param, rdma_event_channel, rdma_port_space,
};

use super::{verbs, GID_TABLE, PORT_NUM};
use crate::ibverbs::qp_state::QueuePairAttributeMask as Mask;
use crate::ibverbs::AccessFlags;
use crate::rdmacm::symbols::*;

/// `RDMA_UDP_QKEY` from `rdma_cma.h`.
const UDP_QKEY: u32 = 0x0123_4567;
/// `IB_CM_REJ_CONSUMER_DEFINED`, reported for [`reject`].
const REJECT_CONSUMER: c_int = 28;
/// `IB_CM_REJ_INVALID_SERVICE_ID`, reported when nobody listens on the port.
const REJECT_NO_LISTENER: c_int = 8;
const EPHEMERAL_PORTS: u16 = 49152;

pub(super) fn lookup(symbol: &[u8]) -> Option<*mut c_void> {
    let ptr = match symbol {
        b"rdma_create_event_channel" => create_event_channel as CreateEventChannelFn as *mut c_void,
        b"rdma_destroy_event_channel" => destroy_event_channel as DestroyEventChannelFn as *mut c_void,
        b"rdma_create_id" => create_id as CreateIdFn as *mut c_void,
        b"rdma_destroy_id" => destroy_id as DestroyIdFn as *mut c_void,
        b"rdma_bind_addr" => bind_addr as BindAddrFn as *mut c_void,
        b"rdma_resolve_addr" => resolve_addr as ResolveAddrFn as *mut c_void,
        b"rdma_resolve_route" => resolve_route as ResolveRouteFn as *mut c_void,
        b"rdma_listen" => listen as ListenFn as *mut c_void,
        b"rdma_connect" => connect as ConnectFn as *mut c_void,
        b"rdma_accept" => accept as ConnectFn as *mut c_void,
        b"rdma_reject" => reject as RejectFn as *mut c_void,
        b"rdma_establish" => establish as IdFn as *mut c_void,
        b"rdma_disconnect" => disconnect as IdFn as *mut c_void,
        b"rdma_get_cm_event" => get_cm_event as GetCmEventFn as *mut c_void,
        b"rdma_ack_cm_event" => ack_cm_event as AckCmEventFn as *mut c_void,
        b"rdma_init_qp_attr" => init_qp_attr as InitQpAttrFn as *mut c_void,
        _ => return None,
    };
    Some(ptr)
}

/// What an id has gone through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Idle,
    AddressResolved,
    RouteResolved,
    /// Active side waiting for the answer to `rdma_connect`.
    Connecting,
    /// Passive side holding a connect request.
    Requested,
    /// Active side holding a connect response.
    Responded,
    /// Passive side waiting for `rdma_establish` on the other end.
    Accepted,
    Connected,
}

/// The parts of `rdma_conn_param` carried by an event.
#[derive(Debug, Clone, Default)]
struct Handshake {
    private_data: Vec<u8>,
    responder_resources: u8,
    initiator_depth: u8,
    retry_count: u8,
    rnr_retry_count: u8,
    qp_num: u32,
}

impl Handshake {
    unsafe fn from_raw(param: &rdma_conn_param) -> Handshake {
        let private_data = if param.private_data.is_null() {
            Vec::new()
        } else {
            slice::from_raw_parts(param.private_data.cast::<u8>(), usize::from(param.private_data_len)).to_vec()
        };
        Handshake {
            private_data,
            responder_resources: param.responder_resources,
            initiator_depth: param.initiator_depth,
            retry_count: param.retry_count,
            rnr_retry_count: param.rnr_retry_count,
            qp_num: param.qp_num,
        }
    }
}

struct Pending {
    id: usize,
    listen_id: usize,
    event: rdma_cm_event_type::Type,
    status: c_int,
    handshake: Option<Handshake>,
    /// Dropped without delivery, its byte is still in the pipe.
    stale: bool,
}

struct Node {
    channel: usize,
    ps: rdma_port_space::Type,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    stage: Stage,
    listening: bool,
    peer: Option<usize>,
    local_qpn: u32,
    remote_qpn: u32,
    responder_resources: u8,
    initiator_depth: u8,
}

impl Node {
    fn new(channel: usize, ps: rdma_port_space::Type) -> Node {
        Node {
            channel,
            ps,
            local: None,
            remote: None,
            stage: Stage::Idle,
            listening: false,
            peer: None,
            local_qpn: 0,
            remote_qpn: 0,
            responder_resources: 1,
            initiator_depth: 1,
        }
    }
}

#[repr(C)]
struct Channel {
    raw: rdma_event_channel,
    notify_fd: c_int,
}

/// A delivered event; `raw` comes first so the event pointer handed out is the box pointer.
#[repr(C)]
struct Delivery {
    raw: rdma_cm_event,
    private_data: Vec<u8>,
}

#[derive(Default)]
struct Registry {
    ids: HashMap<usize, Node>,
    queues: HashMap<usize, VecDeque<Pending>>,
    next_port: u16,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(Default::default);

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The context ids are bound to, opened once and shared by every id like librdmacm does.
fn context() -> *mut ibv_context {
    static CONTEXT: OnceLock<usize> = OnceLock::new();
    *CONTEXT.get_or_init(|| unsafe { verbs::open_device(verbs::device()) } as usize) as *mut ibv_context
}

fn is_local(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let v6 = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    GID_TABLE.iter().any(|gid| Ipv6Addr::from(*gid) == v6)
}

unsafe fn read_addr(addr: *const libc::sockaddr) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    let len = match c_int::from((*addr).sa_family) {
        libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
        _ => return None,
    };
    OsSocketAddr::copy_from_raw(addr, len as libc::socklen_t).into_addr()
}

fn fail(errno: c_int) -> c_int {
    unsafe { *libc::__errno_location() = errno };
    -1
}

impl Registry {
    fn push(&mut self, id: usize, listen_id: usize, event: rdma_cm_event_type::Type, status: c_int, handshake: Option<Handshake>) {
        let Some(channel) = self.ids.get(&id).map(|node| node.channel) else {
            return;
        };
        self.queues.entry(channel).or_default().push_back(Pending {
            id,
            listen_id,
            event,
            status,
            handshake,
            stale: false,
        });
        let notify_fd = unsafe { (*(channel as *const Channel)).notify_fd };
        let byte = 1u8;
        unsafe { libc::write(notify_fd, ptr::addr_of!(byte).cast(), 1) };
    }

    fn port_taken(&self, ps: rdma_port_space::Type, port: u16) -> bool {
        self.ids
            .values()
            .any(|node| node.ps == ps && node.local.is_some_and(|local| local.port() == port))
    }

    fn ephemeral_port(&mut self, ps: rdma_port_space::Type) -> u16 {
        loop {
            let port = EPHEMERAL_PORTS + self.next_port % (u16::MAX - EPHEMERAL_PORTS);
            self.next_port = self.next_port.wrapping_add(1);
            if !self.port_taken(ps, port) {
                return port;
            }
        }
    }

    unsafe fn bind(&mut self, id: *mut rdma_cm_id, mut addr: SocketAddr) -> c_int {
        if !is_local(addr.ip()) {
            return fail(libc::EADDRNOTAVAIL);
        }
        let Some(ps) = self.ids.get(&(id as usize)).map(|node| node.ps) else {
            return fail(libc::EINVAL);
        };
        if addr.port() == 0 {
            addr.set_port(self.ephemeral_port(ps));
        } else if self.port_taken(ps, addr.port()) {
            return fail(libc::EADDRINUSE);
        }
        if let Some(node) = self.ids.get_mut(&(id as usize)) {
            if node.local.is_some() {
                return fail(libc::EINVAL);
            }
            node.local = Some(addr);
        }
        // a wildcard bind is not tied to a device yet
        if !addr.ip().is_unspecified() {
            (*id).verbs = context();
            (*id).port_num = PORT_NUM;
        }
        0
    }

    fn listener(&self, ps: rdma_port_space::Type, dst: SocketAddr) -> Option<usize> {
        self.ids.iter().find_map(|(&id, node)| {
            let local = node.local?;
            (node.listening
                && node.ps == ps
                && local.port() == dst.port()
                && (local.ip().is_unspecified() || local.ip() == dst.ip()))
            .then_some(id)
        })
    }

    /// Forget the undelivered events of `id`, releasing the children of its connect requests.
    fn purge(&mut self, id: usize) {
        let mut orphans = Vec::new();
        for queue in self.queues.values_mut() {
            for pending in queue.iter_mut().filter(|pending| !pending.stale) {
                if pending.id == id || pending.listen_id == id {
                    pending.stale = true;
                    if pending.event == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST && pending.id != id {
                        orphans.push(pending.id);
                    }
                }
            }
        }
        for orphan in orphans {
            self.release(orphan);
        }
    }

    /// Remove `id`, telling a connected peer.
    fn release(&mut self, id: usize) {
        self.purge(id);
        if let Some(node) = self.ids.remove(&id) {
            if let Some(peer) = node.peer {
                if let Some(peer_node) = self.ids.get_mut(&peer) {
                    peer_node.peer = None;
                    peer_node.stage = Stage::Idle;
                }
                if node.stage >= Stage::Responded {
                    self.push(peer, 0, rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED, 0, None);
                }
            }
            unsafe { drop(Box::from_raw(id as *mut rdma_cm_id)) };
        }
    }
}

unsafe extern "C" fn create_event_channel() -> *mut rdma_event_channel {
    let mut fds = [0 as c_int; 2];
    if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
        return ptr::null_mut();
    }
    let channel = Box::into_raw(Box::new(Channel {
        raw: rdma_event_channel { fd: fds[0] },
        notify_fd: fds[1],
    }));
    channel.cast()
}

unsafe extern "C" fn destroy_event_channel(channel: *mut rdma_event_channel) {
    if channel.is_null() {
        return;
    }
    {
        let mut registry = registry();
        if let Some(queue) = registry.queues.remove(&(channel as usize)) {
            for pending in queue.into_iter().filter(|pending| !pending.stale) {
                if pending.event == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST {
                    registry.release(pending.id);
                }
            }
        }
    }
    let channel = Box::from_raw(channel.cast::<Channel>());
    libc::close(channel.raw.fd);
    libc::close(channel.notify_fd);
}

unsafe fn new_id(channel: *mut rdma_event_channel, context: *mut c_void, ps: rdma_port_space::Type) -> *mut rdma_cm_id {
    let mut raw: rdma_cm_id = MaybeUninit::zeroed().assume_init();
    raw.channel = channel;
    raw.context = context;
    raw.ps = ps;
    Box::into_raw(Box::new(raw))
}

unsafe extern "C" fn create_id(
    channel: *mut rdma_event_channel, id: *mut *mut rdma_cm_id, context: *mut c_void, ps: rdma_port_space::Type,
) -> c_int {
    if channel.is_null() || id.is_null() {
        return fail(libc::EINVAL);
    }
    match ps {
        rdma_port_space::RDMA_PS_TCP | rdma_port_space::RDMA_PS_UDP | rdma_port_space::RDMA_PS_IB => {},
        _ => return fail(libc::EPROTONOSUPPORT),
    }
    let raw = new_id(channel, context, ps);
    registry().ids.insert(raw as usize, Node::new(channel as usize, ps));
    *id = raw;
    0
}

unsafe extern "C" fn destroy_id(id: *mut rdma_cm_id) -> c_int {
    registry().release(id as usize);
    0
}

unsafe extern "C" fn bind_addr(id: *mut rdma_cm_id, addr: *mut libc::sockaddr) -> c_int {
    let Some(addr) = read_addr(addr) else {
        return fail(libc::EAFNOSUPPORT);
    };
    registry().bind(id, addr)
}

unsafe extern "C" fn resolve_addr(
    id: *mut rdma_cm_id, src_addr: *mut libc::sockaddr, dst_addr: *mut libc::sockaddr, _timeout_ms: c_int,
) -> c_int {
    let Some(dst) = read_addr(dst_addr) else {
        return fail(libc::EINVAL);
    };
    let mut registry = registry();
    let Some(node) = registry.ids.get(&(id as usize)) else {
        return fail(libc::EINVAL);
    };
    if node.stage != Stage::Idle || node.listening {
        return fail(libc::EINVAL);
    }
    if node.local.is_none() {
        let src = read_addr(src_addr).unwrap_or_else(|| {
            let ip = match dst.ip() {
                ip if is_local(ip) => ip,
                IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
            };
            SocketAddr::new(ip, 0)
        });
        if registry.bind(id, src) != 0 {
            return -1;
        }
    }
    if !is_local(dst.ip()) {
        // nothing answers, the address never resolves
        registry.push(id as usize, 0, rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR, -libc::ETIMEDOUT, None);
        return 0;
    }
    if let Some(node) = registry.ids.get_mut(&(id as usize)) {
        node.remote = Some(dst);
        node.stage = Stage::AddressResolved;
    }
    (*id).verbs = context();
    (*id).port_num = PORT_NUM;
    registry.push(id as usize, 0, rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED, 0, None);
    0
}

unsafe extern "C" fn resolve_route(id: *mut rdma_cm_id, _timeout_ms: c_int) -> c_int {
    let mut registry = registry();
    match registry.ids.get_mut(&(id as usize)) {
        Some(node) if node.stage == Stage::AddressResolved => node.stage = Stage::RouteResolved,
        _ => return fail(libc::EINVAL),
    }
    registry.push(id as usize, 0, rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED, 0, None);
    0
}

unsafe extern "C" fn listen(id: *mut rdma_cm_id, _backlog: c_int) -> c_int {
    match registry().ids.get_mut(&(id as usize)) {
        Some(node) if node.local.is_some() && node.stage == Stage::Idle => {
            node.listening = true;
            0
        },
        _ => fail(libc::EINVAL),
    }
}

unsafe extern "C" fn connect(id: *mut rdma_cm_id, param: *mut rdma_conn_param) -> c_int {
    if param.is_null() {
        return fail(libc::EINVAL);
    }
    let handshake = Handshake::from_raw(&*param);
    let mut registry = registry();
    let (ps, remote) = match registry.ids.get_mut(&(id as usize)) {
        Some(node) if node.stage == Stage::RouteResolved => {
            node.stage = Stage::Connecting;
            node.local_qpn = handshake.qp_num;
            node.initiator_depth = handshake.initiator_depth;
            node.responder_resources = handshake.responder_resources;
            (node.ps, node.remote)
        },
        _ => return fail(libc::EINVAL),
    };
    let Some(listener) = remote.and_then(|remote| registry.listener(ps, remote)) else {
        if let Some(node) = registry.ids.get_mut(&(id as usize)) {
            node.stage = Stage::Idle;
        }
        registry.push(id as usize, 0, rdma_cm_event_type::RDMA_CM_EVENT_REJECTED, REJECT_NO_LISTENER, None);
        return 0;
    };

    let Some(listener_node) = registry.ids.get(&listener) else {
        return fail(libc::EINVAL);
    };
    let channel = listener_node.channel;
    let child = new_id(channel as *mut rdma_event_channel, ptr::null_mut(), ps);
    (*child).verbs = context();
    (*child).port_num = PORT_NUM;
    let mut node = Node::new(channel, ps);
    node.local = listener_node.local;
    node.stage = Stage::Requested;
    node.peer = Some(id as usize);
    node.remote_qpn = handshake.qp_num;
    // the responder resources of one side are the initiator depth of the other
    node.responder_resources = handshake.initiator_depth;
    node.initiator_depth = handshake.responder_resources;
    registry.ids.insert(child as usize, node);
    if let Some(active) = registry.ids.get_mut(&(id as usize)) {
        active.peer = Some(child as usize);
    }
    registry.push(
        child as usize,
        listener,
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST,
        0,
        Some(handshake),
    );
    0
}

unsafe extern "C" fn accept(id: *mut rdma_cm_id, param: *mut rdma_conn_param) -> c_int {
    let handshake = if param.is_null() {
        Handshake::default()
    } else {
        Handshake::from_raw(&*param)
    };
    let mut registry = registry();
    let peer = match registry.ids.get_mut(&(id as usize)) {
        Some(node) if node.stage == Stage::Requested => {
            node.stage = Stage::Accepted;
            node.local_qpn = handshake.qp_num;
            node.peer
        },
        _ => return fail(libc::EINVAL),
    };
    let Some(peer) = peer else {
        return fail(libc::ENOTCONN);
    };
    if let Some(active) = registry.ids.get_mut(&peer) {
        active.stage = Stage::Responded;
        active.remote_qpn = handshake.qp_num;
    }
    registry.push(peer, 0, rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_RESPONSE, 0, Some(handshake));
    0
}

unsafe extern "C" fn reject(id: *mut rdma_cm_id, private_data: *const c_void, private_data_len: u8) -> c_int {
    let mut registry = registry();
    let peer = match registry.ids.get_mut(&(id as usize)) {
        Some(node) if node.stage == Stage::Requested => {
            node.stage = Stage::Idle;
            node.peer.take()
        },
        _ => return fail(libc::EINVAL),
    };
    let Some(peer) = peer else {
        return fail(libc::ENOTCONN);
    };
    let mut handshake = Handshake::default();
    if !private_data.is_null() {
        handshake.private_data = slice::from_raw_parts(private_data.cast::<u8>(), usize::from(private_data_len)).to_vec();
    }
    if let Some(active) = registry.ids.get_mut(&peer) {
        active.stage = Stage::Idle;
        active.peer = None;
    }
    registry.push(peer, 0, rdma_cm_event_type::RDMA_CM_EVENT_REJECTED, REJECT_CONSUMER, Some(handshake));
    0
}

unsafe extern "C" fn establish(id: *mut rdma_cm_id) -> c_int {
    let mut registry = registry();
    let peer = match registry.ids.get_mut(&(id as usize)) {
        Some(node) if node.stage == Stage::Responded => {
            node.stage = Stage::Connected;
            node.peer
        },
        _ => return fail(libc::EINVAL),
    };
    let Some(peer) = peer else {
        return fail(libc::ENOTCONN);
    };
    if let Some(passive) = registry.ids.get_mut(&peer) {
        passive.stage = Stage::Connected;
    }
    registry.push(peer, 0, rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED, 0, None);
    0
}

unsafe extern "C" fn disconnect(id: *mut rdma_cm_id) -> c_int {
    let mut registry = registry();
    let peer = match registry.ids.get_mut(&(id as usize)) {
        Some(node) if node.stage >= Stage::Responded => {
            node.stage = Stage::Idle;
            node.peer.take()
        },
        _ => return fail(libc::EINVAL),
    };
    registry.push(id as usize, 0, rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED, 0, None);
    if let Some(peer) = peer {
        if let Some(node) = registry.ids.get_mut(&peer) {
            node.stage = Stage::Idle;
            node.peer = None;
        }
        registry.push(peer, 0, rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED, 0, None);
    }
    0
}

unsafe extern "C" fn get_cm_event(channel: *mut rdma_event_channel, event: *mut *mut rdma_cm_event) -> c_int {
    if channel.is_null() || event.is_null() {
        return fail(libc::EINVAL);
    }
    loop {
        let mut byte = 0u8;
        if libc::read((*channel).fd, ptr::addr_of_mut!(byte).cast(), 1) != 1 {
            // errno is left by read, EAGAIN in non-blocking mode
            return -1;
        }
        let mut registry = registry();
        let Some(pending) = registry
            .queues
            .get_mut(&(channel as usize))
            .and_then(VecDeque::pop_front)
        else {
            return fail(libc::EIO);
        };
        if pending.stale {
            continue;
        }

        let mut raw: rdma_cm_event = MaybeUninit::zeroed().assume_init();
        raw.id = pending.id as *mut rdma_cm_id;
        raw.listen_id = pending.listen_id as *mut rdma_cm_id;
        raw.event = pending.event;
        raw.status = pending.status;
        let mut delivery = Box::new(Delivery {
            raw,
            private_data: Vec::new(),
        });
        if let Some(handshake) = pending.handshake {
            let mut conn: rdma_conn_param = MaybeUninit::zeroed().assume_init();
            conn.responder_resources = handshake.responder_resources;
            conn.initiator_depth = handshake.initiator_depth;
            conn.retry_count = handshake.retry_count;
            conn.rnr_retry_count = handshake.rnr_retry_count;
            conn.qp_num = handshake.qp_num;
            delivery.private_data = handshake.private_data;
            if !delivery.private_data.is_empty() {
                conn.private_data = delivery.private_data.as_ptr().cast();
                conn.private_data_len = delivery.private_data.len() as u8;
            }
            delivery.raw.param.conn = conn;
        }
        *event = Box::into_raw(delivery).cast();
        return 0;
    }
}

unsafe extern "C" fn ack_cm_event(event: *mut rdma_cm_event) -> c_int {
    if event.is_null() {
        return fail(libc::EINVAL);
    }
    drop(Box::from_raw(event.cast::<Delivery>()));
    0
}

unsafe extern "C" fn init_qp_attr(id: *mut rdma_cm_id, attr: *mut ibv_qp_attr, mask: *mut c_int) -> c_int {
    let registry = registry();
    let Some(node) = registry.ids.get(&(id as usize)) else {
        return fail(libc::EINVAL);
    };
    if (*id).verbs.is_null() {
        return fail(libc::EINVAL);
    }
    let datagram = node.ps == rdma_port_space::RDMA_PS_UDP;
    let attr = &mut *attr;
    let bits = match attr.qp_state {
        ibv_qp_state::IBV_QPS_INIT => {
            attr.pkey_index = 0;
            attr.port_num = PORT_NUM;
            if datagram {
                attr.qkey = UDP_QKEY;
                Mask::State | Mask::PartitionKeyIndex | Mask::Port | Mask::QueueKey
            } else {
                attr.qp_access_flags = (AccessFlags::LocalWrite | AccessFlags::RemoteRead | AccessFlags::RemoteWrite)
                    .bits() as u32;
                Mask::State | Mask::PartitionKeyIndex | Mask::Port | Mask::AccessFlags
            }
        },
        ibv_qp_state::IBV_QPS_RTR if datagram => Mask::State,
        ibv_qp_state::IBV_QPS_RTR => {
            if node.peer.is_none() {
                return fail(libc::EINVAL);
            }
            attr.ah_attr.is_global = 1;
            attr.ah_attr.port_num = PORT_NUM;
            attr.ah_attr.grh.dgid = ibv_gid { raw: GID_TABLE[1] };
            attr.ah_attr.grh.sgid_index = 1;
            attr.ah_attr.grh.hop_limit = 64;
            attr.path_mtu = ibv_mtu::IBV_MTU_1024;
            attr.dest_qp_num = node.remote_qpn;
            attr.rq_psn = node.remote_qpn & 0xff_ffff;
            attr.max_dest_rd_atomic = node.responder_resources;
            attr.min_rnr_timer = 12;
            Mask::State
                | Mask::AddressVector
                | Mask::PathMtu
                | Mask::DestinationQueuePairNumber
                | Mask::ReceiveQueuePacketSequenceNumber
                | Mask::MaxDestinationReadAtomic
                | Mask::MinResponderNotReadyTimer
        },
        ibv_qp_state::IBV_QPS_RTS => {
            attr.sq_psn = node.local_qpn & 0xff_ffff;
            if datagram {
                Mask::State | Mask::SendQueuePacketSequenceNumber
            } else {
                attr.timeout = 14;
                attr.retry_cnt = 7;
                attr.rnr_retry = 7;
                attr.max_rd_atomic = node.initiator_depth;
                Mask::State
                    | Mask::Timeout
                    | Mask::RetryCount
                    | Mask::ResponderNotReadyRetryCount
                    | Mask::SendQueuePacketSequenceNumber
                    | Mask::MaxReadAtomic
            }
        },
        _ => return fail(libc::EINVAL),
    };
    *mask = bits.bits();
    0
}
