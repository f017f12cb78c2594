//! The connection manager resolves addresses and routes, and drives the event stream through
//! which two sides agree on each other's queue pair.
use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_int;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::{null, null_mut, NonNull};
use std::slice;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use os_socketaddr::OsSocketAddr;
use rdma_mummy_sys::{
    ibv_context, ibv_qp_attr, rdma_cm_event, rdma_cm_event_type, rdma_cm_id, rdma_conn_param, rdma_event_channel,
    rdma_port_space,
};
use tracing::{debug, warn};

use super::symbols::rdmacm;
use crate::ibverbs::device_context::DeviceContext;
use crate::ibverbs::errno_result;
use crate::ibverbs::queue_pair::{ModifyQueuePairError, QueuePair, QueuePairAttribute, QueuePairState};

/// Error returned by [`EventChannel::new`].
#[derive(Debug, thiserror::Error)]
#[error("failed to create event channel")]
#[non_exhaustive]
pub struct CreateEventChannelError(#[from] pub CreateEventChannelErrorKind);

/// The enum type for [`CreateEventChannelError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateEventChannelErrorKind {
    Rdmacm(#[from] io::Error),
}

/// Error returned by [`EventChannel::create_id`].
#[derive(Debug, thiserror::Error)]
#[error("failed to create communication identifier")]
#[non_exhaustive]
pub struct CreateIdentifierError(#[from] pub CreateIdentifierErrorKind);

/// The enum type for [`CreateIdentifierError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateIdentifierErrorKind {
    Rdmacm(#[from] io::Error),
}

/// Error returned by [`EventChannel::get_cm_event`] and [`EventChannel::get_cm_event_timeout`].
#[derive(Debug, thiserror::Error)]
#[error("failed to get communication event")]
#[non_exhaustive]
pub struct GetEventError(#[from] pub GetEventErrorKind);

/// The enum type for [`GetEventError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GetEventErrorKind {
    #[error("no event arrived within {timeout:?}")]
    Timeout { timeout: Duration },
    /// The channel is in non-blocking mode and no event is pending.
    #[error("no event is pending")]
    WouldBlock,
    #[error(transparent)]
    Rdmacm(#[from] io::Error),
}

/// Error returned by [`Event::ack`].
#[derive(Debug, thiserror::Error)]
#[error("failed to ack communication event")]
#[non_exhaustive]
pub struct AckEventError(#[from] pub AckEventErrorKind);

/// The enum type for [`AckEventError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum AckEventErrorKind {
    Rdmacm(#[from] io::Error),
}

/// Error returned by [`Identifier::bind_addr`].
#[derive(Debug, thiserror::Error)]
#[error("failed to bind address {addr}")]
#[non_exhaustive]
pub struct BindAddressError {
    pub addr: SocketAddr,
    #[source]
    pub source: IdentifierErrorKind,
}

/// Error returned by [`Identifier::resolve_addr`].
#[derive(Debug, thiserror::Error)]
#[error("failed to resolve address {addr}")]
#[non_exhaustive]
pub struct ResolveAddressError {
    pub addr: SocketAddr,
    #[source]
    pub source: IdentifierErrorKind,
}

/// Error returned by [`Identifier::resolve_route`].
#[derive(Debug, thiserror::Error)]
#[error("failed to resolve route")]
#[non_exhaustive]
pub struct ResolveRouteError(#[from] pub IdentifierErrorKind);

/// Error returned by [`Identifier::listen`].
#[derive(Debug, thiserror::Error)]
#[error("failed to listen")]
#[non_exhaustive]
pub struct ListenError(#[from] pub IdentifierErrorKind);

/// Error returned by the connection establishment and teardown operations of [`Identifier`].
#[derive(Debug, thiserror::Error)]
#[error("failed to {operation}")]
#[non_exhaustive]
pub struct ConnectionError {
    /// `connect`, `accept`, `reject`, `establish` or `disconnect`.
    pub operation: &'static str,
    #[source]
    pub source: IdentifierErrorKind,
}

/// The enum type for the errors of [`Identifier`] operations.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum IdentifierErrorKind {
    Rdmacm(#[from] io::Error),
}

/// Error returned by [`Identifier::get_device_context`].
#[derive(Debug, thiserror::Error)]
#[error("failed to get device context")]
#[non_exhaustive]
pub struct GetDeviceContextError(#[from] pub GetDeviceContextErrorKind);

/// The enum type for [`GetDeviceContextError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GetDeviceContextErrorKind {
    /// The identifier is not bound to a device yet, which happens until its address is resolved
    /// or it is bound to a specific local address.
    #[error("device context of the identifier is not initialized yet")]
    DeviceNotReady,
}

/// Error returned by [`Identifier::get_qp_attr`].
#[derive(Debug, thiserror::Error)]
#[error("failed to get queue pair attributes for {state:?}")]
#[non_exhaustive]
pub struct GetQueuePairAttributeError {
    pub state: QueuePairState,
    #[source]
    pub source: IdentifierErrorKind,
}

/// Error returned by [`Identifier::modify_qp_state`].
#[derive(Debug, thiserror::Error)]
#[error("failed to move queue pair to {state:?}")]
#[non_exhaustive]
pub struct ModifyQueuePairStateError {
    pub state: QueuePairState,
    #[source]
    pub source: ModifyQueuePairStateErrorKind,
}

/// The enum type for [`ModifyQueuePairStateError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum ModifyQueuePairStateErrorKind {
    Attribute(#[from] GetQueuePairAttributeError),
    Modify(#[from] ModifyQueuePairError),
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventType {
    AddressResolved = rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED,
    AddressError = rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR,
    RouteResolved = rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED,
    RouteError = rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR,
    ConnectRequest = rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST,
    ConnectResponse = rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_RESPONSE,
    ConnectError = rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR,
    Unreachable = rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE,
    Rejected = rdma_cm_event_type::RDMA_CM_EVENT_REJECTED,
    Established = rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED,
    Disconnected = rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED,
    DeviceRemoval = rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL,
    MulticastJoin = rdma_cm_event_type::RDMA_CM_EVENT_MULTICAST_JOIN,
    MulticastError = rdma_cm_event_type::RDMA_CM_EVENT_MULTICAST_ERROR,
    AddressChange = rdma_cm_event_type::RDMA_CM_EVENT_ADDR_CHANGE,
    TimewaitExit = rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT,
}

impl From<u32> for EventType {
    fn from(event: u32) -> Self {
        match event {
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => EventType::AddressResolved,
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => EventType::AddressError,
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => EventType::RouteResolved,
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => EventType::RouteError,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => EventType::ConnectRequest,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_RESPONSE => EventType::ConnectResponse,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => EventType::ConnectError,
            rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => EventType::Unreachable,
            rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => EventType::Rejected,
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => EventType::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => EventType::Disconnected,
            rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => EventType::DeviceRemoval,
            rdma_cm_event_type::RDMA_CM_EVENT_MULTICAST_JOIN => EventType::MulticastJoin,
            rdma_cm_event_type::RDMA_CM_EVENT_MULTICAST_ERROR => EventType::MulticastError,
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_CHANGE => EventType::AddressChange,
            rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT => EventType::TimewaitExit,
            _ => panic!("Unknown RDMA CM event type: {event}"),
        }
    }
}

// librdmacm owns the contexts it binds identifiers to, they are shared by every identifier on the
// same device and never closed from here. A wrapper lives as long as someone holds it.
static DEVICE_CONTEXTS: LazyLock<Mutex<HashMap<usize, Weak<DeviceContext>>>> = LazyLock::new(Default::default);

fn shared_context(verbs: NonNull<ibv_context>) -> Arc<DeviceContext> {
    let mut contexts = DEVICE_CONTEXTS.lock().unwrap_or_else(PoisonError::into_inner);
    let key = verbs.as_ptr() as usize;
    if let Some(context) = contexts.get(&key).and_then(Weak::upgrade) {
        return context;
    }
    contexts.retain(|_, context| context.strong_count() > 0);
    let context = Arc::new(DeviceContext::borrowed(verbs));
    contexts.insert(key, Arc::downgrade(&context));
    context
}

pub struct Event {
    event: NonNull<rdma_cm_event>,
    cm_id: Option<Arc<Identifier>>,
    listener_id: Option<Arc<Identifier>>,
}

pub struct EventChannel {
    channel: NonNull<rdma_event_channel>,
}

pub struct Identifier {
    cm_id: NonNull<rdma_cm_id>,
    user_context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Parameters exchanged with the remote side by [`Identifier::connect`] and
/// [`Identifier::accept`].
///
/// The default asks for one outstanding RDMA read / atomic in each direction and the maximum of
/// 7 retries for both transport and RNR errors.
pub struct ConnectionParameter {
    param: rdma_conn_param,
    private_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    /// Provides for any InfiniBand services (UD, UC, RC, XRC, etc.).
    InfiniBand = rdma_port_space::RDMA_PS_IB as isize,
    IpOverInfiniBand = rdma_port_space::RDMA_PS_IPOIB as isize,
    /// Provides reliable, connection-oriented QP communication. Unlike TCP, the RDMA port space
    /// provides message, not stream, based communication. In other words, this would create a
    /// [`QueuePair`] for [`ReliableConnection`].
    ///
    /// [`ReliableConnection`]: crate::ibverbs::queue_pair::QueuePairType::ReliableConnection
    ///
    Tcp = rdma_port_space::RDMA_PS_TCP as isize,
    /// Provides unreliable, connectionless QP communication. Supports both datagram and multicast
    /// communication. In other words, this would create a [`QueuePair`] for [`UnreliableDatagram`].
    ///
    /// [`UnreliableDatagram`]: crate::ibverbs::queue_pair::QueuePairType::UnreliableDatagram
    ///
    Udp = rdma_port_space::RDMA_PS_UDP as isize,
}

fn timeout_ms(timeout: Duration) -> c_int {
    c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX)
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { (rdmacm().destroy_event_channel)(self.channel.as_ptr()) };
    }
}

impl Event {
    /// Get the [`Identifier`] associated with this [`Event`].
    ///
    /// # Special cases
    ///
    /// - For [`EventType::ConnectRequest`]:
    ///   A new [`Identifier`] is automatically created to handle
    ///   the incoming connection request. This is distinct from the listener
    ///   [`Identifier`].
    ///
    /// - For other event types:
    ///   Returns the existing [`Identifier`] associated with the event.
    ///
    /// # Note
    ///
    /// To access the listener [`Identifier`] in case of a connect request,
    /// use the [`listener_id`] method instead.
    ///
    /// [`listener_id`]: crate::rdmacm::communication_manager::Event::listener_id
    ///
    pub fn cm_id(&self) -> Option<Arc<Identifier>> {
        self.cm_id.clone()
    }

    /// Get the listener [`Identifier`] associated with this [`Event`].
    ///
    /// # Note
    ///
    /// This method is primarily useful for [`EventType::ConnectRequest`] events,
    /// allowing access to the listener that received the connection request, for
    /// other events, this method would return [`None`].
    pub fn listener_id(&self) -> Option<Arc<Identifier>> {
        self.listener_id.clone()
    }

    /// Get the event type of this event.
    pub fn event_type(&self) -> EventType {
        unsafe { self.event.as_ref().event.into() }
    }

    /// Get the event status of this event, this would be useful when you get an error
    /// event, for example, [`EventType::Rejected`].
    pub fn status(&self) -> i32 {
        unsafe { self.event.as_ref().status }
    }

    fn carries_connection(&self) -> bool {
        matches!(
            self.event_type(),
            EventType::ConnectRequest | EventType::ConnectResponse | EventType::Established | EventType::Rejected
        )
    }

    /// The queue pair number the remote side announced, for connect requests and responses.
    pub fn remote_qp_number(&self) -> Option<u32> {
        match self.event_type() {
            EventType::ConnectRequest | EventType::ConnectResponse => {
                Some(unsafe { self.event.as_ref().param.conn.qp_num })
            },
            _ => None,
        }
    }

    /// The private data the remote side attached to its connect, accept or reject call.
    pub fn private_data(&self) -> &[u8] {
        if !self.carries_connection() {
            return &[];
        }
        let conn = unsafe { &self.event.as_ref().param.conn };
        if conn.private_data.is_null() {
            return &[];
        }
        unsafe { slice::from_raw_parts(conn.private_data.cast::<u8>(), usize::from(conn.private_data_len)) }
    }

    /// Acknowledge and free the communication event.
    ///
    /// # Note
    ///
    /// This method should be called to release events allocated by [`get_cm_event`].
    /// There should be a one-to-one correspondence between successful gets and acks.
    /// This call frees the event structure and any memory that it references.
    ///
    /// [`get_cm_event`]: crate::rdmacm::communication_manager::EventChannel::get_cm_event
    ///
    pub fn ack(mut self) -> Result<(), AckEventError> {
        let ret = unsafe { (rdmacm().ack_cm_event)(self.event.as_ptr()) };

        self.cm_id.take();
        self.listener_id.take();

        // The event has been freed by rdma_ack_cm_event, so we don't need to drop it.
        std::mem::forget(self);

        errno_result(ret).map_err(AckEventErrorKind::from)?;
        Ok(())
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(err) = errno_result(unsafe { (rdmacm().ack_cm_event)(self.event.as_ptr()) }) {
            warn!(error = %err, "failed to ack cm event");
        }
    }
}

impl EventChannel {
    pub fn new() -> Result<EventChannel, CreateEventChannelError> {
        let channel = unsafe { (rdmacm().create_event_channel)() };
        let channel = NonNull::new(channel)
            .ok_or_else(|| CreateEventChannelErrorKind::Rdmacm(io::Error::last_os_error()))?;
        debug!(fd = unsafe { channel.as_ref().fd }, "EventChannel::new");

        Ok(EventChannel { channel })
    }

    pub fn create_id(&mut self, port_space: PortSpace) -> Result<Arc<Identifier>, CreateIdentifierError> {
        let mut cm_id_ptr: *mut rdma_cm_id = null_mut();
        let ret = unsafe {
            (rdmacm().create_id)(self.channel.as_ptr(), &mut cm_id_ptr, null_mut(), port_space as rdma_port_space::Type)
        };
        errno_result(ret).map_err(CreateIdentifierErrorKind::from)?;

        let cm_id = NonNull::new(cm_id_ptr)
            .ok_or_else(|| CreateIdentifierErrorKind::Rdmacm(io::Error::from_raw_os_error(libc::EINVAL)))?;
        debug!(?port_space, "EventChannel::create_id");
        Ok(Identifier::wrap(cm_id))
    }

    /// Switch the channel between blocking and non-blocking mode. In non-blocking mode
    /// [`get_cm_event`](Self::get_cm_event) fails with [`GetEventErrorKind::WouldBlock`] instead
    /// of waiting.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for the next event; blocks unless the channel is in non-blocking mode.
    pub fn get_cm_event(&mut self) -> Result<Event, GetEventError> {
        let mut event_ptr = MaybeUninit::<*mut rdma_cm_event>::uninit();

        let ret = unsafe { (rdmacm().get_cm_event)(self.channel.as_ptr(), event_ptr.as_mut_ptr()) };
        if let Err(err) = errno_result(ret) {
            return Err(match err.kind() {
                io::ErrorKind::WouldBlock => GetEventErrorKind::WouldBlock,
                _ => GetEventErrorKind::Rdmacm(err),
            }
            .into());
        }

        let event = NonNull::new(unsafe { event_ptr.assume_init() })
            .ok_or_else(|| GetEventErrorKind::Rdmacm(io::Error::from_raw_os_error(libc::EINVAL)))?;

        let (raw_cm_id, raw_listen_id, event_type) = unsafe {
            let raw = event.as_ref();
            (raw.id, raw.listen_id, EventType::from(raw.event))
        };

        let cm_id = NonNull::new(raw_cm_id).and_then(|raw_cm_id| {
            if event_type == EventType::ConnectRequest {
                // For connect requests, the library created a new identifier for us
                Some(Identifier::wrap(raw_cm_id))
            } else {
                unsafe { Identifier::upgrade(raw_cm_id) }
            }
        });
        let listener_id = NonNull::new(raw_listen_id).and_then(|raw| unsafe { Identifier::upgrade(raw) });

        debug!(?event_type, status = unsafe { event.as_ref().status }, "EventChannel::get_cm_event");
        Ok(Event {
            event,
            cm_id,
            listener_id,
        })
    }

    /// Like [`get_cm_event`](Self::get_cm_event), but gives up after `timeout`. `None` waits
    /// forever.
    pub fn get_cm_event_timeout(&mut self, timeout: Option<Duration>) -> Result<Event, GetEventError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let wait = match deadline {
                Some(deadline) => timeout_ms(deadline.saturating_duration_since(Instant::now())),
                None => -1,
            };
            let mut fd = libc::pollfd {
                fd: self.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            match unsafe { libc::poll(&mut fd, 1, wait) } {
                0 => {
                    return Err(GetEventErrorKind::Timeout {
                        timeout: timeout.unwrap_or_default(),
                    }
                    .into())
                },
                ret if ret < 0 => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(GetEventErrorKind::Rdmacm(err).into());
                    }
                },
                _ => return self.get_cm_event(),
            }
        }
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        unsafe { self.channel.as_ref().fd }
    }
}

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl Drop for Identifier {
    fn drop(&mut self) {
        let cm_id = self.cm_id;
        unsafe {
            let ctx = cm_id.as_ref().context as *mut Weak<Identifier>;
            if let Err(err) = errno_result((rdmacm().destroy_id)(cm_id.as_ptr())) {
                warn!(error = %err, "failed to destroy cm id");
            }
            if !ctx.is_null() {
                drop(Box::from_raw(ctx));
            }
        }
    }
}

// Mark CommunicationManager as Sync & Send, implying that we guarantee its thread-safety
unsafe impl Sync for Identifier {}
unsafe impl Send for Identifier {}

impl Identifier {
    /// Take over a raw identifier, whose context then points back to the returned handle.
    fn wrap(cm_id: NonNull<rdma_cm_id>) -> Arc<Identifier> {
        let id = Arc::new(Identifier {
            cm_id,
            user_context: Mutex::new(None),
        });
        let weak = Box::into_raw(Box::new(Arc::downgrade(&id)));
        unsafe { (*cm_id.as_ptr()).context = weak.cast() };
        id
    }

    unsafe fn upgrade(cm_id: NonNull<rdma_cm_id>) -> Option<Arc<Identifier>> {
        let weak = cm_id.as_ref().context as *const Weak<Identifier>;
        weak.as_ref()?.upgrade()
    }

    pub fn setup_context<C: Any + Send + Sync>(&self, ctx: C) {
        let mut user_data = self.user_context.lock().unwrap_or_else(PoisonError::into_inner);
        *user_data = Some(Arc::new(ctx));
    }

    pub fn get_context<C: Any + Send + Sync>(&self) -> Option<Arc<C>> {
        let user_data = self.user_context.lock().unwrap_or_else(PoisonError::into_inner);
        let arc_any = user_data.as_ref()?.clone();
        arc_any.downcast::<C>().ok()
    }

    pub fn port(&self) -> u8 {
        unsafe { self.cm_id.as_ref().port_num }
    }

    pub fn bind_addr(&self, addr: SocketAddr) -> Result<(), BindAddressError> {
        let ret = unsafe { (rdmacm().bind_addr)(self.cm_id.as_ptr(), OsSocketAddr::from(addr).as_mut_ptr()) };
        errno_result(ret).map_err(|err| BindAddressError {
            addr,
            source: err.into(),
        })?;
        debug!(%addr, "Identifier::bind_addr");
        Ok(())
    }

    /// Start resolving `dst_addr`, the outcome arrives as [`EventType::AddressResolved`] or
    /// [`EventType::AddressError`].
    pub fn resolve_addr(
        &self, src_addr: Option<SocketAddr>, dst_addr: SocketAddr, timeout: Duration,
    ) -> Result<(), ResolveAddressError> {
        let mut src = src_addr.map(OsSocketAddr::from);
        let ret = unsafe {
            (rdmacm().resolve_addr)(
                self.cm_id.as_ptr(),
                match src.as_mut() {
                    Some(addr) => addr.as_mut_ptr(),
                    None => null_mut(),
                },
                OsSocketAddr::from(dst_addr).as_mut_ptr(),
                timeout_ms(timeout),
            )
        };
        errno_result(ret).map_err(|err| ResolveAddressError {
            addr: dst_addr,
            source: err.into(),
        })?;
        debug!(%dst_addr, "Identifier::resolve_addr");
        Ok(())
    }

    pub fn resolve_route(&self, timeout: Duration) -> Result<(), ResolveRouteError> {
        let ret = unsafe { (rdmacm().resolve_route)(self.cm_id.as_ptr(), timeout_ms(timeout)) };
        errno_result(ret).map_err(IdentifierErrorKind::from)?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), ListenError> {
        let ret = unsafe { (rdmacm().listen)(self.cm_id.as_ptr(), backlog) };
        errno_result(ret).map_err(IdentifierErrorKind::from)?;
        debug!(backlog, "Identifier::listen");
        Ok(())
    }

    /// The device context the identifier is bound to.
    ///
    /// Identifiers only get a device once their address is resolved, or once they are bound to a
    /// specific local address; before that this fails with
    /// [`GetDeviceContextErrorKind::DeviceNotReady`].
    pub fn get_device_context(&self) -> Result<Arc<DeviceContext>, GetDeviceContextError> {
        let verbs = unsafe { self.cm_id.as_ref().verbs };
        let verbs = NonNull::new(verbs).ok_or(GetDeviceContextErrorKind::DeviceNotReady)?;

        Ok(shared_context(verbs))
    }

    fn connection_result(&self, operation: &'static str, ret: c_int) -> Result<(), ConnectionError> {
        errno_result(ret).map_err(|err| ConnectionError {
            operation,
            source: err.into(),
        })?;
        debug!(operation, "Identifier connection");
        Ok(())
    }

    pub fn connect(&self, mut conn_param: ConnectionParameter) -> Result<(), ConnectionError> {
        let ret = unsafe { (rdmacm().connect)(self.cm_id.as_ptr(), conn_param.as_mut_ptr()) };
        self.connection_result("connect", ret)
    }

    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        let ret = unsafe { (rdmacm().disconnect)(self.cm_id.as_ptr()) };
        self.connection_result("disconnect", ret)
    }

    pub fn accept(&self, mut conn_param: ConnectionParameter) -> Result<(), ConnectionError> {
        let ret = unsafe { (rdmacm().accept)(self.cm_id.as_ptr(), conn_param.as_mut_ptr()) };
        self.connection_result("accept", ret)
    }

    /// Turn down a connect request, `private_data` is handed to the active side in the
    /// [`EventType::Rejected`] event and must not exceed 255 bytes.
    pub fn reject(&self, private_data: &[u8]) -> Result<(), ConnectionError> {
        let Ok(len) = u8::try_from(private_data.len()) else {
            return self.connection_result("reject", libc::EINVAL);
        };
        let data = if private_data.is_empty() {
            null()
        } else {
            private_data.as_ptr().cast()
        };
        let ret = unsafe { (rdmacm().reject)(self.cm_id.as_ptr(), data, len) };
        self.connection_result("reject", ret)
    }

    pub fn establish(&self) -> Result<(), ConnectionError> {
        let ret = unsafe { (rdmacm().establish)(self.cm_id.as_ptr()) };
        self.connection_result("establish", ret)
    }

    /// The attributes moving a queue pair of this connection into `state`, as computed by the
    /// connection manager.
    pub fn get_qp_attr(&self, state: QueuePairState) -> Result<QueuePairAttribute, GetQueuePairAttributeError> {
        let mut attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
        let mut mask = 0;
        attr.qp_state = state as _;

        let ret = unsafe { (rdmacm().init_qp_attr)(self.cm_id.as_ptr(), &mut attr, &mut mask) };
        errno_result(ret).map_err(|err| GetQueuePairAttributeError {
            state,
            source: err.into(),
        })?;

        Ok(QueuePairAttribute::from(&attr, mask))
    }

    /// Move `qp` into `state` with the attributes from [`get_qp_attr`](Self::get_qp_attr). The
    /// transition is validated like any [`QueuePair::modify`].
    pub fn modify_qp_state<Q: QueuePair>(&self, qp: &mut Q, state: QueuePairState) -> Result<(), ModifyQueuePairStateError> {
        let attr = self
            .get_qp_attr(state)
            .map_err(|err| ModifyQueuePairStateError { state, source: err.into() })?;
        qp.modify(&attr)
            .map_err(|err| ModifyQueuePairStateError { state, source: err.into() })?;
        debug!(qp_num = qp.qp_number(), ?state, "Identifier::modify_qp_state");
        Ok(())
    }
}

impl Default for ConnectionParameter {
    fn default() -> Self {
        let mut param = Self::new();
        param.param.responder_resources = 1;
        param.param.initiator_depth = 1;
        param.param.retry_count = 7;
        param.param.rnr_retry_count = 7;
        param
    }
}

impl ConnectionParameter {
    /// Parameters with every field zeroed.
    pub fn new() -> Self {
        Self {
            param: rdma_conn_param {
                private_data: null(),
                private_data_len: 0,
                responder_resources: 0,
                initiator_depth: 0,
                flow_control: 0,
                retry_count: 0,
                rnr_retry_count: 0,
                srq: 0,
                qp_num: 0,
            },
            private_data: Vec::new(),
        }
    }

    pub fn setup_qp_number(&mut self, qp_number: u32) -> &mut Self {
        self.param.qp_num = qp_number;
        self
    }

    pub fn setup_responder_resources(&mut self, responder_resources: u8) -> &mut Self {
        self.param.responder_resources = responder_resources;
        self
    }

    pub fn setup_initiator_depth(&mut self, initiator_depth: u8) -> &mut Self {
        self.param.initiator_depth = initiator_depth;
        self
    }

    pub fn setup_retry_count(&mut self, retry_count: u8) -> &mut Self {
        self.param.retry_count = retry_count.min(7);
        self
    }

    pub fn setup_rnr_retry_count(&mut self, rnr_retry_count: u8) -> &mut Self {
        self.param.rnr_retry_count = rnr_retry_count.min(7);
        self
    }

    /// Attach up to 255 bytes for the remote side, longer data is truncated.
    pub fn setup_private_data(&mut self, private_data: &[u8]) -> &mut Self {
        self.private_data = private_data[..private_data.len().min(u8::MAX as usize)].to_vec();
        self
    }

    fn as_mut_ptr(&mut self) -> *mut rdma_conn_param {
        if self.private_data.is_empty() {
            self.param.private_data = null();
        } else {
            self.param.private_data = self.private_data.as_ptr().cast();
        }
        self.param.private_data_len = self.private_data.len() as u8;
        &mut self.param
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::loopback;
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;

    fn setup() -> EventChannel {
        loopback::install().unwrap();
        EventChannel::new().unwrap()
    }

    #[test]
    fn test_cm_id_reference_count() -> Result<(), Box<dyn std::error::Error>> {
        let mut channel = setup();
        let id = channel.create_id(PortSpace::Tcp)?;

        assert_eq!(Arc::strong_count(&id), 1);

        id.resolve_addr(
            None,
            SocketAddr::from((IpAddr::from_str("127.0.0.1").expect("Invalid IP address"), 0)),
            Duration::new(0, 200000000),
        )?;

        assert_eq!(Arc::strong_count(&id), 1);

        let event = channel.get_cm_event()?;
        assert_eq!(event.event_type(), EventType::AddressResolved);

        assert_eq!(Arc::strong_count(&id), 2);

        let cm_id = event.cm_id().unwrap();

        assert_eq!(Arc::strong_count(&id), 3);
        assert_eq!(Arc::strong_count(&cm_id), 3);

        event.ack()?;

        assert_eq!(Arc::strong_count(&id), 2);
        assert_eq!(Arc::strong_count(&cm_id), 2);

        Ok(())
    }

    #[test]
    fn test_bind_on_the_same_port() {
        let mut channel = setup();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 18080));
        let id = channel.create_id(PortSpace::Tcp).unwrap();
        id.bind_addr(addr).unwrap();

        let new_id = channel.create_id(PortSpace::Tcp).unwrap();
        let err = new_id.bind_addr(addr).unwrap_err();
        assert_eq!(err.addr, addr);
        let IdentifierErrorKind::Rdmacm(source) = &err.source;
        assert_eq!(source.raw_os_error(), Some(libc::EADDRINUSE));

        // another port space does not collide
        let udp_id = channel.create_id(PortSpace::Udp).unwrap();
        udp_id.bind_addr(addr).unwrap();
    }

    #[test]
    fn test_bind_non_local_address() {
        let mut channel = setup();
        let id = channel.create_id(PortSpace::Tcp).unwrap();
        let err = id.bind_addr(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 18081))).unwrap_err();
        let IdentifierErrorKind::Rdmacm(source) = &err.source;
        assert_eq!(source.raw_os_error(), Some(libc::EADDRNOTAVAIL));
    }

    #[test]
    fn test_device_not_ready_until_bound_to_a_device() {
        let mut channel = setup();
        let id = channel.create_id(PortSpace::Tcp).unwrap();
        assert!(matches!(
            id.get_device_context().unwrap_err().0,
            GetDeviceContextErrorKind::DeviceNotReady
        ));

        // a wildcard bind does not pick a device either
        id.bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 18082))).unwrap();
        assert!(id.get_device_context().is_err());

        let bound = channel.create_id(PortSpace::Tcp).unwrap();
        bound.bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 18083))).unwrap();
        let context = bound.get_device_context().unwrap();
        assert_eq!(context.name(), loopback::DEVICE_NAME);
        assert_eq!(bound.port(), 1);
        // every identifier on the device shares the context
        assert!(Arc::ptr_eq(&context, &bound.get_device_context().unwrap()));
    }

    #[test]
    fn test_device_context_is_not_kept_alive() {
        // stand-ins for contexts owned by librdmacm, borrowed wrappers never touch them
        let native = [0u64; 2];
        let verbs = NonNull::from(&native[0]).cast::<ibv_context>();
        let other = NonNull::from(&native[1]).cast::<ibv_context>();
        let contexts = || DEVICE_CONTEXTS.lock().unwrap_or_else(PoisonError::into_inner);

        let context = shared_context(verbs);
        assert!(Arc::ptr_eq(&context, &shared_context(verbs)));
        let weak = Arc::downgrade(&context);
        drop(context);
        assert!(weak.upgrade().is_none());

        let context = shared_context(verbs);
        assert_eq!(Arc::strong_count(&context), 1);
        drop(context);

        // dead entries go away with the next new context
        let _other = shared_context(other);
        assert!(!contexts().contains_key(&(verbs.as_ptr() as usize)));
        assert!(contexts().contains_key(&(other.as_ptr() as usize)));
    }

    #[test]
    fn test_event_timeout_and_nonblocking() {
        let mut channel = setup();
        let err = channel.get_cm_event_timeout(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err.0, GetEventErrorKind::Timeout { timeout } if timeout == Duration::from_millis(20)));

        channel.set_nonblocking(true).unwrap();
        assert!(matches!(channel.get_cm_event().unwrap_err().0, GetEventErrorKind::WouldBlock));

        let id = channel.create_id(PortSpace::Tcp).unwrap();
        id.resolve_addr(None, SocketAddr::from((Ipv4Addr::LOCALHOST, 18084)), Duration::from_millis(100))
            .unwrap();
        let event = channel.get_cm_event_timeout(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(event.event_type(), EventType::AddressResolved);
        assert_eq!(event.status(), 0);
    }

    #[test]
    fn test_unreachable_address() {
        let mut channel = setup();
        let id = channel.create_id(PortSpace::Tcp).unwrap();
        id.resolve_addr(None, SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 18085)), Duration::from_millis(100))
            .unwrap();
        let event = channel.get_cm_event().unwrap();
        assert_eq!(event.event_type(), EventType::AddressError);
        assert_eq!(event.status(), -libc::ETIMEDOUT);
        assert!(id.resolve_route(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_listen_requires_bind() {
        let mut channel = setup();
        let id = channel.create_id(PortSpace::Tcp).unwrap();
        assert!(id.listen(8).is_err());
        id.bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 18086))).unwrap();
        id.listen(8).unwrap();
    }

    #[test]
    fn test_user_context() {
        let mut channel = setup();
        let id = channel.create_id(PortSpace::Tcp).unwrap();
        assert!(id.get_context::<u32>().is_none());
        id.setup_context(42u32);
        assert_eq!(*id.get_context::<u32>().unwrap(), 42);
        assert!(id.get_context::<String>().is_none());
    }

    #[test]
    fn test_conn_param() {
        let mut param = ConnectionParameter::default();
        param.setup_qp_number(0x123).setup_retry_count(9).setup_private_data(&[7; 300]);
        let raw = unsafe { &*param.as_mut_ptr() };
        assert_eq!(raw.qp_num, 0x123);
        assert_eq!(raw.retry_count, 7);
        assert_eq!(raw.rnr_retry_count, 7);
        assert_eq!(raw.responder_resources, 1);
        assert_eq!(raw.private_data_len, 255);

        let raw = unsafe { &*ConnectionParameter::new().as_mut_ptr() };
        assert!(raw.private_data.is_null());
        assert_eq!(raw.initiator_depth, 0);
    }

    #[test]
    #[should_panic(expected = "Unknown RDMA CM event type")]
    fn test_unknown_event_type() {
        let _ = EventType::from(1000);
    }
}
