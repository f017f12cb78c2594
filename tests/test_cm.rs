mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use verbway::ibverbs::completion::{WorkCompletionOperationType, WorkCompletionStatus};
use verbway::ibverbs::loopback;
use verbway::ibverbs::queue_pair::{
    PostSendGuard, QueuePair, QueuePairState, SetInlineData, SetScatterGatherEntry, WorkRequestFlags,
};
use verbway::ibverbs::AccessFlags;
use verbway::rdmacm::communication_manager::{
    ConnectionParameter, Event, EventChannel, EventType, Identifier, PortSpace,
};

use common::drain;

const TIMEOUT: Duration = Duration::from_secs(1);

fn next_event(channel: &mut EventChannel, expected: EventType) -> anyhow::Result<Event> {
    let event = channel.get_cm_event_timeout(Some(TIMEOUT))?;
    assert_eq!(event.event_type(), expected, "status {}", event.status());
    Ok(event)
}

fn listen(channel: &mut EventChannel, port: u16) -> anyhow::Result<Arc<Identifier>> {
    let listener = channel.create_id(PortSpace::Tcp)?;
    listener.bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
    listener.listen(8)?;
    Ok(listener)
}

/// Resolve address and route of `port` on the loopback address.
fn resolve(channel: &mut EventChannel, port: u16) -> anyhow::Result<Arc<Identifier>> {
    let id = channel.create_id(PortSpace::Tcp)?;
    id.resolve_addr(None, SocketAddr::from((Ipv4Addr::LOCALHOST, port)), TIMEOUT)?;
    next_event(channel, EventType::AddressResolved)?.ack()?;
    id.resolve_route(TIMEOUT)?;
    next_event(channel, EventType::RouteResolved)?.ack()?;
    Ok(id)
}

#[test]
fn test_connect_transfer_and_disconnect() -> anyhow::Result<()> {
    loopback::install()?;
    let mut server_channel = EventChannel::new()?;
    let mut client_channel = EventChannel::new()?;
    let listener = listen(&mut server_channel, 18500)?;
    let client = resolve(&mut client_channel, 18500)?;

    // active side: queue pair in INIT before the request goes out
    let client_ctx = client.get_device_context()?;
    let client_pd = client_ctx.alloc_pd()?;
    let mut client_cq = client_ctx.create_cq_builder().build_generic()?;
    let mut client_qp = client_pd
        .create_qp_builder()
        .setup_max_inline_data(64)
        .setup_send_cq(client_cq.clone())
        .setup_recv_cq(client_cq.clone())
        .build_generic()?;
    client.modify_qp_state(&mut client_qp, QueuePairState::Init)?;

    let mut param = ConnectionParameter::default();
    param.setup_qp_number(client_qp.qp_number()).setup_private_data(b"hello");
    client.connect(param)?;

    // passive side
    let request = next_event(&mut server_channel, EventType::ConnectRequest)?;
    assert_eq!(request.private_data(), b"hello");
    assert_eq!(request.remote_qp_number(), Some(client_qp.qp_number()));
    assert!(Arc::ptr_eq(&request.listener_id().unwrap(), &listener));
    let server = request.cm_id().unwrap();
    request.ack()?;

    let server_ctx = server.get_device_context()?;
    let server_pd = server_ctx.alloc_pd()?;
    let mut server_cq = server_ctx.create_cq_builder().build_generic()?;
    let mut server_qp = server_pd
        .create_qp_builder()
        .setup_send_cq(server_cq.clone())
        .setup_recv_cq(server_cq.clone())
        .build_generic()?;
    for state in [QueuePairState::Init, QueuePairState::ReadyToReceive, QueuePairState::ReadyToSend] {
        server.modify_qp_state(&mut server_qp, state)?;
    }
    assert_eq!(server_qp.state(), QueuePairState::ReadyToSend);

    let mut inbox = [0u8; 16];
    let inbox_mr = unsafe {
        server_pd.reg_mr(
            inbox.as_mut_ptr() as _,
            inbox.len(),
            AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
        )?
    };
    let mut guard = server_qp.start_post_recv();
    unsafe { guard.construct_wr(1).setup_sge(inbox_mr.lkey(), inbox_mr.get_ptr() as u64, 8) };
    guard.post()?;

    // hand the write target to the active side
    let mut target = (inbox_mr.get_ptr() as u64 + 8).to_le_bytes().to_vec();
    target.extend_from_slice(&inbox_mr.rkey().to_le_bytes());
    let mut param = ConnectionParameter::default();
    param.setup_qp_number(server_qp.qp_number()).setup_private_data(&target);
    server.accept(param)?;

    let response = next_event(&mut client_channel, EventType::ConnectResponse)?;
    assert_eq!(response.remote_qp_number(), Some(server_qp.qp_number()));
    let (addr, rkey) = response.private_data().split_at(8);
    let remote_addr = u64::from_le_bytes(addr.try_into()?);
    let rkey = u32::from_le_bytes(rkey.try_into()?);
    response.ack()?;

    client.modify_qp_state(&mut client_qp, QueuePairState::ReadyToReceive)?;
    client.modify_qp_state(&mut client_qp, QueuePairState::ReadyToSend)?;
    client.establish()?;
    next_event(&mut server_channel, EventType::Established)?.ack()?;

    let mut guard = client_qp.start_post_send();
    guard
        .construct_wr(10, WorkRequestFlags::Signaled)
        .setup_send()
        .setup_inline_data(b"ping");
    guard
        .construct_wr(11, WorkRequestFlags::Signaled)
        .setup_write(rkey, remote_addr)
        .setup_inline_data(b"pong");
    guard.post()?;

    let sent = drain(&mut client_cq);
    assert_eq!(sent.iter().map(|wc| wc.wr_id).collect::<Vec<_>>(), [10, 11]);
    assert!(sent.iter().all(|wc| wc.status == WorkCompletionStatus::Success));

    let received = drain(&mut server_cq);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].opcode, WorkCompletionOperationType::Receive);
    assert_eq!(received[0].byte_len, 4);
    assert_eq!(&inbox[..4], b"ping");
    assert_eq!(&inbox[8..12], b"pong");

    client.disconnect()?;
    next_event(&mut client_channel, EventType::Disconnected)?.ack()?;
    let event = next_event(&mut server_channel, EventType::Disconnected)?;
    assert!(Arc::ptr_eq(&event.cm_id().unwrap(), &server));
    event.ack()?;
    Ok(())
}

#[test]
fn test_rejected_request_carries_private_data() -> anyhow::Result<()> {
    loopback::install()?;
    let mut server_channel = EventChannel::new()?;
    let mut client_channel = EventChannel::new()?;
    let _listener = listen(&mut server_channel, 18501)?;
    let client = resolve(&mut client_channel, 18501)?;

    client.connect(ConnectionParameter::default())?;
    let request = next_event(&mut server_channel, EventType::ConnectRequest)?;
    request.cm_id().unwrap().reject(b"busy")?;
    request.ack()?;

    let rejected = next_event(&mut client_channel, EventType::Rejected)?;
    // consumer defined reject reason
    assert_eq!(rejected.status(), 28);
    assert_eq!(rejected.private_data(), b"busy");
    Ok(())
}

#[test]
fn test_connect_without_listener_is_rejected() -> anyhow::Result<()> {
    loopback::install()?;
    let mut channel = EventChannel::new()?;
    let client = resolve(&mut channel, 18502)?;

    client.connect(ConnectionParameter::default())?;
    let rejected = next_event(&mut channel, EventType::Rejected)?;
    assert!(Arc::ptr_eq(&rejected.cm_id().unwrap(), &client));
    // no listener on the port
    assert_eq!(rejected.status(), 8);

    // nothing else is queued
    assert!(channel.get_cm_event_timeout(Some(Duration::from_millis(20))).is_err());
    Ok(())
}
