mod common;

use std::net::Ipv6Addr;
use std::sync::Arc;

use verbway::ibverbs::address::{AddressHandleAttribute, Gid};
use verbway::ibverbs::completion::{
    DestroyCompletionQueueErrorKind, GenericCompletionQueue, WorkCompletionOperationType, WorkCompletionStatus,
};
use verbway::ibverbs::device_context::{CloseDeviceErrorKind, Mtu};
use verbway::ibverbs::memory_region::DeregisterMemoryRegionErrorKind;
use verbway::ibverbs::protection_domain::DeallocProtectionDomainErrorKind;
use verbway::ibverbs::qp_state::TransitionError;
use verbway::ibverbs::queue_pair::{
    GenericQueuePair, ModifyQueuePairErrorKind, PostSendGuard, QueuePair, QueuePairAttribute,
    QueuePairAttributeMask, QueuePairState, SetScatterGatherEntry, WorkRequestFlags,
};
use verbway::ibverbs::{loopback, AccessFlags};

use common::{bring_up, context, drain, init_attr, remote_access, rtr_attr, rts_attr};
use rstest::rstest;

#[test]
fn test_reverse_dependency_order_teardown() -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut memory = vec![0u8; 64];
    let mr = unsafe { pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), AccessFlags::LocalWrite)? };
    let cq = ctx.create_cq_builder().build_generic()?;
    let qp = pd
        .create_qp_builder()
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq.clone())
        .build_generic()?;

    // the queue pair keeps the domain and the completion queue alive, which keep the context
    let CloseDeviceErrorKind::InUse { shares, context: ctx } = ctx.close().unwrap_err().0 else {
        panic!("expected InUse");
    };
    assert_eq!(shares, 2);

    let DeallocProtectionDomainErrorKind::InUse { shares, domain: pd } = pd.dealloc().unwrap_err().0 else {
        panic!("expected InUse");
    };
    // the memory region and the queue pair
    assert_eq!(shares, 2);

    let DestroyCompletionQueueErrorKind::InUse { shares, cq } = cq.destroy().unwrap_err().0 else {
        panic!("expected InUse");
    };
    // send and receive side of the queue pair
    assert_eq!(shares, 2);

    qp.destroy()?;
    mr.deregister()?;
    cq.destroy()?;
    pd.dealloc()?;
    ctx.close()?;
    Ok(())
}

#[rstest]
#[case::basic(false, false)]
#[case::extended_qp(true, false)]
#[case::extended(true, true)]
fn test_in_flight_region_defers_release(#[case] use_qp_ex: bool, #[case] use_cq_ex: bool) -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut memory = vec![0u8; 16];
    let mr = unsafe { pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), remote_access())? };
    let builder = ctx.create_cq_builder();
    let mut cq: GenericCompletionQueue = if use_cq_ex { builder.build_ex()?.into() } else { builder.build()?.into() };
    let mut builder = pd.create_qp_builder();
    builder.setup_send_cq(cq.clone()).setup_recv_cq(cq.clone());
    let mut qp: GenericQueuePair = if use_qp_ex { builder.build_ex()?.into() } else { builder.build()?.into() };
    let qp_num = qp.qp_number();
    bring_up(&ctx, &mut qp, qp_num);

    let mut guard = qp.start_post_send();
    guard
        .construct_wr(1, WorkRequestFlags::Signaled)
        .setup_write(mr.rkey(), mr.iova() + 8)
        .setup_sge_from(&mr, 0, 8)?;
    guard.post()?;

    // the queue pair holds the only other share until the completion is polled
    let DeregisterMemoryRegionErrorKind::InUse { shares, region } = mr.deregister().unwrap_err().0 else {
        panic!("expected InUse");
    };
    assert_eq!(shares, 1);

    let completions = drain(&mut cq);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].status, WorkCompletionStatus::Success);

    region.deregister()?;
    Ok(())
}

#[test]
fn test_later_completion_releases_unsignaled_request() -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut memory = vec![0u8; 32];
    let mr = unsafe { pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), remote_access())? };
    let mut cq = ctx.create_cq_builder().build_generic()?;
    let mut qp = pd
        .create_qp_builder()
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq.clone())
        .build_generic()?;
    let qp_num = qp.qp_number();
    bring_up(&ctx, &mut qp, qp_num);

    let mut guard = qp.start_post_send();
    guard
        .construct_wr(1, WorkRequestFlags::none())
        .setup_write(mr.rkey(), mr.iova() + 16)
        .setup_sge_from(&mr, 0, 8)?;
    guard.post()?;
    assert_eq!(Arc::strong_count(&mr), 2);

    // set up from raw keys, its completion still tells the first request is done
    let mut guard = qp.start_post_send();
    unsafe {
        guard
            .construct_wr(2, WorkRequestFlags::Signaled)
            .setup_write(mr.rkey(), mr.iova() + 24)
            .setup_sge(mr.lkey(), mr.iova() + 8, 8);
    }
    guard.post()?;

    let completions = drain(&mut cq);
    assert_eq!(completions.iter().map(|wc| wc.wr_id).collect::<Vec<_>>(), [2]);
    assert_eq!(Arc::strong_count(&mr), 1);
    mr.deregister()?;
    Ok(())
}

#[test]
fn test_destroyed_queue_pair_releases_posted_regions() -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut memory = vec![0u8; 16];
    let mr = unsafe { pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), AccessFlags::LocalWrite)? };
    let cq = ctx.create_cq_builder().build_generic()?;
    let mut qp = pd
        .create_qp_builder()
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq.clone())
        .build_generic()?;
    qp.modify(&init_attr())?;

    let mut guard = qp.start_post_recv();
    guard.construct_wr(1).setup_sge_from(&mr, 0, 16)?;
    guard.post()?;
    assert_eq!(Arc::strong_count(&mr), 2);

    qp.destroy()?;
    mr.deregister()?;
    Ok(())
}

#[test]
fn test_region_range_is_checked() -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut memory = vec![0u8; 16];
    let mr = unsafe { pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), AccessFlags::LocalWrite)? };
    let cq = ctx.create_cq_builder().build_generic()?;
    let mut qp = pd
        .create_qp_builder()
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq)
        .build_generic()?;
    qp.modify(&init_attr())?;

    let mut guard = qp.start_post_recv();
    let err = guard.construct_wr(1).setup_sge_from(&mr, 12, 8).unwrap_err();
    assert_eq!((err.offset, err.len, err.region_len), (12, 8, 16));
    drop(guard);

    // nothing was pinned by the rejected entry
    assert_eq!(Arc::strong_count(&mr), 1);
    Ok(())
}

#[test]
fn test_state_walk_and_query() -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let cq = ctx.create_cq_builder().build_generic()?;
    let mut qp = pd
        .create_qp_builder()
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq)
        .build_generic()?;
    assert_eq!(qp.state(), QueuePairState::Reset);

    qp.modify(&init_attr())?;
    assert_eq!(qp.state(), QueuePairState::Init);
    qp.modify(&rtr_attr(&ctx, 0x4242))?;
    assert_eq!(qp.state(), QueuePairState::ReadyToReceive);
    qp.modify(&rts_attr())?;
    assert_eq!(qp.state(), QueuePairState::ReadyToSend);

    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::SendQueueDrain);
    qp.modify(&attr)?;
    assert_eq!(qp.state(), QueuePairState::SendQueueDrain);

    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::ReadyToSend).setup_min_rnr_timer(12);
    qp.modify(&attr)?;

    let (attr, _) = qp.query(QueuePairAttributeMask::State | QueuePairAttributeMask::DestinationQueuePairNumber)?;
    assert_eq!(attr.state(), QueuePairState::ReadyToSend);
    assert_eq!(attr.dest_qp_num(), 0x4242);

    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::Error);
    qp.modify(&attr)?;
    assert_eq!(qp.state(), QueuePairState::Error);

    // error is left only through reset
    assert!(matches!(
        qp.modify(&init_attr()).unwrap_err().0,
        ModifyQueuePairErrorKind::Transition(TransitionError::InvalidTransition {
            cur_state: QueuePairState::Error,
            next_state: QueuePairState::Init,
        })
    ));
    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::Reset);
    qp.modify(&attr)?;
    assert_eq!(qp.state(), QueuePairState::Reset);
    qp.modify(&init_attr())?;
    Ok(())
}

#[rstest]
#[case::source_index_outside_table(7, Gid::from(Ipv6Addr::from([0xfe80, 0, 0, 0, 0x0202, 0xc9ff, 0xfe00, 0x0001])))]
#[case::destination_not_local(1, Gid::from(Ipv6Addr::from([0xfd00, 0, 0, 0, 0, 0, 0, 0x42])))]
fn test_route_timeout_is_distinguishable_from_mask_errors(
    #[case] sgid_index: u8, #[case] dest_gid: Gid,
) -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let cq = ctx.create_cq_builder().build_generic()?;
    let mut qp = pd
        .create_qp_builder()
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq)
        .build_generic()?;
    qp.modify(&init_attr())?;

    let mut ah_attr = AddressHandleAttribute::new();
    ah_attr
        .setup_port(1)
        .setup_grh_src_gid_index(sgid_index)
        .setup_grh_dest_gid(&dest_gid)
        .setup_grh_hop_limit(64);
    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::ReadyToReceive)
        .setup_path_mtu(Mtu::Mtu1024)
        .setup_dest_qp_num(0x4242)
        .setup_rq_psn(1)
        .setup_max_dest_read_atomic(1)
        .setup_min_rnr_timer(12)
        .setup_address_vector(&ah_attr);

    match qp.modify(&attr).unwrap_err().0 {
        ModifyQueuePairErrorKind::ResolveRouteTimedout {
            sgid_index: index,
            gid,
            source,
        } => {
            assert_eq!(index, sgid_index);
            assert_eq!(gid, dest_gid);
            assert_eq!(source.raw_os_error(), Some(libc::ETIMEDOUT));
        },
        other => panic!("Expected ResolveRouteTimedout, got: {other:?}"),
    }
    assert_eq!(qp.state(), QueuePairState::Init);

    // the same transition without a path MTU never reaches the device
    let before = loopback::modify_calls(qp.qp_number());
    let mut attr = QueuePairAttribute::new();
    attr.setup_state(QueuePairState::ReadyToReceive)
        .setup_dest_qp_num(0x4242)
        .setup_rq_psn(1)
        .setup_max_dest_read_atomic(1)
        .setup_min_rnr_timer(12)
        .setup_address_vector(&ah_attr);
    match qp.modify(&attr).unwrap_err().0 {
        ModifyQueuePairErrorKind::Transition(TransitionError::InvalidAttributeMask { invalid, needed, .. }) => {
            assert_eq!(invalid, QueuePairAttributeMask::none());
            assert_eq!(needed, QueuePairAttributeMask::PathMtu);
        },
        other => panic!("Expected InvalidAttributeMask, got: {other:?}"),
    }
    assert_eq!(loopback::modify_calls(qp.qp_number()), before);
    Ok(())
}

#[test]
fn test_failed_completion_moves_queue_pair_to_error() -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut memory = vec![0u8; 16];
    let mr = unsafe { pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), remote_access())? };
    let mut cq = ctx.create_cq_builder().build_generic()?;
    let mut qp = pd
        .create_qp_builder()
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq.clone())
        .build_generic()?;
    let qp_num = qp.qp_number();
    bring_up(&ctx, &mut qp, qp_num);

    let mut guard = qp.start_post_recv();
    unsafe { guard.construct_wr(10).setup_sge(mr.lkey(), mr.get_ptr() as u64, 8) };
    guard.post()?;

    // an rkey nobody registered
    let mut guard = qp.start_post_send();
    unsafe {
        guard
            .construct_wr(1, WorkRequestFlags::Signaled)
            .setup_write(mr.rkey() ^ 0xffff, mr.get_ptr() as u64)
            .setup_sge(mr.lkey(), mr.get_ptr() as u64 + 8, 8);
    }
    guard.post()?;

    let completions = drain(&mut cq);
    assert_eq!(completions[0].wr_id, 1);
    assert_eq!(completions[0].status, WorkCompletionStatus::RemoteAccessError);
    assert_eq!(completions[0].opcode, WorkCompletionOperationType::Write);
    // the pending receive is flushed
    assert_eq!(completions[1].wr_id, 10);
    assert_eq!(completions[1].status, WorkCompletionStatus::WorkRequestFlushedError);

    let (attr, _) = qp.query(QueuePairAttributeMask::State)?;
    assert_eq!(attr.state(), QueuePairState::Error);
    assert_eq!(qp.state(), QueuePairState::Error);

    // later requests are flushed, signaled or not
    let mut guard = qp.start_post_send();
    unsafe {
        guard
            .construct_wr(2, WorkRequestFlags::none())
            .setup_write(mr.rkey(), mr.get_ptr() as u64)
            .setup_sge(mr.lkey(), mr.get_ptr() as u64 + 8, 8);
    }
    guard.post()?;
    let completions = drain(&mut cq);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].wr_id, 2);
    assert_eq!(completions[0].status, WorkCompletionStatus::WorkRequestFlushedError);
    Ok(())
}
