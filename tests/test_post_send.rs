mod common;

use std::io::IoSlice;

use verbway::ibverbs::completion::{GenericCompletionQueue, WorkCompletionOperationType, WorkCompletionStatus};
use verbway::ibverbs::memory_region::MemoryRegion;
use verbway::ibverbs::queue_pair::{
    GenericQueuePair, PostSendError, PostSendErrorKind, PostSendGuard, QueuePair, SetInlineData,
    SetScatterGatherEntry, WorkRequestFlags,
};
use verbway::ibverbs::{loopback, AccessFlags};

use common::{bring_up, context, drain};
use proptest::prelude::*;
use rstest::rstest;

#[rstest]
#[case(true, true)]
#[case(false, true)]
#[case(true, false)]
#[case(false, false)]
fn main(#[case] use_qp_ex: bool, #[case] use_cq_ex: bool) -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut send_data: Vec<u8> = vec![0; 64];
    let mut recv_data: Vec<u8> = vec![0; 64];
    let mr = unsafe {
        pd.reg_mr(
            send_data.as_mut_ptr() as _,
            send_data.len(),
            AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
        )?
    };
    let recv_mr = unsafe {
        pd.reg_mr(
            recv_data.as_mut_ptr() as _,
            recv_data.len(),
            AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
        )?
    };

    let mut cq_builder = ctx.create_cq_builder();
    cq_builder.setup_cqe(128);
    let mut sq: GenericCompletionQueue = if use_cq_ex {
        cq_builder.build_ex()?.into()
    } else {
        cq_builder.build()?.into()
    };
    let mut rq: GenericCompletionQueue = if use_cq_ex {
        cq_builder.build_ex()?.into()
    } else {
        cq_builder.build()?.into()
    };

    let mut builder = pd.create_qp_builder();
    builder
        .setup_max_inline_data(128)
        .setup_send_cq(sq.clone())
        .setup_recv_cq(rq.clone());
    let mut qp: GenericQueuePair = if use_qp_ex {
        builder.build_ex()?.into()
    } else {
        builder.build()?.into()
    };
    assert_eq!(qp.is_extended(), use_qp_ex);

    // loop the queue pair back to itself
    let qp_num = qp.qp_number();
    bring_up(&ctx, &mut qp, qp_num);

    let mut guard = qp.start_post_recv();
    let recv_handle = guard.construct_wr(114514);
    unsafe { recv_handle.setup_sge(recv_mr.lkey(), recv_data.as_mut_ptr() as _, recv_data.len() as _) };
    guard.post()?;

    let mut guard = qp.start_post_send();
    let buf = vec![0, 1, 2, 3];
    guard
        .construct_wr(233, WorkRequestFlags::Signaled)
        .setup_write(mr.rkey(), mr.get_ptr() as _)
        .setup_inline_data(&buf);
    // the inline buffer is copied when it is set up
    drop(buf);

    let buf = vec![b"Hello".to_vec(), b"RDMA".to_vec()];
    guard
        .construct_wr(234, WorkRequestFlags::Signaled)
        .setup_write(mr.rkey(), mr.get_ptr() as u64 + 4)
        .setup_inline_data_list(&[IoSlice::new(&buf[0]), IoSlice::new(&buf[1])]);
    guard
        .construct_wr(567, WorkRequestFlags::Signaled)
        .setup_send()
        .setup_inline_data_list(&[IoSlice::new(&buf[0]), IoSlice::new(&buf[1])]);
    drop(buf);
    guard.post()?;

    let completions = drain(&mut sq);
    let ids: Vec<_> = completions.iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, [233, 234, 567]);
    assert!(completions.iter().all(|wc| wc.status == WorkCompletionStatus::Success));
    assert_eq!(completions[0].opcode, WorkCompletionOperationType::Write);
    assert_eq!(completions[2].opcode, WorkCompletionOperationType::Send);
    assert_eq!(&send_data[..13], b"\x00\x01\x02\x03HelloRDMA");

    let completions = drain(&mut rq);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].wr_id, 114514);
    assert_eq!(completions[0].opcode, WorkCompletionOperationType::Receive);
    assert_eq!(completions[0].byte_len, 9);
    assert_eq!(completions[0].qp_num, qp_num);
    assert_eq!(&recv_data[..9], b"HelloRDMA");
    Ok(())
}

/// Copy byte `i` of `local` to byte `i` of `remote`.
fn stage_write<G: PostSendGuard>(guard: &mut G, i: usize, local: &MemoryRegion, remote: &MemoryRegion) {
    unsafe {
        guard
            .construct_wr(i as u64, WorkRequestFlags::Signaled)
            .setup_write(remote.rkey(), remote.get_ptr() as u64 + i as u64)
            .setup_sge(local.lkey(), local.get_ptr() as u64 + i as u64, 1);
    }
}

/// Post `count` signaled writes of one byte each, either one post per request or all of them in
/// one batch. Returns the remote buffer, the completed ids and the number of submission calls.
fn post_writes(use_qp_ex: bool, count: usize, batched: bool) -> anyhow::Result<(Vec<u8>, Vec<u64>, u64)> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut local: Vec<u8> = (1..=count as u8).collect();
    let mut remote = vec![0u8; count];
    let local_mr = unsafe { pd.reg_mr(local.as_mut_ptr() as _, local.len(), AccessFlags::LocalWrite)? };
    let remote_mr = unsafe {
        pd.reg_mr(
            remote.as_mut_ptr() as _,
            remote.len(),
            AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
        )?
    };

    let mut cq = ctx.create_cq_builder().setup_cqe(count as u32).build_generic()?;
    let mut builder = pd.create_qp_builder();
    builder
        .setup_max_send_wr(count as u32)
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq.clone());
    let mut qp: GenericQueuePair = if use_qp_ex {
        builder.build_ex()?.into()
    } else {
        builder.build()?.into()
    };
    let qp_num = qp.qp_number();
    bring_up(&ctx, &mut qp, qp_num);

    let before = loopback::submission_calls(qp_num);
    if batched {
        let mut guard = qp.start_post_send();
        for i in 0..count {
            stage_write(&mut guard, i, &local_mr, &remote_mr);
        }
        guard.post()?;
    } else {
        for i in 0..count {
            let mut guard = qp.start_post_send();
            stage_write(&mut guard, i, &local_mr, &remote_mr);
            guard.post()?;
        }
    }
    let calls = loopback::submission_calls(qp_num) - before;

    let completions = drain(&mut cq);
    assert!(completions.iter().all(|wc| wc.status == WorkCompletionStatus::Success));
    let ids = completions.iter().map(|wc| wc.wr_id).collect();
    drop(qp);
    Ok((remote, ids, calls))
}

#[rstest]
fn test_batch_and_individual_posts_have_the_same_effect(#[values(true, false)] use_qp_ex: bool) -> anyhow::Result<()> {
    const CAPACITY: usize = 8;
    let (single_remote, single_ids, single_calls) = post_writes(use_qp_ex, CAPACITY, false)?;
    let (batch_remote, batch_ids, batch_calls) = post_writes(use_qp_ex, CAPACITY, true)?;

    let expected: Vec<u64> = (0..CAPACITY as u64).collect();
    assert_eq!(single_ids, expected);
    assert_eq!(batch_ids, expected);
    assert_eq!(single_remote, batch_remote);
    assert_eq!(batch_remote, (1..=CAPACITY as u8).collect::<Vec<_>>());

    assert_eq!(single_calls, CAPACITY as u64);
    assert_eq!(batch_calls, 1);
    Ok(())
}

#[rstest]
#[case::chained_post_send(false, 4)]
#[case::all_or_nothing(true, 0)]
fn test_overflowing_batch_reports_accepted(#[case] use_qp_ex: bool, #[case] accepted: usize) -> anyhow::Result<()> {
    let ctx = context();
    let pd = ctx.alloc_pd()?;
    let mut memory = vec![0u8; 8];
    let mr = unsafe {
        pd.reg_mr(
            memory.as_mut_ptr() as _,
            memory.len(),
            AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
        )?
    };
    let mut cq = ctx.create_cq_builder().build_generic()?;
    let mut builder = pd.create_qp_builder();
    builder
        .setup_max_send_wr(4)
        .setup_send_cq(cq.clone())
        .setup_recv_cq(cq.clone());
    let mut qp: GenericQueuePair = if use_qp_ex {
        builder.build_ex()?.into()
    } else {
        builder.build()?.into()
    };
    let qp_num = qp.qp_number();
    bring_up(&ctx, &mut qp, qp_num);

    let mut guard = qp.start_post_send();
    for i in 0..6 {
        unsafe {
            guard
                .construct_wr(i, WorkRequestFlags::Signaled)
                .setup_write(mr.rkey(), mr.get_ptr() as u64)
                .setup_sge(mr.lkey(), mr.get_ptr() as u64 + 4, 4);
        }
    }
    match guard.post() {
        Err(PostSendError {
            accepted: n,
            source: PostSendErrorKind::NotEnoughResources(_),
        }) => assert_eq!(n, accepted),
        other => panic!("Expected NotEnoughResources error, got: {other:?}"),
    }

    // exactly the accepted prefix completes, so a retry knows where to resume
    let ids: Vec<_> = drain(&mut cq).iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, (0..accepted as u64).collect::<Vec<_>>());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_completions_are_the_signaled_subset_in_post_order(
        signaled in prop::collection::vec(any::<bool>(), 1..16),
        use_qp_ex in any::<bool>(),
    ) {
        let ctx = context();
        let pd = ctx.alloc_pd().unwrap();
        let mut memory = vec![0u8; 64];
        let mr = unsafe {
            pd.reg_mr(memory.as_mut_ptr() as _, memory.len(), AccessFlags::LocalWrite | AccessFlags::RemoteWrite)
                .unwrap()
        };
        let mut cq = ctx.create_cq_builder().build_generic().unwrap();
        let mut builder = pd.create_qp_builder();
        builder
            .setup_max_send_wr(32)
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq.clone());
        let mut qp: GenericQueuePair = if use_qp_ex {
            builder.build_ex().unwrap().into()
        } else {
            builder.build().unwrap().into()
        };
        let qp_num = qp.qp_number();
        bring_up(&ctx, &mut qp, qp_num);

        let mut guard = qp.start_post_send();
        for (i, &signaled) in signaled.iter().enumerate() {
            let flags = if signaled { WorkRequestFlags::Signaled } else { WorkRequestFlags::none() };
            // wr_ids are not sequential, only echoed back
            unsafe {
                guard
                    .construct_wr(0xdead_0000 + i as u64 * 7, flags)
                    .setup_write(mr.rkey(), mr.get_ptr() as u64 + 32)
                    .setup_sge(mr.lkey(), mr.get_ptr() as u64, 8);
            }
        }
        guard.post().unwrap();

        let expected: Vec<u64> = signaled
            .iter()
            .enumerate()
            .filter(|(_, &signaled)| signaled)
            .map(|(i, _)| 0xdead_0000 + i as u64 * 7)
            .collect();
        let ids: Vec<u64> = drain(&mut cq).iter().map(|wc| wc.wr_id).collect();
        prop_assert_eq!(ids, expected);
    }
}
