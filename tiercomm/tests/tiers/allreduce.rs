use half::{bf16, f16};
use tiercomm::{DataType, Location, TensorRef, TierCommError};

use super::helpers::run_tiers;

#[tokio::test]
async fn test_allreduce_sum_global() {
    run_tiers(4, 2, |r| async move {
        let rank = r.rank() as i32;
        let buf = r.device().upload(&[rank, 1, rank * rank]);

        r.state
            .allreduce(&buf.tensor(vec![3]), false, None)
            .await
            .unwrap();

        assert_eq!(buf.read::<i32>(), vec![6, 4, 14], "rank {rank}");
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_average_of_ranks() {
    run_tiers(4, 2, |r| async move {
        let buf = r.device().upload(&[r.rank() as f32]);

        r.state
            .allreduce(&buf.tensor(vec![1]), true, None)
            .await
            .unwrap();

        assert_eq!(buf.read::<f32>(), vec![1.5], "rank {}", r.rank());
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_average_half_precision() {
    run_tiers(4, 2, |r| async move {
        let dev = r.device();
        let rank = r.rank() as f32;
        // rank * 2^-16 is subnormal in f16; the mean 1.5 * 2^-16 is too.
        let tiny = 2f32.powi(-16);
        let h = dev.upload(&[f16::from_f32(rank), f16::from_f32(rank * tiny)]);
        let b = dev.upload(&[bf16::from_f32(rank)]);

        r.state.allreduce(&h.tensor(vec![2]), true, None).await.unwrap();
        r.state.allreduce(&b.tensor(vec![1]), true, None).await.unwrap();

        let h: Vec<f32> = h.read::<f16>().into_iter().map(f16::to_f32).collect();
        assert_eq!(h, vec![1.5, 1.5 * tiny], "rank {}", r.rank());
        assert_eq!(b.read::<bf16>(), vec![bf16::from_f32(1.5)]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_per_tier() {
    run_tiers(4, 2, |r| async move {
        let dev = r.device();
        let rank = r.rank() as u64;

        let intra_buf = dev.upload(&[rank]);
        let intra = r.state.intranode_communicator();
        r.state
            .allreduce(&intra_buf.tensor(vec![1]), false, Some(intra))
            .await
            .unwrap();
        // Node 0 holds ranks {0, 1}, node 1 holds {2, 3}.
        let expected = if rank < 2 { 1 } else { 5 };
        assert_eq!(intra_buf.read::<u64>(), vec![expected]);

        if let Some(inter) = r.state.internode_communicator() {
            let inter_buf = dev.upload(&[rank + 1]);
            r.state
                .allreduce(&inter_buf.tensor(vec![1]), false, Some(inter))
                .await
                .unwrap();
            // Members are global ranks 0 and 2.
            assert_eq!(inter_buf.read::<u64>(), vec![1 + 3]);
        }
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_coalesced_average() {
    run_tiers(2, 2, |r| async move {
        let dev = r.device();
        let scale = (r.rank() + 1) as f64;
        let a = dev.upload(&[2.0 * scale, 4.0 * scale]);
        let b = dev.upload(&[6.0 * scale]);
        let tensors = vec![a.tensor(vec![2]), b.tensor(vec![1])];

        r.state
            .allreduce_coalesced(&tensors, true, None)
            .await
            .unwrap();

        // Mean of scale 1 and 2 is 1.5.
        assert_eq!(a.read::<f64>(), vec![3.0, 6.0]);
        assert_eq!(b.read::<f64>(), vec![9.0]);
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_coalesced_adjacent_tensors_in_place() {
    run_tiers(2, 1, |r| async move {
        let dev = r.device();
        let backing = dev.upload(&[1u32, 2, 3, 4, 5]);
        let tensors = vec![backing.tensor_at(0, vec![2]), backing.tensor_at(2, vec![3])];
        dev.clear_trace();

        r.state
            .allreduce_coalesced(&tensors, false, None)
            .await
            .unwrap();

        assert_eq!(backing.read::<u32>(), vec![2, 4, 6, 8, 10]);
        // Already contiguous: no scratch buffer, no copies.
        assert!(dev.trace().iter().all(|e| !matches!(
            e.op,
            tiercomm::device::sim::StreamOp::Alloc { .. } | tiercomm::device::sim::StreamOp::Copy { .. }
        )));
    })
    .await;
}

#[tokio::test]
async fn test_allreduce_preconditions() {
    run_tiers(1, 1, |r| async move {
        let dev = r.device();
        let ints = dev.upload(&[1i64, 2]);
        let floats = dev.upload(&[1.0f32]);
        dev.clear_trace();

        let err = r
            .state
            .allreduce(&ints.tensor(vec![2]), true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TierCommError::UnsupportedAverage(DataType::I64)));

        let host = [0f32; 2];
        let host_t = unsafe {
            TensorRef::from_raw_parts(host.as_ptr() as u64, vec![2], DataType::F32, Location::Host)
        };
        let err = r.state.allreduce(&host_t, false, None).await.unwrap_err();
        assert!(matches!(err, TierCommError::HostResidentTensor { index: 0, .. }));

        let err = r
            .state
            .allreduce_coalesced(&[floats.tensor(vec![1]), ints.tensor(vec![2])], false, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TierCommError::MixedDataTypes {
                index: 1,
                expected: DataType::F32,
                actual: DataType::I64
            }
        ));

        let foreign = tiercomm::device::sim::SimDevice::new(7).upload(&[1.0f32]);
        let err = r
            .state
            .allreduce(&foreign.tensor(vec![1]), false, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TierCommError::DeviceMismatch {
                expected: 0,
                actual: 7,
                ..
            }
        ));

        // Nothing reached the device.
        assert!(dev.trace().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_empty_coalesced_list_rejected() {
    run_tiers(2, 2, |r| async move {
        let dev = r.device();
        dev.clear_trace();
        let err = r.state.allreduce_coalesced(&[], true, None).await.unwrap_err();
        assert!(matches!(
            err,
            TierCommError::EmptyTensorList {
                operation: "allreduce_coalesced"
            }
        ));
        let err = r.state.broadcast_coalesced(&[], 0, None).await.unwrap_err();
        assert!(matches!(
            err,
            TierCommError::EmptyTensorList {
                operation: "broadcast_coalesced"
            }
        ));
        assert!(dev.trace().is_empty());
    })
    .await;
}
