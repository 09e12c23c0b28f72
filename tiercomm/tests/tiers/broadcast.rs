use tiercomm::TierCommError;

use super::helpers::run_tiers;

#[tokio::test]
async fn test_broadcast_from_root_0() {
    run_tiers(4, 2, |r| async move {
        let rank = r.rank();
        let init: Vec<f32> = if rank == 0 {
            vec![42.0, 43.0, 44.0, 45.0]
        } else {
            vec![0.0; 4]
        };
        let buf = r.device().upload(&init);

        r.state.broadcast(&buf.tensor(vec![4]), 0, None).await.unwrap();

        assert_eq!(
            buf.read::<f32>(),
            vec![42.0, 43.0, 44.0, 45.0],
            "rank {rank} broadcast failed"
        );
    })
    .await;
}

#[tokio::test]
async fn test_broadcast_from_nonzero_root() {
    run_tiers(4, 2, |r| async move {
        let rank = r.rank();
        let root = 3;
        let buf = r.device().upload(&[rank as i64 * 100, -1]);

        r.state
            .broadcast(&buf.tensor(vec![2]), root, None)
            .await
            .unwrap();

        assert_eq!(buf.read::<i64>(), vec![300, -1], "rank {rank}");
    })
    .await;
}

#[tokio::test]
async fn test_broadcast_within_each_node() {
    run_tiers(4, 2, |r| async move {
        let node = r.state.topology().node_index();
        let value = if r.state.topology().intra_rank() == 0 {
            (node + 1) as u32 * 10
        } else {
            0
        };
        let buf = r.device().upload(&[value; 3]);

        let intra = r.state.intranode_communicator();
        r.state
            .broadcast(&buf.tensor(vec![3]), 0, Some(intra))
            .await
            .unwrap();

        let expected = (node + 1) * 10;
        assert_eq!(buf.read::<u32>(), vec![expected; 3], "rank {}", r.rank());
    })
    .await;
}

#[tokio::test]
async fn test_broadcast_coalesced_scattered_tensors() {
    run_tiers(3, 3, |r| async move {
        let dev = r.device();
        let is_root = r.rank() == 1;
        let a = dev.upload(&if is_root { [1.0f64, 2.0] } else { [0.0; 2] });
        let b = dev.upload(&if is_root { [3.0f64, 4.0, 5.0, 6.0] } else { [0.0; 4] });
        let tensors = vec![a.tensor(vec![2]), b.tensor(vec![2, 2])];

        r.state
            .broadcast_coalesced(&tensors, 1, None)
            .await
            .unwrap();

        assert_eq!(a.read::<f64>(), vec![1.0, 2.0]);
        assert_eq!(b.read::<f64>(), vec![3.0, 4.0, 5.0, 6.0]);
    })
    .await;
}

#[tokio::test]
async fn test_broadcast_rejects_root_out_of_range() {
    run_tiers(2, 1, |r| async move {
        let dev = r.device();
        let buf = dev.upload(&[0u8; 4]);
        dev.clear_trace();

        let err = r
            .state
            .broadcast(&buf.tensor(vec![4]), 2, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TierCommError::InvalidRoot { root: 2, size: 2 }));
        // Rejected before any device work.
        assert!(dev.trace().is_empty());
    })
    .await;
}
