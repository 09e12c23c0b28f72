use tiercomm::CommPurpose;

use super::helpers::run_tiers;

#[tokio::test]
async fn test_two_nodes_of_two() {
    run_tiers(4, 2, |r| async move {
        let rank = r.rank();
        let state = &r.state;

        let global = state.global_communicator();
        assert_eq!(global.purpose(), CommPurpose::Global);
        assert_eq!((global.rank(), global.size()), (rank, 4));

        let intra = state.intranode_communicator();
        assert_eq!((intra.rank(), intra.size()), (rank % 2, 2));
        assert_eq!(state.device_id(), (rank % 2) as usize);

        match state.internode_communicator() {
            Some(inter) => {
                assert!(rank == 0 || rank == 2, "rank {rank} should not be inter member");
                assert_eq!((inter.rank(), inter.size()), (rank / 2, 2));
            }
            None => assert!(rank == 1 || rank == 3, "rank {rank} should be inter member"),
        }
    })
    .await;
}

#[tokio::test]
async fn test_single_node_everyone_local() {
    run_tiers(3, 3, |r| async move {
        let intra = r.state.intranode_communicator();
        assert_eq!(intra.size(), 3);
        let inter = r.state.internode_communicator();
        assert_eq!(inter.is_some(), r.rank() == 0);
        if let Some(inter) = inter {
            assert_eq!(inter.size(), 1);
        }
    })
    .await;
}

#[tokio::test]
async fn test_one_rank_per_node() {
    run_tiers(3, 1, |r| async move {
        assert_eq!(r.state.intranode_communicator().size(), 1);
        let inter = r.state.internode_communicator().unwrap();
        assert_eq!((inter.rank(), inter.size()), (r.rank(), 3));
    })
    .await;
}
