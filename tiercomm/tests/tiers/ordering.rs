use tiercomm::device::sim::{StreamOp, TraceEvent};
use tiercomm::DeviceStream;

use super::helpers::run_tiers;

fn ops(trace: &[TraceEvent]) -> Vec<StreamOp> {
    trace.iter().map(|e| e.op.clone()).collect()
}

#[tokio::test]
async fn test_allreduce_is_ordered_after_compute_stream() {
    run_tiers(2, 2, |r| async move {
        let dev = r.device();
        let buf = dev.upload(&[1.0f32, 2.0]);
        dev.clear_trace();

        r.state
            .allreduce(&buf.tensor(vec![2]), true, None)
            .await
            .unwrap();

        let trace = dev.trace();
        let marker = match trace[0].op {
            StreamOp::RecordMarker(m) => m,
            ref other => panic!("expected marker first, got {other:?}"),
        };
        assert_eq!(
            ops(&trace),
            vec![
                StreamOp::RecordMarker(marker),
                StreamOp::WaitMarker(marker),
                StreamOp::ReleaseMarker(marker),
                StreamOp::Collective("allreduce"),
                StreamOp::DivScalar {
                    count: 2,
                    divisor: 2
                },
                StreamOp::SynchronizeDevice,
            ]
        );

        let compute = r.state.compute_stream().raw_handle();
        let comm = r.state.comm_stream().raw_handle();
        assert_ne!(compute, comm);
        assert_eq!(trace[0].stream, compute);
        assert_eq!(trace[2].stream, compute);
        for e in &trace[1..] {
            if e.stream != compute {
                assert_eq!(e.stream, comm);
            }
        }
        assert_eq!(dev.live_markers(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_coalesced_copies_follow_the_wait() {
    run_tiers(2, 1, |r| async move {
        let dev = r.device();
        let a = dev.upload(&[1i32]);
        let b = dev.upload(&[2i32, 3]);
        dev.clear_trace();

        r.state
            .broadcast_coalesced(&[a.tensor(vec![1]), b.tensor(vec![2])], 0, None)
            .await
            .unwrap();

        let got = ops(&dev.trace());
        assert!(matches!(got[0], StreamOp::RecordMarker(_)));
        assert!(matches!(got[1], StreamOp::WaitMarker(_)));
        assert!(matches!(got[2], StreamOp::ReleaseMarker(_)));
        assert_eq!(
            got[3..],
            [
                StreamOp::Alloc { bytes: 12 },
                StreamOp::Copy { bytes: 4 },
                StreamOp::Copy { bytes: 8 },
                StreamOp::Collective("broadcast"),
                StreamOp::Copy { bytes: 4 },
                StreamOp::Copy { bytes: 8 },
                StreamOp::SynchronizeDevice,
            ]
        );
    })
    .await;
}
