//! Property-based tests for drop accounting.
//!
//! Whatever the pool size, queue capacity, burst shape or transform
//! failures, every dispatch attempt must end up counted exactly once as
//! processed or dropped, and the queue never holds more than its capacity.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use proptest::prelude::*;
use strata_relay::metrics::PipelineMetrics;
use strata_relay::pool::{Dispatch, Transform, WorkerPool};
use strata_relay::queue::handoff_queue;

/// Fails for payloads whose first byte is in `fail_mask`.
fn masked_transform(fail_mask: u8) -> Arc<dyn Transform> {
    let t = move |payload: &[u8]| -> anyhow::Result<Bytes> {
        if payload[0] & fail_mask != 0 {
            anyhow::bail!("rejected");
        }
        Ok(Bytes::copy_from_slice(payload))
    };
    Arc::new(t)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_dispatch_is_counted_once(
        workers in 1usize..=4,
        capacity in 1usize..=8,
        bursts in prop::collection::vec(0usize..=16, 1..=8),
        fail_mask in any::<u8>(),
    ) {
        let metrics = Arc::new(PipelineMetrics::new(false));
        let (producer, consumer) = handoff_queue(capacity);
        let mut pool = WorkerPool::new(
            workers,
            masked_transform(fail_mask),
            producer,
            metrics.clone(),
        ).unwrap();

        let mut accepted = 0u64;
        let mut seq = 0u8;
        for burst in &bursts {
            for _ in 0..*burst {
                if pool.dispatch(Bytes::from(vec![seq])) == Dispatch::Accepted {
                    accepted += 1;
                }
                seq = seq.wrapping_add(1);
            }
            thread::yield_now();
        }
        pool.close().unwrap();

        let total: usize = bursts.iter().sum();
        let s = metrics.snapshot();
        prop_assert_eq!(s.dispatched, total as u64);
        prop_assert!(s.is_balanced(), "unbalanced: {:?}", s);
        prop_assert_eq!(s.dispatched - s.dropped_pool_full, accepted);
        prop_assert!(consumer.len() <= capacity);
        prop_assert_eq!(consumer.len() as u64, s.processed);
        prop_assert!(consumer.is_closed());
    }

    #[test]
    fn interval_counters_reset_on_take(
        processed in 0u64..200,
        dropped in 0u64..200,
    ) {
        let m = PipelineMetrics::new(true);
        for _ in 0..processed {
            m.record_dispatch();
            m.record_processed();
        }
        for _ in 0..dropped {
            m.record_dispatch();
            m.record_drop(strata_relay::metrics::DropReason::PoolFull);
        }
        prop_assert_eq!(m.take_interval(), (processed, dropped));
        prop_assert_eq!(m.take_interval(), (0, 0));
        prop_assert!(m.snapshot().is_balanced());
    }
}
