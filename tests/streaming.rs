//! Tests for streaming runs and cancellation.

use anyhow::Result;
use ironframe::executor::SimulatedCluster;
use ironframe::metrics::names;
use ironframe::prelude::*;
use ironframe::testing::{FailingUdf, FlakyDataset, SumAllUdf, TileCounterUdf, ones_dataset, test_config};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};


fn slow_counter(delay_ms: u64) -> Arc<dyn Udf> {
    Arc::new(TileCounterUdf::new("tiles").with_delay(Duration::from_millis(delay_ms)))
}

fn tiles(snapshot: &Snapshot) -> u64 {
    snapshot.buffer("tiles", "tiles").unwrap().values::<u64>().unwrap()[0]
}

#[test]
fn test_snapshots_arrive_after_every_partition() -> Result<()> {
    for backend in [Backend::Local, Backend::Distributed] {
        let engine = Engine::new(EngineConfig {
            backend,
            ..test_config(2, 2)
        })?;
        let mut stream = engine.run_streaming(ones_dataset(&[16, 4], 1)?, vec![slow_counter(5)])?;
        let snapshots: Vec<Snapshot> = (&mut stream).collect::<ironframe::Result<_>>()?;

        assert_eq!(snapshots.len(), 8, "{backend:?}");
        for (i, snapshot) in snapshots.iter().enumerate() {
            // One tile per partition, so the count tracks the merged partitions.
            assert_eq!(snapshot.partitions_merged(), i + 1);
            assert_eq!(tiles(snapshot), i as u64 + 1);
            assert_approx_eq!(snapshot.progress(), (i + 1) as f64 / 8.0);
        }
        assert!(!snapshots[6].is_complete());
        assert!(snapshots[7].is_complete());
        // Early snapshots are not touched by later merges.
        assert_eq!(tiles(&snapshots[0]), 1);

        let last = stream.last_snapshot().map(tiles);
        let result = stream.finish()?;
        assert_eq!(last, Some(8));
        assert_eq!(tiles(&result), 8);
    }
    Ok(())
}

#[test]
fn test_last_snapshot_survives_a_failed_run() -> Result<()> {
    let engine = Engine::new(test_config(1, 2))?;
    let failing: Arc<dyn Udf> = Arc::new(FailingUdf::new("total", PartitionId::new(3)));
    let mut stream = engine.run_streaming(ones_dataset(&[8, 4], 1)?, vec![failing])?;

    let mut merged = 0;
    let err = loop {
        match stream.next() {
            Some(Ok(_)) => merged += 1,
            Some(Err(e)) => break e,
            None => panic!("run finished without the expected error"),
        }
    };
    assert!(matches!(err, EngineError::UdfUser { .. }), "{err}");
    assert!(stream.next().is_none());

    // A single worker runs the partitions in order.
    assert_eq!(merged, 3);
    let last = stream.last_snapshot().expect("three partitions were merged");
    assert_eq!(last.partitions_merged(), 3);
    assert_approx_eq!(last.buffer("total", "total")?.values::<f64>()?[0], 24.0);
    assert!(stream.finish().is_err());
    assert_eq!(engine.metrics().counter(names::RUNS_FAILED), Some(1));
    Ok(())
}

#[test]
fn test_cancel_stops_the_run() -> Result<()> {
    for backend in [Backend::Local, Backend::Distributed] {
        let engine = Engine::new(EngineConfig {
            backend,
            ..test_config(2, 1)
        })?;
        let mut stream = engine.run_streaming(ones_dataset(&[32, 4], 1)?, vec![slow_counter(20)])?;
        assert!(stream.run_id().to_string().starts_with("run-"));

        let first = stream.next().expect("at least one snapshot")?;
        assert_eq!(first.partitions_merged(), 1);
        stream.cancel();
        assert!(stream.next().is_none());
        assert_eq!(stream.last_snapshot().map(Snapshot::partitions_merged), Some(1));
        assert!(matches!(stream.finish(), Err(EngineError::Cancelled)));
        assert_eq!(engine.metrics().counter(names::PARTITIONS_MERGED), Some(1));
    }
    Ok(())
}

#[test]
fn test_cancel_reaches_the_cluster() -> Result<()> {
    let cluster = Arc::new(SimulatedCluster::new(2)?);
    let engine = Engine::builder(EngineConfig {
        backend: Backend::Distributed,
        ..test_config(2, 1)
    })
    .cluster(cluster.clone())
    .build()?;
    let mut stream = engine.run_streaming(ones_dataset(&[32, 4], 1)?, vec![slow_counter(20)])?;
    stream.next().expect("at least one snapshot")?;
    stream.cancel();

    let stats = cluster.stats();
    assert!(stats.cancel_requests >= 1);
    assert!(stats.submitted < 32);

    // Cancelled tasks are skipped or run out, and then forgotten.
    let deadline = Instant::now() + Duration::from_secs(10);
    while cluster.stats().in_flight > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }
    assert_eq!(cluster.stats().in_flight, 0);
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn test_dropping_the_stream_cancels_the_run() -> Result<()> {
    let dataset = FlakyDataset::new(ones_dataset(&[32, 4], 1)?).into_arc();
    let engine = Engine::new(test_config(2, 1))?;
    let mut stream = engine.run_streaming(dataset.clone(), vec![slow_counter(50)])?;
    stream.next().expect("at least one snapshot")?;
    drop(stream);

    let reads_at_drop = dataset.reads();
    sleep(Duration::from_millis(300));
    // Workers finish the partition in hand, then stop picking up new ones.
    assert!(dataset.reads() <= reads_at_drop + 2, "{} reads", dataset.reads());
    Ok(())
}

#[test]
fn test_streamed_result_matches_blocking_run() -> Result<()> {
    let engine = Engine::new(test_config(3, 3))?;
    let blocking = engine.run(ones_dataset(&[10, 3], 1)?, vec![SumAllUdf::arc("sum")])?;
    let streamed = engine
        .run_streaming(ones_dataset(&[10, 3], 1)?, vec![SumAllUdf::arc("sum")])?
        .finish()?;
    assert_eq!(
        blocking.buffer("sum", "total")?.values::<f64>()?,
        streamed.buffer("sum", "total")?.values::<f64>()?
    );
    assert_eq!(streamed.partitions_merged(), 4);
    Ok(())
}
