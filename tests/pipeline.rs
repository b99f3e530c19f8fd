use bulklog::memory::MemorySink;
use bulklog::record::{Level, LogRecord};
use bulklog::shipper::{LogShipper, ShipperOptions};
use std::sync::Arc;
use tokio::time::Duration;

fn start(sink: &MemorySink, options: ShipperOptions) -> LogShipper {
    LogShipper::start(Arc::new(sink.clone()), options)
}

#[tokio::test(start_paused = true)]
async fn single_producer_order_is_preserved_through_the_sink() {
    let sink = MemorySink::new();
    let shipper = start(&sink, ShipperOptions::new("logs"));
    for i in 0..100 {
        shipper.submit(LogRecord::new(Level::Information, "svc", format!("m{i}"))).await;
    }
    shipper.shutdown().await;

    let texts: Vec<String> = sink.committed().iter().map(|s| s.record.text.clone()).collect();
    let expected: Vec<String> = (0..100).map(|i| format!("m{i}")).collect();
    assert_eq!(texts, expected);
}

#[tokio::test(start_paused = true)]
async fn overload_sheds_low_severity_before_high() {
    // Slow drain, tiny queue: the pipeline has to drop. Equal offered load
    // per severity; Error's longer backpressure wait must buy it more
    // survivors than Information's.
    let sink = MemorySink::new().with_write_delay(Duration::from_millis(5));
    let options = ShipperOptions {
        queue_capacity: 4,
        idle_timeout: Duration::from_millis(5),
        ..ShipperOptions::new("logs")
    };
    let shipper = start(&sink, options);
    for i in 0..50 {
        shipper.submit(LogRecord::new(Level::Error, "load", format!("e{i}"))).await;
        shipper.submit(LogRecord::new(Level::Information, "load", format!("i{i}"))).await;
    }
    shipper.shutdown().await;

    assert!(shipper.metrics().dropped > 0, "load must actually exceed capacity");
    let committed = sink.committed();
    let errors = committed.iter().filter(|s| s.record.level == Level::Error).count();
    let infos = committed.iter().filter(|s| s.record.level == Level::Information).count();
    assert!(
        errors >= infos,
        "high severity should survive at least as often: {errors} errors vs {infos} infos"
    );
}

#[tokio::test(start_paused = true)]
async fn round_trip_preserves_fields_and_attaches_expiration() {
    let sink = MemorySink::new();
    let options =
        ShipperOptions { retention: Duration::from_secs(3600), ..ShipperOptions::new("logs") };
    let shipper = start(&sink, options);
    shipper
        .submit(
            LogRecord::new(Level::Error, "svc.auth", "login failed").with_field("userId", 42),
        )
        .await;
    shipper.shutdown().await;

    let committed = sink.committed();
    assert_eq!(committed.len(), 1);
    let stored = &committed[0];
    assert_eq!(stored.record.level, Level::Error);
    assert_eq!(stored.record.category, "svc.auth");
    assert_eq!(stored.record.text, "login failed");
    assert_eq!(stored.record.fields["userId"], serde_json::json!(42));

    // Expiration is write metadata: write-time plus retention, within a
    // small tolerance for the time between submit and commit.
    let offset = stored.expires_at - stored.record.timestamp;
    assert!((offset - chrono::Duration::seconds(3600)).num_seconds().abs() <= 5);
}

#[tokio::test(start_paused = true)]
async fn write_failures_below_the_budget_still_commit() {
    let sink = MemorySink::new();
    sink.fail_next_writes(3);
    let shipper = start(&sink, ShipperOptions::new("logs"));
    for i in 0..5 {
        shipper.submit(LogRecord::new(Level::Warning, "svc", format!("w{i}"))).await;
    }
    shipper.shutdown().await;

    assert_eq!(sink.committed().len(), 5);
    assert_eq!(shipper.metrics().abandoned, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_target_stops_ingestion_permanently() {
    let sink = MemorySink::new();
    sink.set_missing_target(true);
    let shipper = start(&sink, ShipperOptions::new("gone"));
    shipper.submit(LogRecord::new(Level::Information, "svc", "never lands")).await;

    // The worker stops on its own; give its timers room to run.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let dropped_before = shipper.metrics().dropped;
    shipper.submit(LogRecord::new(Level::Critical, "svc", "still a noop")).await;
    assert_eq!(shipper.metrics().dropped, dropped_before + 1);

    shipper.shutdown().await;
    assert!(sink.committed().is_empty());
    assert!(shipper.metrics().abandoned >= 1, "the accepted record must be reported, not lost");
}

#[tokio::test]
async fn concurrent_shutdown_loses_no_accepted_record() {
    let sink = MemorySink::new();
    let shipper = start(&sink, ShipperOptions::new("logs"));
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let shipper = shipper.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    shipper
                        .submit(LogRecord::new(Level::Information, "load", format!("p{p}-{i}")))
                        .await;
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(2)).await;
    shipper.shutdown().await;
    for producer in producers {
        producer.await.expect("producer");
    }

    // Every record the queue accepted is either committed or reported;
    // with a healthy sink that means committed, exactly once.
    let metrics = shipper.metrics();
    assert_eq!(metrics.abandoned, 0);
    assert_eq!(sink.committed().len() as u64, metrics.enqueued);
}
