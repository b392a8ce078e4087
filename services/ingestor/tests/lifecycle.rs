//! Service lifecycle: startup load, bind failure, periodic and final flushes.

use chrono::{TimeDelta, Utc};
use fm_protocol::Record;
use fm_store::SharedTable;
use fm_test_utils::MockSensor;
use ingestor::config::{ListenConfig, ServiceConfig, StorageConfig};
use ingestor::retention::RetentionPolicy;
use ingestor::scheduler::FlushSchedule;
use ingestor::{IngestService, ServiceError};
use std::path::Path;
use std::time::Duration;

fn test_config(dir: &Path) -> ServiceConfig {
    ServiceConfig {
        listen: ListenConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            idle_timeout: Duration::from_millis(100),
            max_frame_bytes: 64 * 1024,
        },
        storage: StorageConfig {
            table_path: dir.join("freezer.csv"),
            lock_timeout: Duration::from_secs(5),
        },
        retention: RetentionPolicy::days(30, true),
        flush: FlushSchedule::Interval(Duration::from_secs(3600)),
    }
}

fn table_for(config: &ServiceConfig) -> SharedTable {
    SharedTable::new(&config.storage.table_path, Duration::from_secs(1))
}

fn recent(hours_ago: i64) -> String {
    (Utc::now() - TimeDelta::hours(hours_ago)).to_rfc3339()
}

#[tokio::test]
async fn startup_loads_existing_table_into_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let existing = vec![
        Record::new(recent(3), -18.0, 40.0),
        Record::new(recent(2), -17.0, 41.0),
    ];
    table_for(&config).store(&existing).unwrap();

    let service = IngestService::start(config).await.unwrap();
    assert_eq!(service.buffer().snapshot().await, existing);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn fresh_host_without_table_directory_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.storage.table_path = dir.path().join("freezer-monitor").join("freezer.csv");
    let table = table_for(&config);
    let service = IngestService::start(config).await.unwrap();
    assert!(service.buffer().is_empty().await);

    let mut sensor = MockSensor::connect(service.local_addr()).await.unwrap();
    let record = Record::new(recent(1), -18.0, 40.0);
    sensor.send_records(std::slice::from_ref(&record)).await.unwrap();
    sensor.send_end().await.unwrap();
    assert!(sensor.peer_closed(Duration::from_secs(2)).await);

    let report = service.shutdown().await.unwrap();
    assert_eq!(report.final_flush.rows, 1);
    assert_eq!(table.load().unwrap(), Some(vec![record]));
}

#[tokio::test]
async fn corrupt_table_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::write(&config.storage.table_path, "when,what\n1,2\n").unwrap();

    let result = IngestService::start(config).await;
    assert!(matches!(result, Err(ServiceError::Load(_))));
}

#[tokio::test]
async fn bind_collision_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config(dir.path());
    config.listen.port = holder.local_addr().unwrap().port();

    let result = IngestService::start(config).await;
    assert!(matches!(result, Err(ServiceError::Bind { .. })));
}

#[tokio::test]
async fn no_flush_happens_before_first_period() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let table_path = config.storage.table_path.clone();
    let service = IngestService::start(config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!table_path.exists(), "nothing should be written yet");
    assert_eq!(service.flush_status().get().await.succeeded, 0);

    service.shutdown().await.unwrap();
    assert!(table_path.exists(), "final flush writes the table");
}

#[tokio::test]
async fn periodic_flush_persists_buffered_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.flush = FlushSchedule::Interval(Duration::from_millis(200));
    let table = table_for(&config);
    let service = IngestService::start(config).await.unwrap();

    let mut sensor = MockSensor::connect(service.local_addr()).await.unwrap();
    let record = Record::new(recent(1), -19.5, 45.0);
    sensor.send_records(std::slice::from_ref(&record)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if matches!(table.load(), Ok(Some(ref rows)) if *rows == [record.clone()]) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "periodic flush never landed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = service.shutdown().await.unwrap();
    assert!(report.periodic_flushes >= 1);
}

#[tokio::test]
async fn stop_drains_open_connections_and_flushes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let table = table_for(&config);
    let service = IngestService::start(config).await.unwrap();

    // Sensor stays connected and never sends the end marker.
    let mut sensor = MockSensor::connect(service.local_addr()).await.unwrap();
    let records = vec![
        Record::new(recent(2), -18.0, 40.0),
        Record::new(recent(1), -18.5, 42.0),
    ];
    sensor.send_records(&records).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.buffer().len().await < 2 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let report = tokio::time::timeout(Duration::from_secs(3), service.shutdown())
        .await
        .expect("shutdown should finish within a few idle timeouts")
        .unwrap();
    assert_eq!(report.final_flush.rows, 2);
    assert_eq!(table.load().unwrap(), Some(records));
    assert!(sensor.peer_closed(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn flush_drops_expired_records_and_keeps_unparsable_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let table = table_for(&config);
    let fresh = Record::new(recent(1), -18.0, 40.0);
    let unparsable = Record::new("sometime", -17.0, 41.0);
    table
        .store(&[
            Record::new("2001-01-01T00:00:00Z", -16.0, 50.0),
            fresh.clone(),
            unparsable.clone(),
        ])
        .unwrap();

    let service = IngestService::start(config).await.unwrap();
    let report = service.shutdown().await.unwrap();
    assert_eq!(report.final_flush.rows, 2);
    assert_eq!(report.final_flush.trim.expired, 1);
    assert_eq!(table.load().unwrap(), Some(vec![fresh, unparsable]));
}

#[tokio::test]
async fn flush_drops_unparsable_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.retention = RetentionPolicy::days(30, false);
    let table = table_for(&config);
    let fresh = Record::new(recent(1), -18.0, 40.0);
    table
        .store(&[Record::new("sometime", -17.0, 41.0), fresh.clone()])
        .unwrap();

    let service = IngestService::start(config).await.unwrap();
    let report = service.shutdown().await.unwrap();
    assert_eq!(report.final_flush.trim.unparsable_dropped, 1);
    assert_eq!(table.load().unwrap(), Some(vec![fresh]));
}

#[tokio::test]
async fn restart_picks_up_previously_flushed_records() {
    let dir = tempfile::tempdir().unwrap();
    let record = Record::new(recent(1), -21.0, 35.0);

    let service = IngestService::start(test_config(dir.path())).await.unwrap();
    let mut sensor = MockSensor::connect(service.local_addr()).await.unwrap();
    sensor.send_records(std::slice::from_ref(&record)).await.unwrap();
    sensor.send_end().await.unwrap();
    assert!(sensor.peer_closed(Duration::from_secs(2)).await);
    service.shutdown().await.unwrap();

    let service = IngestService::start(test_config(dir.path())).await.unwrap();
    assert_eq!(service.buffer().snapshot().await, vec![record]);
    service.shutdown().await.unwrap();
}
