use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bikecast::{
    log_command_finish, log_command_start, log_store_opened, normalize_hourly, BackfillConfig,
    BackfillCoordinator, City, FeatureStore, InMemoryModelRegistry, IntegrityPolicy,
    LoggingConfig, NormalizeRequest, RawTripEvent, Scenario,
};
use chrono::NaiveDate;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

#[test]
fn command_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_command_start("backfill", &cfg);
        log_store_opened(
            "backfill",
            City::Chicago,
            Path::new("data/store/chicago/feature_store.sqlite"),
        );
        log_command_finish("backfill", false);
    });

    assert!(logs.contains("\"event\":\"command.start\""));
    assert!(logs.contains("\"event\":\"store.opened\""));
    assert!(logs.contains("\"city\":\"chicago\""));
    assert!(logs.contains("\"city_name\":\"Chicago\""));
    assert!(logs.contains("\"path\":\"data/store/chicago/feature_store.sqlite\""));
    assert!(logs.contains("\"event\":\"command.finish\""));
    assert!(logs.contains("\"component\":\"backfill\""));
    assert!(logs.contains("\"level\":\"WARN\""));
}

#[test]
fn normalizer_logs_skipped_records_and_summary() {
    let events = vec![
        RawTripEvent::from_parts("t1", "A", "start", 1_709_251_200_000, City::Chicago).unwrap(),
        RawTripEvent::from_parts("t2", "A", "start", 1_709_251_200_000, City::NewYork).unwrap(),
    ];
    let mut req = NormalizeRequest::new(City::Chicago, day(1), day(1));
    req.policy = IntegrityPolicy::ReportAndSkip;

    let logs = capture_logs(Level::INFO, || {
        let out = normalize_hourly(&events, &req).expect("bad record is skipped");
        assert_eq!(out.report.rejected_events, 1);
    });

    assert!(logs.contains("\"event\":\"normalize.rejections\""));
    assert!(logs.contains("\"event\":\"normalize.finish\""));
}

#[test]
fn backfill_logs_per_scenario_failures() {
    let logs = capture_logs(Level::INFO, || {
        let coordinator = BackfillCoordinator::new(BackfillConfig::new(City::Chicago))
            .expect("config is valid");
        let mut store = FeatureStore::open_in_memory().expect("store opens");
        let report = coordinator
            .backfill_predictions(
                &mut store,
                &InMemoryModelRegistry::new(),
                &[Scenario::Start],
                day(1),
                day(2),
            )
            .expect("backfill reports");
        assert!(report.has_failures());
    });

    assert!(logs.contains("\"event\":\"backfill.predictions.start\""));
    assert!(logs.contains("\"event\":\"backfill.scenario.failed\""));
}
