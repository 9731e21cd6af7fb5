// tests/recorder_tests.rs
// Aufnahme gegen MockDevice, Artefakte im tempdir

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use sdr_capture_node::core::{CancelToken, Sample};
use sdr_capture_node::dsp::{FftProcessor, SignalProcessor};
use sdr_capture_node::recorder::{
    ChunkProgress, HighSpeedRequest, Recorder, RecorderConfig, RecordingObserver,
    RecordingParams, RecordingRequest, spawn_recording,
};
use sdr_capture_node::storage::{ArtifactStore, FileStore, MetaValue};
use sdr_capture_node::testing::{FailingStore, MockDevice};

fn params(filename: &str) -> RecordingParams {
    RecordingParams {
        freq: Some(100e6),
        rate: Some(2e6),
        gain: Some(20.0),
        duration: Some(0.01),
        channel: Some(0),
        filename: Some(filename.to_string()),
        ..Default::default()
    }
}

fn recorder(
    device: Arc<MockDevice>,
    store: Arc<dyn ArtifactStore>,
    config: RecorderConfig,
) -> Recorder {
    Recorder::new(device, store, Arc::new(FftProcessor::default()), config)
}

#[derive(Default)]
struct CountingObserver {
    starts: AtomicUsize,
    chunks: AtomicUsize,
    last_processed: AtomicUsize,
    completions: Mutex<Vec<(bool, Value)>>,
}

impl RecordingObserver for CountingObserver {
    fn on_start(&self, _actual_rate: f64, _request: &RecordingRequest) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_chunk(&self, _chunk: &[Sample], progress: &ChunkProgress) {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        self.last_processed
            .store(progress.processed_samples, Ordering::SeqCst);
    }

    fn on_complete(&self, success: bool, payload: &Value) {
        self.completions
            .lock()
            .unwrap()
            .push((success, payload.clone()));
    }
}

#[test]
fn recording_of_mock_capture_is_validated() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(MockDevice::new(20_000));
    let store = Arc::new(FileStore::new(dir.path()));
    let recorder = recorder(device.clone(), store.clone(), RecorderConfig::default());
    let observer = CountingObserver::default();

    let outcome = recorder
        .record_params(&params("scenario_a.rfc"), Some(&observer), &CancelToken::new())
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.validated);
    let path = outcome.artifact_path.clone().unwrap();
    assert_eq!(path, dir.path().join("scenario_a.rfc"));
    assert_eq!(outcome.payload["samples_count"], 20_000);
    assert_eq!(outcome.payload["validation_passed"], true);
    assert_eq!(outcome.payload["disk_buffer"], true);

    let (samples, metadata) = store.load(&path).unwrap();
    assert_eq!(samples.len(), 20_000);
    assert_eq!(metadata.samples_count, 20_000);
    assert_eq!(metadata.sample_rate, 2e6);
    assert_eq!(metadata.center_freq, 100e6);
    assert_eq!(samples[1234], MockDevice::sample_at(1234));

    assert_eq!(observer.starts.load(Ordering::SeqCst), 1);
    assert_eq!(observer.chunks.load(Ordering::SeqCst), 20);
    assert_eq!(observer.last_processed.load(Ordering::SeqCst), 20_000);
    let completions = observer.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].0);
}

#[test]
fn reloading_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let recorder = recorder(
        Arc::new(MockDevice::new(5_000)),
        store.clone(),
        RecorderConfig::default(),
    );

    let outcome = recorder
        .record_params(&params("twice.rfc"), None, &CancelToken::new())
        .unwrap();
    let path = outcome.artifact_path.unwrap();

    let first = store.load(&path).unwrap();
    let second = store.load(&path).unwrap();
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
}

#[test]
fn failed_commit_is_recovered_from_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FailingStore::new(dir.path()));
    let recorder = recorder(
        Arc::new(MockDevice::new(500).with_chunk_len(100)),
        store.clone(),
        RecorderConfig::default(),
    );
    let observer = CountingObserver::default();

    let outcome = recorder
        .record_params(&params("scenario_d.rfc"), Some(&observer), &CancelToken::new())
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.is_recovered());
    assert_eq!(outcome.payload["error_code"], "persistence_failure");
    assert_eq!(outcome.payload["buffer_sample_count"], 500);
    assert_eq!(store.failed_saves(), 1);

    let recovered = outcome.artifact_path.unwrap();
    assert_eq!(recovered, dir.path().join("scenario_d_recovered.rfc"));
    assert!(!dir.path().join("scenario_d.rfc").exists());

    let (samples, metadata) = store.load(&recovered).unwrap();
    assert_eq!(samples.len(), 500);
    assert_eq!(metadata.samples_count, 500);
    assert_eq!(
        metadata.extra("recording_mode"),
        Some(&MetaValue::Text("buffered_recovery".into()))
    );

    let completions = observer.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].0);
}

#[test]
fn missing_parameters_fail_before_hardware() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(MockDevice::new(1_000));
    let recorder = recorder(
        device.clone(),
        Arc::new(FileStore::new(dir.path())),
        RecorderConfig::default(),
    );

    let err = recorder
        .record_params(
            &RecordingParams {
                freq: Some(100e6),
                ..Default::default()
            },
            None,
            &CancelToken::new(),
        )
        .unwrap_err();

    assert_eq!(err.code(), "missing_parameter");
    assert!(err.to_string().contains("rate"));
    assert!(device.last_rx().is_none());
    assert_eq!(device.record_calls(), 0);
}

#[test]
fn snapped_rate_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let recorder = recorder(
        Arc::new(MockDevice::new(10_000).with_actual_rate(1e6)),
        store.clone(),
        RecorderConfig::default(),
    );

    let outcome = recorder
        .record_params(&params("snapped.rfc"), None, &CancelToken::new())
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.payload["rate_info"]["sample_rate_snapped"], true);
    assert_eq!(outcome.payload["rate_info"]["actual_sample_rate"], 1e6);

    let (_, metadata) = store.load(&outcome.artifact_path.unwrap()).unwrap();
    assert_eq!(metadata.sample_rate, 1e6);
    assert_eq!(metadata.extra("sample_rate_snapped"), Some(&MetaValue::Bool(true)));
    assert_eq!(metadata.extra("target_sample_rate").and_then(MetaValue::as_f64), Some(2e6));
}

#[test]
fn unusable_buffer_dir_records_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let config = RecorderConfig {
        buffer_dir: Some(dir.path().join("does").join("not").join("exist")),
        collect_in_memory: false,
    };
    let recorder = recorder(Arc::new(MockDevice::new(3_000)), store.clone(), config);

    let outcome = recorder
        .record_params(&params("memory_only.rfc"), None, &CancelToken::new())
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.payload["disk_buffer"], false);
    let (samples, metadata) = store.load(&outcome.artifact_path.unwrap()).unwrap();
    assert_eq!(samples.len(), 3_000);
    assert_eq!(metadata.extra("disk_buffer"), Some(&MetaValue::Bool(false)));
}

#[test]
fn consecutive_overflows_stop_capture_early() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let device = Arc::new(MockDevice::new(10_000).with_overflows(2, 3));
    let recorder = recorder(device.clone(), store.clone(), RecorderConfig::default());

    let outcome = recorder
        .record_params(&params("overflow.rfc"), None, &CancelToken::new())
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.payload["samples_count"], 2_000);
    assert_eq!(outcome.payload["overflow_count"], 3);
    assert_eq!(device.samples_produced(), 2_000);
    assert!(
        outcome.payload["early_stop"]
            .as_str()
            .unwrap()
            .contains("3 consecutive overflows")
    );

    let (_, metadata) = store.load(&outcome.artifact_path.unwrap()).unwrap();
    assert_eq!(metadata.extra("overflow_count"), Some(&MetaValue::Integer(3)));
    assert_eq!(metadata.extra("stopped_on_overflow"), Some(&MetaValue::Bool(true)));
}

#[test]
fn isolated_overflows_do_not_stop_capture() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = recorder(
        Arc::new(MockDevice::new(5_000).with_overflows(1, 2)),
        Arc::new(FileStore::new(dir.path())),
        RecorderConfig::default(),
    );

    let outcome = recorder
        .record_params(&params("two_overflows.rfc"), None, &CancelToken::new())
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.payload["samples_count"], 5_000);
    assert_eq!(outcome.payload["overflow_count"], 2);
    assert!(outcome.payload.get("early_stop").is_none());
}

#[test]
fn cancelled_recording_commits_partial_capture() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let device = Arc::new(
        MockDevice::new(1_000_000)
            .with_chunk_len(1_000)
            .with_chunk_delay(Duration::from_millis(10)),
    );
    let recorder = Arc::new(recorder(device, store.clone(), RecorderConfig::default()));

    let request = RecordingRequest::from_params(&params("cancelled.rfc")).unwrap();
    let cancel = CancelToken::new();
    let handle = spawn_recording(recorder, request, None, cancel.clone()).unwrap();

    std::thread::sleep(Duration::from_millis(60));
    cancel.cancel();
    let outcome = handle.join().unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.payload["cancelled"], true);
    let (samples, metadata) = store.load(&outcome.artifact_path.unwrap()).unwrap();
    assert!(!samples.is_empty());
    assert!(samples.len() < 1_000_000);
    assert_eq!(metadata.extra("cancelled"), Some(&MetaValue::Bool(true)));
}

#[test]
fn bandpass_rate_is_filled_in() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let device = Arc::new(MockDevice::new(4_000));
    let recorder = recorder(device.clone(), store.clone(), RecorderConfig::default());

    let mut p = params("bandpass.rfc");
    p.rate = None;
    p.bandwidth = Some(20e3);
    let outcome = recorder
        .record_with_bandpass_sampling(&p, None, &CancelToken::new())
        .unwrap();

    let expected = FftProcessor::default().calculate_bandpass_sample_rate(100e6, 20e3);
    assert!(outcome.success);
    assert_eq!(device.last_rx().unwrap().rate, expected);
    let (_, metadata) = store.load(&outcome.artifact_path.unwrap()).unwrap();
    assert_eq!(metadata.sample_rate, expected);
}

#[test]
fn high_speed_capture_streams_to_container() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let recorder = recorder(
        Arc::new(MockDevice::new(50_000).with_chunk_len(4_096)),
        store.clone(),
        RecorderConfig::default(),
    );

    let mut p = params("wideband.iq");
    p.chunk_samples = Some(16_384);
    p.compression = Some("none".into());
    let request = HighSpeedRequest::from_params(&p).unwrap();
    let observer = CountingObserver::default();

    let outcome = recorder.record_high_speed(&request, Some(&observer), &CancelToken::new());

    assert!(outcome.success);
    assert!(outcome.validated);
    let path = outcome.artifact_path.unwrap();
    assert_eq!(path.extension().unwrap(), "rfc");
    assert!(!hidden_temp_left(dir.path()));

    let (samples, metadata) = store.load(&path).unwrap();
    assert_eq!(samples.len(), 50_000);
    assert_eq!(samples[49_999], MockDevice::sample_at(49_999));
    assert_eq!(
        metadata.extra("recording_mode"),
        Some(&MetaValue::Text("high_speed".into()))
    );
    assert_eq!(observer.completions.lock().unwrap().len(), 1);
}

#[test]
fn high_speed_overflow_stop_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let device = Arc::new(MockDevice::new(10_000).with_overflows(2, 3));
    let recorder = recorder(device.clone(), store.clone(), RecorderConfig::default());

    let request = HighSpeedRequest::from_params(&params("burst.rfc")).unwrap();
    let outcome = recorder.record_high_speed(&request, None, &CancelToken::new());

    assert!(outcome.success);
    assert_eq!(outcome.payload["samples_count"], 2_000);
    assert_eq!(outcome.payload["overflow_count"], 3);
    assert_eq!(device.samples_produced(), 2_000);
    assert!(
        outcome.payload["early_stop"]
            .as_str()
            .unwrap()
            .contains("3 consecutive overflows")
    );

    let (samples, metadata) = store.load(&outcome.artifact_path.unwrap()).unwrap();
    assert_eq!(samples.len(), 2_000);
    assert_eq!(metadata.extra("stopped_on_overflow"), Some(&MetaValue::Bool(true)));
    assert!(!hidden_temp_left(dir.path()));
}

fn hidden_temp_left(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
}
