// src/main.rs

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, error, info, warn};

use sdr_capture_node::NodeConfig;
use sdr_capture_node::bridge::{
    AnalysisRequest, BridgeRecorderObserver, BridgeScanPublisher, MessageBridge, SchedulerHandle,
    SessionRegistry, StreamAnalyzer, StreamMessage,
};
use sdr_capture_node::core::CancelToken;
use sdr_capture_node::device::SimulatedDevice;
use sdr_capture_node::dsp::{FftProcessor, SignalProcessor};
use sdr_capture_node::recorder::{
    Recorder, RecordingObserver, RecordingParams, RecordingRequest, spawn_recording,
};
use sdr_capture_node::scanner::{ScanConfig, ScanEngine, ScanPublisher};
use sdr_capture_node::storage::{ArtifactStore, FileStore};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".into());

    let cfg = if Path::new(&cfg_path).exists() {
        let cfg = NodeConfig::load(&cfg_path)?;
        info!("[sdr-node] loaded {}", cfg_path);
        cfg
    } else {
        warn!("[sdr-node] {} not found, using defaults", cfg_path);
        NodeConfig::default()
    };

    // ------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------
    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        ctrlc::set_handler(move || {
            info!("\n[sdr-node] shutdown requested");
            r.store(false, Ordering::SeqCst);
        })?;
    }

    // ------------------------------------------------------------
    // Device / Storage / DSP
    // ------------------------------------------------------------
    std::fs::create_dir_all(&cfg.recorder.output_dir).with_context(|| {
        format!("failed to create output dir {:?}", cfg.recorder.output_dir)
    })?;

    let device = Arc::new(SimulatedDevice::new(cfg.device.clone()));
    let store: Arc<dyn ArtifactStore> = Arc::new(
        FileStore::new(&cfg.recorder.output_dir).with_compression(cfg.recorder.compression),
    );
    let processor: Arc<dyn SignalProcessor> = Arc::new(FftProcessor::default());

    // ------------------------------------------------------------
    // Bridge
    // ------------------------------------------------------------
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let bridge = Arc::new(MessageBridge::<StreamMessage>::new(
        cfg.bridge.queue_capacity,
        SchedulerHandle::attach(runtime.handle()),
    ));
    let registry = Arc::new(SessionRegistry::new(cfg.bridge.grace_period()));

    let consumer = {
        let bridge = bridge.clone();
        let running = running.clone();
        runtime.spawn(async move {
            while running.load(Ordering::Relaxed) {
                if let Ok(msg) = tokio::time::timeout(Duration::from_millis(250), bridge.get()).await
                {
                    log_message(&msg);
                }
            }
        })
    };

    // ------------------------------------------------------------
    // Recorder
    // ------------------------------------------------------------
    let recorder = Arc::new(Recorder::new(
        device.clone(),
        store.clone(),
        processor.clone(),
        cfg.recorder.recorder_config(),
    ));

    let mut params = RecordingParams {
        freq: Some(100e6),
        rate: Some(2e6),
        gain: Some(20.0),
        duration: Some(0.5),
        ..Default::default()
    };
    cfg.recorder.apply_defaults(&mut params, false);
    let request = RecordingRequest::from_params(&params)?;

    let observer: Arc<dyn RecordingObserver> = Arc::new(BridgeRecorderObserver::new(
        bridge.clone(),
        registry.clone(),
        processor.clone(),
        cfg.bridge.spectrum_fft_size,
        cfg.bridge.update_interval(),
    ));
    let record_cancel = CancelToken::new();
    let recording = spawn_recording(recorder, request, Some(observer), record_cancel.clone())
        .context("failed to spawn recorder thread")?;

    // ------------------------------------------------------------
    // Scanner
    // ------------------------------------------------------------
    let publisher: Arc<dyn ScanPublisher> =
        Arc::new(BridgeScanPublisher::new(bridge.clone(), registry.clone()));
    let scanner = ScanEngine::new(
        device.clone(),
        processor.clone(),
        Some(publisher),
        cfg.scanner.clone(),
    );
    let scan_id = scanner.start_scanning(ScanConfig {
        continuous: false,
        ..Default::default()
    })?;
    info!("[sdr-node] scan session {} started", scan_id);

    // ------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------
    info!("[sdr-node] running – Ctrl+C to stop");

    let analyzer = StreamAnalyzer::new(
        store.clone(),
        processor.clone(),
        registry.clone(),
        cfg.bridge.clone(),
    );
    let mut recording = Some(recording);
    let mut last_reap = Instant::now();

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));

        if recording.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = recording.take() {
                match handle.join() {
                    Ok(outcome) => {
                        info!(
                            "[sdr-node] recording finished: success={} validated={} path={:?}",
                            outcome.success, outcome.validated, outcome.artifact_path
                        );
                        // Artefakt gleich wieder abspielen
                        if let Some(path) = outcome.artifact_path.filter(|_| outcome.success) {
                            match analyzer.create_session(AnalysisRequest::new(path), bridge.clone())
                            {
                                Ok(id) => info!("[sdr-node] analysis session {} started", id),
                                Err(e) => error!("[sdr-node] analysis failed to start: {}", e),
                            }
                        }
                    }
                    Err(_) => error!("[sdr-node] recorder thread panicked"),
                }
            }
        }

        if last_reap.elapsed() >= cfg.bridge.grace_period() {
            let reaped = registry.reap();
            if !reaped.is_empty() {
                debug!("[sdr-node] reaped {} sessions", reaped.len());
            }
            debug!(
                "[sdr-node] sessions={} scanning={} dropped={}",
                registry.len(),
                scanner.is_scanning(),
                bridge.dropped_count()
            );
            last_reap = Instant::now();
        }
    }

    // ------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------
    info!("[sdr-node] shutting down…");
    if let Some(report) = scanner.stop_scanning() {
        info!(
            "[sdr-node] scan {} stopped (joined={})",
            report.session_id, report.joined
        );
    }
    record_cancel.cancel();
    if let Some(handle) = recording.take() {
        if handle.join().is_err() {
            error!("[sdr-node] recorder thread panicked");
        }
    }
    consumer.abort();
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("[sdr-node] shutdown complete");

    Ok(())
}

fn log_message(msg: &StreamMessage) {
    match msg {
        StreamMessage::Data(data) => debug!(
            "[bridge] {} seq={} processed={}",
            data.meta.session_id, data.meta.seq, data.meta.processed_samples
        ),
        StreamMessage::Error { session_id, error, .. } => {
            error!("[bridge] {} failed: {}", session_id, error)
        }
        other => info!("[bridge] {} {}", other.session_id(), other.kind()),
    }
}
