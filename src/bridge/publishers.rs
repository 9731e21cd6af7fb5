// src/bridge/publishers.rs
//! Adapters that forward recorder and scanner callbacks into a bridge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::analyzer::chunk_views;
use super::message::{DataMessage, FrequencyDomain, ScanProgress, StreamMessage, StreamMeta, StreamViews, ViewMetadata};
use super::queue::MessageBridge;
use super::registry::{SessionKind, SessionMode, SessionRegistry, SessionStatus};
use crate::core::{ComponentLogger, LogContext, Sample};
use crate::core::lock::lock_mutex;
use crate::dsp::SignalProcessor;
use crate::recorder::{ChunkProgress, RecordingObserver, RecordingRequest};
use crate::scanner::{MergedRound, ScanPublisher, ScanStatus, SegmentUpdate};

/// Runs `streams` through the registry's payload policy and wraps it.
pub(crate) fn data_message(
    registry: &SessionRegistry,
    session_id: &str,
    seq: u64,
    processed_samples: usize,
    total_samples: usize,
    streams: StreamViews,
    scan_progress: Option<ScanProgress>,
) -> StreamMessage {
    let payload = registry.format_stream_payload(session_id, streams);
    StreamMessage::Data(DataMessage {
        meta: StreamMeta {
            session_id: session_id.to_string(),
            seq,
            timestamp: payload.meta.last_update,
            processed_samples,
            total_samples,
            mode: payload.meta.mode,
            status: payload.meta.status,
            include_extras: payload.meta.include_extras,
        },
        streams: payload.streams,
        scan_progress: scan_progress.or(payload.meta.scan_progress),
    })
}

fn to_mhz(frequencies: &[f64]) -> Vec<f64> {
    frequencies.iter().map(|f| f / 1e6).collect()
}

/// Publishes scan segments and merged rounds as compact `data` messages.
pub struct BridgeScanPublisher {
    bridge: Arc<MessageBridge<StreamMessage>>,
    registry: Arc<SessionRegistry>,
    seq: AtomicU64,
}

impl BridgeScanPublisher {
    pub fn new(bridge: Arc<MessageBridge<StreamMessage>>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            bridge,
            registry,
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl ComponentLogger for BridgeScanPublisher {
    fn log_context(&self) -> LogContext {
        LogContext::new("BridgeScanPublisher", "bridge")
    }
}

impl ScanPublisher for BridgeScanPublisher {
    fn begin(&self, session_id: &str) {
        self.registry.register(session_id, SessionKind::scan());
    }

    fn publish_segment(&self, update: &SegmentUpdate) {
        let progress = ScanProgress {
            progress: update.progress,
            current_segment: update.segment.segment_index,
            segments_total: update.segments_total,
            current_center_freq: update.current_center_freq / 1e6,
            round: update.round,
        };
        if !self
            .registry
            .record_scan(&update.session_id, progress.clone(), update.fft_size)
        {
            self.debug(&format!(
                "Dropping late segment {} for session {}",
                update.segment.segment_index, update.session_id
            ));
            return;
        }

        let streams = StreamViews {
            frequency_domain: FrequencyDomain {
                frequency: to_mhz(&update.segment.frequencies),
                power: update.segment.power.clone(),
            },
            metadata: ViewMetadata {
                fft_size: Some(update.fft_size),
                round: Some(update.round),
                sample_rate: Some(update.sample_rate),
                center_freq: Some(update.segment.center_freq),
                merged: false,
            },
            ..Default::default()
        };
        let msg = data_message(
            &self.registry,
            &update.session_id,
            self.next_seq(),
            update.segment.segment_index + 1,
            update.segments_total,
            streams,
            Some(progress),
        );
        self.bridge.put_from_thread(msg);
    }

    fn publish_round(&self, session_id: &str, round: &MergedRound) {
        let streams = StreamViews {
            frequency_domain: FrequencyDomain {
                frequency: to_mhz(&round.frequencies),
                power: round.power.clone(),
            },
            metadata: ViewMetadata {
                round: Some(round.round),
                merged: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let msg = data_message(
            &self.registry,
            session_id,
            self.next_seq(),
            round.segment_count,
            round.segment_count,
            streams,
            None,
        );
        self.bridge.put_from_thread(msg);
    }

    fn finalize(&self, session_id: &str, status: ScanStatus) {
        let status = match status {
            ScanStatus::Running => return,
            ScanStatus::Completed => SessionStatus::Completed,
            ScanStatus::Stopped => SessionStatus::Stopped,
        };
        let rounds = match self.registry.snapshot(session_id).map(|s| s.kind) {
            Some(SessionKind::Scan { round, .. }) => round as usize,
            _ => 0,
        };
        self.registry.finalize(session_id, status, None);
        self.bridge.put_from_thread(StreamMessage::AnalysisComplete {
            session_id: session_id.to_string(),
            total_processed: rounds,
            status,
            result: None,
        });
    }
}

/// Streams a live recording as a realtime session.
pub struct BridgeRecorderObserver {
    bridge: Arc<MessageBridge<StreamMessage>>,
    registry: Arc<SessionRegistry>,
    processor: Arc<dyn SignalProcessor>,
    session_id: String,
    fft_size: usize,
    update_interval: Duration,
    seq: AtomicU64,
    last_emit: Mutex<Option<Instant>>,
}

impl BridgeRecorderObserver {
    pub fn new(
        bridge: Arc<MessageBridge<StreamMessage>>,
        registry: Arc<SessionRegistry>,
        processor: Arc<dyn SignalProcessor>,
        fft_size: usize,
        update_interval: Duration,
    ) -> Self {
        let session_id = registry.create(SessionKind::realtime(0.0, 0.0));
        Self {
            bridge,
            registry,
            processor,
            session_id,
            fft_size,
            update_interval,
            seq: AtomicU64::new(0),
            last_emit: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn due(&self) -> bool {
        let mut last = lock_mutex(&self.last_emit, "BridgeRecorderObserver::due");
        match *last {
            Some(at) if at.elapsed() < self.update_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl RecordingObserver for BridgeRecorderObserver {
    fn on_start(&self, actual_rate: f64, request: &RecordingRequest) {
        self.registry.register(
            &self.session_id,
            SessionKind::realtime(request.freq, actual_rate),
        );
        self.bridge.put_from_thread(StreamMessage::SessionStarted {
            session_id: self.session_id.clone(),
            mode: SessionMode::Realtime,
        });
    }

    fn on_chunk(&self, chunk: &[Sample], progress: &ChunkProgress) {
        self.registry.record_progress(
            &self.session_id,
            progress.processed_samples,
            progress.expected_samples,
        );
        if !self.due() {
            return;
        }

        let mut streams = chunk_views(
            chunk,
            progress.sample_rate,
            self.processor.as_ref(),
            self.fft_size,
            SessionMode::Realtime.include_extras(),
        );
        streams.metadata.center_freq = Some(progress.center_freq);
        let msg = data_message(
            &self.registry,
            &self.session_id,
            self.seq.fetch_add(1, Ordering::Relaxed),
            progress.processed_samples,
            progress
                .expected_samples
                .unwrap_or(progress.processed_samples),
            streams,
            None,
        );
        self.bridge.put_from_thread(msg);
    }

    fn on_complete(&self, success: bool, payload: &Value) {
        if success {
            let cancelled = payload
                .get("cancelled")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let status = if cancelled {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Completed
            };
            self.registry.finalize(&self.session_id, status, None);
            self.bridge.put_from_thread(StreamMessage::AnalysisComplete {
                session_id: self.session_id.clone(),
                total_processed: payload
                    .get("samples_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
                status,
                result: Some(payload.clone()),
            });
            return;
        }

        let error = payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("recording failed")
            .to_string();
        let code = payload
            .get("error_code")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.registry
            .finalize(&self.session_id, SessionStatus::Failed, Some(error.clone()));
        self.bridge.put_from_thread(StreamMessage::Error {
            session_id: self.session_id.clone(),
            error,
            code,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::queue::SchedulerHandle;
    use crate::dsp::FftProcessor;
    use crate::scanner::SegmentResult;
    use serde_json::json;

    fn bridge() -> Arc<MessageBridge<StreamMessage>> {
        Arc::new(MessageBridge::new(64, SchedulerHandle::detached()))
    }

    fn update(index: usize, total: usize) -> SegmentUpdate {
        SegmentUpdate {
            session_id: "scan-a".into(),
            round: 1,
            segment: SegmentResult {
                segment_index: index,
                center_freq: 100e6,
                frequencies: vec![99.5e6, 100e6, 100.5e6],
                power: vec![-80.0, -20.0, -80.0],
                timestamp: 0.0,
            },
            segments_total: total,
            progress: (index + 1) as f64 / total as f64,
            current_center_freq: 100e6,
            fft_size: 1024,
            sample_rate: 2e6,
            max_segments: 20,
        }
    }

    #[test]
    fn test_scan_segment_payload() {
        let bridge = bridge();
        let registry = Arc::new(SessionRegistry::default());
        let publisher = BridgeScanPublisher::new(bridge.clone(), registry.clone());

        publisher.begin("scan-a");
        publisher.publish_segment(&update(1, 4));
        let msgs = bridge.drain();
        assert_eq!(msgs.len(), 1);
        let StreamMessage::Data(data) = &msgs[0] else {
            panic!("expected data message");
        };
        assert_eq!(data.meta.mode, SessionMode::Scan);
        assert!(!data.meta.include_extras);
        assert_eq!(data.streams.frequency_domain.frequency, vec![99.5, 100.0, 100.5]);
        assert_eq!(data.streams.metadata.fft_size, Some(1024));
        let progress = data.scan_progress.as_ref().unwrap();
        assert_eq!(progress.current_segment, 1);
        assert!((progress.progress - 0.5).abs() < 1e-9);
        assert_eq!(progress.current_center_freq, 100.0);
        assert_eq!(registry.status("scan-a"), Some(SessionStatus::Streaming));
    }

    #[test]
    fn test_scan_finalize_is_terminal() {
        let bridge = bridge();
        let registry = Arc::new(SessionRegistry::default());
        let publisher = BridgeScanPublisher::new(bridge.clone(), registry.clone());

        publisher.begin("scan-a");
        publisher.publish_segment(&update(0, 2));
        publisher.finalize("scan-a", ScanStatus::Stopped);
        publisher.finalize("scan-a", ScanStatus::Completed);

        assert_eq!(registry.status("scan-a"), Some(SessionStatus::Stopped));
        let last = bridge.drain().pop().unwrap();
        assert_eq!(last.kind(), "analysis_complete");
    }

    #[test]
    fn test_late_segment_does_not_revive_session() {
        let bridge = bridge();
        let registry = Arc::new(SessionRegistry::new(Duration::ZERO));
        let publisher = BridgeScanPublisher::new(bridge.clone(), registry.clone());

        publisher.begin("scan-a");
        publisher.publish_segment(&update(0, 2));
        publisher.finalize("scan-a", ScanStatus::Stopped);
        assert_eq!(registry.reap(), vec!["scan-a".to_string()]);
        bridge.drain();

        publisher.publish_segment(&update(1, 2));
        assert!(!registry.contains("scan-a"));
        assert!(bridge.drain().is_empty());
        assert!(registry.reap().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_segment_without_begin_is_dropped() {
        let bridge = bridge();
        let registry = Arc::new(SessionRegistry::default());
        let publisher = BridgeScanPublisher::new(bridge.clone(), registry.clone());

        publisher.publish_segment(&update(0, 2));
        assert!(registry.is_empty());
        assert!(bridge.drain().is_empty());
    }

    #[test]
    fn test_recorder_observer_lifecycle() {
        let bridge = bridge();
        let registry = Arc::new(SessionRegistry::default());
        let observer = BridgeRecorderObserver::new(
            bridge.clone(),
            registry.clone(),
            Arc::new(FftProcessor::with_fft_size(256)),
            256,
            Duration::ZERO,
        );
        let id = observer.session_id().to_string();

        let request = RecordingRequest {
            freq: 100e6,
            rate: 1e6,
            gain: 10.0,
            duration: 0.01,
            channel: 0,
            bandwidth: None,
            filename: None,
            flush_interval: Duration::from_secs(1),
        };
        observer.on_start(1e6, &request);
        let chunk = vec![Sample::new(1.0, 0.0); 512];
        observer.on_chunk(
            &chunk,
            &ChunkProgress {
                sample_rate: 1e6,
                center_freq: 100e6,
                processed_samples: 512,
                expected_samples: Some(10_000),
                timestamp: 0.0,
            },
        );
        observer.on_complete(false, &json!({"error": "disk full", "error_code": "persistence_failure"}));

        let msgs = bridge.drain();
        let kinds: Vec<&str> = msgs.iter().map(StreamMessage::kind).collect();
        assert_eq!(kinds, vec!["session_started", "data", "error"]);
        if let StreamMessage::Data(data) = &msgs[1] {
            assert_eq!(data.meta.mode, SessionMode::Realtime);
            assert_eq!(data.streams.frequency_domain.frequency.len(), 256);
            assert!(data.streams.time_domain.time.is_empty());
        }
        let snapshot = registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("disk full"));
    }
}
