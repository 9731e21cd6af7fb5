// src/bridge/analyzer.rs
//! Replays a stored artifact chunk by chunk as an analysis session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::BridgeConfig;
use super::message::{Constellation, FrequencyDomain, StreamMessage, StreamViews, TimeDomain};
use super::publishers::data_message;
use super::queue::MessageBridge;
use super::registry::{SessionKind, SessionMode, SessionRegistry, SessionStatus};
use crate::core::{
    CancelToken, CaptureError, CaptureResult, ComponentLogger, LogContext, Sample, WorkerLogger,
};
use crate::dsp::SignalProcessor;
use crate::storage::ArtifactStore;

/// Max points in the time-domain view.
pub const TIME_DOMAIN_LIMIT: usize = 1000;
/// Target point count of the constellation view.
pub const CONSTELLATION_POINTS: usize = 1000;

/// Spectrum of `chunk` plus, for rich sessions, the auxiliary views.
pub fn chunk_views(
    chunk: &[Sample],
    sample_rate: f64,
    processor: &dyn SignalProcessor,
    fft_size: usize,
    include_extras: bool,
) -> StreamViews {
    let frequency_domain = match processor.calculate_spectrum_sized(chunk, sample_rate, fft_size) {
        Ok(spectrum) => FrequencyDomain {
            power: spectrum.power_db(),
            frequency: spectrum.frequencies,
        },
        Err(e) => {
            log::warn!("spectrum calculation failed: {}", e);
            FrequencyDomain::default()
        }
    };

    let mut views = StreamViews {
        frequency_domain,
        ..Default::default()
    };
    views.metadata.fft_size = Some(fft_size.min(chunk.len()));
    views.metadata.sample_rate = Some(sample_rate);

    if include_extras {
        let head = &chunk[..chunk.len().min(TIME_DOMAIN_LIMIT)];
        views.time_domain = TimeDomain {
            time: (0..head.len()).collect(),
            i_component: head.iter().map(|s| s.re).collect(),
            q_component: head.iter().map(|s| s.im).collect(),
        };

        let step = (chunk.len() / CONSTELLATION_POINTS).max(1);
        views.constellation = Constellation {
            i_component: chunk.iter().step_by(step).map(|s| s.re).collect(),
            q_component: chunk.iter().step_by(step).map(|s| s.im).collect(),
        };
    }
    views
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub path: PathBuf,
    /// Overrides the rate stored with the artifact.
    pub sample_rate: Option<f64>,
    pub center_freq: Option<f64>,
    pub chunk_size: Option<usize>,
    pub update_interval: Option<Duration>,
}

impl AnalysisRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sample_rate: None,
            center_freq: None,
            chunk_size: None,
            update_interval: None,
        }
    }
}

struct AnalysisJob {
    session_id: String,
    request: AnalysisRequest,
    chunk_size: usize,
    fft_size: usize,
    update_interval: Duration,
    cancel: CancelToken,
}

/// Analysis sessions over stored artifacts, one worker thread each.
pub struct StreamAnalyzer {
    store: Arc<dyn ArtifactStore>,
    processor: Arc<dyn SignalProcessor>,
    registry: Arc<SessionRegistry>,
    config: BridgeConfig,
}

impl StreamAnalyzer {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        processor: Arc<dyn SignalProcessor>,
        registry: Arc<SessionRegistry>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            store,
            processor,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Registers a session and starts streaming the artifact into `bridge`.
    pub fn create_session(
        &self,
        request: AnalysisRequest,
        bridge: Arc<MessageBridge<StreamMessage>>,
    ) -> CaptureResult<String> {
        let session_id = self.registry.create(SessionKind::analysis(request.path.clone()));
        let cancel = self
            .registry
            .cancel_token(&session_id)
            .unwrap_or_default();

        let job = AnalysisJob {
            session_id: session_id.clone(),
            chunk_size: request
                .chunk_size
                .unwrap_or(self.config.chunk_size)
                .max(1),
            update_interval: request
                .update_interval
                .unwrap_or_else(|| self.config.update_interval()),
            fft_size: self.config.spectrum_fft_size,
            request,
            cancel,
        };

        if self.config.session_ack {
            bridge.put_from_thread(StreamMessage::SessionStarted {
                session_id: session_id.clone(),
                mode: SessionMode::Analysis,
            });
        }

        let store = self.store.clone();
        let processor = self.processor.clone();
        let registry = self.registry.clone();
        let handle = std::thread::Builder::new()
            .name("stream-analyzer".to_string())
            .spawn(move || run_analysis(job, store, processor, registry, bridge))
            .map_err(|e| {
                self.registry.finalize(
                    &session_id,
                    SessionStatus::Failed,
                    Some(format!("worker spawn failed: {}", e)),
                );
                CaptureError::with_context("failed to spawn analysis worker", e)
            })?;
        self.registry.attach_worker(&session_id, handle);
        self.info(&format!("Analysis session {} created", session_id));
        Ok(session_id)
    }

    pub fn stop_session(&self, session_id: &str) -> bool {
        let stopped = self.registry.cancel(session_id);
        if stopped {
            self.info(&format!("Analysis session {} stopped", session_id));
        }
        stopped
    }
}

impl ComponentLogger for StreamAnalyzer {
    fn log_context(&self) -> LogContext {
        LogContext::new("StreamAnalyzer", "bridge")
    }
}

fn run_analysis(
    job: AnalysisJob,
    store: Arc<dyn ArtifactStore>,
    processor: Arc<dyn SignalProcessor>,
    registry: Arc<SessionRegistry>,
    bridge: Arc<MessageBridge<StreamMessage>>,
) {
    let logger = WorkerLogger::for_session("StreamAnalyzer", "bridge", &job.session_id);

    let (samples, metadata) = match store.load(&job.request.path) {
        Ok(loaded) => loaded,
        Err(e) => {
            logger.error(&format!("Failed to load {:?}: {}", job.request.path, e));
            registry.finalize(&job.session_id, SessionStatus::Failed, Some(e.to_string()));
            bridge.put_from_thread(StreamMessage::Error {
                session_id: job.session_id.clone(),
                error: e.to_string(),
                code: Some(e.code().to_string()),
            });
            return;
        }
    };

    let sample_rate = job.request.sample_rate.unwrap_or(metadata.sample_rate);
    let center_freq = job.request.center_freq.unwrap_or(metadata.center_freq);
    let total = samples.len();
    let include_extras = registry
        .mode(&job.session_id)
        .map(SessionMode::include_extras)
        .unwrap_or(true);
    logger.info(&format!(
        "Streaming {} samples at {:.0} sps in chunks of {}",
        total, sample_rate, job.chunk_size
    ));

    let mut processed = 0usize;
    for (seq, chunk) in samples.chunks(job.chunk_size).enumerate() {
        if job.cancel.is_cancelled() {
            break;
        }

        let mut views = chunk_views(chunk, sample_rate, processor.as_ref(), job.fft_size, include_extras);
        views.metadata.center_freq = Some(center_freq);
        registry.record_progress(&job.session_id, processed, Some(total));
        bridge.put_from_thread(data_message(
            &registry,
            &job.session_id,
            seq as u64,
            processed,
            total,
            views,
            None,
        ));

        processed += chunk.len();
        if job.cancel.wait_timeout(job.update_interval) {
            break;
        }
    }
    registry.record_progress(&job.session_id, processed, Some(total));

    if job.cancel.is_cancelled() {
        // Status setzt stop_session bereits
        logger.info(&format!("Cancelled after {} of {} samples", processed, total));
        return;
    }

    registry.finalize(&job.session_id, SessionStatus::Completed, None);
    bridge.put_from_thread(StreamMessage::AnalysisComplete {
        session_id: job.session_id.clone(),
        total_processed: processed,
        status: SessionStatus::Completed,
        result: None,
    });
    logger.info("Analysis complete");
}
