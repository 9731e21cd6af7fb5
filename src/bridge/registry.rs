// src/bridge/registry.rs
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::message::{ScanProgress, StreamViews};
use crate::core::lock::{lock_mutex, lock_mutex_with_timeout};
use crate::core::{CancelToken, ComponentLogger, LogContext, unix_seconds_now};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
/// `reap` skips a round instead of queueing behind a busy registry.
const REAP_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Analysis,
    Scan,
    Realtime,
}

impl SessionMode {
    /// Only analysis sessions carry the auxiliary views.
    pub fn include_extras(self) -> bool {
        matches!(self, SessionMode::Analysis)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Analysis => f.write_str("analysis"),
            SessionMode::Scan => f.write_str("scan"),
            SessionMode::Realtime => f.write_str("realtime"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Streaming,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Starting | SessionStatus::Streaming)
    }

    fn rank(self) -> u8 {
        match self {
            SessionStatus::Starting => 0,
            SessionStatus::Streaming => 1,
            _ => 2,
        }
    }

    /// Status only moves forward; a terminal status is final.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// Per-kind session details.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SessionKind {
    Analysis {
        file_path: PathBuf,
        total_samples: usize,
        processed_samples: usize,
    },
    Scan {
        fft_size: usize,
        num_segments: usize,
        round: u64,
        progress: Option<ScanProgress>,
    },
    Realtime {
        center_freq: f64,
        sample_rate: f64,
        processed_samples: usize,
    },
}

impl SessionKind {
    pub fn analysis(file_path: impl Into<PathBuf>) -> Self {
        SessionKind::Analysis {
            file_path: file_path.into(),
            total_samples: 0,
            processed_samples: 0,
        }
    }

    pub fn scan() -> Self {
        SessionKind::Scan {
            fft_size: 0,
            num_segments: 0,
            round: 0,
            progress: None,
        }
    }

    pub fn realtime(center_freq: f64, sample_rate: f64) -> Self {
        SessionKind::Realtime {
            center_freq,
            sample_rate,
            processed_samples: 0,
        }
    }

    pub fn mode(&self) -> SessionMode {
        match self {
            SessionKind::Analysis { .. } => SessionMode::Analysis,
            SessionKind::Scan { .. } => SessionMode::Scan,
            SessionKind::Realtime { .. } => SessionMode::Realtime,
        }
    }
}

struct StreamSession {
    kind: SessionKind,
    status: SessionStatus,
    error: Option<String>,
    started_at: f64,
    last_update: Option<f64>,
    terminated_at: Option<Instant>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl StreamSession {
    fn worker_exited(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn snapshot(&self, id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: id.to_string(),
            mode: self.kind.mode(),
            kind: self.kind.clone(),
            status: self.status,
            error: self.error.clone(),
            started_at: self.started_at,
            last_update: self.last_update,
        }
    }
}

/// Owned copy of a session for callers outside the lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub mode: SessionMode,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub started_at: f64,
    pub last_update: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadMeta {
    pub session_id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub include_extras: bool,
    pub last_update: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_progress: Option<ScanProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedPayload {
    pub meta: PayloadMeta,
    pub streams: StreamViews,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, StreamSession>>,
    grace_period: Duration,
}

impl SessionRegistry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            grace_period,
        }
    }

    /// Registers a new session under a fresh id.
    pub fn create(&self, kind: SessionKind) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.register(&id, kind);
        id
    }

    /// Registers `id`, or re-tags an existing non-terminal entry.
    pub fn register(&self, id: &str, kind: SessionKind) -> CancelToken {
        let mode = kind.mode();
        let mut sessions = lock_mutex(&self.sessions, "SessionRegistry::register");
        if let Some(existing) = sessions.get_mut(id) {
            if !existing.status.is_terminal() {
                existing.kind = kind;
            }
            return existing.cancel.clone();
        }

        let cancel = CancelToken::new();
        sessions.insert(
            id.to_string(),
            StreamSession {
                kind,
                status: SessionStatus::Starting,
                error: None,
                started_at: unix_seconds_now(),
                last_update: None,
                terminated_at: None,
                cancel: cancel.clone(),
                worker: None,
            },
        );
        drop(sessions);
        self.info(&format!("Session {} registered (mode={})", id, mode));
        cancel
    }

    pub fn attach_worker(&self, id: &str, worker: JoinHandle<()>) -> bool {
        let mut sessions = lock_mutex(&self.sessions, "SessionRegistry::attach_worker");
        match sessions.get_mut(id) {
            Some(session) => {
                session.worker = Some(worker);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        lock_mutex(&self.sessions, "SessionRegistry::contains").contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_mutex(&self.sessions, "SessionRegistry::len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        lock_mutex(&self.sessions, "SessionRegistry::status")
            .get(id)
            .map(|s| s.status)
    }

    pub fn mode(&self, id: &str) -> Option<SessionMode> {
        lock_mutex(&self.sessions, "SessionRegistry::mode")
            .get(id)
            .map(|s| s.kind.mode())
    }

    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        lock_mutex(&self.sessions, "SessionRegistry::snapshot")
            .get(id)
            .map(|s| s.snapshot(id))
    }

    pub fn cancel_token(&self, id: &str) -> Option<CancelToken> {
        lock_mutex(&self.sessions, "SessionRegistry::cancel_token")
            .get(id)
            .map(|s| s.cancel.clone())
    }

    /// Forward-only status change. Returns `false` if rejected.
    pub fn set_status(&self, id: &str, status: SessionStatus) -> bool {
        self.transition(id, status, None)
    }

    /// Moves the session to a terminal status, recording `error` if given.
    pub fn finalize(&self, id: &str, status: SessionStatus, error: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        let applied = self.transition(id, status, error);
        if applied {
            self.info(&format!("Session {} finalized as {:?}", id, status));
        }
        applied
    }

    /// Signals the worker and marks the session cancelled.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(token) = self.cancel_token(id) else {
            return false;
        };
        token.cancel();
        self.transition(id, SessionStatus::Cancelled, None);
        true
    }

    fn transition(&self, id: &str, status: SessionStatus, error: Option<String>) -> bool {
        let mut sessions = lock_mutex(&self.sessions, "SessionRegistry::transition");
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        if !session.status.can_transition_to(status) {
            log::debug!(
                "session {}: ignoring status change {:?} -> {:?}",
                id,
                session.status,
                status
            );
            return false;
        }
        session.status = status;
        session.last_update = Some(unix_seconds_now());
        if error.is_some() {
            session.error = error;
        }
        if status.is_terminal() {
            session.terminated_at = Some(Instant::now());
        }
        true
    }

    /// Records progress and moves a starting session to streaming.
    pub fn record_progress(&self, id: &str, processed: usize, total: Option<usize>) {
        let mut sessions = lock_mutex(&self.sessions, "SessionRegistry::record_progress");
        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        match &mut session.kind {
            SessionKind::Analysis {
                total_samples,
                processed_samples,
                ..
            } => {
                *processed_samples = processed;
                if let Some(total) = total {
                    *total_samples = total;
                }
            }
            SessionKind::Realtime {
                processed_samples, ..
            } => *processed_samples = processed,
            SessionKind::Scan { .. } => {}
        }
        Self::mark_streaming(session);
    }

    /// Updates the scan view of a live session. Unknown or terminal
    /// sessions are left alone and `false` is returned.
    pub fn record_scan(&self, id: &str, progress: ScanProgress, fft_size: usize) -> bool {
        let mut sessions = lock_mutex(&self.sessions, "SessionRegistry::record_scan");
        let Some(session) = sessions.get_mut(id).filter(|s| !s.status.is_terminal()) else {
            return false;
        };
        if let SessionKind::Scan {
            fft_size: size,
            num_segments,
            round,
            progress: current,
        } = &mut session.kind
        {
            *size = fft_size;
            *num_segments = progress.segments_total;
            *round = progress.round;
            *current = Some(progress);
        }
        Self::mark_streaming(session);
        true
    }

    fn mark_streaming(session: &mut StreamSession) {
        session.last_update = Some(unix_seconds_now());
        if session.status == SessionStatus::Starting {
            session.status = SessionStatus::Streaming;
        }
    }

    /// Removes terminal sessions whose worker has exited and whose grace
    /// period has elapsed. Returns the reclaimed ids.
    pub fn reap(&self) -> Vec<String> {
        let Some(mut sessions) =
            lock_mutex_with_timeout(&self.sessions, "SessionRegistry::reap", REAP_LOCK_TIMEOUT)
        else {
            return Vec::new();
        };

        let grace = self.grace_period;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                s.worker_exited() && s.terminated_at.is_some_and(|at| at.elapsed() >= grace)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut handles = Vec::new();
        for id in &expired {
            if let Some(mut session) = sessions.remove(id) {
                handles.extend(session.worker.take());
            }
        }
        drop(sessions);

        for handle in handles {
            if handle.join().is_err() {
                self.warn("Reaped session worker had panicked");
            }
        }
        if !expired.is_empty() {
            self.debug(&format!("Reaped {} session(s)", expired.len()));
        }
        expired
    }

    /// Shapes a payload for the session's mode. Compact modes drop the
    /// auxiliary views. Unknown sessions are treated as analysis.
    pub fn format_stream_payload(&self, id: &str, streams: StreamViews) -> FormattedPayload {
        let (mode, status, scan_progress) = {
            let sessions = lock_mutex(&self.sessions, "SessionRegistry::format_stream_payload");
            match sessions.get(id) {
                Some(session) => {
                    let progress = match &session.kind {
                        SessionKind::Scan { progress, .. } => progress.clone(),
                        _ => None,
                    };
                    (session.kind.mode(), session.status, progress)
                }
                None => (SessionMode::Analysis, SessionStatus::Streaming, None),
            }
        };

        let include_extras = mode.include_extras();
        let streams = if include_extras {
            streams
        } else {
            streams.compact()
        };

        FormattedPayload {
            meta: PayloadMeta {
                session_id: id.to_string(),
                mode,
                status,
                include_extras,
                last_update: unix_seconds_now(),
                scan_progress,
            },
            streams,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ComponentLogger for SessionRegistry {
    fn log_context(&self) -> LogContext {
        LogContext::new("SessionRegistry", "bridge")
    }
}
