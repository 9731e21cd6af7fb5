// src/core/logging.rs
use std::sync::atomic::{AtomicU64, Ordering};

// Globale Sequenznummer für Korrelation
static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LogContext {
    pub component: String,
    pub instance_id: String,
    pub session_id: Option<String>,
    pub sequence: u64,
}

impl LogContext {
    pub fn new(component: &str, instance_id: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id: instance_id.to_string(),
            session_id: None,
            sequence: LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn format(&self, level: &str, message: &str) -> String {
        let session_info = match &self.session_id {
            Some(session) => format!(" session={}", session),
            None => String::new(),
        };

        format!(
            "[{}][seq={:06}][{}:{}{}] {}",
            level, self.sequence, self.component, self.instance_id, session_info, message
        )
    }
}

// Einheitliches Logging für Recorder, Scanner und Bridge
pub trait ComponentLogger {
    fn log_context(&self) -> LogContext;

    fn debug(&self, message: &str) {
        log::debug!("{}", self.log_context().format("DEBUG", message));
    }

    fn info(&self, message: &str) {
        log::info!("{}", self.log_context().format("INFO", message));
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", self.log_context().format("WARN", message));
    }

    fn error(&self, message: &str) {
        log::error!("{}", self.log_context().format("ERROR", message));
    }
}

/// Session-scoped logger for worker threads that no longer hold their owner.
#[derive(Debug, Clone)]
pub struct WorkerLogger {
    component: &'static str,
    instance_id: String,
    session_id: String,
}

impl WorkerLogger {
    pub fn for_session(component: &'static str, instance_id: &str, session_id: &str) -> Self {
        Self {
            component,
            instance_id: instance_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

impl ComponentLogger for WorkerLogger {
    fn log_context(&self) -> LogContext {
        LogContext::new(self.component, &self.instance_id).with_session(&self.session_id)
    }
}
