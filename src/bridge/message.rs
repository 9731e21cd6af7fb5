use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::{SessionMode, SessionStatus};

/// Everything a consumer receives from a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Data(DataMessage),
    SessionStarted {
        session_id: String,
        mode: SessionMode,
    },
    AnalysisComplete {
        session_id: String,
        total_processed: usize,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        session_id: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl StreamMessage {
    pub fn session_id(&self) -> &str {
        match self {
            StreamMessage::Data(data) => &data.meta.session_id,
            StreamMessage::SessionStarted { session_id, .. }
            | StreamMessage::AnalysisComplete { session_id, .. }
            | StreamMessage::Error { session_id, .. } => session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Data(_) => "data",
            StreamMessage::SessionStarted { .. } => "session_started",
            StreamMessage::AnalysisComplete { .. } => "analysis_complete",
            StreamMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub meta: StreamMeta,
    pub streams: StreamViews,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_progress: Option<ScanProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub session_id: String,
    pub seq: u64,
    pub timestamp: f64,
    pub processed_samples: usize,
    pub total_samples: usize,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub include_extras: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeDomain {
    pub time: Vec<usize>,
    pub i_component: Vec<f32>,
    pub q_component: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyDomain {
    pub frequency: Vec<f64>,
    pub power: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constellation {
    pub i_component: Vec<f32>,
    pub q_component: Vec<f32>,
}

/// Placeholder for cyclostationary views, filled by richer processors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HigherOrder {
    pub frequency: Vec<f64>,
    pub quadratic_power: Vec<f64>,
    pub quartic_power: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fft_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_freq: Option<f64>,
    /// Set on the merged spectrum published at the end of a round.
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamViews {
    pub time_domain: TimeDomain,
    pub frequency_domain: FrequencyDomain,
    pub constellation: Constellation,
    pub higher_order: HigherOrder,
    #[serde(default)]
    pub metadata: ViewMetadata,
}

impl StreamViews {
    /// Keeps only the spectrum, used for compact session modes.
    pub fn compact(mut self) -> Self {
        self.time_domain = TimeDomain::default();
        self.constellation = Constellation::default();
        self.higher_order = HigherOrder::default();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub progress: f64,
    pub current_segment: usize,
    pub segments_total: usize,
    /// MHz
    pub current_center_freq: f64,
    pub round: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tag() {
        let msg = StreamMessage::SessionStarted {
            session_id: "s1".into(),
            mode: SessionMode::Analysis,
        };
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "session_started");
        assert_eq!(json["mode"], "analysis");
        assert_eq!(msg.kind(), "session_started");
        assert_eq!(msg.session_id(), "s1");
    }

    #[test]
    fn test_data_message_shape() {
        let msg = StreamMessage::Data(DataMessage {
            meta: StreamMeta {
                session_id: "s2".into(),
                seq: 4,
                timestamp: 1.5,
                processed_samples: 4096,
                total_samples: 8192,
                mode: SessionMode::Scan,
                status: SessionStatus::Streaming,
                include_extras: false,
            },
            streams: StreamViews {
                frequency_domain: FrequencyDomain {
                    frequency: vec![88.0, 88.1],
                    power: vec![-60.0, -61.0],
                },
                metadata: ViewMetadata {
                    fft_size: Some(1024),
                    round: Some(2),
                    ..Default::default()
                },
                ..Default::default()
            },
            scan_progress: Some(ScanProgress {
                progress: 0.5,
                current_segment: 2,
                segments_total: 4,
                current_center_freq: 98.0,
                round: 2,
            }),
        });

        let json: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["meta"]["seq"], 4);
        assert_eq!(json["streams"]["frequency_domain"]["frequency"][1], 88.1);
        assert_eq!(json["streams"]["metadata"]["fft_size"], 1024);
        assert_eq!(json["scan_progress"]["segments_total"], 4);
        assert!(json["streams"]["time_domain"]["time"].as_array().unwrap().is_empty());

        let back: StreamMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_compact_views() {
        let views = StreamViews {
            time_domain: TimeDomain {
                time: vec![0, 1],
                i_component: vec![1.0, 0.0],
                q_component: vec![0.0, 1.0],
            },
            frequency_domain: FrequencyDomain {
                frequency: vec![1.0],
                power: vec![2.0],
            },
            ..Default::default()
        }
        .compact();
        assert!(views.time_domain.time.is_empty());
        assert_eq!(views.frequency_domain.power, vec![2.0]);
    }
}
