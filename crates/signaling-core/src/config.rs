//! Broker configuration

use crate::restream::RestreamConfig;
use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the two WebRTC endpoints of a call are wired inside the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaTopology {
    /// Endpoints connected to each other; the caller's media is tapped into the recorder
    #[default]
    Direct,
    /// Endpoints connected to each other and to a composite hub; the recorder
    /// (and the RTP re-streaming endpoint, if any) receive the mixed output
    Composite,
}

/// Where and how call recordings are written by the media server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// URI prefix understood by the media server, e.g. `file:///tmp`
    pub base_uri: String,
    /// Container extension, which also selects the format on Kurento
    pub extension: String,
    /// Explicit media profile (e.g. `WEBM`, `MP4`); server default when unset
    pub media_profile: Option<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            base_uri: "file:///tmp".to_string(),
            extension: "webm".to_string(),
            media_profile: None,
        }
    }
}

impl RecordingConfig {
    /// Recording URI for the call between `caller` and `callee`
    pub fn uri_for(&self, caller: &SessionId, callee: &SessionId) -> String {
        format!(
            "{}/video-{}-to-{}.{}",
            self.base_uri.trim_end_matches('/'),
            caller,
            callee,
            self.extension
        )
    }
}

/// Configuration of the call orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub topology: MediaTopology,
    pub recording: RecordingConfig,
    /// RTP re-streaming through an external process; disabled when unset
    pub restream: Option<RestreamConfig>,
    /// How long a call may ring before it is cancelled; no limit when unset
    pub ring_timeout_secs: Option<u64>,
    /// How long both sides may take to finish ICE gathering; no limit when unset
    pub gathering_timeout_secs: Option<u64>,
    /// Candidates kept per session while no endpoint is bound
    pub max_pending_candidates: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topology: MediaTopology::Direct,
            recording: RecordingConfig::default(),
            restream: None,
            ring_timeout_secs: Some(60),
            gathering_timeout_secs: Some(30),
            max_pending_candidates: 64,
        }
    }
}

impl BrokerConfig {
    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs.map(Duration::from_secs)
    }

    pub fn gathering_timeout(&self) -> Option<Duration> {
        self.gathering_timeout_secs.map(Duration::from_secs)
    }

    pub fn with_topology(mut self, topology: MediaTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_restream(mut self, restream: RestreamConfig) -> Self {
        self.restream = Some(restream);
        self
    }

    /// Check values that would only fail later, deep inside a call
    pub fn validate(&self) -> Result<(), String> {
        if self.recording.base_uri.is_empty() {
            return Err("recording.base_uri must not be empty".to_string());
        }
        if self.recording.extension.is_empty() {
            return Err("recording.extension must not be empty".to_string());
        }
        if self.ring_timeout_secs == Some(0) {
            return Err("ring_timeout_secs must be greater than zero".to_string());
        }
        if self.gathering_timeout_secs == Some(0) {
            return Err("gathering_timeout_secs must be greater than zero".to_string());
        }
        if self.max_pending_candidates == 0 {
            return Err("max_pending_candidates must be greater than zero".to_string());
        }
        if let Some(restream) = &self.restream {
            restream.validate()?;
        }
        Ok(())
    }
}
