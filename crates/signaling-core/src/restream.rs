//! RTP re-streaming
//!
//! Optionally hands the mixed call to an external transcoder: an RTP endpoint
//! in the pipeline is given a receive-only SDP offer pointing at a local port
//! pair, the same SDP is written to disk, and ffmpeg reads it and publishes
//! the stream to an RTMP ingest. The process is killed when the call is torn
//! down.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::backend::{BackendError, MediaBackend};
use crate::types::ElementId;

/// Failures while starting a re-stream
#[derive(Debug, Error)]
pub enum RestreamError {
    #[error("RTP endpoint rejected the stream offer: {0}")]
    Backend(#[from] BackendError),

    #[error("Failed to write stream descriptor {path}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Re-streaming settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestreamConfig {
    /// Address the media server sends RTP to
    pub stream_ip: String,
    /// First video port; each stream uses `base + 2 * index`
    pub video_port_base: u16,
    /// First audio port; each stream uses `base + 2 * index`
    pub audio_port_base: u16,
    /// Audio clock rate advertised in the offer (must match the media server's SdpEndpoint config)
    pub audio_sample_rate: u32,
    /// Number of port pairs before allocation wraps around
    pub max_streams: u32,
    /// Where the SDP descriptor files are written
    pub sdp_directory: PathBuf,
    /// RTMP application URL the transcoder publishes to
    pub rtmp_base_url: String,
    pub ffmpeg_path: String,
}

impl Default for RestreamConfig {
    fn default() -> Self {
        Self {
            stream_ip: "127.0.0.1".to_string(),
            video_port_base: 55000,
            audio_port_base: 49170,
            audio_sample_rate: 22050,
            max_streams: 1000,
            sdp_directory: std::env::temp_dir(),
            rtmp_base_url: "rtmp://127.0.0.1:1935/live".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl RestreamConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_streams == 0 {
            return Err("restream.max_streams must be greater than zero".to_string());
        }
        let span = 2 * (self.max_streams as u64 - 1);
        if self.video_port_base as u64 + span > u16::MAX as u64 {
            return Err("restream.video_port_base leaves no room for max_streams port pairs".to_string());
        }
        if self.audio_port_base as u64 + span > u16::MAX as u64 {
            return Err("restream.audio_port_base leaves no room for max_streams port pairs".to_string());
        }
        if self.rtmp_base_url.is_empty() {
            return Err("restream.rtmp_base_url must not be empty".to_string());
        }
        Ok(())
    }
}

/// Ports assigned to one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPorts {
    pub video: u16,
    pub audio: u16,
}

/// Build the receive-only RTP offer given to the pipeline's RTP endpoint
pub fn rtp_offer(stream_ip: &str, ports: StreamPorts, audio_sample_rate: u32) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- 0 0 IN IP4 {}\r\n", stream_ip));
    sdp.push_str("s=KMS\r\n");
    sdp.push_str(&format!("c=IN IP4 {}\r\n", stream_ip));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!("m=audio {} RTP/AVP 97\r\n", ports.audio));
    sdp.push_str("a=recvonly\r\n");
    sdp.push_str(&format!("a=rtpmap:97 PCMU/{}\r\n", audio_sample_rate));
    sdp.push_str(&format!("m=video {} RTP/AVP 96\r\n", ports.video));
    sdp.push_str("a=rtpmap:96 H264/90000\r\n");
    sdp.push_str("a=fmtp:96 packetization-mode=1\r\n");
    sdp
}

/// A running transcoder process and the descriptor it reads
#[derive(Debug)]
pub struct RestreamProcess {
    child: Child,
    sdp_path: PathBuf,
    pub publish_url: String,
    pub ports: StreamPorts,
}

impl RestreamProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the transcoder and remove its descriptor file
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(publish_url = %self.publish_url, "Failed to kill re-stream process: {}", e);
        }
        if let Err(e) = tokio::fs::remove_file(&self.sdp_path).await {
            tracing::debug!(path = %self.sdp_path.display(), "Stream descriptor not removed: {}", e);
        }
        tracing::info!(publish_url = %self.publish_url, "Re-stream stopped");
    }
}

/// Starts re-streams and hands out their port pairs
#[derive(Debug)]
pub struct Restreamer {
    config: RestreamConfig,
    next_index: AtomicU32,
}

impl Restreamer {
    pub fn new(config: RestreamConfig) -> Self {
        Self {
            config,
            next_index: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &RestreamConfig {
        &self.config
    }

    /// Next port pair, wrapping after `max_streams`
    pub fn allocate_ports(&self) -> StreamPorts {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed) % self.config.max_streams.max(1);
        let offset = (index * 2) as u16;
        StreamPorts {
            video: self.config.video_port_base + offset,
            audio: self.config.audio_port_base + offset,
        }
    }

    pub fn descriptor_path(&self, ports: StreamPorts) -> PathBuf {
        self.config
            .sdp_directory
            .join(format!("{}_{}.sdp", self.config.stream_ip, ports.video))
    }

    /// RTMP URL for a descriptor: the file stem with dots replaced
    pub fn publish_url(&self, sdp_path: &Path) -> String {
        let stem = sdp_path
            .file_stem()
            .map(|s| s.to_string_lossy().replace('.', "_"))
            .unwrap_or_default();
        format!("{}/{}", self.config.rtmp_base_url.trim_end_matches('/'), stem)
    }

    pub fn ffmpeg_args(&self, sdp_path: &Path, publish_url: &str) -> Vec<String> {
        vec![
            "-analyzeduration".to_string(),
            "40M".to_string(),
            "-protocol_whitelist".to_string(),
            "file,udp,rtp".to_string(),
            "-i".to_string(),
            sdp_path.display().to_string(),
            "-vcodec".to_string(),
            "copy".to_string(),
            "-acodec".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "flv".to_string(),
            publish_url.to_string(),
        ]
    }

    /// Negotiate the RTP endpoint, write the descriptor and launch the transcoder
    pub async fn start(
        &self,
        backend: &dyn MediaBackend,
        rtp_endpoint: &ElementId,
    ) -> Result<RestreamProcess, RestreamError> {
        let ports = self.allocate_ports();
        let offer = rtp_offer(&self.config.stream_ip, ports, self.config.audio_sample_rate);
        backend.process_offer(rtp_endpoint, &offer).await?;

        let sdp_path = self.descriptor_path(ports);
        tokio::fs::write(&sdp_path, &offer)
            .await
            .map_err(|source| RestreamError::Descriptor {
                path: sdp_path.clone(),
                source,
            })?;

        let publish_url = self.publish_url(&sdp_path);
        let child = Command::new(&self.config.ffmpeg_path)
            .args(self.ffmpeg_args(&sdp_path, &publish_url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RestreamError::Spawn {
                program: self.config.ffmpeg_path.clone(),
                source,
            })?;

        tracing::info!(
            element = %rtp_endpoint,
            video_port = ports.video,
            audio_port = ports.audio,
            publish_url = %publish_url,
            "Re-stream started"
        );

        Ok(RestreamProcess {
            child,
            sdp_path,
            publish_url,
            ports,
        })
    }
}
