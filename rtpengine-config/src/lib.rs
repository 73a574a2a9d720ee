//! Configuration management for the RTP media engine
//!
//! Covers process-wide defaults only. Per-call parameters (delay, writeto,
//! readfrom, repeat, socket bindings) are supplied programmatically by the
//! signaling layer at session creation and are not sourced from here.

use serde::Deserialize;
use std::env;

/// Default RTP packetization parameters, used when signaling does not
/// negotiate an override.
///
/// The canonical PCMU/8000 triple is `(0, 160, 20)`: payload type 0, 160
/// samples per 20 ms packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RtpParamsDefaults {
    pub payload_type: u8,
    pub samples_per_packet: u32,
    pub packet_interval_ms: u32,
}

impl Default for RtpParamsDefaults {
    fn default() -> Self {
        RtpParamsDefaults {
            payload_type: 0,
            samples_per_packet: 160,
            packet_interval_ms: 20,
        }
    }
}

/// Process-wide engine defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineDefaults {
    pub rtp_params: RtpParamsDefaults,
    /// Seconds of silence before a session's inactivity watchdog fires.
    pub inactivity_timeout_secs: u64,
    /// Number of identical datagrams sent for a DTMF end packet.
    pub dtmf_end_repeat: u32,
    pub log_level: String,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        EngineDefaults {
            rtp_params: RtpParamsDefaults::default(),
            inactivity_timeout_secs: 10,
            dtmf_end_repeat: 3,
            log_level: "info".to_string(),
        }
    }
}

impl EngineDefaults {
    /// Load configuration from environment variables, falling back to the
    /// PCMU/8000 defaults for anything unset.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let payload_type = env::var("RTP_DEFAULT_PAYLOAD_TYPE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rtp_params.payload_type);
        let samples_per_packet = env::var("RTP_SAMPLES_PER_PACKET")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rtp_params.samples_per_packet);
        let packet_interval_ms = env::var("RTP_PACKET_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rtp_params.packet_interval_ms);

        let inactivity_timeout_secs = env::var("RTP_INACTIVITY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.inactivity_timeout_secs);
        let dtmf_end_repeat = env::var("RTP_DTMF_END_REPEAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.dtmf_end_repeat);
        let log_level = env::var("LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(EngineDefaults {
            rtp_params: RtpParamsDefaults {
                payload_type,
                samples_per_packet,
                packet_interval_ms,
            },
            inactivity_timeout_secs,
            dtmf_end_repeat,
            log_level,
        })
    }
}
