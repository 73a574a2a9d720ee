//! Error types for the RTP media engine
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use thiserror::Error;

/// Result type for media engine operations
pub type RtpEngineResult<T> = Result<T, RtpEngineError>;

/// Errors that can occur in the RTP media engine.
///
/// Malformed or reordered inbound packets are not represented here: per the
/// parser's silent-drop policy they never surface as `Err`, they are simply
/// not delivered to the recorder.
#[derive(Error, Debug)]
pub enum RtpEngineError {
    /// RTP packet parsing error
    #[error("RTP packet parse error: {0}")]
    RtpParseError(String),

    /// Socket I/O failure, fatal to the session
    #[error("RTP socket I/O error: {0}")]
    SocketError(String),

    /// Record file could not be opened
    #[error("failed to open record file {path}: {source}")]
    RecordFileError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Playback file could not be opened or read
    #[error("failed to read playback file {path}: {source}")]
    PlaybackFileError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// DTMF event configured with neither an RFC 2833 nor an audio payload type
    #[error("neither rfc2833 nor audio are supported by peer")]
    DtmfUnsupported,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for RtpEngineError {
    fn from(err: std::io::Error) -> Self {
        RtpEngineError::SocketError(err.to_string())
    }
}
