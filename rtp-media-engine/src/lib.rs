//! RTP media engine for a SIP user-agent call
//!
//! This crate provides the per-call media transport layer:
//! - RTP packet parsing and construction (RFC 3550)
//! - RFC 2833/4733 DTMF injection, with a µ-law tone fallback
//! - Echo and send/recv session controllers
//! - An inactivity watchdog that tears the call down on silence
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


pub mod dtmf;
pub mod error;
pub mod framer;
pub mod rtp_handler;
pub mod session;

pub use dtmf::{DtmfEngine, DtmfEvent, DtmfOutcome, DtmfOutput, DtmfSymbol};
pub use error::{RtpEngineError, RtpEngineResult};
pub use framer::{send_frame, OutboundFrame, DEFAULT_SSRC};
pub use rtp_handler::{ExtensionHeader, RtpHeader, RtpPacket};
pub use session::{
    run_echo_session, run_recv_session, run_send_session, CallHandle, Cleanup,
    EchoSessionConfig, PayloadCallbackResult, PlaybackSource, RecordSink, RecvConfig, RemoteAddr,
    RtpParams, SendConfig,
};
