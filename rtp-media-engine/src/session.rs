//! Session controllers (§4.4, §4.5)
//!
//! Owns the per-socket receive path, the per-call send timer, the
//! inactivity watchdog, and cleanup registration. Two flavors share the
//! same building blocks: the echo session (receive, optionally record,
//! echo back after a configurable delay) and the send/recv session
//! (receive, optionally record; independently transmit from a file or
//! callback at a fixed packetization interval).
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

use crate::dtmf::DtmfEngine;
use crate::error::{RtpEngineError, RtpEngineResult};
use crate::framer::{send_frame, OutboundFrame, DEFAULT_SSRC};
use crate::rtp_handler::RtpPacket;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// RTP packetization parameters: `(default_payload_type, samples_per_packet,
/// packet_interval_ms)` (§3). The canonical PCMU/8000 triple is `(0, 160, 20)`.
#[derive(Debug, Clone, Copy)]
pub struct RtpParams {
    pub default_payload_type: u8,
    pub samples_per_packet: u32,
    pub packet_interval_ms: u64,
}

/// The call's remote media address. `None` means "on hold": reception
/// continues, transmission is suppressed.
pub type RemoteAddr = Arc<RwLock<Option<SocketAddr>>>;

/// A unit of teardown work, run in LIFO order on session cleanup.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// The narrow slice of the call object this engine consumes (§6).
pub trait CallHandle: Send + Sync {
    fn bye(&self);
    fn register_cleanup(&self, cleanup: Cleanup);
}

/// Where received payload is recorded, if at all.
pub enum RecordSink {
    File(FileRecordSink),
    Callback(Box<dyn FnMut(&[u8], u16, u32) + Send>),
}

impl RecordSink {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        RecordSink::File(FileRecordSink::new(path.into()))
    }
}

/// A record-file handle, opened lazily on first write and held open for the
/// life of the session (§3's `SessionState.record-file handle`).
pub struct FileRecordSink {
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl FileRecordSink {
    pub fn new(path: PathBuf) -> Self {
        FileRecordSink { path, file: None }
    }

    fn write(&mut self, payload: &[u8]) -> RtpEngineResult<()> {
        use std::io::Write;
        if self.file.is_none() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|source| RtpEngineError::RecordFileError {
                    path: self.path.display().to_string(),
                    source,
                })?;
            self.file = Some(file);
        }
        let file = self.file.as_mut().expect("opened above");
        file.write_all(payload).map_err(|source| RtpEngineError::RecordFileError {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Sum type for a send-path payload callback's return value (§9): either
/// plain bytes, or bytes with header-field overrides.
pub enum PayloadCallbackResult {
    Bytes(Bytes),
    WithOverrides {
        bytes: Bytes,
        payload_type: Option<u8>,
        marker: Option<bool>,
        timestamp: Option<u32>,
    },
}

impl PayloadCallbackResult {
    fn bytes(&self) -> &Bytes {
        match self {
            PayloadCallbackResult::Bytes(b) => b,
            PayloadCallbackResult::WithOverrides { bytes, .. } => bytes,
        }
    }
}

/// Where outbound payload comes from on the send path.
pub enum PlaybackSource {
    File(PathBuf),
    Callback(Box<dyn FnMut(u16) -> Option<PayloadCallbackResult> + Send>),
}

/// Record-file open/write failure is fatal to the session (§4.1, §7);
/// callers must abort the session loop on `Err`.
fn record(sink: &mut Option<RecordSink>, payload: &[u8], seq: u16, timestamp: u32) -> RtpEngineResult<()> {
    match sink {
        Some(RecordSink::Callback(cb)) => {
            cb(payload, seq, timestamp);
            Ok(())
        }
        Some(RecordSink::File(recorder)) => recorder.write(payload),
        None => Ok(()),
    }
}

/// A received packet is dropped if `prev_seq >= seq` and
/// `prev_seq - seq < 60000`, guarding against reorder while allowing wrap.
fn is_reordered(prev_seq: u16, seq: u16) -> bool {
    let prev = prev_seq as u32;
    let cur = seq as u32;
    prev >= cur && prev - cur < 60000
}

/// Per-socket receive-path tracking shared by both session flavors.
struct ReceiveState {
    last_seq: Option<u16>,
    last_timestamp: Option<u32>,
    /// Inferred timestamp-per-packet slope (§4.4), `None` until two
    /// accepted packets have been observed.
    ltdiff: Option<u32>,
}

impl ReceiveState {
    fn new() -> Self {
        ReceiveState {
            last_seq: None,
            last_timestamp: None,
            ltdiff: None,
        }
    }

    /// Returns `Some(seq, timestamp)` if the packet is accepted, updating
    /// `ltdiff` along the way; `None` if it is a reorder/duplicate.
    fn accept(&mut self, seq: u16, timestamp: u32) -> Option<(u16, u32)> {
        if let Some(prev_seq) = self.last_seq {
            if is_reordered(prev_seq, seq) {
                return None;
            }
            if let Some(prev_ts) = self.last_timestamp {
                let delta_seq = seq.wrapping_sub(prev_seq) as u32;
                let delta_ts = timestamp.wrapping_sub(prev_ts);
                if let Some(ltdiff) = delta_ts.checked_div(delta_seq) {
                    self.ltdiff = Some(ltdiff);
                }
            }
        }
        self.last_seq = Some(seq);
        self.last_timestamp = Some(timestamp);
        Some((seq, timestamp))
    }
}

async fn remote_of(remote: &RemoteAddr) -> Option<SocketAddr> {
    *remote.read().await
}

// ---------------------------------------------------------------------
// Echo session (§4.4)
// ---------------------------------------------------------------------

/// Configuration for an echo session.
pub struct EchoSessionConfig {
    /// `< 0`: recv-only. `0`: immediate echo. `n > 0`: echo after `n`
    /// packets held.
    pub delay: i64,
    pub writeto: Option<RecordSink>,
    pub dtmf: DtmfEngine,
}

/// Run an echo session until the call ends or the inactivity watchdog
/// fires. Intended to be spawned as one `tokio::task` per media stream.
pub async fn run_echo_session(
    recv_socket: Arc<UdpSocket>,
    send_socket: Arc<UdpSocket>,
    remote: RemoteAddr,
    rtp_params: RtpParams,
    mut config: EchoSessionConfig,
    call: Arc<dyn CallHandle>,
    inactivity_timeout: Duration,
) {
    let mut recv_state = ReceiveState::new();
    let mut delay_buffer: VecDeque<(u16, u32, Bytes)> = VecDeque::new();
    let mut out_seq: Option<u16> = None;
    let mut out_timestamp: Option<u32> = None;
    let mut last_activity = Instant::now();
    let mut watchdog = tokio::time::interval(inactivity_timeout);
    watchdog.tick().await; // first tick is immediate; consume it so the real interval starts now

    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            recv = recv_socket.recv_from(&mut buf) => {
                let (n, _from) = match recv {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(?err, "echo session recv error");
                        continue;
                    }
                };

                let packet = match RtpPacket::parse(&buf[..n]) {
                    Ok(p) => p,
                    Err(_) => continue, // malformed/short/version mismatch: didit unchanged (§8)
                };
                let seq = packet.header.sequence_number;
                let timestamp = packet.header.timestamp;

                let Some((seq, timestamp)) = recv_state.accept(seq, timestamp) else {
                    debug!(seq, "dropping reordered/duplicate RTP packet");
                    continue;
                };
                last_activity = Instant::now();

                if let Err(err) = record(&mut config.writeto, &packet.payload, seq, timestamp) {
                    error!(?err, "fatal error recording inbound payload");
                    break;
                }

                if !config.dtmf.is_empty() {
                    if let (Some(ltdiff), Some(dest)) = (recv_state.ltdiff, remote_of(&remote).await) {
                        let now_timestamp = out_timestamp.unwrap_or(timestamp).wrapping_add(ltdiff);
                        if let Some(dtmf_out) = config.dtmf.poll(now_timestamp, ltdiff, Instant::now(), rtp_params.samples_per_packet) {
                            let next_seq = out_seq.map(|s| s.wrapping_add(1)).unwrap_or(seq);
                            let ts = dtmf_out.timestamp_override.unwrap_or(now_timestamp);
                            out_seq = Some(next_seq);
                            out_timestamp = Some(ts);

                            let frame = OutboundFrame::new(dtmf_out.payload_type, dtmf_out.marker, next_seq, ts, DEFAULT_SSRC, dtmf_out.payload)
                                .with_repeat(dtmf_out.repeat);
                            if let Err(err) = send_frame(&send_socket, dest, &frame).await {
                                error!(?err, "fatal socket error sending DTMF packet");
                                break;
                            }
                            continue;
                        }
                    }
                }

                out_seq = Some(seq);
                out_timestamp = Some(timestamp);

                if config.delay < 0 {
                    continue; // recv-only
                }

                delay_buffer.push_back((seq, timestamp, packet.payload));
                while delay_buffer.len() as i64 > config.delay {
                    let Some((echo_seq, echo_ts, echo_payload)) = delay_buffer.pop_front() else { break };
                    if let Some(dest) = remote_of(&remote).await {
                        let frame = OutboundFrame::new(rtp_params.default_payload_type, false, echo_seq, echo_ts, DEFAULT_SSRC, echo_payload);
                        if let Err(err) = send_frame(&send_socket, dest, &frame).await {
                            error!(?err, "fatal socket error echoing packet");
                            return;
                        }
                    }
                }
            }
            _ = watchdog.tick() => {
                if last_activity.elapsed() >= inactivity_timeout {
                    info!("echo session inactive for {:?}, ending call", inactivity_timeout);
                    call.bye();
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Send/recv session (§4.5)
// ---------------------------------------------------------------------

/// `repeat <= 0` means infinite; `> 0` is the number of passes remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepeatBudget {
    Infinite,
    Remaining(u32),
}

impl RepeatBudget {
    fn from_config(repeat: i64) -> Self {
        if repeat <= 0 {
            RepeatBudget::Infinite
        } else {
            RepeatBudget::Remaining(repeat as u32)
        }
    }

    /// Returns `true` if the budget is exhausted after this decrement.
    fn consume_one(&mut self) -> bool {
        match self {
            RepeatBudget::Infinite => false,
            RepeatBudget::Remaining(n) => {
                *n -= 1;
                *n == 0
            }
        }
    }
}

struct FilePlayback {
    path: PathBuf,
    file: Option<std::fs::File>,
    repeat: RepeatBudget,
}

impl FilePlayback {
    fn new(path: PathBuf, repeat: i64) -> Self {
        FilePlayback {
            path,
            file: None,
            repeat: RepeatBudget::from_config(repeat),
        }
    }

    fn open(&mut self) -> RtpEngineResult<()> {
        let file = std::fs::File::open(&self.path).map_err(|source| RtpEngineError::PlaybackFileError {
            path: self.path.display().to_string(),
            source,
        })?;
        self.file = Some(file);
        Ok(())
    }

    /// Reads exactly `n` bytes, reopening from the start on EOF per the
    /// retry-once contract. Returns `None` once the repeat budget is
    /// exhausted.
    fn read_exact_with_repeat(&mut self, n: usize) -> RtpEngineResult<Option<Bytes>> {
        if self.file.is_none() {
            self.open()?;
        }

        let mut out = vec![0u8; n];
        let read = self.try_read(&mut out)?;
        if read == n {
            return Ok(Some(Bytes::from(out)));
        }

        // Short read / EOF: close, apply repeat budget, retry once.
        self.file = None;
        if self.repeat.consume_one() {
            return Ok(None);
        }
        self.open()?;
        let read = self.try_read(&mut out)?;
        if read == n {
            Ok(Some(Bytes::from(out)))
        } else {
            Ok(None)
        }
    }

    fn try_read(&mut self, out: &mut [u8]) -> RtpEngineResult<usize> {
        let file = self.file.as_mut().expect("opened above");
        let mut total = 0;
        while total < out.len() {
            match file.read(&mut out[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) => {
                    return Err(RtpEngineError::PlaybackFileError {
                        path: self.path.display().to_string(),
                        source: err,
                    })
                }
            }
        }
        Ok(total)
    }
}

/// Configuration for a send/recv session's transmit path.
pub struct SendConfig {
    pub rtp_params: RtpParams,
    pub readfrom: Option<PlaybackSource>,
    /// Only meaningful when `readfrom` is `PlaybackSource::File`.
    pub repeat: i64,
    pub dtmf: DtmfEngine,
    /// Invoked when playback is exhausted or the payload callback ends the
    /// session. Defaults to `call.bye()` when `None`.
    pub cb_done: Option<Box<dyn FnOnce() + Send>>,
}

/// Configuration for a send/recv session's receive path.
pub struct RecvConfig {
    pub writeto: Option<RecordSink>,
}

/// Run the receive half of a send/recv session (symmetric with the echo
/// session's receive path, minus the echo).
pub async fn run_recv_session(
    recv_socket: Arc<UdpSocket>,
    mut config: RecvConfig,
    call: Arc<dyn CallHandle>,
    inactivity_timeout: Duration,
    last_activity: Arc<std::sync::Mutex<Instant>>,
) {
    let mut recv_state = ReceiveState::new();
    let mut watchdog = tokio::time::interval(inactivity_timeout);
    watchdog.tick().await;

    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            recv = recv_socket.recv_from(&mut buf) => {
                let (n, _from) = match recv {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(?err, "recv session socket error");
                        continue;
                    }
                };

                let packet = match RtpPacket::parse(&buf[..n]) {
                    Ok(p) => p,
                    Err(_) => continue, // malformed/short/version mismatch: didit unchanged (§8)
                };
                let Some((seq, timestamp)) = recv_state.accept(packet.header.sequence_number, packet.header.timestamp) else {
                    continue;
                };
                *last_activity.lock().unwrap() = Instant::now();

                if let Err(err) = record(&mut config.writeto, &packet.payload, seq, timestamp) {
                    error!(?err, "fatal error recording inbound payload");
                    break;
                }
            }
            _ = watchdog.tick() => {
                if last_activity.lock().unwrap().elapsed() >= inactivity_timeout {
                    info!("recv session inactive for {:?}, ending call", inactivity_timeout);
                    call.bye();
                    break;
                }
            }
        }
    }
}

/// Run the transmit half of a send/recv session: a periodic timer firing
/// every `rtp_params.packet_interval_ms`, first tick immediate.
pub async fn run_send_session(
    send_socket: Arc<UdpSocket>,
    remote: RemoteAddr,
    mut config: SendConfig,
    call: Arc<dyn CallHandle>,
    last_activity: Arc<std::sync::Mutex<Instant>>,
) {
    let rtp_params = config.rtp_params;
    let mut wseq: u16 = rand::random();
    let mut file_playback = match &config.readfrom {
        Some(PlaybackSource::File(path)) => Some(FilePlayback::new(path.clone(), config.repeat)),
        _ => None,
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(rtp_params.packet_interval_ms));

    loop {
        ticker.tick().await;
        wseq = wseq.wrapping_add(1);
        let timestamp = (rtp_params.samples_per_packet.wrapping_mul(wseq as u32)) as u32;

        let Some(dest) = remote_of(&remote).await else {
            continue; // on hold: keep ticking, skip transmission (and DTMF)
        };

        if let Some(dtmf_out) = config
            .dtmf
            .poll(timestamp, rtp_params.samples_per_packet, Instant::now(), rtp_params.samples_per_packet)
        {
            let ts = dtmf_out.timestamp_override.unwrap_or(timestamp);
            let frame = OutboundFrame::new(dtmf_out.payload_type, dtmf_out.marker, wseq, ts, DEFAULT_SSRC, dtmf_out.payload)
                .with_repeat(dtmf_out.repeat);
            if let Err(err) = send_frame(&send_socket, dest, &frame).await {
                error!(?err, "fatal socket error sending DTMF packet");
                break;
            }
            continue;
        }

        let resolved = obtain_payload(&mut config.readfrom, &mut file_playback, wseq, rtp_params.samples_per_packet);
        let payload = match resolved {
            ObtainedPayload::Payload { bytes, payload_type, marker, timestamp_override } => {
                let pt = payload_type.unwrap_or(rtp_params.default_payload_type);
                let ts = timestamp_override.unwrap_or(timestamp);
                let frame = OutboundFrame::new(pt, marker.unwrap_or(false), wseq, ts, DEFAULT_SSRC, bytes);
                if let Err(err) = send_frame(&send_socket, dest, &frame).await {
                    error!(?err, "fatal socket error on send path");
                    break;
                }
                *last_activity.lock().unwrap() = Instant::now();
                continue;
            }
            ObtainedPayload::Done => ObtainedPayload::Done,
            ObtainedPayload::Error(err) => {
                error!(?err, "fatal error obtaining playback payload");
                break;
            }
        };

        if matches!(payload, ObtainedPayload::Done) {
            info!("playback exhausted, ending session");
            match config.cb_done.take() {
                Some(cb) => cb(),
                None => call.bye(),
            }
            break;
        }
    }
}

enum ObtainedPayload {
    Payload {
        bytes: Bytes,
        payload_type: Option<u8>,
        marker: Option<bool>,
        timestamp_override: Option<u32>,
    },
    Done,
    Error(RtpEngineError),
}

fn obtain_payload(
    readfrom: &mut Option<PlaybackSource>,
    file_playback: &mut Option<FilePlayback>,
    seq: u16,
    samples_per_packet: u32,
) -> ObtainedPayload {
    match readfrom {
        Some(PlaybackSource::Callback(cb)) => match cb(seq) {
            Some(result) if !result.bytes().is_empty() => match result {
                PayloadCallbackResult::Bytes(bytes) => ObtainedPayload::Payload {
                    bytes,
                    payload_type: None,
                    marker: None,
                    timestamp_override: None,
                },
                PayloadCallbackResult::WithOverrides { bytes, payload_type, marker, timestamp } => {
                    ObtainedPayload::Payload { bytes, payload_type, marker, timestamp_override: timestamp }
                }
            },
            _ => ObtainedPayload::Done,
        },
        Some(PlaybackSource::File(_)) => {
            let playback = file_playback.as_mut().expect("file_playback set alongside File source");
            match playback.read_exact_with_repeat(samples_per_packet as usize) {
                Ok(Some(bytes)) => ObtainedPayload::Payload {
                    bytes,
                    payload_type: None,
                    marker: None,
                    timestamp_override: None,
                },
                Ok(None) => ObtainedPayload::Done,
                Err(err) => ObtainedPayload::Error(err),
            }
        }
        None => ObtainedPayload::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_detection() {
        assert!(is_reordered(100, 100));
        assert!(is_reordered(100, 50));
        assert!(!is_reordered(100, 101));
        // Wrap: prev near max, new near zero is NOT a reorder.
        assert!(!is_reordered(0xFFFF, 0x0000));
    }

    #[test]
    fn test_receive_state_infers_ltdiff() {
        let mut state = ReceiveState::new();
        assert_eq!(state.accept(100, 1000), Some((100, 1000)));
        assert!(state.ltdiff.is_none());
        assert_eq!(state.accept(101, 1160), Some((101, 1160)));
        assert_eq!(state.ltdiff, Some(160));
    }

    #[test]
    fn test_receive_state_drops_duplicate() {
        let mut state = ReceiveState::new();
        state.accept(100, 1000);
        assert_eq!(state.accept(100, 1000), None);
    }

    #[test]
    fn test_repeat_budget_infinite_never_exhausts() {
        let mut budget = RepeatBudget::from_config(0);
        for _ in 0..10 {
            assert!(!budget.consume_one());
        }
    }

    #[test]
    fn test_repeat_budget_counts_down() {
        let mut budget = RepeatBudget::from_config(2);
        assert!(!budget.consume_one());
        assert!(budget.consume_one());
    }

    struct RecordingCall {
        byes: std::sync::Mutex<u32>,
    }

    impl CallHandle for RecordingCall {
        fn bye(&self) {
            *self.byes.lock().unwrap() += 1;
        }
        fn register_cleanup(&self, cleanup: Cleanup) {
            cleanup();
        }
    }

    #[tokio::test]
    async fn test_echo_delay_zero_preserves_seq_and_timestamp() {
        let recv_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let send_socket = recv_socket.clone();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = sender.local_addr().unwrap();
        let recv_addr = recv_socket.local_addr().unwrap();

        let remote: RemoteAddr = Arc::new(RwLock::new(Some(sender_addr)));
        let call = Arc::new(RecordingCall { byes: std::sync::Mutex::new(0) });
        let rtp_params = RtpParams { default_payload_type: 0, samples_per_packet: 160, packet_interval_ms: 20 };
        let config = EchoSessionConfig { delay: 0, writeto: None, dtmf: DtmfEngine::new() };

        let handle = tokio::spawn(run_echo_session(
            recv_socket,
            send_socket,
            remote,
            rtp_params,
            config,
            call,
            Duration::from_secs(10),
        ));

        for (seq, ts) in [(100u16, 1000u32), (101, 1160), (102, 1320)] {
            let frame = OutboundFrame::new(0, false, seq, ts, 0x5678, Bytes::from_static(b"\xff\xff"));
            send_frame(&sender, recv_addr, &frame).await.unwrap();
        }

        let mut buf = [0u8; 64];
        for (seq, ts) in [(100u16, 1000u32), (101, 1160), (102, 1320)] {
            let (n, _) = tokio::time::timeout(Duration::from_secs(1), sender.recv_from(&mut buf))
                .await
                .expect("echo reply timed out")
                .unwrap();
            let (header, payload) = crate::rtp_handler::RtpHeader::parse(&buf[..n]).unwrap();
            assert_eq!(header.sequence_number, seq);
            assert_eq!(header.timestamp, ts);
            assert_eq!(payload, b"\xff\xff");
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_echo_delay_two_holds_then_flushes() {
        let recv_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let send_socket = recv_socket.clone();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recv_addr = recv_socket.local_addr().unwrap();

        let remote: RemoteAddr = Arc::new(RwLock::new(Some(sender.local_addr().unwrap())));
        let call = Arc::new(RecordingCall { byes: std::sync::Mutex::new(0) });
        let rtp_params = RtpParams { default_payload_type: 0, samples_per_packet: 160, packet_interval_ms: 20 };
        let config = EchoSessionConfig { delay: 2, writeto: None, dtmf: DtmfEngine::new() };

        let handle = tokio::spawn(run_echo_session(
            recv_socket,
            send_socket,
            remote,
            rtp_params,
            config,
            call,
            Duration::from_secs(10),
        ));

        for seq in 1u16..=5 {
            let frame = OutboundFrame::new(0, false, seq, seq as u32 * 160, 0x9999, Bytes::from(vec![seq as u8]));
            send_frame(&sender, recv_addr, &frame).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut buf = [0u8; 64];
        let mut echoed_seqs = Vec::new();
        for _ in 0..3 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(1), sender.recv_from(&mut buf))
                .await
                .expect("expected an echoed packet")
                .unwrap();
            let (header, _) = crate::rtp_handler::RtpHeader::parse(&buf[..n]).unwrap();
            echoed_seqs.push(header.sequence_number);
        }
        // With a hold-2 window over 5 fed packets, only the first 3 are flushed.
        assert_eq!(echoed_seqs, vec![1, 2, 3]);

        handle.abort();
    }

    #[tokio::test]
    async fn test_send_session_plays_file_once_then_invokes_cb_done() {
        let path = std::env::temp_dir().join(format!("rtp-media-engine-test-{}.raw", std::process::id()));
        std::fs::write(&path, vec![0x42u8; 320]).unwrap();

        let send_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote: RemoteAddr = Arc::new(RwLock::new(Some(receiver.local_addr().unwrap())));
        let call = Arc::new(RecordingCall { byes: std::sync::Mutex::new(0) });
        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));

        let rtp_params = RtpParams { default_payload_type: 0, samples_per_packet: 160, packet_interval_ms: 5 };
        let config = SendConfig {
            rtp_params,
            readfrom: Some(PlaybackSource::File(path.clone())),
            repeat: 1,
            dtmf: DtmfEngine::new(),
            cb_done: None,
        };

        let handle = tokio::spawn(run_send_session(send_socket, remote, config, call.clone(), last_activity));

        let mut buf = [0u8; 256];
        for expected_seq in 0..2 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
                .await
                .expect("expected a playback packet")
                .unwrap();
            let (header, payload) = crate::rtp_handler::RtpHeader::parse(&buf[..n]).unwrap();
            assert_eq!(payload.len(), 160);
            let _ = expected_seq;
            let _ = header;
        }

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("send session did not finish after playback exhausted")
            .unwrap();
        assert_eq!(*call.byes.lock().unwrap(), 1);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_recv_session_inactivity_watchdog_ends_call() {
        let recv_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let call = Arc::new(RecordingCall { byes: std::sync::Mutex::new(0) });
        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));

        let handle = tokio::spawn(run_recv_session(
            recv_socket,
            RecvConfig { writeto: None },
            call.clone(),
            Duration::from_millis(30),
            last_activity,
        ));

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("recv session did not end after inactivity timeout")
            .unwrap();
        assert_eq!(*call.byes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_packet_does_not_reset_inactivity_clock() {
        let recv_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recv_addr = recv_socket.local_addr().unwrap();
        let call = Arc::new(RecordingCall { byes: std::sync::Mutex::new(0) });
        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));

        let start = Instant::now();
        let handle = tokio::spawn(run_recv_session(
            recv_socket,
            RecvConfig { writeto: None },
            call.clone(),
            Duration::from_millis(60),
            last_activity,
        ));

        // Just before the watchdog would fire, feed a too-short (malformed)
        // datagram. Per §8, didit must stay unchanged: a parse failure is
        // not liveness.
        tokio::time::sleep(Duration::from_millis(40)).await;
        sender.send_to(&[0u8; 4], recv_addr).await.unwrap();

        tokio::time::timeout(Duration::from_millis(400), handle)
            .await
            .expect("recv session did not end after inactivity timeout")
            .unwrap();

        // If the malformed datagram had reset the clock, the call would only
        // end around 40ms + 60ms = 100ms out; it must end close to the
        // original 60ms deadline instead.
        assert!(start.elapsed() < Duration::from_millis(90));
        assert_eq!(*call.byes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_file_open_failure_is_fatal_to_session() {
        let recv_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recv_addr = recv_socket.local_addr().unwrap();
        let call = Arc::new(RecordingCall { byes: std::sync::Mutex::new(0) });
        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));

        // A directory can never be opened as a record file: this forces the
        // record-file open failure that the recv path must treat as fatal.
        let bad_path = std::env::temp_dir();
        let config = RecvConfig { writeto: Some(RecordSink::file(bad_path)) };

        let handle = tokio::spawn(run_recv_session(
            recv_socket,
            config,
            call.clone(),
            Duration::from_secs(10),
            last_activity,
        ));

        let frame = OutboundFrame::new(0, false, 1, 160, 0x1111, Bytes::from_static(b"\xff\xff"));
        send_frame(&sender, recv_addr, &frame).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("recv session did not abort on fatal record-file error")
            .unwrap();
        assert_eq!(*call.byes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dtmf_on_hold_is_not_driven_to_completion() {
        let send_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote: RemoteAddr = Arc::new(RwLock::new(None)); // on hold
        let call = Arc::new(RecordingCall { byes: std::sync::Mutex::new(0) });
        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));

        let fired = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        let mut dtmf = DtmfEngine::new();
        dtmf.push(
            crate::dtmf::DtmfEvent::new(Some(crate::dtmf::DtmfSymbol::D5), 20)
                .with_rfc2833_type(101)
                .with_cb_final(Box::new(move |outcome| {
                    fired_clone.lock().unwrap().push(outcome);
                })),
        );

        let rtp_params = RtpParams { default_payload_type: 0, samples_per_packet: 160, packet_interval_ms: 5 };
        let config = SendConfig {
            rtp_params,
            readfrom: None,
            repeat: 0,
            dtmf,
            cb_done: None,
        };

        let handle = tokio::spawn(run_send_session(send_socket, remote, config, call.clone(), last_activity));

        // Wait well past the event's duration while still on hold: no
        // RFC 2833 packet should ever reach the peer, and the event must
        // not be reported complete.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut buf = [0u8; 64];
        assert!(
            tokio::time::timeout(Duration::from_millis(20), receiver.recv_from(&mut buf))
                .await
                .is_err(),
            "no RFC 2833 packet should have been sent while on hold"
        );
        assert!(fired.lock().unwrap().is_empty(), "DTMF event must not complete while on hold");

        handle.abort();
    }
}
