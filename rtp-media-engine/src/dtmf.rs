//! DTMF (Dual-Tone Multi-Frequency) insertion engine
//!
//! Owns the per-session FIFO of pending telephony events and decides, at
//! each send opportunity, whether the next outbound packet is an RFC 2833
//! event, a synthesized µ-law tone, or neither (in which case the event
//! fails). Also hosts the µ-law dual-sinusoid tone generator.
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

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, warn};

/// A DTMF digit, with its canonical (low, high) frequency pair (Hz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfSymbol {
    D0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    D8,
    D9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfSymbol {
    /// (low_hz, high_hz) per the standard DTMF keypad matrix.
    pub fn frequencies(self) -> (u32, u32) {
        use DtmfSymbol::*;
        match self {
            D1 => (697, 1209),
            D2 => (697, 1336),
            D3 => (697, 1477),
            A => (697, 1633),
            D4 => (770, 1209),
            D5 => (770, 1336),
            D6 => (770, 1477),
            B => (770, 1633),
            D7 => (852, 1209),
            D8 => (852, 1336),
            D9 => (852, 1477),
            C => (852, 1633),
            Star => (941, 1209),
            D0 => (941, 1336),
            Pound => (941, 1477),
            D => (941, 1633),
        }
    }

    /// RFC 2833 named event code: `0-9 -> 0..9`, `* -> 10`, `# -> 11`, `A-D -> 12..15`.
    pub fn event_code(self) -> u8 {
        use DtmfSymbol::*;
        match self {
            D0 => 0,
            D1 => 1,
            D2 => 2,
            D3 => 3,
            D4 => 4,
            D5 => 5,
            D6 => 6,
            D7 => 7,
            D8 => 8,
            D9 => 9,
            Star => 10,
            Pound => 11,
            A => 12,
            B => 13,
            C => 14,
            D => 15,
        }
    }
}

/// Outcome reported to a `DtmfEvent`'s completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtmfOutcome {
    Ok,
    Fail(String),
}

type FinalCallback = Box<dyn FnMut(DtmfOutcome) + Send>;

/// A queued DTMF event. `event: None` with `audio_type` set means "emit
/// silence" rather than a tone.
pub struct DtmfEvent {
    pub event: Option<DtmfSymbol>,
    pub volume: u8,
    pub duration_ms: u32,
    pub rfc2833_type: Option<u8>,
    pub audio_type: Option<u8>,
    pub cb_final: Option<FinalCallback>,

    start_timestamp: Option<u32>,
    start_wallclock: Option<Instant>,
    tone_generator: Option<ToneGenerator>,
}

impl DtmfEvent {
    pub fn new(event: Option<DtmfSymbol>, duration_ms: u32) -> Self {
        DtmfEvent {
            event,
            volume: 10,
            duration_ms,
            rfc2833_type: None,
            audio_type: None,
            cb_final: None,
            start_timestamp: None,
            start_wallclock: None,
            tone_generator: None,
        }
    }

    pub fn with_volume(mut self, volume: u8) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_rfc2833_type(mut self, pt: u8) -> Self {
        self.rfc2833_type = Some(pt);
        self
    }

    pub fn with_audio_type(mut self, pt: u8) -> Self {
        self.audio_type = Some(pt);
        self
    }

    pub fn with_cb_final(mut self, cb: FinalCallback) -> Self {
        self.cb_final = Some(cb);
        self
    }

    fn fire(&mut self, outcome: DtmfOutcome) {
        if let Some(cb) = self.cb_final.as_mut() {
            cb(outcome);
        }
    }
}

/// What the engine decided to emit for this send opportunity.
pub struct DtmfOutput {
    pub payload_type: u8,
    pub marker: bool,
    pub payload: Bytes,
    /// `Some(start_timestamp)` for RFC 2833 packets, which must all share
    /// the event's start timestamp; `None` for audio-tone packets, which
    /// use the tick's normal timestamp.
    pub timestamp_override: Option<u32>,
    pub repeat: u32,
}

/// Per-session FIFO of pending DTMF events (§4.3).
#[derive(Default)]
pub struct DtmfEngine {
    queue: VecDeque<DtmfEvent>,
}

impl DtmfEngine {
    pub fn new() -> Self {
        DtmfEngine {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: DtmfEvent) {
        self.queue.push_back(event);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Consult the engine for this send opportunity.
    ///
    /// `now_timestamp` is the nominal outbound RTP timestamp for this tick;
    /// `tdiff` is the per-packet timestamp delta (`samples_per_packet` on
    /// the sender, the inferred `ltdiff` on the echo path).
    pub fn poll(
        &mut self,
        now_timestamp: u32,
        tdiff: u32,
        now: Instant,
        samples_per_packet: u32,
    ) -> Option<DtmfOutput> {
        if self.queue.is_empty() {
            return None;
        }

        {
            let head = self.queue.front_mut().expect("checked non-empty above");
            if head.start_timestamp.is_none() {
                head.start_timestamp = Some(now_timestamp);
                head.start_wallclock = Some(now);
            }
        }

        let head = self.queue.front().expect("checked non-empty above");
        let start_timestamp = head.start_timestamp.expect("stamped above");
        let start_wallclock = head.start_wallclock.expect("stamped above");
        let elapsed_ms = now.saturating_duration_since(start_wallclock).as_millis() as u32;
        let event_end = elapsed_ms >= head.duration_ms;
        let event_tdiff = now_timestamp.wrapping_sub(start_timestamp).wrapping_add(tdiff);

        let output = if let Some(rfc2833_type) = head.rfc2833_type {
            let mut payload = BytesMut::with_capacity(4);
            let event_code = head.event.map(DtmfSymbol::event_code).unwrap_or(0);
            payload.extend_from_slice(&[event_code, 0, 0, 0]);
            payload[1] = ((event_end as u8) << 7) | (head.volume & 0x3F);
            let tdiff_bytes = (event_tdiff as u16).to_be_bytes();
            payload[2] = tdiff_bytes[0];
            payload[3] = tdiff_bytes[1];

            Some(DtmfOutput {
                payload_type: rfc2833_type,
                marker: true,
                payload: payload.freeze(),
                timestamp_override: Some(start_timestamp),
                repeat: if event_end { 3 } else { 1 },
            })
        } else if let Some(audio_type) = head.audio_type {
            let head_mut = self.queue.front_mut().expect("checked non-empty above");
            let payload = match head_mut.event {
                Some(symbol) => {
                    let generator = head_mut
                        .tone_generator
                        .get_or_insert_with(|| ToneGenerator::new(symbol, head_mut.volume));
                    generator.generate(samples_per_packet)
                }
                None => silence(samples_per_packet),
            };
            Some(DtmfOutput {
                payload_type: audio_type,
                marker: false,
                payload,
                timestamp_override: None,
                repeat: 1,
            })
        } else {
            debug!("DTMF event has neither rfc2833_type nor audio_type configured");
            self.fail_all("neither rfc2833 nor audio are supported by peer");
            None
        };

        if event_end {
            if let Some(mut finished) = self.queue.pop_front() {
                finished.fire(DtmfOutcome::Ok);
            }
        }

        output
    }

    /// Fail the head event and every queued successor (§4.3 step 3, §7).
    fn fail_all(&mut self, reason: &str) {
        warn!(reason, "DTMF event failed: unsupported payload negotiation");
        while let Some(mut event) = self.queue.pop_front() {
            event.fire(DtmfOutcome::Fail(reason.to_string()));
        }
    }
}

/// 160 bytes (or whatever the packetization calls for) of µ-law silence.
pub fn silence(samples_per_packet: u32) -> Bytes {
    Bytes::from(vec![0x80u8; samples_per_packet as usize])
}

const TABLE_SIZE: u32 = 256;
const SAMPLE_RATE: u32 = 8000;
const TONE_AMPLITUDE: f64 = 16383.0;

fn cosine_table() -> &'static [i32; 256] {
    static TABLE: OnceLock<[i32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0i32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * (i as f64) / (TABLE_SIZE as f64);
            *slot = (TONE_AMPLITUDE * phase.cos()).round() as i32;
        }
        table
    })
}

/// Inverse µ-law expansion table: `expand[j]` for `j in 0..127`.
fn expand_table() -> &'static [i64; 128] {
    static TABLE: OnceLock<[i64; 128]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0i64; 128];
        for (j, slot) in table.iter_mut().enumerate() {
            let exponent = j as f64 / 127.0;
            *slot = (((256f64.powf(exponent) - 1.0) / 255.0) * 32767.0).floor() as i64;
        }
        table
    })
}

/// µ-law compression table built from the inverse `expand_table` by a
/// single linear sweep (§4.3).
fn compress_table() -> &'static [u8; 32768] {
    static TABLE: OnceLock<[u8; 32768]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let expand = expand_table();
        let mut table = [0u8; 32768];
        let mut j: usize = 0;
        for (v, slot) in table.iter_mut().enumerate() {
            while j + 1 < expand.len()
                && (expand[j + 1] - v as i64).abs() < (expand[j] - v as i64).abs()
            {
                j += 1;
            }
            *slot = j as u8;
        }
        table
    })
}

/// µ-law compress a linear sample in `-32767..=32767`.
fn mu_law_encode(val: i32) -> u8 {
    let compress = compress_table();
    if val >= 0 {
        255 - compress[val.min(32767) as usize]
    } else {
        127 - compress[(-val).min(32767) as usize]
    }
}

/// Phase accumulator for a single sinusoid, stepped sample-by-sample with
/// Bresenham-style fractional correction (§4.3).
struct ToneOscillator {
    i: u32,
    d: u32,
    g: u32,
    e: i64,
}

impl ToneOscillator {
    fn new(freq_hz: u32) -> Self {
        ToneOscillator {
            i: 0,
            d: (freq_hz * TABLE_SIZE) / SAMPLE_RATE,
            g: (freq_hz * TABLE_SIZE) % SAMPLE_RATE,
            e: (SAMPLE_RATE / 2) as i64,
        }
    }

    fn next_sample(&mut self) -> i32 {
        self.e -= self.g as i64;
        if self.e < 0 {
            self.e += SAMPLE_RATE as i64;
            self.i = (self.i + 1) % TABLE_SIZE;
        }
        let sample = cosine_table()[self.i as usize];
        self.i = (self.i + self.d) % TABLE_SIZE;
        sample
    }
}

/// Dual-sinusoid µ-law DTMF tone generator, one instance per emitted event
/// so its phase accumulators persist across packets within the burst.
struct ToneGenerator {
    low: ToneOscillator,
    high: ToneOscillator,
    volume: u8,
}

impl ToneGenerator {
    fn new(symbol: DtmfSymbol, volume: u8) -> Self {
        let (low_hz, high_hz) = symbol.frequencies();
        ToneGenerator {
            low: ToneOscillator::new(low_hz),
            high: ToneOscillator::new(high_hz),
            volume,
        }
    }

    fn generate(&mut self, samples: u32) -> Bytes {
        let mut out = BytesMut::with_capacity(samples as usize);
        for _ in 0..samples {
            let sum = self.low.next_sample() + self.high.next_sample();
            let scaled = (sum as i64 * self.volume as i64 / 100) as i32;
            out.put_u8(mu_law_encode(scaled));
        }
        out.freeze()
    }
}

#[cfg(test)]
fn millis(ms: u64) -> std::time::Duration {
    std::time::Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_codes() {
        assert_eq!(DtmfSymbol::D0.event_code(), 0);
        assert_eq!(DtmfSymbol::D9.event_code(), 9);
        assert_eq!(DtmfSymbol::Star.event_code(), 10);
        assert_eq!(DtmfSymbol::Pound.event_code(), 11);
        assert_eq!(DtmfSymbol::A.event_code(), 12);
        assert_eq!(DtmfSymbol::D.event_code(), 15);
    }

    #[test]
    fn test_frequencies() {
        assert_eq!(DtmfSymbol::D1.frequencies(), (697, 1209));
        assert_eq!(DtmfSymbol::Star.frequencies(), (941, 1209));
        assert_eq!(DtmfSymbol::D.frequencies(), (941, 1633));
    }

    #[test]
    fn test_empty_queue_returns_none() {
        let mut engine = DtmfEngine::new();
        assert!(engine.poll(0, 160, Instant::now(), 160).is_none());
    }

    #[test]
    fn test_rfc2833_packet_shares_start_timestamp() {
        let mut engine = DtmfEngine::new();
        engine.push(
            DtmfEvent::new(Some(DtmfSymbol::D5), 100).with_rfc2833_type(101),
        );

        let start = Instant::now();
        let out1 = engine.poll(1000, 160, start, 160).unwrap();
        assert_eq!(out1.timestamp_override, Some(1000));
        assert_eq!(out1.payload_type, 101);
        assert!(out1.marker);
        assert_eq!(out1.payload.len(), 4);
        assert_eq!(out1.payload[0], 5);
        assert_eq!(out1.repeat, 1);

        // Mid-burst tick: same start timestamp, no end flag yet.
        let out2 = engine
            .poll(1160, 160, start + millis(20), 160)
            .unwrap();
        assert_eq!(out2.timestamp_override, Some(1000));
        assert_eq!(out2.payload[1] & 0x80, 0);
    }

    #[test]
    fn test_rfc2833_end_packet_repeats_three_times_and_pops() {
        let mut engine = DtmfEngine::new();
        let fired = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        engine.push(
            DtmfEvent::new(Some(DtmfSymbol::D1), 50)
                .with_rfc2833_type(101)
                .with_cb_final(Box::new(move |outcome| {
                    fired_clone.lock().unwrap().push(outcome);
                })),
        );

        let start = Instant::now();
        engine.poll(1000, 160, start, 160).unwrap();
        let out = engine
            .poll(1160, 160, start + millis(60), 160)
            .unwrap();
        assert_eq!(out.repeat, 3);
        assert_eq!(out.payload[1] & 0x80, 0x80);
        assert!(engine.is_empty());
        assert_eq!(fired.lock().unwrap().as_slice(), [DtmfOutcome::Ok]);
    }

    #[test]
    fn test_audio_tone_does_not_override_timestamp() {
        let mut engine = DtmfEngine::new();
        engine.push(DtmfEvent::new(Some(DtmfSymbol::D1), 100).with_audio_type(0));

        let out = engine.poll(1000, 160, Instant::now(), 160).unwrap();
        assert!(out.timestamp_override.is_none());
        assert_eq!(out.payload.len(), 160);
        assert!(out.payload.iter().any(|&b| b != 0x80));
    }

    #[test]
    fn test_silence_event_emits_sentinel() {
        let mut engine = DtmfEngine::new();
        engine.push(DtmfEvent::new(None, 20).with_audio_type(0));

        let out = engine.poll(0, 160, Instant::now(), 160).unwrap();
        assert!(out.payload.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_neither_encoding_fails_event_and_successors() {
        let mut engine = DtmfEngine::new();
        let outcomes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for _ in 0..2 {
            let outcomes_clone = outcomes.clone();
            engine.push(DtmfEvent::new(Some(DtmfSymbol::D1), 50).with_cb_final(Box::new(
                move |outcome| outcomes_clone.lock().unwrap().push(outcome),
            )));
        }

        let out = engine.poll(0, 160, Instant::now(), 160);
        assert!(out.is_none());
        assert!(engine.is_empty());
        let recorded = outcomes.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(recorded
            .iter()
            .all(|o| matches!(o, DtmfOutcome::Fail(_))));
    }

    #[test]
    fn test_mu_law_compress_monotone_in_magnitude() {
        let mut prev = mu_law_encode(0);
        for val in (0..32767).step_by(512) {
            let enc = mu_law_encode(val);
            // Positive branch emits 255 - compress[val], which decreases as
            // |val| grows since compress is non-decreasing.
            assert!(enc <= prev || val == 0);
            prev = enc;
        }
    }
}
