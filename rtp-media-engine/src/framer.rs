//! RTP framer / sender (§4.2)
//!
//! Builds the 12-byte outbound header and writes the datagram to a socket,
//! optionally repeating it verbatim (used for RFC 2833 end-of-event bursts).
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

use crate::error::RtpEngineResult;
use crate::rtp_handler::RtpPacket;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Stable outbound SSRC used across a session (§3 invariant: a constant is
/// acceptable).
pub const DEFAULT_SSRC: u32 = 0x1234;

/// One outbound RTP frame, ready to be written `repeat` times.
pub struct OutboundFrame {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
    pub repeat: u32,
}

impl OutboundFrame {
    pub fn new(
        payload_type: u8,
        marker: bool,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        payload: Bytes,
    ) -> Self {
        OutboundFrame {
            payload_type,
            marker,
            sequence_number,
            timestamp,
            ssrc,
            payload,
            repeat: 1,
        }
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat.max(1);
        self
    }

    fn to_packet(&self) -> RtpPacket {
        RtpPacket::outbound(
            self.payload_type,
            self.marker,
            self.sequence_number,
            self.timestamp,
            self.ssrc,
            self.payload.clone(),
        )
    }
}

/// Frame and send `frame` to `dest`, writing `frame.repeat` identical
/// datagrams. A socket I/O failure is fatal to the session (§7).
pub async fn send_frame(
    socket: &UdpSocket,
    dest: SocketAddr,
    frame: &OutboundFrame,
) -> RtpEngineResult<()> {
    let datagram = frame.to_packet().serialize();
    for _ in 0..frame.repeat {
        socket.send_to(&datagram, dest).await?;
    }
    Ok(())
}
