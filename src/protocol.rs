/// ESP32 ↔ Server TCP voice protocol
///
/// Frame format (3-byte header + variable payload):
/// ```text
/// ┌──────────┬──────────────┬────────────────────┐
/// │ Byte 0   │ Byte 1-2     │ Byte 3..N          │
/// │ Type     │ Length       │ Payload            │
/// │ (uint8)  │ (uint16 LE)  │ (length bytes)     │
/// └──────────┴──────────────┴────────────────────┘
/// ```
///
/// Audio payloads are 16-bit LE PCM, 16 kHz, mono in both directions.
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::command::ActionCommand;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Frame header size (type + length).
pub const HEADER_SIZE: usize = 3;

/// Maximum payload a single frame can carry (u16 length field).
pub const MAX_FRAME_PAYLOAD: usize = 65_535;

/// Per-packet cap for outbound `AUDIO_OUT` payloads.  Kept well under the
/// device's I2S ring buffer; must stay even so packets are sample-aligned.
pub const AUDIO_OUT_CHUNK: usize = 4096;

/// Per-packet cap for every other outbound payload.
pub const CONTROL_CHUNK: usize = 60_000;

/// Pacing delay between consecutive `AUDIO_OUT` packets of one stream so a
/// slow receiver can drain its playback buffer.
pub const AUDIO_CHUNK_PACING: Duration = Duration::from_millis(2);

/// How many consecutive read timeouts we tolerate before declaring the
/// peer dead.  With the default 500 ms socket timeout this is ~10 s.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 20;

// ── Packet Types ───────────────────────────────────────────────────────

/// Closed set of frame types.  Unknown codes are logged and skipped by
/// the session, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Device → Server: begin one utterance stream.
    Start,
    /// Device → Server: microphone PCM chunk.
    Audio,
    /// Device → Server: utterance stream complete.
    End,
    /// Device → Server: keep-alive probe.
    Ping,
    /// Server → Device: JSON action command.
    Cmd,
    /// Server → Device: reply PCM chunk.
    AudioOut,
    /// Server → Device: reply audio stream complete.
    AudioOutEnd,
    /// Server → Device: keep-alive ack.
    Pong,
}

impl PacketType {
    /// Wire code for this packet type.
    pub fn code(self) -> u8 {
        match self {
            PacketType::Start => 0x01,
            PacketType::Audio => 0x02,
            PacketType::End => 0x03,
            PacketType::Ping => 0x10,
            PacketType::Cmd => 0x11,
            PacketType::AudioOut => 0x12,
            PacketType::AudioOutEnd => 0x13,
            PacketType::Pong => 0x1f,
        }
    }

    /// Decode a wire code; `None` for anything outside the closed set.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(PacketType::Start),
            0x02 => Some(PacketType::Audio),
            0x03 => Some(PacketType::End),
            0x10 => Some(PacketType::Ping),
            0x11 => Some(PacketType::Cmd),
            0x12 => Some(PacketType::AudioOut),
            0x13 => Some(PacketType::AudioOutEnd),
            0x1f => Some(PacketType::Pong),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Decoder
// ═══════════════════════════════════════════════════════════════════════

/// A frame as read off the wire.  The type byte is kept raw so the
/// session can log-and-skip codes outside the closed set.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub type_code: u8,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_code(self.type_code)
    }
}

/// Terminal conditions for the read side of a connection.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("peer closed the connection")]
    Closed,
    #[error("too many consecutive read timeouts - connection may be dead")]
    TimedOut,
    #[error("socket read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffered frame decoder over the read half of a socket.
///
/// Every read carries a short timeout; timeouts are counted as keepalive
/// ticks and only become [`RecvError::TimedOut`] once
/// [`MAX_CONSECUTIVE_TIMEOUTS`] accumulate without any bytes arriving.
pub struct FrameReader<R> {
    inner: R,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        FrameReader {
            inner,
            read_timeout,
        }
    }

    /// Fill `buf` completely or fail with a terminal error.
    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), RecvError> {
        let mut filled = 0usize;
        let mut timeout_count = 0u32;
        while filled < buf.len() {
            match tokio::time::timeout(self.read_timeout, self.inner.read(&mut buf[filled..])).await
            {
                Err(_elapsed) => {
                    timeout_count += 1;
                    if timeout_count >= MAX_CONSECUTIVE_TIMEOUTS {
                        return Err(RecvError::TimedOut);
                    }
                }
                Ok(Ok(0)) => return Err(RecvError::Closed),
                Ok(Ok(n)) => {
                    timeout_count = 0;
                    filled += n;
                }
                Ok(Err(e)) => return Err(RecvError::Io(e)),
            }
        }
        Ok(())
    }

    /// Read one complete frame.
    pub async fn read_frame(&mut self) -> Result<RawFrame, RecvError> {
        let mut header = [0u8; HEADER_SIZE];
        self.recv_exact(&mut header).await?;
        let type_code = header[0];
        let len = u16::from_le_bytes([header[1], header[2]]) as usize;

        let payload = if len > 0 {
            let mut buf = vec![0u8; len];
            self.recv_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        Ok(RawFrame { type_code, payload })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Encoder / send serializer
// ═══════════════════════════════════════════════════════════════════════

/// Serialized write path for one connection.
///
/// The internal mutex is held across the entire packetization of one
/// logical message so outbound packets never interleave mid-message.
/// All send methods swallow transport errors and report `false`; the
/// caller aborts the current message and the session continues.
pub struct FrameSink<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        FrameSink {
            writer: Mutex::new(writer),
        }
    }

    async fn write_frame(
        writer: &mut W,
        ptype: PacketType,
        payload: &[u8],
    ) -> std::io::Result<()> {
        debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.push(ptype.code());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        writer.write_all(&frame).await
    }

    /// Send one logical message of type `ptype`, chunking as required.
    ///
    /// `AUDIO_OUT` payloads are split into sample-aligned chunks of at
    /// most [`AUDIO_OUT_CHUNK`] bytes (a trailing odd byte is dropped)
    /// with [`AUDIO_CHUNK_PACING`] between chunks; everything else is
    /// chunked at [`CONTROL_CHUNK`].  An empty payload sends a bare
    /// 3-byte header.
    pub async fn send(&self, ptype: PacketType, payload: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        let result = Self::send_locked(&mut *writer, ptype, payload).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(ptype = format!("0x{:02X}", ptype.code()), error = %e, "send failed");
                false
            }
        }
    }

    async fn send_locked(writer: &mut W, ptype: PacketType, payload: &[u8]) -> std::io::Result<()> {
        if payload.is_empty() {
            return Self::write_frame(writer, ptype, &[]).await;
        }

        if ptype == PacketType::AudioOut {
            let total = payload.len();
            let mut offset = 0usize;
            while offset < total {
                let remaining = total - offset;
                if remaining < 2 {
                    break; // drop trailing odd byte
                }
                let mut chunk_size = remaining.min(AUDIO_OUT_CHUNK);
                if chunk_size % 2 != 0 {
                    chunk_size -= 1;
                }
                Self::write_frame(writer, ptype, &payload[offset..offset + chunk_size]).await?;
                offset += chunk_size;
                if offset < total {
                    tokio::time::sleep(AUDIO_CHUNK_PACING).await;
                }
            }
        } else {
            for chunk in payload.chunks(CONTROL_CHUNK) {
                Self::write_frame(writer, ptype, chunk).await?;
            }
        }
        Ok(())
    }

    /// Send an action command as a `CMD` frame.
    pub async fn send_action(&self, action: &ActionCommand) -> bool {
        let payload = action.to_wire();
        let ok = self.send(PacketType::Cmd, &payload).await;
        if ok {
            info!(cmd = %String::from_utf8_lossy(&payload), "CMD to device");
        }
        ok
    }

    /// Stream one complete PCM16LE reply: `AUDIO_OUT` chunks followed by
    /// the terminal `AUDIO_OUT_END` marker.
    pub async fn send_audio(&self, pcm: &[u8]) -> bool {
        if !self.send(PacketType::AudioOut, pcm).await {
            return false;
        }
        info!(bytes = pcm.len(), "AUDIO to device");
        let end_ok = self.send(PacketType::AudioOutEnd, &[]).await;
        if end_ok {
            info!("AUDIO_OUT_END sent");
        }
        end_ok
    }

    /// Answer a `PING`.
    pub async fn send_pong(&self) -> bool {
        self.send(PacketType::Pong, &[]).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_millis(50);

    async fn read_all_frames(reader: impl AsyncRead + Unpin) -> Vec<RawFrame> {
        let mut reader = FrameReader::new(reader, TEST_TIMEOUT);
        let mut frames = Vec::new();
        loop {
            match reader.read_frame().await {
                Ok(f) => frames.push(f),
                Err(_) => break,
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_header_roundtrip() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FrameSink::new(client);
        assert!(sink.send(PacketType::Cmd, b"abc").await);
        drop(sink);

        let frames = read_all_frames(server).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet_type(), Some(PacketType::Cmd));
        assert_eq!(&frames[0].payload[..], b"abc");
    }

    #[tokio::test]
    async fn test_empty_payload_sends_bare_header() {
        let (client, server) = tokio::io::duplex(64);
        let sink = FrameSink::new(client);
        assert!(sink.send_pong().await);
        drop(sink);

        let frames = read_all_frames(server).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet_type(), Some(PacketType::Pong));
        assert!(frames[0].payload.is_empty());
    }

    #[tokio::test]
    async fn test_audio_chunks_are_even_and_capped() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let sink = FrameSink::new(client);
        // 2.5 chunks plus a trailing odd byte that must be dropped.
        let pcm = vec![0x11u8; AUDIO_OUT_CHUNK * 2 + 1001];
        assert!(sink.send_audio(&pcm).await);
        drop(sink);

        let frames = read_all_frames(server).await;
        let (audio, rest): (Vec<_>, Vec<_>) = frames
            .into_iter()
            .partition(|f| f.packet_type() == Some(PacketType::AudioOut));

        let total: usize = audio.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, AUDIO_OUT_CHUNK * 2 + 1000);
        for frame in &audio {
            assert_eq!(frame.payload.len() % 2, 0, "sample alignment");
            assert!(frame.payload.len() <= AUDIO_OUT_CHUNK);
        }

        // Exactly one terminal marker, after the audio.
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].packet_type(), Some(PacketType::AudioOutEnd));
        assert!(rest[0].payload.is_empty());
    }

    #[tokio::test]
    async fn test_odd_single_byte_payload_sends_nothing_but_end() {
        let (client, server) = tokio::io::duplex(1 << 10);
        let sink = FrameSink::new(client);
        assert!(sink.send_audio(&[0x42]).await);
        drop(sink);

        let frames = read_all_frames(server).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet_type(), Some(PacketType::AudioOutEnd));
    }

    #[tokio::test]
    async fn test_unknown_type_code_passes_through_raw() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x77, 2, 0, 0xaa, 0xbb]).await.unwrap();
        drop(client);

        let frames = read_all_frames(server).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].type_code, 0x77);
        assert_eq!(frames[0].packet_type(), None);
        assert_eq!(&frames[0].payload[..], &[0xaa, 0xbb]);
    }

    #[tokio::test]
    async fn test_recv_reports_closed_on_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server, TEST_TIMEOUT);
        assert!(matches!(reader.read_frame().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_recv_times_out_after_silent_peer() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, Duration::from_millis(1));
        let result = reader.read_frame().await;
        assert!(matches!(result, Err(RecvError::TimedOut)));
        drop(client);
    }

    #[test]
    fn test_type_codes_roundtrip() {
        for ptype in [
            PacketType::Start,
            PacketType::Audio,
            PacketType::End,
            PacketType::Ping,
            PacketType::Cmd,
            PacketType::AudioOut,
            PacketType::AudioOutEnd,
            PacketType::Pong,
        ] {
            assert_eq!(PacketType::from_code(ptype.code()), Some(ptype));
        }
        assert_eq!(PacketType::from_code(0x00), None);
        assert_eq!(PacketType::from_code(0x42), None);
    }
}
