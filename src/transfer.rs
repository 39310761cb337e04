//! Chunked bulk transfer over an established direct channel.
//!
//! The sender reads the artifact in fixed-size chunks, writes each as a
//! binary frame in order, writes a distinguished textual end marker after
//! the last chunk, and closes its sending side. The receiver accumulates
//! binary frames in arrival order and concatenates them when the marker
//! arrives.
//!
//! The protocol carries no sequence numbers: it requires the channel to
//! deliver frames in order and without loss, which data-channel semantics
//! guarantee. Both ends produce a `TransferReport` with a SHA-256 digest so
//! callers can verify integrity end to end.

use std::fmt;
use std::io::{self, Read};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

// ── Constants ───────────────────────────────────────────────

/// Fixed chunk size. Kept under the SCTP message-size ceilings that
/// WebRTC data channels enforce.
pub const CHUNK_SIZE: usize = 65_536;

/// Textual end marker written after the final chunk.
pub const END_OF_TRANSFER: &str = "end-of-transfer";

// ── Channel seam ────────────────────────────────────────────

/// One frame on the direct channel: data channels distinguish binary from
/// text messages, and this protocol uses both.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Sending side of an established direct channel.
///
/// Implementations must preserve frame order and deliver losslessly; the
/// protocol cannot detect reordering.
pub trait DataChannel {
    fn send(&mut self, frame: ChannelFrame) -> Result<(), String>;

    /// Close the sending side. Called once, after the end marker.
    fn close_send(&mut self);
}

// ── Errors ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum TransferError {
    /// Reading the artifact source failed.
    Read(io::Error),
    /// The channel rejected a frame.
    Channel(String),
    /// The receiver got a text frame that is not the end marker.
    UnexpectedText(String),
    /// A frame arrived after the end marker completed the transfer.
    AlreadyComplete,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Read(e) => write!(f, "artifact read failed: {e}"),
            TransferError::Channel(detail) => write!(f, "channel send failed: {detail}"),
            TransferError::UnexpectedText(text) => {
                write!(f, "unexpected text frame (not the end marker): {text:?}")
            }
            TransferError::AlreadyComplete => write!(f, "frame received after end marker"),
        }
    }
}

impl std::error::Error for TransferError {}

// ── Report ──────────────────────────────────────────────────

/// Outcome summary produced by both ends of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks: usize,
    pub sha256: String,
    pub elapsed: Duration,
}

/// SHA-256 digest as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

// ── Sender ──────────────────────────────────────────────────

/// Send everything `reader` yields over `channel` as ordered fixed-size
/// chunks followed by the end marker, then close the sending side.
pub fn send_artifact<C: DataChannel, R: Read>(
    channel: &mut C,
    mut reader: R,
) -> Result<TransferReport, TransferError> {
    let start = Instant::now();
    let mut hasher = Sha256::new();
    let mut bytes = 0usize;
    let mut chunks = 0usize;

    loop {
        let chunk = read_chunk(&mut reader)?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(&chunk);
        bytes += chunk.len();
        chunks += 1;
        channel
            .send(ChannelFrame::Binary(chunk))
            .map_err(TransferError::Channel)?;
    }

    channel
        .send(ChannelFrame::Text(END_OF_TRANSFER.to_string()))
        .map_err(TransferError::Channel)?;
    channel.close_send();

    let sha256 = to_hex(&hasher.finalize());
    eprintln!("[transfer] sent {bytes} bytes in {chunks} chunk(s)");
    Ok(TransferReport {
        bytes,
        chunks,
        sha256,
        elapsed: start.elapsed(),
    })
}

/// Fill one chunk from `reader`. Short only at end of input.
fn read_chunk<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransferError> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut filled = 0usize;
    while filled < CHUNK_SIZE {
        match reader.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Read(e)),
        }
    }
    chunk.truncate(filled);
    Ok(chunk)
}

// ── Receiver ────────────────────────────────────────────────

/// Accumulates binary frames in arrival order until the end marker.
pub struct TransferReceiver {
    chunks: Vec<Vec<u8>>,
    bytes: usize,
    started: Instant,
    complete: bool,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            bytes: 0,
            started: Instant::now(),
            complete: false,
        }
    }

    /// Feed one inbound frame.
    ///
    /// Returns `Ok(None)` while the transfer is in progress and
    /// `Ok(Some((artifact, report)))` when the end marker completes it.
    pub fn accept_frame(
        &mut self,
        frame: ChannelFrame,
    ) -> Result<Option<(Vec<u8>, TransferReport)>, TransferError> {
        if self.complete {
            return Err(TransferError::AlreadyComplete);
        }
        match frame {
            ChannelFrame::Binary(chunk) => {
                self.bytes += chunk.len();
                self.chunks.push(chunk);
                Ok(None)
            }
            ChannelFrame::Text(text) if text == END_OF_TRANSFER => {
                self.complete = true;
                let chunk_count = self.chunks.len();
                let mut artifact = Vec::with_capacity(self.bytes);
                for chunk in self.chunks.drain(..) {
                    artifact.extend_from_slice(&chunk);
                }
                let report = TransferReport {
                    bytes: artifact.len(),
                    chunks: chunk_count,
                    sha256: sha256_hex(&artifact),
                    elapsed: self.started.elapsed(),
                };
                eprintln!("[transfer] received {} bytes", artifact.len());
                Ok(Some((artifact, report)))
            }
            ChannelFrame::Text(text) => Err(TransferError::UnexpectedText(text)),
        }
    }

    /// Bytes accumulated so far.
    pub fn received_bytes(&self) -> usize {
        self.bytes
    }
}

impl Default for TransferReceiver {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory channel: frames land in a queue, close is recorded.
    struct QueueChannel {
        frames: Vec<ChannelFrame>,
        closed: bool,
    }

    impl QueueChannel {
        fn new() -> Self {
            Self {
                frames: Vec::new(),
                closed: false,
            }
        }
    }

    impl DataChannel for QueueChannel {
        fn send(&mut self, frame: ChannelFrame) -> Result<(), String> {
            if self.closed {
                return Err("channel closed".to_string());
            }
            self.frames.push(frame);
            Ok(())
        }

        fn close_send(&mut self) {
            self.closed = true;
        }
    }

    /// Deterministic artifact: byte[i] = i % 256.
    fn artifact(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 256) as u8).collect()
    }

    fn roundtrip(data: &[u8]) -> (TransferReport, Vec<u8>, TransferReport) {
        let mut channel = QueueChannel::new();
        let sender_report = send_artifact(&mut channel, data).unwrap();
        assert!(channel.closed, "sender must close its side after the marker");

        let mut receiver = TransferReceiver::new();
        let mut outcome = None;
        for frame in channel.frames.drain(..) {
            if let Some(done) = receiver.accept_frame(frame).unwrap() {
                outcome = Some(done);
            }
        }
        let (received, receiver_report) = outcome.expect("end marker must complete the transfer");
        (sender_report, received, receiver_report)
    }

    #[test]
    fn roundtrip_with_short_final_chunk() {
        // Not a multiple of CHUNK_SIZE: exercises the short last chunk.
        let data = artifact(CHUNK_SIZE * 2 + 12_345);
        let (sent, received, got) = roundtrip(&data);

        assert_eq!(received, data);
        assert_eq!(sent.bytes, data.len());
        assert_eq!(sent.chunks, 3);
        assert_eq!(sent.sha256, got.sha256);
    }

    #[test]
    fn roundtrip_with_exact_chunk_multiple() {
        let data = artifact(CHUNK_SIZE * 2);
        let (sent, received, _got) = roundtrip(&data);
        assert_eq!(received, data);
        assert_eq!(sent.chunks, 2, "no empty trailing chunk");
    }

    #[test]
    fn roundtrip_smaller_than_one_chunk() {
        let data = artifact(100);
        let (sent, received, _got) = roundtrip(&data);
        assert_eq!(received, data);
        assert_eq!(sent.chunks, 1);
    }

    #[test]
    fn empty_artifact_sends_only_the_marker() {
        let mut channel = QueueChannel::new();
        let report = send_artifact(&mut channel, &[][..]).unwrap();
        assert_eq!(report.bytes, 0);
        assert_eq!(report.chunks, 0);
        assert_eq!(
            channel.frames,
            vec![ChannelFrame::Text(END_OF_TRANSFER.to_string())]
        );

        let mut receiver = TransferReceiver::new();
        let (received, got) = receiver
            .accept_frame(channel.frames.remove(0))
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
        // SHA-256 of empty input is a well-known constant.
        assert_eq!(
            got.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn frames_are_sent_in_order() {
        let data = artifact(CHUNK_SIZE + 1);
        let mut channel = QueueChannel::new();
        send_artifact(&mut channel, &data[..]).unwrap();

        match (&channel.frames[0], &channel.frames[1], &channel.frames[2]) {
            (ChannelFrame::Binary(first), ChannelFrame::Binary(second), ChannelFrame::Text(marker)) => {
                assert_eq!(first.len(), CHUNK_SIZE);
                assert_eq!(second.len(), 1);
                assert_eq!(marker, END_OF_TRANSFER);
            }
            other => panic!("unexpected frame sequence: {other:?}"),
        }
    }

    #[test]
    fn receiver_rejects_unexpected_text_frame() {
        let mut receiver = TransferReceiver::new();
        let result = receiver.accept_frame(ChannelFrame::Text("not the marker".to_string()));
        assert!(matches!(result, Err(TransferError::UnexpectedText(_))));
    }

    #[test]
    fn receiver_rejects_frames_after_completion() {
        let mut receiver = TransferReceiver::new();
        receiver
            .accept_frame(ChannelFrame::Text(END_OF_TRANSFER.to_string()))
            .unwrap();
        let result = receiver.accept_frame(ChannelFrame::Binary(vec![1, 2, 3]));
        assert!(matches!(result, Err(TransferError::AlreadyComplete)));
    }

    #[test]
    fn sender_and_receiver_digests_agree() {
        let data = artifact(10_000);
        let (sent, _received, got) = roundtrip(&data);
        assert_eq!(sent.sha256, got.sha256);
        assert_eq!(sent.sha256, sha256_hex(&data));
    }
}
