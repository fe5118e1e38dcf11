//! Per-channel, per-kind media stream multiplexing
//!
//! Four stream kinds ride over one connection: livestream (video + audio
//! elementary streams), RTSP relay, download, and talkback (outbound audio
//! only). At most one stream exists per (channel, kind); kinds are
//! independent of each other and of other channels, so devices behind one
//! hub stream concurrently.
//!
//! Inbound media arrives as fragmented chunks. Fragments of one chunk are
//! gathered by (chunk sequence, fragment index); completed chunks are
//! appended to the stream's queues in arrival order. A single metadata
//! frame per stream is parsed once and reported so the session can emit
//! the started event paired with the queues.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::{Frame, FrameFlags, MediaKind, StreamKind, MAX_PAYLOAD_SIZE};

use super::crypto::StreamCipher;
use super::error::SessionError;

/// Incomplete chunks kept per stream before the oldest is discarded
const MAX_PENDING_CHUNKS: usize = 64;

/// Stream metadata, sent by the device once per stream start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub video_codec: u8,
    pub audio_codec: u8,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Consumer ends of a stream's media queues. Taken once per stream.
pub struct MediaQueues {
    pub video: mpsc::UnboundedReceiver<Vec<u8>>,
    pub audio: mpsc::UnboundedReceiver<Vec<u8>>,
}

struct PartialChunk {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Gathers fragments into whole chunks, tolerating reordering within a
/// chunk and loss of whole chunks.
#[derive(Default)]
struct ChunkAssembler {
    chunks: HashMap<u32, PartialChunk>,
}

impl ChunkAssembler {
    fn ingest(
        &mut self,
        frag_index: u16,
        frag_count: u16,
        chunk_sequence: u32,
        payload: Vec<u8>,
    ) -> Option<Vec<u8>> {
        if frag_count == 0 || frag_index >= frag_count {
            trace!(
                "Dropping malformed fragment {}/{} of chunk {}",
                frag_index,
                frag_count,
                chunk_sequence
            );
            return None;
        }
        if frag_count == 1 {
            return Some(payload);
        }

        // Discard the oldest incomplete chunk when the map fills up
        if self.chunks.len() >= MAX_PENDING_CHUNKS && !self.chunks.contains_key(&chunk_sequence) {
            if let Some(&oldest) = self.chunks.keys().min() {
                self.chunks.remove(&oldest);
            }
        }

        let chunk = self.chunks.entry(chunk_sequence).or_insert_with(|| PartialChunk {
            parts: vec![None; frag_count as usize],
            received: 0,
        });
        if chunk.parts.len() != frag_count as usize {
            // Inconsistent fragment count for the same chunk; start over
            chunk.parts = vec![None; frag_count as usize];
            chunk.received = 0;
        }
        let slot = &mut chunk.parts[frag_index as usize];
        if slot.is_none() {
            *slot = Some(payload);
            chunk.received += 1;
        }

        if chunk.received == chunk.parts.len() {
            let chunk = self.chunks.remove(&chunk_sequence)?;
            let mut whole = Vec::new();
            for part in chunk.parts {
                whole.extend_from_slice(&part?);
            }
            Some(whole)
        } else {
            None
        }
    }
}

/// One active stream on one channel
pub struct StreamSession {
    pub channel: u8,
    pub kind: StreamKind,
    pub metadata: Option<StreamMetadata>,
    pub started_at: Instant,
    video_tx: mpsc::UnboundedSender<Vec<u8>>,
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    queues: Option<MediaQueues>,
    assemblers: HashMap<MediaKind, ChunkAssembler>,
    cipher: Option<StreamCipher>,
    outbound_chunk: u32,
}

impl StreamSession {
    fn new(channel: u8, kind: StreamKind) -> Self {
        let (video_tx, video_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            kind,
            metadata: None,
            started_at: Instant::now(),
            video_tx,
            audio_tx,
            queues: Some(MediaQueues {
                video: video_rx,
                audio: audio_rx,
            }),
            assemblers: HashMap::new(),
            cipher: None,
            outbound_chunk: 0,
        }
    }
}

/// What the session should do after ingesting a data frame
#[derive(Debug)]
pub enum IngestOutcome {
    /// Chunk delivered to its queue (or still assembling)
    Delivered,
    /// Metadata parsed for the first time: emit the started event
    MetadataReady(StreamMetadata),
    /// Device signalled end of stream
    StreamEnd,
    /// No stream registered for this frame; dropped
    Ignored,
}

/// All active streams of one session, keyed by (channel, kind)
#[derive(Default)]
pub struct StreamRegistry {
    streams: HashMap<(u8, StreamKind), StreamSession>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new stream. Fails fast when one is already running on
    /// this (channel, kind) unless `force` bypasses the check; talkback
    /// additionally requires an active livestream on the channel.
    pub fn start(&mut self, channel: u8, kind: StreamKind, force: bool) -> Result<(), SessionError> {
        if kind == StreamKind::Talkback && !self.is_active(channel, StreamKind::Livestream) {
            return Err(SessionError::StreamNotRunning {
                channel,
                kind: StreamKind::Livestream,
            });
        }
        if !force && self.is_active(channel, kind) {
            return Err(SessionError::StreamAlreadyRunning { channel, kind });
        }
        self.streams
            .insert((channel, kind), StreamSession::new(channel, kind));
        Ok(())
    }

    /// Remove a stream, returning it for teardown.
    pub fn stop(&mut self, channel: u8, kind: StreamKind) -> Option<StreamSession> {
        self.streams.remove(&(channel, kind))
    }

    pub fn is_active(&self, channel: u8, kind: StreamKind) -> bool {
        self.streams.contains_key(&(channel, kind))
    }

    pub fn active(&self) -> Vec<(u8, StreamKind)> {
        self.streams.keys().copied().collect()
    }

    /// Register the decrypted AES material for a stream's payloads.
    pub fn set_cipher(&mut self, channel: u8, kind: StreamKind, cipher: StreamCipher) -> bool {
        match self.streams.get_mut(&(channel, kind)) {
            Some(stream) => {
                stream.cipher = Some(cipher);
                true
            }
            None => false,
        }
    }

    /// Take the consumer ends of a stream's queues. Yields once.
    pub fn take_media(&mut self, channel: u8, kind: StreamKind) -> Option<MediaQueues> {
        self.streams
            .get_mut(&(channel, kind))
            .and_then(|s| s.queues.take())
    }

    /// Allocate the next outbound chunk sequence (talkback).
    pub fn next_outbound_chunk(&mut self, channel: u8, kind: StreamKind) -> Option<u32> {
        self.streams.get_mut(&(channel, kind)).map(|s| {
            let seq = s.outbound_chunk;
            s.outbound_chunk += 1;
            seq
        })
    }

    /// Remove every stream, for session teardown.
    pub fn drain(&mut self) -> Vec<StreamSession> {
        self.streams.drain().map(|(_, s)| s).collect()
    }

    /// Feed one inbound data frame into the owning stream.
    #[allow(clippy::too_many_arguments)]
    pub fn ingest(
        &mut self,
        channel: u8,
        kind: StreamKind,
        medium: MediaKind,
        flags: FrameFlags,
        frag_index: u16,
        frag_count: u16,
        chunk_sequence: u32,
        payload: Vec<u8>,
    ) -> Result<IngestOutcome, SessionError> {
        let Some(stream) = self.streams.get_mut(&(channel, kind)) else {
            debug!(
                "Data frame for inactive stream channel={} kind={:?}, dropped",
                channel, kind
            );
            return Ok(IngestOutcome::Ignored);
        };

        let assembler = stream.assemblers.entry(medium).or_default();
        let Some(chunk) = assembler.ingest(frag_index, frag_count, chunk_sequence, payload) else {
            return Ok(IngestOutcome::Delivered);
        };

        let chunk = if flags.encrypted && !chunk.is_empty() {
            let cipher = stream.cipher.as_ref().ok_or_else(|| {
                SessionError::Crypto("Encrypted chunk before stream key exchange".to_string())
            })?;
            cipher.decrypt(&chunk)?
        } else {
            chunk
        };

        match medium {
            MediaKind::Metadata => {
                if stream.metadata.is_some() {
                    // Metadata is parsed once per stream start
                    return Ok(IngestOutcome::Ignored);
                }
                let metadata: StreamMetadata = serde_json::from_slice(&chunk)?;
                stream.metadata = Some(metadata.clone());
                Ok(IngestOutcome::MetadataReady(metadata))
            }
            MediaKind::Video | MediaKind::Audio => {
                if !chunk.is_empty() {
                    let tx = if medium == MediaKind::Video {
                        &stream.video_tx
                    } else {
                        &stream.audio_tx
                    };
                    // Consumer may have dropped its queue; keep the stream alive
                    let _ = tx.send(chunk);
                }
                if flags.end_of_stream {
                    Ok(IngestOutcome::StreamEnd)
                } else {
                    Ok(IngestOutcome::Delivered)
                }
            }
        }
    }
}

/// Split an outbound media buffer into data frames. The fragment count
/// rides in a u16 header field, which bounds a single chunk to
/// `MAX_PAYLOAD_SIZE * u16::MAX` bytes; larger buffers are rejected.
pub fn fragment_media(
    channel: u8,
    kind: StreamKind,
    medium: MediaKind,
    chunk_sequence: u32,
    data: &[u8],
    end_of_stream: bool,
) -> Result<Vec<Frame>, SessionError> {
    let frag_count = data.len().div_ceil(MAX_PAYLOAD_SIZE).max(1);
    if frag_count > usize::from(u16::MAX) {
        return Err(SessionError::MediaTooLarge { size: data.len() });
    }
    let frag_count = frag_count as u16;
    let mut frames = Vec::with_capacity(frag_count as usize);
    for (index, part) in data
        .chunks(MAX_PAYLOAD_SIZE)
        .chain(std::iter::once(&[][..]).take(usize::from(data.is_empty())))
        .enumerate()
    {
        frames.push(Frame::Data {
            channel,
            kind,
            medium,
            flags: FrameFlags {
                encrypted: false,
                end_of_stream: end_of_stream && index as u16 == frag_count - 1,
            },
            frag_index: index as u16,
            frag_count,
            chunk_sequence,
            payload: part.to_vec(),
        });
    }
    Ok(frames)
}
