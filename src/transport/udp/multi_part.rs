use std::time::Duration;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::MULTI_PART_OVERHEAD;
use crate::identity::PeerId;
use crate::messaging::dto::{MessageBody, MessageDto, MultiPartChunkDto};

/// Upper bound for the number of chunks of a single message, limiting what a peer can make us
///  allocate for a partial message
pub const MAX_CHUNK_COUNT: u32 = 1 << 16;

/// Splits a message whose serialized body does not fit into a single datagram into chunk
///  messages. Messages that fit are returned unchanged.
pub fn split_message(message: MessageDto, max_datagram_payload: usize) -> Vec<MessageDto> {
    let body = message.body.to_bytes();
    if body.len() + MULTI_PART_OVERHEAD <= max_datagram_payload {
        return vec![message];
    }

    let chunk_size = max_datagram_payload - MULTI_PART_OVERHEAD;
    let chunk_count = body.len().div_ceil(chunk_size);
    let multi_part_message_id = Uuid::new_v4();
    debug!("splitting message of type {:?} with {} bytes into {} chunks", message.body.type_id, body.len(), chunk_count);

    (0..chunk_count)
        .map(|chunk_index| {
            let start = chunk_index * chunk_size;
            let end = body.len().min(start + chunk_size);
            let chunk = MultiPartChunkDto {
                multi_part_message_id,
                chunk_index: chunk_index as u32,
                chunk_count: chunk_count as u32,
                body_length: body.len() as u32,
                chunk: body.slice(start..end),
            };
            MessageDto {
                body: MessageBody::of(&chunk),
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
            }
        })
        .collect()
}

struct PartialMessage {
    sender_id: PeerId,
    receiver_id: PeerId,
    chunk_count: u32,
    body_length: u32,
    chunks: Vec<Option<Bytes>>,
    num_received: u32,
    started: Instant,
}

impl PartialMessage {
    fn new(sender_id: PeerId, receiver_id: PeerId, chunk: &MultiPartChunkDto) -> PartialMessage {
        PartialMessage {
            sender_id,
            receiver_id,
            chunk_count: chunk.chunk_count,
            body_length: chunk.body_length,
            chunks: vec![None; chunk.chunk_count as usize],
            num_received: 0,
            started: Instant::now(),
        }
    }

    /// returns false for a duplicate chunk
    fn add(&mut self, chunk: MultiPartChunkDto) -> anyhow::Result<bool> {
        if chunk.chunk_count != self.chunk_count || chunk.body_length != self.body_length {
            bail!("chunk {}/{} with body length {} does not match previous chunks ({} chunks, body length {})",
                chunk.chunk_index, chunk.chunk_count, chunk.body_length, self.chunk_count, self.body_length);
        }
        let slot = &mut self.chunks[chunk.chunk_index as usize];
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(chunk.chunk);
        self.num_received += 1;
        Ok(true)
    }

    fn is_complete(&self) -> bool {
        self.num_received == self.chunk_count
    }

    fn assemble(self) -> anyhow::Result<MessageDto> {
        let mut buf = BytesMut::with_capacity(self.body_length as usize);
        for chunk in self.chunks.into_iter().flatten() {
            buf.extend_from_slice(&chunk);
        }
        if buf.len() != self.body_length as usize {
            bail!("reassembled body has {} bytes, expected {}", buf.len(), self.body_length);
        }

        let mut raw: &[u8] = &buf;
        let body = MessageBody::try_deser(&mut raw)?;
        if !raw.is_empty() {
            bail!("{} trailing bytes after reassembled body", raw.len());
        }
        Ok(MessageDto {
            body,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
        })
    }
}

/// Collects the chunks of multi-part messages, in any order, and returns each message once when
///  it is complete. Duplicate chunks (also for messages that were completed already) are ignored.
#[derive(Default)]
pub struct MultiPartPacketReassembler {
    in_progress: DashMap<Uuid, PartialMessage>,
    completed: DashSet<Uuid>,
}

impl MultiPartPacketReassembler {
    pub fn new() -> MultiPartPacketReassembler {
        Self::default()
    }

    /// `envelope` is the message that carried the chunk
    pub fn on_chunk(&self, envelope: &MessageDto, chunk: MultiPartChunkDto) -> anyhow::Result<Option<MessageDto>> {
        let id = chunk.multi_part_message_id;
        if chunk.chunk_count == 0 || chunk.chunk_index >= chunk.chunk_count {
            bail!("invalid chunk index {} of {} for multi-part message {}", chunk.chunk_index, chunk.chunk_count, id);
        }
        if chunk.chunk_count > MAX_CHUNK_COUNT || chunk.chunk_count > chunk.body_length {
            bail!("implausible chunk count {} for multi-part message {} with {} bytes", chunk.chunk_count, id, chunk.body_length);
        }
        if self.completed.contains(&id) {
            trace!("chunk {} for completed multi-part message {} - ignoring", chunk.chunk_index, id);
            return Ok(None);
        }

        let is_complete = {
            let mut partial = self.in_progress.entry(id)
                .or_insert_with(|| PartialMessage::new(envelope.sender_id, envelope.receiver_id, &chunk));
            if partial.sender_id != envelope.sender_id {
                bail!("chunk for multi-part message {} from {:?}, but the message is from {:?}", id, envelope.sender_id, partial.sender_id);
            }
            let chunk_index = chunk.chunk_index;
            if !partial.add(chunk)? {
                trace!("duplicate chunk {} for multi-part message {} - ignoring", chunk_index, id);
                return Ok(None);
            }
            partial.is_complete()
        };

        if !is_complete {
            return Ok(None);
        }
        let Some((_, partial)) = self.in_progress.remove(&id) else {
            return Ok(None);
        };
        if !self.completed.insert(id) {
            return Ok(None);
        }
        debug!("multi-part message {} is complete", id);
        partial.assemble().map(Some)
    }

    pub fn num_in_progress(&self) -> usize {
        self.in_progress.len()
    }

    /// Discards incomplete messages whose first chunk arrived more than `max_age` ago
    pub fn prune_stale(&self, max_age: Duration) {
        let now = Instant::now();
        self.in_progress.retain(|id, partial| {
            let keep = now.duration_since(partial.started) < max_age;
            if !keep {
                debug!("discarding incomplete multi-part message {} with {} of {} chunks", id, partial.num_received, partial.chunk_count);
            }
            keep
        });
    }
}
