//! Payload chunking and reassembly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use super::{Frame, Message, Topic};
use crate::error::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Split one logical payload into wire frames. An empty payload still yields
/// a single frame.
pub fn split(id: &str, topic: Topic, payload: &[u8], chunk_size: usize) -> Vec<Frame> {
    let chunk_size = chunk_size.max(1);
    let total = payload.len().div_ceil(chunk_size).max(1) as u32;
    let mut frames = Vec::with_capacity(total as usize);
    for (index, part) in payload.chunks(chunk_size).enumerate() {
        frames.push(Frame {
            kind: topic,
            id: id.to_string(),
            topic,
            chunk_index: index as u32 + 1,
            total_chunks: total,
            is_chunk: total > 1,
            payload: part.to_vec(),
        });
    }
    if frames.is_empty() {
        frames.push(Frame {
            kind: topic,
            id: id.to_string(),
            topic,
            chunk_index: 1,
            total_chunks: 1,
            is_chunk: false,
            payload: Vec::new(),
        });
    }
    frames
}

struct Partial {
    topic: Topic,
    total: u32,
    parts: Vec<Option<Vec<u8>>>,
    last_update: Instant,
}

/// Per-session reassembly table keyed by message id.
///
/// Out-of-order chunks are stored by index; a duplicate index is replaced by
/// the later arrival. Entries with no progress for `stale_after` are dropped
/// and their ids tombstoned so late chunks cannot restart them.
pub struct Reassembler {
    partial: HashMap<String, Partial>,
    tombstones: HashMap<String, Instant>,
    stale_after: Duration,
}

impl Reassembler {
    pub fn new(stale_after: Duration) -> Self {
        Reassembler {
            partial: HashMap::new(),
            tombstones: HashMap::new(),
            stale_after,
        }
    }

    /// Feed one frame; returns the complete message once every chunk landed.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Message>> {
        if frame.total_chunks < 1 || frame.chunk_index < 1 || frame.chunk_index > frame.total_chunks
        {
            return Err(Error::Chunk {
                id: frame.id,
                index: frame.chunk_index,
                total: frame.total_chunks,
            });
        }

        if self.tombstones.contains_key(&frame.id) {
            counter!("netbridge_reassembly_stale").increment(1);
            debug!(id = %frame.id, "dropping chunk for a discarded message");
            return Ok(None);
        }

        if frame.total_chunks == 1 {
            return Ok(Some(Message {
                id: frame.id,
                topic: frame.topic,
                payload: Bytes::from(frame.payload),
            }));
        }

        let entry = self.partial.entry(frame.id.clone()).or_insert_with(|| Partial {
            topic: frame.topic,
            total: frame.total_chunks,
            parts: vec![None; frame.total_chunks as usize],
            last_update: Instant::now(),
        });
        if entry.topic != frame.topic || entry.total != frame.total_chunks {
            return Err(Error::Chunk {
                id: frame.id,
                index: frame.chunk_index,
                total: frame.total_chunks,
            });
        }

        entry.parts[frame.chunk_index as usize - 1] = Some(frame.payload);
        entry.last_update = Instant::now();

        if entry.parts.iter().all(Option::is_some) {
            let entry = self.partial.remove(&frame.id).expect("entry just updated");
            let mut payload = Vec::new();
            for part in entry.parts {
                payload.extend_from_slice(&part.expect("all parts present"));
            }
            return Ok(Some(Message {
                id: frame.id,
                topic: entry.topic,
                payload: Bytes::from(payload),
            }));
        }

        Ok(None)
    }

    /// Drop partial messages with no progress since `stale_after` ago. The
    /// dropped ids are tombstoned for one further window.
    pub fn prune_stale(&mut self, now: Instant) -> usize {
        let stale: Vec<String> = self
            .partial
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_update) >= self.stale_after)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            let entry = self.partial.remove(id).expect("id collected above");
            warn!(id = %id, topic = %entry.topic, "discarding stale partial message");
            counter!("netbridge_reassembly_stale").increment(1);
            self.tombstones.insert(id.clone(), now);
        }
        self.tombstones
            .retain(|_, since| now.duration_since(*since) < self.stale_after);
        stale.len()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.partial.len()
    }
}
