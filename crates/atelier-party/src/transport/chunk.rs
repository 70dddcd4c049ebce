//! Chunked project snapshot transfer over the reliable channel.
//!
//! The sender announces `project{parts: N}` as JSON and follows it with
//! exactly N binary sends. Because the channel is reliable and ordered,
//! arrival order equals original order and no per-part framing is needed.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("project transfer announced zero parts")]
    EmptyTransfer,
    #[error("project transfer exceeds {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("received part {index} beyond announced count {expected}")]
    UnexpectedPart { index: usize, expected: usize },
}

/// Splits a project snapshot into fixed-size parts. Slices share the source
/// buffer, so no copies happen until the channel serializes them.
pub fn split_project(project: &Bytes, chunk_bytes: usize) -> Vec<Bytes> {
    if project.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::with_capacity(project.len().div_ceil(chunk_bytes));
    let mut offset = 0;
    while offset < project.len() {
        let end = (offset + chunk_bytes).min(project.len());
        parts.push(project.slice(offset..end));
        offset = end;
    }
    parts
}

/// Receive side of one in-flight project transfer.
#[derive(Debug)]
pub struct ProjectTransfer {
    expected: usize,
    limit: usize,
    received_bytes: usize,
    parts: Vec<Bytes>,
}

impl ProjectTransfer {
    pub fn new(expected: usize, limit: usize) -> Result<Self, ChunkError> {
        if expected == 0 {
            return Err(ChunkError::EmptyTransfer);
        }
        Ok(Self {
            expected,
            limit,
            received_bytes: 0,
            parts: Vec::with_capacity(expected),
        })
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.parts.len()
    }

    /// Buffers one binary part; returns the reassembled project once the
    /// final announced part lands.
    pub fn push(&mut self, part: Bytes) -> Result<Option<Bytes>, ChunkError> {
        if self.parts.len() >= self.expected {
            return Err(ChunkError::UnexpectedPart {
                index: self.parts.len(),
                expected: self.expected,
            });
        }
        self.received_bytes += part.len();
        if self.received_bytes > self.limit {
            return Err(ChunkError::TooLarge { limit: self.limit });
        }
        self.parts.push(part);
        if self.parts.len() < self.expected {
            return Ok(None);
        }
        let mut joined = BytesMut::with_capacity(self.received_bytes);
        for part in self.parts.drain(..) {
            joined.extend_from_slice(&part);
        }
        Ok(Some(joined.freeze()))
    }
}
