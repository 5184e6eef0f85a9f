//! Chunk reassembly state machine.
//!
//! A [`TransferSession`] is owned by the transport side and only ever
//! touched from the transport callback context. Every operation here is
//! bounded by the buffer capacity and never blocks.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransferError;

/// Lifecycle of an upload/execution cycle. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Idle = 0x00,
    Receiving = 0x01,
    Received = 0x02,
    Loaded = 0x03,
    Executing = 0x04,
    Complete = 0x05,
    Error = 0x06,
}

impl SessionState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Unknown values decode as `Error`: a corrupted state byte must never
    /// read back as a state that accepts work.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Idle,
            0x01 => Self::Receiving,
            0x02 => Self::Received,
            0x03 => Self::Loaded,
            0x04 => Self::Executing,
            0x05 => Self::Complete,
            _ => Self::Error,
        }
    }
}

/// Outcome of an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    /// `received_bytes == expected_total`; the session is now `Received`.
    Completed,
    /// More chunks are expected.
    Continuing,
}

/// Per-upload reassembly state.
///
/// Invariant: `received_bytes <= expected_total <= capacity`.
#[derive(Debug)]
pub struct TransferSession {
    state: SessionState,
    buffer: Box<[u8]>,
    received_bytes: u32,
    expected_total: u32,
    next_sequence: u16,
}

impl TransferSession {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: SessionState::Idle,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            received_bytes: 0,
            expected_total: 0,
            next_sequence: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn received_bytes(&self) -> u32 {
        self.received_bytes
    }

    pub fn expected_total(&self) -> u32 {
        self.expected_total
    }

    /// Sequence number the next chunk must carry. Reaches 256 after the
    /// last representable chunk, after which every chunk mismatches.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Bytes reassembled so far.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.received_bytes as usize]
    }

    /// Begin a new transfer of `total_size` bytes.
    ///
    /// An oversized declaration is rejected and leaves the session as it was.
    pub fn start(&mut self, total_size: u32) -> Result<(), TransferError> {
        if total_size as usize > self.capacity() {
            return Err(TransferError::Overflow {
                requested: total_size,
                limit: self.capacity() as u32,
            });
        }

        self.clear();
        self.expected_total = total_size;
        self.state = SessionState::Receiving;
        debug!(total_size, "transfer started");
        Ok(())
    }

    /// Append the chunk tagged `sequence`.
    ///
    /// Chunks are accepted strictly in order. A sequence mismatch or an
    /// overflow invalidates the whole transfer (`Error`); a chunk arriving
    /// outside `Receiving` is dropped without touching any counter.
    pub fn accept_chunk(
        &mut self,
        sequence: u8,
        chunk: &[u8],
    ) -> Result<ChunkProgress, TransferError> {
        if self.state != SessionState::Receiving {
            return Err(TransferError::InvalidState);
        }

        if sequence as u16 != self.next_sequence {
            self.state = SessionState::Error;
            return Err(TransferError::SequenceMismatch {
                expected: self.next_sequence,
                got: sequence,
            });
        }

        let offset = self.received_bytes as usize;
        let end = offset + chunk.len();
        let limit = self.capacity().min(self.expected_total as usize);
        if end > limit {
            self.state = SessionState::Error;
            return Err(TransferError::Overflow {
                requested: end as u32,
                limit: limit as u32,
            });
        }
        self.buffer[offset..end].copy_from_slice(chunk);
        self.received_bytes = end as u32;
        self.next_sequence += 1;
        debug!(
            sequence,
            received = self.received_bytes,
            expected = self.expected_total,
            "chunk accepted"
        );

        if self.received_bytes == self.expected_total {
            self.state = SessionState::Received;
            Ok(ChunkProgress::Completed)
        } else {
            Ok(ChunkProgress::Continuing)
        }
    }

    /// Legacy path: the client declared the upload finished before reaching
    /// the announced total. Whatever arrived becomes the final payload.
    pub fn end_early(&mut self) -> Result<(), TransferError> {
        if self.state != SessionState::Receiving {
            return Err(TransferError::InvalidState);
        }
        self.expected_total = self.received_bytes;
        self.state = SessionState::Received;
        Ok(())
    }

    /// Copy the reassembled payload out so it can be handed to the worker.
    /// The session buffer stays owned by the transport side.
    pub fn take_payload(&mut self) -> Vec<u8> {
        let payload = self.payload().to_vec();
        self.buffer[..payload.len()].fill(0);
        payload
    }

    /// Valid from any state: zero buffer and counters, back to `Idle`.
    pub fn reset(&mut self) {
        self.clear();
        self.state = SessionState::Idle;
    }

    fn clear(&mut self) {
        let used = self.received_bytes as usize;
        self.buffer[..used].fill(0);
        self.received_bytes = 0;
        self.expected_total = 0;
        self.next_sequence = 0;
    }
}
