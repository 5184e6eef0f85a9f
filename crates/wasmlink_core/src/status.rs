//! Single-slot status and result holders shared by both execution contexts.
//!
//! Every field is an atomic, so readers on the transport side never lock.
//! The published [`SessionState`] is the synchronization point between
//! contexts. It shares one word with the error code and a transfer
//! generation that the transport bumps on every Start and Reset. Worker
//! transitions are compare-and-swap on the whole word, so a transfer started
//! in the meantime is never overwritten by work queued for an older one.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::session::SessionState;

/// Outcome of the most recent `Execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: SessionState,
    pub error_code: ErrorCode,
    pub return_value: i32,
    pub execution_time_us: u32,
}

impl ExecutionResult {
    pub fn success(return_value: i32, execution_time_us: u32) -> Self {
        Self {
            status: SessionState::Complete,
            error_code: ErrorCode::None,
            return_value,
            execution_time_us,
        }
    }

    pub fn failure(error_code: ErrorCode, execution_time_us: u32) -> Self {
        Self {
            status: SessionState::Error,
            error_code,
            return_value: 0,
            execution_time_us,
        }
    }
}

/// Point-in-time copy of the published status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub error_code: ErrorCode,
    pub bytes_received: u32,
    pub total_size: u32,
    pub uptime_secs: u32,
}

/// Receives change notifications from the worker.
pub trait StatusListener: Send + Sync {
    fn status_changed(&self, status: &StatusSnapshot);

    fn result_ready(&self, _result: &ExecutionResult) {}
}

const STATE_BITS: u32 = 8;
const CODE_BITS: u32 = 8;
const GENERATION_MASK: u32 = 0xFFFF;

fn pack(generation: u32, state: SessionState, error_code: ErrorCode) -> u32 {
    ((generation & GENERATION_MASK) << (STATE_BITS + CODE_BITS))
        | (error_code.as_u8() as u32) << STATE_BITS
        | state.as_u8() as u32
}

fn unpack(word: u32) -> (u32, SessionState, ErrorCode) {
    (
        word >> (STATE_BITS + CODE_BITS),
        SessionState::from_u8(word as u8),
        ErrorCode::from_u8((word >> STATE_BITS) as u8),
    )
}

#[derive(Debug)]
pub struct StatusStore {
    /// Transfer generation (upper 16 bits), error code and state (low byte).
    word: AtomicU32,
    bytes_received: AtomicU32,
    total_size: AtomicU32,

    result_valid: AtomicBool,
    result_status: AtomicU8,
    result_error: AtomicU8,
    result_value: AtomicI32,
    result_time_us: AtomicU32,

    booted_at: Instant,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusStore {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(pack(0, SessionState::Idle, ErrorCode::None)),
            bytes_received: AtomicU32::new(0),
            total_size: AtomicU32::new(0),
            result_valid: AtomicBool::new(false),
            result_status: AtomicU8::new(SessionState::Idle.as_u8()),
            result_error: AtomicU8::new(ErrorCode::None.as_u8()),
            result_value: AtomicI32::new(0),
            result_time_us: AtomicU32::new(0),
            booted_at: Instant::now(),
        }
    }

    fn load(&self) -> (u32, SessionState, ErrorCode) {
        unpack(self.word.load(Ordering::Acquire))
    }

    fn update(&self, f: impl Fn(u32, SessionState, ErrorCode) -> u32) -> u32 {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (generation, state, code) = unpack(word);
                Some(f(generation, state, code))
            })
            .unwrap_or_else(|word| word)
    }

    pub fn state(&self) -> SessionState {
        self.load().1
    }

    /// Generation of the transfer the published state belongs to.
    pub fn generation(&self) -> u32 {
        self.load().0
    }

    pub fn error_code(&self) -> ErrorCode {
        self.load().2
    }

    /// Unconditional transition within the current generation. Only the
    /// transport side uses this, for transitions it alone drives.
    pub fn publish(&self, state: SessionState, error_code: ErrorCode) {
        self.update(|generation, _, _| pack(generation, state, error_code));
    }

    /// Start a new generation in `state` and return it. Work queued for
    /// earlier generations becomes stale.
    pub fn begin(&self, state: SessionState, error_code: ErrorCode) -> u32 {
        let previous = self.update(|generation, _, _| {
            pack(generation.wrapping_add(1), state, error_code)
        });
        unpack(previous).0.wrapping_add(1) & GENERATION_MASK
    }

    /// Record an error code without moving the state.
    pub fn set_error_code(&self, error_code: ErrorCode) {
        self.update(|generation, state, _| pack(generation, state, error_code));
    }

    /// Move to `next` with `error_code` only if the generation is still
    /// `generation` and the current state is one of `from`. State and code
    /// change together.
    ///
    /// Returns the state that was replaced, or the state that blocked the
    /// transition.
    pub fn transition(
        &self,
        generation: u32,
        from: &[SessionState],
        next: SessionState,
        error_code: ErrorCode,
    ) -> Result<SessionState, SessionState> {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let (current_generation, current, _) = unpack(word);
            if current_generation != generation || !from.contains(&current) {
                return Err(current);
            }
            match self.word.compare_exchange_weak(
                word,
                pack(generation, next, error_code),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => word = actual,
            }
        }
    }

    pub fn set_progress(&self, bytes_received: u32, total_size: u32) {
        self.bytes_received.store(bytes_received, Ordering::Release);
        self.total_size.store(total_size, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (_, state, error_code) = self.load();
        StatusSnapshot {
            state,
            error_code,
            bytes_received: self.bytes_received.load(Ordering::Acquire),
            total_size: self.total_size.load(Ordering::Acquire),
            uptime_secs: self.booted_at.elapsed().as_secs() as u32,
        }
    }

    /// Last-writer-wins. The validity flag is cleared first and set last.
    /// Fields are stored individually, so a read that overlaps a concurrent
    /// write may mix fields of the two results.
    pub fn write_result(&self, result: ExecutionResult) {
        self.result_valid.store(false, Ordering::Release);
        self.result_status
            .store(result.status.as_u8(), Ordering::Release);
        self.result_error
            .store(result.error_code.as_u8(), Ordering::Release);
        self.result_value
            .store(result.return_value, Ordering::Release);
        self.result_time_us
            .store(result.execution_time_us, Ordering::Release);
        self.result_valid.store(true, Ordering::Release);
    }

    pub fn clear_result(&self) {
        self.result_valid.store(false, Ordering::Release);
    }

    /// The stored result, or `None` when nothing was executed since the
    /// last reset.
    pub fn result(&self) -> Option<ExecutionResult> {
        if !self.result_valid.load(Ordering::Acquire) {
            return None;
        }
        Some(ExecutionResult {
            status: SessionState::from_u8(self.result_status.load(Ordering::Acquire)),
            error_code: ErrorCode::from_u8(self.result_error.load(Ordering::Acquire)),
            return_value: self.result_value.load(Ordering::Acquire),
            execution_time_us: self.result_time_us.load(Ordering::Acquire),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_requires_expected_state() {
        let store = StatusStore::new();
        let generation = store.begin(SessionState::Receiving, ErrorCode::None);
        store.publish(SessionState::Received, ErrorCode::None);

        assert_eq!(
            store.transition(
                generation,
                &[SessionState::Received],
                SessionState::Loaded,
                ErrorCode::None
            ),
            Ok(SessionState::Received)
        );
        assert_eq!(store.state(), SessionState::Loaded);

        store.publish(SessionState::Receiving, ErrorCode::None);
        assert_eq!(
            store.transition(
                generation,
                &[SessionState::Executing],
                SessionState::Loaded,
                ErrorCode::None
            ),
            Err(SessionState::Receiving)
        );
        assert_eq!(store.state(), SessionState::Receiving);
    }

    #[test]
    fn test_stale_generation_cannot_transition() {
        let store = StatusStore::new();
        let old = store.begin(SessionState::Receiving, ErrorCode::None);
        store.publish(SessionState::Received, ErrorCode::None);

        let new = store.begin(SessionState::Receiving, ErrorCode::None);
        store.publish(SessionState::Received, ErrorCode::None);
        assert_ne!(old, new);
        assert_eq!(store.generation(), new);

        assert!(store
            .transition(old, &[SessionState::Received], SessionState::Error, ErrorCode::InvalidMagic)
            .is_err());
        assert_eq!(store.state(), SessionState::Received);
        assert_eq!(store.error_code(), ErrorCode::None);
    }

    #[test]
    fn test_publish_keeps_generation() {
        let store = StatusStore::new();
        let generation = store.begin(SessionState::Idle, ErrorCode::None);
        store.publish(SessionState::Error, ErrorCode::Overflow);
        assert_eq!(store.generation(), generation);
        assert_eq!(store.state(), SessionState::Error);
        assert_eq!(store.error_code(), ErrorCode::Overflow);
    }

    #[test]
    fn test_new_transfer_code_survives_stale_transition() {
        let store = StatusStore::new();
        let old = store.begin(SessionState::Receiving, ErrorCode::None);
        store.publish(SessionState::Received, ErrorCode::None);

        // A Start lands before the worker's load outcome.
        let new = store.begin(SessionState::Receiving, ErrorCode::None);
        assert!(store
            .transition(old, &[SessionState::Received], SessionState::Error, ErrorCode::LoadFailed)
            .is_err());
        assert_eq!(store.generation(), new);
        assert_eq!(store.error_code(), ErrorCode::None);

        // And once the transition wins, a Start still clears its code.
        store.publish(SessionState::Received, ErrorCode::None);
        store
            .transition(new, &[SessionState::Received], SessionState::Error, ErrorCode::ParseFailed)
            .unwrap();
        assert_eq!(store.error_code(), ErrorCode::ParseFailed);
        store.begin(SessionState::Receiving, ErrorCode::None);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.state, SessionState::Receiving);
        assert_eq!(snapshot.error_code, ErrorCode::None);
    }

    #[test]
    fn test_error_code_keeps_generation_and_state() {
        let store = StatusStore::new();
        let generation = store.begin(SessionState::Receiving, ErrorCode::None);
        store.set_error_code(ErrorCode::InvalidParams);
        assert_eq!(store.generation(), generation);
        assert_eq!(store.state(), SessionState::Receiving);
        assert_eq!(store.error_code(), ErrorCode::InvalidParams);
    }

    #[test]
    fn test_generation_wraps() {
        let store = StatusStore::new();
        let mut last = 0;
        for _ in 0..=GENERATION_MASK {
            last = store.begin(SessionState::Idle, ErrorCode::None);
        }
        assert_eq!(last, 0);
        assert_eq!(store.generation(), 0);
        assert_eq!(store.state(), SessionState::Idle);
    }

    #[test]
    fn test_result_slot_lifecycle() {
        let store = StatusStore::new();
        assert_eq!(store.result(), None);

        store.write_result(ExecutionResult::success(42, 120));
        assert_eq!(store.result(), Some(ExecutionResult::success(42, 120)));

        store.write_result(ExecutionResult::failure(ErrorCode::ExecutionFailed, 7));
        let result = store.result().unwrap();
        assert_eq!(result.status, SessionState::Error);
        assert_eq!(result.error_code, ErrorCode::ExecutionFailed);
        assert_eq!(result.return_value, 0);

        store.clear_result();
        assert_eq!(store.result(), None);
    }

    #[test]
    fn test_snapshot_reports_progress() {
        let store = StatusStore::new();
        store.publish(SessionState::Receiving, ErrorCode::None);
        store.set_progress(32, 64);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.state, SessionState::Receiving);
        assert_eq!(snapshot.bytes_received, 32);
        assert_eq!(snapshot.total_size, 64);
    }
}
