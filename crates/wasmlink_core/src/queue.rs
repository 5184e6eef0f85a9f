//! Bounded handoff between the transport callback context and the worker.
//!
//! The producer half never blocks (`try_send`); the consumer half is the only
//! place in the engine allowed to park (`blocking_recv`). Items move by
//! value, so the producer keeps nothing after a successful enqueue.

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::warn;

use crate::error::{QueueError, RuntimeError};

/// Maximum number of arguments an `Execute` can carry.
pub const MAX_ARGS: usize = 4;

/// Size of the NUL-padded function name field.
pub const FUNCTION_NAME_SIZE: usize = 32;

/// Export name validated at the transport boundary: non-empty UTF-8 that fit
/// the fixed field with its NUL terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionName(String);

impl FunctionName {
    pub fn new(name: &str) -> Result<Self, RuntimeError> {
        if name.is_empty() {
            return Err(RuntimeError::InvalidParams("empty function name".into()));
        }
        if name.len() >= FUNCTION_NAME_SIZE {
            return Err(RuntimeError::InvalidParams(format!(
                "function name is {} bytes, limit is {}",
                name.len(),
                FUNCTION_NAME_SIZE - 1
            )));
        }
        if name.as_bytes().contains(&0) {
            return Err(RuntimeError::InvalidParams(
                "function name contains NUL".into(),
            ));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FunctionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deferred work, processed strictly FIFO.
///
/// `transfer` is the status generation the item was queued under; the
/// worker drops items whose generation is no longer current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Parse, load and compile a reassembled module.
    LoadModule { transfer: u32, module: Vec<u8> },
    Execute {
        transfer: u32,
        function: FunctionName,
        args: [i32; MAX_ARGS],
        arg_count: usize,
    },
    /// Tear down runtime objects and return to `Idle`.
    Reset { transfer: u32 },
}

impl WorkItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoadModule { .. } => "load_module",
            Self::Execute { .. } => "execute",
            Self::Reset { .. } => "reset",
        }
    }

    pub fn transfer(&self) -> u32 {
        match self {
            Self::LoadModule { transfer, .. }
            | Self::Execute { transfer, .. }
            | Self::Reset { transfer } => *transfer,
        }
    }
}

/// Create a queue holding at most `capacity` pending items.
pub fn work_queue(capacity: usize) -> (WorkSender, WorkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (WorkSender { tx }, WorkReceiver { rx })
}

/// Producer half, owned by the transport side.
#[derive(Debug, Clone)]
pub struct WorkSender {
    tx: mpsc::Sender<WorkItem>,
}

impl WorkSender {
    /// Never blocks. A full queue is reported, not waited on.
    pub fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        let kind = item.kind();
        self.tx.try_send(item).map_err(|e| {
            let err = match e {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Closed(_) => QueueError::Closed,
            };
            warn!(item = kind, error = %err, "work item rejected");
            err
        })
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half, owned by the worker.
#[derive(Debug)]
pub struct WorkReceiver {
    rx: mpsc::Receiver<WorkItem>,
}

impl WorkReceiver {
    /// Park until an item arrives. `None` once every sender is gone.
    ///
    /// Must not be called from within an async runtime.
    pub fn dequeue_blocking(&mut self) -> Option<WorkItem> {
        self.rx.blocking_recv()
    }

    pub fn try_dequeue(&mut self) -> Option<WorkItem> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
