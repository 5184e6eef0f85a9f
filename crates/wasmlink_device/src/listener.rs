//! Notification sink for the worker: logs each change the way the
//! characteristic notifications would be sent, and forwards it to the
//! loopback client.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use tracing::info;
use wasmlink_core::wire::{ResultResponse, StatusResponse};
use wasmlink_core::{ExecutionResult, StatusListener, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Status(StatusSnapshot),
    Result(ExecutionResult),
}

pub struct NotifyListener {
    tx: Mutex<Sender<Notification>>,
}

impl NotifyListener {
    pub fn new() -> (Self, Receiver<Notification>) {
        let (tx, rx) = channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }

    fn forward(&self, notification: Notification) {
        if let Ok(tx) = self.tx.lock() {
            // The client may already be gone during shutdown.
            let _ = tx.send(notification);
        }
    }
}

impl StatusListener for NotifyListener {
    fn status_changed(&self, status: &StatusSnapshot) {
        let frame = StatusResponse::from(*status).encode();
        info!(
            state = ?status.state,
            error_code = ?status.error_code,
            bytes_received = status.bytes_received,
            total_size = status.total_size,
            len = frame.len(),
            "status notification"
        );
        self.forward(Notification::Status(*status));
    }

    fn result_ready(&self, result: &ExecutionResult) {
        let frame = ResultResponse(*result).encode();
        info!(
            status = ?result.status,
            error_code = ?result.error_code,
            return_value = result.return_value,
            execution_time_us = result.execution_time_us,
            len = frame.len(),
            "result notification"
        );
        self.forward(Notification::Result(*result));
    }
}
