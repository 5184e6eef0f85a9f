//! Transport-facing half of the engine.
//!
//! [`Engine`] runs inside the transport's delivery callback. Every method
//! completes in bounded time and never blocks: reassembly happens in place,
//! and anything slow is handed to the worker through the queue. Failures are
//! published on the status and result slots, never returned across the
//! wireless boundary.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ErrorCode, TransferError, WireError};
use crate::queue::{WorkItem, WorkSender};
use crate::session::{ChunkProgress, SessionState, TransferSession};
use crate::status::{ExecutionResult, StatusListener, StatusStore};
use crate::wire::{ExecuteRequest, ResultResponse, StatusResponse, UploadCommand, UploadPacket};

pub struct Engine {
    session: TransferSession,
    sender: WorkSender,
    status: Arc<StatusStore>,
    listener: Option<Arc<dyn StatusListener>>,
    mtu: u16,
}

impl Engine {
    pub fn new(config: &EngineConfig, sender: WorkSender, status: Arc<StatusStore>) -> Self {
        Self {
            session: TransferSession::new(config.buffer_capacity),
            sender,
            status,
            listener: None,
            mtu: config.default_mtu,
        }
    }

    /// Rejected executes are reported to `listener` as results, the same
    /// way the worker reports finished calls.
    pub fn with_listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn status(&self) -> &Arc<StatusStore> {
        &self.status
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Called by the transport whenever the link renegotiates its MTU.
    pub fn set_negotiated_mtu(&mut self, mtu: u16) {
        info!(mtu, max_write = EngineConfig::max_write_len(mtu), "mtu negotiated");
        self.mtu = mtu;
    }

    pub fn max_write_len(&self) -> usize {
        EngineConfig::max_write_len(self.mtu)
    }

    /// Decode and apply a write to the upload characteristic.
    pub fn handle_upload_frame(&mut self, frame: &[u8]) -> Result<(), WireError> {
        self.check_frame_len(frame)?;
        let packet = UploadPacket::decode(frame).map_err(|e| self.reject_frame(e))?;
        self.handle_upload(&packet);
        Ok(())
    }

    /// Decode and apply a write to the execute characteristic.
    ///
    /// The request has a fixed layout independent of the MTU, so only upload
    /// chunks are held to the negotiated write length. A malformed request
    /// still publishes an Error result.
    pub fn handle_execute_frame(&mut self, frame: &[u8]) -> Result<(), WireError> {
        match ExecuteRequest::decode(frame) {
            Ok(request) => {
                self.handle_execute(&request);
                Ok(())
            }
            Err(e) => {
                let e = self.reject_frame(e);
                self.reject_execute(e.code(), &e.to_string());
                Err(e)
            }
        }
    }

    pub fn handle_upload(&mut self, packet: &UploadPacket<'_>) {
        match packet.command {
            UploadCommand::Start => {
                if let Err(e) = self.session.start(packet.total_size) {
                    warn!(total_size = packet.total_size, error = %e, "upload start rejected");
                    self.status.set_error_code(e.code());
                    return;
                }
                let transfer = self.status.begin(SessionState::Receiving, ErrorCode::None);
                self.status.set_progress(0, packet.total_size);
                info!(transfer, total_size = packet.total_size, "upload started");
                // The Start frame carries the first chunk.
                self.accept_chunk(packet.sequence, packet.data);
            }
            UploadCommand::Continue => self.accept_chunk(packet.sequence, packet.data),
            UploadCommand::End => match self.session.end_early() {
                Ok(()) => {
                    warn!(
                        received = self.session.received_bytes(),
                        "legacy end-of-upload, finalizing partial payload"
                    );
                    self.complete_transfer();
                }
                Err(e) => {
                    debug!(error = %e, "end-of-upload ignored");
                    self.status.set_error_code(e.code());
                }
            },
            UploadCommand::Reset => self.reset(),
        }
    }

    pub fn handle_execute(&mut self, request: &ExecuteRequest) {
        let parsed = request
            .function()
            .and_then(|f| request.arg_count().map(|n| (f, n)));
        let (function, arg_count) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reject_execute(e.code(), &e.to_string());
                return;
            }
        };

        let state = self.status.state();
        if !matches!(
            state,
            SessionState::Received
                | SessionState::Loaded
                | SessionState::Executing
                | SessionState::Complete
        ) {
            self.reject_execute(ErrorCode::LoadFailed, "no module loaded");
            return;
        }

        // Cleared before enqueueing so the worker's result cannot be erased.
        self.status.clear_result();
        let item = WorkItem::Execute {
            transfer: self.status.generation(),
            function: function.clone(),
            args: request.args,
            arg_count,
        };
        match self.sender.enqueue(item) {
            Ok(()) => info!(function = %function, arg_count, "execute queued"),
            Err(e) => {
                self.status.set_error_code(e.code());
                self.reject_execute(e.code(), "work queue full");
            }
        }
    }

    /// Abort any transfer, drop the result and queue runtime teardown.
    pub fn reset(&mut self) {
        self.session.reset();
        let transfer = self.status.begin(SessionState::Idle, ErrorCode::None);
        self.status.set_progress(0, 0);
        self.status.clear_result();
        info!(transfer, "reset requested");
        if let Err(e) = self.sender.enqueue(WorkItem::Reset { transfer }) {
            self.status.set_error_code(e.code());
        }
    }

    pub fn status_response(&self) -> StatusResponse {
        StatusResponse::from(self.status.snapshot())
    }

    pub fn result_response(&self) -> ResultResponse {
        ResultResponse(self.status.result().unwrap_or_default())
    }

    fn accept_chunk(&mut self, sequence: u8, data: &[u8]) {
        let outcome = self.session.accept_chunk(sequence, data);
        self.status.set_progress(
            self.session.received_bytes(),
            self.session.expected_total(),
        );
        match outcome {
            Ok(ChunkProgress::Continuing) => {}
            Ok(ChunkProgress::Completed) => self.complete_transfer(),
            Err(TransferError::InvalidState) => {
                debug!(sequence, "chunk outside a transfer dropped");
                self.status.set_error_code(TransferError::InvalidState.code());
            }
            Err(e) => {
                warn!(sequence, error = %e, "transfer aborted");
                self.status.publish(SessionState::Error, e.code());
            }
        }
    }

    fn complete_transfer(&mut self) {
        self.status.publish(SessionState::Received, ErrorCode::None);
        let module = self.session.take_payload();
        let size = module.len();
        let transfer = self.status.generation();
        match self.sender.enqueue(WorkItem::LoadModule { transfer, module }) {
            Ok(()) => info!(transfer, size, "module received"),
            Err(e) => self.status.publish(SessionState::Error, e.code()),
        }
    }

    fn reject_execute(&self, code: ErrorCode, reason: &str) {
        warn!(code = ?code, reason, "execute rejected");
        let result = ExecutionResult::failure(code, 0);
        self.status.write_result(result);
        if let Some(listener) = &self.listener {
            listener.result_ready(&result);
        }
    }

    fn check_frame_len(&self, frame: &[u8]) -> Result<(), WireError> {
        let max = self.max_write_len();
        if frame.len() > max {
            return Err(self.reject_frame(WireError::TooLong {
                len: frame.len(),
                max,
            }));
        }
        Ok(())
    }

    fn reject_frame(&self, e: WireError) -> WireError {
        warn!(error = %e, "malformed frame");
        self.status.set_error_code(e.code());
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{work_queue, WorkReceiver};

    fn engine(queue: usize) -> (Engine, WorkReceiver) {
        let (tx, rx) = work_queue(queue);
        let config = EngineConfig {
            buffer_capacity: 128,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(&config, tx, Arc::new(StatusStore::new()));
        engine.set_negotiated_mtu(247);
        (engine, rx)
    }

    fn start(total: u32, data: &[u8]) -> UploadPacket<'_> {
        UploadPacket {
            command: UploadCommand::Start,
            sequence: 0,
            total_size: total,
            data,
        }
    }

    fn cont(sequence: u8, data: &[u8]) -> UploadPacket<'_> {
        UploadPacket {
            command: UploadCommand::Continue,
            sequence,
            total_size: 0,
            data,
        }
    }

    #[test]
    fn test_two_chunk_upload_queues_load() {
        let (mut engine, mut rx) = engine(4);
        let mut module = vec![0u8; 64];
        module[..4].copy_from_slice(b"\0asm");

        engine.handle_upload(&start(64, &module[..32]));
        assert_eq!(engine.status().state(), SessionState::Receiving);
        assert_eq!(engine.status_response().bytes_received, 32);

        engine.handle_upload(&cont(1, &module[32..]));
        assert_eq!(engine.status().state(), SessionState::Received);
        match rx.try_dequeue() {
            Some(WorkItem::LoadModule { module: queued, .. }) => assert_eq!(queued, module),
            other => panic!("expected LoadModule, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_start_leaves_state() {
        let (mut engine, mut rx) = engine(4);
        engine.handle_upload(&start(129, &[]));
        assert_eq!(engine.status().state(), SessionState::Idle);
        assert_eq!(engine.status().error_code(), ErrorCode::Overflow);
        assert_eq!(rx.try_dequeue(), None);
    }

    #[test]
    fn test_sequence_mismatch_publishes_error() {
        let (mut engine, _rx) = engine(4);
        engine.handle_upload(&start(16, &[1; 8]));
        engine.handle_upload(&cont(2, &[1; 8]));
        assert_eq!(engine.status().state(), SessionState::Error);
        assert_eq!(engine.status().error_code(), ErrorCode::SequenceMismatch);
        assert_eq!(engine.session().received_bytes(), 8);
    }

    #[test]
    fn test_stray_chunk_keeps_state() {
        let (mut engine, _rx) = engine(4);
        engine.handle_upload(&cont(0, &[1; 8]));
        assert_eq!(engine.status().state(), SessionState::Idle);
        assert_eq!(engine.status().error_code(), ErrorCode::InvalidParams);
        assert_eq!(engine.session().next_sequence(), 0);
    }

    #[test]
    fn test_execute_while_receiving_is_rejected() {
        let (mut engine, mut rx) = engine(4);
        engine.handle_upload(&start(64, &[0; 16]));
        engine.handle_execute(&ExecuteRequest::new("run", &[]).unwrap());

        let result = engine.result_response().0;
        assert_eq!(result.status, SessionState::Error);
        assert_eq!(result.error_code, ErrorCode::LoadFailed);
        assert_eq!(engine.session().next_sequence(), 1);
        assert_eq!(engine.session().received_bytes(), 16);
        assert_eq!(rx.try_dequeue(), None);
    }

    #[test]
    fn test_invalid_execute_params() {
        let (mut engine, _rx) = engine(4);
        let mut request = ExecuteRequest::new("run", &[]).unwrap();
        request.arg_count = 5;
        engine.handle_execute(&request);
        assert_eq!(engine.result_response().0.error_code, ErrorCode::InvalidParams);
    }

    #[test]
    fn test_rejection_is_reported_to_listener() {
        use crate::status::StatusSnapshot;
        use std::sync::Mutex;

        #[derive(Default)]
        struct Results(Mutex<Vec<ExecutionResult>>);
        impl StatusListener for Results {
            fn status_changed(&self, _: &StatusSnapshot) {}
            fn result_ready(&self, result: &ExecutionResult) {
                self.0.lock().unwrap().push(*result);
            }
        }

        let results = Arc::new(Results::default());
        let (engine, _rx) = engine(4);
        let mut engine = engine.with_listener(results.clone());
        engine.handle_execute(&ExecuteRequest::new("run", &[]).unwrap());

        let seen = results.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].error_code, ErrorCode::LoadFailed);
    }

    #[test]
    fn test_legacy_end_finalizes_partial_upload() {
        let (mut engine, mut rx) = engine(4);
        engine.handle_upload(&start(100, b"\0asm\x01\0\0\0"));
        engine.handle_upload(&UploadPacket::control(UploadCommand::End));
        assert_eq!(engine.status().state(), SessionState::Received);
        assert!(matches!(
            rx.try_dequeue(),
            Some(WorkItem::LoadModule { module, .. }) if module.len() == 8
        ));
    }

    #[test]
    fn test_reset_is_immediate_and_queued() {
        let (mut engine, mut rx) = engine(4);
        engine.handle_upload(&start(64, &[0; 16]));
        let before = engine.status().generation();

        engine.handle_upload(&UploadPacket::control(UploadCommand::Reset));
        engine.handle_upload(&UploadPacket::control(UploadCommand::Reset));
        assert_eq!(engine.status().state(), SessionState::Idle);
        assert_eq!(engine.session().received_bytes(), 0);
        assert_ne!(engine.status().generation(), before);
        assert!(matches!(rx.try_dequeue(), Some(WorkItem::Reset { .. })));
    }

    #[test]
    fn test_queue_full_is_published() {
        let (mut engine, _rx) = engine(1);
        engine.handle_upload(&start(4, b"\0asm"));
        assert_eq!(engine.status().state(), SessionState::Received);

        engine.handle_execute(&ExecuteRequest::new("run", &[]).unwrap());
        assert_eq!(engine.status().error_code(), ErrorCode::QueueFull);
        assert_eq!(engine.result_response().0.error_code, ErrorCode::QueueFull);
    }

    #[test]
    fn test_upload_frames_longer_than_mtu_are_rejected() {
        let (mut engine, _rx) = engine(4);
        engine.set_negotiated_mtu(23);
        let mut frame = UploadPacket {
            command: UploadCommand::Start,
            sequence: 0,
            total_size: 64,
            data: &[0; 12],
        }
        .encode();
        frame.push(0);
        assert!(matches!(
            engine.handle_upload_frame(&frame),
            Err(WireError::TooLong { len: 21, max: 20 })
        ));
        assert_eq!(engine.status().error_code(), ErrorCode::InvalidParams);
        assert_eq!(engine.status().state(), SessionState::Idle);

        assert!(matches!(
            engine.handle_upload_frame(&[0x01, 0x00]),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn test_execute_is_accepted_at_minimum_mtu() {
        let (mut engine, mut rx) = engine(4);
        engine.set_negotiated_mtu(23);
        engine.handle_upload(&start(4, b"\0asm"));
        rx.try_dequeue();

        let frame = ExecuteRequest::new("add", &[1, 2]).unwrap().encode();
        assert_eq!(frame.len(), 52);
        engine.handle_execute_frame(&frame).unwrap();
        assert!(matches!(
            rx.try_dequeue(),
            Some(WorkItem::Execute { arg_count: 2, .. })
        ));
    }

    #[test]
    fn test_short_execute_frame_publishes_error_result() {
        let (mut engine, mut rx) = engine(4);
        engine.handle_upload(&start(4, b"\0asm"));
        rx.try_dequeue();

        let frame = ExecuteRequest::new("add", &[1]).unwrap().encode();
        assert!(matches!(
            engine.handle_execute_frame(&frame[..20]),
            Err(WireError::TooShort { needed: 52, got: 20 })
        ));
        let result = engine.result_response().0;
        assert_eq!(result.status, SessionState::Error);
        assert_eq!(result.error_code, ErrorCode::InvalidParams);
        assert_eq!(rx.try_dequeue(), None);
    }
}
