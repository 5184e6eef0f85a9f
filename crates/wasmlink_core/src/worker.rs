//! The worker: the single context that owns the runtime adapter and
//! performs every long-latency operation.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::RuntimeLimits;
use crate::error::{ErrorCode, RuntimeError};
use crate::integrity::validate_magic;
use crate::queue::{FunctionName, WorkItem, WorkReceiver};
use crate::runtime::{ModuleRuntime, RuntimeAdapter};
use crate::session::SessionState;
use crate::status::{ExecutionResult, StatusListener, StatusStore};

pub struct Worker<R: ModuleRuntime> {
    adapter: RuntimeAdapter<R>,
    receiver: WorkReceiver,
    status: Arc<StatusStore>,
    listener: Option<Arc<dyn StatusListener>>,
}

impl<R: ModuleRuntime> Worker<R> {
    pub fn new(
        runtime: R,
        limits: RuntimeLimits,
        receiver: WorkReceiver,
        status: Arc<StatusStore>,
    ) -> Self {
        Self {
            adapter: RuntimeAdapter::new(runtime, limits),
            receiver,
            status,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn adapter(&self) -> &RuntimeAdapter<R> {
        &self.adapter
    }

    /// Process every item already queued, without parking. Returns how many
    /// items were handled.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(item) = self.receiver.try_dequeue() {
            self.process(item);
            handled += 1;
        }
        handled
    }

    /// Park on the queue and process items until every sender is dropped.
    pub fn run(mut self) {
        info!("worker started");
        while let Some(item) = self.receiver.dequeue_blocking() {
            self.process(item);
        }
        self.adapter.destroy();
        info!("worker stopped");
    }

    pub fn process(&mut self, item: WorkItem) {
        let transfer = item.transfer();
        debug!(item = item.kind(), transfer, "processing work item");
        match item {
            WorkItem::LoadModule { transfer, module } => self.load_module(transfer, &module),
            WorkItem::Execute {
                transfer,
                function,
                args,
                arg_count,
            } => self.execute(transfer, &function, &args[..arg_count.min(args.len())]),
            WorkItem::Reset { transfer } => self.reset(transfer),
        }
    }

    fn load_module(&mut self, transfer: u32, module: &[u8]) {
        if transfer != self.status.generation() {
            debug!(transfer, "stale module discarded");
            return;
        }

        let outcome = if validate_magic(module) {
            self.adapter
                .parse_and_load(module)
                .and_then(|handle| self.adapter.compile(handle))
        } else {
            Err(RuntimeError::InvalidMagic)
        };

        let (next, code) = match &outcome {
            Ok(()) => (SessionState::Loaded, ErrorCode::None),
            Err(e) => (SessionState::Error, e.code()),
        };

        match self
            .status
            .transition(transfer, &[SessionState::Received], next, code)
        {
            Ok(_) => {
                match outcome {
                    Ok(()) => info!(size = module.len(), "module loaded"),
                    Err(e) => warn!(error = %e, code = ?code, "module load failed"),
                }
                self.notify_status();
            }
            Err(current) => debug!(state = ?current, "transfer superseded during load"),
        }
    }

    fn execute(&mut self, transfer: u32, function: &FunctionName, args: &[i32]) {
        if transfer != self.status.generation() {
            debug!(transfer, function = %function, "stale execute discarded");
            return;
        }

        if self
            .status
            .transition(
                transfer,
                &[SessionState::Loaded],
                SessionState::Executing,
                ErrorCode::None,
            )
            .is_err()
        {
            warn!(function = %function, state = ?self.status.state(), "execute without a loaded module");
            self.publish_result(ExecutionResult::failure(ErrorCode::LoadFailed, 0));
            return;
        }
        self.notify_status();

        let started = Instant::now();
        let outcome = self
            .adapter
            .find_function(function.as_str())
            .and_then(|func| self.adapter.call(&func, args));
        let elapsed_us = u32::try_from(started.elapsed().as_micros()).unwrap_or(u32::MAX);

        let result = match outcome {
            Ok(value) => {
                info!(function = %function, value, elapsed_us, "execution complete");
                ExecutionResult::success(value, elapsed_us)
            }
            Err(e) => {
                warn!(function = %function, error = %e, "execution failed");
                ExecutionResult::failure(e.code(), elapsed_us)
            }
        };

        // A failed call does not unload the module. A Reset or Start during
        // the call moved the generation on, and the result goes with it.
        if let Err(current) = self.status.transition(
            transfer,
            &[SessionState::Executing],
            SessionState::Loaded,
            result.error_code,
        ) {
            debug!(function = %function, state = ?current, "transfer superseded during execute");
            return;
        }
        self.status.write_result(result);
        self.notify_status();
        // Last, so a result notification always ends an execute.
        self.notify_result(&result);
    }

    fn reset(&mut self, transfer: u32) {
        self.adapter.destroy();
        // The transport already returned to Idle; only repeat that if no new
        // transfer began since.
        if transfer == self.status.generation() {
            self.status.clear_result();
            let _ = self.status.transition(
                transfer,
                &[
                    SessionState::Received,
                    SessionState::Loaded,
                    SessionState::Executing,
                    SessionState::Complete,
                    SessionState::Error,
                ],
                SessionState::Idle,
                ErrorCode::None,
            );
        }
        self.notify_status();
    }

    fn publish_result(&self, result: ExecutionResult) {
        self.status.write_result(result);
        self.notify_result(&result);
    }

    fn notify_result(&self, result: &ExecutionResult) {
        if let Some(listener) = &self.listener {
            listener.result_ready(result);
        }
    }

    fn notify_status(&self) {
        if let Some(listener) = &self.listener {
            listener.status_changed(&self.status.snapshot());
        }
    }
}

impl<R> Worker<R>
where
    R: ModuleRuntime,
    Self: Send + 'static,
{
    /// Run the worker on its own named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("wasm-worker".into())
            .spawn(move || self.run())
    }
}
