//! In-process stand-in for the wireless link.
//!
//! The client plays the remote side: it chunks modules to the negotiated
//! MTU, writes frames through the [`GattServer`] exactly as attribute
//! writes would arrive, and waits on worker notifications instead of
//! subscribing to characteristics.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info};
use wasmlink_core::dfu::DfuService;
use wasmlink_core::registry::{Verification, RESOURCE_SIZE};
use wasmlink_core::sprite::SpriteService;
use wasmlink_core::wire::{
    chunk_module, encode_resource_request, ExecuteRequest, RegistryStatusFrame, ResourceUpload,
    ResultResponse, StatusResponse, VerifyResponse,
};
use wasmlink_core::{
    work_queue, Attribute, Engine, ExecutionResult, GattServer, ModuleRuntime, SessionState,
    StatusSnapshot, StatusStore, Worker,
};

use crate::config::Config;
use crate::listener::{Notification, NotifyListener};

pub struct LoopbackClient {
    server: GattServer,
    notifications: Receiver<Notification>,
    timeout: Duration,
    worker: JoinHandle<()>,
}

impl LoopbackClient {
    /// Bring up the device side (services + worker thread) and negotiate
    /// the client's MTU.
    pub fn connect<R>(config: &Config, runtime: R) -> anyhow::Result<Self>
    where
        R: ModuleRuntime,
        Worker<R>: Send + 'static,
    {
        let engine_config = &config.engine;
        let (tx, rx) = work_queue(engine_config.queue_capacity);
        let status = Arc::new(StatusStore::new());
        let (listener, notifications) = NotifyListener::new();
        let listener = Arc::new(listener);

        let worker = Worker::new(runtime, engine_config.runtime.clone(), rx, status.clone())
            .with_listener(listener.clone())
            .spawn()
            .context("spawning worker thread")?;

        let mut server = GattServer::new(
            Engine::new(engine_config, tx, status).with_listener(listener),
            SpriteService::new(engine_config.registry_capacity),
            DfuService::new(engine_config.dfu_capacity),
        );
        server.on_mtu_changed(config.client.mtu);
        info!(mtu = config.client.mtu, "loopback link up");

        Ok(Self {
            server,
            notifications,
            timeout: Duration::from_millis(config.client.timeout_ms),
            worker,
        })
    }

    pub fn server(&self) -> &GattServer {
        &self.server
    }

    /// Upload `module` and wait until the worker has loaded (or rejected) it.
    pub fn upload(&mut self, module: &[u8]) -> anyhow::Result<StatusSnapshot> {
        let frames = chunk_module(module, self.server.engine().max_write_len())?;
        self.discard_pending();
        info!(size = module.len(), frames = frames.len(), "uploading module");

        let last = frames.len() - 1;
        for (i, frame) in frames.iter().enumerate() {
            self.server
                .write(Attribute::ModuleUpload, frame, 0)
                .map_err(|e| anyhow!("upload frame {i} refused: {e}"))?;
            let status = self.server.engine().status().snapshot();
            if i < last && (status.state == SessionState::Error || status.error_code.is_error()) {
                bail!(
                    "upload rejected at frame {i}: {:?} ({:?})",
                    status.state,
                    status.error_code
                );
            }
        }

        // A transfer refused on its last frame never reaches the worker.
        let status = self.server.engine().status().snapshot();
        if status.state == SessionState::Error || status.error_code.is_error() {
            return Ok(status);
        }
        loop {
            if let Notification::Status(status) = self.next_notification()? {
                return Ok(status);
            }
        }
    }

    /// Call `function` on the loaded module and wait for its result.
    ///
    /// Rejected calls are reported as results too, so this always waits
    /// for exactly one result notification.
    pub fn execute(&mut self, function: &str, args: &[i32]) -> anyhow::Result<ExecutionResult> {
        let request = ExecuteRequest::new(function, args)?;
        self.discard_pending();
        self.server
            .write(Attribute::ModuleExecute, &request.encode(), 0)
            .map_err(|e| anyhow!("execute refused: {e}"))?;

        loop {
            if let Notification::Result(result) = self.next_notification()? {
                return Ok(result);
            }
        }
    }

    /// Store a resource, then ask the device to verify it.
    pub fn store_resource(
        &mut self,
        id: u16,
        payload: [u8; RESOURCE_SIZE],
    ) -> anyhow::Result<(RegistryStatusFrame, Verification)> {
        let upload = ResourceUpload::new(id, payload);
        self.server
            .write(Attribute::SpriteUpload, &upload.encode(), 0)
            .map_err(|e| anyhow!("resource upload refused: {e}"))?;
        let registry = RegistryStatusFrame::decode(&self.read(Attribute::SpriteRegistryStatus)?)?;

        self.server
            .write(Attribute::SpriteVerifyRequest, &encode_resource_request(id), 0)
            .map_err(|e| anyhow!("verify request refused: {e}"))?;
        let verify = VerifyResponse::decode(&self.read(Attribute::SpriteVerifyResponse)?)?;
        Ok((registry, verify.0))
    }

    pub fn status(&self) -> anyhow::Result<StatusResponse> {
        Ok(StatusResponse::decode(&self.read(Attribute::ModuleStatus)?)?)
    }

    pub fn result(&self) -> anyhow::Result<ExecutionResult> {
        Ok(ResultResponse::decode(&self.read(Attribute::ModuleResult)?)?.0)
    }

    /// Drop the link and wait for the worker to tear the runtime down.
    pub fn disconnect(self) -> anyhow::Result<()> {
        let Self { server, worker, .. } = self;
        drop(server);
        worker
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))?;
        debug!("loopback link closed");
        Ok(())
    }

    fn read(&self, attribute: Attribute) -> anyhow::Result<Vec<u8>> {
        self.server
            .read_value(attribute)
            .map_err(|e| anyhow!("read of {attribute:?} refused: {e}"))
    }

    fn discard_pending(&self) {
        while let Ok(stale) = self.notifications.try_recv() {
            debug!(notification = ?stale, "discarding stale notification");
        }
    }

    fn next_notification(&self) -> anyhow::Result<Notification> {
        match self.notifications.recv_timeout(self.timeout) {
            Ok(n) => Ok(n),
            Err(RecvTimeoutError::Timeout) => {
                bail!("no notification within {} ms", self.timeout.as_millis())
            }
            Err(RecvTimeoutError::Disconnected) => bail!("worker stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmlink_core::registry::VerifyOutcome;
    use wasmlink_core::{crc16_ccitt, ErrorCode, WasmtimeRuntime};

    /// `(func (export "add") (param i32 i32) (result i32) local.get 0 local.get 1 i32.add)`
    const ADD_MODULE: &[u8] = &[
        0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, 0x01, 0x07, 0x01, 0x60, 0x02, 0x7F, 0x7F,
        0x01, 0x7F, 0x03, 0x02, 0x01, 0x00, 0x07, 0x07, 0x01, 0x03, 0x61, 0x64, 0x64, 0x00, 0x00,
        0x0A, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B,
    ];

    fn client(mtu: u16) -> LoopbackClient {
        let mut config = Config::default();
        config.client.mtu = mtu;
        LoopbackClient::connect(&config, WasmtimeRuntime::new()).unwrap()
    }

    #[test]
    fn test_upload_and_execute_with_wasmtime() {
        // 20-byte writes: the module needs four frames.
        let mut client = client(23);
        let status = client.upload(ADD_MODULE).unwrap();
        assert_eq!(status.state, SessionState::Loaded);

        let result = client.execute("add", &[40, 2]).unwrap();
        assert_eq!(result.status, SessionState::Complete);
        assert_eq!(result.return_value, 42);

        let result = client.execute("sub", &[1, 2]).unwrap();
        assert_eq!(result.error_code, ErrorCode::FunctionNotFound);
        client.disconnect().unwrap();
    }

    #[test]
    fn test_execute_before_upload_is_rejected() {
        let mut client = client(247);
        let result = client.execute("add", &[1, 2]).unwrap();
        assert_eq!(result.error_code, ErrorCode::LoadFailed);
        client.disconnect().unwrap();
    }

    #[test]
    fn test_resource_store_and_verify() {
        let mut client = client(247);
        let payload = [0x5A; RESOURCE_SIZE];
        let (registry, verification) = client.store_resource(9, payload).unwrap();
        assert_eq!(registry.total, 1);
        assert_eq!(verification.outcome, VerifyOutcome::Valid);
        assert_eq!(verification.stored_crc16, crc16_ccitt(&payload));
        client.disconnect().unwrap();
    }
}
