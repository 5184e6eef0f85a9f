//! Shared fixtures: a scripted interpreter and a channel-backed listener.

#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use wasmlink_core::error::RuntimeError;
use wasmlink_core::{
    EngineConfig, ExecutionResult, ModuleRuntime, RuntimeLimits, StatusListener, StatusSnapshot,
};

/// Interpreter stand-in. Exports `add` (sums its arguments), `answer`
/// (returns 42) and `trap` (always fails). A module whose fifth byte is
/// `0xEE` fails to parse.
#[derive(Default)]
pub struct MockRuntime {
    pub loads: usize,
}

impl ModuleRuntime for MockRuntime {
    type Environment = ();
    type Runtime = ();
    type Module = ();
    type Function = &'static str;

    fn create_environment(&mut self, _: &RuntimeLimits) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn create_runtime(&mut self, _: &(), _: &RuntimeLimits) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn parse(&mut self, _: &(), bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.get(4) == Some(&0xEE) {
            return Err(RuntimeError::Parse("malformed section".into()));
        }
        Ok(())
    }

    fn load(&mut self, _: &mut (), _: &()) -> Result<(), RuntimeError> {
        self.loads += 1;
        Ok(())
    }

    fn compile(&mut self, _: &mut (), _: &()) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn find_function(&mut self, _: &mut (), name: &str) -> Result<&'static str, RuntimeError> {
        match name {
            "add" => Ok("add"),
            "answer" => Ok("answer"),
            "trap" => Ok("trap"),
            other => Err(RuntimeError::FunctionNotFound(other.into())),
        }
    }

    fn call(&mut self, _: &mut (), f: &&'static str, args: &[i32]) -> Result<i32, RuntimeError> {
        match *f {
            "add" => Ok(args.iter().sum()),
            "answer" => Ok(42),
            _ => Err(RuntimeError::Execution("unreachable executed".into())),
        }
    }

    fn free_module(&mut self, _: ()) {}
    fn free_runtime(&mut self, _: ()) {}
    fn free_environment(&mut self, _: ()) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Status(StatusSnapshot),
    Result(ExecutionResult),
}

/// Forwards every notification to a channel so tests can wait on it.
pub struct ChannelListener {
    tx: Mutex<Sender<Event>>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }
}

impl StatusListener for ChannelListener {
    fn status_changed(&self, status: &StatusSnapshot) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(Event::Status(*status));
        }
    }

    fn result_ready(&self, result: &ExecutionResult) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(Event::Result(*result));
        }
    }
}

/// A module of `len` bytes that starts with a valid signature.
pub fn module(len: usize) -> Vec<u8> {
    let mut bytes = b"\0asm\x01\0\0\0".to_vec();
    bytes.extend((8..len).map(|i| (i % 251) as u8));
    bytes.truncate(len);
    bytes
}

pub fn config() -> EngineConfig {
    EngineConfig {
        buffer_capacity: 4096,
        ..EngineConfig::default()
    }
}
