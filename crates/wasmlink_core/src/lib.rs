//! # wasmlink_core
//!
//! Segmented upload, integrity checking and offloaded execution of wasm
//! modules on MTU-constrained wireless peripherals.
//!
//! The transport side ([`gatt::GattServer`] and [`engine::Engine`]) runs in
//! the link's callback context and never blocks: it reassembles uploads,
//! validates frames and hands work to a [`worker::Worker`] through a bounded
//! queue. The worker owns the [`runtime::ModuleRuntime`] and is the only
//! thread that parses, instantiates or calls into a module. Both sides share
//! a lock-free [`status::StatusStore`].
//!
//! Next to module execution the crate carries a CRC-verified resource
//! registry ([`sprite`]) and a firmware update control point ([`dfu`]).

pub mod config;
pub mod dfu;
pub mod engine;
pub mod error;
pub mod gatt;
pub mod integrity;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod sprite;
pub mod status;
pub mod wire;
pub mod worker;

pub use config::{EngineConfig, RuntimeLimits};
pub use engine::Engine;
pub use error::{AttError, ErrorCode};
pub use gatt::{Attribute, GattServer};
pub use integrity::{crc16_ccitt, validate_magic, MODULE_MAGIC};
pub use queue::{work_queue, WorkItem, WorkReceiver, WorkSender};
pub use registry::ResourceRegistry;
pub use runtime::{ModuleRuntime, RuntimeAdapter};
pub use session::{SessionState, TransferSession};
pub use status::{ExecutionResult, StatusListener, StatusSnapshot, StatusStore};
pub use worker::Worker;

#[cfg(feature = "wasmtime")]
pub use runtime::wasmtime_backend::WasmtimeRuntime;
