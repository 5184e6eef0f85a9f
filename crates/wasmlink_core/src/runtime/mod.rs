//! Module Runtime Adapter.
//!
//! [`ModuleRuntime`] is the opaque interpreter collaborator: it hands out
//! environment, runtime and module objects and runs exported functions.
//! [`RuntimeAdapter`] owns those objects and enforces the sequencing rules
//! (idempotent create, reload without reset, teardown in dependency order).
//! Only the worker holds an adapter, so nothing here is synchronized.

#[cfg(feature = "wasmtime")]
pub mod wasmtime_backend;

use tracing::{debug, info};

use crate::config::RuntimeLimits;
use crate::error::RuntimeError;

/// Interpreter collaborator.
///
/// Object lifetimes nest: a module lives inside a runtime, which lives
/// inside an environment. The adapter always frees inner objects first.
pub trait ModuleRuntime {
    type Environment;
    type Runtime;
    type Module;
    type Function: Clone;

    fn create_environment(&mut self, limits: &RuntimeLimits)
        -> Result<Self::Environment, RuntimeError>;

    fn create_runtime(
        &mut self,
        env: &Self::Environment,
        limits: &RuntimeLimits,
    ) -> Result<Self::Runtime, RuntimeError>;

    fn parse(&mut self, env: &Self::Environment, bytes: &[u8])
        -> Result<Self::Module, RuntimeError>;

    /// Attach a parsed module to the runtime.
    fn load(&mut self, rt: &mut Self::Runtime, module: &Self::Module) -> Result<(), RuntimeError>;

    /// Make the loaded module's exports callable.
    fn compile(&mut self, rt: &mut Self::Runtime, module: &Self::Module)
        -> Result<(), RuntimeError>;

    fn find_function(&mut self, rt: &mut Self::Runtime, name: &str)
        -> Result<Self::Function, RuntimeError>;

    fn call(
        &mut self,
        rt: &mut Self::Runtime,
        func: &Self::Function,
        args: &[i32],
    ) -> Result<i32, RuntimeError>;

    fn free_module(&mut self, module: Self::Module);
    fn free_runtime(&mut self, rt: Self::Runtime);
    fn free_environment(&mut self, env: Self::Environment);
}

/// Identifies one successful `parse_and_load`. Stale after the next load or
/// a `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u32);

/// A function resolved against a specific module generation.
#[derive(Debug, Clone)]
pub struct FunctionRef<F> {
    func: F,
    module: ModuleHandle,
}

struct LoadedModule<M> {
    module: M,
    handle: ModuleHandle,
    compiled: bool,
}

pub struct RuntimeAdapter<R: ModuleRuntime> {
    backend: R,
    limits: RuntimeLimits,
    environment: Option<R::Environment>,
    runtime: Option<R::Runtime>,
    module: Option<LoadedModule<R::Module>>,
    generation: u32,
}

impl<R: ModuleRuntime> RuntimeAdapter<R> {
    pub fn new(backend: R, limits: RuntimeLimits) -> Self {
        Self {
            backend,
            limits,
            environment: None,
            runtime: None,
            module: None,
            generation: 0,
        }
    }

    pub fn backend(&self) -> &R {
        &self.backend
    }

    pub fn is_created(&self) -> bool {
        self.environment.is_some() && self.runtime.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.module.as_ref().is_some_and(|m| m.compiled)
    }

    /// Create environment and runtime. A no-op when both already exist.
    pub fn create(&mut self) -> Result<(), RuntimeError> {
        if self.environment.is_none() {
            self.environment = Some(self.backend.create_environment(&self.limits)?);
            debug!("runtime environment created");
        }
        if self.runtime.is_none() {
            let Some(env) = self.environment.as_ref() else {
                return Err(RuntimeError::Init("environment missing".into()));
            };
            self.runtime = Some(self.backend.create_runtime(env, &self.limits)?);
            debug!(stack_size = self.limits.stack_size, "runtime created");
        }
        Ok(())
    }

    /// Parse `bytes` and attach the module to a runtime.
    ///
    /// A previously loaded module is released together with its runtime,
    /// which is then recreated, so re-upload without a reset works.
    pub fn parse_and_load(&mut self, bytes: &[u8]) -> Result<ModuleHandle, RuntimeError> {
        if self.module.is_some() {
            self.unload();
        }
        self.create()?;

        let (Some(env), Some(rt)) = (self.environment.as_ref(), self.runtime.as_mut()) else {
            return Err(RuntimeError::Init("runtime missing".into()));
        };
        let module = self.backend.parse(env, bytes)?;
        if let Err(e) = self.backend.load(rt, &module) {
            self.backend.free_module(module);
            return Err(e);
        }

        self.generation = self.generation.wrapping_add(1);
        let handle = ModuleHandle(self.generation);
        self.module = Some(LoadedModule {
            module,
            handle,
            compiled: false,
        });
        debug!(size = bytes.len(), "module parsed and loaded");
        Ok(handle)
    }

    pub fn compile(&mut self, handle: ModuleHandle) -> Result<(), RuntimeError> {
        let (Some(loaded), Some(rt)) = (self.module.as_mut(), self.runtime.as_mut()) else {
            return Err(RuntimeError::NotLoaded);
        };
        if loaded.handle != handle {
            return Err(RuntimeError::NotLoaded);
        }
        self.backend.compile(rt, &loaded.module)?;
        loaded.compiled = true;
        Ok(())
    }

    pub fn find_function(&mut self, name: &str) -> Result<FunctionRef<R::Function>, RuntimeError> {
        let (Some(loaded), Some(rt)) = (self.module.as_ref(), self.runtime.as_mut()) else {
            return Err(RuntimeError::NotLoaded);
        };
        if !loaded.compiled {
            return Err(RuntimeError::NotLoaded);
        }
        let func = self.backend.find_function(rt, name)?;
        Ok(FunctionRef {
            func,
            module: loaded.handle,
        })
    }

    pub fn call(
        &mut self,
        func: &FunctionRef<R::Function>,
        args: &[i32],
    ) -> Result<i32, RuntimeError> {
        let (Some(loaded), Some(rt)) = (self.module.as_ref(), self.runtime.as_mut()) else {
            return Err(RuntimeError::NotLoaded);
        };
        if loaded.handle != func.module {
            return Err(RuntimeError::NotLoaded);
        }
        self.backend.call(rt, &func.func, args)
    }

    /// Release everything: module, then runtime, then environment.
    pub fn destroy(&mut self) {
        self.unload();
        if let Some(env) = self.environment.take() {
            self.backend.free_environment(env);
        }
        info!("runtime destroyed");
    }

    fn unload(&mut self) {
        if let Some(loaded) = self.module.take() {
            self.backend.free_module(loaded.module);
        }
        if let Some(rt) = self.runtime.take() {
            self.backend.free_runtime(rt);
        }
    }
}

impl<R: ModuleRuntime> Drop for RuntimeAdapter<R> {
    fn drop(&mut self) {
        self.unload();
        if let Some(env) = self.environment.take() {
            self.backend.free_environment(env);
        }
    }
}
