//! Wasmtime-backed [`ModuleRuntime`].
//!
//! Environment maps to an `Engine`, runtime to a `Store`, parse to module
//! compilation and compile to instantiation. Uploaded modules get no host
//! imports and exchange `i32` values only.

use tracing::debug;
use wasmtime::{Config, Engine, Func, Instance, Module, Store, Trap, Val, ValType};

use super::ModuleRuntime;
use crate::config::RuntimeLimits;
use crate::error::RuntimeError;

/// Store plus the instance created from the loaded module.
pub struct WasmtimeStore {
    store: Store<()>,
    instance: Option<Instance>,
    fuel: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WasmtimeRuntime;

impl WasmtimeRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleRuntime for WasmtimeRuntime {
    type Environment = Engine;
    type Runtime = WasmtimeStore;
    type Module = Module;
    type Function = Func;

    fn create_environment(&mut self, limits: &RuntimeLimits) -> Result<Engine, RuntimeError> {
        let mut config = Config::new();
        config.consume_fuel(limits.fuel.is_some());
        config.strategy(wasmtime::Strategy::Cranelift);
        Engine::new(&config).map_err(|e| RuntimeError::Init(e.to_string()))
    }

    fn create_runtime(
        &mut self,
        env: &Engine,
        limits: &RuntimeLimits,
    ) -> Result<WasmtimeStore, RuntimeError> {
        Ok(WasmtimeStore {
            store: Store::new(env, ()),
            instance: None,
            fuel: limits.fuel,
        })
    }

    fn parse(&mut self, env: &Engine, bytes: &[u8]) -> Result<Module, RuntimeError> {
        Module::new(env, bytes).map_err(|e| RuntimeError::Parse(e.to_string()))
    }

    fn load(&mut self, rt: &mut WasmtimeStore, module: &Module) -> Result<(), RuntimeError> {
        if let Some(import) = module.imports().next() {
            return Err(RuntimeError::Load(format!(
                "unresolved import {}::{}",
                import.module(),
                import.name()
            )));
        }
        rt.instance = None;
        Ok(())
    }

    fn compile(&mut self, rt: &mut WasmtimeStore, module: &Module) -> Result<(), RuntimeError> {
        if let Some(fuel) = rt.fuel {
            rt.store
                .set_fuel(fuel)
                .map_err(|e| RuntimeError::Compile(e.to_string()))?;
        }
        let instance = Instance::new(&mut rt.store, module, &[])
            .map_err(|e| RuntimeError::Compile(e.to_string()))?;
        rt.instance = Some(instance);
        Ok(())
    }

    fn find_function(&mut self, rt: &mut WasmtimeStore, name: &str) -> Result<Func, RuntimeError> {
        let Some(instance) = rt.instance else {
            return Err(RuntimeError::NotLoaded);
        };
        instance
            .get_func(&mut rt.store, name)
            .ok_or_else(|| RuntimeError::FunctionNotFound(name.to_owned()))
    }

    fn call(&mut self, rt: &mut WasmtimeStore, func: &Func, args: &[i32]) -> Result<i32, RuntimeError> {
        let ty = func.ty(&rt.store);
        let params: Vec<ValType> = ty.params().collect();
        if params.len() != args.len() || !params.iter().all(|p| matches!(p, ValType::I32)) {
            return Err(RuntimeError::InvalidParams(format!(
                "export takes {} parameters, {} i32 arguments supplied",
                params.len(),
                args.len()
            )));
        }
        let results: Vec<ValType> = ty.results().collect();
        if results.len() > 1 || !results.iter().all(|r| matches!(r, ValType::I32)) {
            return Err(RuntimeError::InvalidParams(
                "export must return nothing or a single i32".into(),
            ));
        }

        if let Some(fuel) = rt.fuel {
            rt.store
                .set_fuel(fuel)
                .map_err(|e| RuntimeError::Execution(e.to_string()))?;
        }

        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut out = vec![Val::I32(0); results.len()];
        func.call(&mut rt.store, &params, &mut out).map_err(|e| {
            match e.downcast_ref::<Trap>() {
                Some(trap) => RuntimeError::Execution(format!("trap: {trap}")),
                None => RuntimeError::Execution(e.to_string()),
            }
        })?;

        Ok(out.first().and_then(Val::i32).unwrap_or(0))
    }

    fn free_module(&mut self, module: Module) {
        debug!("wasmtime module released");
        drop(module);
    }

    fn free_runtime(&mut self, rt: WasmtimeStore) {
        drop(rt);
    }

    fn free_environment(&mut self, env: Engine) {
        drop(env);
    }
}
