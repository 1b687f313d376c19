//! wasmtime backend: compiles a Go module, links the syscall table and
//! exposes the instance to the [`Controller`](super::controller::Controller).

use wasmtime::{Caller, Engine, Extern, ExternType, Linker, Module, Store, TypedFunc, ValType};

use super::{
    BridgeError, GuestAccess, HostState, Instance,
    memory::Memory,
    syscall::{self, IMPORT_MODULES, SYSCALLS},
};

pub mod engine;

/// Recover the bridge error that caused a trap, if any.
fn from_trap(e: wasmtime::Error) -> BridgeError {
    match e.downcast::<BridgeError>() {
        Ok(b) => b,
        Err(e) => BridgeError::Trap(format!("{e:#}")),
    }
}

/// A compiled guest module, checked against the import table.
pub struct GoModule {
    engine: Engine,
    module: Module,
}

impl GoModule {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BridgeError> {
        let engine = Engine::default();
        let module =
            Module::new(&engine, bytes).map_err(|e| BridgeError::Compile(format!("{e:#}")))?;
        let res = Self { engine, module };
        res.validate_imports()?;
        Ok(res)
    }

    /// Every import must be one of ours, with the `(i32) -> ()` signature.
    pub fn validate_imports(&self) -> Result<(), BridgeError> {
        for import in self.module.imports() {
            let unknown = || BridgeError::UnknownImport {
                module: import.module().to_string(),
                name: import.name().to_string(),
            };
            if !IMPORT_MODULES.contains(&import.module()) || syscall::lookup(import.name()).is_none() {
                return Err(unknown());
            }
            let ExternType::Func(ty) = import.ty() else {
                return Err(unknown());
            };
            let params: Vec<_> = ty.params().collect();
            if !matches!(params.as_slice(), [ValType::I32]) || ty.results().len() != 0 {
                return Err(unknown());
            }
        }
        Ok(())
    }

    fn linker(&self) -> Result<Linker<HostState>, BridgeError> {
        let mut linker = Linker::new(&self.engine);
        for module in IMPORT_MODULES {
            for &(name, f) in SYSCALLS {
                linker
                    .func_wrap(
                        module,
                        name,
                        move |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
                            let mut access = CallerAccess {
                                caller: &mut caller,
                            };
                            syscall::invoke(&mut access, name, f, sp as u32)
                                .map_err(wasmtime::Error::new)
                        },
                    )
                    .map_err(|e| BridgeError::Compile(format!("{e:#}")))?;
            }
        }
        Ok(linker)
    }

    pub fn instantiate(&self, host: HostState) -> Result<WasmInstance, BridgeError> {
        let linker = self.linker()?;
        let mut store = Store::new(&self.engine, host);
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(from_trap)?;
        let memory = instance
            .get_memory(&mut store, "mem")
            .ok_or(BridgeError::MissingExport("mem"))?;
        let run = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "run")
            .map_err(|_| BridgeError::MissingExport("run"))?;
        let resume = instance
            .get_typed_func::<(), ()>(&mut store, "resume")
            .map_err(|_| BridgeError::MissingExport("resume"))?;
        instance
            .get_typed_func::<(), i32>(&mut store, "getsp")
            .map_err(|_| BridgeError::MissingExport("getsp"))?;
        log::debug!(
            "instantiated guest, {} bytes of linear memory",
            memory.data_size(&store)
        );
        Ok(WasmInstance {
            store,
            memory,
            run,
            resume,
        })
    }
}

/// Syscall view of a guest through wasmtime's `Caller`.
struct CallerAccess<'a, 'b> {
    caller: &'a mut Caller<'b, HostState>,
}

impl GuestAccess for CallerAccess<'_, '_> {
    fn resync(&mut self) -> Result<(Memory<'_>, &mut HostState), BridgeError> {
        let mem = self
            .caller
            .get_export("mem")
            .and_then(Extern::into_memory)
            .ok_or(BridgeError::MissingExport("mem"))?;
        let (data, host) = mem.data_and_store_mut(&mut *self.caller);
        Ok((Memory::new(data), host))
    }

    fn getsp(&mut self) -> Result<u32, BridgeError> {
        let getsp = self
            .caller
            .get_export("getsp")
            .and_then(Extern::into_func)
            .ok_or(BridgeError::MissingExport("getsp"))?
            .typed::<(), i32>(&*self.caller)
            .map_err(|_| BridgeError::MissingExport("getsp"))?;
        getsp
            .call(&mut *self.caller, ())
            .map(|sp| sp as u32)
            .map_err(from_trap)
    }
}

pub struct WasmInstance {
    store: Store<HostState>,
    memory: wasmtime::Memory,
    run: TypedFunc<(i32, i32), ()>,
    resume: TypedFunc<(), ()>,
}

impl Instance for WasmInstance {
    fn host(&self) -> &HostState {
        self.store.data()
    }
    fn host_mut(&mut self) -> &mut HostState {
        self.store.data_mut()
    }
    fn memory(&mut self) -> Result<Memory<'_>, BridgeError> {
        Ok(Memory::new(self.memory.data_mut(&mut self.store)))
    }
    fn call_run(&mut self, argc: i32, argv: i32) -> Result<(), BridgeError> {
        self.run.call(&mut self.store, (argc, argv)).map_err(from_trap)
    }
    fn call_resume(&mut self) -> Result<(), BridgeError> {
        self.resume.call(&mut self.store, ()).map_err(from_trap)
    }
}
