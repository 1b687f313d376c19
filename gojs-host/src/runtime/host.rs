use std::sync::mpsc;

use super::{
    BridgeError, ExitRecord,
    memory::Memory,
    realm::Realm,
    reflect::Scope,
    scheduler::{Clock, SystemClock, Timeouts},
    stdio::{OutputSink, Stdio},
    value::HostValue,
    value_table::ValueTable,
};
use crate::Config;

/// Guest callback reached while the guest was running. Dispatched once the
/// guest yields.
#[derive(Debug)]
pub struct DeferredCall {
    pub id: u32,
    pub this: HostValue,
    pub args: Vec<HostValue>,
    /// Receives the callback's result once it has run.
    pub reply: Option<mpsc::Sender<HostValue>>,
}

/// Everything the syscalls operate on. One per instantiated module, owned by
/// the engine's store.
pub struct HostState {
    pub(crate) config: Config,
    pub(crate) table: ValueTable,
    pub(crate) realm: Realm,
    pub(crate) stdio: Stdio,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) timeouts: Timeouts,
    pub(crate) exit: Option<ExitRecord>,
    /// Bumped by `runtime.resetMemoryDataView`.
    pub(crate) memory_generation: u64,
    calls_tx: mpsc::Sender<DeferredCall>,
    calls_rx: mpsc::Receiver<DeferredCall>,
}

impl Default for HostState {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl HostState {
    pub fn new(config: Config) -> Self {
        let realm = Realm::new();
        let table = ValueTable::new(realm.global.clone(), realm.bridge.clone());
        let (calls_tx, calls_rx) = mpsc::channel();
        Self {
            config,
            table,
            realm,
            stdio: Stdio::default(),
            clock: Box::new(SystemClock::default()),
            timeouts: Timeouts::default(),
            exit: None,
            memory_generation: 0,
            calls_tx,
            calls_rx,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_sink(mut self, sink: impl OutputSink + 'static) -> Self {
        self.stdio = Stdio::new(sink);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn table(&self) -> &ValueTable {
        &self.table
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub fn global(&self) -> HostValue {
        self.realm.global.clone()
    }

    pub fn define_global(&self, name: &str, value: HostValue) {
        self.realm.define_global(name, value);
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        self.exit
    }

    pub fn memory_generation(&self) -> u64 {
        self.memory_generation
    }

    pub(crate) fn scope(&mut self) -> Scope<'_> {
        self.split().1
    }

    /// The value table alongside a scope over the rest of the state.
    pub(crate) fn split(&mut self) -> (&mut ValueTable, Scope<'_>) {
        (
            &mut self.table,
            Scope {
                realm: &self.realm,
                stdio: &mut self.stdio,
                clock: &*self.clock,
                calls: &self.calls_tx,
            },
        )
    }

    pub fn take_deferred(&mut self) -> Option<DeferredCall> {
        self.calls_rx.try_recv().ok()
    }

    /// Record `runtime.wasmExit` and drop everything the guest held.
    pub(crate) fn record_exit(&mut self, code: i32) {
        if let Some(prev) = self.exit {
            log::warn!("guest exited twice (code {} then {code})", prev.code);
            return;
        }
        log::debug!("guest exited with code {code}");
        self.exit = Some(ExitRecord::new(code));
        self.stdio.flush();
        self.table.clear();
        self.timeouts.clear();
        let dropped = std::iter::from_fn(|| self.calls_rx.try_recv().ok()).count();
        if dropped > 0 {
            log::debug!("{dropped} pending guest callbacks dropped at exit");
        }
    }
}

/// Access to the running guest from inside a syscall.
pub trait GuestAccess {
    /// View of the current linear memory together with the host state.
    /// Called again after anything that may have grown the memory.
    fn resync(&mut self) -> Result<(Memory<'_>, &mut HostState), BridgeError>;
    /// Current Go stack pointer, from the `getsp` export.
    fn getsp(&mut self) -> Result<u32, BridgeError>;
}

/// An instantiated guest module, as seen by the
/// [`Controller`](super::controller::Controller).
pub trait Instance {
    fn host(&self) -> &HostState;
    fn host_mut(&mut self) -> &mut HostState;
    fn memory(&mut self) -> Result<Memory<'_>, BridgeError>;
    /// Call the `run(argc, argv)` export.
    fn call_run(&mut self, argc: i32, argv: i32) -> Result<(), BridgeError>;
    /// Call the `resume()` export.
    fn call_resume(&mut self) -> Result<(), BridgeError>;
}
