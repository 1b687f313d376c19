use thiserror::Error;

pub mod controller;
mod host;
pub mod memory;
pub mod realm;
pub mod reflect;
pub mod scheduler;
pub mod stdio;
pub mod syscall;
pub mod value;
pub mod value_table;
#[cfg(feature = "wasmtime")]
pub mod wasm;

pub use host::{DeferredCall, GuestAccess, HostState, Instance};

/// Lifecycle of one guest instance.
///
/// `Idle → Running → {AwaitingHostCall ⇄ Running}* → Exited`. A fatal bridge
/// fault or an engine trap moves the controller to `Faulted` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Instantiated, `run` not called yet.
    Idle,
    /// Guest code is on the stack (`run`, `resume` or a syscall).
    Running,
    /// The guest yielded and waits for a timer or a callback.
    AwaitingHostCall,
    Exited,
    Faulted,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingHostCall => "awaiting host call",
            Self::Exited => "exited",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Result of `runtime.wasmExit`. Written once, after which the bridge is inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub exited: bool,
    pub code: i32,
}

impl ExitRecord {
    pub fn new(code: i32) -> Self {
        Self { exited: true, code }
    }
    /// `false` for a non-zero exit code. Failures are reported here, never
    /// raised as errors.
    pub fn success(&self) -> bool {
        self.exited && self.code == 0
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("memory access out of bounds: {len} bytes at {addr:#x}, buffer is {size} bytes")]
    OutOfBounds { addr: i64, len: i64, size: usize },
    #[error("module imports unknown function {module}.{name}")]
    UnknownImport { module: String, name: String },
    #[error("module does not export `{0}` with the expected type")]
    MissingExport(&'static str),
    #[error("invalid value handle {0}")]
    InvalidHandle(u32),
    #[error("host threw in {context}: {message}")]
    Thrown {
        context: &'static str,
        message: String,
    },
    #[error("Go program has already exited")]
    Exited,
    #[error("resume called while the guest is running")]
    Reentrant,
    #[error("guest has not been started")]
    NotStarted,
    #[error("guest was already started")]
    AlreadyStarted,
    #[error("bridge faulted earlier, the module must be instantiated again")]
    Faulted,
    #[error("guest is waiting with nothing scheduled and did not exit")]
    Stalled,
    #[error("total length of command line and environment variables exceeds {limit} bytes")]
    ArgsTooLong { limit: u32 },
    #[error("failed to compile module: {0}")]
    Compile(String),
    #[error("wasm trap: {0}")]
    Trap(String),
}
