//! Host side of Go's `js/wasm` ABI.
//!
//! A module compiled with `GOOS=js GOARCH=wasm` expects its host to provide a
//! fixed set of imports (see [`runtime::syscall`]), to intern host values
//! behind small integer handles (see [`runtime::value_table`]) and to drive
//! it through the `run`/`resume` exports (see [`runtime::controller`]).
//!
//! [`Controller`] is the high level entry point. With the default `wasmtime`
//! feature, [`runtime::wasm::engine::load`] compiles and instantiates a module
//! and returns a ready controller.

pub mod runtime;

pub use log;
use std::collections::BTreeMap;

pub use runtime::{
    BridgeError, ControllerState, ExitRecord, GuestAccess, HostState, Instance,
    controller::{Controller, RunStatus},
    value::HostValue,
};

/// Configuration of the guest's command line and environment.
///
/// The environment is kept sorted because the argv blob lists variables in key
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            argv: vec!["js".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
