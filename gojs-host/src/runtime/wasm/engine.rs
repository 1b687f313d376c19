// Loading and running Go modules end to end.

use super::{GoModule, WasmInstance};
use crate::runtime::{BridgeError, ExitRecord, HostState, controller::Controller};

/// Compile `wasm_bytes`, instantiate it around `host` and return a controller
/// ready to start.
pub fn load(wasm_bytes: &[u8], host: HostState) -> Result<Controller<WasmInstance>, BridgeError> {
    let module = GoModule::from_bytes(wasm_bytes)?;
    let instance = module.instantiate(host)?;
    Ok(Controller::new(instance))
}

/// Load and run a module until it exits.
pub fn run_bytes(wasm_bytes: &[u8], host: HostState) -> Result<ExitRecord, BridgeError> {
    load(wasm_bytes, host)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ControllerState, stdio::CaptureSink};

    /// Minimal stand-in for a Go module: a stack pointer global and the
    /// exports the controller needs. `run` writes "hi\n" to fd 1 and exits
    /// with `argc + 6`.
    const EXIT_WAT: &str = r#"
    (module
        (import "gojs" "runtime.wasmWrite" (func $write (param i32)))
        (import "gojs" "runtime.wasmExit" (func $exit (param i32)))
        (memory (export "mem") 1)
        (global $sp (mut i32) (i32.const 32768))
        (data (i32.const 256) "hi\n")
        (func (export "getsp") (result i32) (global.get $sp))
        (func (export "resume"))
        (func (export "run") (param $argc i32) (param $argv i32)
            ;; wasmWrite(fd = 1, p = 256, n = 3)
            (i64.store (i32.add (global.get $sp) (i32.const 8)) (i64.const 1))
            (i64.store (i32.add (global.get $sp) (i32.const 16)) (i64.const 256))
            (i32.store (i32.add (global.get $sp) (i32.const 24)) (i32.const 3))
            (call $write (global.get $sp))
            (i32.store (i32.add (global.get $sp) (i32.const 8))
                (i32.add (local.get $argc) (i32.const 6)))
            (call $exit (global.get $sp)))
    )
    "#;

    #[test]
    fn run_writes_and_exits() {
        let wasm = wat::parse_str(EXIT_WAT).unwrap();
        let sink = CaptureSink::default();
        let mut ctl = load(&wasm, HostState::default().with_sink(sink.clone())).unwrap();
        let exit = ctl.run().unwrap();
        assert_eq!(exit, ExitRecord::new(7));
        assert!(!exit.success());
        assert_eq!(ctl.state(), ControllerState::Exited);
        assert_eq!(sink.text(1), "hi\n");
        assert!(matches!(ctl.resume(), Err(BridgeError::Exited)));
    }

    #[test]
    fn unknown_import_is_rejected() {
        let wasm = wat::parse_str(
            r#"(module (import "gojs" "runtime.fork" (func (param i32))) (memory (export "mem") 1))"#,
        )
        .unwrap();
        match load(&wasm, HostState::default()) {
            Err(BridgeError::UnknownImport { module, name }) => {
                assert_eq!(module, "gojs");
                assert_eq!(name, "runtime.fork");
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("module with unknown import was accepted"),
        }
        let wasm = wat::parse_str(r#"(module (import "env" "abort" (func (param i32))))"#).unwrap();
        assert!(matches!(
            load(&wasm, HostState::default()),
            Err(BridgeError::UnknownImport { .. })
        ));
    }

    #[test]
    fn missing_export_is_reported() {
        let wasm = wat::parse_str(r#"(module (memory (export "mem") 1) (func (export "run") (param i32 i32)))"#).unwrap();
        assert!(matches!(
            load(&wasm, HostState::default()),
            Err(BridgeError::MissingExport("resume"))
        ));
    }

    #[test]
    fn out_of_bounds_syscall_faults() {
        // wasmExit with sp past the end of memory
        let wasm = wat::parse_str(
            r#"
            (module
                (import "go" "runtime.wasmExit" (func $exit (param i32)))
                (memory (export "mem") 1)
                (func (export "getsp") (result i32) (i32.const 0))
                (func (export "resume"))
                (func (export "run") (param i32 i32) (call $exit (i32.const 65535))))
            "#,
        )
        .unwrap();
        let mut ctl = load(&wasm, HostState::default()).unwrap();
        assert!(matches!(ctl.run(), Err(BridgeError::OutOfBounds { .. })));
        assert_eq!(ctl.state(), ControllerState::Faulted);
        assert_eq!(ctl.exit_record(), None);
    }
}
