//! Test support for `gojs-host`.
//!
//! [`StubGuest`] is an [`Instance`] whose `run` and `resume` exports are plain
//! Rust ([`GuestProgram`]). Programs talk to the host exactly like compiled Go
//! code does: through [`GuestCx`], which lays out stack frames in a real
//! linear memory buffer and goes through the same syscall table the wasmtime
//! backend links.

use std::{path::PathBuf, time::Duration};

use gojs_host::{
    BridgeError, Config, Controller, GuestAccess, HostState, Instance,
    runtime::{
        memory::Memory,
        scheduler::ManualClock,
        stdio::CaptureSink,
        syscall,
        value_table::{TypeFlag, handle},
        wasm::{WasmInstance, engine},
    },
};

pub use gojs_host::runtime::value_table::Ref;

pub const PAGE: usize = 65536;
/// Fixed Go stack pointer used by every stub frame.
pub const SP: u32 = 0x4000;
/// Start of the bump allocator backing strings and slices passed by the stub.
pub const HEAP_BASE: u32 = 0x5000;

pub const GLOBAL: Ref = Ref::boxed(TypeFlag::Object, handle::GLOBAL);
pub const BRIDGE: Ref = Ref::boxed(TypeFlag::Object, handle::BRIDGE);
pub const NULL: Ref = Ref::boxed(TypeFlag::None, handle::NULL);
pub const ZERO: Ref = Ref::boxed(TypeFlag::None, handle::ZERO);
pub const TRUE: Ref = Ref::boxed(TypeFlag::None, handle::TRUE);

/// Wall clock origin of [`ManualClock`]s handed out by the helpers below.
pub const WALL_BASE: Duration = Duration::from_secs(1_700_000_000);

/// Guest side of a stub module.
pub trait GuestProgram {
    fn run(&mut self, cx: &mut GuestCx<'_>, argc: i32, argv: i32) -> Result<(), BridgeError>;
    fn resume(&mut self, cx: &mut GuestCx<'_>) -> Result<(), BridgeError> {
        let _ = cx;
        Ok(())
    }
}

/// A program that only has a `run` body.
pub struct OnRun<F>(pub F);

impl<F> GuestProgram for OnRun<F>
where
    F: FnMut(&mut GuestCx<'_>) -> Result<(), BridgeError>,
{
    fn run(&mut self, cx: &mut GuestCx<'_>, _argc: i32, _argv: i32) -> Result<(), BridgeError> {
        (self.0)(cx)
    }
}

/// Number carried by a value slot, following Go's `Value.Float`.
pub fn number(r: Ref) -> Option<f64> {
    if r == ZERO {
        return Some(0.0);
    }
    if r == Ref::boxed(TypeFlag::None, handle::NAN) {
        return Some(f64::NAN);
    }
    let n = f64::from_bits(r.0);
    (r != Ref::UNDEFINED && !n.is_nan()).then_some(n)
}

/// Encode a number the way Go's `js.ValueOf` does.
pub fn num(n: f64) -> Ref {
    if n == 0.0 && n.is_sign_positive() {
        ZERO
    } else if n.is_nan() {
        Ref::boxed(TypeFlag::None, handle::NAN)
    } else {
        Ref(n.to_bits())
    }
}

fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

/// Guest execution context for one `run` or `resume` call.
pub struct GuestCx<'a> {
    host: &'a mut HostState,
    mem: &'a mut Vec<u8>,
    heap: &'a mut u32,
    sp: u32,
}

impl GuestAccess for GuestCx<'_> {
    fn resync(&mut self) -> Result<(Memory<'_>, &mut HostState), BridgeError> {
        Ok((Memory::new(self.mem.as_mut_slice()), &mut *self.host))
    }
    fn getsp(&mut self) -> Result<u32, BridgeError> {
        Ok(self.sp)
    }
}

impl GuestCx<'_> {
    pub fn host(&mut self) -> &mut HostState {
        self.host
    }

    pub fn memory_len(&self) -> usize {
        self.mem.len()
    }

    /// `memory.grow`: the buffer handed to later syscalls is a new one.
    pub fn grow(&mut self, pages: usize) {
        self.mem.resize(self.mem.len() + pages * PAGE, 0);
    }

    pub fn frame(&mut self) -> Memory<'_> {
        Memory::new(self.mem.as_mut_slice())
    }

    pub fn sp(&self) -> i64 {
        self.sp as i64
    }

    /// Call the import `name` with the current frame.
    pub fn call(&mut self, name: &str) -> Result<(), BridgeError> {
        let f = syscall::lookup(name).ok_or_else(|| BridgeError::UnknownImport {
            module: "gojs".to_string(),
            name: name.to_string(),
        })?;
        let sp = self.sp;
        syscall::invoke(self, name, f, sp)
    }

    /// Copy `bytes` to fresh guest memory, growing it when needed.
    pub fn alloc(&mut self, bytes: &[u8]) -> i64 {
        let ptr = *self.heap;
        let end = ptr as usize + bytes.len();
        while end > self.mem.len() {
            self.grow(1);
        }
        self.mem[ptr as usize..end].copy_from_slice(bytes);
        *self.heap = align8(end as u32);
        ptr as i64
    }

    /// Write a `(ptr, len, cap)` header at `sp + offset`.
    fn put_slice(&mut self, offset: i64, bytes: &[u8]) -> Result<i64, BridgeError> {
        let ptr = self.alloc(bytes);
        let at = self.sp() + offset;
        let mut mem = self.frame();
        mem.write_i64(at, ptr)?;
        mem.write_i64(at + 8, bytes.len() as i64)?;
        mem.write_i64(at + 16, bytes.len() as i64)?;
        Ok(ptr)
    }

    fn put_refs(&mut self, offset: i64, refs: &[Ref]) -> Result<(), BridgeError> {
        let bytes: Vec<u8> = refs.iter().flat_map(|r| r.0.to_le_bytes()).collect();
        self.put_slice(offset, &bytes)?;
        // slice length counts elements, not bytes
        let at = self.sp() + offset;
        let mut mem = self.frame();
        mem.write_i64(at + 8, refs.len() as i64)?;
        mem.write_i64(at + 16, refs.len() as i64)
    }

    fn put_ref(&mut self, offset: i64, r: Ref) -> Result<(), BridgeError> {
        let at = self.sp() + offset;
        self.frame().write_ref(at, r)
    }

    fn get_ref(&mut self, offset: i64) -> Result<Ref, BridgeError> {
        let at = self.sp() + offset;
        self.frame().read_ref(at)
    }

    fn get_ok(&mut self, offset: i64) -> Result<bool, BridgeError> {
        let at = self.sp() + offset;
        Ok(self.frame().read_u8(at)? == 1)
    }

    pub fn wasm_exit(&mut self, code: i32) -> Result<(), BridgeError> {
        let at = self.sp() + 8;
        self.frame().write_i32(at, code)?;
        self.call("runtime.wasmExit")
    }

    pub fn wasm_write(&mut self, fd: i64, bytes: &[u8]) -> Result<(), BridgeError> {
        let ptr = self.alloc(bytes);
        let sp = self.sp();
        let mut mem = self.frame();
        mem.write_i64(sp + 8, fd)?;
        mem.write_i64(sp + 16, ptr)?;
        mem.write_i32(sp + 24, bytes.len() as i32)?;
        self.call("runtime.wasmWrite")
    }

    pub fn reset_memory_data_view(&mut self) -> Result<(), BridgeError> {
        self.call("runtime.resetMemoryDataView")
    }

    pub fn nanotime(&mut self) -> Result<i64, BridgeError> {
        self.call("runtime.nanotime1")?;
        let at = self.sp() + 8;
        self.frame().read_i64(at)
    }

    pub fn walltime(&mut self) -> Result<(i64, i32), BridgeError> {
        self.call("runtime.walltime")?;
        let sp = self.sp();
        let mem = self.frame();
        Ok((mem.read_i64(sp + 8)?, mem.read_i32(sp + 16)?))
    }

    pub fn schedule_timeout(&mut self, delay_ms: i64) -> Result<i32, BridgeError> {
        let sp = self.sp();
        self.frame().write_i64(sp + 8, delay_ms)?;
        self.call("runtime.scheduleTimeoutEvent")?;
        self.frame().read_i32(sp + 16)
    }

    pub fn clear_timeout(&mut self, id: i32) -> Result<(), BridgeError> {
        let sp = self.sp();
        self.frame().write_i32(sp + 8, id)?;
        self.call("runtime.clearTimeoutEvent")
    }

    pub fn get_random_data(&mut self, n: usize) -> Result<Vec<u8>, BridgeError> {
        let ptr = self.put_slice(8, &vec![0; n])?;
        self.call("runtime.getRandomData")?;
        Ok(self.frame().bytes(ptr, n as i64)?.to_vec())
    }

    /// Go's finalizer for a `js.Value`; values without a type flag are not
    /// reference counted.
    pub fn finalize_ref(&mut self, r: Ref) -> Result<(), BridgeError> {
        let Some(h) = r.handle().filter(|_| r.flag() != 0) else {
            return Ok(());
        };
        let sp = self.sp();
        self.frame().write_u32(sp + 8, h)?;
        self.call("syscall/js.finalizeRef")
    }

    pub fn string_val(&mut self, s: &str) -> Result<Ref, BridgeError> {
        self.put_slice(8, s.as_bytes())?;
        self.call("syscall/js.stringVal")?;
        self.get_ref(24)
    }

    pub fn value_get(&mut self, v: Ref, key: &str) -> Result<Ref, BridgeError> {
        self.put_ref(8, v)?;
        self.put_slice(16, key.as_bytes())?;
        self.call("syscall/js.valueGet")?;
        self.get_ref(32)
    }

    pub fn value_set(&mut self, v: Ref, key: &str, x: Ref) -> Result<(), BridgeError> {
        self.put_ref(8, v)?;
        self.put_slice(16, key.as_bytes())?;
        self.put_ref(32, x)?;
        self.call("syscall/js.valueSet")
    }

    pub fn value_delete(&mut self, v: Ref, key: &str) -> Result<(), BridgeError> {
        self.put_ref(8, v)?;
        self.put_slice(16, key.as_bytes())?;
        self.call("syscall/js.valueDelete")
    }

    pub fn value_index(&mut self, v: Ref, i: i64) -> Result<Ref, BridgeError> {
        self.put_ref(8, v)?;
        let sp = self.sp();
        self.frame().write_i64(sp + 16, i)?;
        self.call("syscall/js.valueIndex")?;
        self.get_ref(24)
    }

    pub fn value_set_index(&mut self, v: Ref, i: i64, x: Ref) -> Result<(), BridgeError> {
        self.put_ref(8, v)?;
        let sp = self.sp();
        self.frame().write_i64(sp + 16, i)?;
        self.put_ref(24, x)?;
        self.call("syscall/js.valueSetIndex")
    }

    /// `v[name](args...)`, returning the result (or the thrown value) and
    /// the `ok` flag.
    pub fn value_call(&mut self, v: Ref, name: &str, args: &[Ref]) -> Result<(Ref, bool), BridgeError> {
        self.put_ref(8, v)?;
        self.put_slice(16, name.as_bytes())?;
        self.put_refs(32, args)?;
        self.call("syscall/js.valueCall")?;
        Ok((self.get_ref(56)?, self.get_ok(64)?))
    }

    pub fn value_invoke(&mut self, v: Ref, args: &[Ref]) -> Result<(Ref, bool), BridgeError> {
        self.put_ref(8, v)?;
        self.put_refs(16, args)?;
        self.call("syscall/js.valueInvoke")?;
        Ok((self.get_ref(40)?, self.get_ok(48)?))
    }

    pub fn value_new(&mut self, v: Ref, args: &[Ref]) -> Result<(Ref, bool), BridgeError> {
        self.put_ref(8, v)?;
        self.put_refs(16, args)?;
        self.call("syscall/js.valueNew")?;
        Ok((self.get_ref(40)?, self.get_ok(48)?))
    }

    pub fn value_length(&mut self, v: Ref) -> Result<i64, BridgeError> {
        self.put_ref(8, v)?;
        self.call("syscall/js.valueLength")?;
        let at = self.sp() + 16;
        self.frame().read_i64(at)
    }

    pub fn value_prepare_string(&mut self, v: Ref) -> Result<(Ref, i64), BridgeError> {
        self.put_ref(8, v)?;
        self.call("syscall/js.valuePrepareString")?;
        let at = self.sp() + 24;
        Ok((self.get_ref(16)?, self.frame().read_i64(at)?))
    }

    /// Load prepared string bytes into a fresh buffer of `dst_len` bytes.
    pub fn value_load_string(&mut self, bytes: Ref, dst_len: usize) -> Result<Vec<u8>, BridgeError> {
        self.put_ref(8, bytes)?;
        let ptr = self.put_slice(16, &vec![0; dst_len])?;
        self.call("syscall/js.valueLoadString")?;
        Ok(self.frame().bytes(ptr, dst_len as i64)?.to_vec())
    }

    /// `js.Value.String()` on the Go side.
    pub fn load_string(&mut self, v: Ref) -> Result<String, BridgeError> {
        let (bytes, len) = self.value_prepare_string(v)?;
        let buf = self.value_load_string(bytes, len as usize)?;
        self.finalize_ref(bytes)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn value_instance_of(&mut self, v: Ref, t: Ref) -> Result<bool, BridgeError> {
        self.put_ref(8, v)?;
        self.put_ref(16, t)?;
        self.call("syscall/js.valueInstanceOf")?;
        self.get_ok(24)
    }

    /// Copy from a host byte array into a fresh `dst_len` byte guest buffer.
    /// Returns the buffer, the reported count and `ok`.
    pub fn copy_bytes_to_go(&mut self, dst_len: usize, src: Ref) -> Result<(Vec<u8>, i64, bool), BridgeError> {
        let ptr = self.put_slice(8, &vec![0; dst_len])?;
        self.put_ref(32, src)?;
        self.call("syscall/js.copyBytesToGo")?;
        let at = self.sp() + 40;
        let n = self.frame().read_i64(at)?;
        let ok = self.get_ok(48)?;
        Ok((self.frame().bytes(ptr, dst_len as i64)?.to_vec(), n, ok))
    }

    pub fn copy_bytes_to_js(&mut self, dst: Ref, src: &[u8]) -> Result<(i64, bool), BridgeError> {
        self.put_ref(8, dst)?;
        self.put_slice(16, src)?;
        self.call("syscall/js.copyBytesToJS")?;
        let at = self.sp() + 40;
        let n = self.frame().read_i64(at)?;
        Ok((n, self.get_ok(48)?))
    }

    pub fn debug(&mut self, value: i32) -> Result<(), BridgeError> {
        let f = syscall::lookup("debug").ok_or(BridgeError::MissingExport("debug"))?;
        syscall::invoke(self, "debug", f, value as u32)
    }

    /// `js.Global().Get(name)`.
    pub fn global(&mut self, name: &str) -> Result<Ref, BridgeError> {
        self.value_get(GLOBAL, name)
    }

    /// Go's `handleEvent`: take the pending event off the bridge object, run
    /// `f(id, this, args)` and store its result. Returns the event id, or
    /// `None` when nothing was pending. The deadlock event (id 0) is returned
    /// without calling `f`.
    pub fn handle_event(
        &mut self,
        f: impl FnOnce(&mut Self, u32, Ref, Vec<Ref>) -> Result<Ref, BridgeError>,
    ) -> Result<Option<u32>, BridgeError> {
        let event = self.value_get(BRIDGE, "_pendingEvent")?;
        if event == NULL {
            return Ok(None);
        }
        self.value_set(BRIDGE, "_pendingEvent", NULL)?;
        let id_ref = self.value_get(event, "id")?;
        let id = number(id_ref).unwrap_or(f64::NAN) as u32;
        if id == 0 {
            self.finalize_ref(event)?;
            return Ok(Some(0));
        }
        let this = self.value_get(event, "this")?;
        let args_obj = self.value_get(event, "args")?;
        let n = self.value_length(args_obj)?;
        let args = (0..n)
            .map(|i| self.value_index(args_obj, i))
            .collect::<Result<Vec<_>, _>>()?;
        let result = f(self, id, this, args)?;
        self.value_set(event, "result", result)?;
        self.finalize_ref(args_obj)?;
        self.finalize_ref(event)?;
        Ok(Some(id))
    }

    /// What the Go runtime does when told it is deadlocked.
    pub fn report_deadlock(&mut self) -> Result<(), BridgeError> {
        self.wasm_write(2, b"fatal error: all goroutines are asleep - deadlock!\n")?;
        self.wasm_exit(2)
    }
}

/// An [`Instance`] driven by a [`GuestProgram`] instead of compiled code.
pub struct StubGuest<P> {
    host: HostState,
    mem: Vec<u8>,
    heap: u32,
    pub program: P,
}

impl<P: GuestProgram> StubGuest<P> {
    pub fn new(host: HostState, program: P) -> Self {
        Self {
            host,
            mem: vec![0; PAGE],
            heap: HEAP_BASE,
            program,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    fn enter(
        &mut self,
        f: impl FnOnce(&mut P, &mut GuestCx<'_>) -> Result<(), BridgeError>,
    ) -> Result<(), BridgeError> {
        let mut cx = GuestCx {
            host: &mut self.host,
            mem: &mut self.mem,
            heap: &mut self.heap,
            sp: SP,
        };
        f(&mut self.program, &mut cx)
    }
}

impl<P: GuestProgram> Instance for StubGuest<P> {
    fn host(&self) -> &HostState {
        &self.host
    }
    fn host_mut(&mut self) -> &mut HostState {
        &mut self.host
    }
    fn memory(&mut self) -> Result<Memory<'_>, BridgeError> {
        Ok(Memory::new(&mut self.mem))
    }
    fn call_run(&mut self, argc: i32, argv: i32) -> Result<(), BridgeError> {
        self.enter(|p, cx| p.run(cx, argc, argv))
    }
    fn call_resume(&mut self) -> Result<(), BridgeError> {
        self.enter(|p, cx| p.resume(cx))
    }
}

/// Host state with captured output and a manual clock.
pub fn capture_host(config: Config) -> (HostState, CaptureSink, ManualClock) {
    let sink = CaptureSink::default();
    let clock = ManualClock::with_wall_base(WALL_BASE);
    let host = HostState::new(config)
        .with_sink(sink.clone())
        .with_clock(clock.clone());
    (host, sink, clock)
}

/// Controller over a stub guest with default configuration.
pub fn stub_controller<P: GuestProgram>(
    program: P,
) -> (Controller<StubGuest<P>>, CaptureSink, ManualClock) {
    stub_controller_with(Config::default(), program)
}

pub fn stub_controller_with<P: GuestProgram>(
    config: Config,
    program: P,
) -> (Controller<StubGuest<P>>, CaptureSink, ManualClock) {
    let (host, sink, clock) = capture_host(config);
    (Controller::new(StubGuest::new(host, program)), sink, clock)
}

/// Compile `tests/wat/<name>` to a module binary.
pub fn load_wat(name: &str) -> Vec<u8> {
    let path: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests", "wat", name]
        .iter()
        .collect();
    wat::parse_file(&path).unwrap_or_else(|e| panic!("failed to load {}: {e}", path.display()))
}

/// Controller over the wasmtime instance of `tests/wat/<name>`.
pub fn wasm_controller(
    name: &str,
    config: Config,
) -> (Controller<WasmInstance>, CaptureSink, ManualClock) {
    let (host, sink, clock) = capture_host(config);
    let ctl = engine::load(&load_wat(name), host)
        .unwrap_or_else(|e| panic!("failed to instantiate {name}: {e}"));
    (ctl, sink, clock)
}
