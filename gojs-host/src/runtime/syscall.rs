//! Imports a `GOOS=js GOARCH=wasm` module links against.
//!
//! Every import except `debug` receives the Go stack pointer `sp`; arguments
//! and results live in the stack frame at fixed offsets from it. `sp` may
//! move whenever the host calls back into the guest, so syscalls whose host
//! work can run guest code re-read it through `getsp` before writing results.
//!
//! Host exceptions are confined to `valueCall`, `valueInvoke` and `valueNew`,
//! which report them to Go as `(value, ok = false)`. A throw anywhere else
//! aborts the guest with [`BridgeError::Thrown`].

use super::{
    BridgeError, GuestAccess,
    reflect::Reflect,
    value::{HostValue, ObjectKind},
};

pub type SyscallFn = fn(&mut dyn GuestAccess, u32) -> Result<(), BridgeError>;

/// Import module names: `gojs` since Go 1.21, `go` before.
pub const IMPORT_MODULES: [&str; 2] = ["gojs", "go"];

pub const SYSCALLS: &[(&str, SyscallFn)] = &[
    ("runtime.wasmExit", wasm_exit),
    ("runtime.wasmWrite", wasm_write),
    ("runtime.resetMemoryDataView", reset_memory_data_view),
    ("runtime.nanotime1", nanotime1),
    ("runtime.walltime", walltime),
    ("runtime.scheduleTimeoutEvent", schedule_timeout_event),
    ("runtime.clearTimeoutEvent", clear_timeout_event),
    ("runtime.getRandomData", get_random_data),
    ("syscall/js.finalizeRef", finalize_ref),
    ("syscall/js.stringVal", string_val),
    ("syscall/js.valueGet", value_get),
    ("syscall/js.valueSet", value_set),
    ("syscall/js.valueDelete", value_delete),
    ("syscall/js.valueIndex", value_index),
    ("syscall/js.valueSetIndex", value_set_index),
    ("syscall/js.valueCall", value_call),
    ("syscall/js.valueInvoke", value_invoke),
    ("syscall/js.valueNew", value_new),
    ("syscall/js.valueLength", value_length),
    ("syscall/js.valuePrepareString", value_prepare_string),
    ("syscall/js.valueLoadString", value_load_string),
    ("syscall/js.valueInstanceOf", value_instance_of),
    ("syscall/js.copyBytesToGo", copy_bytes_to_go),
    ("syscall/js.copyBytesToJS", copy_bytes_to_js),
    ("debug", debug),
];

pub fn lookup(name: &str) -> Option<SyscallFn> {
    SYSCALLS
        .iter()
        .find_map(|(n, f)| (*n == name).then_some(*f))
}

/// Run one import on behalf of the guest.
pub fn invoke(g: &mut dyn GuestAccess, name: &str, f: SyscallFn, sp: u32) -> Result<(), BridgeError> {
    let (_, host) = g.resync()?;
    if host.exit.is_some() {
        return Err(BridgeError::Exited);
    }
    log::trace!("{name} sp={sp:#x}");
    f(g, sp)
}

fn uncaught(context: &'static str) -> impl FnOnce(HostValue) -> BridgeError {
    move |thrown| BridgeError::Thrown {
        context,
        message: thrown.to_js_string(),
    }
}

fn wasm_exit(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let (mem, host) = g.resync()?;
    let code = mem.read_i32(sp as i64 + 8)?;
    host.record_exit(code);
    Ok(())
}

fn wasm_write(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let fd = mem.read_i64(sp + 8)?;
    let ptr = mem.read_i64(sp + 16)?;
    let len = mem.read_i32(sp + 24)?;
    host.stdio.write(fd, mem.bytes(ptr, len as i64)?);
    Ok(())
}

fn reset_memory_data_view(g: &mut dyn GuestAccess, _sp: u32) -> Result<(), BridgeError> {
    let (mem, host) = g.resync()?;
    host.memory_generation += 1;
    log::debug!("memory view reset, {} bytes", mem.len());
    Ok(())
}

fn nanotime1(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let (mut mem, host) = g.resync()?;
    let ns = host.clock.monotonic().as_nanos() as i64;
    mem.write_i64(sp as i64 + 8, ns)
}

fn walltime(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let now = host.clock.wall();
    mem.write_i64(sp + 8, now.as_secs() as i64)?;
    mem.write_i32(sp + 16, now.subsec_nanos() as i32)
}

fn schedule_timeout_event(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let delay = mem.read_i64(sp + 8)?;
    let id = host.timeouts.schedule(host.clock.monotonic(), delay);
    mem.write_i32(sp + 16, id)
}

fn clear_timeout_event(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let (mem, host) = g.resync()?;
    let id = mem.read_i32(sp as i64 + 8)?;
    if !host.timeouts.cancel(id) {
        log::trace!("timeout {id} already fired or cleared");
    }
    Ok(())
}

fn get_random_data(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let (mut mem, _) = g.resync()?;
    let buf = mem.byte_slice_mut(sp as i64 + 8)?;
    getrandom::getrandom(buf).map_err(|e| BridgeError::Thrown {
        context: "getRandomData",
        message: e.to_string(),
    })
}

fn finalize_ref(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let (mem, host) = g.resync()?;
    let h = mem.read_u32(sp as i64 + 8)?;
    host.table.release(h);
    Ok(())
}

fn string_val(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let s = mem.read_string(sp + 8)?;
    let r = host.table.store(&HostValue::string(&s));
    mem.write_ref(sp + 24, r)
}

/// Store `value` at `offset` from the stack pointer as it is after the host
/// work that produced the value.
fn store_result(g: &mut dyn GuestAccess, offset: i64, value: &HostValue) -> Result<i64, BridgeError> {
    let sp = g.getsp()? as i64;
    let (mut mem, host) = g.resync()?;
    let r = host.table.store(value);
    mem.write_ref(sp + offset, r)?;
    Ok(sp)
}

fn value_get(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let target = host.table.load(mem.read_ref(sp + 8)?)?;
    let key = mem.read_string(sp + 16)?;
    let result = host.scope().get(&target, &key).map_err(uncaught("valueGet"))?;
    store_result(g, 32, &result).map(|_| ())
}

fn value_set(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let target = host.table.load(mem.read_ref(sp + 8)?)?;
    let key = mem.read_string(sp + 16)?;
    let value = host.table.load(mem.read_ref(sp + 32)?)?;
    host.scope()
        .set(&target, &key, value)
        .map_err(uncaught("valueSet"))
}

fn value_delete(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let target = host.table.load(mem.read_ref(sp + 8)?)?;
    let key = mem.read_string(sp + 16)?;
    host.scope()
        .delete_property(&target, &key)
        .map_err(uncaught("valueDelete"))
}

fn value_index(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let target = host.table.load(mem.read_ref(sp + 8)?)?;
    let index = mem.read_i64(sp + 16)?;
    let (table, mut scope) = host.split();
    let result = scope
        .get_index(&target, index)
        .map_err(uncaught("valueIndex"))?;
    mem.write_ref(sp + 24, table.store(&result))
}

fn value_set_index(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let target = host.table.load(mem.read_ref(sp + 8)?)?;
    let index = mem.read_i64(sp + 16)?;
    let value = host.table.load(mem.read_ref(sp + 24)?)?;
    host.scope()
        .set_index(&target, index, value)
        .map_err(uncaught("valueSetIndex"))
}

fn load_args(g: &mut dyn GuestAccess, addr: i64) -> Result<Vec<HostValue>, BridgeError> {
    let (mem, host) = g.resync()?;
    mem.read_value_slice(addr)?
        .into_iter()
        .map(|r| host.table.load(r))
        .collect()
}

/// Write the outcome of a call that may throw: the result or the thrown value
/// at `offset`, and the `ok` flag right after it.
fn store_outcome(
    g: &mut dyn GuestAccess,
    offset: i64,
    outcome: Result<HostValue, HostValue>,
) -> Result<(), BridgeError> {
    let (value, ok) = match outcome {
        Ok(v) => (v, 1),
        Err(thrown) => {
            log::debug!("host call threw: {}", thrown.to_js_string());
            (thrown, 0)
        }
    };
    let sp = store_result(g, offset, &value)?;
    let (mut mem, _) = g.resync()?;
    mem.write_u8(sp + offset + 8, ok)
}

fn value_call(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let target = host.table.load(mem.read_ref(sp + 8)?)?;
    let method = mem.read_string(sp + 16)?;
    let args = load_args(g, sp + 32)?;
    let (_, host) = g.resync()?;
    let outcome = host.scope().call_method(&target, &method, &args);
    store_outcome(g, 56, outcome)
}

fn value_invoke(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let f = host.table.load(mem.read_ref(sp + 8)?)?;
    let args = load_args(g, sp + 16)?;
    let (_, host) = g.resync()?;
    let outcome = host.scope().apply(&f, &HostValue::Undefined, &args);
    store_outcome(g, 40, outcome)
}

fn value_new(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mem, host) = g.resync()?;
    let f = host.table.load(mem.read_ref(sp + 8)?)?;
    let args = load_args(g, sp + 16)?;
    let (_, host) = g.resync()?;
    let outcome = host.scope().construct(&f, &args);
    store_outcome(g, 40, outcome)
}

fn value_length(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let v = host.table.load(mem.read_ref(sp + 8)?)?;
    let len = host.scope().length(&v).map_err(uncaught("valueLength"))?;
    let len = len.as_number().filter(|n| n.is_finite()).unwrap_or(0.0);
    mem.write_i64(sp + 16, len as i64)
}

fn value_prepare_string(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let v = host.table.load(mem.read_ref(sp + 8)?)?;
    let encoded = v.to_js_string().into_bytes();
    let len = encoded.len();
    let bytes = host.realm.new_bytes(encoded);
    mem.write_ref(sp + 16, host.table.store(&bytes))?;
    mem.write_i64(sp + 24, len as i64)
}

fn value_load_string(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let v = host.table.load(mem.read_ref(sp + 8)?)?;
    let Some(src) = v.to_bytes() else {
        return Err(BridgeError::Thrown {
            context: "valueLoadString",
            message: format!("expected prepared string bytes, got {}", v.type_name()),
        });
    };
    let dst = mem.byte_slice_mut(sp + 16)?;
    if src.len() > dst.len() {
        return Err(BridgeError::Thrown {
            context: "valueLoadString",
            message: format!("{} bytes do not fit in a {} byte buffer", src.len(), dst.len()),
        });
    }
    dst[..src.len()].copy_from_slice(&src);
    Ok(())
}

fn value_instance_of(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let v = host.table.load(mem.read_ref(sp + 8)?)?;
    let class = host.table.load(mem.read_ref(sp + 16)?)?;
    let is = host
        .scope()
        .instance_of(&v, &class)
        .map_err(uncaught("valueInstanceOf"))?;
    mem.write_u8(sp + 24, is as u8)
}

fn copy_bytes_to_go(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let src = host.table.load(mem.read_ref(sp + 32)?)?;
    let Some(src) = src.as_object() else {
        return mem.write_u8(sp + 48, 0);
    };
    let n = {
        let obj = src.borrow();
        let ObjectKind::Bytes(bytes) = obj.kind() else {
            return mem.write_u8(sp + 48, 0);
        };
        let dst = mem.byte_slice_mut(sp + 8)?;
        let n = dst.len().min(bytes.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        n
    };
    mem.write_i64(sp + 40, n as i64)?;
    mem.write_u8(sp + 48, 1)
}

fn copy_bytes_to_js(g: &mut dyn GuestAccess, sp: u32) -> Result<(), BridgeError> {
    let sp = sp as i64;
    let (mut mem, host) = g.resync()?;
    let dst = host.table.load(mem.read_ref(sp + 8)?)?;
    let Some(dst) = dst.as_object() else {
        return mem.write_u8(sp + 48, 0);
    };
    let n = {
        let mut obj = dst.borrow_mut();
        let ObjectKind::Bytes(bytes) = obj.kind_mut() else {
            return mem.write_u8(sp + 48, 0);
        };
        let src = mem.read_byte_slice(sp + 16)?;
        let n = src.len().min(bytes.len());
        bytes[..n].copy_from_slice(&src[..n]);
        n
    };
    mem.write_i64(sp + 40, n as i64)?;
    mem.write_u8(sp + 48, 1)
}

/// `debug(value)`: receives a plain value instead of a stack pointer.
fn debug(_g: &mut dyn GuestAccess, value: u32) -> Result<(), BridgeError> {
    log::debug!("guest debug: {}", value as i32);
    Ok(())
}
