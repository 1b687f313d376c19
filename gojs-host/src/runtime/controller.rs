//! Drives a guest through its lifecycle.
//!
//! Go's scheduler runs inside the guest. Whenever every goroutine is blocked
//! the `run` or `resume` export returns and the guest waits for the host to
//! wake it, either because a timeout fired or because a host event (a
//! callback into a Go function) is pending. Host events are handed over in
//! the bridge object's `_pendingEvent` property, which Go reads and clears
//! when resumed, storing the callback's return value in `result`.
//!
//! Guest callbacks are never entered while the guest is already running:
//! they are queued as [`DeferredCall`](super::DeferredCall)s and dispatched
//! by [`Controller::poll`] once the guest has yielded.

use super::{
    BridgeError, ControllerState, ExitRecord, HostState, Instance,
    memory::Memory,
    reflect::Reflect,
    value::{FunctionKind, HostValue},
};
use crate::Config;

/// Where the argv/env blob starts in linear memory.
pub const ARGS_OFFSET: i64 = 4096;
/// The blob, pointer table included, must end before `ARGS_OFFSET + ARGS_LIMIT`
/// where the guest's static data begins.
pub const ARGS_LIMIT: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exited(ExitRecord),
    /// The guest yielded with no timer pending and no queued callback.
    Waiting,
}

pub struct Controller<I> {
    instance: I,
    state: ControllerState,
}

fn align8(n: i64) -> i64 {
    (n + 7) & !7
}

/// Write argv strings, then the sorted `KEY=VALUE` environment, then the
/// pointer table Go's `rt0` reads. Returns `(argc, argv)`.
fn write_args(mem: &mut Memory<'_>, config: &Config) -> Result<(i32, i32), BridgeError> {
    let env: Vec<String> = config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let mut offset = ARGS_OFFSET;
    let mut place = |s: &str| {
        let ptr = offset;
        offset += align8(s.len() as i64 + 1);
        (ptr, s.to_string())
    };
    let argv: Vec<_> = config.argv.iter().map(|s| place(s)).collect();
    let envp: Vec<_> = env.iter().map(|s| place(s)).collect();
    let table = offset;
    let entries = argv.len() + envp.len() + 2;
    if table + 8 * entries as i64 >= ARGS_OFFSET + ARGS_LIMIT as i64 {
        return Err(BridgeError::ArgsTooLong { limit: ARGS_LIMIT });
    }

    for (ptr, s) in argv.iter().chain(&envp) {
        let dst = mem.bytes_mut(*ptr, s.len() as i64 + 1)?;
        dst[..s.len()].copy_from_slice(s.as_bytes());
        dst[s.len()] = 0;
    }
    let pointers = argv
        .iter()
        .map(|(p, _)| *p)
        .chain([0])
        .chain(envp.iter().map(|(p, _)| *p))
        .chain([0]);
    for (i, ptr) in pointers.enumerate() {
        let slot = table + 8 * i as i64;
        mem.write_u32(slot, ptr as u32)?;
        mem.write_u32(slot + 4, 0)?;
    }
    Ok((argv.len() as i32, table as i32))
}

impl<I: Instance> Controller<I> {
    pub fn new(instance: I) -> Self {
        Self {
            instance,
            state: ControllerState::Idle,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn instance(&self) -> &I {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut I {
        &mut self.instance
    }

    pub fn into_instance(self) -> I {
        self.instance
    }

    pub fn host(&self) -> &HostState {
        self.instance.host()
    }

    pub fn host_mut(&mut self) -> &mut HostState {
        self.instance.host_mut()
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        self.instance.host().exit
    }

    pub fn global(&self) -> HostValue {
        self.instance.host().global()
    }

    /// `target[key]`, e.g. to fetch a function the guest registered on the
    /// global object.
    pub fn get(&mut self, target: &HostValue, key: &str) -> Result<HostValue, BridgeError> {
        self.instance
            .host_mut()
            .scope()
            .get(target, key)
            .map_err(|e| BridgeError::Thrown {
                context: "get",
                message: e.to_js_string(),
            })
    }

    fn check_resumable(&self) -> Result<(), BridgeError> {
        match self.state {
            ControllerState::AwaitingHostCall => Ok(()),
            ControllerState::Idle => Err(BridgeError::NotStarted),
            ControllerState::Running => Err(BridgeError::Reentrant),
            ControllerState::Exited => Err(BridgeError::Exited),
            ControllerState::Faulted => Err(BridgeError::Faulted),
        }
    }

    /// Run guest code, then settle the state from how it returned.
    fn enter(
        &mut self,
        f: impl FnOnce(&mut I) -> Result<(), BridgeError>,
    ) -> Result<(), BridgeError> {
        self.state = ControllerState::Running;
        match f(&mut self.instance) {
            Ok(()) => {
                self.state = if self.instance.host().exit.is_some() {
                    ControllerState::Exited
                } else {
                    ControllerState::AwaitingHostCall
                };
                Ok(())
            }
            Err(e) => {
                log::error!("guest faulted: {e}");
                self.state = ControllerState::Faulted;
                Err(e)
            }
        }
    }

    /// Lay out argv/env and call the `run` export.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        match self.state {
            ControllerState::Idle => {}
            ControllerState::Exited => return Err(BridgeError::Exited),
            ControllerState::Faulted => return Err(BridgeError::Faulted),
            _ => return Err(BridgeError::AlreadyStarted),
        }
        let config = self.instance.host().config.clone();
        let args = self.instance.memory().and_then(|mut mem| write_args(&mut mem, &config));
        let (argc, argv) = match args {
            Ok(args) => args,
            Err(e) => {
                log::error!("cannot lay out guest arguments: {e}");
                self.state = ControllerState::Faulted;
                return Err(e);
            }
        };
        log::debug!("starting guest: argc={argc} argv={argv:#x}");
        self.enter(|i| i.call_run(argc, argv))
    }

    /// Call the `resume` export of a guest that is waiting.
    pub fn resume(&mut self) -> Result<(), BridgeError> {
        self.check_resumable()?;
        self.enter(|i| i.call_resume())
    }

    /// The function Go's `_makeFuncWrapper(id)` returns, for host code that
    /// wants to call into the guest directly.
    pub fn make_callback(&self, id: u32) -> HostValue {
        HostValue::guest_function(id)
    }

    /// Hand `{id, this, args}` to the guest as the pending event, resume it
    /// and return what it stored in `result`.
    fn dispatch(
        &mut self,
        id: u32,
        this: HostValue,
        args: Vec<HostValue>,
    ) -> Result<HostValue, BridgeError> {
        self.check_resumable()?;
        let host = self.instance.host_mut();
        let event = HostValue::plain([
            ("id", HostValue::Number(id as f64)),
            ("this", this),
            ("args", host.realm.array_of(args)),
        ]);
        if let Some(bridge) = host.realm.bridge.as_object() {
            bridge.set("_pendingEvent", event.clone());
        }
        log::trace!("dispatching event {id}");
        self.resume()?;
        Ok(event
            .as_object()
            .map(|o| o.get("result"))
            .unwrap_or_default())
    }

    /// Call `f` from the host. Guest functions go through the pending event
    /// protocol; host functions are called directly.
    pub fn invoke(
        &mut self,
        f: &HostValue,
        this: &HostValue,
        args: &[HostValue],
    ) -> Result<HostValue, BridgeError> {
        if let Some(FunctionKind::Guest { id }) = f.as_function().map(|f| f.kind()) {
            return self.dispatch(*id, this.clone(), args.to_vec());
        }
        if self.state == ControllerState::Faulted {
            return Err(BridgeError::Faulted);
        }
        self.instance
            .host_mut()
            .scope()
            .apply(f, this, args)
            .map_err(|e| BridgeError::Thrown {
                context: "invoke",
                message: e.to_js_string(),
            })
    }

    /// Deliver one queued callback or one due timeout. Returns whether
    /// anything was delivered.
    pub fn poll(&mut self) -> Result<bool, BridgeError> {
        match self.check_resumable() {
            Err(BridgeError::Exited) => return Ok(false),
            res => res?,
        }
        if let Some(call) = self.instance.host_mut().take_deferred() {
            let result = self.dispatch(call.id, call.this, call.args)?;
            if let Some(reply) = call.reply {
                // the requester may have stopped listening
                let _ = reply.send(result);
            }
            return Ok(true);
        }
        let host = self.instance.host_mut();
        let now = host.clock.monotonic();
        if let Some(id) = host.timeouts.pop_due(now) {
            log::trace!("timeout {id} fired");
            self.resume()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Start the guest if needed and keep delivering events, sleeping until
    /// the next deadline in between, until it exits or has nothing left to
    /// wait for.
    pub fn run_until_idle(&mut self) -> Result<RunStatus, BridgeError> {
        if self.state == ControllerState::Idle {
            self.start()?;
        }
        loop {
            if let Some(exit) = self.exit_record() {
                return Ok(RunStatus::Exited(exit));
            }
            if self.poll()? {
                continue;
            }
            let host = self.instance.host_mut();
            match host.timeouts.next_deadline() {
                Some(deadline) => host.clock.sleep_until(deadline),
                None => return Ok(RunStatus::Waiting),
            }
        }
    }

    /// Run to completion. A guest left waiting on nothing is sent the
    /// deadlock event (id 0) so that Go can report it and exit.
    pub fn run(&mut self) -> Result<ExitRecord, BridgeError> {
        if let RunStatus::Exited(exit) = self.run_until_idle()? {
            return Ok(exit);
        }
        log::debug!("guest is idle with nothing scheduled, sending deadlock event");
        self.dispatch(0, HostValue::Undefined, vec![])?;
        match self.run_until_idle()? {
            RunStatus::Exited(exit) => Ok(exit),
            RunStatus::Waiting => Err(BridgeError::Stalled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(config: &Config) -> (Vec<u8>, Result<(i32, i32), BridgeError>) {
        let mut buf = vec![0u8; 16384];
        let res = write_args(&mut Memory::new(&mut buf), config);
        (buf, res)
    }

    fn u32_at(buf: &[u8], addr: usize) -> u32 {
        u32::from_le_bytes([buf[addr], buf[addr + 1], buf[addr + 2], buf[addr + 3]])
    }

    fn cstr_at(buf: &[u8], addr: usize) -> &str {
        let end = buf[addr..].iter().position(|b| *b == 0).unwrap();
        std::str::from_utf8(&buf[addr..addr + end]).unwrap()
    }

    #[test]
    fn default_argv_is_js() {
        let (buf, res) = blob(&Config::default());
        let (argc, argv) = res.unwrap();
        assert_eq!(argc, 1);
        // "js\0" padded to 8 bytes
        assert_eq!(argv, 4104);
        assert_eq!(cstr_at(&buf, u32_at(&buf, 4104) as usize), "js");
        assert_eq!(u32_at(&buf, 4108), 0);
        assert_eq!(u32_at(&buf, 4112), 0);
        assert_eq!(u32_at(&buf, 4120), 0);
    }

    #[test]
    fn env_follows_argv_sorted() {
        let config = Config::default()
            .with_args(["-v", "input.txt"])
            .with_env("ZED", "1")
            .with_env("HOME", "/home/go");
        let (buf, res) = blob(&config);
        let (argc, argv) = res.unwrap();
        assert_eq!(argc, 3);
        let entry = |i: usize| u32_at(&buf, argv as usize + 8 * i) as usize;
        let strings: Vec<_> = [0, 1, 2].map(|i| cstr_at(&buf, entry(i))).to_vec();
        assert_eq!(strings, ["js", "-v", "input.txt"]);
        assert_eq!(entry(3), 0);
        assert_eq!(cstr_at(&buf, entry(4)), "HOME=/home/go");
        assert_eq!(cstr_at(&buf, entry(5)), "ZED=1");
        assert_eq!(entry(6), 0);
        for i in [0, 1, 2, 4, 5] {
            assert_eq!(entry(i) % 8, 0);
        }
    }

    #[test]
    fn oversized_args_are_rejected() {
        let config = Config::default().with_args([&"x".repeat(8200)]);
        let (buf, res) = blob(&config);
        assert!(matches!(res, Err(BridgeError::ArgsTooLong { limit: 8192 })));
        assert!(buf.iter().all(|b| *b == 0));
    }
}
