use std::{cell::RefCell, rc::Rc, sync::mpsc, time::Duration};

use gojs_host::{BridgeError, ControllerState, HostValue, RunStatus, runtime::scheduler::Clock};
use gojs_test::*;

/// `time.Sleep`-like program: arms timers in `run`, counts resumes and exits
/// on the resume `exit_after`.
struct Sleeper {
    delays: Vec<i64>,
    cancel_first: bool,
    resumes: u32,
    exit_after: u32,
    seen_at: Vec<i64>,
}

impl Sleeper {
    fn new(delays: Vec<i64>, exit_after: u32) -> Self {
        Self {
            delays,
            cancel_first: false,
            resumes: 0,
            exit_after,
            seen_at: vec![],
        }
    }
}

impl GuestProgram for Sleeper {
    fn run(&mut self, cx: &mut GuestCx<'_>, _argc: i32, _argv: i32) -> Result<(), BridgeError> {
        let ids = self
            .delays
            .iter()
            .map(|d| cx.schedule_timeout(*d))
            .collect::<Result<Vec<_>, _>>()?;
        if self.cancel_first {
            cx.clear_timeout(ids[0])?;
        }
        Ok(())
    }

    fn resume(&mut self, cx: &mut GuestCx<'_>) -> Result<(), BridgeError> {
        assert_eq!(cx.handle_event(|_, _, _, _| Ok(Ref::UNDEFINED))?, None);
        self.resumes += 1;
        self.seen_at.push(cx.nanotime()? / 1_000_000);
        if self.resumes == self.exit_after {
            cx.wasm_exit(0)?;
        }
        Ok(())
    }
}

#[test]
fn timer_resumes_the_guest_once() {
    let (mut ctl, _, clock) = stub_controller(Sleeper::new(vec![100], 1));
    ctl.start().unwrap();
    assert_eq!(ctl.host().timeouts().len(), 1);
    // not due yet
    assert!(!ctl.poll().unwrap());
    let exit = ctl.run().unwrap();
    assert!(exit.success());
    assert_eq!(clock.monotonic(), Duration::from_millis(100));
    let guest = ctl.into_instance();
    assert_eq!(guest.program.resumes, 1);
    assert_eq!(guest.program.seen_at, vec![100]);
}

#[test]
fn timers_fire_in_deadline_order() {
    let (mut ctl, _, _) = stub_controller(Sleeper::new(vec![30, 10, 20], 3));
    ctl.run().unwrap();
    let guest = ctl.into_instance();
    assert_eq!(guest.program.seen_at, vec![10, 20, 30]);
}

#[test]
fn cleared_timer_never_fires() {
    let mut sleeper = Sleeper::new(vec![50, 100], 1);
    sleeper.cancel_first = true;
    let (mut ctl, _, clock) = stub_controller(sleeper);
    ctl.start().unwrap();
    assert_eq!(ctl.host().timeouts().len(), 1);
    assert!(!ctl.host().timeouts().is_pending(1));
    ctl.run().unwrap();
    assert_eq!(clock.monotonic(), Duration::from_millis(100));
    assert_eq!(ctl.into_instance().program.seen_at, vec![100]);
}

#[test]
fn fired_timer_is_gone_before_the_guest_resumes() {
    let (mut ctl, _, clock) = stub_controller(Sleeper::new(vec![5], 2));
    ctl.start().unwrap();
    clock.advance(Duration::from_millis(5));
    assert!(ctl.poll().unwrap());
    assert!(ctl.host().timeouts().is_empty());
    assert!(!ctl.poll().unwrap());
    assert_eq!(ctl.run_until_idle().unwrap(), RunStatus::Waiting);
}

#[test]
fn negative_delay_fires_immediately() {
    let (mut ctl, _, clock) = stub_controller(Sleeper::new(vec![-20], 1));
    ctl.start().unwrap();
    assert!(ctl.poll().unwrap());
    assert_eq!(clock.monotonic(), Duration::ZERO);
    assert_eq!(ctl.state(), ControllerState::Exited);
}

#[test]
fn clocks_follow_the_host_clock() {
    let (mut ctl, _, clock) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        assert_eq!(cx.nanotime()?, 1_500_000);
        let (sec, nsec) = cx.walltime()?;
        assert_eq!(sec, WALL_BASE.as_secs() as i64);
        assert_eq!(nsec, 1_500_000);
        let date = cx.global("Date")?;
        let (now, ok) = cx.value_call(date, "now", &[])?;
        assert!(ok);
        assert_eq!(number(now), Some((WALL_BASE.as_millis() + 1) as f64));
        let perf = cx.global("performance")?;
        let (now, ok) = cx.value_call(perf, "now", &[])?;
        assert!(ok);
        let ms = number(now).unwrap();
        assert!((ms - 1.5).abs() < 1e-9, "{ms}");
        cx.wasm_exit(0)
    }));
    clock.advance(Duration::from_micros(1500));
    assert!(ctl.run().unwrap().success());
}

#[test]
fn random_data_fills_the_buffer() {
    let code = {
        let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
            let a = cx.get_random_data(32)?;
            let b = cx.get_random_data(32)?;
            assert_eq!(a.len(), 32);
            assert_ne!(a, b);
            cx.wasm_exit(0)
        }));
        ctl.run().unwrap().code
    };
    assert_eq!(code, 0);
}

/// Registers Go function 1 as `double` on the global object and serves
/// calls to it.
struct Doubler {
    calls: Vec<u32>,
}

impl GuestProgram for Doubler {
    fn run(&mut self, cx: &mut GuestCx<'_>, _argc: i32, _argv: i32) -> Result<(), BridgeError> {
        let (f, ok) = cx.value_call(BRIDGE, "_makeFuncWrapper", &[num(1.0)])?;
        assert!(ok);
        cx.value_set(GLOBAL, "double", f)?;
        Ok(())
    }

    fn resume(&mut self, cx: &mut GuestCx<'_>) -> Result<(), BridgeError> {
        let handled = cx.handle_event(|_, id, _, args| {
            assert_eq!(id, 1);
            Ok(num(2.0 * number(args[0]).unwrap_or(f64::NAN)))
        })?;
        if let Some(id) = handled {
            self.calls.push(id);
        }
        Ok(())
    }
}

#[test]
fn host_calls_into_the_guest() {
    let (mut ctl, _, _) = stub_controller(Doubler { calls: vec![] });
    assert_eq!(ctl.run_until_idle().unwrap(), RunStatus::Waiting);
    let double = ctl.get(&ctl.global(), "double").unwrap();
    let result = ctl.invoke(&double, &HostValue::Undefined, &[21.0.into()]).unwrap();
    assert_eq!(result, HostValue::Number(42.0));
    let result = ctl.invoke(&double, &HostValue::Undefined, &[0.25.into()]).unwrap();
    assert_eq!(result, HostValue::Number(0.5));
    assert_eq!(ctl.state(), ControllerState::AwaitingHostCall);
    assert_eq!(ctl.into_instance().program.calls, vec![1, 1]);
}

#[test]
fn callback_made_by_the_host_reaches_the_guest() {
    let (mut ctl, _, _) = stub_controller(Doubler { calls: vec![] });
    ctl.start().unwrap();
    let f = ctl.make_callback(1);
    let result = ctl.invoke(&f, &HostValue::Null, &[4.0.into()]).unwrap();
    assert_eq!(result, HostValue::Number(8.0));
}

#[test]
fn host_functions_are_invoked_directly() {
    let (mut ctl, sink, _) = stub_controller(OnRun(|_: &mut GuestCx<'_>| Ok(())));
    ctl.start().unwrap();
    let global = ctl.global();
    let console = ctl.get(&global, "console").unwrap();
    let log = ctl.get(&console, "log").unwrap();
    let res = ctl.invoke(&log, &console, &["from host".into()]).unwrap();
    assert_eq!(res, HostValue::Undefined);
    assert_eq!(sink.lines(), vec![(1, "from host".to_string())]);
    let err = ctl.invoke(&HostValue::Null, &HostValue::Undefined, &[]).unwrap_err();
    assert!(matches!(err, BridgeError::Thrown { context: "invoke", .. }));
}

/// Go program passing a callback to a host function that calls it right
/// away, like `fs.write` completing synchronously.
struct Listener {
    received: Rc<RefCell<Vec<String>>>,
}

impl GuestProgram for Listener {
    fn run(&mut self, cx: &mut GuestCx<'_>, _argc: i32, _argv: i32) -> Result<(), BridgeError> {
        let (cb, _) = cx.value_call(BRIDGE, "_makeFuncWrapper", &[num(7.0)])?;
        let arg = cx.string_val("ping")?;
        let (res, ok) = cx.value_call(GLOBAL, "notify", &[cb, arg])?;
        assert!(ok);
        assert_eq!(res, Ref::UNDEFINED);
        // nothing was delivered while the guest was running
        assert!(self.received.borrow().is_empty());
        Ok(())
    }

    fn resume(&mut self, cx: &mut GuestCx<'_>) -> Result<(), BridgeError> {
        let received = self.received.clone();
        cx.handle_event(|cx, id, _, args| {
            assert_eq!(id, 7);
            let s = cx.load_string(args[0])?;
            received.borrow_mut().push(s.clone());
            cx.string_val(&format!("{s} received"))
        })?;
        cx.wasm_exit(0)
    }
}

#[test]
fn callbacks_from_host_code_wait_until_the_guest_yields() {
    let received = Rc::new(RefCell::new(vec![]));
    let (mut ctl, _, _) = stub_controller(Listener {
        received: received.clone(),
    });
    let replies: Rc<RefCell<Option<mpsc::Receiver<HostValue>>>> = Rc::default();
    let slot = replies.clone();
    ctl.host().define_global(
        "notify",
        HostValue::native("notify", move |scope, _, args| {
            let [cb, arg] = args else {
                return Err(scope.type_error("notify expects two arguments"));
            };
            let Some(f) = cb.as_function() else {
                return Err(scope.type_error("callback is not a function"));
            };
            let id = match f.kind() {
                gojs_host::runtime::value::FunctionKind::Guest { id } => *id,
                _ => return Err(scope.type_error("callback is not a Go function")),
            };
            *slot.borrow_mut() = Some(scope.defer_call(id, HostValue::Undefined, vec![arg.clone()]));
            Ok(HostValue::Undefined)
        }),
    );
    ctl.start().unwrap();
    assert!(received.borrow().is_empty());
    assert!(ctl.poll().unwrap());
    assert_eq!(*received.borrow(), vec!["ping".to_string()]);
    assert_eq!(ctl.state(), ControllerState::Exited);
    let rx = replies.borrow_mut().take().unwrap();
    assert_eq!(rx.try_recv().unwrap(), HostValue::string("ping received"));
}

/// `fmt.Fprintln(os.Stdout, ...)` on the async `fs.write` path.
struct AsyncWriter {
    outcome: Option<(Ref, Option<f64>)>,
}

impl GuestProgram for AsyncWriter {
    fn run(&mut self, cx: &mut GuestCx<'_>, _argc: i32, _argv: i32) -> Result<(), BridgeError> {
        let fs = cx.global("fs")?;
        let class = cx.global("Uint8Array")?;
        let (buf, _) = cx.value_new(class, &[num(6.0)])?;
        cx.copy_bytes_to_js(buf, b"async\n")?;
        let (cb, _) = cx.value_call(BRIDGE, "_makeFuncWrapper", &[num(3.0)])?;
        let args = [num(1.0), buf, ZERO, num(6.0), NULL, cb];
        let (_, ok) = cx.value_call(fs, "write", &args)?;
        assert!(ok);
        Ok(())
    }

    fn resume(&mut self, cx: &mut GuestCx<'_>) -> Result<(), BridgeError> {
        let mut outcome = None;
        cx.handle_event(|_, id, _, args| {
            assert_eq!(id, 3);
            outcome = Some((args[0], number(args[1])));
            Ok(Ref::UNDEFINED)
        })?;
        self.outcome = outcome;
        cx.wasm_exit(0)
    }
}

#[test]
fn fs_write_completes_through_a_callback() {
    let (mut ctl, sink, _) = stub_controller(AsyncWriter { outcome: None });
    assert!(ctl.run().unwrap().success());
    assert_eq!(sink.text(1), "async\n");
    assert_eq!(ctl.into_instance().program.outcome, Some((NULL, Some(6.0))));
}

#[test]
fn unsupported_fs_calls_report_enosys() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let fs = cx.global("fs")?;
        let (cb, _) = cx.value_call(BRIDGE, "_makeFuncWrapper", &[num(9.0)])?;
        let path = cx.string_val("/etc/passwd")?;
        let (_, ok) = cx.value_call(fs, "open", &[path, ZERO, ZERO, cb])?;
        assert!(ok);
        Ok(())
    }));
    ctl.start().unwrap();
    // the queued callback carries the error
    let call = ctl.host_mut().take_deferred().unwrap();
    assert_eq!(call.id, 9);
    let code = call.args[0].as_object().map(|o| o.get("code"));
    assert_eq!(code, Some(HostValue::string("ENOSYS")));
}

#[test]
fn pending_callbacks_are_dropped_at_exit() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let fs = cx.global("fs")?;
        let (cb, _) = cx.value_call(BRIDGE, "_makeFuncWrapper", &[num(2.0)])?;
        cx.value_call(fs, "stat", &[ZERO, cb])?;
        cx.wasm_exit(1)
    }));
    assert_eq!(ctl.run().unwrap().code, 1);
    assert!(ctl.host_mut().take_deferred().is_none());
    assert!(!ctl.poll().unwrap());
}
