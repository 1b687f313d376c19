use gojs_host::{
    BridgeError, ControllerState, HostValue,
    runtime::value_table::{RefCount, TypeFlag},
};
use gojs_test::*;

fn run_guest(f: impl FnMut(&mut GuestCx<'_>) -> Result<(), BridgeError>) -> i32 {
    let (mut ctl, _, _) = stub_controller(OnRun(f));
    ctl.run().unwrap().code
}

#[test]
fn repeated_lookups_share_one_counted_handle() {
    let code = run_guest(|cx| {
        let a = cx.global("console")?;
        let b = cx.global("console")?;
        assert_eq!(a, b);
        assert_eq!(a.flag(), TypeFlag::Object as u32);
        let h = a.handle().unwrap();
        assert_eq!(cx.host().table().refcount(h), Some(RefCount::Counted(2)));
        cx.finalize_ref(a)?;
        assert_eq!(cx.host().table().refcount(h), Some(RefCount::Counted(1)));
        cx.finalize_ref(b)?;
        assert_eq!(cx.host().table().refcount(h), None);
        // the freed handle is handed out again
        let s = cx.string_val("fresh")?;
        assert_eq!(s.handle(), Some(h));
        assert_eq!(s.flag(), TypeFlag::String as u32);
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn pinned_handles_survive_finalization() {
    let code = run_guest(|cx| {
        let global = cx.global("globalThis")?;
        assert_eq!(global, GLOBAL);
        cx.finalize_ref(global)?;
        cx.finalize_ref(GLOBAL)?;
        assert_eq!(cx.host().table().refcount(5), Some(RefCount::Pinned));
        let console = cx.value_get(GLOBAL, "console")?;
        assert_ne!(console, Ref::UNDEFINED);
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn numbers_and_constants_pass_through() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let o = cx.global("nums")?;
        assert_eq!(cx.value_get(o, "half")?, Ref(0.5f64.to_bits()));
        assert_eq!(cx.value_get(o, "big")?, Ref(1e300f64.to_bits()));
        assert_eq!(cx.value_get(o, "zero")?, ZERO);
        assert_eq!(cx.value_get(o, "negzero")?, Ref((-0.0f64).to_bits()));
        assert_eq!(cx.value_get(o, "tiny")?, Ref(1));
        let half_min = cx.value_get(o, "half_min")?;
        assert_eq!(half_min, Ref((f64::MIN_POSITIVE / 2.0).to_bits()));
        assert_eq!(half_min.handle(), None);
        assert_eq!(cx.value_get(o, "nan")?, num(f64::NAN));
        assert_eq!(cx.value_get(o, "yes")?, TRUE);
        assert_eq!(cx.value_get(o, "nothing")?, NULL);
        assert_eq!(cx.value_get(o, "undef")?, Ref::UNDEFINED);
        assert_eq!(cx.value_get(o, "missing")?, Ref::UNDEFINED);
        let before = cx.host().table().live();
        cx.value_set(o, "out", num(-1.25))?;
        cx.value_set(o, "flag", TRUE)?;
        cx.value_set(o, "sub", Ref(1))?;
        assert_eq!(cx.host().table().live(), before);
        Ok(())
    }));
    let nums = HostValue::plain([
        ("half", 0.5.into()),
        ("big", 1e300.into()),
        ("zero", 0.0.into()),
        ("negzero", (-0.0).into()),
        ("tiny", f64::from_bits(1).into()),
        ("half_min", (f64::MIN_POSITIVE / 2.0).into()),
        ("nan", f64::NAN.into()),
        ("yes", true.into()),
        ("nothing", HostValue::Null),
        ("undef", HostValue::Undefined),
    ]);
    ctl.host().define_global("nums", nums.clone());
    ctl.start().unwrap();
    assert_eq!(ctl.get(&nums, "out").unwrap(), HostValue::Number(-1.25));
    assert_eq!(ctl.get(&nums, "flag").unwrap(), HostValue::Bool(true));
    let sub = ctl.get(&nums, "sub").unwrap().to_number();
    assert_eq!(sub.to_bits(), 1);
}

#[test]
fn property_reads_do_not_leak_the_target() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let user = cx.global("user")?;
        let h = user.handle().unwrap();
        assert_eq!(cx.host().table().refcount(h), Some(RefCount::Counted(1)));
        let name = cx.value_get(user, "name")?;
        let age = cx.value_get(user, "age")?;
        assert_eq!(cx.load_string(name)?, "gopher");
        assert_eq!(number(age), Some(13.0));
        assert_eq!(cx.host().table().refcount(h), Some(RefCount::Counted(1)));
        cx.finalize_ref(name)?;
        cx.finalize_ref(user)?;
        assert_eq!(cx.host().table().live(), 0);
        cx.wasm_exit(0)
    }));
    ctl.host().define_global(
        "user",
        HostValue::plain([("name", "gopher".into()), ("age", 13.0.into())]),
    );
    assert_eq!(ctl.run().unwrap().code, 0);
}

#[test]
fn strings_round_trip() {
    let code = run_guest(|cx| {
        for s in ["", "gopher", "héllo, 世界 ✓"] {
            let r = cx.string_val(s)?;
            assert_eq!(cx.load_string(r)?, s);
            cx.finalize_ref(r)?;
        }
        let r = cx.string_val("gopher")?;
        assert_eq!(cx.value_length(r)?, 6);
        let r = cx.string_val("世界")?;
        assert_eq!(cx.value_length(r)?, 2);
        assert_eq!(cx.load_string(num(1.5))?, "1.5");
        assert_eq!(cx.load_string(num(1e21))?, "1e+21");
        assert_eq!(cx.load_string(num(2.5e-7))?, "2.5e-7");
        assert_eq!(cx.load_string(TRUE)?, "true");
        assert_eq!(cx.load_string(Ref::UNDEFINED)?, "undefined");
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn equal_strings_are_interned() {
    let code = run_guest(|cx| {
        let a = cx.string_val("same")?;
        let b = cx.string_val("same")?;
        let c = cx.string_val("other")?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cx.host().table().refcount(a.handle().unwrap()), Some(RefCount::Counted(2)));
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn short_string_buffer_faults() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let r = cx.string_val("abcdef")?;
        let (bytes, len) = cx.value_prepare_string(r)?;
        assert_eq!(len, 6);
        cx.value_load_string(bytes, 5)?;
        cx.wasm_exit(0)
    }));
    assert!(matches!(
        ctl.run(),
        Err(BridgeError::Thrown {
            context: "valueLoadString",
            ..
        })
    ));
    assert_eq!(ctl.state(), ControllerState::Faulted);
}

#[test]
fn host_exceptions_are_reported_to_the_guest() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let (err, ok) = cx.value_call(GLOBAL, "boom", &[])?;
        assert!(!ok);
        let message = cx.value_get(err, "message")?;
        assert_eq!(cx.load_string(message)?, "kaboom");
        assert_eq!(cx.load_string(err)?, "Error: kaboom");
        let error_class = cx.global("Error")?;
        assert!(cx.value_instance_of(err, error_class)?);

        let (err, ok) = cx.value_call(GLOBAL, "missing", &[])?;
        assert!(!ok);
        assert!(cx.load_string(err)?.starts_with("TypeError"));

        let (_, ok) = cx.value_invoke(num(3.0), &[])?;
        assert!(!ok);
        let (_, ok) = cx.value_new(TRUE, &[])?;
        assert!(!ok);
        cx.wasm_exit(0)
    }));
    ctl.host().define_global(
        "boom",
        HostValue::native("boom", |scope, _, _| Err(scope.error("kaboom"))),
    );
    assert_eq!(ctl.run().unwrap().code, 0);
}

#[test]
fn methods_receive_this_and_args() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let calc = cx.global("calc")?;
        let (sum, ok) = cx.value_call(calc, "add", &[num(2.0), num(40.0)])?;
        assert!(ok);
        assert_eq!(number(sum), Some(42.0));
        let (me, ok) = cx.value_call(calc, "me", &[])?;
        assert!(ok);
        assert_eq!(me, calc);
        let add = cx.value_get(calc, "add")?;
        let (sum, ok) = cx.value_invoke(add, &[num(0.5), num(0.25)])?;
        assert!(ok);
        assert_eq!(number(sum), Some(0.75));
        cx.wasm_exit(0)
    }));
    let calc = HostValue::plain([
        (
            "add",
            HostValue::native("add", |_, _, args| {
                Ok(HostValue::Number(args.iter().map(HostValue::to_number).sum()))
            }),
        ),
        ("me", HostValue::native("me", |_, this, _| Ok(this.clone()))),
    ]);
    ctl.host().define_global("calc", calc);
    assert_eq!(ctl.run().unwrap().code, 0);
}

#[test]
fn arrays_and_objects_are_reflected() {
    let code = run_guest(|cx| {
        let array_class = cx.global("Array")?;
        let (arr, ok) = cx.value_new(array_class, &[])?;
        assert!(ok);
        cx.value_set_index(arr, 0, num(1.0))?;
        let x = cx.string_val("x")?;
        cx.value_set_index(arr, 2, x)?;
        assert_eq!(cx.value_length(arr)?, 3);
        assert_eq!(cx.value_index(arr, 1)?, Ref::UNDEFINED);
        let x = cx.value_index(arr, 2)?;
        assert_eq!(cx.load_string(x)?, "x");

        let object_class = cx.global("Object")?;
        let (obj, ok) = cx.value_new(object_class, &[])?;
        assert!(ok);
        cx.value_set(obj, "k", TRUE)?;
        assert_eq!(cx.value_get(obj, "k")?, TRUE);
        cx.value_delete(obj, "k")?;
        assert_eq!(cx.value_get(obj, "k")?, Ref::UNDEFINED);
        assert!(cx.value_instance_of(arr, object_class)?);
        assert!(!cx.value_instance_of(num(1.0), object_class)?);
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn byte_copies_are_bounded_by_the_shorter_side() {
    let code = run_guest(|cx| {
        let class = cx.global("Uint8Array")?;
        let (buf, ok) = cx.value_new(class, &[num(4.0)])?;
        assert!(ok);
        assert!(cx.value_instance_of(buf, class)?);
        assert_eq!(cx.copy_bytes_to_js(buf, &[1, 2, 3, 4, 5, 6])?, (4, true));
        assert_eq!(cx.copy_bytes_to_go(2, buf)?, (vec![1, 2], 2, true));
        assert_eq!(cx.copy_bytes_to_go(6, buf)?, (vec![1, 2, 3, 4, 0, 0], 4, true));
        let (_, _, ok) = cx.copy_bytes_to_go(4, GLOBAL)?;
        assert!(!ok);
        let (_, ok) = cx.copy_bytes_to_js(GLOBAL, b"no")?;
        assert!(!ok);
        let s = cx.string_val("bytes?")?;
        let (_, ok) = cx.copy_bytes_to_js(s, b"no")?;
        assert!(!ok);
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn huge_array_sizes_do_not_allocate() {
    let code = run_guest(|cx| {
        let array_class = cx.global("Array")?;
        let (arr, ok) = cx.value_new(array_class, &[])?;
        assert!(ok);
        cx.value_set_index(arr, 1 << 40, TRUE)?;
        assert_eq!(cx.value_index(arr, 1 << 40)?, TRUE);
        assert_eq!(cx.value_length(arr)?, 0);
        let (err, ok) = cx.value_new(array_class, &[num(4294967295.0)])?;
        assert!(!ok);
        assert_eq!(cx.load_string(err)?, "Error: Invalid array length");
        let bytes_class = cx.global("Uint8Array")?;
        let (_, ok) = cx.value_new(bytes_class, &[num(1e12)])?;
        assert!(!ok);
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn error_classes_form_a_hierarchy() {
    let code = run_guest(|cx| {
        let type_error = cx.global("TypeError")?;
        let error = cx.global("Error")?;
        let msg = cx.string_val("bad")?;
        let (e, ok) = cx.value_new(type_error, &[msg])?;
        assert!(ok);
        assert!(cx.value_instance_of(e, type_error)?);
        assert!(cx.value_instance_of(e, error)?);
        let (plain, _) = cx.value_new(error, &[msg])?;
        assert!(!cx.value_instance_of(plain, type_error)?);
        assert_eq!(cx.load_string(e)?, "TypeError: bad");
        cx.wasm_exit(0)
    });
    assert_eq!(code, 0);
}

#[test]
fn stale_handle_faults_the_guest() {
    let (mut ctl, _, _) = stub_controller(OnRun(|cx: &mut GuestCx<'_>| {
        let s = cx.string_val("gone")?;
        cx.finalize_ref(s)?;
        cx.value_get(s, "length")?;
        cx.wasm_exit(0)
    }));
    assert!(matches!(ctl.run(), Err(BridgeError::InvalidHandle(7))));
    assert_eq!(ctl.state(), ControllerState::Faulted);
}
