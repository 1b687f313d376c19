//! Globals a Go program touches outside of `syscall/js` itself: `console`,
//! `crypto`, `performance`, `process` and the `fs` module used by the
//! `syscall` package for file descriptor I/O.
//!
//! Only writes to already open descriptors are supported; everything else in
//! `fs` and `process` fails with `ENOSYS`.

use itertools::Itertools;

use super::Classes;
use crate::runtime::{
    reflect::{Reflect, Scope},
    value::{HostValue, ObjectKind, ObjectRef},
};

/// Browsers refuse to fill more than this many bytes per call.
const RANDOM_QUOTA: usize = 65536;

const FS_UNSUPPORTED: &[&str] = &[
    "chmod", "chown", "close", "fchmod", "fchown", "fstat", "fsync", "ftruncate", "lchown", "link",
    "lstat", "mkdir", "open", "read", "readdir", "readlink", "rename", "rmdir", "stat", "symlink",
    "truncate", "unlink", "utimes",
];

pub(super) fn install(global: &ObjectRef, classes: &Classes) {
    global.set("globalThis", HostValue::Object(global.clone()));
    for class in [
        &classes.object,
        &classes.array,
        &classes.uint8_array,
        &classes.error,
        &classes.type_error,
        &classes.date,
    ] {
        global.set(class.name(), HostValue::Function(class.clone()));
    }
    global.set("console", console());
    global.set("crypto", crypto());
    global.set("performance", performance());
    global.set("process", process());
    global.set("fs", fs());
}

fn console() -> HostValue {
    let writer = |name: &'static str, fd: i64| {
        (
            name,
            HostValue::native(name, move |scope, _, args| {
                let line = args.iter().map(HostValue::to_js_string).join(" ");
                scope.stdio.write_line(fd, &line);
                Ok(HostValue::Undefined)
            }),
        )
    };
    HostValue::plain([
        writer("log", 1),
        writer("info", 1),
        writer("debug", 1),
        writer("warn", 2),
        writer("error", 2),
    ])
}

fn crypto() -> HostValue {
    HostValue::plain([(
        "getRandomValues",
        HostValue::native("getRandomValues", |scope, _, args| {
            let target = args.first().cloned().unwrap_or_default();
            let Some(o) = target.as_object() else {
                return Err(scope.type_error("getRandomValues expects a Uint8Array"));
            };
            {
                let mut obj = o.borrow_mut();
                let ObjectKind::Bytes(bytes) = obj.kind_mut() else {
                    return Err(scope.type_error("getRandomValues expects a Uint8Array"));
                };
                if bytes.len() > RANDOM_QUOTA {
                    return Err(scope.error(&format!(
                        "byte length of {} exceeds the quota of {RANDOM_QUOTA}",
                        bytes.len()
                    )));
                }
                getrandom::getrandom(bytes).map_err(|e| scope.error(&e.to_string()))?;
            }
            Ok(target)
        }),
    )])
}

fn performance() -> HostValue {
    HostValue::plain([(
        "now",
        HostValue::native("now", |scope, _, _| {
            Ok(HostValue::Number(
                scope.clock.monotonic().as_secs_f64() * 1000.0,
            ))
        }),
    )])
}

fn process() -> HostValue {
    let id = |name: &'static str| (name, HostValue::native(name, |_, _, _| Ok((-1.0).into())));
    let enosys = |name: &'static str| (name, HostValue::native(name, |scope, _, _| Err(scope.enosys())));
    HostValue::plain([
        ("pid", (-1.0).into()),
        ("ppid", (-1.0).into()),
        id("getuid"),
        id("getgid"),
        id("geteuid"),
        id("getegid"),
        enosys("getgroups"),
        enosys("umask"),
        enosys("cwd"),
        enosys("chdir"),
    ])
}

/// `fs.writeSync(fd, buf)`: returns the number of bytes written.
fn write_sync(scope: &mut Scope<'_>, fd: &HostValue, buf: &HostValue) -> Result<usize, HostValue> {
    let Some(bytes) = buf.to_bytes() else {
        return Err(scope.type_error("the \"buffer\" argument must be a Uint8Array"));
    };
    scope.stdio.write(fd.to_number() as i64, &bytes);
    Ok(bytes.len())
}

fn fs() -> HostValue {
    let constants = HostValue::plain(
        [
            "O_WRONLY",
            "O_RDWR",
            "O_CREAT",
            "O_TRUNC",
            "O_APPEND",
            "O_EXCL",
            "O_DIRECTORY",
        ]
        .map(|k| (k, HostValue::Number(-1.0))),
    );
    let write_sync_fn = HostValue::native("writeSync", |scope, _, args| {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        write_sync(scope, &arg(0), &arg(1)).map(|n| HostValue::Number(n as f64))
    });
    // fs.write(fd, buf, offset, length, position, callback)
    let write_fn = HostValue::native("write", |scope, _, args| {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let (fd, buf, callback) = (arg(0), arg(1), arg(5));
        let whole_buffer = arg(2) == HostValue::Number(0.0)
            && buf.to_bytes().map(|b| b.len() as f64) == arg(3).as_number()
            && arg(4) == HostValue::Null;
        let result = if whole_buffer {
            write_sync(scope, &fd, &buf).map(|n| vec![HostValue::Null, HostValue::Number(n as f64)])
        } else {
            Ok(vec![scope.enosys()])
        };
        let cb_args = result.unwrap_or_else(|err| vec![err]);
        scope.apply(&callback, &HostValue::Undefined, &cb_args)?;
        Ok(HostValue::Undefined)
    });

    let mut props = vec![
        ("constants", constants),
        ("writeSync", write_sync_fn),
        ("write", write_fn),
    ];
    props.extend(FS_UNSUPPORTED.iter().map(|&name| {
        (
            name,
            HostValue::native(name, |scope, _, args| {
                let callback = args.last().cloned().unwrap_or_default();
                let err = scope.enosys();
                scope.apply(&callback, &HostValue::Undefined, &[err])?;
                Ok(HostValue::Undefined)
            }),
        )
    }));
    HostValue::plain(props)
}
