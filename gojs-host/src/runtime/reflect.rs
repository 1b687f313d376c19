//! Reflective operations on host values.
//!
//! The syscalls only ever manipulate host values through [`Reflect`], which
//! mirrors the subset of the ECMAScript `Reflect` namespace Go relies on.
//! Failures are thrown values (`Err(HostValue)`), usually a `TypeError`
//! built by the realm.

use std::sync::mpsc;

use super::{
    host::DeferredCall,
    realm::Realm,
    scheduler::Clock,
    stdio::Stdio,
    value::{FunctionKind, FunctionRef, HostValue, ObjectKind},
};

pub type Thrown = HostValue;

pub trait Reflect {
    fn get(&mut self, target: &HostValue, key: &str) -> Result<HostValue, Thrown>;
    fn set(&mut self, target: &HostValue, key: &str, value: HostValue) -> Result<(), Thrown>;
    fn delete_property(&mut self, target: &HostValue, key: &str) -> Result<(), Thrown>;
    fn get_index(&mut self, target: &HostValue, index: i64) -> Result<HostValue, Thrown>;
    fn set_index(&mut self, target: &HostValue, index: i64, value: HostValue) -> Result<(), Thrown>;
    fn apply(&mut self, f: &HostValue, this: &HostValue, args: &[HostValue]) -> Result<HostValue, Thrown>;
    fn construct(&mut self, f: &HostValue, args: &[HostValue]) -> Result<HostValue, Thrown>;
    fn instance_of(&mut self, value: &HostValue, class: &HostValue) -> Result<bool, Thrown>;
    /// `value.length`, also defined on strings.
    fn length(&mut self, value: &HostValue) -> Result<HostValue, Thrown>;

    fn call_method(&mut self, target: &HostValue, name: &str, args: &[HostValue]) -> Result<HostValue, Thrown> {
        let f = self.get(target, name)?;
        self.apply(&f, target, args)
    }
}

/// Host capabilities available while a syscall or a host function runs.
pub struct Scope<'a> {
    pub realm: &'a Realm,
    pub stdio: &'a mut Stdio,
    pub clock: &'a dyn Clock,
    pub(crate) calls: &'a mpsc::Sender<DeferredCall>,
}

impl Scope<'_> {
    pub fn type_error(&self, message: &str) -> Thrown {
        self.realm.new_error(&self.realm.classes.type_error, message)
    }

    pub fn error(&self, message: &str) -> Thrown {
        self.realm.new_error(&self.realm.classes.error, message)
    }

    /// `Error("not implemented")` with `code: "ENOSYS"`, which Go maps to
    /// `syscall.ENOSYS`.
    pub fn enosys(&self) -> Thrown {
        let err = self.error("not implemented");
        if let Some(o) = err.as_object() {
            o.set("code", HostValue::string("ENOSYS"));
        }
        err
    }

    /// Queue a call to the guest function `id`. It runs once the guest has
    /// yielded; its result is sent on the returned channel.
    pub fn defer_call(&self, id: u32, this: HostValue, args: Vec<HostValue>) -> mpsc::Receiver<HostValue> {
        let (tx, rx) = mpsc::channel();
        self.send(DeferredCall {
            id,
            this,
            args,
            reply: Some(tx),
        });
        rx
    }

    fn send(&self, call: DeferredCall) {
        log::trace!("deferring guest callback {}", call.id);
        if let Err(e) = self.calls.send(call) {
            log::warn!("guest callback {} dropped: {e}", e.0.id);
        }
    }

    fn not_object(&self, op: &str, target: &HostValue) -> Thrown {
        self.type_error(&format!("{op} called on non-object ({})", target.type_name()))
    }

    fn call_native(&mut self, f: &FunctionRef, this: &HostValue, args: &[HostValue]) -> Result<HostValue, Thrown> {
        match f.kind() {
            FunctionKind::Native { call: Some(call), .. } => {
                let call = call.clone();
                call(self, this, args)
            }
            FunctionKind::Native { call: None, .. } => Err(self.type_error(&format!(
                "Class constructor {} cannot be invoked without 'new'",
                f.name()
            ))),
            FunctionKind::Guest { id } => {
                self.send(DeferredCall {
                    id: *id,
                    this: this.clone(),
                    args: args.to_vec(),
                    reply: None,
                });
                Ok(HostValue::Undefined)
            }
        }
    }
}

impl Reflect for Scope<'_> {
    fn get(&mut self, target: &HostValue, key: &str) -> Result<HostValue, Thrown> {
        match target {
            HostValue::Object(o) => Ok(o.get(key)),
            HostValue::Function(f) => Ok(f.get(key)),
            _ => Err(self.not_object("Reflect.get", target)),
        }
    }

    fn set(&mut self, target: &HostValue, key: &str, value: HostValue) -> Result<(), Thrown> {
        match target {
            HostValue::Object(o) => {
                let array = matches!(o.borrow().kind(), ObjectKind::Array(_));
                if !o.set(key, value) {
                    if array && key == "length" {
                        return Err(self.error("Invalid array length"));
                    }
                    // Reflect.set reports other rejected writes as false, it never throws
                    log::trace!("write to read-only property `{key}` ignored");
                }
                Ok(())
            }
            HostValue::Function(f) => {
                f.set(key, value);
                Ok(())
            }
            _ => Err(self.not_object("Reflect.set", target)),
        }
    }

    fn delete_property(&mut self, target: &HostValue, key: &str) -> Result<(), Thrown> {
        match target {
            HostValue::Object(o) => {
                o.borrow_mut().delete(key);
                Ok(())
            }
            HostValue::Function(f) => {
                f.delete(key);
                Ok(())
            }
            _ => Err(self.not_object("Reflect.deleteProperty", target)),
        }
    }

    fn get_index(&mut self, target: &HostValue, index: i64) -> Result<HostValue, Thrown> {
        match target {
            HostValue::Object(o) => Ok(o.borrow().get_index(index)),
            _ => self.get(target, &index.to_string()),
        }
    }

    fn set_index(&mut self, target: &HostValue, index: i64, value: HostValue) -> Result<(), Thrown> {
        match target {
            HostValue::Object(o) => {
                o.borrow_mut().set_index(index, value);
                Ok(())
            }
            _ => self.set(target, &index.to_string(), value),
        }
    }

    fn apply(&mut self, f: &HostValue, this: &HostValue, args: &[HostValue]) -> Result<HostValue, Thrown> {
        match f {
            HostValue::Function(func) => self.call_native(func, this, args),
            _ => Err(self.type_error(&format!("{} is not a function", f.to_js_string()))),
        }
    }

    fn construct(&mut self, f: &HostValue, args: &[HostValue]) -> Result<HostValue, Thrown> {
        let not_ctor = || format!("{} is not a constructor", f.to_js_string());
        let HostValue::Function(func) = f else {
            return Err(self.type_error(&not_ctor()));
        };
        match func.kind() {
            FunctionKind::Native {
                construct: Some(ctor),
                ..
            } => {
                let ctor = ctor.clone();
                // constructors receive themselves as `this`, standing in for new.target
                ctor(self, f, args)
            }
            _ => Err(self.type_error(&not_ctor())),
        }
    }

    fn instance_of(&mut self, value: &HostValue, class: &HostValue) -> Result<bool, Thrown> {
        let HostValue::Function(class) = class else {
            return Err(self.type_error("Right-hand side of 'instanceof' is not callable"));
        };
        Ok(match value {
            HostValue::Object(o) => o
                .borrow()
                .class()
                .is_some_and(|c| c.extends(class) || class.ptr_eq(&self.realm.classes.object)),
            HostValue::Function(_) => class.ptr_eq(&self.realm.classes.object),
            _ => false,
        })
    }

    fn length(&mut self, value: &HostValue) -> Result<HostValue, Thrown> {
        match value {
            HostValue::Str(s) => Ok(HostValue::Number(s.encode_utf16().count() as f64)),
            HostValue::Undefined | HostValue::Null => Err(self.type_error(&format!(
                "Cannot read properties of {} (reading 'length')",
                value.to_js_string()
            ))),
            HostValue::Object(_) | HostValue::Function(_) => self.get(value, "length"),
            _ => Ok(HostValue::Undefined),
        }
    }
}
