//! Global environment visible to the guest.
//!
//! The realm owns the global object (handle 5), the bridge object (handle 6)
//! and the constructors Go reaches for during start-up. Objects created by
//! host code should go through the realm so that `instanceof` works on them.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use super::{
    reflect::Scope,
    value::{Function, FunctionKind, FunctionRef, HostValue, NativeFn, Object, ObjectKind, ObjectRef, MAX_ARRAY_LEN},
};

mod polyfill;

pub struct Classes {
    pub object: FunctionRef,
    pub array: FunctionRef,
    pub uint8_array: FunctionRef,
    pub error: FunctionRef,
    pub type_error: FunctionRef,
    pub date: FunctionRef,
}

pub struct Realm {
    pub global: HostValue,
    pub bridge: HostValue,
    pub classes: Classes,
}

fn class(
    name: &str,
    parent: Option<&FunctionRef>,
    call: Option<Rc<NativeFn>>,
    construct: Rc<NativeFn>,
) -> FunctionRef {
    FunctionRef::new(Function {
        name: name.to_string(),
        kind: FunctionKind::Native {
            call,
            construct: Some(construct),
        },
        props: RefCell::default(),
        prototype: RefCell::default(),
        parent: parent.cloned(),
    })
}

fn native(
    f: impl Fn(&mut Scope<'_>, &HostValue, &[HostValue]) -> Result<HostValue, HostValue> + 'static,
) -> Rc<NativeFn> {
    Rc::new(f)
}

fn date_ms(scope: &Scope<'_>, this: &HostValue) -> Result<f64, HostValue> {
    match this.as_object().map(|o| o.borrow().kind().clone()) {
        Some(ObjectKind::Date(ms)) => Ok(ms),
        _ => Err(scope.type_error("this is not a Date object.")),
    }
}

/// Class referenced by the `this` a constructor receives.
fn new_target(this: &HostValue) -> Option<FunctionRef> {
    this.as_function().cloned()
}

fn array_length(n: f64) -> Option<usize> {
    (n >= 0.0 && n.fract() == 0.0 && n <= MAX_ARRAY_LEN as f64).then_some(n as usize)
}

impl Classes {
    fn new() -> Self {
        let object = class(
            "Object",
            None,
            Some(native(|scope, _, args| Ok(scope.realm.new_object(args)))),
            native(|scope, _, args| Ok(scope.realm.new_object(args))),
        );

        let array = class(
            "Array",
            None,
            Some(native(|scope, _, args| scope.realm.new_array(args))),
            native(|scope, _, args| scope.realm.new_array(args)),
        );

        let uint8_array = class(
            "Uint8Array",
            None,
            None,
            native(|scope, _, args| {
                let bytes = match args.first() {
                    None | Some(HostValue::Undefined) => vec![],
                    Some(HostValue::Number(n)) => match array_length(*n) {
                        Some(len) => vec![0; len],
                        None => return Err(scope.error("Invalid typed array length")),
                    },
                    Some(HostValue::Object(o)) => match o.borrow().kind() {
                        ObjectKind::Bytes(b) => b.clone(),
                        ObjectKind::Array(items) => items.iter().map(HostValue::to_uint8).collect(),
                        _ => vec![],
                    },
                    Some(_) => vec![],
                };
                Ok(scope.realm.new_bytes(bytes))
            }),
        );

        let error = class(
            "Error",
            None,
            Some(native(|scope, _, args| {
                let msg = message_arg(args);
                Ok(scope.realm.new_error(&scope.realm.classes.error, &msg))
            })),
            native(|scope, this, args| {
                let class = new_target(this).unwrap_or_else(|| scope.realm.classes.error.clone());
                Ok(scope.realm.new_error(&class, &message_arg(args)))
            }),
        );
        error.define_proto_value("name", HostValue::string("Error"));
        error.define_proto_value("message", HostValue::string(""));

        let type_error = class(
            "TypeError",
            Some(&error),
            Some(native(|scope, _, args| {
                let msg = message_arg(args);
                Ok(scope.realm.new_error(&scope.realm.classes.type_error, &msg))
            })),
            native(|scope, this, args| {
                let class =
                    new_target(this).unwrap_or_else(|| scope.realm.classes.type_error.clone());
                Ok(scope.realm.new_error(&class, &message_arg(args)))
            }),
        );
        type_error.define_proto_value("name", HostValue::string("TypeError"));

        let date = class(
            "Date",
            None,
            None,
            native(|scope, _, args| {
                let ms = match args.first() {
                    Some(v @ HostValue::Number(_)) => v.to_number(),
                    Some(HostValue::Object(o)) => match o.borrow().kind() {
                        ObjectKind::Date(ms) => *ms,
                        _ => f64::NAN,
                    },
                    _ => scope.clock.wall().as_millis() as f64,
                };
                Ok(HostValue::object(Object::with_class(
                    ObjectKind::Date(ms),
                    scope.realm.classes.date.clone(),
                )))
            }),
        );
        date.set(
            "now",
            HostValue::native("now", |scope, _, _| {
                Ok(HostValue::Number(scope.clock.wall().as_millis() as f64))
            }),
        );
        date.define_method("getTime", |scope, this, _| {
            date_ms(scope, this).map(HostValue::Number)
        });
        date.define_method("valueOf", |scope, this, _| {
            date_ms(scope, this).map(HostValue::Number)
        });
        // the guest always runs in UTC
        date.define_method("getTimezoneOffset", |scope, this, _| {
            date_ms(scope, this).map(|_| HostValue::Number(0.0))
        });

        Self {
            object,
            array,
            uint8_array,
            error,
            type_error,
            date,
        }
    }
}

fn message_arg(args: &[HostValue]) -> String {
    match args.first() {
        None | Some(HostValue::Undefined) => String::new(),
        Some(v) => v.to_js_string(),
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self::new()
    }
}

impl Realm {
    pub fn new() -> Self {
        let classes = Classes::new();
        let global = HostValue::object(Object::with_class(
            ObjectKind::Ordinary,
            classes.object.clone(),
        ));
        let bridge = HostValue::plain([
            ("_pendingEvent", HostValue::Null),
            (
                "_makeFuncWrapper",
                HostValue::native("_makeFuncWrapper", |scope, _, args| {
                    match args.first().map(HostValue::to_number) {
                        Some(id) if id >= 0.0 && id <= u32::MAX as f64 => {
                            Ok(HostValue::guest_function(id as u32))
                        }
                        _ => Err(scope.type_error("_makeFuncWrapper expects a callback id")),
                    }
                }),
            ),
        ]);
        if let Some(g) = global.as_object() {
            polyfill::install(g, &classes);
        }
        Self {
            global,
            bridge,
            classes,
        }
    }

    pub fn global_object(&self) -> Option<&ObjectRef> {
        self.global.as_object()
    }

    /// Define a global property, e.g. a host function the guest looks up
    /// through `js.Global().Get`.
    pub fn define_global(&self, name: &str, value: HostValue) {
        if let Some(g) = self.global.as_object() {
            g.set(name, value);
        }
    }

    pub fn new_object(&self, args: &[HostValue]) -> HostValue {
        match args.first() {
            Some(v @ (HostValue::Object(_) | HostValue::Function(_))) => v.clone(),
            _ => HostValue::object(Object::with_class(
                ObjectKind::Ordinary,
                self.classes.object.clone(),
            )),
        }
    }

    /// `Array(n)` or `Array(a, b, ...)`.
    pub fn new_array(&self, args: &[HostValue]) -> Result<HostValue, HostValue> {
        let items = match args {
            [HostValue::Number(n)] => match array_length(*n) {
                Some(len) => vec![HostValue::Undefined; len],
                None => return Err(self.new_error(&self.classes.error, "Invalid array length")),
            },
            _ => args.to_vec(),
        };
        Ok(self.array_of(items))
    }

    pub fn array_of(&self, items: Vec<HostValue>) -> HostValue {
        HostValue::object(Object::with_class(
            ObjectKind::Array(items),
            self.classes.array.clone(),
        ))
    }

    pub fn new_bytes(&self, bytes: Vec<u8>) -> HostValue {
        HostValue::object(Object::with_class(
            ObjectKind::Bytes(bytes),
            self.classes.uint8_array.clone(),
        ))
    }

    pub fn new_error(&self, class: &FunctionRef, message: &str) -> HostValue {
        let mut obj = Object::with_class(ObjectKind::Ordinary, class.clone());
        obj.props = HashMap::from([("message".to_string(), HostValue::string(message))]);
        HostValue::object(obj)
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        // the global object refers to itself through `globalThis`
        for v in [&self.global, &self.bridge] {
            if let Some(o) = v.as_object() {
                o.borrow_mut().props.clear();
            }
        }
    }
}
