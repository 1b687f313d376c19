//! Host values visible to the guest.
//!
//! Values are single-threaded and shared by reference: objects and functions
//! live behind `Rc`, so two [`HostValue`]s referring to the same object compare
//! equal and intern to the same handle in the
//! [`ValueTable`](super::value_table::ValueTable).

use std::{
    cell::{Ref as CellRef, RefCell, RefMut},
    collections::HashMap,
    fmt,
    rc::Rc,
};

use itertools::Itertools;

use super::reflect::Scope;

/// Signature of a host function. `Err` carries the thrown value.
pub type NativeFn = dyn Fn(&mut Scope<'_>, &HostValue, &[HostValue]) -> Result<HostValue, HostValue>;

#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<Object>>);
#[derive(Clone)]
pub struct FunctionRef(Rc<Function>);
#[derive(Clone)]
pub struct SymbolRef(Rc<Symbol>);

#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Symbol(SymbolRef),
    Object(ObjectRef),
    Function(FunctionRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Ordinary,
    Array(Vec<HostValue>),
    /// `Uint8Array`.
    Bytes(Vec<u8>),
    /// `Date`, milliseconds since the Unix epoch.
    Date(f64),
}

pub struct Object {
    pub(crate) class: Option<FunctionRef>,
    pub(crate) props: HashMap<String, HostValue>,
    pub(crate) kind: ObjectKind,
}

pub struct Symbol {
    pub description: String,
}

pub enum FunctionKind {
    Native {
        call: Option<Rc<NativeFn>>,
        construct: Option<Rc<NativeFn>>,
    },
    /// Function exported by the guest through `_makeFuncWrapper`.
    Guest { id: u32 },
}

pub struct Function {
    pub(crate) name: String,
    pub(crate) kind: FunctionKind,
    /// Own properties (static members).
    pub(crate) props: RefCell<HashMap<String, HostValue>>,
    /// Members shared by instances constructed from this function.
    pub(crate) prototype: RefCell<HashMap<String, HostValue>>,
    pub(crate) parent: Option<FunctionRef>,
}

/// Largest length an array or `Uint8Array` may be given. Longer lengths
/// throw `Invalid array length` instead of allocating.
pub const MAX_ARRAY_LEN: usize = 1 << 24;

/// Writes further than this past the end of an array are stored as named
/// properties, leaving the dense part alone.
const MAX_INDEX_GAP: usize = 1024;

/// Returns whether `v` is a canonical array index such as `"0"` or `"17"`.
fn parse_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    key.parse().ok()
}

impl Object {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            class: None,
            props: HashMap::new(),
            kind,
        }
    }
    pub fn with_class(kind: ObjectKind, class: FunctionRef) -> Self {
        Self {
            class: Some(class),
            props: HashMap::new(),
            kind,
        }
    }
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }
    pub fn kind_mut(&mut self) -> &mut ObjectKind {
        &mut self.kind
    }
    pub fn class(&self) -> Option<&FunctionRef> {
        self.class.as_ref()
    }

    fn get_own(&self, key: &str) -> Option<HostValue> {
        match &self.kind {
            ObjectKind::Array(items) => {
                if key == "length" {
                    return Some(HostValue::Number(items.len() as f64));
                }
                if let Some(i) = parse_index(key) {
                    if let Some(v) = items.get(i) {
                        return Some(v.clone());
                    }
                    return Some(self.props.get(key).cloned().unwrap_or_default());
                }
            }
            ObjectKind::Bytes(bytes) => {
                if key == "length" || key == "byteLength" {
                    return Some(HostValue::Number(bytes.len() as f64));
                }
                if let Some(i) = parse_index(key) {
                    return Some(
                        bytes
                            .get(i)
                            .map_or(HostValue::Undefined, |b| HostValue::Number(*b as f64)),
                    );
                }
            }
            _ => {}
        }
        self.props.get(key).cloned()
    }

    /// Own property, then the prototype chain of the constructing class.
    pub fn get(&self, key: &str) -> HostValue {
        if let Some(v) = self.get_own(key) {
            return v;
        }
        let mut class = self.class.clone();
        while let Some(c) = class {
            if let Some(v) = c.0.prototype.borrow().get(key) {
                return v.clone();
            }
            class = c.0.parent.clone();
        }
        HostValue::Undefined
    }

    /// Returns `false` when the property cannot be written, like `Reflect.set`.
    pub fn set(&mut self, key: &str, value: HostValue) -> bool {
        match &mut self.kind {
            ObjectKind::Array(items) => {
                if key == "length" {
                    return match value.as_number() {
                        Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= MAX_ARRAY_LEN as f64 => {
                            resize_array(items, &mut self.props, n as usize);
                            true
                        }
                        _ => false,
                    };
                }
                if let Some(i) = parse_index(key) {
                    if i < items.len() {
                        items[i] = value;
                        return true;
                    }
                    if i < MAX_ARRAY_LEN && i - items.len() < MAX_INDEX_GAP {
                        resize_array(items, &mut self.props, i + 1);
                        items[i] = value;
                        return true;
                    }
                }
            }
            ObjectKind::Bytes(bytes) => {
                if key == "length" || key == "byteLength" {
                    return false;
                }
                if let Some(i) = parse_index(key) {
                    // out-of-range typed array writes are silently dropped
                    if let Some(b) = bytes.get_mut(i) {
                        *b = value.to_uint8();
                    }
                    return true;
                }
            }
            _ => {}
        }
        self.props.insert(key.to_string(), value);
        true
    }

    pub fn delete(&mut self, key: &str) -> bool {
        match &mut self.kind {
            ObjectKind::Array(items) => {
                if let Some(slot) = parse_index(key).and_then(|i| items.get_mut(i)) {
                    *slot = HostValue::Undefined;
                    return true;
                }
            }
            ObjectKind::Bytes(bytes) => {
                if parse_index(key).is_some_and(|i| i < bytes.len()) {
                    return false;
                }
            }
            _ => {}
        }
        self.props.remove(key);
        true
    }

    pub fn get_index(&self, index: i64) -> HostValue {
        match (&self.kind, usize::try_from(index)) {
            (ObjectKind::Array(items), Ok(i)) if i < items.len() => items[i].clone(),
            (ObjectKind::Bytes(bytes), Ok(i)) => bytes
                .get(i)
                .map_or(HostValue::Undefined, |b| HostValue::Number(*b as f64)),
            _ => self.get(&index.to_string()),
        }
    }

    pub fn set_index(&mut self, index: i64, value: HostValue) -> bool {
        self.set(&index.to_string(), value)
    }
}

/// Moves sparse entries the dense part now covers into `items` and drops
/// the ones past a shrunk length.
fn resize_array(items: &mut Vec<HostValue>, props: &mut HashMap<String, HostValue>, len: usize) {
    let old = items.len();
    items.resize(len, HostValue::Undefined);
    if len > old {
        let covered = props
            .keys()
            .filter_map(|k| parse_index(k))
            .filter(|i| (old..len).contains(i))
            .collect_vec();
        for i in covered {
            if let Some(v) = props.remove(&i.to_string()) {
                items[i] = v;
            }
        }
    } else {
        props.retain(|k, _| parse_index(k).is_none_or(|i| i < len));
    }
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }
    pub fn get(&self, key: &str) -> HostValue {
        if let Some(v) = self.props.borrow().get(key) {
            return v.clone();
        }
        match key {
            "name" => HostValue::string(&self.name),
            _ => HostValue::Undefined,
        }
    }
    pub fn set(&self, key: &str, value: HostValue) {
        self.props.borrow_mut().insert(key.to_string(), value);
    }
    pub fn delete(&self, key: &str) -> bool {
        self.props.borrow_mut().remove(key);
        true
    }
}

impl ObjectRef {
    pub fn new(obj: Object) -> Self {
        Self(Rc::new(RefCell::new(obj)))
    }
    pub fn borrow(&self) -> CellRef<'_, Object> {
        self.0.borrow()
    }
    pub fn borrow_mut(&self) -> RefMut<'_, Object> {
        self.0.borrow_mut()
    }
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
    pub fn get(&self, key: &str) -> HostValue {
        self.0.borrow().get(key)
    }
    pub fn set(&self, key: &str, value: HostValue) -> bool {
        self.0.borrow_mut().set(key, value)
    }
}

impl FunctionRef {
    pub fn new(f: Function) -> Self {
        Self(Rc::new(f))
    }
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
    /// Whether `self` is `ancestor` or derives from it.
    pub fn extends(&self, ancestor: &FunctionRef) -> bool {
        let mut cur = Some(self.clone());
        while let Some(c) = cur {
            if c.ptr_eq(ancestor) {
                return true;
            }
            cur = c.0.parent.clone();
        }
        false
    }
    pub fn define_method(
        &self,
        name: &str,
        f: impl Fn(&mut Scope<'_>, &HostValue, &[HostValue]) -> Result<HostValue, HostValue> + 'static,
    ) {
        self.0
            .prototype
            .borrow_mut()
            .insert(name.to_string(), HostValue::native(name, f));
    }
    pub fn define_proto_value(&self, name: &str, value: HostValue) {
        self.0.prototype.borrow_mut().insert(name.to_string(), value);
    }
}

impl std::ops::Deref for FunctionRef {
    type Target = Function;
    fn deref(&self) -> &Function {
        &self.0
    }
}

impl SymbolRef {
    pub fn new(description: impl Into<String>) -> Self {
        Self(Rc::new(Symbol {
            description: description.into(),
        }))
    }
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
    pub fn description(&self) -> &str {
        &self.0.description
    }
}

impl HostValue {
    pub fn string(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }

    pub fn object(obj: Object) -> Self {
        Self::Object(ObjectRef::new(obj))
    }

    /// Plain object populated from `(key, value)` pairs.
    pub fn plain<'a>(props: impl IntoIterator<Item = (&'a str, HostValue)>) -> Self {
        let mut obj = Object::new(ObjectKind::Ordinary);
        for (k, v) in props {
            obj.props.insert(k.to_string(), v);
        }
        Self::object(obj)
    }

    pub fn native(
        name: &str,
        f: impl Fn(&mut Scope<'_>, &HostValue, &[HostValue]) -> Result<HostValue, HostValue> + 'static,
    ) -> Self {
        Self::Function(FunctionRef::new(Function {
            name: name.to_string(),
            kind: FunctionKind::Native {
                call: Some(Rc::new(f) as Rc<NativeFn>),
                construct: None,
            },
            props: RefCell::default(),
            prototype: RefCell::default(),
            parent: None,
        }))
    }

    /// Guest callback with the id handed out by `_makeFuncWrapper`.
    pub fn guest_function(id: u32) -> Self {
        Self::Function(FunctionRef::new(Function {
            name: String::new(),
            kind: FunctionKind::Guest { id },
            props: RefCell::default(),
            prototype: RefCell::default(),
            parent: None,
        }))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Copy of the contents when this is a `Uint8Array`.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Object(o) => match &o.borrow().kind {
                ObjectKind::Bytes(b) => Some(b.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// `typeof`, with `null` reported as `"object"`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null | Self::Object(_) => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Function(_) => "function",
        }
    }

    /// `ToNumber` restricted to what the host needs.
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(b) => *b as u8 as f64,
            Self::Number(n) => *n,
            Self::Str(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// `ToUint8`: modulo conversion used by `Uint8Array` element writes.
    pub fn to_uint8(&self) -> u8 {
        let n = self.to_number();
        if !n.is_finite() {
            return 0;
        }
        (n.trunc().rem_euclid(256.0)) as u8
    }

    /// `String(v)`.
    pub fn to_js_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => number_to_string(*n),
            Self::Str(s) => s.to_string(),
            Self::Symbol(s) => format!("Symbol({})", s.description()),
            Self::Function(f) => format!("function {}() {{ [native code] }}", f.name),
            Self::Object(o) => {
                let obj = o.borrow();
                match &obj.kind {
                    ObjectKind::Array(items) => items
                        .iter()
                        .map(|v| {
                            if v.is_nullish() {
                                String::new()
                            } else {
                                v.to_js_string()
                            }
                        })
                        .join(","),
                    ObjectKind::Bytes(bytes) => bytes.iter().join(","),
                    ObjectKind::Date(ms) => format!("Date({})", number_to_string(*ms)),
                    ObjectKind::Ordinary => match obj.get("message") {
                        HostValue::Str(msg) => {
                            let name = obj.get("name");
                            let name = name.as_str().unwrap_or("Error");
                            if msg.is_empty() {
                                name.to_string()
                            } else {
                                format!("{name}: {msg}")
                            }
                        }
                        _ => "[object Object]".to_string(),
                    },
                }
            }
        }
    }
}

/// `String(n)`: shortest round-trip digits, in exponent form below `1e-6`
/// and from `1e21` up.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if (1e-6..1e21).contains(&n.abs()) {
        format!("{n}")
    } else {
        let s = format!("{n:e}");
        match s.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => s,
        }
    }
}

/// Strict equality (`===`): identity for references, IEEE comparison for
/// numbers.
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a.ptr_eq(b),
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Symbol(s) => write!(f, "Symbol({})", s.description()),
            Self::Function(func) => match func.kind {
                FunctionKind::Guest { id } => write!(f, "[guest function {id}]"),
                FunctionKind::Native { .. } => write!(f, "[function {}]", func.name),
            },
            // objects may be cyclic, print a summary only
            Self::Object(o) => match o.0.try_borrow() {
                Ok(obj) => match &obj.kind {
                    ObjectKind::Array(items) => write!(f, "[array; {}]", items.len()),
                    ObjectKind::Bytes(bytes) => write!(f, "Uint8Array({:?})", bytes),
                    ObjectKind::Date(ms) => write!(f, "Date({ms})"),
                    ObjectKind::Ordinary => {
                        write!(f, "{{{}}}", obj.props.keys().sorted().join(", "))
                    }
                },
                Err(_) => f.write_str("[object (borrowed)]"),
            },
        }
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}
impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}
impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        Self::object(Object::new(ObjectKind::Array(items)))
    }
}
