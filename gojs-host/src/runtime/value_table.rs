//! Handle table shared between the host and the guest.
//!
//! Every value the guest holds is an 8 byte slot. Numbers are stored as plain
//! doubles; everything else is NaN-boxed:
//!
//! ```text
//! 0x0000_0000_0000_0000          undefined
//! any non-NaN f64                 that number
//! [0x7FF8_0000 | flag][handle]    high word, low word
//! ```
//!
//! `flag` is the `typeof` hint Go uses without calling back into the host
//! (see [`TypeFlag`]). Handles below [`handle::FIRST_FREE`] are pre-seeded and
//! pinned; the rest are reference counted by the guest through
//! `syscall/js.finalizeRef` and recycled once they drop to zero.

use std::{collections::HashMap, rc::Rc};

use super::{BridgeError, value::HostValue};

/// Raw 8 byte value slot as it appears in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ref(pub u64);

/// High word of every NaN-boxed slot.
pub const NAN_HEAD: u32 = 0x7FF8_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeFlag {
    None = 0,
    Object = 1,
    String = 2,
    Symbol = 3,
    Function = 4,
}

/// Pre-seeded handles, in the order the guest expects them.
pub mod handle {
    pub const NAN: u32 = 0;
    pub const ZERO: u32 = 1;
    pub const NULL: u32 = 2;
    pub const TRUE: u32 = 3;
    pub const FALSE: u32 = 4;
    pub const GLOBAL: u32 = 5;
    /// Object carrying `_pendingEvent` and `_makeFuncWrapper`.
    pub const BRIDGE: u32 = 6;
    pub const FIRST_FREE: u32 = 7;
}

impl Ref {
    pub const UNDEFINED: Ref = Ref(0);

    pub const fn boxed(flag: TypeFlag, handle: u32) -> Self {
        Self(((NAN_HEAD | flag as u32) as u64) << 32 | handle as u64)
    }

    /// The handle of a boxed slot, `None` for `undefined` and plain numbers.
    pub fn handle(self) -> Option<u32> {
        if self.0 == 0 || !f64::from_bits(self.0).is_nan() {
            None
        } else {
            Some(self.0 as u32)
        }
    }

    pub fn flag(self) -> u32 {
        ((self.0 >> 32) as u32) & !NAN_HEAD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCount {
    Pinned,
    Counted(u32),
}

enum Slot {
    Live { value: HostValue, rc: RefCount },
    Free,
}

/// Identity used for the reverse lookup: content for strings, allocation
/// address for shared references.
#[derive(PartialEq, Eq, Hash)]
enum Key {
    Str(Rc<str>),
    Addr(usize),
}

impl Key {
    fn of(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Str(s) => Some(Self::Str(s.clone())),
            HostValue::Object(o) => Some(Self::Addr(o.addr())),
            HostValue::Function(f) => Some(Self::Addr(f.addr())),
            HostValue::Symbol(s) => Some(Self::Addr(s.addr())),
            _ => None,
        }
    }
}

fn flag_of(value: &HostValue) -> TypeFlag {
    match value {
        HostValue::Object(_) => TypeFlag::Object,
        HostValue::Str(_) => TypeFlag::String,
        HostValue::Symbol(_) => TypeFlag::Symbol,
        HostValue::Function(_) => TypeFlag::Function,
        _ => TypeFlag::None,
    }
}

pub struct ValueTable {
    forward: Vec<Slot>,
    reverse: HashMap<Key, u32>,
    free: Vec<u32>,
}

impl ValueTable {
    /// Table holding only the pre-seeded constants, `global` at
    /// [`handle::GLOBAL`] and `bridge` at [`handle::BRIDGE`].
    pub fn new(global: HostValue, bridge: HostValue) -> Self {
        let seeded = [
            HostValue::Number(f64::NAN),
            HostValue::Number(0.0),
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Bool(false),
            global,
            bridge,
        ];
        let mut reverse = HashMap::new();
        let forward = seeded
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                if let Some(key) = Key::of(&value) {
                    reverse.insert(key, i as u32);
                }
                Slot::Live {
                    value,
                    rc: RefCount::Pinned,
                }
            })
            .collect();
        Self {
            forward,
            reverse,
            free: vec![],
        }
    }

    /// Encode `value` for the guest, interning it when it needs a handle.
    ///
    /// Each call on a reference value counts as one new reference held by the
    /// guest.
    pub fn store(&mut self, value: &HostValue) -> Ref {
        let pinned = |h| Ref::boxed(TypeFlag::None, h);
        match value {
            HostValue::Undefined => return Ref::UNDEFINED,
            HostValue::Null => return pinned(handle::NULL),
            HostValue::Bool(true) => return pinned(handle::TRUE),
            HostValue::Bool(false) => return pinned(handle::FALSE),
            HostValue::Number(n) if n.is_nan() => return pinned(handle::NAN),
            HostValue::Number(n) if n.to_bits() == 0 => return pinned(handle::ZERO),
            HostValue::Number(n) => return Ref(n.to_bits()),
            _ => {}
        }
        let flag = flag_of(value);
        let Some(key) = Key::of(value) else {
            unreachable!("every non-primitive value has a key")
        };
        if let Some(&h) = self.reverse.get(&key) {
            if let Some(Slot::Live {
                rc: RefCount::Counted(n),
                ..
            }) = self.forward.get_mut(h as usize)
            {
                *n += 1;
                log::trace!("store: {h} refcount -> {n}");
            }
            return Ref::boxed(flag, h);
        }
        let slot = Slot::Live {
            value: value.clone(),
            rc: RefCount::Counted(1),
        };
        let h = match self.free.pop() {
            Some(h) => {
                self.forward[h as usize] = slot;
                h
            }
            None => {
                self.forward.push(slot);
                (self.forward.len() - 1) as u32
            }
        };
        log::trace!("store: new handle {h} ({})", value.type_name());
        self.reverse.insert(key, h);
        Ref::boxed(flag, h)
    }

    /// Decode a slot written by the guest.
    pub fn load(&self, r: Ref) -> Result<HostValue, BridgeError> {
        if r.0 == 0 {
            return Ok(HostValue::Undefined);
        }
        let n = f64::from_bits(r.0);
        if !n.is_nan() {
            return Ok(HostValue::Number(n));
        }
        let h = r.0 as u32;
        match self.forward.get(h as usize) {
            Some(Slot::Live { value, .. }) => Ok(value.clone()),
            _ => Err(BridgeError::InvalidHandle(h)),
        }
    }

    /// Drop one guest reference. Pinned handles are never released.
    pub fn release(&mut self, h: u32) {
        match self.forward.get_mut(h as usize) {
            Some(Slot::Live {
                rc: RefCount::Pinned,
                ..
            }) => {
                log::trace!("release: {h} is pinned");
            }
            Some(Slot::Live {
                rc: RefCount::Counted(n),
                value,
            }) => {
                *n -= 1;
                log::trace!("release: {h} refcount -> {n}");
                if *n == 0 {
                    if let Some(key) = Key::of(value) {
                        self.reverse.remove(&key);
                    }
                    self.forward[h as usize] = Slot::Free;
                    self.free.push(h);
                }
            }
            _ => log::warn!("release: invalid handle {h}"),
        }
    }

    /// Handle currently assigned to `value`, if any.
    pub fn lookup(&self, value: &HostValue) -> Option<u32> {
        Key::of(value).and_then(|k| self.reverse.get(&k).copied())
    }

    pub fn refcount(&self, h: u32) -> Option<RefCount> {
        match self.forward.get(h as usize) {
            Some(Slot::Live { rc, .. }) => Some(*rc),
            _ => None,
        }
    }

    /// Number of counted handles still held by the guest.
    pub fn live(&self) -> usize {
        self.forward
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Slot::Live {
                        rc: RefCount::Counted(_),
                        ..
                    }
                )
            })
            .count()
    }

    /// Drop every counted handle. Used once the guest has exited.
    pub fn clear(&mut self) {
        self.forward.truncate(handle::FIRST_FREE as usize);
        self.free.clear();
        self.reverse.retain(|_, h| *h < handle::FIRST_FREE);
        log::debug!("value table cleared");
    }
}
