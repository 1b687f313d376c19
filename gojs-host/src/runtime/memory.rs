//! Typed, bounds-checked view over the guest's linear memory.
//!
//! A [`Memory`] borrows the live buffer for the duration of a single syscall.
//! Growing the guest memory invalidates every previously obtained view, so
//! views are never stored; each syscall asks its
//! [`GuestAccess`](super::GuestAccess) to `resync` instead.
//!
//! Go passes strings and slices as headers in the stack frame:
//!
//! ```text
//! string: [ptr: i64][len: i64]
//! slice:  [ptr: i64][len: i64][cap: i64]
//! ```
//!
//! Only `ptr` and `len` are read. All integers are little-endian.

use std::ops::Range;

use super::{BridgeError, value_table::Ref};

pub struct Memory<'a> {
    buf: &'a mut [u8],
}

impl<'a> Memory<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Validate `[addr, addr + len)` against the current buffer.
    fn range(&self, addr: i64, len: i64) -> Result<Range<usize>, BridgeError> {
        let oob = || BridgeError::OutOfBounds {
            addr,
            len,
            size: self.buf.len(),
        };
        if addr < 0 || len < 0 {
            return Err(oob());
        }
        let end = addr.checked_add(len).ok_or_else(oob)?;
        if end as u64 > self.buf.len() as u64 {
            return Err(oob());
        }
        Ok(addr as usize..end as usize)
    }

    fn array<const N: usize>(&self, addr: i64) -> Result<[u8; N], BridgeError> {
        let range = self.range(addr, N as i64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[range]);
        Ok(out)
    }

    fn put<const N: usize>(&mut self, addr: i64, bytes: [u8; N]) -> Result<(), BridgeError> {
        let range = self.range(addr, N as i64)?;
        self.buf[range].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn read_u8(&self, addr: i64) -> Result<u8, BridgeError> {
        Ok(self.array::<1>(addr)?[0])
    }
    pub fn write_u8(&mut self, addr: i64, v: u8) -> Result<(), BridgeError> {
        self.put(addr, [v])
    }
    pub fn read_u32(&self, addr: i64) -> Result<u32, BridgeError> {
        self.array(addr).map(u32::from_le_bytes)
    }
    pub fn write_u32(&mut self, addr: i64, v: u32) -> Result<(), BridgeError> {
        self.put(addr, v.to_le_bytes())
    }
    pub fn read_i32(&self, addr: i64) -> Result<i32, BridgeError> {
        self.array(addr).map(i32::from_le_bytes)
    }
    pub fn write_i32(&mut self, addr: i64, v: i32) -> Result<(), BridgeError> {
        self.put(addr, v.to_le_bytes())
    }
    pub fn read_i64(&self, addr: i64) -> Result<i64, BridgeError> {
        self.array(addr).map(i64::from_le_bytes)
    }
    pub fn write_i64(&mut self, addr: i64, v: i64) -> Result<(), BridgeError> {
        self.put(addr, v.to_le_bytes())
    }
    pub fn read_f64(&self, addr: i64) -> Result<f64, BridgeError> {
        self.array(addr).map(f64::from_le_bytes)
    }
    pub fn write_f64(&mut self, addr: i64, v: f64) -> Result<(), BridgeError> {
        self.put(addr, v.to_le_bytes())
    }
    pub fn read_ref(&self, addr: i64) -> Result<Ref, BridgeError> {
        self.array(addr).map(|b| Ref(u64::from_le_bytes(b)))
    }
    pub fn write_ref(&mut self, addr: i64, r: Ref) -> Result<(), BridgeError> {
        self.put(addr, r.0.to_le_bytes())
    }

    pub fn bytes(&self, addr: i64, len: i64) -> Result<&[u8], BridgeError> {
        let range = self.range(addr, len)?;
        Ok(&self.buf[range])
    }

    pub fn bytes_mut(&mut self, addr: i64, len: i64) -> Result<&mut [u8], BridgeError> {
        let range = self.range(addr, len)?;
        Ok(&mut self.buf[range])
    }

    fn header(&self, addr: i64) -> Result<(i64, i64), BridgeError> {
        Ok((self.read_i64(addr)?, self.read_i64(addr + 8)?))
    }

    /// Zero-copy view of the byte slice whose header is at `addr`.
    pub fn read_byte_slice(&self, addr: i64) -> Result<&[u8], BridgeError> {
        let (ptr, len) = self.header(addr)?;
        self.bytes(ptr, len)
    }

    pub fn byte_slice_mut(&mut self, addr: i64) -> Result<&mut [u8], BridgeError> {
        let (ptr, len) = self.header(addr)?;
        self.bytes_mut(ptr, len)
    }

    /// Decode the string whose header is at `addr`. Invalid UTF-8 is replaced
    /// with U+FFFD.
    pub fn read_string(&self, addr: i64) -> Result<String, BridgeError> {
        self.read_byte_slice(addr)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read the slots of a `[]js.Value` whose header is at `addr`.
    pub fn read_value_slice(&self, addr: i64) -> Result<Vec<Ref>, BridgeError> {
        let (ptr, len) = self.header(addr)?;
        let total = len.checked_mul(8).ok_or(BridgeError::OutOfBounds {
            addr: ptr,
            len,
            size: self.buf.len(),
        })?;
        let bytes = self.bytes(ptr, total)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                let mut slot = [0u8; 8];
                slot.copy_from_slice(c);
                Ref(u64::from_le_bytes(slot))
            })
            .collect())
    }
}
