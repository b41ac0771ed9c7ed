//! Marshalling between host values and the module's linear memory.
//!
//! Strings cross the boundary as NUL-terminated byte runs. Argument vectors
//! are a table of 32-bit little-endian pointers, one per string. Every buffer
//! the host allocates here is owned by the host and must be handed back with
//! [`GuestMemory::dealloc`] once the call returns.

use crate::response::Response;
use crate::{Result, RuntimeError};

/// Width of a pointer slot in a wasm32 module.
pub const POINTER_SIZE: u32 = 4;

/// A linear memory the host can read, write and allocate in.
pub trait GuestMemory {
    /// The whole addressable memory.
    fn data(&self) -> &[u8];

    /// The whole addressable memory, mutably.
    fn data_mut(&mut self) -> &mut [u8];

    /// Allocate `size` bytes inside the module.
    fn alloc(&mut self, size: u32) -> Result<u32>;

    /// Release an allocation made by [`GuestMemory::alloc`].
    fn dealloc(&mut self, ptr: u32) -> Result<()>;
}

/// Read a NUL-terminated string starting at `ptr`, terminator excluded.
pub fn read_cstring(memory: &[u8], ptr: u32) -> Result<String> {
    let start = ptr as usize;
    let tail = memory.get(start..).ok_or_else(|| {
        RuntimeError::Memory(format!(
            "pointer {:#x} is past the end of memory ({} bytes)",
            ptr,
            memory.len()
        ))
    })?;

    let len = tail.iter().position(|&b| b == 0).ok_or_else(|| {
        RuntimeError::Memory(format!("no NUL terminator after pointer {:#x}", ptr))
    })?;

    String::from_utf8(tail[..len].to_vec())
        .map_err(|e| RuntimeError::Decode(format!("string at {:#x} is not UTF-8: {}", ptr, e)))
}

/// Read `len` raw bytes starting at `ptr`.
pub fn read_bytes(memory: &[u8], ptr: u32, len: u32) -> Result<&[u8]> {
    let start = ptr as usize;
    let end = start + len as usize;
    memory.get(start..end).ok_or_else(|| {
        RuntimeError::Memory(format!(
            "read of {} bytes at {:#x} is out of bounds",
            len, ptr
        ))
    })
}

/// Copy `bytes` into memory at `ptr`.
pub fn write_bytes(memory: &mut [u8], ptr: u32, bytes: &[u8]) -> Result<()> {
    let start = ptr as usize;
    let end = start + bytes.len();
    let len = memory.len();
    let dst = memory.get_mut(start..end).ok_or_else(|| {
        RuntimeError::Memory(format!(
            "write of {} bytes at {:#x} exceeds memory ({} bytes)",
            bytes.len(),
            ptr,
            len
        ))
    })?;
    dst.copy_from_slice(bytes);
    Ok(())
}

/// Allocate a NUL-terminated copy of `s` inside the module.
pub fn write_cstring<M: GuestMemory + ?Sized>(memory: &mut M, s: &str) -> Result<u32> {
    if s.as_bytes().contains(&0) {
        return Err(RuntimeError::Encode(format!(
            "string contains an interior NUL byte: {:?}",
            s
        )));
    }

    let size = u32::try_from(s.len() + 1)
        .map_err(|_| RuntimeError::Encode(format!("string of {} bytes is too large", s.len())))?;
    let ptr = memory.alloc(size)?;

    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);

    if let Err(e) = write_bytes(memory.data_mut(), ptr, &bytes) {
        let _ = memory.dealloc(ptr);
        return Err(e);
    }
    Ok(ptr)
}

/// Allocations backing an argv-style pointer table.
#[derive(Debug)]
pub struct EncodedArray {
    table: u32,
    strings: Vec<u32>,
}

impl EncodedArray {
    /// Base pointer of the pointer table.
    pub fn base(&self) -> u32 {
        self.table
    }

    /// Number of entries (argc).
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Pointer to the `index`-th string.
    pub fn get(&self, index: usize) -> Option<u32> {
        self.strings.get(index).copied()
    }

    /// Release every string buffer and the table itself.
    ///
    /// All frees are attempted; the first failure is reported.
    pub fn free<M: GuestMemory + ?Sized>(self, memory: &mut M) -> Result<()> {
        let mut first_err = None;
        for ptr in self.strings.into_iter().chain(std::iter::once(self.table)) {
            if let Err(e) = memory.dealloc(ptr) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Write `strings` into the module and build a pointer table over them.
pub fn encode_string_array<M: GuestMemory + ?Sized>(
    memory: &mut M,
    strings: &[&str],
) -> Result<EncodedArray> {
    let mut encoded = Vec::with_capacity(strings.len());
    for s in strings {
        match write_cstring(memory, s) {
            Ok(ptr) => encoded.push(ptr),
            Err(e) => {
                for ptr in encoded {
                    let _ = memory.dealloc(ptr);
                }
                return Err(e);
            }
        }
    }

    let table_size = POINTER_SIZE * strings.len() as u32;
    let table = match memory.alloc(table_size.max(POINTER_SIZE)) {
        Ok(ptr) => ptr,
        Err(e) => {
            for ptr in encoded {
                let _ = memory.dealloc(ptr);
            }
            return Err(e);
        }
    };

    let slots: Vec<u8> = encoded.iter().flat_map(|ptr| ptr.to_le_bytes()).collect();
    let array = EncodedArray {
        table,
        strings: encoded,
    };
    if let Err(e) = write_bytes(memory.data_mut(), table, &slots) {
        let _ = array.free(memory);
        return Err(e);
    }
    Ok(array)
}

/// Read the envelope string at `ptr` and decode it.
pub fn decode_envelope(memory: &[u8], ptr: u32) -> Result<Response> {
    if ptr == 0 {
        return Err(RuntimeError::Decode("module returned a null envelope pointer".to_string()));
    }
    let text = read_cstring(memory, ptr)?;
    Response::from_json(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Payload;
    use std::collections::HashSet;

    /// Bump-allocated memory for exercising the marshaller without a module.
    struct VecMemory {
        bytes: Vec<u8>,
        next: u32,
        live: HashSet<u32>,
    }

    impl VecMemory {
        fn new(size: usize) -> Self {
            Self {
                bytes: vec![0; size],
                next: 8,
                live: HashSet::new(),
            }
        }
    }

    impl GuestMemory for VecMemory {
        fn data(&self) -> &[u8] {
            &self.bytes
        }

        fn data_mut(&mut self) -> &mut [u8] {
            &mut self.bytes
        }

        fn alloc(&mut self, size: u32) -> Result<u32> {
            let ptr = self.next;
            let end = ptr as usize + size as usize;
            if end > self.bytes.len() {
                return Err(RuntimeError::Memory("out of memory".to_string()));
            }
            self.next = (end as u32 + 7) & !7;
            self.live.insert(ptr);
            Ok(ptr)
        }

        fn dealloc(&mut self, ptr: u32) -> Result<()> {
            if self.live.remove(&ptr) {
                Ok(())
            } else {
                Err(RuntimeError::Memory(format!("double free of {:#x}", ptr)))
            }
        }
    }

    #[test]
    fn test_read_cstring_lengths() {
        let memory = b"\0a\0hello\0".to_vec();
        assert_eq!(read_cstring(&memory, 0).unwrap(), "");
        assert_eq!(read_cstring(&memory, 1).unwrap(), "a");
        assert_eq!(read_cstring(&memory, 3).unwrap(), "hello");
    }

    #[test]
    fn test_read_cstring_stops_at_first_nul() {
        let memory = b"abc\0def\0".to_vec();
        assert_eq!(read_cstring(&memory, 0).unwrap(), "abc");
    }

    #[test]
    fn test_read_cstring_without_terminator() {
        let memory = b"abc".to_vec();
        assert!(matches!(read_cstring(&memory, 0), Err(RuntimeError::Memory(_))));
        assert!(matches!(read_cstring(&memory, 10), Err(RuntimeError::Memory(_))));
    }

    #[test]
    fn test_write_cstring_rejects_interior_nul() {
        let mut memory = VecMemory::new(64);
        let err = write_cstring(&mut memory, "a\0b").unwrap_err();
        assert!(matches!(err, RuntimeError::Encode(_)));
        assert!(memory.live.is_empty());
    }

    #[test]
    fn test_encode_string_array_layout() {
        let mut memory = VecMemory::new(256);
        let array = encode_string_array(&mut memory, &["foo", "let z = [1 3 4];"]).unwrap();
        assert_eq!(array.len(), 2);

        let table = array.base() as usize;
        for (i, expected) in ["foo", "let z = [1 3 4];"].iter().enumerate() {
            let slot = &memory.bytes[table + i * 4..table + i * 4 + 4];
            let ptr = u32::from_le_bytes(slot.try_into().unwrap());
            assert_eq!(Some(ptr), array.get(i));
            assert_eq!(read_cstring(&memory.bytes, ptr).unwrap(), *expected);
        }

        // one buffer per string plus the table
        assert_eq!(memory.live.len(), 3);
        array.free(&mut memory).unwrap();
        assert!(memory.live.is_empty());
    }

    #[test]
    fn test_encode_string_array_cleans_up_on_failure() {
        let mut memory = VecMemory::new(64);
        let err = encode_string_array(&mut memory, &["ok", "bad\0"]).unwrap_err();
        assert!(matches!(err, RuntimeError::Encode(_)));
        assert!(memory.live.is_empty());
    }

    #[test]
    fn test_decode_envelope() {
        let mut memory = VecMemory::new(256);
        let ptr = write_cstring(
            &mut memory,
            r#"{"success":true,"type":"string","out":"success"}"#,
        )
        .unwrap();
        let resp = decode_envelope(&memory.bytes, ptr).unwrap();
        assert!(resp.success);
        assert_eq!(resp.out, Payload::String("success".to_string()));

        assert!(matches!(decode_envelope(&memory.bytes, 0), Err(RuntimeError::Decode(_))));
    }

    #[test]
    fn test_decode_envelope_reports_bad_json() {
        let mut memory = VecMemory::new(64);
        let ptr = write_cstring(&mut memory, "{\"success\":").unwrap();
        assert!(matches!(decode_envelope(&memory.bytes, ptr), Err(RuntimeError::Decode(_))));
    }
}
