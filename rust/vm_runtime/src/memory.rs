//! Memory subsystem for the Mit VM runtime.
//!
//! Memory is a flat, byte-addressable buffer owned by a single machine.  There
//! is no paging and no protection beyond bounds checks: every access is
//! validated against the current size, and wider accesses must also be
//! naturally aligned.  All checks happen before any byte is written so that a
//! failing instruction leaves memory exactly as it found it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::{UWord, Word, WORD_BYTES};

/// Default memory size applied when the caller does not pick one (1 MiB).
pub const DEFAULT_MEMORY_BYTES: usize = 1024 * 1024;

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    One,
    Two,
    Four,
    Eight,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Width::One => 1,
            Width::Two => 2,
            Width::Four => 4,
            Width::Eight => WORD_BYTES,
        }
    }

    /// Whether `address` is a multiple of the access width.
    #[inline]
    pub const fn is_aligned(self, address: UWord) -> bool {
        address & (self.bytes() as UWord - 1) == 0
    }
}

/// Flat byte memory with bounds and alignment checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Grow the buffer to `size` bytes, zero-filling the new tail.  Shrinking
    /// is never performed.
    pub fn grow(&mut self, size: usize) {
        if size > self.bytes.len() {
            self.bytes.resize(size, 0);
        }
    }

    /// Validate a write of `len` bytes starting at `address`.
    pub fn check_write(&self, address: UWord, len: usize) -> Result<(), MemoryError> {
        self.range(address, len)
            .map(|_| ())
            .ok_or_else(|| MemoryError::write_past(address, len))
    }

    /// Borrow `len` bytes at `address`.
    pub fn slice(&self, address: UWord, len: usize) -> Result<&[u8], MemoryError> {
        let range = self
            .range(address, len)
            .ok_or(MemoryError::InvalidRead { address })?;
        Ok(&self.bytes[range])
    }

    /// Mutably borrow `len` bytes at `address`.
    pub fn slice_mut(&mut self, address: UWord, len: usize) -> Result<&mut [u8], MemoryError> {
        let range = self
            .range(address, len)
            .ok_or_else(|| MemoryError::write_past(address, len))?;
        Ok(&mut self.bytes[range])
    }

    /// Load a zero-extended value of the given width.
    pub fn load(&self, address: UWord, width: Width) -> Result<Word, MemoryError> {
        if !width.is_aligned(address) {
            return Err(MemoryError::Unaligned { address });
        }
        let bytes = self.slice(address, width.bytes())?;
        let value = match width {
            Width::One => bytes[0] as Word,
            Width::Two => u16::from_ne_bytes([bytes[0], bytes[1]]) as Word,
            Width::Four => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as Word,
            Width::Eight => {
                let mut word = [0u8; WORD_BYTES];
                word.copy_from_slice(bytes);
                Word::from_ne_bytes(word)
            }
        };
        Ok(value)
    }

    /// Store the low `width` bytes of `value`.
    pub fn store(&mut self, address: UWord, width: Width, value: Word) -> Result<(), MemoryError> {
        if !width.is_aligned(address) {
            return Err(MemoryError::Unaligned { address });
        }
        let bytes = self.slice_mut(address, width.bytes())?;
        match width {
            Width::One => bytes[0] = value as u8,
            Width::Two => bytes.copy_from_slice(&(value as u16).to_ne_bytes()),
            Width::Four => bytes.copy_from_slice(&(value as u32).to_ne_bytes()),
            Width::Eight => bytes.copy_from_slice(&value.to_ne_bytes()),
        }
        Ok(())
    }

    #[inline]
    pub fn load_word(&self, address: UWord) -> Result<Word, MemoryError> {
        self.load(address, Width::Eight)
    }

    #[inline]
    pub fn store_word(&mut self, address: UWord, value: Word) -> Result<(), MemoryError> {
        self.store(address, Width::Eight, value)
    }

    fn range(&self, address: UWord, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(address).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

/// Memory level errors bubbled up to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("invalid memory read at {address:#x}")]
    InvalidRead { address: UWord },
    #[error("invalid memory write at {address:#x}")]
    InvalidWrite {
        address: UWord,
        /// End of the attempted write when a larger memory would accept it.
        end: Option<UWord>,
    },
    #[error("unaligned address {address:#x}")]
    Unaligned { address: UWord },
}

impl MemoryError {
    /// A write of `len` bytes at `address` that does not fit.
    pub fn write_past(address: UWord, len: usize) -> Self {
        MemoryError::InvalidWrite {
            address,
            end: address.checked_add(len as UWord),
        }
    }

    /// The offending address, reported through the `bad` register.
    pub fn address(&self) -> UWord {
        match self {
            MemoryError::InvalidRead { address }
            | MemoryError::InvalidWrite { address, .. }
            | MemoryError::Unaligned { address } => *address,
        }
    }
}
