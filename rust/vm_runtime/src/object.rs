//! Object files: memory images with a small self-describing header.
//!
//! ```text
//! [#!interpreter line\n]  optional, skipped on load
//! "MIT\0\0\0"             magic
//! endianness: u8          0 little, 1 big
//! word size: u8           bytes per word
//! length: word            image length in words
//! data                    length words
//! ```
//!
//! Images are only accepted in the host's own byte order and word size.  A
//! load reads and validates the whole image before any byte of memory is
//! written.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::bytecode::{UWord, Word, WORD_BYTES};
use crate::interpreter::Machine;
use crate::memory::Width;

pub const MAGIC: [u8; 6] = *b"MIT\0\0\0";

const LITTLE_ENDIAN: u8 = 0;
const BIG_ENDIAN: u8 = 1;

/// Endianness byte written for this host.
pub const fn native_endianness() -> u8 {
    if cfg!(target_endian = "big") {
        BIG_ENDIAN
    } else {
        LITTLE_ENDIAN
    }
}

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("address range {address:#x}+{len} is not valid for this image")]
    InvalidAddressRange { address: UWord, len: u64 },
    #[error("object header is invalid")]
    HeaderInvalid,
    #[error("object data is truncated")]
    Truncated,
    #[error("object I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("object byte order does not match this machine")]
    WrongEndianness,
    #[error("object word size {0} does not match this machine")]
    WrongWordSize(u8),
}

impl ObjectError {
    pub fn code(&self) -> Word {
        match self {
            ObjectError::InvalidAddressRange { .. } => -1,
            ObjectError::HeaderInvalid => -2,
            ObjectError::Truncated | ObjectError::Io(_) => -3,
            ObjectError::WrongEndianness => -4,
            ObjectError::WrongWordSize(_) => -5,
        }
    }
}

fn read_header_bytes<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<(), ObjectError> {
    reader.read_exact(buffer).map_err(|error| match error.kind() {
        io::ErrorKind::UnexpectedEof => ObjectError::HeaderInvalid,
        _ => ObjectError::Io(error),
    })
}

/// Read a header, returning the image length in words.
pub fn read_header<R: Read>(reader: &mut R) -> Result<u64, ObjectError> {
    let mut magic = [0u8; MAGIC.len()];
    read_header_bytes(reader, &mut magic[..2])?;
    if &magic[..2] == b"#!" {
        let mut byte = [0u8];
        loop {
            read_header_bytes(reader, &mut byte)?;
            if byte[0] == b'\n' {
                break;
            }
        }
        read_header_bytes(reader, &mut magic)?;
    } else {
        read_header_bytes(reader, &mut magic[2..])?;
    }
    if magic != MAGIC {
        return Err(ObjectError::HeaderInvalid);
    }

    let mut format = [0u8; 2];
    read_header_bytes(reader, &mut format)?;
    let [endianness, word_size] = format;
    if endianness != LITTLE_ENDIAN && endianness != BIG_ENDIAN {
        return Err(ObjectError::HeaderInvalid);
    }
    if endianness != native_endianness() {
        return Err(ObjectError::WrongEndianness);
    }
    if word_size as usize != WORD_BYTES {
        return Err(ObjectError::WrongWordSize(word_size));
    }

    let mut length = [0u8; WORD_BYTES];
    read_header_bytes(reader, &mut length)?;
    Ok(UWord::from_ne_bytes(length))
}

/// Write a header and `data`, which must be a whole number of words.
pub fn write_object<W: Write>(mut writer: W, data: &[u8]) -> Result<(), ObjectError> {
    if data.len() % WORD_BYTES != 0 {
        return Err(ObjectError::InvalidAddressRange {
            address: 0,
            len: data.len() as u64,
        });
    }
    writer.write_all(&MAGIC)?;
    writer.write_all(&[native_endianness(), WORD_BYTES as u8])?;
    writer.write_all(&((data.len() / WORD_BYTES) as UWord).to_ne_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

impl Machine {
    /// Load an object image at `address`, returning its length in words.
    pub fn load_object<R: Read>(
        &mut self,
        address: UWord,
        mut reader: R,
    ) -> Result<usize, ObjectError> {
        let words = read_header(&mut reader)?;
        let bytes = words
            .checked_mul(WORD_BYTES as u64)
            .ok_or(ObjectError::HeaderInvalid)?;
        let range_error = ObjectError::InvalidAddressRange { address, len: bytes };
        let Ok(len) = usize::try_from(bytes) else {
            return Err(range_error);
        };
        if !Width::Eight.is_aligned(address) || self.memory.check_write(address, len).is_err() {
            return Err(range_error);
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).map_err(|error| match error.kind() {
            io::ErrorKind::UnexpectedEof => ObjectError::Truncated,
            _ => ObjectError::Io(error),
        })?;
        self.memory
            .slice_mut(address, len)
            .map_err(|_| ObjectError::InvalidAddressRange { address, len: bytes })?
            .copy_from_slice(&data);
        Ok(len / WORD_BYTES)
    }

    /// Save `len` bytes of memory from `address` as an object image.
    pub fn save_object<W: Write>(
        &self,
        address: UWord,
        len: usize,
        writer: W,
    ) -> Result<(), ObjectError> {
        let range_error = ObjectError::InvalidAddressRange {
            address,
            len: len as u64,
        };
        if !Width::Eight.is_aligned(address) || len % WORD_BYTES != 0 {
            return Err(range_error);
        }
        let data = self.memory.slice(address, len).map_err(|_| range_error)?;
        write_object(writer, data)
    }

    /// Save the whole of memory.
    pub fn dump_core<W: Write>(&self, writer: W) -> Result<(), ObjectError> {
        let len = self.memory.size() / WORD_BYTES * WORD_BYTES;
        self.save_object(0, len, writer)
    }
}
