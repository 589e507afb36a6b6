//! Little-endian read helpers shared by the binary format readers.

use std::io::Read;
use std::path::Path;

use crate::error::{BloomTreeError, Result};

/// Read a little-endian u32, attaching path context to I/O failures.
pub(crate) fn read_u32<R: Read>(reader: &mut R, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| BloomTreeError::io(path, "read", e))?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian u64, attaching path context to I/O failures.
pub(crate) fn read_u64<R: Read>(reader: &mut R, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| BloomTreeError::io(path, "read", e))?;
    Ok(u64::from_le_bytes(buf))
}

/// Read exactly `len` bytes, attaching path context to I/O failures.
pub(crate) fn read_bytes<R: Read>(reader: &mut R, path: &Path, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|e| BloomTreeError::io(path, "read", e))?;
    Ok(buf)
}
