//! SPIR-V loading.

use crate::error::{ComputeError, Result};
use std::io;
use std::path::Path;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V binary from disk as 32-bit words.
///
/// The words live in a `Vec<u32>`, so the code pointer handed to Vulkan is
/// always 4-byte aligned regardless of how the file was read.
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ComputeError::FileNotFound(path.to_path_buf()));
    }

    let bytes = std::fs::read(path).map_err(|source| ComputeError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    spirv_words(&bytes).map_err(|source| ComputeError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Decode little-endian SPIR-V bytes into words.
pub fn spirv_words(bytes: &[u8]) -> io::Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("SPIR-V length {} is not a multiple of 4", bytes.len()),
        ));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad SPIR-V magic number {other:#010x}"),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty SPIR-V module",
        )),
    }
}
