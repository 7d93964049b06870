use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

// Offsets into the x86 Linux boot protocol setup header.
const HDRS_MAGIC_OFFSET: usize = 0x202;
const PROTOCOL_OFFSET: usize = 0x206;
const KERNEL_VERSION_OFFSET: usize = 0x20e;
/// The kernel_version field points at the banner string minus 0x200.
const KERNEL_VERSION_BASE: usize = 0x200;

/// Best-effort kernel version discovery from a bzImage boot header.
///
/// Returns `None` when the image does not carry a readable version string;
/// callers treat that as "omit the .uname section".
pub fn discover_kernel_version(kernel: &Path) -> Result<Option<String>> {
    let data =
        fs::read(kernel).with_context(|| format!("Failed to read kernel image {kernel:?}"))?;
    Ok(version_from_bzimage(&data))
}

fn version_from_bzimage(data: &[u8]) -> Option<String> {
    if data.get(HDRS_MAGIC_OFFSET..HDRS_MAGIC_OFFSET + 4) != Some(b"HdrS".as_slice()) {
        return None;
    }

    let protocol = read_u16(data, PROTOCOL_OFFSET)?;
    if protocol < 0x200 {
        return None;
    }

    let pointer = read_u16(data, KERNEL_VERSION_OFFSET)? as usize;
    if pointer == 0 {
        return None;
    }

    let banner = data.get(pointer + KERNEL_VERSION_BASE..)?;
    let end = banner.iter().position(|&b| b == 0)?;
    let banner = std::str::from_utf8(&banner[..end]).ok()?;

    // The banner reads like "6.6.8 (builder@host) #1 SMP ...", the version
    // proper is the first token.
    let version = banner.split_whitespace().next()?;
    (!version.is_empty()).then(|| version.to_string())
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}
