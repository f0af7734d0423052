//! C-runtime debug-header detection.
//!
//! Debug builds of the C runtime prepend a bookkeeping header (and append a
//! small no-man's-land gap) to every allocation. Blocks tracked through the
//! raw heap interface therefore carry the header *inside* the tracked bytes;
//! the reporter peels it off so leaks show the user's address and size, and
//! uses the header's use-type tag to skip blocks the runtime itself frees
//! after the detector tears down.
//!
//! Detection is heuristic: a header is accepted only when its use-type tag is
//! structurally valid *and* its size field is self-consistent with the
//! tracked allocation size (`header + data + gap == tracked`). Two layouts
//! exist — the classic debug CRT swaps the size/use field order on 32-bit
//! relative to the Universal CRT; on 64-bit the layouts coincide and the
//! classic flavor is reported.

use strum::Display;

use crate::ledger::CrtFlavor;

/// Trailing no-man's-land bytes after the user data.
pub const CRT_GAP_SIZE: usize = 4;

const PTR: usize = std::mem::size_of::<usize>();

/// Total header size preceding the user data (both layouts, both widths).
pub const CRT_HEADER_SIZE: usize = 4 * PTR + 16;

/// Use-type tag carried in a CRT debug header's low 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CrtBlockUse {
    /// Freed block kept on the debug heap's free list.
    #[strum(serialize = "free")]
    Free,
    /// Ordinary application allocation.
    #[strum(serialize = "normal")]
    Normal,
    /// Block used internally by the C runtime.
    #[strum(serialize = "crt-internal")]
    CrtInternal,
    /// Block explicitly excluded from leak tracking by the application.
    #[strum(serialize = "ignore")]
    Ignore,
    /// Client-defined block type.
    #[strum(serialize = "client")]
    Client,
}

impl CrtBlockUse {
    /// Decodes the low 16 bits of a raw use field. Invalid tags yield `None`.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw & 0xFFFF {
            0 => Some(CrtBlockUse::Free),
            1 => Some(CrtBlockUse::Normal),
            2 => Some(CrtBlockUse::CrtInternal),
            3 => Some(CrtBlockUse::Ignore),
            4 => Some(CrtBlockUse::Client),
            _ => None,
        }
    }

    /// Whether the runtime owns this block and will free it after the
    /// detector is gone — such blocks are never leaks.
    #[must_use]
    pub fn is_runtime_owned(&self) -> bool {
        matches!(self, CrtBlockUse::Free | CrtBlockUse::CrtInternal)
    }
}

/// A validated CRT debug header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtHeaderInfo {
    /// Which header layout matched.
    pub flavor: CrtFlavor,
    /// The block's use-type tag.
    pub block_use: CrtBlockUse,
    /// Offset of the user data inside the tracked block.
    pub data_offset: usize,
    /// Size of the user data in bytes.
    pub data_size: usize,
    /// The CRT's own allocation request number.
    pub request: u32,
}

fn read_u32(block: &[u8], offset: usize) -> Option<u32> {
    let bytes = block.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_usize(block: &[u8], offset: usize) -> Option<usize> {
    let bytes = block.get(offset..offset + PTR)?;
    let mut raw = [0u8; PTR];
    raw.copy_from_slice(bytes);
    Some(usize::from_le_bytes(raw))
}

/// Field offsets of the `use` and `size` members for one layout.
///
/// Common prefix: next, prev, file (pointers) and a 32-bit line number. The
/// classic 32-bit layout stores size before use; everything else stores use
/// before size.
fn field_offsets(flavor: CrtFlavor) -> (usize, usize) {
    let after_line = 3 * PTR + 4;
    match flavor {
        CrtFlavor::Static if PTR == 4 => (after_line + 4, after_line),
        _ => (after_line, after_line + 4),
    }
}

/// Validates a candidate CRT debug header at the start of `block` (the full
/// tracked allocation).
///
/// Tries the classic layout first, then the Universal CRT layout, accepting
/// the first whose use-type tag is valid and whose size field satisfies
/// `header + data + gap == block.len()`.
#[must_use]
pub fn detect(block: &[u8]) -> Option<CrtHeaderInfo> {
    if block.len() < CRT_HEADER_SIZE + CRT_GAP_SIZE {
        return None;
    }

    for flavor in [CrtFlavor::Static, CrtFlavor::Universal] {
        let (use_off, size_off) = field_offsets(flavor);
        let Some(raw_use) = read_u32(block, use_off) else {
            continue;
        };
        let Some(data_size) = read_usize(block, size_off) else {
            continue;
        };
        let Some(block_use) = CrtBlockUse::from_raw(raw_use) else {
            continue;
        };
        if CRT_HEADER_SIZE
            .checked_add(data_size)
            .and_then(|total| total.checked_add(CRT_GAP_SIZE))
            != Some(block.len())
        {
            continue;
        }
        let request = read_u32(block, 3 * PTR + 8 + PTR).unwrap_or(0);
        return Some(CrtHeaderInfo {
            flavor,
            block_use,
            data_offset: CRT_HEADER_SIZE,
            data_size,
            request,
        });
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a tracked block wrapping `data` in a synthetic debug header
    /// using the use-before-size layout shared by the Universal CRT (and the
    /// 64-bit classic CRT).
    pub(crate) fn wrapped_block(raw_use: u32, data: &[u8]) -> Vec<u8> {
        let mut block = vec![0u8; CRT_HEADER_SIZE + data.len() + CRT_GAP_SIZE];
        let (use_off, size_off) = field_offsets(CrtFlavor::Universal);
        block[use_off..use_off + 4].copy_from_slice(&raw_use.to_le_bytes());
        block[size_off..size_off + PTR].copy_from_slice(&data.len().to_le_bytes());
        let request_off = 3 * PTR + 8 + PTR;
        block[request_off..request_off + 4].copy_from_slice(&77u32.to_le_bytes());
        block[CRT_HEADER_SIZE..CRT_HEADER_SIZE + data.len()].copy_from_slice(data);
        block
    }

    #[test]
    fn test_detect_normal_block() {
        let block = wrapped_block(1, b"leaked contents");
        let header = detect(&block).unwrap();
        assert_eq!(header.block_use, CrtBlockUse::Normal);
        assert_eq!(header.data_offset, CRT_HEADER_SIZE);
        assert_eq!(header.data_size, 15);
        assert_eq!(header.request, 77);
        assert!(!header.block_use.is_runtime_owned());
    }

    #[test]
    fn test_detect_runtime_owned_blocks() {
        let free = detect(&wrapped_block(0, b"x")).unwrap();
        assert!(free.block_use.is_runtime_owned());
        let internal = detect(&wrapped_block(2, b"x")).unwrap();
        assert!(internal.block_use.is_runtime_owned());
    }

    #[test]
    fn test_invalid_use_tag_rejected() {
        assert!(detect(&wrapped_block(9, b"data")).is_none());
    }

    #[test]
    fn test_inconsistent_size_rejected() {
        let mut block = wrapped_block(1, b"data");
        // Grow the block so header + data + gap no longer matches.
        block.push(0);
        assert!(detect(&block).is_none());
    }

    #[test]
    fn test_plain_block_not_detected() {
        // Plausible sizes but garbage where the header fields would be.
        let block = vec![0xABu8; CRT_HEADER_SIZE + 16 + CRT_GAP_SIZE];
        assert!(detect(&block).is_none());
    }

    #[test]
    fn test_too_small_block() {
        assert!(detect(&[0u8; 8]).is_none());
    }
}
