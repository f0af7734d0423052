//! Small helpers shared across the crate: the stable CRC-32 used for leak
//! hashes and the hex/ASCII dump formatting for leaked block contents.

/// Width of one hex dump row in bytes.
const DUMP_ROW: usize = 16;

/// Computes a CRC-32 (IEEE polynomial, bit-reflected) over `data`, continuing
/// from `seed`.
///
/// Leak hashes must stay stable across runs and across machines so CI jobs can
/// diff reports; this is the same polynomial the classic tooling uses, so
/// hashes remain comparable with historical reports.
pub(crate) fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut crc = !seed;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Derives the report hash for a leak from its byte size and call-stack hash.
///
/// Frame addresses are randomized between runs, so the stack hash alone is not
/// stable; mixing in the size keeps distinct leaks with a shared prefix apart.
pub(crate) fn leak_hash(size: usize, stack_hash: u32) -> u32 {
    let mut bytes = [0u8; std::mem::size_of::<usize>() + 4];
    bytes[..std::mem::size_of::<usize>()].copy_from_slice(&size.to_le_bytes());
    bytes[std::mem::size_of::<usize>()..].copy_from_slice(&stack_hash.to_le_bytes());
    crc32(0, &bytes)
}

/// Formats `data` (clamped to `limit` bytes) as rows of 16 hex bytes followed
/// by their printable ASCII representation.
pub(crate) fn hex_dump_lines(data: &[u8], limit: usize) -> Vec<String> {
    let data = &data[..data.len().min(limit)];
    let mut lines = Vec::with_capacity(data.len().div_ceil(DUMP_ROW));

    for row in data.chunks(DUMP_ROW) {
        let mut hex = String::with_capacity(DUMP_ROW * 3);
        for (index, byte) in row.iter().enumerate() {
            if index > 0 {
                hex.push(' ');
            }
            hex.push_str(&format!("{byte:02X}"));
        }

        let ascii: String = row
            .iter()
            .map(|&byte| {
                if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                }
            })
            .collect();

        lines.push(format!("    {hex:<47}  {ascii}"));
    }

    lines
}
