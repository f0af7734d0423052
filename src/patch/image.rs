//! Mapped-image import directory walker.
//!
//! Walks the import directory of a PE image *as mapped by the loader* (RVAs
//! are plain offsets, unlike the file layout), producing the per-DLL symbol
//! lists and the IAT slot locations the patch engine rewrites. Every read is
//! bounds-checked against the mapped range — a module whose import directory
//! cannot be parsed is simply left unpatched, so a malformed image must
//! surface as an [`Error`](crate::Error), never as a fault.

use crate::Result;

/// High bit marking an import-by-ordinal thunk (PE32).
const ORDINAL_FLAG32: u32 = 0x8000_0000;
/// High bit marking an import-by-ordinal thunk (PE32+).
const ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;
/// Size of one IMAGE_IMPORT_DESCRIPTOR entry.
const DESCRIPTOR_SIZE: usize = 20;

/// One imported function: identified by name or by ordinal, together with the
/// image-relative address of its IAT slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedSymbol {
    /// Import name, when the symbol is imported by name.
    pub name: Option<String>,
    /// Export ordinal, when the symbol is imported by ordinal.
    pub ordinal: Option<u16>,
    /// RVA of the IAT slot holding the resolved function address.
    pub slot_rva: usize,
}

impl ImportedSymbol {
    /// Whether this import refers to `symbol_name`.
    #[must_use]
    pub fn is_named(&self, symbol_name: &str) -> bool {
        self.name.as_deref() == Some(symbol_name)
    }
}

/// All functions a module imports from one DLL.
#[derive(Debug, Clone)]
pub struct ImportedModule {
    /// Lower-cased name of the exporting DLL.
    pub name: String,
    /// The imported functions, in thunk order.
    pub symbols: Vec<ImportedSymbol>,
}

/// The parsed import directory of one mapped module.
#[derive(Debug, Clone)]
pub struct ImportDirectory {
    /// Per-DLL import lists, in descriptor order.
    pub modules: Vec<ImportedModule>,
    /// Whether the image is PE32+ (8-byte IAT slots) rather than PE32.
    pub is_pe64: bool,
}

impl ImportDirectory {
    /// Size of one IAT slot in this image.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        if self.is_pe64 {
            8
        } else {
            4
        }
    }

    /// Whether the image imports `symbol_name` from `dll_name`
    /// (case-insensitive DLL match).
    #[must_use]
    pub fn imports(&self, dll_name: &str, symbol_name: &str) -> bool {
        self.modules
            .iter()
            .filter(|module| module.name.eq_ignore_ascii_case(dll_name))
            .any(|module| module.symbols.iter().any(|sym| sym.is_named(symbol_name)))
    }
}

fn read_u16(image: &[u8], offset: usize) -> Result<u16> {
    let bytes = image
        .get(offset..offset + 2)
        .ok_or(crate::Error::OutOfBounds)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(image: &[u8], offset: usize) -> Result<u32> {
    let bytes = image
        .get(offset..offset + 4)
        .ok_or(crate::Error::OutOfBounds)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(image: &[u8], offset: usize) -> Result<u64> {
    let bytes = image
        .get(offset..offset + 8)
        .ok_or(crate::Error::OutOfBounds)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

fn read_cstr(image: &[u8], offset: usize) -> Result<String> {
    let tail = image.get(offset..).ok_or(crate::Error::OutOfBounds)?;
    let end = tail
        .iter()
        .position(|&byte| byte == 0)
        .ok_or(crate::Error::OutOfBounds)?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

/// Parses the import directory of a loader-mapped PE image.
///
/// `image` must cover the module from its base address; RVAs are resolved as
/// direct offsets. An image without an import directory yields an empty
/// module list.
///
/// # Errors
///
/// [`Error::Malformed`](crate::Error::Malformed) when the DOS/NT headers are
/// not PE, [`Error::NotSupported`](crate::Error::NotSupported) for an unknown
/// optional-header magic, [`Error::OutOfBounds`](crate::Error::OutOfBounds)
/// when a directory entry points outside the mapped range.
pub fn parse_mapped(image: &[u8]) -> Result<ImportDirectory> {
    if read_u16(image, 0)? != u16::from_le_bytes(*b"MZ") {
        return Err(malformed_error!("missing DOS signature"));
    }
    let nt_offset = read_u32(image, 0x3C)? as usize;
    if read_u32(image, nt_offset)? != 0x0000_4550 {
        return Err(malformed_error!("missing PE signature at {:#x}", nt_offset));
    }

    let optional_offset = nt_offset + 24;
    let (is_pe64, directories_offset) = match read_u16(image, optional_offset)? {
        0x010B => (false, optional_offset + 96),
        0x020B => (true, optional_offset + 112),
        magic => {
            log::debug!("unsupported optional header magic {magic:#x}");
            return Err(crate::Error::NotSupported);
        }
    };

    let directory_count = read_u32(image, optional_offset + if is_pe64 { 108 } else { 92 })?;
    if directory_count < 2 {
        // No import directory entry at all.
        return Ok(ImportDirectory {
            modules: Vec::new(),
            is_pe64,
        });
    }

    let import_rva = read_u32(image, directories_offset + 8)? as usize;
    if import_rva == 0 {
        return Ok(ImportDirectory {
            modules: Vec::new(),
            is_pe64,
        });
    }

    let mut modules = Vec::new();
    let mut descriptor = import_rva;
    loop {
        let lookup_rva = read_u32(image, descriptor)? as usize;
        let name_rva = read_u32(image, descriptor + 12)? as usize;
        let iat_rva = read_u32(image, descriptor + 16)? as usize;
        if lookup_rva == 0 && name_rva == 0 && iat_rva == 0 {
            break;
        }

        let name = read_cstr(image, name_rva)?.to_lowercase();
        // The lookup table is the unpatched template; fall back to the IAT
        // for bound images that dropped it.
        let thunks_rva = if lookup_rva != 0 { lookup_rva } else { iat_rva };

        let mut symbols = Vec::new();
        let mut index = 0;
        loop {
            let (raw, by_ordinal, hint_rva) = if is_pe64 {
                let raw = read_u64(image, thunks_rva + index * 8)?;
                (raw, raw & ORDINAL_FLAG64 != 0, (raw & 0x7FFF_FFFF) as usize)
            } else {
                let raw = read_u32(image, thunks_rva + index * 4)?;
                (
                    u64::from(raw),
                    raw & ORDINAL_FLAG32 != 0,
                    (raw & 0x7FFF_FFFF) as usize,
                )
            };
            if raw == 0 {
                break;
            }

            let slot_rva = iat_rva + index * if is_pe64 { 8 } else { 4 };
            if by_ordinal {
                symbols.push(ImportedSymbol {
                    name: None,
                    ordinal: Some((raw & 0xFFFF) as u16),
                    slot_rva,
                });
            } else {
                // Skip the two-byte hint preceding the import name.
                symbols.push(ImportedSymbol {
                    name: Some(read_cstr(image, hint_rva + 2)?),
                    ordinal: None,
                    slot_rva,
                });
            }
            index += 1;
        }

        modules.push(ImportedModule { name, symbols });
        descriptor += DESCRIPTOR_SIZE;
    }

    Ok(ImportDirectory { modules, is_pe64 })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn put_u16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(image: &mut [u8], offset: usize, value: u64) {
        image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds a minimal mapped PE32+ image importing `HeapAlloc` and
    /// `HeapFree` by name plus ordinal 42 from kernel32.dll.
    pub(crate) fn synthetic_pe64() -> Vec<u8> {
        let mut image = vec![0u8; 0x1000];

        // DOS header
        put_u16(&mut image, 0, u16::from_le_bytes(*b"MZ"));
        put_u32(&mut image, 0x3C, 0x80); // e_lfanew

        // NT headers at 0x80
        put_u32(&mut image, 0x80, 0x0000_4550); // "PE\0\0"
        put_u16(&mut image, 0x80 + 4, 0x8664); // machine: x64
        put_u16(&mut image, 0x80 + 24, 0x020B); // optional magic: PE32+
        put_u32(&mut image, 0x80 + 24 + 108, 16); // NumberOfRvaAndSizes
        // Import directory entry (index 1) at directories + 8
        put_u32(&mut image, 0x80 + 24 + 112 + 8, 0x200); // rva
        put_u32(&mut image, 0x80 + 24 + 112 + 12, 2 * 20); // size

        // Import descriptor at 0x200
        put_u32(&mut image, 0x200, 0x300); // OriginalFirstThunk (ILT)
        put_u32(&mut image, 0x200 + 12, 0x400); // Name
        put_u32(&mut image, 0x200 + 16, 0x500); // FirstThunk (IAT)
        // terminator descriptor at 0x214 is already zero

        // ILT at 0x300: name thunk, name thunk, ordinal thunk, terminator
        put_u64(&mut image, 0x300, 0x600);
        put_u64(&mut image, 0x308, 0x620);
        put_u64(&mut image, 0x310, ORDINAL_FLAG64 | 42);

        // DLL name at 0x400
        image[0x400..0x40D].copy_from_slice(b"KERNEL32.dll\0");

        // Hint/name entries (2-byte hint + name)
        image[0x600..0x602].copy_from_slice(&[0, 0]);
        image[0x602..0x60C].copy_from_slice(b"HeapAlloc\0");
        image[0x620..0x622].copy_from_slice(&[0, 0]);
        image[0x622..0x62B].copy_from_slice(b"HeapFree\0");

        // IAT slots at 0x500 hold resolved addresses at runtime.
        put_u64(&mut image, 0x500, 0x7FF8_0000_1000);
        put_u64(&mut image, 0x508, 0x7FF8_0000_2000);
        put_u64(&mut image, 0x510, 0x7FF8_0000_3000);

        image
    }

    #[test]
    fn test_parse_synthetic_image() {
        let image = synthetic_pe64();
        let directory = parse_mapped(&image).unwrap();
        assert!(directory.is_pe64);
        assert_eq!(directory.slot_size(), 8);
        assert_eq!(directory.modules.len(), 1);

        let module = &directory.modules[0];
        assert_eq!(module.name, "kernel32.dll");
        assert_eq!(module.symbols.len(), 3);
        assert_eq!(module.symbols[0].name.as_deref(), Some("HeapAlloc"));
        assert_eq!(module.symbols[0].slot_rva, 0x500);
        assert_eq!(module.symbols[1].name.as_deref(), Some("HeapFree"));
        assert_eq!(module.symbols[1].slot_rva, 0x508);
        assert_eq!(module.symbols[2].ordinal, Some(42));
        assert_eq!(module.symbols[2].slot_rva, 0x510);
    }

    #[test]
    fn test_imports_lookup() {
        let directory = parse_mapped(&synthetic_pe64()).unwrap();
        assert!(directory.imports("kernel32.DLL", "HeapAlloc"));
        assert!(!directory.imports("kernel32.dll", "HeapDestroy"));
        assert!(!directory.imports("user32.dll", "HeapAlloc"));
    }

    #[test]
    fn test_not_a_pe_image() {
        assert!(matches!(
            parse_mapped(&[0u8; 0x100]),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_truncated_image_is_out_of_bounds() {
        let mut image = synthetic_pe64();
        image.truncate(0x300);
        assert!(matches!(
            parse_mapped(&image),
            Err(crate::Error::OutOfBounds)
        ));
    }

    #[test]
    fn test_image_without_imports() {
        let mut image = synthetic_pe64();
        // Clear the import directory entry.
        put_u32(&mut image, 0x80 + 24 + 112 + 8, 0);
        let directory = parse_mapped(&image).unwrap();
        assert!(directory.modules.is_empty());
    }
}
