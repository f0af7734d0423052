//! x86 (32-bit) loader-detour backend.
//!
//! The 32-bit loader pushes the entry point's parameters onto the stack and
//! calls the entry through a frame slot:
//!
//! ```text
//! FF 75 14       push [ebp+14h]   ; last-pushed parameter
//! ...
//! FF 55 08       call [ebp+08h]   ; entry point
//! ```
//!
//! The synthesized detour pushes `[ebp+08h]` (the entry point, becoming the
//! intercept routine's extra last argument), replays the original parameter
//! pushes, loads the intercept routine into `eax` and jumps back to the
//! patched call site, which now reads `call eax`.

use crate::{
    detour::{find_zero_run, DetourPlan, CALL_LEN, JMP_LEN, SCAN_WINDOW},
    Error, Result,
};

/// push [ebp+08h]
const PUSH_ENTRY: [u8; 3] = [0xFF, 0x75, 0x08];
/// nop + mov eax, imm32
const MOV_EAX_IMM_LEN: usize = 6;

fn find_pattern(window: &[u8], pattern: &[u8; 3]) -> Option<usize> {
    for back in 1..SCAN_WINDOW.min(window.len()) {
        let offset = window.len() - back;
        if window[offset..].len() >= 3 && window[offset..offset + 3] == pattern[..] {
            return Some(back);
        }
    }
    None
}

/// Distance back from the return address to `push [ebp+14h]`, the first of
/// the entry point's parameter pushes.
fn find_param_site(window: &[u8]) -> Option<usize> {
    find_pattern(window, &[0xFF, 0x75, 0x14])
}

/// Distance back from the return address to `call [ebp+08h]`.
fn find_call_site(window: &[u8]) -> Option<usize> {
    find_pattern(window, &[0xFF, 0x55, 0x08])
}

/// Computes the 32-bit loader detour. See [`crate::detour::build_plan`].
///
/// # Errors
///
/// [`Error::PatternNotFound`] when a signature or the detour region is
/// missing.
pub fn build_plan(
    window: &[u8],
    return_addr: usize,
    region: &[u8],
    intercept: usize,
) -> Result<DetourPlan> {
    let param_back = find_param_site(window).ok_or(Error::PatternNotFound("x86 parameter push"))?;
    let call_back = find_call_site(window).ok_or(Error::PatternNotFound("x86 entry call"))?;
    if call_back >= param_back || param_back < JMP_LEN + CALL_LEN {
        return Err(Error::PatternNotFound("x86 patch window too small"));
    }

    let patch_len = param_back;
    let param_len = param_back - call_back;
    let patch_addr = return_addr - param_back;
    let params_src = &window[window.len() - param_back..window.len() - call_back];

    let detour_len = PUSH_ENTRY.len() + param_len + MOV_EAX_IMM_LEN + JMP_LEN;
    let detour_offset =
        find_zero_run(region, detour_len).ok_or(Error::PatternNotFound("x86 detour region"))?;
    let detour_addr = return_addr + detour_offset;

    // Detour: entry point pushed as the extra (last) argument, replayed
    // parameter pushes, intercept into eax, jump back to the rewritten call
    // site.
    let mut detour_bytes = Vec::with_capacity(detour_len);
    detour_bytes.extend_from_slice(&PUSH_ENTRY);
    detour_bytes.extend_from_slice(params_src);
    detour_bytes.push(0x90);
    detour_bytes.push(0xB8);
    detour_bytes.extend_from_slice(&(intercept as u32).to_le_bytes());

    let resume = return_addr - CALL_LEN;
    let jmp_back = resume.wrapping_sub(detour_addr + detour_len) as u32;
    detour_bytes.push(0xE9);
    detour_bytes.extend_from_slice(&jmp_back.to_le_bytes());
    debug_assert_eq!(detour_bytes.len(), detour_len);

    // Patch site: NOP slide, jump into the detour, call eax on return.
    let mut patch_bytes = vec![0x90u8; patch_len];
    let jmp_at = patch_len - JMP_LEN - CALL_LEN;
    patch_bytes[jmp_at] = 0xE9;
    let jmp_in = detour_addr.wrapping_sub(resume) as u32;
    patch_bytes[jmp_at + 1..jmp_at + 5].copy_from_slice(&jmp_in.to_le_bytes());
    patch_bytes[patch_len - 2] = 0xFF;
    patch_bytes[patch_len - 1] = 0xD0;

    Ok(DetourPlan {
        patch_addr,
        patch_bytes,
        backup: window[window.len() - patch_len..].to_vec(),
        detour_addr,
        detour_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETURN_ADDR: usize = 0x77E0_1040;
    const INTERCEPT: usize = 0x1000_2000;

    /// Window ending in the three parameter pushes and the entry call.
    fn loader_window() -> Vec<u8> {
        let mut window = vec![0xCCu8; SCAN_WINDOW];
        let tail = [
            0xFF, 0x75, 0x14, // push [ebp+14h]
            0xFF, 0x75, 0x10, // push [ebp+10h]
            0xFF, 0x75, 0x0C, // push [ebp+0Ch]
            0xFF, 0x55, 0x08, // call [ebp+08h]
        ];
        let at = window.len() - tail.len();
        window[at..].copy_from_slice(&tail);
        window
    }

    fn region_with_padding() -> Vec<u8> {
        let mut region = vec![0xCCu8; 0x80];
        for byte in &mut region[0x60..] {
            *byte = 0;
        }
        region
    }

    #[test]
    fn test_signature_scan() {
        let window = loader_window();
        assert_eq!(find_param_site(&window), Some(12));
        assert_eq!(find_call_site(&window), Some(3));
    }

    #[test]
    fn test_plan_layout() {
        let plan =
            build_plan(&loader_window(), RETURN_ADDR, &region_with_padding(), INTERCEPT).unwrap();

        assert_eq!(plan.patch_addr, RETURN_ADDR - 12);
        assert_eq!(plan.patch_bytes.len(), 12);
        assert_eq!(plan.detour_addr, RETURN_ADDR + 0x60);

        // Detour: push entry (3) + replayed pushes (9) + nop/mov eax (6) + jmp (5).
        assert_eq!(plan.detour_bytes.len(), 23);
        assert_eq!(&plan.detour_bytes[..3], &PUSH_ENTRY);
        assert_eq!(
            &plan.detour_bytes[3..12],
            &loader_window()[SCAN_WINDOW - 12..SCAN_WINDOW - 3]
        );
        assert_eq!(&plan.detour_bytes[12..14], &[0x90, 0xB8]);
        assert_eq!(
            u32::from_le_bytes(plan.detour_bytes[14..18].try_into().unwrap()),
            INTERCEPT as u32
        );

        assert_eq!(plan.detour_bytes[18], 0xE9);
        let rel = u32::from_le_bytes(plan.detour_bytes[19..23].try_into().unwrap());
        let resume = (plan.detour_addr + 23).wrapping_add(rel as i32 as isize as usize);
        assert_eq!(resume, RETURN_ADDR - 2);

        // Patch site: five NOPs, jump into the detour, call eax.
        assert!(plan.patch_bytes[..5].iter().all(|&byte| byte == 0x90));
        assert_eq!(plan.patch_bytes[5], 0xE9);
        let rel = u32::from_le_bytes(plan.patch_bytes[6..10].try_into().unwrap());
        let target = (RETURN_ADDR - 2).wrapping_add(rel as i32 as isize as usize);
        assert_eq!(target, plan.detour_addr);
        assert_eq!(&plan.patch_bytes[10..12], &[0xFF, 0xD0]);
    }

    #[test]
    fn test_backup_preserves_original_bytes() {
        let window = loader_window();
        let plan =
            build_plan(&window, RETURN_ADDR, &region_with_padding(), INTERCEPT).unwrap();
        assert_eq!(plan.backup, &window[SCAN_WINDOW - 12..]);
    }

    #[test]
    fn test_missing_call_signature() {
        let mut window = loader_window();
        // Corrupt the call site.
        let len = window.len();
        window[len - 3..].copy_from_slice(&[0xCC, 0xCC, 0xCC]);
        assert!(matches!(
            build_plan(&window, RETURN_ADDR, &region_with_padding(), INTERCEPT),
            Err(Error::PatternNotFound("x86 entry call"))
        ));
    }
}
