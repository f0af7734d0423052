//! x86-64 loader-detour backend.
//!
//! The 64-bit loader loads the entry point's parameters into registers and
//! calls the entry through a register (optionally via the control-flow-guard
//! dispatch thunk). The signatures below recognize both shapes:
//!
//! ```text
//! 4C/4D 8B C?        mov r8/r9, r..        ; parameter loads
//! ...
//! (41) FF D?         call r..              ; plain entry call
//!       — or —
//! 48/49 8B C?        mov rax, r..          ; entry moved to rax
//! 4C 8B 0D disp32    mov r9, [rip+disp]    ; CFG dispatch pointer
//! FF D0              call rax
//! ```
//!
//! The synthesized detour replays the parameter loads, copies the register
//! holding the entry point into `r9` (the intercept routine's fourth
//! argument), loads the intercept routine into `rax` and jumps back to the
//! patched call site, which now reads `call rax`.

use crate::{
    detour::{find_zero_run, DetourPlan, CALL_LEN, JMP_LEN, SCAN_WINDOW},
    Error, Result,
};

/// mov r9, r..: REX.WR(+B) + 8B + modrm C8..CF
const MOV_R9_LEN: usize = 3;
/// mov rax, imm64: 48 B8 + 8 immediate bytes
const MOV_RAX_IMM_LEN: usize = 10;
/// mov r9, [rip+disp32] — the CFG dispatch-pointer load
const RIP_MOV_LEN: usize = 7;

fn is_param_load(bytes: &[u8]) -> bool {
    bytes.len() >= 3
        && (bytes[0] & 0x4D) >= 0x4C
        && bytes[1] == 0x8B
        && (bytes[2] & 0xC7) == bytes[2]
}

fn is_rex_b(byte: u8) -> bool {
    byte & 0xFE == 0x40
}

/// Distance back from the return address to the first (nearest) parameter
/// load instruction.
fn find_param_site(window: &[u8]) -> Option<usize> {
    for back in 1..SCAN_WINDOW.min(window.len()) {
        let offset = window.len() - back;
        if is_param_load(&window[offset..]) {
            return Some(back);
        }
    }
    None
}

/// Distance back from the return address to the indirect call instruction,
/// including its REX prefix when present.
fn find_call_site(window: &[u8]) -> Option<usize> {
    for back in 1..SCAN_WINDOW.min(window.len()) {
        let offset = window.len() - back;
        let bytes = &window[offset..];
        if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xD7) == bytes[1] {
            if offset > 0 && is_rex_b(window[offset - 1]) {
                return Some(back + 1);
            }
            return Some(back);
        }
    }
    None
}

/// Index of the register the entry point lives in when the call site is
/// patched over.
fn entry_register(params: &[u8], call: &[u8]) -> u8 {
    let rip_mov_at = params.len().checked_sub(RIP_MOV_LEN);
    if let Some(offset) = rip_mov_at {
        if params[offset..offset + 3] == [0x4C, 0x8B, 0x0D] && offset >= MOV_R9_LEN {
            // CFG shape: the instruction before the dispatch-pointer load
            // moved the entry point into rax; read its source register.
            let rex = params[offset - 3];
            let modrm = params[offset - 1];
            return (if rex & 0x01 != 0 { 8 } else { 0 }) + (modrm & 0x07);
        }
    }
    // Plain shape: the call operand is the entry register.
    let high = if is_rex_b(call[0]) && call[0] & 0x01 != 0 {
        8
    } else {
        0
    };
    high + (call[call.len() - 1] & 0x07)
}

/// Rewrites the RIP-relative displacement of a copied CFG dispatch-pointer
/// load so it still addresses the original target from the detour.
fn relocate_rip_mov(params: &mut [u8], patch_addr: usize, detour_addr: usize) {
    let Some(offset) = params.len().checked_sub(RIP_MOV_LEN) else {
        return;
    };
    if params[offset..offset + 3] != [0x4C, 0x8B, 0x0D] {
        return;
    }
    let disp_at = offset + 3;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&params[disp_at..disp_at + 4]);
    let old_disp = u32::from_le_bytes(raw);
    // The instruction moved from patch_addr+offset to detour_addr+offset;
    // the target stays put, so the displacement shifts by the move delta.
    let delta = patch_addr.wrapping_sub(detour_addr) as u32;
    let new_disp = old_disp.wrapping_add(delta);
    params[disp_at..disp_at + 4].copy_from_slice(&new_disp.to_le_bytes());
}

/// Computes the 64-bit loader detour. See [`crate::detour::build_plan`].
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
    let param_back = find_param_site(window).ok_or(Error::PatternNotFound("x64 parameter load"))?;
    let call_back = find_call_site(window).ok_or(Error::PatternNotFound("x64 indirect call"))?;
    if call_back >= param_back || param_back < JMP_LEN + CALL_LEN {
        return Err(Error::PatternNotFound("x64 patch window too small"));
    }

    let patch_len = param_back;
    let param_len = param_back - call_back;
    let patch_addr = return_addr - param_back;
    let params_src = &window[window.len() - param_back..window.len() - call_back];
    let call_src = &window[window.len() - call_back..];

    let detour_len = param_len + MOV_R9_LEN + MOV_RAX_IMM_LEN + JMP_LEN;
    let detour_offset =
        find_zero_run(region, detour_len).ok_or(Error::PatternNotFound("x64 detour region"))?;
    let detour_addr = return_addr + detour_offset;

    // Detour: replayed parameter loads, entry register into r9, intercept
    // into rax, jump back to the rewritten call site.
    let mut detour_bytes = Vec::with_capacity(detour_len);
    let mut params = params_src.to_vec();
    relocate_rip_mov(&mut params, patch_addr, detour_addr);
    detour_bytes.extend_from_slice(&params);

    let reg = entry_register(params_src, call_src);
    detour_bytes.push(0x4C + if reg >= 8 { 0x01 } else { 0x00 });
    detour_bytes.push(0x8B);
    detour_bytes.push(0xC8 + (reg & 0x07));

    detour_bytes.push(0x48);
    detour_bytes.push(0xB8);
    detour_bytes.extend_from_slice(&(intercept as u64).to_le_bytes());

    let resume = return_addr - CALL_LEN;
    let jmp_back = resume.wrapping_sub(detour_addr + detour_len) as u32;
    detour_bytes.push(0xE9);
    detour_bytes.extend_from_slice(&jmp_back.to_le_bytes());
    debug_assert_eq!(detour_bytes.len(), detour_len);

    // Patch site: NOP slide, jump into the detour, call rax on return.
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

    const RETURN_ADDR: usize = 0x7FF8_0000_1040;
    const INTERCEPT: usize = 0x1_8000_2000;

    /// Window ending in `mov r8, rdi; mov rdx, rbx; call r13`.
    fn plain_window() -> Vec<u8> {
        let mut window = vec![0xCCu8; SCAN_WINDOW];
        let tail = [
            0x4C, 0x8B, 0xC7, // mov r8, rdi
            0x48, 0x8B, 0xD3, // mov rdx, rbx
            0x41, 0xFF, 0xD5, // call r13
        ];
        let at = window.len() - tail.len();
        window[at..].copy_from_slice(&tail);
        window
    }

    /// Window ending in the control-flow-guard shape.
    fn cfg_window() -> Vec<u8> {
        let mut window = vec![0xCCu8; SCAN_WINDOW];
        let tail = [
            0x4D, 0x8B, 0xC4, // mov r8, r12
            0x49, 0x8B, 0xC5, // mov rax, r13
            0x4C, 0x8B, 0x0D, 0x10, 0x00, 0x00, 0x00, // mov r9, [rip+0x10]
            0xFF, 0xD0, // call rax
        ];
        let at = window.len() - tail.len();
        window[at..].copy_from_slice(&tail);
        window
    }

    fn region_with_padding() -> Vec<u8> {
        let mut region = vec![0xCCu8; 0x100];
        for byte in &mut region[0xC0..] {
            *byte = 0;
        }
        region
    }

    #[test]
    fn test_signature_scan_plain() {
        let window = plain_window();
        assert_eq!(find_param_site(&window), Some(9));
        assert_eq!(find_call_site(&window), Some(3));
    }

    #[test]
    fn test_plan_layout_plain() {
        let plan = build_plan(&plain_window(), RETURN_ADDR, &region_with_padding(), INTERCEPT)
            .unwrap();

        assert_eq!(plan.patch_addr, RETURN_ADDR - 9);
        assert_eq!(plan.patch_bytes.len(), 9);
        assert_eq!(plan.backup.len(), 9);
        assert_eq!(plan.detour_addr, RETURN_ADDR + 0xC0);

        // Detour: params (6) + mov r9,r13 (3) + mov rax,imm64 (10) + jmp (5).
        assert_eq!(plan.detour_bytes.len(), 24);
        assert_eq!(&plan.detour_bytes[..6], &plain_window()[SCAN_WINDOW - 9..SCAN_WINDOW - 3]);
        // mov r9, r13: REX.WRB, 8B, modrm CD.
        assert_eq!(&plan.detour_bytes[6..9], &[0x4D, 0x8B, 0xCD]);
        assert_eq!(&plan.detour_bytes[9..11], &[0x48, 0xB8]);
        assert_eq!(
            u64::from_le_bytes(plan.detour_bytes[11..19].try_into().unwrap()),
            INTERCEPT as u64
        );

        // Detour tail jumps back to the rewritten call site.
        assert_eq!(plan.detour_bytes[19], 0xE9);
        let rel = u32::from_le_bytes(plan.detour_bytes[20..24].try_into().unwrap());
        let resume = (plan.detour_addr + 24).wrapping_add(rel as i32 as isize as usize);
        assert_eq!(resume, RETURN_ADDR - 2);

        // Patch site: jump into the detour followed by call rax.
        assert_eq!(plan.patch_bytes[0], 0x90);
        assert_eq!(plan.patch_bytes[2], 0xE9);
        let rel = u32::from_le_bytes(plan.patch_bytes[3..7].try_into().unwrap());
        let target = (RETURN_ADDR - 2).wrapping_add(rel as i32 as isize as usize);
        assert_eq!(target, plan.detour_addr);
        assert_eq!(&plan.patch_bytes[7..9], &[0xFF, 0xD0]);
    }

    #[test]
    fn test_plan_relocates_cfg_dispatch_load() {
        let plan =
            build_plan(&cfg_window(), RETURN_ADDR, &region_with_padding(), INTERCEPT).unwrap();

        // Entry register recovered from the mov rax, r13 preceding the
        // dispatch-pointer load.
        let params_len = 13;
        assert_eq!(
            &plan.detour_bytes[params_len..params_len + 3],
            &[0x4D, 0x8B, 0xCD]
        );

        // The copied rip-relative displacement was shifted by the move delta.
        let disp = u32::from_le_bytes(plan.detour_bytes[9..13].try_into().unwrap());
        let expected =
            0x10u32.wrapping_add(plan.patch_addr.wrapping_sub(plan.detour_addr) as u32);
        assert_eq!(disp, expected);
    }

    #[test]
    fn test_missing_signature_is_reported() {
        let window = vec![0xCCu8; SCAN_WINDOW];
        assert!(matches!(
            build_plan(&window, RETURN_ADDR, &region_with_padding(), INTERCEPT),
            Err(Error::PatternNotFound(_))
        ));
    }

    #[test]
    fn test_missing_detour_region_is_reported() {
        let region = vec![0xCCu8; 0x100];
        assert!(matches!(
            build_plan(&plain_window(), RETURN_ADDR, &region, INTERCEPT),
            Err(Error::PatternNotFound("x64 detour region"))
        ));
    }
}
