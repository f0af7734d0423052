//! Loader entry-point detour: signature scanning, detour synthesis and
//! install/restore state.
//!
//! The OS loader calls every module's initialization routine through one
//! version-sensitive call site. This module locates that call site by
//! signature-scanning the short instruction window preceding the loader's
//! return address, finds a run of unused zero padding after the function to
//! host a detour, and synthesizes machine code that reproduces the original
//! parameter loads, additionally passes the original entry point to the
//! detector's intercept routine, and resumes at the original call site. With
//! the detour in place, every module initialization — including static
//! constructors that run before any normal startup hook — is preceded by a
//! module-registry refresh and patch pass.
//!
//! Everything here is pure computation over byte slices; the platform backend
//! performs the two protected writes an installation needs. The instruction
//! patterns differ per architecture ([`x86`] and [`x86_64`]); both backends
//! are always compiled so either can be exercised on any host, and
//! [`build_plan`] selects the one matching the target.
//!
//! # Key Components
//!
//! - [`DetourPlan`] - The computed patch: where to write which bytes, and the
//!   saved originals for restoration
//! - [`DetourState`] - Idempotent install / restore-only-after-install gate
//! - [`find_zero_run`] - Detour-region discovery in existing padding
//!
//! # Failure policy
//!
//! When the expected instruction patterns are not present (an unexpected OS
//! binary layout), planning fails with
//! [`Error::PatternNotFound`](crate::Error::PatternNotFound) and the caller
//! skips the hook entirely: static initializers before the first explicit
//! allocation may then not be captured, which is non-fatal.

pub mod x86;
pub mod x86_64;

use crate::{Error, Result};

/// Number of bytes scanned backwards from the loader's return address for the
/// parameter-load and call-site signatures.
pub const SCAN_WINDOW: usize = 0x20;

/// Byte length of the jump written into the original call site.
pub(crate) const JMP_LEN: usize = 5;
/// Byte length of the synthesized register-indirect call.
pub(crate) const CALL_LEN: usize = 2;

/// A fully computed loader detour, ready to be applied by two memory writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetourPlan {
    /// Address of the first patched byte inside the loader.
    pub patch_addr: usize,
    /// Replacement bytes for the patch site (`patch_bytes.len()` original
    /// bytes are overwritten).
    pub patch_bytes: Vec<u8>,
    /// The original patch-site bytes, restored at shutdown.
    pub backup: Vec<u8>,
    /// Address of the scratch detour region.
    pub detour_addr: usize,
    /// Synthesized detour code; the region is zeroed again on restore.
    pub detour_bytes: Vec<u8>,
}

/// Install/restore gate for the loader detour.
///
/// Applying twice is a no-op; restore only succeeds after a successful
/// install. The `write` callback performs one protected memory write — the
/// platform backend wraps it in the page-protection dance, tests hand in a
/// buffer writer.
#[derive(Debug, Default)]
pub struct DetourState {
    installed: Option<DetourPlan>,
}

impl DetourState {
    /// Creates an empty (not installed) state.
    #[must_use]
    pub const fn new() -> Self {
        DetourState { installed: None }
    }

    /// Whether a detour is currently installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// Applies `plan` through `write`. Returns `false` without writing when a
    /// detour is already installed.
    ///
    /// The detour region is written before the call site so the redirected
    /// jump never lands in a half-written detour.
    ///
    /// # Errors
    ///
    /// Propagates the first failed write.
    pub fn install(
        &mut self,
        plan: DetourPlan,
        mut write: impl FnMut(usize, &[u8]) -> Result<()>,
    ) -> Result<bool> {
        if self.installed.is_some() {
            return Ok(false);
        }
        write(plan.detour_addr, &plan.detour_bytes)?;
        write(plan.patch_addr, &plan.patch_bytes)?;
        self.installed = Some(plan);
        Ok(true)
    }

    /// Restores the original bytes and zeroes the detour region.
    ///
    /// # Errors
    ///
    /// [`Error::NotInstalled`] when no successful install preceded this call;
    /// otherwise the first failed write.
    pub fn restore(&mut self, mut write: impl FnMut(usize, &[u8]) -> Result<()>) -> Result<()> {
        let plan = self.installed.take().ok_or(Error::NotInstalled)?;
        write(plan.patch_addr, &plan.backup)?;
        write(plan.detour_addr, &vec![0u8; plan.detour_bytes.len()])?;
        Ok(())
    }
}

/// Finds a run of `needed` zero bytes in `region`, scanning backwards from
/// the end, and returns the offset of the run's first byte.
///
/// `region` covers already-mapped memory following the patched function; a
/// trailing padding run is preferred (the scan keeps the run closest to the
/// region's end). A run starting at offset zero is rejected — that would
/// overlap the function itself.
#[must_use]
pub fn find_zero_run(region: &[u8], needed: usize) -> Option<usize> {
    let mut end = region.len();
    let mut begin = region.len();
    while end - begin < needed && begin > 0 {
        begin -= 1;
        if region[begin] != 0 {
            end = begin;
        }
    }
    (end - begin >= needed && begin > 0).then_some(begin)
}

/// Computes the loader detour for the native architecture.
///
/// * `window` — the [`SCAN_WINDOW`] bytes immediately preceding the loader's
///   return address
/// * `return_addr` — the return address observed inside the module-entry call
/// * `region` — mapped bytes from `return_addr` to the end of its memory
///   region, searched for detour space
/// * `intercept` — address of the routine to interpose before every module
///   entry point
///
/// # Errors
///
/// [`Error::PatternNotFound`] when the instruction signatures or a large
/// enough padding run are missing.
#[cfg(target_arch = "x86_64")]
pub fn build_plan(
    window: &[u8],
    return_addr: usize,
    region: &[u8],
    intercept: usize,
) -> Result<DetourPlan> {
    x86_64::build_plan(window, return_addr, region, intercept)
}

/// Computes the loader detour for the native architecture.
///
/// See the x86_64 variant for parameter documentation.
#[cfg(target_arch = "x86")]
pub fn build_plan(
    window: &[u8],
    return_addr: usize,
    region: &[u8],
    intercept: usize,
) -> Result<DetourPlan> {
    x86::build_plan(window, return_addr, region, intercept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> DetourPlan {
        DetourPlan {
            patch_addr: 0x1000,
            patch_bytes: vec![0x90; 9],
            backup: vec![0xAA; 9],
            detour_addr: 0x2000,
            detour_bytes: vec![0xCC; 24],
        }
    }

    #[test]
    fn test_install_is_idempotent() {
        let mut state = DetourState::new();
        let mut writes = Vec::new();
        let installed = state
            .install(sample_plan(), |addr, bytes| {
                writes.push((addr, bytes.to_vec()));
                Ok(())
            })
            .unwrap();
        assert!(installed);
        // Detour region first, call site second.
        assert_eq!(writes[0].0, 0x2000);
        assert_eq!(writes[1].0, 0x1000);

        let again = state
            .install(sample_plan(), |_, _| panic!("must not write twice"))
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_restore_requires_install() {
        let mut state = DetourState::new();
        assert!(matches!(
            state.restore(|_, _| Ok(())),
            Err(Error::NotInstalled)
        ));

        state.install(sample_plan(), |_, _| Ok(())).unwrap();
        let mut writes = Vec::new();
        state
            .restore(|addr, bytes| {
                writes.push((addr, bytes.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(writes[0], (0x1000, vec![0xAA; 9]));
        assert_eq!(writes[1], (0x2000, vec![0u8; 24]));
        // A second restore has nothing to undo.
        assert!(matches!(
            state.restore(|_, _| Ok(())),
            Err(Error::NotInstalled)
        ));
    }

    #[test]
    fn test_failed_install_leaves_state_clean() {
        let mut state = DetourState::new();
        let result = state.install(sample_plan(), |_, _| Err(Error::NotSupported));
        assert!(result.is_err());
        assert!(!state.is_installed());
    }

    #[test]
    fn test_find_zero_run_trailing_padding() {
        let mut region = vec![0xCCu8; 0x100];
        for byte in &mut region[0xF0..] {
            *byte = 0;
        }
        assert_eq!(find_zero_run(&region, 0x10), Some(0xF0));
        assert_eq!(find_zero_run(&region, 0x11), None);
    }

    #[test]
    fn test_find_zero_run_skips_interior_runs_too_small() {
        let mut region = vec![0xCCu8; 0x40];
        // Interior run of 8, trailing run of 4.
        for byte in &mut region[0x10..0x18] {
            *byte = 0;
        }
        for byte in &mut region[0x3C..] {
            *byte = 0;
        }
        assert_eq!(find_zero_run(&region, 4), Some(0x3C));
        assert_eq!(find_zero_run(&region, 8), Some(0x10));
        assert_eq!(find_zero_run(&region, 9), None);
    }

    #[test]
    fn test_find_zero_run_rejects_run_at_origin() {
        let region = vec![0u8; 0x20];
        // The whole region is zero, but a run starting at the scanned
        // function itself is unusable.
        assert_eq!(find_zero_run(&region, 0x20), None);
        assert_eq!(find_zero_run(&region, 0x10), Some(0x10));
    }
}
