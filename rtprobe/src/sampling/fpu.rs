//! Floating-point context save/restore around a sampling tick
//!
//! On `x86_64` the full x87/SSE state (FXSAVE area) is saved before the
//! tick touches any float and restored afterwards. Other targets rely on
//! the register state the kernel saves in the signal frame.

#![allow(unsafe_code)] // fxsave/fxrstor intrinsics

/// Size of the FXSAVE area
pub const FPU_AREA_LEN: usize = 512;

#[repr(C, align(16))]
pub struct FpuContext {
    area: [u8; FPU_AREA_LEN],
}

impl FpuContext {
    #[must_use]
    pub const fn new() -> Self {
        Self { area: [0; FPU_AREA_LEN] }
    }

    #[inline]
    pub fn save(&mut self) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: area is 512 bytes, 16-byte aligned; fxsr is part of the
        // x86_64 baseline
        unsafe {
            std::arch::x86_64::_fxsave64(self.area.as_mut_ptr());
        };
    }

    #[inline]
    pub fn restore(&self) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: area was filled by a previous save on this thread
        unsafe {
            std::arch::x86_64::_fxrstor64(self.area.as_ptr());
        };
    }
}

impl Default for FpuContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_save_captures_mxcsr() {
        let mut ctx = FpuContext::new();
        ctx.save();
        // MXCSR lives at bytes 24..28 and is never zero (exception masks)
        let mxcsr = u32::from_le_bytes([
            ctx.area[24],
            ctx.area[25],
            ctx.area[26],
            ctx.area[27],
        ]);
        assert_ne!(mxcsr, 0);
        ctx.restore();
    }

    #[test]
    fn test_consecutive_saves_agree() {
        let mut first = FpuContext::new();
        let mut second = FpuContext::new();
        first.save();
        first.restore();
        second.save();
        // Control words and MXCSR are unchanged by a save/restore pair
        assert_eq!(first.area[..4], second.area[..4]);
        assert_eq!(first.area[24..28], second.area[24..28]);
    }
}
