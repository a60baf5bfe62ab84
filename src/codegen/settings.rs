//! Compilation settings and host capability constriction.

/// Options controlling code generation.
///
/// Every ISA option is downgraded by [`constrict`](Self::constrict) if the
/// host lacks the feature, so emitters can rely on the flags without further
/// checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationSettings {
    /// Permit 64-bit code generation. Downgraded on 32-bit hosts; this
    /// backend only emits 64-bit code, so a downgrade fails compilation.
    pub use_x64: bool,
    pub use_sse42: bool,
    pub use_avx2: bool,
    pub use_fma3: bool,
    /// Use the Schraudolph exp approximation inside sigmoid.
    pub use_exp_approx_in_sigmoid: bool,
    /// Use the Schraudolph exp approximation inside tanh.
    pub use_exp_approx_in_tanh: bool,
    /// Extra compile-time validation; emitted code is unchanged.
    pub debug: bool,
    /// Cap on the number of XMM registers emitters may use for accumulation.
    pub xmm_regs: usize,
}

impl Default for CompilationSettings {
    fn default() -> Self {
        CompilationSettings {
            use_x64: true,
            use_sse42: true,
            use_avx2: true,
            use_fma3: true,
            use_exp_approx_in_sigmoid: true,
            use_exp_approx_in_tanh: true,
            debug: false,
            xmm_regs: 16,
        }
    }
}

impl CompilationSettings {
    /// Downgrades requested features that the host CPU does not support.
    pub fn constrict(&mut self) {
        if self.use_x64 && !cfg!(target_arch = "x86_64") {
            self.use_x64 = false;
        }
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if self.use_sse42 && !std::arch::is_x86_feature_detected!("sse4.2") {
                self.use_sse42 = false;
            }
            if self.use_avx2 && !std::arch::is_x86_feature_detected!("avx2") {
                self.use_avx2 = false;
            }
            if self.use_fma3 && !std::arch::is_x86_feature_detected!("fma") {
                self.use_fma3 = false;
            }
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            self.use_sse42 = false;
            self.use_avx2 = false;
            self.use_fma3 = false;
        }
        if self.xmm_regs > 16 {
            self.xmm_regs = 16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constrict_caps_register_count() {
        let mut settings = CompilationSettings {
            xmm_regs: 64,
            ..CompilationSettings::default()
        };
        settings.constrict();
        assert!(settings.xmm_regs <= 16);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn constrict_keeps_x64_on_x64_hosts() {
        let mut settings = CompilationSettings::default();
        settings.constrict();
        assert!(settings.use_x64);
    }
}
