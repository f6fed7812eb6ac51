//! Platform configuration
//!
//! Knobs that tune how a [`crate::platform::PlatformTriple`] resolves method bodies, builds
//! native detours and waits on chain updates. Per-detour ordering configuration lives in
//! [`crate::manager::DetourConfig`].

/// Configuration of a platform triple and the detour layers built on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Upper bound on the stubs followed while resolving a method body (default: 20)
    pub max_thunk_walk_iterations: usize,

    /// Discover the calling convention empirically when the triple is built, replacing the
    /// runtime's declared ABI with the observed one
    pub run_abi_selftest: bool,

    /// Build an alternate entry point for every native detour, so the original code stays
    /// callable while the detour is applied
    pub create_alt_entry_points: bool,

    /// Busy spins before a spin-wait starts yielding its time slice (default: 32)
    pub spin_yield_after: u32,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            max_thunk_walk_iterations: 20,
            run_abi_selftest: false,
            create_alt_entry_points: true,
            spin_yield_after: 32,
        }
    }
}

impl PlatformConfig {
    /// Creates a configuration that does as little extra work as possible
    ///
    /// Skips alternate entry points and the self-test; native detours then cannot call the
    /// original code.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_thunk_walk_iterations: 20,
            run_abi_selftest: false,
            create_alt_entry_points: false,
            spin_yield_after: 32,
        }
    }

    /// Creates a configuration that trusts nothing the runtime declares
    ///
    /// Runs the ABI self-test and yields on the first contended spin.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            max_thunk_walk_iterations: 20,
            run_abi_selftest: true,
            create_alt_entry_points: true,
            spin_yield_after: 0,
        }
    }

    /// Changes the thunk walk bound.
    #[must_use]
    pub fn with_max_thunk_walk_iterations(mut self, iterations: usize) -> Self {
        self.max_thunk_walk_iterations = iterations;
        self
    }

    /// Enables or disables the ABI self-test.
    #[must_use]
    pub fn with_abi_selftest(mut self, enabled: bool) -> Self {
        self.run_abi_selftest = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_config_presets() {
        let default = PlatformConfig::default();
        assert_eq!(default.max_thunk_walk_iterations, 20);
        assert!(!default.run_abi_selftest);
        assert!(default.create_alt_entry_points);
        assert_eq!(default.spin_yield_after, 32);

        let minimal = PlatformConfig::minimal();
        assert!(!minimal.create_alt_entry_points);
        assert!(!minimal.run_abi_selftest);

        let strict = PlatformConfig::strict();
        assert!(strict.run_abi_selftest);
        assert_eq!(strict.spin_yield_after, 0);

        let tuned = PlatformConfig::default()
            .with_max_thunk_walk_iterations(4)
            .with_abi_selftest(true);
        assert_eq!(tuned.max_thunk_walk_iterations, 4);
        assert!(tuned.run_abi_selftest);
    }
}
