//! Capability flags of the three platform providers.
//!
//! Every provider method that is optional is gated behind one of these flags; callers check the
//! flag before invoking the method, and the [`crate::platform::PlatformTriple`] facade does so on
//! their behalf.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Optional capabilities of an [`crate::platform::arch::Architecture`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArchitectureFeature: u32 {
        /// Every instruction has the same width
        const FIXED_INSTRUCTION_SIZE = 0x01;
        /// Instructions can carry 64-bit immediates
        const IMMEDIATE64 = 0x02;
        /// The architecture can relocate overwritten instructions into an alternate entry point
        const CREATE_ALT_ENTRY_POINT = 0x04;
    }
}

bitflags! {
    /// Optional capabilities of a [`crate::platform::system::System`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SystemFeature: u32 {
        /// Pages may be readable, writable and executable at once
        const RWX_PAGES = 0x01;
        /// Pages may be readable and executable
        const RX_PAGES = 0x02;
    }
}

bitflags! {
    /// Optional capabilities and requirements of a [`crate::platform::runtime::Runtime`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RuntimeFeature: u32 {
        /// The garbage collector is precise
        const PRECISE_GC = 0x0001;
        /// The runtime reports method (re)compilation
        const COMPILE_METHOD_HOOK = 0x0002;
        /// The runtime supports detouring at the intermediate-language level
        const IL_DETOUR = 0x0004;
        /// Generic code is shared between instantiations
        const GENERIC_SHARING = 0x0008;
        /// Inlining can be disabled per method
        const DISABLE_INLINING = 0x0010;
        /// Already inlined call sites can be undone
        const UNINLINING = 0x0020;
        /// Generic instantiations of a method can be enumerated
        const LIST_GENERIC_INSTANTIATIONS = 0x0040;
        /// Methods must be pinned to keep their code alive while detoured
        const REQUIRES_METHOD_PINNING = 0x0080;
        /// Methods have several representations that must be canonicalised
        const REQUIRES_METHOD_IDENTIFICATION = 0x0100;
        /// Entry points lead through stubs that must be walked to find the body
        const REQUIRES_BODY_THUNK_WALKING = 0x0200;
        /// The runtime knows its calling convention without a self-test
        const HAS_KNOWN_ABI = 0x0400;
        /// Methods must be compiled through the runtime rather than forced by calling them
        const REQUIRES_CUSTOM_METHOD_COMPILE = 0x0800;
    }
}

/// The combined feature set of a platform triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FeatureFlags {
    /// Architecture features
    pub architecture: ArchitectureFeature,
    /// System features
    pub system: SystemFeature,
    /// Runtime features
    pub runtime: RuntimeFeature,
}

impl FeatureFlags {
    /// Combines the three provider feature sets.
    #[must_use]
    pub fn new(
        architecture: ArchitectureFeature,
        system: SystemFeature,
        runtime: RuntimeFeature,
    ) -> Self {
        FeatureFlags {
            architecture,
            system,
            runtime,
        }
    }

    /// `true` if every flag of `feature` is present.
    #[must_use]
    pub fn has_arch(&self, feature: ArchitectureFeature) -> bool {
        self.architecture.contains(feature)
    }

    /// `true` if every flag of `feature` is present.
    #[must_use]
    pub fn has_system(&self, feature: SystemFeature) -> bool {
        self.system.contains(feature)
    }

    /// `true` if every flag of `feature` is present.
    #[must_use]
    pub fn has_runtime(&self, feature: RuntimeFeature) -> bool {
        self.runtime.contains(feature)
    }
}

impl fmt::Display for FeatureFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Features({:?} | {:?} | {:?})",
            self.architecture, self.system, self.runtime
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_requires_all_bits() {
        let flags = FeatureFlags::new(
            ArchitectureFeature::IMMEDIATE64 | ArchitectureFeature::CREATE_ALT_ENTRY_POINT,
            SystemFeature::RWX_PAGES,
            RuntimeFeature::HAS_KNOWN_ABI,
        );

        assert!(flags.has_arch(ArchitectureFeature::IMMEDIATE64));
        assert!(!flags.has_arch(
            ArchitectureFeature::IMMEDIATE64 | ArchitectureFeature::FIXED_INSTRUCTION_SIZE
        ));
        assert!(flags.has_system(SystemFeature::RWX_PAGES));
        assert!(!flags.has_system(SystemFeature::RX_PAGES));
        assert!(flags.has_runtime(RuntimeFeature::HAS_KNOWN_ABI));
        assert!(!flags.has_runtime(RuntimeFeature::COMPILE_METHOD_HOOK));
    }
}
