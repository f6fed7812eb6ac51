//! # detourcore Prelude
//!
//! The types needed to detour and hook methods, for glob import.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all detourcore operations
pub use crate::Error;

/// The result type used throughout detourcore
pub use crate::Result;

/// Ambient configuration of a platform triple
pub use crate::config::PlatformConfig;

// ================================================================================================
// Platform
// ================================================================================================

/// The architecture, system and runtime providers in use
pub use crate::platform::PlatformTriple;

/// Runtime-neutral method identity
pub use crate::platform::method::MethodHandle;

/// Capabilities of the providers
pub use crate::platform::features::{
    ArchitectureFeature, FeatureFlags, RuntimeFeature, SystemFeature,
};

/// Provider traits
pub use crate::platform::{arch::Architecture, runtime::Runtime, system::System};

// ================================================================================================
// Detours
// ================================================================================================

/// Machine code detours
pub use crate::detour::{NativeDetour, SimpleNativeDetour};

/// Method detours
pub use crate::detour::{CoreDetour, DetourFactory};

/// Typed function pointers
pub use crate::detour::Function;

// ================================================================================================
// Hook Chains
// ================================================================================================

/// Managed hook chains and their configuration
pub use crate::manager::{DetourConfig, DetourInfo, DetourManager, Hook, HookInfo};
