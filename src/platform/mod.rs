//! The platform abstraction.
//!
//! Detouring needs three collaborators: an [`arch::Architecture`] that encodes jumps and knows
//! the compiler stubs of its instruction set, a [`system::System`] that allocates and patches
//! memory, and a [`runtime::Runtime`] that knows where method code lives. A [`PlatformTriple`]
//! bundles one of each, computes their combined [`features::FeatureFlags`] and ABI, and offers
//! the operations built on all three: resolving a method to its real body, and creating native
//! detours.
//!
//! # Key Components
//!
//! - [`PlatformTriple`] - The facade over the three providers
//! - [`PlatformTriple::current`] - The process-wide default triple
//! - [`abi`] / [`selftest`] - Calling convention descriptions and their empirical detection
//! - [`method::MethodHandle`] - Runtime-neutral method identity
//!
//! # Examples
//!
//! ```rust,no_run
//! use detourcore::platform::{method::MethodHandle, PlatformTriple};
//!
//! extern "C" fn original() -> i32 { 1 }
//!
//! let triple = PlatformTriple::current()?;
//! let body = triple.resolve_entry_point(&MethodHandle::function(original as usize))?;
//! println!("{} on {}: body at {body:#x}", triple.host_triple(), triple.features());
//! # Ok::<(), detourcore::Error>(())
//! ```

pub mod abi;
pub mod arch;
pub mod features;
pub mod method;
pub mod runtime;
pub mod selftest;
pub mod system;

use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info, trace, warn};

use crate::{
    config::PlatformConfig,
    detour::{NativeDetour, SimpleNativeDetour},
    platform::{
        abi::Abi,
        arch::Architecture,
        features::{ArchitectureFeature, FeatureFlags, RuntimeFeature},
        method::MethodHandle,
        runtime::{PinGuard, Runtime},
        system::System,
    },
    Error, Result,
};

static CURRENT: OnceLock<Arc<PlatformTriple>> = OnceLock::new();
static CURRENT_INIT: Mutex<()> = Mutex::new(());

/// An architecture, an operating system and a runtime working together.
pub struct PlatformTriple {
    architecture: Arc<dyn Architecture>,
    system: Arc<dyn System>,
    runtime: Arc<dyn Runtime>,
    features: FeatureFlags,
    abi: Abi,
    config: PlatformConfig,
}

impl PlatformTriple {
    /// Bundles the three providers with the default configuration.
    ///
    /// # Errors
    /// Returns [`Error::UnrecognizedAbi`] if no provider declares an ABI and the self-test cannot
    /// determine one.
    pub fn new(
        architecture: Arc<dyn Architecture>,
        system: Arc<dyn System>,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self> {
        Self::with_config(architecture, system, runtime, PlatformConfig::default())
    }

    /// Bundles the three providers.
    ///
    /// The ABI is the runtime's, falling back to the system default. If neither declares one, or
    /// `config` asks for it, the self-test determines it instead.
    ///
    /// # Errors
    /// Returns [`Error::UnrecognizedAbi`] if the self-test fails.
    pub fn with_config(
        architecture: Arc<dyn Architecture>,
        system: Arc<dyn System>,
        runtime: Arc<dyn Runtime>,
        config: PlatformConfig,
    ) -> Result<Self> {
        let features = FeatureFlags::new(
            architecture.features(),
            system.features(),
            runtime.features(),
        );

        let declared = runtime.abi().or_else(|| system.default_abi());
        let abi = match declared {
            Some(abi) if !config.run_abi_selftest => abi,
            declared => selftest::detect_abi(&architecture, &system, declared.as_ref())?,
        };

        info!(
            "Platform {} / {} / {} with {features}",
            architecture.kind(),
            system.kind(),
            runtime.kind()
        );
        debug!("Platform ABI {abi:?}");

        Ok(PlatformTriple {
            architecture,
            system,
            runtime,
            features,
            abi,
            config,
        })
    }

    /// The process-wide default triple, created for the host on first use.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedPlatform`] if the host has no providers.
    pub fn current() -> Result<Arc<PlatformTriple>> {
        if let Some(current) = CURRENT.get() {
            return Ok(current.clone());
        }

        let _init = lock!(CURRENT_INIT);
        if let Some(current) = CURRENT.get() {
            return Ok(current.clone());
        }
        let created = Arc::new(Self::create_current()?);
        Ok(CURRENT.get_or_init(|| created).clone())
    }

    /// Installs `triple` as the process-wide default.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if a default already exists.
    pub fn set_current(triple: Arc<PlatformTriple>) -> Result<()> {
        let _init = lock!(CURRENT_INIT);
        CURRENT.set(triple).map_err(|_| {
            Error::InvalidState("A platform triple is already installed".to_string())
        })
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn create_current() -> Result<PlatformTriple> {
        let system: Arc<dyn System> = Arc::new(system::LinuxSystem::new());
        let architecture: Arc<dyn Architecture> =
            Arc::new(arch::X86_64Architecture::new(system.clone())?);
        let runtime: Arc<dyn Runtime> = Arc::new(runtime::NativeRuntime::new(system.as_ref()));
        PlatformTriple::new(architecture, system, runtime)
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn create_current() -> Result<PlatformTriple> {
        Err(Error::UnsupportedPlatform(format!(
            "no providers for {} on {}",
            arch::ArchitectureKind::current(),
            system::OsKind::current()
        )))
    }

    /// The architecture provider.
    #[must_use]
    pub fn architecture(&self) -> &Arc<dyn Architecture> {
        &self.architecture
    }

    /// The operating system provider.
    #[must_use]
    pub fn system(&self) -> &Arc<dyn System> {
        &self.system
    }

    /// The runtime provider.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Combined features of the three providers.
    #[must_use]
    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    /// The calling convention in use.
    #[must_use]
    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    /// The configuration the triple was built with.
    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// A readable `arch-os-runtime` description.
    #[must_use]
    pub fn host_triple(&self) -> String {
        format!(
            "{}-{}-{}",
            self.architecture.kind(),
            self.system.kind(),
            self.runtime.kind()
        )
        .to_lowercase()
    }

    /// Compiles `method` so it has a real body.
    ///
    /// # Errors
    /// Propagates [`Error::Compile`] from the runtime, or [`Error::MethodBodyNotFound`] if the
    /// method has no entry point.
    pub fn compile(&self, method: &MethodHandle) -> Result<()> {
        if self
            .features
            .has_runtime(RuntimeFeature::REQUIRES_CUSTOM_METHOD_COMPILE)
        {
            self.runtime.compile(method)
        } else {
            self.runtime.entry_point(method).map(|_| ())
        }
    }

    /// The representation of `method` that has identity, used as a map key.
    #[must_use]
    pub fn canonicalize(&self, method: &MethodHandle) -> MethodHandle {
        if self
            .features
            .has_runtime(RuntimeFeature::REQUIRES_METHOD_IDENTIFICATION)
        {
            self.runtime.identifiable(method)
        } else {
            method.canonical().clone()
        }
    }

    /// Pins `method` if the runtime requires it.
    ///
    /// # Errors
    /// Propagates pinning failures from the runtime.
    pub fn pin_if_needed(&self, method: &MethodHandle) -> Result<Option<PinGuard>> {
        if self
            .features
            .has_runtime(RuntimeFeature::REQUIRES_METHOD_PINNING)
        {
            self.runtime.pin(method).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Asks the runtime to stop inlining `method`. Returns `false` if it cannot.
    ///
    /// # Errors
    /// Propagates failures of a runtime that claims to support it.
    pub fn try_disable_inlining(&self, method: &MethodHandle) -> Result<bool> {
        if self.features.has_runtime(RuntimeFeature::DISABLE_INLINING) {
            self.runtime.disable_inlining(method)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Resolves `method` to the address of its real body, following any known stubs.
    ///
    /// Function handles are already code addresses and are returned as they are. If a stub
    /// defers compilation, the method is compiled once and the walk restarts from its fresh
    /// entry point.
    ///
    /// # Errors
    /// Returns [`Error::MethodBodyNotFound`] if the walk does not settle within
    /// [`PlatformConfig::max_thunk_walk_iterations`] steps, or a second compilation stub is met
    /// after compiling.
    pub fn resolve_entry_point(&self, method: &MethodHandle) -> Result<usize> {
        if let Some(address) = method.function_address() {
            return Ok(address);
        }

        let mut entry = self.runtime.entry_point(method)?;
        if !self
            .features
            .has_runtime(RuntimeFeature::REQUIRES_BODY_THUNK_WALKING)
        {
            return Ok(entry);
        }

        let thunks = self.architecture.known_method_thunks();
        let window = thunks.max_min_length();
        let mut previous = None;
        let mut regenerated = false;
        let mut memory = self.system.readable_memory();

        for _ in 0..self.config.max_thunk_walk_iterations {
            if previous == Some(entry) {
                return Ok(entry);
            }
            previous = Some(entry);

            let readable = memory.readable_length(entry, window).min(window);
            // SAFETY: readable_length vouched for these bytes
            let code = unsafe { std::slice::from_raw_parts(entry as *const u8, readable) };
            let Some((pattern, found)) = thunks.try_find_match(code) else {
                trace!("{method} settled at {entry:#x}");
                return Ok(entry);
            };

            let meaning = pattern.meaning();
            if meaning.kind().is_precode_fixup() {
                if regenerated {
                    return Err(Error::MethodBodyNotFound(format!(
                        "{method} still leads through a compilation stub at {entry:#x} after compiling"
                    )));
                }
                debug!("{method} is not compiled yet; compiling");
                self.compile(method)?;
                regenerated = true;
                // Compiling maps fresh code
                memory = self.system.readable_memory();
                entry = self.runtime.entry_point(method)?;
                previous = None;
                continue;
            }

            // SAFETY: a matched stub captured the address of its own target or pointer cell
            let next = unsafe { meaning.process_address(entry, found.offset, found.address) };
            trace!("{method}: stub at {entry:#x} leads to {next:#x}");
            entry = next;
        }

        Err(Error::MethodBodyNotFound(format!(
            "{method} did not settle within {} stubs",
            self.config.max_thunk_walk_iterations
        )))
    }

    /// Patches a jump from `from` to `to`.
    ///
    /// # Errors
    /// Propagates encoding, allocation and protection failures.
    ///
    /// # Safety
    /// See [`SimpleNativeDetour::apply`].
    pub unsafe fn create_simple_detour(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<SimpleNativeDetour> {
        SimpleNativeDetour::apply(
            self.architecture.clone(),
            self.system.clone(),
            from,
            to,
            max_size,
        )
    }

    /// Patches a jump from `from` to `to`, first building an alternate entry point that runs the
    /// overwritten code when the architecture supports it and the configuration asks for it.
    ///
    /// # Errors
    /// Propagates encoding, allocation and protection failures.
    ///
    /// # Safety
    /// See [`SimpleNativeDetour::apply`]; additionally `from` must be decodable code.
    pub unsafe fn create_native_detour(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<NativeDetour> {
        self.create_native_detour_with(from, to, max_size, |_| Ok(()))
    }

    /// Like [`PlatformTriple::create_native_detour`], but runs `before_patch` with the address
    /// of the alternate entry once it exists and before the source is patched. An error from
    /// `before_patch` leaves the source untouched.
    ///
    /// # Errors
    /// Propagates failures of `before_patch` and of
    /// [`PlatformTriple::create_native_detour`].
    ///
    /// # Safety
    /// See [`PlatformTriple::create_native_detour`].
    pub unsafe fn create_native_detour_with(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
        before_patch: impl FnOnce(Option<usize>) -> Result<()>,
    ) -> Result<NativeDetour> {
        let info = self.architecture.compute_detour_info(from, to, max_size)?;

        let alt_entry = if !self.config.create_alt_entry_points {
            None
        } else if self
            .features
            .has_arch(ArchitectureFeature::CREATE_ALT_ENTRY_POINT)
        {
            Some(self.architecture.create_alt_entry(from, info.size())?)
        } else {
            warn!("Cannot create an alternate entry point for {from:#x} -> {to:#x}");
            None
        };
        before_patch(alt_entry.as_ref().map(|entry| entry.base()))?;

        let simple =
            SimpleNativeDetour::apply_info(self.architecture.clone(), self.system.clone(), info)?;
        Ok(NativeDetour::new(simple, alt_entry))
    }
}

impl std::fmt::Debug for PlatformTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformTriple")
            .field("host", &self.host_triple())
            .field("features", &self.features)
            .field("abi", &self.abi)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn current_is_shared() {
        let first = PlatformTriple::current().unwrap();
        let second = PlatformTriple::current().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.host_triple(), "x86_64-linux-native");
        assert!(first
            .features()
            .has_arch(ArchitectureFeature::CREATE_ALT_ENTRY_POINT));

        assert!(matches!(
            PlatformTriple::set_current(first.clone()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn function_handles_resolve_directly() {
        let triple = PlatformTriple::current().unwrap();
        let handle = MethodHandle::wrapped(1, MethodHandle::function(0x1234));
        assert_eq!(triple.resolve_entry_point(&handle).unwrap(), 0x1234);
        assert_eq!(triple.canonicalize(&handle), MethodHandle::function(0x1234));
        assert!(triple.pin_if_needed(&handle).unwrap().is_none());
        assert!(!triple.try_disable_inlining(&handle).unwrap());
    }
}
