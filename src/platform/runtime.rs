//! Runtime providers.
//!
//! A [`Runtime`] knows how the host runtime manages method code: where a method's entry point
//! is, how to force compilation, whether methods must be pinned to keep their code alive, and
//! which calling convention the runtime uses. Runtimes that recompile methods (tiering,
//! re-jitting) can report it through [`Runtime::subscribe_compiled`], so detours can follow the
//! code to its new location.

use std::{fmt, sync::Arc, sync::RwLock};

use strum::{Display, EnumIter};

use crate::{
    platform::{abi::Abi, features::RuntimeFeature, method::MethodHandle, system::System},
    Error, Result,
};

/// Host runtime families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum RuntimeKind {
    /// Plain machine code without a managing runtime
    Native,
    /// .NET Framework
    Framework,
    /// .NET Core and .NET 5+
    CoreClr,
    /// Mono
    Mono,
    /// Anything else
    Unknown,
}

/// A method (re)compilation reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMethod {
    /// The compiled method
    pub method: MethodHandle,
    /// Start of the fresh code
    pub code_start: usize,
    /// Size of the fresh code in bytes
    pub code_size: usize,
}

/// Receives [`CompiledMethod`] events.
pub type CompiledCallback = Arc<dyn Fn(&CompiledMethod) + Send + Sync>;

/// Keeps a method pinned while alive.
pub struct PinGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl PinGuard {
    /// Creates a guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        PinGuard {
            release: Some(Box::new(release)),
        }
    }
}

impl fmt::Debug for PinGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Fan-out of compile notifications to every subscriber.
///
/// Runtime providers with [`RuntimeFeature::COMPILE_METHOD_HOOK`] embed one and call
/// [`CompileNotifier::notify`] from their compiler hook.
#[derive(Default)]
pub struct CompileNotifier {
    subscribers: RwLock<Vec<CompiledCallback>>,
}

impl CompileNotifier {
    /// Creates a notifier without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the subscriber list is poisoned.
    pub fn subscribe(&self, callback: CompiledCallback) -> Result<()> {
        write_lock!(self.subscribers).push(callback);
        Ok(())
    }

    /// Number of subscribers.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the subscriber list is poisoned.
    pub fn subscriber_count(&self) -> Result<usize> {
        Ok(read_lock!(self.subscribers).len())
    }

    /// Delivers `event` to every subscriber.
    ///
    /// Subscribers are snapshotted first, so a subscriber may subscribe further callbacks.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the subscriber list is poisoned.
    pub fn notify(&self, event: &CompiledMethod) -> Result<()> {
        let subscribers = read_lock!(self.subscribers).clone();
        for subscriber in subscribers {
            subscriber(event);
        }
        Ok(())
    }
}

/// A host runtime provider.
///
/// Optional methods have default implementations that fail with
/// [`Error::FeatureNotSupported`]; the [`crate::platform::PlatformTriple`] only calls them when
/// the matching [`RuntimeFeature`] is present.
pub trait Runtime: Send + Sync {
    /// The runtime family.
    fn kind(&self) -> RuntimeKind;

    /// Optional capabilities and requirements.
    fn features(&self) -> RuntimeFeature;

    /// The calling convention, if the runtime knows it without a self-test.
    fn abi(&self) -> Option<Abi>;

    /// The current entry point of `method`. This may lead through stubs before the real body.
    ///
    /// # Errors
    /// Returns [`Error::MethodBodyNotFound`] if the method has no entry point.
    fn entry_point(&self, method: &MethodHandle) -> Result<usize>;

    /// The representation of `method` that has identity.
    ///
    /// Requires [`RuntimeFeature::REQUIRES_METHOD_IDENTIFICATION`] to be consulted.
    fn identifiable(&self, method: &MethodHandle) -> MethodHandle {
        method.canonical().clone()
    }

    /// Compiles `method`, replacing any stub that defers compilation.
    ///
    /// # Errors
    /// Returns [`Error::Compile`] on failure.
    fn compile(&self, method: &MethodHandle) -> Result<()> {
        let _ = method;
        Err(Error::FeatureNotSupported("custom method compilation"))
    }

    /// Pins `method` so its code stays where it is.
    ///
    /// # Errors
    /// Returns [`Error::FeatureNotSupported`] unless pinning is required.
    fn pin(&self, method: &MethodHandle) -> Result<PinGuard> {
        let _ = method;
        Err(Error::FeatureNotSupported("method pinning"))
    }

    /// Prevents `method` from being inlined into its callers.
    ///
    /// # Errors
    /// Returns [`Error::FeatureNotSupported`] if inlining cannot be controlled.
    fn disable_inlining(&self, method: &MethodHandle) -> Result<()> {
        let _ = method;
        Err(Error::FeatureNotSupported("disabling inlining"))
    }

    /// Registers `callback` for method (re)compilation events.
    ///
    /// # Errors
    /// Returns [`Error::FeatureNotSupported`] without a compiler hook.
    fn subscribe_compiled(&self, callback: CompiledCallback) -> Result<()> {
        let _ = callback;
        Err(Error::FeatureNotSupported("compile notifications"))
    }
}

/// The runtime of plain machine code: a method is a function address and is always compiled.
#[derive(Debug, Clone)]
pub struct NativeRuntime {
    abi: Option<Abi>,
}

impl NativeRuntime {
    /// Creates the provider, using the system's calling convention.
    pub fn new(system: &dyn System) -> Self {
        NativeRuntime {
            abi: system.default_abi(),
        }
    }

    /// Creates the provider with an explicit calling convention.
    #[must_use]
    pub fn with_abi(abi: Abi) -> Self {
        NativeRuntime { abi: Some(abi) }
    }
}

impl Runtime for NativeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    fn features(&self) -> RuntimeFeature {
        if self.abi.is_some() {
            RuntimeFeature::HAS_KNOWN_ABI
        } else {
            RuntimeFeature::empty()
        }
    }

    fn abi(&self) -> Option<Abi> {
        self.abi.clone()
    }

    fn entry_point(&self, method: &MethodHandle) -> Result<usize> {
        method.function_address().ok_or_else(|| {
            Error::MethodBodyNotFound(format!("{method} is not a native function"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn native_entry_points() {
        let runtime = NativeRuntime::with_abi(Abi::system_v_amd64());
        let handle = MethodHandle::wrapped(9, MethodHandle::function(0x4000));
        assert_eq!(runtime.entry_point(&handle).unwrap(), 0x4000);
        assert!(matches!(
            runtime.entry_point(&MethodHandle::Token(3)),
            Err(Error::MethodBodyNotFound(_))
        ));
        assert_eq!(runtime.identifiable(&handle), MethodHandle::function(0x4000));
        assert!(runtime.features().contains(RuntimeFeature::HAS_KNOWN_ABI));
    }

    #[test]
    fn optional_methods_are_gated() {
        let runtime = NativeRuntime::with_abi(Abi::system_v_amd64());
        let handle = MethodHandle::function(0x4000);
        assert!(matches!(runtime.compile(&handle), Err(Error::FeatureNotSupported(_))));
        assert!(matches!(runtime.pin(&handle), Err(Error::FeatureNotSupported(_))));
        assert!(matches!(
            runtime.subscribe_compiled(Arc::new(|_| {})),
            Err(Error::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn pin_guard_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let guard = PinGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(guard);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifier_fans_out() {
        let notifier = CompileNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            notifier
                .subscribe(Arc::new(move |event: &CompiledMethod| {
                    seen.fetch_add(event.code_size, Ordering::SeqCst);
                }))
                .unwrap();
        }

        notifier
            .notify(&CompiledMethod {
                method: MethodHandle::Token(1),
                code_start: 0x1000,
                code_size: 2,
            })
            .unwrap();
        assert_eq!(notifier.subscriber_count().unwrap(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
