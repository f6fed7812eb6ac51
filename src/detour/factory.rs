//! Method-level detours that follow their methods through recompilation.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use dashmap::DashMap;
use log::{debug, error};
use rustc_hash::FxBuildHasher;

use crate::{
    detour::{NativeDetour, ReentrancyGuard},
    platform::{
        features::RuntimeFeature,
        method::MethodHandle,
        runtime::{CompiledMethod, PinGuard},
        system::Allocation,
        PlatformTriple,
    },
    Error, Result,
};

type Registry = DashMap<MethodHandle, Vec<Weak<DetourState>>, FxBuildHasher>;

/// Callback fired after a detour moved to recompiled source code.
pub type RelocatedCallback = Arc<dyn Fn() + Send + Sync>;

struct FactoryShared {
    triple: Arc<PlatformTriple>,
    registry: Registry,
}

impl FactoryShared {
    fn on_method_compiled(&self, event: &CompiledMethod) {
        let method = self.triple.canonicalize(&event.method);
        let related: Vec<Arc<DetourState>> = self
            .registry
            .get(&method)
            .map(|detours| detours.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default();

        for state in related {
            if let Err(e) = state.on_compiled(&self.triple, &method, event) {
                error!(
                    "Failed to move detour {} -> {} to recompiled code: {e}",
                    state.source, state.target
                );
            }
        }
    }

    fn register(&self, state: &Arc<DetourState>) {
        for key in [&state.source, &state.target] {
            self.registry
                .entry(key.clone())
                .or_default()
                .push(Arc::downgrade(state));
        }
    }

    fn unregister(&self, state: &Arc<DetourState>) {
        for key in [&state.source, &state.target] {
            if let Some(mut detours) = self.registry.get_mut(key) {
                detours.retain(|detour| {
                    detour.strong_count() > 0 && !std::ptr::eq(detour.as_ptr(), Arc::as_ptr(state))
                });
            }
            self.registry.remove_if(key, |_, detours| detours.is_empty());
        }
    }
}

/// Creates [`CoreDetour`]s on a platform triple.
///
/// If the runtime reports recompilations, the factory subscribes once and moves every affected
/// detour to the fresh code.
pub struct DetourFactory {
    shared: Arc<FactoryShared>,
}

impl DetourFactory {
    /// Creates a factory for `triple`.
    ///
    /// # Errors
    /// Propagates a failed compile-event subscription.
    pub fn new(triple: Arc<PlatformTriple>) -> Result<Self> {
        let shared = Arc::new(FactoryShared {
            triple,
            registry: DashMap::with_hasher(FxBuildHasher),
        });

        if shared
            .triple
            .features()
            .has_runtime(RuntimeFeature::COMPILE_METHOD_HOOK)
        {
            let weak = Arc::downgrade(&shared);
            shared
                .triple
                .runtime()
                .subscribe_compiled(Arc::new(move |event: &CompiledMethod| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_method_compiled(event);
                    }
                }))?;
        }

        Ok(DetourFactory { shared })
    }

    /// The triple detours are created on.
    #[must_use]
    pub fn triple(&self) -> &Arc<PlatformTriple> {
        &self.shared.triple
    }

    /// Creates a detour from `source` to `target`, applying it if `apply` is set.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if both are the same method, and propagates resolution
    /// and patching failures.
    ///
    /// # Safety
    /// `target` must be callable in place of `source`: same signature, same calling convention.
    pub unsafe fn create_detour(
        &self,
        source: &MethodHandle,
        target: &MethodHandle,
        apply: bool,
    ) -> Result<CoreDetour> {
        let triple = &self.shared.triple;
        let source = triple.canonicalize(source);
        let target = triple.canonicalize(target);
        if source == target {
            return Err(Error::InvalidArgument(format!(
                "Cannot detour {source} to itself"
            )));
        }

        if !triple.try_disable_inlining(&source)? {
            debug!("{source} may still be inlined into its callers");
        }

        let state = Arc::new(DetourState {
            source,
            target,
            inner: Mutex::new(DetourInner::default()),
            applied: AtomicBool::new(false),
            guard: ReentrancyGuard::new(),
            relocated: Mutex::new(None),
        });
        self.shared.register(&state);

        let detour = CoreDetour {
            state,
            shared: self.shared.clone(),
        };
        if apply {
            detour.apply()?;
        }
        Ok(detour)
    }
}

#[derive(Default)]
struct DetourInner {
    native: Option<NativeDetour>,
    pins: Vec<PinGuard>,
    retired: Vec<Box<dyn Allocation>>,
}

struct DetourState {
    source: MethodHandle,
    target: MethodHandle,
    inner: Mutex<DetourInner>,
    applied: AtomicBool,
    guard: ReentrancyGuard,
    relocated: Mutex<Option<RelocatedCallback>>,
}

impl DetourState {
    fn on_compiled(
        &self,
        triple: &PlatformTriple,
        method: &MethodHandle,
        event: &CompiledMethod,
    ) -> Result<()> {
        // Compiling while applying reports back here on the same thread
        if !self.applied.load(Ordering::Acquire) || self.guard.is_entered() {
            return Ok(());
        }

        let is_source = *method == self.source;
        let is_target = *method == self.target;
        if !is_source && !is_target {
            return Ok(());
        }

        let mut inner = lock!(self.inner);
        let Some(_scope) = self.guard.enter() else {
            return Ok(());
        };
        if !self.applied.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(mut native) = inner.native.take() else {
            return Ok(());
        };

        if is_source {
            let to = if is_target {
                event.code_start
            } else {
                native.destination()
            };
            inner.retired.extend(native.into_alt_entry());

            // SAFETY: the runtime reported code_size bytes of fresh code at code_start
            let fresh = unsafe {
                triple.create_native_detour(event.code_start, to, Some(event.code_size))
            };
            match fresh {
                Ok(fresh) => {
                    debug!(
                        "Moved detour of {} to recompiled code at {:#x}",
                        self.source, event.code_start
                    );
                    inner.native = Some(fresh);
                    drop(inner);

                    let relocated = lock!(self.relocated).clone();
                    if let Some(relocated) = relocated {
                        relocated();
                    }
                    Ok(())
                }
                Err(e) => {
                    self.applied.store(false, Ordering::Release);
                    Err(e)
                }
            }
        } else {
            // SAFETY: the recompiled target has the signature the detour was created with
            let retargeted = unsafe { native.retarget(event.code_start) };
            inner.native = Some(native);
            retargeted
        }
    }
}

/// A detour from one method to another.
///
/// Undone when dropped.
pub struct CoreDetour {
    state: Arc<DetourState>,
    shared: Arc<FactoryShared>,
}

impl CoreDetour {
    /// The detoured method.
    #[must_use]
    pub fn source(&self) -> &MethodHandle {
        &self.state.source
    }

    /// The method calls are redirected to.
    #[must_use]
    pub fn target(&self) -> &MethodHandle {
        &self.state.target
    }

    /// `true` while applied.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.state.applied.load(Ordering::Acquire)
    }

    /// Resolves both methods to their bodies and patches the source.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if already applied, and propagates resolution and
    /// patching failures.
    ///
    /// # Safety
    /// See [`DetourFactory::create_detour`].
    pub unsafe fn apply(&self) -> Result<()> {
        self.apply_with(|_| Ok(()))
    }

    /// Applies the detour, running `before_patch` with the address of the original entry once
    /// it exists and before the source is patched.
    ///
    /// # Errors
    /// Same as [`CoreDetour::apply`], plus failures of `before_patch`, which leave the detour
    /// unapplied.
    ///
    /// # Safety
    /// See [`DetourFactory::create_detour`].
    pub unsafe fn apply_with(
        &self,
        before_patch: impl FnOnce(Option<usize>) -> Result<()>,
    ) -> Result<()> {
        let state = &self.state;
        let mut inner = lock!(state.inner);
        if state.applied.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!(
                "Detour {} -> {} is already applied",
                state.source, state.target
            )));
        }
        let Some(_scope) = state.guard.enter() else {
            return Err(Error::InvalidState(format!(
                "Detour {} -> {} applied while applying",
                state.source, state.target
            )));
        };

        let triple = &self.shared.triple;
        let mut pins = Vec::new();
        pins.extend(triple.pin_if_needed(&state.source)?);
        pins.extend(triple.pin_if_needed(&state.target)?);

        let from = triple.resolve_entry_point(&state.source)?;
        let to = triple.resolve_entry_point(&state.target)?;
        let native = triple.create_native_detour_with(from, to, None, before_patch)?;
        debug!(
            "Applied detour {} -> {} ({from:#x} -> {to:#x})",
            state.source, state.target
        );

        inner.native = Some(native);
        inner.pins = pins;
        state.applied.store(true, Ordering::Release);
        Ok(())
    }

    /// Restores the source method.
    ///
    /// # Errors
    /// Returns [`Error::Disposed`] if the detour is not applied.
    pub fn undo(&self) -> Result<()> {
        let state = &self.state;
        let mut inner = lock!(state.inner);
        if !state.applied.load(Ordering::Acquire) {
            return Err(Error::Disposed("core detour"));
        }
        let Some(_scope) = state.guard.enter() else {
            return Err(Error::InvalidState(format!(
                "Detour {} -> {} undone while applying",
                state.source, state.target
            )));
        };

        state.applied.store(false, Ordering::Release);
        if let Some(mut native) = inner.native.take() {
            let undone = native.undo();
            inner.retired.extend(native.into_alt_entry());
            undone?;
        }
        inner.pins.clear();
        debug!("Undid detour {} -> {}", state.source, state.target);
        Ok(())
    }

    /// Address that runs the original code of the source, if an alternate entry exists.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the detour state is poisoned.
    pub fn original_entry(&self) -> Result<Option<usize>> {
        Ok(lock!(self.state.inner)
            .native
            .as_ref()
            .and_then(NativeDetour::alt_entry))
    }

    /// Calls `callback` whenever the source is recompiled and the detour moves along, after the
    /// fresh code is patched. [`CoreDetour::original_entry`] is the new alternate entry by then;
    /// the previous one stays alive as long as the detour.
    ///
    /// Replaces an earlier callback. Runs on the thread reporting the compilation, with no lock
    /// of this detour held.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the detour state is poisoned.
    pub fn on_relocated(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        *lock!(self.state.relocated) = Some(Arc::new(callback));
        Ok(())
    }

    /// The patched address, while applied.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the detour state is poisoned.
    pub fn source_entry(&self) -> Result<Option<usize>> {
        Ok(lock!(self.state.inner)
            .native
            .as_ref()
            .map(NativeDetour::source))
    }
}

impl std::fmt::Debug for CoreDetour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreDetour")
            .field("source", &self.state.source)
            .field("target", &self.state.target)
            .field("applied", &self.is_applied())
            .finish()
    }
}

impl Drop for CoreDetour {
    fn drop(&mut self) {
        if self.is_applied() {
            if let Err(e) = self.undo() {
                error!(
                    "Failed to undo detour {} -> {}: {e}",
                    self.state.source, self.state.target
                );
            }
        }
        self.shared.unregister(&self.state);
    }
}
