//! Ordered hook chains.
//!
//! Any number of hooks can be added to the same method. The [`DetourManager`] keeps them in one
//! chain per method: hooks with a [`DetourConfig`] are ordered by priority and before/after
//! constraints through a [`DepGraph`], hooks without one follow, newest first. Each hook reaches
//! the rest of the chain through [`Hook::original`], which ends in the original code.
//!
//! Calls through a chain are counted by its [`DetourSyncInfo`]; a hook brackets its work with
//! [`Hook::enter`] so that chain updates wait for it to finish instead of retargeting stubs
//! underneath it.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::OnceLock;
//! use detourcore::{manager::{DetourConfig, DetourManager, Hook}, platform::PlatformTriple};
//!
//! #[inline(never)]
//! extern "C" fn greet(x: i32) -> i32 { x }
//!
//! static HOOK: OnceLock<Hook> = OnceLock::new();
//!
//! extern "C" fn double(x: i32) -> i32 {
//!     let hook = HOOK.get().unwrap();
//!     let _call = hook.enter().unwrap();
//!     let original: extern "C" fn(i32) -> i32 = unsafe { hook.original_fn() };
//!     original(x) * 2
//! }
//!
//! let manager = DetourManager::new(PlatformTriple::current()?)?;
//! let hook = unsafe {
//!     manager.add_fn(
//!         greet as extern "C" fn(i32) -> i32,
//!         double as extern "C" fn(i32) -> i32,
//!         Some(DetourConfig::new("double")),
//!     )?
//! };
//! HOOK.set(hook).unwrap();
//! assert_eq!(std::hint::black_box(greet as extern "C" fn(i32) -> i32)(21), 42);
//! # Ok::<(), detourcore::Error>(())
//! ```

mod chain;
mod config;
mod graph;
mod sync;

pub use config::DetourConfig;
pub use graph::DepGraph;
pub use sync::{CallGuard, ChainUpdateGuard, DetourSyncInfo};

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, RwLock,
};

use dashmap::DashMap;
use log::{debug, error};
use rustc_hash::FxBuildHasher;

use crate::{
    detour::{DetourFactory, Function},
    manager::chain::{ChainNode, MethodChain},
    platform::{features::ArchitectureFeature, method::MethodHandle, PlatformTriple},
    Error, Result,
};

/// Callback fired when a hook is applied or undone.
pub type EventCallback = Arc<dyn Fn(&DetourEvent) + Send + Sync>;

/// A hook as seen in a [`DetourInfo`] snapshot or a [`DetourEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    /// Identity assigned by the manager
    pub id: u64,
    /// Ordering configuration, if any
    pub config: Option<DetourConfig>,
    /// The hook function
    pub target: usize,
    /// Where the hook continues the chain
    pub trampoline: usize,
}

impl HookInfo {
    fn from_node(node: &ChainNode) -> Self {
        HookInfo {
            id: node.id,
            config: node.config.clone(),
            target: node.target,
            trampoline: node.trampoline.entry(),
        }
    }
}

/// The hooks applied to one method, first-called first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetourInfo {
    /// The canonical method
    pub method: MethodHandle,
    /// Applied hooks in chain order
    pub hooks: Vec<HookInfo>,
    /// Entry that runs the original code, while the method is detoured
    pub original: Option<usize>,
    /// `true` while the method itself is patched
    pub is_detoured: bool,
}

/// A hook being applied to or undone from `method`.
#[derive(Debug, Clone)]
pub struct DetourEvent {
    /// The canonical method
    pub method: MethodHandle,
    /// The hook
    pub hook: HookInfo,
}

struct ManagerShared {
    factory: DetourFactory,
    chains: DashMap<MethodHandle, Arc<MethodChain>, FxBuildHasher>,
    next_id: AtomicU64,
    on_applied: RwLock<Vec<EventCallback>>,
    on_undone: RwLock<Vec<EventCallback>>,
}

impl ManagerShared {
    fn fire(callbacks: &RwLock<Vec<EventCallback>>, event: &DetourEvent) {
        let callbacks = match callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => {
                error!("Hook event callbacks are poisoned, dropping event for {}", event.method);
                return;
            }
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

/// Keeps the hook chains of all methods hooked through it.
///
/// Cloning is cheap; clones share the same chains.
#[derive(Clone)]
pub struct DetourManager {
    shared: Arc<ManagerShared>,
}

impl DetourManager {
    /// Creates a manager on `triple`.
    ///
    /// # Errors
    /// Returns [`Error::FeatureNotSupported`] if the triple cannot build alternate entry points,
    /// without which hooks could not reach the original code.
    pub fn new(triple: Arc<PlatformTriple>) -> Result<Self> {
        if !triple.config().create_alt_entry_points
            || !triple
                .features()
                .has_arch(ArchitectureFeature::CREATE_ALT_ENTRY_POINT)
        {
            return Err(Error::FeatureNotSupported(
                "hook chains without alternate entry points",
            ));
        }

        Ok(DetourManager {
            shared: Arc::new(ManagerShared {
                factory: DetourFactory::new(triple)?,
                chains: DashMap::with_hasher(FxBuildHasher),
                next_id: AtomicU64::new(1),
                on_applied: RwLock::new(Vec::new()),
                on_undone: RwLock::new(Vec::new()),
            }),
        })
    }

    /// The factory the chains detour through.
    #[must_use]
    pub fn factory(&self) -> &DetourFactory {
        &self.shared.factory
    }

    /// Adds the function at `target` to the chain of `source`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] when hooking a function with itself,
    /// [`Error::DependencyCycle`] if `config` contradicts the hooks already applied, and
    /// propagates resolution and patching failures. The chain is unchanged on error.
    ///
    /// # Safety
    /// `target` must be callable in place of `source`, and may only continue the chain through
    /// [`Hook::original`].
    pub unsafe fn add_hook(
        &self,
        source: &MethodHandle,
        target: usize,
        config: Option<DetourConfig>,
    ) -> Result<Hook> {
        let shared = &self.shared;
        let method = shared.factory.triple().canonicalize(source);
        if method.function_address() == Some(target) {
            return Err(Error::InvalidArgument(format!(
                "Cannot hook {method} with itself"
            )));
        }

        let spin_yield_after = shared.factory.triple().config().spin_yield_after;
        let chain = shared
            .chains
            .entry(method.clone())
            .or_insert_with(|| MethodChain::new(method, spin_yield_after))
            .clone();

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let node = chain.insert(&shared.factory, id, config, target)?;
        debug!("Added hook {id} at {target:#x} to {}", chain.source());

        let hook = Hook {
            shared: shared.clone(),
            chain,
            node,
            applied: AtomicBool::new(true),
        };
        ManagerShared::fire(&shared.on_applied, &hook.event());
        Ok(hook)
    }

    /// Typed form of [`DetourManager::add_hook`].
    ///
    /// # Errors
    /// See [`DetourManager::add_hook`].
    ///
    /// # Safety
    /// See [`DetourManager::add_hook`].
    pub unsafe fn add_fn<F: Function>(
        &self,
        source: F,
        target: F,
        config: Option<DetourConfig>,
    ) -> Result<Hook> {
        self.add_hook(
            &MethodHandle::function(source.to_address()),
            target.to_address(),
            config,
        )
    }

    /// The hooks currently applied to `method`.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the chain is poisoned.
    pub fn detour_info(&self, method: &MethodHandle) -> Result<DetourInfo> {
        let method = self.shared.factory.triple().canonicalize(method);
        let chain = self.shared.chains.get(&method).map(|chain| chain.clone());
        let Some(chain) = chain else {
            return Ok(DetourInfo {
                method,
                hooks: Vec::new(),
                original: None,
                is_detoured: false,
            });
        };

        let snapshot = chain.snapshot()?;
        Ok(DetourInfo {
            method,
            hooks: snapshot
                .nodes
                .iter()
                .map(|node| HookInfo::from_node(node))
                .collect(),
            original: snapshot.original,
            is_detoured: snapshot.is_detoured,
        })
    }

    /// Calls `callback` after every hook this manager applies.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the callback list is poisoned.
    pub fn on_applied(
        &self,
        callback: impl Fn(&DetourEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        write_lock!(self.shared.on_applied).push(Arc::new(callback));
        Ok(())
    }

    /// Calls `callback` after every hook of this manager is undone.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the callback list is poisoned.
    pub fn on_undone(&self, callback: impl Fn(&DetourEvent) + Send + Sync + 'static) -> Result<()> {
        write_lock!(self.shared.on_undone).push(Arc::new(callback));
        Ok(())
    }
}

impl std::fmt::Debug for DetourManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetourManager")
            .field("methods", &self.shared.chains.len())
            .finish()
    }
}

/// A hook in a chain. Undone when dropped.
pub struct Hook {
    shared: Arc<ManagerShared>,
    chain: Arc<MethodChain>,
    node: Arc<ChainNode>,
    applied: AtomicBool,
}

impl Hook {
    /// Identity assigned by the manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.node.id
    }

    /// The hooked method.
    #[must_use]
    pub fn source(&self) -> &MethodHandle {
        self.chain.source()
    }

    /// The hook function.
    #[must_use]
    pub fn target(&self) -> usize {
        self.node.target
    }

    /// The ordering configuration.
    #[must_use]
    pub fn config(&self) -> Option<&DetourConfig> {
        self.node.config.as_ref()
    }

    /// Address that continues the chain: the next hook, or the original code.
    ///
    /// Stays valid while the hook is alive, also after it is undone.
    #[must_use]
    pub fn original(&self) -> usize {
        self.node.trampoline.entry()
    }

    /// [`Hook::original`] as a typed function.
    ///
    /// # Safety
    /// `F` must be the signature of the hooked method.
    #[must_use]
    pub unsafe fn original_fn<F: Function>(&self) -> F {
        F::from_address(self.original())
    }

    /// Registers a call through the chain; chain updates wait until the guard is dropped.
    ///
    /// # Errors
    /// Returns [`Error::ChainUpdateReentry`] if the calling thread is updating this chain.
    pub fn enter(&self) -> Result<CallGuard<'_>> {
        self.chain.sync().enter()
    }

    /// `true` until undone.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.applied.load(Ordering::Acquire)
    }

    /// Current view of this hook.
    #[must_use]
    pub fn info(&self) -> HookInfo {
        HookInfo::from_node(&self.node)
    }

    fn event(&self) -> DetourEvent {
        DetourEvent {
            method: self.chain.source().clone(),
            hook: self.info(),
        }
    }

    /// Takes the hook out of its chain.
    ///
    /// # Errors
    /// Returns [`Error::Disposed`] if already undone, and propagates relink failures; the hook
    /// is out of the chain either way.
    pub fn undo(&self) -> Result<()> {
        if !self.applied.swap(false, Ordering::AcqRel) {
            return Err(Error::Disposed("hook"));
        }

        let removed = self.chain.remove(&self.shared.factory, self.node.id);
        debug!("Removed hook {} from {}", self.node.id, self.chain.source());
        ManagerShared::fire(&self.shared.on_undone, &self.event());
        removed.map(|_| ())
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.node.id)
            .field("source", self.chain.source())
            .field("target", &format_args!("{:#x}", self.node.target))
            .field("applied", &self.is_applied())
            .finish()
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        if self.is_applied() {
            if let Err(e) = self.undo() {
                error!(
                    "Failed to undo hook {} on {}: {e}",
                    self.node.id,
                    self.chain.source()
                );
            }
        }
    }
}
