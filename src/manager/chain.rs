//! The physical hook chain of one method.
//!
//! The method is detoured once, to a proxy stub. The proxy jumps to the first hook, and every
//! hook reaches the next one (or, for the last, the original code) through its own trampoline.
//! Relinking only retargets stubs, so the patch at the method itself is written once. When the
//! runtime recompiles the method, the root detour moves to the fresh code and the last
//! trampoline is pointed at the new original entry.
//!
//! A removed hook's trampoline is kept until a later update has drained the chain again, as
//! calls that went through it without entering the chain are not counted.

use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, trace};
use rustc_hash::FxHashMap;

use crate::{
    detour::{CoreDetour, DetourFactory},
    manager::{DepGraph, DetourConfig, DetourSyncInfo},
    platform::{arch::JumpStub, method::MethodHandle},
    Error, Result,
};

const NO_ORIGINAL: &str = "calling the original method from a hook chain";

/// One hook's place in a chain.
#[derive(Debug)]
pub(crate) struct ChainNode {
    pub(crate) id: u64,
    pub(crate) config: Option<DetourConfig>,
    pub(crate) target: usize,
    /// Where the hook continues: the next hook, or the original code
    pub(crate) trampoline: JumpStub,
}

#[derive(Default)]
struct ChainState {
    graph: DepGraph<u64>,
    /// Hooks without configuration, newest first
    unconfigured: Vec<u64>,
    nodes: FxHashMap<u64, Arc<ChainNode>>,
    order: Vec<u64>,
    root: Option<CoreDetour>,
    proxy: Option<JumpStub>,
    /// Unlinked hooks, released by the next update
    retired: Vec<Arc<ChainNode>>,
}

impl ChainState {
    fn forget(&mut self, id: u64) -> Option<Arc<ChainNode>> {
        if !self.graph.remove(id) {
            self.unconfigured.retain(|node| *node != id);
        }
        self.nodes.remove(&id)
    }
}

/// What [`MethodChain::snapshot`] saw.
pub(crate) struct ChainSnapshot {
    pub(crate) nodes: Vec<Arc<ChainNode>>,
    pub(crate) original: Option<usize>,
    pub(crate) is_detoured: bool,
}

/// All hooks on one canonical method.
pub(crate) struct MethodChain {
    this: Weak<MethodChain>,
    source: MethodHandle,
    sync: DetourSyncInfo,
    state: Mutex<ChainState>,
}

impl MethodChain {
    pub(crate) fn new(source: MethodHandle, spin_yield_after: u32) -> Arc<Self> {
        Arc::new_cyclic(|this| MethodChain {
            this: this.clone(),
            source,
            sync: DetourSyncInfo::new(spin_yield_after),
            state: Mutex::new(ChainState::default()),
        })
    }

    pub(crate) fn source(&self) -> &MethodHandle {
        &self.source
    }

    pub(crate) fn sync(&self) -> &DetourSyncInfo {
        &self.sync
    }

    /// Adds a hook and relinks. On failure the chain is restored without it.
    ///
    /// # Safety
    /// `target` must be callable in place of the source method.
    pub(crate) unsafe fn insert(
        &self,
        factory: &DetourFactory,
        id: u64,
        config: Option<DetourConfig>,
        target: usize,
    ) -> Result<Arc<ChainNode>> {
        let mut state = lock!(self.state);

        let trampoline = factory.triple().architecture().create_jump_stub(target)?;
        let node = Arc::new(ChainNode {
            id,
            config,
            target,
            trampoline,
        });
        match &node.config {
            Some(config) => state.graph.insert(id, config.clone())?,
            None => state.unconfigured.insert(0, id),
        }
        state.nodes.insert(id, node.clone());

        if let Err(e) = self.relink(&mut state, factory) {
            state.forget(id);
            if let Err(restore) = self.relink(&mut state, factory) {
                error!("Failed to restore the hook chain of {}: {restore}", self.source);
            }
            return Err(e);
        }
        Ok(node)
    }

    /// Removes a hook and relinks.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the hook is not in the chain. A failed relink is
    /// reported after the hook has been taken out.
    pub(crate) fn remove(&self, factory: &DetourFactory, id: u64) -> Result<Arc<ChainNode>> {
        let mut state = lock!(self.state);
        let Some(node) = state.forget(id) else {
            return Err(Error::InvalidState(format!(
                "Hook {id} is not applied to {}",
                self.source
            )));
        };

        // SAFETY: every remaining hook was added under the contract of `insert`
        let relinked = unsafe { self.relink(&mut state, factory) };
        state.retired.push(node.clone());
        relinked.map(|()| node)
    }

    /// Points the last trampoline at the original entry of the recompiled method.
    fn follow_original(&self) -> Result<()> {
        let state = lock!(self.state);
        let Some(root) = state.root.as_ref().filter(|root| root.is_applied()) else {
            return Ok(());
        };
        let original = root
            .original_entry()?
            .ok_or(Error::FeatureNotSupported(NO_ORIGINAL))?;

        let _update = self.sync.begin_update()?;
        if let Some(tail) = state.order.last().and_then(|id| state.nodes.get(id)) {
            trace!("Hook {} continues at {original:#x}", tail.id);
            tail.trampoline.retarget(original);
        }
        debug!("Hook chain of {} follows its recompiled code", self.source);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Result<ChainSnapshot> {
        let state = lock!(self.state);
        let nodes = state
            .order
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect();
        let (original, is_detoured) = match &state.root {
            Some(root) => (root.original_entry()?, root.is_applied()),
            None => (None, false),
        };
        Ok(ChainSnapshot {
            nodes,
            original,
            is_detoured,
        })
    }

    /// Rebuilds the physical chain from the graph and the unconfigured hooks.
    ///
    /// Waits for calls through the chain to drain first, and undoes the root detour once no
    /// hook is left.
    unsafe fn relink(&self, state: &mut ChainState, factory: &DetourFactory) -> Result<()> {
        let order: Vec<u64> = state
            .graph
            .order()
            .iter()
            .chain(&state.unconfigured)
            .copied()
            .collect();
        let nodes: Vec<Arc<ChainNode>> = order
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect();

        let _update = self.sync.begin_update()?;
        let released = std::mem::take(&mut state.retired);
        if !released.is_empty() {
            trace!("Releasing {} unlinked hook(s) of {}", released.len(), self.source);
        }

        let Some(first) = nodes.first() else {
            if let Some(root) = state.root.as_ref().filter(|root| root.is_applied()) {
                root.undo()?;
            }
            state.order.clear();
            debug!("No hooks left on {}", self.source);
            return Ok(());
        };

        let proxy = match state.proxy.take() {
            Some(proxy) => proxy,
            None => factory
                .triple()
                .architecture()
                .create_jump_stub(first.target)?,
        };
        let proxy: &JumpStub = state.proxy.insert(proxy);

        let root = match state.root.take() {
            Some(root) => root,
            None => {
                let root = factory.create_detour(
                    &self.source,
                    &MethodHandle::function(proxy.entry()),
                    false,
                )?;
                let chain = self.this.clone();
                root.on_relocated(move || {
                    let Some(chain) = chain.upgrade() else {
                        return;
                    };
                    if let Err(e) = chain.follow_original() {
                        error!("Failed to relink {} after recompilation: {e}", chain.source);
                    }
                })?;
                root
            }
        };
        let root = state.root.insert(root);

        if root.is_applied() {
            let fallback = root
                .original_entry()?
                .ok_or(Error::FeatureNotSupported(NO_ORIGINAL))?;
            link(&nodes, proxy, fallback);
        } else {
            root.apply_with(|original| {
                let fallback = original.ok_or(Error::FeatureNotSupported(NO_ORIGINAL))?;
                link(&nodes, proxy, fallback);
                Ok(())
            })?;
        }

        debug!("Relinked {} hook(s) on {}", nodes.len(), self.source);
        state.order = order;
        Ok(())
    }
}

/// Points every trampoline at its successor, tail first, then the proxy at the head.
fn link(nodes: &[Arc<ChainNode>], proxy: &JumpStub, fallback: usize) {
    let mut next = fallback;
    for node in nodes.iter().rev() {
        trace!("Hook {} continues at {next:#x}", node.id);
        node.trampoline.retarget(next);
        next = node.target;
    }
    trace!("Chain proxy {:#x} leads to {next:#x}", proxy.entry());
    proxy.retarget(next);
}
