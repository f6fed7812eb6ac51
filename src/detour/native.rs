//! Native detours that keep the original code callable.

use log::debug;

use crate::{
    detour::SimpleNativeDetour,
    platform::system::Allocation,
    Result,
};

/// A [`SimpleNativeDetour`] together with an alternate entry point: a relocated copy of the
/// instructions the patch overwrote, which then continues in the original code.
#[derive(Debug)]
pub struct NativeDetour {
    simple: SimpleNativeDetour,
    alt_entry: Option<Box<dyn Allocation>>,
}

impl NativeDetour {
    pub(crate) fn new(simple: SimpleNativeDetour, alt_entry: Option<Box<dyn Allocation>>) -> Self {
        NativeDetour { simple, alt_entry }
    }

    /// The patched address.
    #[must_use]
    pub fn source(&self) -> usize {
        self.simple.source()
    }

    /// Where the patch leads.
    #[must_use]
    pub fn destination(&self) -> usize {
        self.simple.destination()
    }

    /// Address that runs the original code, if an alternate entry was built.
    #[must_use]
    pub fn alt_entry(&self) -> Option<usize> {
        self.alt_entry.as_ref().map(|entry| entry.base())
    }

    /// The underlying patch.
    #[must_use]
    pub fn simple(&self) -> &SimpleNativeDetour {
        &self.simple
    }

    /// `true` until undone.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.simple.is_applied()
    }

    /// Points the detour at `to`.
    ///
    /// The alternate entry only relocated the bytes of the original patch, so a retarget that
    /// needs a larger encoding is refused.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidState`] if the patch would have to grow.
    ///
    /// # Safety
    /// `to` must be callable in place of the source.
    pub unsafe fn retarget(&mut self, to: usize) -> Result<()> {
        let limit = self.simple.backup().len();
        if self.alt_entry.is_some() {
            self.simple.retarget_within(to, Some(limit))
        } else {
            self.simple.retarget(to)
        }
    }

    /// Restores the original code. The alternate entry stays alive until the detour is dropped.
    ///
    /// # Errors
    /// Returns [`crate::Error::Disposed`] if already undone.
    pub fn undo(&mut self) -> Result<()> {
        self.simple.undo()
    }

    /// Gives up the detour, handing back the alternate entry so callers that may still run
    /// through it can keep it alive.
    ///
    /// An applied patch is left in place; this is for code the runtime has discarded.
    pub(crate) fn into_alt_entry(self) -> Option<Box<dyn Allocation>> {
        if self.simple.is_applied() {
            debug!("Leaving detour at {:#x} in discarded code", self.simple.source());
        }
        self.simple.abandon();
        self.alt_entry
    }
}
