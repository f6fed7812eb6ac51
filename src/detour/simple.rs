//! Patches at a single code address.

use std::sync::Arc;

use log::{error, trace, warn};

use crate::{
    platform::{
        arch::{Architecture, DetourKind, NativeDetourInfo, Retarget},
        system::{PatchTargetKind, System},
    },
    Error, Result,
};

/// An applied jump from one code address to another, with the bytes it overwrote.
///
/// Dropping a detour that was not undone undoes it and logs a warning.
pub struct SimpleNativeDetour {
    architecture: Arc<dyn Architecture>,
    system: Arc<dyn System>,
    info: NativeDetourInfo,
    backup: Vec<u8>,
    applied: bool,
}

impl SimpleNativeDetour {
    /// Computes the detour from `from` to `to` and patches it in.
    ///
    /// # Errors
    /// Propagates encoding, allocation and protection failures; nothing is patched on error.
    ///
    /// # Safety
    /// `from` must be the start of code that may be overwritten by up to `max_size` bytes (the
    /// largest encoding if `None`), and `to` must be code callable in place of it.
    pub unsafe fn apply(
        architecture: Arc<dyn Architecture>,
        system: Arc<dyn System>,
        from: usize,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<Self> {
        let info = architecture.compute_detour_info(from, to, max_size)?;
        Self::apply_info(architecture, system, info)
    }

    /// Patches in an already computed detour.
    pub(crate) unsafe fn apply_info(
        architecture: Arc<dyn Architecture>,
        system: Arc<dyn System>,
        info: NativeDetourInfo,
    ) -> Result<Self> {
        let (from, to) = (info.from(), info.to());
        let bytes = architecture.detour_bytes(&info)?;

        let mut backup = vec![0u8; bytes.len()];
        system.patch_data(PatchTargetKind::Executable, from, &bytes, Some(&mut backup))?;
        trace!("Applied {} detour {:#x} -> {:#x}", info.kind(), from, to);

        Ok(SimpleNativeDetour {
            architecture,
            system,
            info,
            backup,
            applied: true,
        })
    }

    /// The patched address.
    #[must_use]
    pub fn source(&self) -> usize {
        self.info.from()
    }

    /// Where the patch leads.
    #[must_use]
    pub fn destination(&self) -> usize {
        self.info.to()
    }

    /// The current encoding.
    #[must_use]
    pub fn kind(&self) -> DetourKind {
        self.info.kind()
    }

    /// The original bytes under the patch.
    #[must_use]
    pub fn backup(&self) -> &[u8] {
        &self.backup
    }

    /// `true` until [`SimpleNativeDetour::undo`] runs.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Points the detour at `to`.
    ///
    /// Indirect encodings swap their cell without touching the source; others are repatched, and
    /// a larger encoding extends the backup with the original bytes it now covers.
    ///
    /// # Errors
    /// Returns [`Error::Disposed`] after undo, and propagates patch failures.
    ///
    /// # Safety
    /// `to` must be callable in place of the source. If the encoding grows, the bytes past the
    /// old patch must be safe to overwrite.
    pub unsafe fn retarget(&mut self, to: usize) -> Result<()> {
        self.retarget_within(to, None)
    }

    /// Like [`SimpleNativeDetour::retarget`], but fails with [`Error::InvalidState`] instead of
    /// growing the patch past `limit` bytes.
    pub(crate) unsafe fn retarget_within(&mut self, to: usize, limit: Option<usize>) -> Result<()> {
        if !self.applied {
            return Err(Error::Disposed("native detour"));
        }

        match self.architecture.retarget(&mut self.info, to, limit)? {
            Retarget::InPlace => {
                trace!("Retargeted {:#x} in place -> {:#x}", self.source(), to);
            }
            Retarget::Repatch(info) => {
                if limit.is_some_and(|limit| info.size() > limit) {
                    return Err(Error::InvalidState(format!(
                        "Retargeting {:#x} needs a {} byte patch",
                        info.from(),
                        info.size()
                    )));
                }

                let bytes = self.architecture.detour_bytes(&info)?;
                if bytes.len() > self.backup.len() {
                    let mut covered = vec![0u8; bytes.len()];
                    self.system.patch_data(
                        PatchTargetKind::Executable,
                        info.from(),
                        &bytes,
                        Some(&mut covered),
                    )?;
                    self.backup
                        .extend_from_slice(&covered[self.backup.len()..]);
                } else {
                    self.system
                        .patch_data(PatchTargetKind::Executable, info.from(), &bytes, None)?;
                }

                trace!(
                    "Repatched {:#x} as {} -> {:#x}",
                    info.from(),
                    info.kind(),
                    to
                );
                self.info = info;
            }
        }
        Ok(())
    }

    /// Restores the original bytes.
    ///
    /// # Errors
    /// Returns [`Error::Disposed`] if already undone, and propagates protection failures.
    pub fn undo(&mut self) -> Result<()> {
        if !self.applied {
            return Err(Error::Disposed("native detour"));
        }

        // SAFETY: the backup holds exactly the bytes this detour replaced at its source
        unsafe {
            self.system.patch_data(
                PatchTargetKind::Executable,
                self.info.from(),
                &self.backup,
                None,
            )?;
        }
        self.applied = false;
        trace!("Undid detour at {:#x}", self.info.from());
        Ok(())
    }

    /// Forgets the patch without restoring the source, for code the runtime has discarded.
    pub(crate) fn abandon(mut self) {
        self.applied = false;
    }
}

impl std::fmt::Debug for SimpleNativeDetour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleNativeDetour")
            .field("info", &self.info)
            .field("backup", &self.backup)
            .field("applied", &self.applied)
            .finish()
    }
}

impl Drop for SimpleNativeDetour {
    fn drop(&mut self) {
        if self.applied {
            warn!(
                "Detour at {:#x} dropped while applied; undoing",
                self.info.from()
            );
            if let Err(e) = self.undo() {
                error!("Failed to undo detour at {:#x}: {e}", self.info.from());
            }
        }
    }
}
