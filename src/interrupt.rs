//! # Interrupt Mask Controller
//!
//! The one primitive every other component builds on: global masking of
//! the local core's maskable interrupts.
//!
//! `disable`/`enable` are unconditional. `set_mask`/`clear_mask` are the
//! interrupt-context pair: they do not count nesting, they simply capture
//! the enable state and later put back exactly that state.

/// Enable state captured by [`InterruptMask::set_mask`].
///
/// Opaque to callers; the only thing to do with it is hand it back to
/// [`InterruptMask::clear_mask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a saved mask must be handed back to clear_mask"]
pub struct SavedMask {
    was_enabled: bool,
}

impl SavedMask {
    /// Build a saved mask from a raw enable bit.
    pub const fn from_enabled(was_enabled: bool) -> Self {
        Self { was_enabled }
    }

    /// Whether interrupts were enabled when the mask was taken.
    #[inline]
    pub const fn was_enabled(self) -> bool {
        self.was_enabled
    }
}

/// Global enable/disable of the local core's maskable interrupts.
///
/// Implementations act on processor state that every other component
/// observes; none of these operations can fail.
pub trait InterruptMask {
    /// Mask all maskable interrupts. Idempotent.
    fn disable(&self);

    /// Unmask all maskable interrupts.
    fn enable(&self);

    /// Current enable state of the local core.
    fn is_enabled(&self) -> bool;

    /// Read the enable state, then disable.
    ///
    /// The default is atomic with respect to the local core because once
    /// `disable` runs nothing can interleave; backends with a single
    /// read-and-disable instruction should override it.
    fn set_mask(&self) -> SavedMask {
        let was_enabled = self.is_enabled();
        self.disable();
        SavedMask::from_enabled(was_enabled)
    }

    /// Restore the state captured by [`set_mask`](Self::set_mask):
    /// enables only if interrupts were enabled before.
    fn clear_mask(&self, saved: SavedMask) {
        if saved.was_enabled() {
            self.enable();
        }
    }
}

impl<T: InterruptMask + ?Sized> InterruptMask for &T {
    fn disable(&self) {
        (**self).disable()
    }

    fn enable(&self) {
        (**self).enable()
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn set_mask(&self) -> SavedMask {
        (**self).set_mask()
    }

    fn clear_mask(&self, saved: SavedMask) {
        (**self).clear_mask(saved)
    }
}
