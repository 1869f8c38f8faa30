//! Bus hold request line.
//!
//! A device that needs the bus (a DMA transfer, for instance) asserts the
//! line; the CPU issues no instructions while any holder remains. The
//! clock keeps running.

use std::cell::Cell;
use std::rc::Rc;

/// Shared hold request, counted per holder.
#[derive(Debug, Clone, Default)]
pub struct HoldLine(Rc<Cell<u32>>);

impl HoldLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert(&self) {
        self.0.set(self.0.get().saturating_add(1));
    }

    pub fn release(&self) {
        self.0.set(self.0.get().saturating_sub(1));
    }

    pub fn is_held(&self) -> bool {
        self.0.get() > 0
    }
}
