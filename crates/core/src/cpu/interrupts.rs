//! Interrupt line decoding and per-category aggregation.
//!
//! Several external lines can map to one engine category. A category stays
//! asserted while at least one of its lines is.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::common::CpuError;
use crate::engine::EngineLink;

/// Interrupt category understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InterruptCategory {
    /// Ordinary hardware interrupt.
    Hard,
    /// First target-specific external line.
    TargetExternal0,
    /// Second target-specific external line.
    TargetExternal1,
}

impl InterruptCategory {
    /// Engine bit of the category.
    pub const fn mask(self) -> u32 {
        match self {
            Self::Hard => 0x02,
            Self::TargetExternal0 => 0x08,
            Self::TargetExternal1 => 0x10,
        }
    }
}

/// Maps architecture-specific interrupt numbers to categories.
pub trait InterruptDecoder: Send + Sync {
    /// Category of line `number`.
    fn decode(&self, number: i32) -> Result<InterruptCategory, CpuError>;
}

/// Line 0 is `Hard`, lines 1 and 2 are the target-specific externals.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInterruptDecoder;

impl InterruptDecoder for DefaultInterruptDecoder {
    fn decode(&self, number: i32) -> Result<InterruptCategory, CpuError> {
        match number {
            0 => Ok(InterruptCategory::Hard),
            1 => Ok(InterruptCategory::TargetExternal0),
            2 => Ok(InterruptCategory::TargetExternal1),
            other => Err(CpuError::InvalidInterrupt(other)),
        }
    }
}

/// Asserted lines per category.
#[derive(Debug, Default)]
pub struct InterruptAggregator {
    asserted: Mutex<HashMap<InterruptCategory, BTreeSet<i32>>>,
}

impl InterruptAggregator {
    /// Creates an aggregator with nothing asserted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records line `number` of `category`, publishes the category state to `link` and
    /// returns whether the category is asserted.
    ///
    /// The link is written inside the same critical section as the line set, so
    /// concurrent callers publish in the order they updated the lines.
    pub fn set(
        &self,
        category: InterruptCategory,
        number: i32,
        value: bool,
        link: &EngineLink,
    ) -> bool {
        let mut asserted = self.asserted.lock().unwrap_or_else(PoisonError::into_inner);
        let lines = asserted.entry(category).or_default();
        if value {
            let _ = lines.insert(number);
        } else {
            let _ = lines.remove(&number);
        }
        let any = !lines.is_empty();
        link.set_irq(category.mask(), any);
        any
    }

    /// Whether any line of `category` is asserted.
    pub fn is_asserted(&self, category: InterruptCategory) -> bool {
        self.asserted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .is_some_and(|lines| !lines.is_empty())
    }

    /// Deasserts every line and every category on `link`.
    pub fn clear(&self, link: &EngineLink) {
        let mut asserted = self.asserted.lock().unwrap_or_else(PoisonError::into_inner);
        for category in asserted.keys() {
            link.set_irq(category.mask(), false);
        }
        asserted.clear();
    }
}
