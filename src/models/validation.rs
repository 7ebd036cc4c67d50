//! Validation stages and per-item verdicts.

use std::fmt;

/// One of the validation filters. An item is fully validated iff it has a
/// passing result for every *enabled* stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    PriceFilter,
    Mechanical,
    Ai,
}

impl ValidationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::PriceFilter => "price_filter",
            ValidationStage::Mechanical => "mechanical",
            ValidationStage::Ai => "ai",
        }
    }
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage for one listing.
#[derive(Debug, Clone, PartialEq)]
pub struct StageVerdict {
    pub avito_item_id: String,
    pub passed: bool,
    pub rejection_reason: Option<String>,
}

impl StageVerdict {
    pub fn pass(item_id: &str) -> Self {
        Self {
            avito_item_id: item_id.to_string(),
            passed: true,
            rejection_reason: None,
        }
    }

    pub fn reject(item_id: &str, reason: impl Into<String>) -> Self {
        Self {
            avito_item_id: item_id.to_string(),
            passed: false,
            rejection_reason: Some(reason.into()),
        }
    }
}
