//! Articulum lifecycle states.

use std::fmt;

use thiserror::Error;

/// Lifecycle of a part number flowing through the pipeline.
///
/// Legal transitions:
///
/// ```text
/// NEW -> CATALOG_PARSING -> CATALOG_PARSED -> VALIDATING -+-> VALIDATED -> OBJECT_PARSING
///                                  ^                      +-> REJECTED_BY_MIN_COUNT
///                                  +--- (rollback) -------+
/// ```
///
/// `OBJECT_PARSING` and `REJECTED_BY_MIN_COUNT` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArticulumState {
    New,
    CatalogParsing,
    CatalogParsed,
    Validating,
    Validated,
    ObjectParsing,
    RejectedByMinCount,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown articulum state: {0}")]
    Unknown(String),
}

impl ArticulumState {
    pub const ALL: [ArticulumState; 7] = [
        ArticulumState::New,
        ArticulumState::CatalogParsing,
        ArticulumState::CatalogParsed,
        ArticulumState::Validating,
        ArticulumState::Validated,
        ArticulumState::ObjectParsing,
        ArticulumState::RejectedByMinCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArticulumState::New => "NEW",
            ArticulumState::CatalogParsing => "CATALOG_PARSING",
            ArticulumState::CatalogParsed => "CATALOG_PARSED",
            ArticulumState::Validating => "VALIDATING",
            ArticulumState::Validated => "VALIDATED",
            ArticulumState::ObjectParsing => "OBJECT_PARSING",
            ArticulumState::RejectedByMinCount => "REJECTED_BY_MIN_COUNT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StateError> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| StateError::Unknown(s.to_string()))
    }

    /// Terminal states have no outbound edges.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ArticulumState::ObjectParsing | ArticulumState::RejectedByMinCount
        )
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    ///
    /// The rollback edge `VALIDATING -> CATALOG_PARSED` is included; it is
    /// taken when the AI stage is unavailable and the articulum must be
    /// re-validated from scratch.
    pub fn can_transition_to(&self, to: ArticulumState) -> bool {
        use ArticulumState::*;
        matches!(
            (self, to),
            (New, CatalogParsing)
                | (CatalogParsing, CatalogParsed)
                | (CatalogParsed, Validating)
                | (Validating, Validated)
                | (Validating, RejectedByMinCount)
                | (Validating, CatalogParsed)
                | (Validated, ObjectParsing)
        )
    }
}

impl fmt::Display for ArticulumState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An articulum claimed by a validation worker (already in `VALIDATING`).
#[derive(Debug, Clone)]
pub struct ClaimedArticulum {
    pub id: i64,
    pub articulum: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in ArticulumState::ALL {
            assert_eq!(ArticulumState::parse(state.as_str()).unwrap(), state);
        }
        assert!(ArticulumState::parse("BOGUS").is_err());
    }

    #[test]
    fn terminal_states_have_no_outbound_edges() {
        for from in [
            ArticulumState::ObjectParsing,
            ArticulumState::RejectedByMinCount,
        ] {
            for to in ArticulumState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn lifecycle_edges_match_the_graph() {
        use ArticulumState::*;
        let legal = [
            (New, CatalogParsing),
            (CatalogParsing, CatalogParsed),
            (CatalogParsed, Validating),
            (Validating, Validated),
            (Validating, RejectedByMinCount),
            (Validating, CatalogParsed),
            (Validated, ObjectParsing),
        ];
        for from in ArticulumState::ALL {
            for to in ArticulumState::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }
}
