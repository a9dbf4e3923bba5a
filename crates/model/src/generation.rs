//! Schema generations for rolling upgrades.
//!
//! A cluster may run mixed binary versions against one shared store while it
//! is upgraded worker by worker. Each stored record therefore carries a
//! generation tag, and every entity family collapses its historical shapes
//! into one struct whose later-generation fields are optional. Readers
//! ignore fields beyond their own generation; writers null them out.

use forgebatch_core::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};

/// Generation (shape version) of a stored entity record.
///
/// Generations are additive only: a later generation never removes or
/// repurposes an earlier field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Generation {
    /// The original, unversioned shape.
    V1,
    V2,
    V3,
}

impl Generation {
    /// Decode a raw generation tag read from a stored record.
    ///
    /// An unrecognized tag is a fatal configuration error; the read path
    /// must never guess which shape produced a row.
    pub fn from_tag(tag: u8) -> DomainResult<Generation> {
        match tag {
            1 => Ok(Generation::V1),
            2 => Ok(Generation::V2),
            3 => Ok(Generation::V3),
            other => Err(DomainError::configuration(format!(
                "unknown entity generation tag {other}"
            ))),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Generation::V1 => 1,
            Generation::V2 => 2,
            Generation::V3 => 3,
        }
    }

    pub fn at_least(&self, other: Generation) -> bool {
        *self >= other
    }
}

impl core::fmt::Display for Generation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for generation in [Generation::V1, Generation::V2, Generation::V3] {
            assert_eq!(Generation::from_tag(generation.tag()).unwrap(), generation);
        }
    }

    #[test]
    fn unknown_tag_is_a_configuration_error() {
        for tag in [0u8, 4, 255] {
            let err = Generation::from_tag(tag).unwrap_err();
            assert!(matches!(err, DomainError::Configuration(_)));
        }
    }

    #[test]
    fn generations_order_additively() {
        assert!(Generation::V3.at_least(Generation::V2));
        assert!(Generation::V2.at_least(Generation::V2));
        assert!(!Generation::V1.at_least(Generation::V2));
    }
}
