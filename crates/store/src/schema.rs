//! Schema catalog: which entity generations the backing store carries.
//!
//! During a rolling upgrade a shared store may lag behind the newest
//! binaries, so each deployment probes the store's metadata once when the
//! store is opened and caches the result here. All read/write paths then
//! consult the catalog instead of re-probing.

use forgebatch_core::{DomainError, DomainResult};
use forgebatch_model::Generation;

/// Newest shapes this code knows how to write.
pub const MAX_INSTANCE_GENERATION: Generation = Generation::V3;
pub const MAX_EXECUTION_GENERATION: Generation = Generation::V3;
pub const MAX_PARTITION_GENERATION: Generation = Generation::V2;

/// Active entity generations for one opened store.
///
/// The partition generation covers both the remotable partition records and
/// the step-execution linkage to them; they shipped together. Generations
/// are coupled: remotable-partition support implies the newest execution
/// shape, and its absence caps the execution shape at V2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaCatalog {
    instance: Generation,
    execution: Generation,
    partition: Generation,
}

impl SchemaCatalog {
    /// Catalog for a store carrying the newest shapes everywhere.
    pub fn latest() -> Self {
        Self {
            instance: MAX_INSTANCE_GENERATION,
            execution: MAX_EXECUTION_GENERATION,
            partition: MAX_PARTITION_GENERATION,
        }
    }

    /// Build a catalog from probed generations, enforcing the coupling
    /// rules. Fails with a configuration error on an impossible mix.
    pub fn new(
        instance: Generation,
        execution: Generation,
        partition: Generation,
    ) -> DomainResult<Self> {
        if partition > MAX_PARTITION_GENERATION {
            return Err(DomainError::configuration(format!(
                "partition entity generation {partition} is newer than this code understands"
            )));
        }
        if partition.at_least(Generation::V2) && execution != Generation::V3 {
            return Err(DomainError::configuration(format!(
                "remotable partition support requires execution generation v3, found {execution}"
            )));
        }
        if !partition.at_least(Generation::V2) && execution == Generation::V3 {
            return Err(DomainError::configuration(
                "execution generation v3 requires remotable partition support",
            ));
        }
        Ok(Self {
            instance,
            execution,
            partition,
        })
    }

    /// Build a catalog from raw generation tags read from store metadata.
    ///
    /// An unrecognized tag fails hard rather than guessing a shape.
    pub fn from_tags(instance: u8, execution: u8, partition: u8) -> DomainResult<Self> {
        Self::new(
            Generation::from_tag(instance)?,
            Generation::from_tag(execution)?,
            Generation::from_tag(partition)?,
        )
    }

    pub fn instance(&self) -> Generation {
        self.instance
    }

    pub fn execution(&self) -> Generation {
        self.execution
    }

    pub fn partition(&self) -> Generation {
        self.partition
    }

    /// Whether this store carries remotable partition records at all.
    pub fn supports_remotable_partitions(&self) -> bool {
        self.partition.at_least(Generation::V2)
    }

    /// Whether job instances can carry group/authorization names.
    pub fn supports_group_names(&self) -> bool {
        self.instance.at_least(Generation::V3)
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_catalog_supports_everything() {
        let catalog = SchemaCatalog::latest();
        assert!(catalog.supports_remotable_partitions());
        assert!(catalog.supports_group_names());
    }

    #[test]
    fn back_level_mix_is_accepted() {
        let catalog =
            SchemaCatalog::new(Generation::V2, Generation::V2, Generation::V1).unwrap();
        assert!(!catalog.supports_remotable_partitions());
        assert!(!catalog.supports_group_names());
        assert_eq!(catalog.instance(), Generation::V2);
    }

    #[test]
    fn partition_support_requires_newest_execution_shape() {
        let err =
            SchemaCatalog::new(Generation::V3, Generation::V2, Generation::V2).unwrap_err();
        assert!(matches!(err, DomainError::Configuration(_)));
    }

    #[test]
    fn newest_execution_shape_requires_partition_support() {
        let err =
            SchemaCatalog::new(Generation::V3, Generation::V3, Generation::V1).unwrap_err();
        assert!(matches!(err, DomainError::Configuration(_)));
    }

    #[test]
    fn unknown_probe_tag_fails_hard() {
        let err = SchemaCatalog::from_tags(3, 3, 9).unwrap_err();
        assert!(matches!(err, DomainError::Configuration(_)));
    }

    #[test]
    fn valid_tags_round_trip() {
        let catalog = SchemaCatalog::from_tags(3, 3, 2).unwrap();
        assert_eq!(catalog, SchemaCatalog::latest());
    }
}
