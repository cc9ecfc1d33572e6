// Layer 1: Standard library imports
use std::collections::BTreeMap;

// Layer 2: Third-party crate imports
use serde_json::Value;

// Layer 3: Internal module imports
use super::store::{PersistError, SchemaVersion};

type MigrationFn = Box<dyn Fn(&mut Value) -> Result<(), PersistError> + Send + Sync>;

/// Ordered schema migration steps for one persisted kind.
///
/// Each step transforms the raw payload from version `v` to `v + 1`;
/// restore runs them in sequence from the persisted version up to the
/// kind's maximum before deserializing into the current state type.
///
/// # Example
/// ```rust
/// use gridsys_entity::persist::{MigrationChain, SchemaVersion};
///
/// let chain = MigrationChain::new()
///     .step(SchemaVersion(1), |value| {
///         value["display_name"] = value["name"].take();
///         Ok(())
///     })
///     .step(SchemaVersion(2), |value| {
///         value["elo"] = 1200.into();
///         Ok(())
///     });
/// assert!(chain.validate(SchemaVersion(1), SchemaVersion(3)).is_ok());
/// ```
#[derive(Default)]
pub struct MigrationChain {
    steps: BTreeMap<SchemaVersion, MigrationFn>,
}

impl MigrationChain {
    /// An empty chain (valid only when `min == max`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the step migrating `from` to `from.next()`. A second step for
    /// the same version replaces the first.
    pub fn step<F>(mut self, from: SchemaVersion, f: F) -> Self
    where
        F: Fn(&mut Value) -> Result<(), PersistError> + Send + Sync + 'static,
    {
        self.steps.insert(from, Box::new(f));
        self
    }

    /// The step migrating away from `from`, if registered.
    pub(crate) fn step_for(&self, from: SchemaVersion) -> Option<&MigrationFn> {
        self.steps.get(&from)
    }

    /// Check that every version in `[min, max)` has a step, so any payload
    /// in the supported range can reach `max`.
    pub fn validate(&self, min: SchemaVersion, max: SchemaVersion) -> Result<(), PersistError> {
        for version in min.0..max.0 {
            if !self.steps.contains_key(&SchemaVersion(version)) {
                return Err(PersistError::MigrationGap { from: SchemaVersion(version) });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> MigrationChain {
        MigrationChain::new()
            .step(SchemaVersion(2), |value| {
                value["coins"] = value["gold"].take();
                Ok(())
            })
            .step(SchemaVersion(3), |value| {
                value["season"] = 1.into();
                Ok(())
            })
    }

    #[test]
    fn test_steps_apply_in_order() {
        let chain = chain();
        let mut value = json!({ "gold": 50 });

        let mut version = SchemaVersion(2);
        while version < SchemaVersion(4) {
            chain.step_for(version).unwrap()(&mut value).unwrap();
            version = version.next();
        }
        assert_eq!(value, json!({ "gold": null, "coins": 50, "season": 1 }));
    }

    #[test]
    fn test_validate_detects_gap() {
        let chain = chain();
        assert!(chain.validate(SchemaVersion(2), SchemaVersion(4)).is_ok());
        // v4 -> v5 has no step.
        assert!(matches!(
            chain.validate(SchemaVersion(2), SchemaVersion(6)),
            Err(PersistError::MigrationGap { from: SchemaVersion(4) })
        ));
        // Empty range needs nothing.
        assert!(MigrationChain::new().validate(SchemaVersion(1), SchemaVersion(1)).is_ok());
    }
}
