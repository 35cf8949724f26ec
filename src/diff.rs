//! Three-way diff between desired and existing named-entity sets
//!
//! Both sides are keyed by the entity key (system name, or a composite key
//! such as `GET:/pets` for mapping rules). The diff takes owned snapshots and
//! performs no I/O.

use std::collections::BTreeMap;

use crate::remote::Params;

/// A desired entity that can be compared against its remote counterpart `R`
pub trait TrackedEntity<R> {
    /// Full parameter set for creating the entity under `key`
    fn create_params(&self, key: &str) -> Params;

    /// Parameters whose desired value differs from `existing`
    fn changed_params(&self, existing: &R) -> Params;
}

/// A matched entity with at least one differing tracked field
#[derive(Clone, Debug, PartialEq)]
pub struct Update<R, D> {
    pub key: String,
    pub existing: R,
    pub desired: D,
    /// Only the fields that differ
    pub changes: Params,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiffResult<R, D> {
    pub to_create: Vec<(String, D)>,
    pub to_delete: Vec<(String, R)>,
    pub to_update: Vec<Update<R, D>>,
}

impl<R, D> Default for DiffResult<R, D> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_delete: Vec::new(),
            to_update: Vec::new(),
        }
    }
}

impl<R, D> DiffResult<R, D> {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty()
    }
}

/// Compute which entities to create, delete and update
///
/// Results are ordered by key.
pub fn diff<R, D>(desired: BTreeMap<String, D>, mut existing: BTreeMap<String, R>) -> DiffResult<R, D>
where
    D: TrackedEntity<R>,
{
    if existing.is_empty() {
        return DiffResult {
            to_create: desired.into_iter().collect(),
            ..Default::default()
        };
    }

    let mut result = DiffResult::default();
    for (key, wanted) in desired {
        match existing.remove(&key) {
            Some(current) => {
                let changes = wanted.changed_params(&current);
                if !changes.is_empty() {
                    result.to_update.push(Update {
                        key,
                        existing: current,
                        desired: wanted,
                        changes,
                    });
                }
            }
            None => result.to_create.push((key, wanted)),
        }
    }
    result.to_delete = existing.into_iter().collect();
    result
}

/// Insert `name` into `params` when `desired` differs from `current`
pub fn track<T: PartialEq + ToString>(params: &mut Params, name: &'static str, desired: &T, current: &T) {
    if desired != current {
        params.insert(name, desired.to_string());
    }
}
