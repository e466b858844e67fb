use serde_json::Value;

use crate::error::FoldError;
use crate::patch::{self, PatchOp, Segment};

/// Local mirror of one peer's state tree. Rebuilt from a snapshot on every
/// (re)connect; only the owning session ever writes it.
#[derive(Debug, Clone, Default)]
pub struct StateMirror {
    tree: Value,
    revision: u64,
    desynchronized: bool,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tree wholesale. Clears any desynchronized state.
    pub fn reset(&mut self, snapshot: Value) {
        self.tree = snapshot;
        self.revision += 1;
        self.desynchronized = false;
    }

    /// Apply one incremental operation. A malformed patch poisons the mirror
    /// until the next `reset`; callers must force a fresh snapshot rather
    /// than patch around it.
    pub fn apply(&mut self, op: &PatchOp) -> Result<(), FoldError> {
        if self.desynchronized {
            return Err(FoldError::Desynchronized);
        }
        match patch::apply(&mut self.tree, op) {
            Ok(()) => {
                self.revision += 1;
                Ok(())
            }
            Err(err) => {
                self.desynchronized = true;
                Err(err.into())
            }
        }
    }

    /// Point lookup. An empty path reads the whole tree.
    pub fn read(&self, path: &[Segment]) -> Option<&Value> {
        let mut node = &self.tree;
        for segment in path {
            node = match segment {
                Segment::Key(key) => node.as_object()?.get(key)?,
                Segment::Index(index) => node.as_array()?.get(*index)?,
                Segment::End => return None,
            };
        }
        Some(node)
    }

    /// Lookup by dotted key path (`groups.rg1.config.cpus`); digit-only
    /// segments index sequences.
    pub fn read_path(&self, keypath: &str) -> Option<&Value> {
        if keypath.is_empty() {
            return Some(&self.tree);
        }
        let segments: Vec<Segment> = keypath
            .split('.')
            .map(|part| match part.parse::<usize>() {
                Ok(index) => Segment::Index(index),
                Err(_) => Segment::Key(part.to_string()),
            })
            .collect();
        self.read(&segments)
    }

    /// Materialized copy for observers on other tasks.
    pub fn snapshot(&self) -> Value {
        self.tree.clone()
    }

    pub fn tree(&self) -> &Value {
        &self.tree
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True once a snapshot has been applied.
    pub fn has_snapshot(&self) -> bool {
        self.revision > 0
    }

    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Force the desynchronized state, e.g. when an update cannot even be
    /// decoded into operations.
    pub fn mark_desynchronized(&mut self) {
        self.desynchronized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops() -> Vec<PatchOp> {
        vec![
            PatchOp::Add {
                path: vec![Segment::key("config"), Segment::key("team")],
                value: json!(7),
            },
            PatchOp::Replace {
                path: vec![Segment::key("config"), Segment::key("user")],
                value: json!("alice"),
            },
            PatchOp::Remove {
                path: vec![Segment::key("config"), Segment::key("team")],
            },
        ]
    }

    #[test]
    fn reset_yields_exactly_the_snapshot() {
        let mut mirror = StateMirror::new();
        mirror.reset(json!({"a": 1}));
        let snapshot = json!({"config": {"user": "anon"}, "units": []});
        mirror.reset(snapshot.clone());
        assert_eq!(mirror.read(&[]), Some(&snapshot));
    }

    #[test]
    fn revision_advances_on_snapshot_and_patch() {
        let mut mirror = StateMirror::new();
        assert_eq!(mirror.revision(), 0);
        mirror.reset(json!({"config": {"user": "anon"}}));
        assert_eq!(mirror.revision(), 1);
        mirror
            .apply(&PatchOp::Replace {
                path: vec![Segment::key("config"), Segment::key("user")],
                value: json!("bob"),
            })
            .unwrap();
        assert_eq!(mirror.revision(), 2);
    }

    #[test]
    fn replay_after_reset_converges_to_same_tree() {
        let snapshot = json!({"config": {"user": "anon"}});

        let mut once = StateMirror::new();
        once.reset(snapshot.clone());
        for op in ops() {
            once.apply(&op).unwrap();
        }

        let mut twice = StateMirror::new();
        twice.reset(snapshot.clone());
        for op in ops() {
            twice.apply(&op).unwrap();
        }
        twice.reset(snapshot);
        for op in ops() {
            twice.apply(&op).unwrap();
        }

        assert_eq!(once.tree(), twice.tree());
    }

    #[test]
    fn malformed_patch_poisons_until_reset() {
        let mut mirror = StateMirror::new();
        mirror.reset(json!({"units": []}));
        let bad = PatchOp::Replace {
            path: vec![Segment::key("units"), Segment::Index(4)],
            value: json!({}),
        };
        assert!(mirror.apply(&bad).is_err());
        assert!(mirror.is_desynchronized());

        let good = PatchOp::Add {
            path: vec![Segment::key("info")],
            value: json!({}),
        };
        assert!(matches!(
            mirror.apply(&good),
            Err(FoldError::Desynchronized)
        ));

        mirror.reset(json!({"units": []}));
        assert!(!mirror.is_desynchronized());
        assert!(mirror.apply(&good).is_ok());
    }

    #[test]
    fn read_path_indexes_sequences() {
        let mut mirror = StateMirror::new();
        mirror.reset(json!({"units": [{"ppd": 42}]}));
        assert_eq!(mirror.read_path("units.0.ppd"), Some(&json!(42)));
        assert_eq!(mirror.read_path("units.1.ppd"), None);
        assert_eq!(mirror.read_path("missing"), None);
    }
}
