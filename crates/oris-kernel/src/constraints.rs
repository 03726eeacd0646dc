//! Hard placement constraints evaluated by the scheduler (spec.md §4.4 step 3).

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::node::Node;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleConstraints {
    /// Node's `metadata.region` must be a member of this set. Absent node
    /// metadata is ineligible, never a wildcard match.
    pub region: Option<Vec<String>>,
    /// Exact match on `metadata.environment`.
    pub environment: Option<String>,
    /// Exact-match required for any key present here.
    pub labels: BTreeMap<String, String>,
}

impl ScheduleConstraints {
    pub fn is_satisfied_by(&self, node: &Node) -> bool {
        if let Some(regions) = &self.region {
            match &node.metadata.region {
                Some(node_region) => {
                    if !regions.iter().any(|r| r == node_region) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(environment) = &self.environment {
            if node.metadata.environment.as_deref() != Some(environment.as_str()) {
                return false;
            }
        }
        for (key, value) in &self.labels {
            if node.metadata.labels.get(key) != Some(value) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeCapacity, NodeMetadata};
    use chrono::Utc;

    fn node_with(region: Option<&str>, environment: Option<&str>) -> Node {
        Node::new(
            "n1",
            NodeMetadata {
                region: region.map(String::from),
                environment: environment.map(String::from),
                labels: BTreeMap::new(),
            },
            NodeCapacity {
                slots: 4,
                resource_hints: BTreeMap::new(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn region_constraint_rejects_node_without_metadata() {
        let c = ScheduleConstraints {
            region: Some(vec!["r1".into()]),
            ..Default::default()
        };
        assert!(!c.is_satisfied_by(&node_with(None, None)));
    }

    #[test]
    fn region_constraint_accepts_membership() {
        let c = ScheduleConstraints {
            region: Some(vec!["r1".into(), "r2".into()]),
            ..Default::default()
        };
        assert!(c.is_satisfied_by(&node_with(Some("r2"), None)));
        assert!(!c.is_satisfied_by(&node_with(Some("r3"), None)));
    }

    #[test]
    fn environment_constraint_is_exact_match() {
        let c = ScheduleConstraints {
            environment: Some("prod".into()),
            ..Default::default()
        };
        assert!(c.is_satisfied_by(&node_with(None, Some("prod"))));
        assert!(!c.is_satisfied_by(&node_with(None, Some("staging"))));
    }

    #[test]
    fn no_constraints_satisfied_by_any_node() {
        assert!(ScheduleConstraints::default().is_satisfied_by(&node_with(None, None)));
    }
}
