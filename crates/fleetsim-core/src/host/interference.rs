//! Co-location interference.
//!
//! An interference group lists workloads that slow each other down when
//! they share a host. While the host's CPU load is at or above the group's
//! target load, a member co-located with another member only gets `score`
//! of its granted supply as useful work; the rest is counted as interfered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterferenceGroup {
    /// Workload names in the group.
    pub members: Vec<String>,
    /// Host utilization in `[0, 1]` from which interference kicks in.
    pub target_load: f64,
    /// Fraction of performance retained, in `[0, 1]`.
    pub score: f64,
}

/// Lookup structure over a set of groups.
#[derive(Debug, Clone, Default)]
pub struct InterferenceModel {
    groups: Vec<InterferenceGroup>,
    by_member: HashMap<String, Vec<usize>>,
}

impl InterferenceModel {
    pub fn new(groups: Vec<InterferenceGroup>) -> Self {
        let mut by_member: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, g) in groups.iter().enumerate() {
            for m in &g.members {
                by_member.entry(m.clone()).or_default().push(i);
            }
        }
        Self { groups, by_member }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[InterferenceGroup] {
        &self.groups
    }

    /// Performance score of `guest` given the names of all guests on its
    /// host (itself included) and the host's utilization. `1.0` means no
    /// interference. The worst applicable group wins.
    pub fn score<'a>(
        &self,
        guest: &str,
        co_located: impl IntoIterator<Item = &'a str> + Clone,
        load: f64,
    ) -> f64 {
        let Some(group_ids) = self.by_member.get(guest) else {
            return 1.0;
        };
        let mut score: f64 = 1.0;
        for &i in group_ids {
            let g = &self.groups[i];
            if load < g.target_load {
                continue;
            }
            let mut seen_self = false;
            let neighbour = co_located.clone().into_iter().any(|name| {
                if name == guest && !seen_self {
                    seen_self = true;
                    return false;
                }
                g.members.iter().any(|m| m == name)
            });
            if neighbour {
                score = score.min(g.score);
            }
        }
        score.clamp(0.0, 1.0)
    }
}
