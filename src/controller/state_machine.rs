//! Cluster phase derivation from component phases
//!
//! The cluster phase is a pure function of the multiset of component phases.
//! Rules are evaluated in table order and the first matching rule decides the
//! phase; when no rule matches, the current phase is kept.

use std::collections::BTreeMap;

use crate::crd::{ClusterPhase, ComponentPhase};

/// Counts of component phases, the only input of the phase rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    counts: BTreeMap<ComponentPhase, usize>,
    total: usize,
}

impl PhaseCounts {
    pub fn new<'a>(phases: impl IntoIterator<Item = &'a ComponentPhase>) -> Self {
        let mut counts = BTreeMap::new();
        let mut total = 0;
        for phase in phases {
            *counts.entry(*phase).or_insert(0) += 1;
            total += 1;
        }
        Self { counts, total }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn count(&self, phase: ComponentPhase) -> usize {
        self.counts.get(&phase).copied().unwrap_or(0)
    }

    /// Every component is in one of `phases`
    pub fn all_in(&self, phases: &[ComponentPhase]) -> bool {
        phases.iter().map(|p| self.count(*p)).sum::<usize>() == self.total
    }

    /// At least one component is in one of `phases`
    pub fn any_in(&self, phases: &[ComponentPhase]) -> bool {
        phases.iter().any(|p| self.count(*p) > 0)
    }
}

/// A phase rule: when `matches` holds, the cluster takes `phase`
#[derive(Debug)]
pub struct PhaseRule {
    pub phase: ClusterPhase,
    pub matches: fn(&PhaseCounts) -> bool,
    /// Human-readable description of this rule
    pub description: &'static str,
}

/// Phase rules in priority order
pub static PHASE_RULES: &[PhaseRule] = &[
    PhaseRule {
        phase: ClusterPhase::Running,
        matches: |c| c.all_in(&[ComponentPhase::Running]),
        description: "all components are running",
    },
    PhaseRule {
        phase: ClusterPhase::Creating,
        matches: |c| c.all_in(&[ComponentPhase::Creating]),
        description: "all components are being created",
    },
    PhaseRule {
        phase: ClusterPhase::Updating,
        matches: |c| {
            c.all_in(&[
                ComponentPhase::Creating,
                ComponentPhase::Running,
                ComponentPhase::Updating,
            ])
        },
        description: "components are being created, updated or are running",
    },
    PhaseRule {
        phase: ClusterPhase::Stopped,
        matches: |c| c.all_in(&[ComponentPhase::Stopped]),
        description: "all components are stopped",
    },
    PhaseRule {
        phase: ClusterPhase::Stopping,
        matches: |c| c.any_in(&[ComponentPhase::Stopping]),
        description: "some component is stopping",
    },
    PhaseRule {
        phase: ClusterPhase::Failed,
        matches: |c| c.all_in(&[ComponentPhase::Failed]),
        description: "all components failed",
    },
    PhaseRule {
        phase: ClusterPhase::Abnormal,
        matches: |c| c.any_in(&[ComponentPhase::Abnormal, ComponentPhase::Failed]),
        description: "some component is abnormal or failed",
    },
];

/// Compose the cluster phase from component phases
///
/// Returns `None` when no rule applies (including when there are no
/// components); the caller keeps the current phase in that case.
pub fn compose_phase<'a>(phases: impl IntoIterator<Item = &'a ComponentPhase>) -> Option<ClusterPhase> {
    let counts = PhaseCounts::new(phases);
    if counts.total() == 0 {
        return None;
    }
    PHASE_RULES
        .iter()
        .find(|rule| (rule.matches)(&counts))
        .map(|rule| rule.phase)
}

/// The rule that decided a phase, for logging
pub fn matching_rule<'a>(phases: impl IntoIterator<Item = &'a ComponentPhase>) -> Option<&'static PhaseRule> {
    let counts = PhaseCounts::new(phases);
    if counts.total() == 0 {
        return None;
    }
    PHASE_RULES.iter().find(|rule| (rule.matches)(&counts))
}
