//! Graph builder for pipeline stages.
//!
//! The builder takes stage descriptors plus their implementations and
//! constructs a validated graph the scheduler can walk. Edges come from
//! explicit `depends_on` entries and from the producers of each stage's
//! read-set; edges into a parallel group are widened into a full barrier.

use super::stage::{GroupId, Stage, StageDescriptor, StageId, Validator};
use crate::errors::{OrchestratorError, Result};
use crate::repair::RepairPolicy;
use crate::state::{KeyPolicy, StateKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Index into the stage list.
pub type StageIndex = usize;

/// Implementation behind a stage node.
#[derive(Clone)]
pub enum StageKind {
    Task(Arc<dyn Stage>),
    Validator(Arc<dyn Validator>),
}

impl fmt::Debug for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(_) => write!(f, "Task"),
            Self::Validator(_) => write!(f, "Validator"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageNode {
    pub descriptor: StageDescriptor,
    pub kind: StageKind,
}

impl StageNode {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn is_validator(&self) -> bool {
        matches!(self.kind, StageKind::Validator(_))
    }
}

/// Failure handling for one parallel group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// Abort running siblings and skip pending ones when a member fails.
    #[serde(default)]
    pub cancel_siblings_on_error: bool,
}

#[derive(Debug, Clone)]
pub struct ParallelGroup {
    pub id: GroupId,
    pub members: Vec<StageIndex>,
    pub policy: GroupPolicy,
}

/// A validated directed acyclic graph of stages.
#[derive(Debug)]
pub struct PipelineGraph {
    id: String,
    nodes: Vec<StageNode>,
    index_map: HashMap<StageId, StageIndex>,
    /// index -> stages that depend on it
    forward_edges: Vec<Vec<StageIndex>>,
    /// index -> stages it depends on
    reverse_edges: Vec<Vec<StageIndex>>,
    policies: BTreeMap<StateKey, KeyPolicy>,
    producers: BTreeMap<StateKey, Vec<StageIndex>>,
    groups: BTreeMap<GroupId, ParallelGroup>,
    validator: Option<StageIndex>,
    repair: Option<RepairPolicy>,
}

impl PipelineGraph {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[StageNode] {
        &self.nodes
    }

    pub fn node(&self, index: StageIndex) -> Option<&StageNode> {
        self.nodes.get(index)
    }

    pub fn descriptor(&self, index: StageIndex) -> Option<&StageDescriptor> {
        self.nodes.get(index).map(|n| &n.descriptor)
    }

    pub fn index_of(&self, id: &str) -> Option<StageIndex> {
        self.index_map.get(id).copied()
    }

    pub fn stage_id(&self, index: StageIndex) -> &str {
        self.nodes.get(index).map_or("", |n| n.id())
    }

    /// Stages that depend on the given stage (forward edges).
    pub fn dependents(&self, index: StageIndex) -> &[StageIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stages the given stage depends on (reverse edges).
    pub fn dependencies(&self, index: StageIndex) -> &[StageIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stages with no dependencies (entry points).
    pub fn root_stages(&self) -> Vec<StageIndex> {
        (0..self.len())
            .filter(|&i| self.reverse_edges[i].is_empty())
            .collect()
    }

    /// Stages no other stage depends on (exit points).
    pub fn leaf_stages(&self) -> Vec<StageIndex> {
        (0..self.len())
            .filter(|&i| self.forward_edges[i].is_empty())
            .collect()
    }

    pub fn dependencies_satisfied(&self, index: StageIndex, completed: &HashSet<StageIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Every stage that must finish before `index` can start.
    pub fn ancestors(&self, index: StageIndex) -> BTreeSet<StageIndex> {
        self.walk(index, &self.reverse_edges)
    }

    /// Every stage that transitively depends on `index`.
    pub fn descendants(&self, index: StageIndex) -> BTreeSet<StageIndex> {
        self.walk(index, &self.forward_edges)
    }

    fn walk(&self, start: StageIndex, edges: &[Vec<StageIndex>]) -> BTreeSet<StageIndex> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<StageIndex> = edges.get(start).cloned().unwrap_or_default();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(edges[next].iter().copied());
            }
        }
        seen
    }

    pub fn key_policies(&self) -> &BTreeMap<StateKey, KeyPolicy> {
        &self.policies
    }

    pub fn key_policy(&self, key: &str) -> KeyPolicy {
        self.policies.get(key).copied().unwrap_or_default()
    }

    /// Stages declaring `key` in their write-set.
    pub fn producers_of(&self, key: &str) -> &[StageIndex] {
        self.producers.get(key).map_or(&[], |v| v.as_slice())
    }

    pub fn groups(&self) -> impl Iterator<Item = &ParallelGroup> {
        self.groups.values()
    }

    pub fn group(&self, id: &str) -> Option<&ParallelGroup> {
        self.groups.get(id)
    }

    pub fn group_of(&self, index: StageIndex) -> Option<&ParallelGroup> {
        self.descriptor(index)
            .and_then(|d| d.parallel_group.as_deref())
            .and_then(|g| self.groups.get(g))
    }

    /// Groups whose members `index` waits on without being a member itself.
    pub fn joined_groups(&self, index: StageIndex) -> Vec<&ParallelGroup> {
        let own = self
            .descriptor(index)
            .and_then(|d| d.parallel_group.as_deref());
        let mut seen = BTreeSet::new();
        self.dependencies(index)
            .iter()
            .filter_map(|&dep| self.descriptor(dep)?.parallel_group.as_deref())
            .filter(|g| Some(*g) != own && seen.insert(*g))
            .filter_map(|g| self.groups.get(g))
            .collect()
    }

    pub fn is_join(&self, index: StageIndex) -> bool {
        !self.joined_groups(index).is_empty()
    }

    pub fn validator_index(&self) -> Option<StageIndex> {
        self.validator
    }

    pub fn repair_policy(&self) -> Option<&RepairPolicy> {
        self.repair.as_ref()
    }

    pub fn repair_index(&self) -> Option<StageIndex> {
        self.repair
            .as_ref()
            .and_then(|p| self.index_of(&p.repair_stage))
    }

    /// Group stages into waves of concurrently runnable stages.
    pub fn compute_waves(&self) -> Vec<Vec<StageId>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<StageIndex> = HashSet::new();

        loop {
            let ready: Vec<StageIndex> = (0..self.len())
                .filter(|i| !completed.contains(i))
                .filter(|&i| self.dependencies_satisfied(i, &completed))
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().copied());
            waves.push(ready.iter().map(|&i| self.stage_id(i).to_string()).collect());
        }

        waves
    }
}

/// Builder for constructing pipeline graphs.
pub struct GraphBuilder {
    id: String,
    nodes: Vec<StageNode>,
    policies: BTreeMap<StateKey, KeyPolicy>,
    group_policies: BTreeMap<GroupId, GroupPolicy>,
    repair: Option<RepairPolicy>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            policies: BTreeMap::new(),
            group_policies: BTreeMap::new(),
            repair: None,
        }
    }

    pub fn stage(self, descriptor: StageDescriptor, stage: impl Stage + 'static) -> Self {
        self.stage_arc(descriptor, Arc::new(stage))
    }

    pub fn stage_arc(mut self, descriptor: StageDescriptor, stage: Arc<dyn Stage>) -> Self {
        self.nodes.push(StageNode {
            descriptor,
            kind: StageKind::Task(stage),
        });
        self
    }

    /// Add the validator node. Its write-set must be empty.
    pub fn validator(mut self, descriptor: StageDescriptor, validator: impl Validator + 'static) -> Self {
        self.nodes.push(StageNode {
            descriptor,
            kind: StageKind::Validator(Arc::new(validator)),
        });
        self
    }

    pub fn key_policy(mut self, key: impl Into<StateKey>, policy: KeyPolicy) -> Self {
        self.policies.insert(key.into(), policy);
        self
    }

    pub fn accumulating(self, key: impl Into<StateKey>) -> Self {
        self.key_policy(key, KeyPolicy::Accumulating)
    }

    pub fn overwrite(self, key: impl Into<StateKey>) -> Self {
        self.key_policy(key, KeyPolicy::Overwrite)
    }

    pub fn group_policy(mut self, group: impl Into<GroupId>, policy: GroupPolicy) -> Self {
        self.group_policies.insert(group.into(), policy);
        self
    }

    pub fn cancel_siblings_on_error(self, group: impl Into<GroupId>, cancel: bool) -> Self {
        self.group_policy(
            group,
            GroupPolicy {
                cancel_siblings_on_error: cancel,
            },
        )
    }

    pub fn repair(mut self, policy: RepairPolicy) -> Self {
        self.repair = Some(policy);
        self
    }

    /// Build the pipeline graph.
    ///
    /// This validates the graph structure:
    /// - Stage ids are unique and dependencies reference existing stages
    /// - Singular keys have a single producer; accumulating keys are only
    ///   produced inside parallel groups
    /// - Group members do not depend on each other
    /// - No cycles are allowed
    /// - The repair stage is upstream of the (single) validator
    pub fn build(self) -> Result<PipelineGraph> {
        let mut index_map = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index_map.insert(node.id().to_string(), i).is_some() {
                return Err(invalid(format!("Duplicate stage id: {}", node.id())));
            }
        }

        let producers = Self::collect_producers(&self.nodes, &self.policies)?;
        let validator = Self::find_validator(&self.nodes)?;

        let mut groups: BTreeMap<GroupId, ParallelGroup> = BTreeMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(group) = &node.descriptor.parallel_group {
                groups
                    .entry(group.clone())
                    .or_insert_with(|| ParallelGroup {
                        id: group.clone(),
                        members: Vec::new(),
                        policy: self.group_policies.get(group).copied().unwrap_or_default(),
                    })
                    .members
                    .push(i);
            }
        }
        for group in self.group_policies.keys() {
            if !groups.contains_key(group) {
                tracing::debug!(group = %group, graph = %self.id, "policy for absent parallel group ignored");
            }
        }

        let mut forward_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut reverse_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); self.nodes.len()];

        for (to_idx, node) in self.nodes.iter().enumerate() {
            let descriptor = &node.descriptor;
            let mut deps: BTreeSet<StageIndex> = BTreeSet::new();

            for dep in &descriptor.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    invalid(format!(
                        "Unknown dependency '{}' in stage '{}': no stage with that id exists",
                        dep, descriptor.id
                    ))
                })?;
                deps.insert(from_idx);
            }
            for key in &descriptor.reads {
                if let Some(stages) = producers.get(key) {
                    deps.extend(stages.iter().copied().filter(|&p| p != to_idx));
                }
            }

            // full barrier: waiting on one member means waiting on the group
            let mut expanded = BTreeSet::new();
            for &dep in &deps {
                match &self.nodes[dep].descriptor.parallel_group {
                    Some(group) if descriptor.parallel_group.as_ref() == Some(group) => {
                        return Err(invalid(format!(
                            "Stage '{}' depends on '{}' in its own parallel group '{}'",
                            descriptor.id,
                            self.nodes[dep].id(),
                            group
                        )));
                    }
                    Some(group) => {
                        if let Some(g) = groups.get(group) {
                            expanded.extend(g.members.iter().copied());
                        }
                    }
                    None => {
                        expanded.insert(dep);
                    }
                }
            }

            for from_idx in expanded {
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PipelineGraph {
            id: self.id,
            nodes: self.nodes,
            index_map,
            forward_edges,
            reverse_edges,
            policies: self.policies,
            producers,
            groups,
            validator,
            repair: self.repair,
        };

        Self::validate_no_cycles(&graph)?;
        Self::validate_repair(&graph)?;

        Ok(graph)
    }

    fn collect_producers(
        nodes: &[StageNode],
        policies: &BTreeMap<StateKey, KeyPolicy>,
    ) -> Result<BTreeMap<StateKey, Vec<StageIndex>>> {
        let mut producers: BTreeMap<StateKey, Vec<StageIndex>> = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for key in &node.descriptor.writes {
                let policy = policies.get(key).copied().unwrap_or_default();
                let existing = producers.entry(key.clone()).or_default();
                match policy {
                    KeyPolicy::Singular => {
                        if let Some(&first) = existing.first() {
                            return Err(OrchestratorError::StateConflict {
                                key: key.clone(),
                                existing: nodes[first].id().to_string(),
                                writer: node.id().to_string(),
                            });
                        }
                    }
                    KeyPolicy::Accumulating => {
                        if node.descriptor.parallel_group.is_none() {
                            return Err(OrchestratorError::AccumulatingOutsideGroup {
                                key: key.clone(),
                                writer: node.id().to_string(),
                            });
                        }
                    }
                    KeyPolicy::Overwrite => {}
                }
                existing.push(i);
            }
        }
        Ok(producers)
    }

    fn find_validator(nodes: &[StageNode]) -> Result<Option<StageIndex>> {
        let mut validator: Option<StageIndex> = None;
        for (i, node) in nodes.iter().enumerate().filter(|(_, n)| n.is_validator()) {
            if let Some(first) = validator {
                return Err(invalid(format!(
                    "More than one validator stage: '{}' and '{}'",
                    nodes[first].id(),
                    node.id()
                )));
            }
            if !node.descriptor.writes.is_empty() {
                return Err(invalid(format!(
                    "Validator stage '{}' must not declare writes",
                    node.id()
                )));
            }
            if node.descriptor.parallel_group.is_some() {
                return Err(invalid(format!(
                    "Validator stage '{}' cannot be part of a parallel group",
                    node.id()
                )));
            }
            if node.descriptor.checkpoint.is_some() {
                return Err(invalid(format!(
                    "Validator stage '{}' cannot be a checkpoint; checkpoint the stage after it",
                    node.id()
                )));
            }
            validator = Some(i);
        }
        Ok(validator)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &PipelineGraph) -> Result<()> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<StageIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let cycle_stages: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| graph.stage_id(i))
                .collect();

            return Err(invalid(format!(
                "Cycle detected in stage dependencies. Involved stages: {:?}",
                cycle_stages
            )));
        }

        Ok(())
    }

    fn validate_repair(graph: &PipelineGraph) -> Result<()> {
        match (graph.validator, &graph.repair) {
            (None, None) => Ok(()),
            (None, Some(policy)) => Err(invalid(format!(
                "Repair stage '{}' configured but the graph has no validator",
                policy.repair_stage
            ))),
            (Some(v), None) => Err(invalid(format!(
                "Validator stage '{}' needs a repair policy",
                graph.stage_id(v)
            ))),
            (Some(v), Some(policy)) => {
                let repair = graph.index_of(&policy.repair_stage).ok_or_else(|| {
                    invalid(format!("Unknown repair stage '{}'", policy.repair_stage))
                })?;
                if graph.nodes[repair].is_validator() || !graph.ancestors(v).contains(&repair) {
                    return Err(invalid(format!(
                        "Repair stage '{}' must be upstream of validator '{}'",
                        policy.repair_stage,
                        graph.stage_id(v)
                    )));
                }
                Ok(())
            }
        }
    }
}

fn invalid(message: String) -> OrchestratorError {
    OrchestratorError::InvalidGraph(message)
}
