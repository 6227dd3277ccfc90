use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use corvus_types::{CorvusError, Result, StageDefinition, StageState, StateTable};

/// One stage changing state as a side effect of another stage's transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageChange {
    pub stage_id: String,
    pub from: StageState,
    pub to: StageState,
}

/// Directed acyclic graph of stage prerequisites.
///
/// Immutable after construction, so one instance can be shared by every run.
/// Cascades never touch a state table; they return the changes for the
/// caller to record and apply.
#[derive(Debug, Clone)]
pub struct PrerequisiteGraph {
    definitions: HashMap<String, StageDefinition>,
    /// stage -> its direct prerequisites
    forward: HashMap<String, Vec<String>>,
    /// stage -> its direct dependents, in declaration order
    reverse: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl PrerequisiteGraph {
    pub fn new(definitions: Vec<StageDefinition>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(definitions.len());
        let mut declared = Vec::with_capacity(definitions.len());
        for def in definitions {
            if by_id.contains_key(&def.stage_id) {
                return Err(CorvusError::InvalidStageTable(format!(
                    "duplicate stage id '{}'",
                    def.stage_id
                )));
            }
            declared.push(def.stage_id.clone());
            by_id.insert(def.stage_id.clone(), def);
        }

        let mut forward: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse: HashMap<String, Vec<String>> =
            declared.iter().map(|id| (id.clone(), Vec::new())).collect();

        for id in &declared {
            let def = &by_id[id];
            for prereq in &def.prerequisites {
                if !by_id.contains_key(prereq) {
                    return Err(CorvusError::InvalidStageTable(format!(
                        "stage '{id}' lists unknown prerequisite '{prereq}'"
                    )));
                }
                if let Some(dependents) = reverse.get_mut(prereq) {
                    dependents.push(id.clone());
                }
            }
            forward.insert(id.clone(), def.prerequisites.clone());
        }

        let order = topological_order(&declared, &by_id, &forward, &reverse)?;

        Ok(Self {
            definitions: by_id,
            forward,
            reverse,
            order,
        })
    }

    /// Stage ids in topological order, ties broken by ordinal.
    pub fn stage_ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, stage_id: &str) -> bool {
        self.definitions.contains_key(stage_id)
    }

    pub fn definition(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.definitions.get(stage_id)
    }

    /// Direct prerequisites of a stage. Empty for unknown stages.
    pub fn get_prerequisites(&self, stage_id: &str) -> &[String] {
        self.forward.get(stage_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All transitive dependents of a stage, breadth-first.
    pub fn get_dependents(&self, stage_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&str> = self
            .direct_dependents(stage_id)
            .iter()
            .map(String::as_str)
            .collect();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            out.push(id.to_string());
            queue.extend(self.direct_dependents(id).iter().map(String::as_str));
        }
        out
    }

    /// A fresh table with every stage `not_started`.
    pub fn initial_states(&self) -> StateTable {
        self.order
            .iter()
            .map(|id| (id.clone(), StageState::NotStarted))
            .collect()
    }

    pub fn are_prerequisites_met(&self, stage_id: &str, states: &StateTable) -> bool {
        self.get_prerequisites(stage_id)
            .iter()
            .all(|p| state_of(states, p).satisfies_prerequisite())
    }

    /// One line per unmet prerequisite: `"<display name> (<id>) is <state>"`.
    pub fn get_blocking_reasons(&self, stage_id: &str, states: &StateTable) -> Vec<String> {
        self.get_prerequisites(stage_id)
            .iter()
            .filter_map(|p| {
                let state = state_of(states, p);
                if state.satisfies_prerequisite() {
                    return None;
                }
                let name = self
                    .definitions
                    .get(p)
                    .map(|d| d.display_name.as_str())
                    .unwrap_or(p.as_str());
                Some(format!("{name} ({p}) is {state}"))
            })
            .collect()
    }

    /// Every transitive dependent of `failed_stage_id` that is `not_started`
    /// or `running` becomes `blocked`. Other dependents are left alone, but
    /// the traversal still continues through them.
    pub fn cascade_block(&self, failed_stage_id: &str, states: &StateTable) -> Vec<StageChange> {
        self.get_dependents(failed_stage_id)
            .into_iter()
            .filter_map(|id| {
                let from = state_of(states, &id);
                matches!(from, StageState::NotStarted | StageState::Running).then(|| StageChange {
                    stage_id: id,
                    from,
                    to: StageState::Blocked,
                })
            })
            .collect()
    }

    /// Direct dependents of `passed_stage_id` that are `blocked` and now have
    /// every prerequisite satisfied return to `not_started`. Deeper
    /// dependents are re-checked on their own parents' transitions.
    pub fn cascade_unblock(&self, passed_stage_id: &str, states: &StateTable) -> Vec<StageChange> {
        self.direct_dependents(passed_stage_id)
            .iter()
            .filter(|id| state_of(states, id) == StageState::Blocked)
            .filter(|id| self.are_prerequisites_met(id, states))
            .map(|id| StageChange {
                stage_id: id.clone(),
                from: StageState::Blocked,
                to: StageState::NotStarted,
            })
            .collect()
    }

    fn direct_dependents(&self, stage_id: &str) -> &[String] {
        self.reverse.get(stage_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Apply a cascade result to a state table.
pub fn apply_changes(states: &mut StateTable, changes: &[StageChange]) {
    for change in changes {
        states.insert(change.stage_id.clone(), change.to);
    }
}

fn state_of(states: &StateTable, stage_id: &str) -> StageState {
    states.get(stage_id).copied().unwrap_or(StageState::NotStarted)
}

/// Kahn's algorithm. Among ready stages the lowest ordinal goes first, then
/// declaration order.
fn topological_order(
    declared: &[String],
    definitions: &HashMap<String, StageDefinition>,
    forward: &HashMap<String, Vec<String>>,
    reverse: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let position: HashMap<&str, usize> = declared
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut in_degree: BTreeMap<&str, usize> = declared
        .iter()
        .map(|id| (id.as_str(), forward.get(id).map_or(0, Vec::len)))
        .collect();

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(declared.len());

    while !ready.is_empty() {
        ready.sort_by(|a, b| {
            definitions[*a]
                .ordinal
                .total_cmp(&definitions[*b].ordinal)
                .then_with(|| position[*a].cmp(&position[*b]))
        });
        let id = ready.remove(0);
        order.push(id.to_string());
        for dependent in reverse.get(id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(dependent.as_str());
                }
            }
        }
    }

    if order.len() < declared.len() {
        return Err(CorvusError::CyclicDependency {
            reachable: order.len(),
            total: declared.len(),
        });
    }
    Ok(order)
}
