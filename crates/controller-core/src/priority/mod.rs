//! Priority Analyzer (PA)
//!
//! Parses a dependency graph, detects cycles, computes per-item priority
//! scores, and derives the executable order. Analysis results are cached
//! on the analyzer so the query methods (`get_dependencies`, `ready`, …)
//! can answer without re-running the algorithms.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use controller_common::config::PriorityConfig;
use controller_common::ids::ItemId;
use controller_common::types::{DependencyGraph, Priority, WorkItemStatus};

/// Output of a single `analyze()` call.
#[derive(Clone, Debug, Default)]
pub struct AnalysisResult {
    pub per_item_scores: HashMap<ItemId, f64>,
    pub depth_by_item: HashMap<ItemId, u32>,
    pub parallel_groups: Vec<Vec<ItemId>>,
    pub critical_path: Vec<ItemId>,
    pub cycles: Vec<Vec<ItemId>>,
    pub blocked_by_cycle: BTreeSet<ItemId>,
    pub execution_order: Vec<ItemId>,
}

#[derive(Debug, thiserror::Error)]
pub enum PriorityError {
    #[error("graph has no nodes")]
    EmptyGraph,
    #[error("graph validation failed: {0}")]
    Validation(String),
    #[error("unknown item id: {0}")]
    IssueNotFound(ItemId),
}

/// The Priority Analyzer. Holds a borrowed-copy snapshot of the last
/// analyzed graph plus its result, so queries can be answered in O(1)/O(k)
/// without re-running SCC/topo-sort on every call.
pub struct PriorityAnalyzer {
    config: PriorityConfig,
    graph: Option<DependencyGraph>,
    result: Option<AnalysisResult>,
}

impl PriorityAnalyzer {
    pub fn new(config: PriorityConfig) -> Self {
        Self {
            config,
            graph: None,
            result: None,
        }
    }

    /// Run the full analysis pipeline: validate → SCC detect → depth →
    /// critical path → topological order → parallel groups.
    pub fn analyze(&mut self, graph: &DependencyGraph) -> Result<&AnalysisResult, PriorityError> {
        if graph.nodes.is_empty() {
            return Err(PriorityError::EmptyGraph);
        }
        graph
            .validate()
            .map_err(|e| PriorityError::Validation(e.to_string()))?;

        let sccs = tarjan_scc(graph);
        let cycles: Vec<Vec<ItemId>> = sccs.into_iter().filter(|scc| scc.len() > 1).collect();

        let mut blocked_by_cycle: BTreeSet<ItemId> = BTreeSet::new();
        for cycle in &cycles {
            for id in cycle {
                blocked_by_cycle.insert(id.clone());
            }
        }
        // Anything transitively depending on a blocked node is blocked too.
        propagate_blocked(graph, &mut blocked_by_cycle);

        let depth_by_item = compute_depths(graph, &blocked_by_cycle);
        let critical_path = compute_critical_path(graph, &blocked_by_cycle, &depth_by_item);

        let mut per_item_scores = HashMap::new();
        for (id, item) in &graph.nodes {
            if blocked_by_cycle.contains(id) {
                continue;
            }
            let score = self.score_item(graph, item, &critical_path);
            per_item_scores.insert(id.clone(), score);
        }

        let execution_order =
            compute_execution_order(graph, &blocked_by_cycle, &depth_by_item, &per_item_scores);

        let mut parallel_groups: BTreeMap<u32, Vec<ItemId>> = BTreeMap::new();
        for id in &execution_order {
            let depth = *depth_by_item.get(id).unwrap_or(&0);
            parallel_groups.entry(depth).or_default().push(id.clone());
        }

        let result = AnalysisResult {
            per_item_scores,
            depth_by_item,
            parallel_groups: parallel_groups.into_values().collect(),
            critical_path,
            cycles,
            blocked_by_cycle,
            execution_order,
        };

        let mut stored_graph = graph.clone();
        for id in &result.blocked_by_cycle {
            if let Some(item) = stored_graph.nodes.get_mut(id) {
                if item.status == WorkItemStatus::Pending {
                    item.status = WorkItemStatus::InCycle;
                }
            }
        }

        self.graph = Some(stored_graph);
        self.result = Some(result);
        Ok(self.result.as_ref().unwrap())
    }

    fn score_item(
        &self,
        graph: &DependencyGraph,
        item: &controller_common::types::WorkItem,
        critical_path: &[ItemId],
    ) -> f64 {
        let w = match item.priority {
            Priority::P0 => self.config.weight_p0,
            Priority::P1 => self.config.weight_p1,
            Priority::P2 => self.config.weight_p2,
            Priority::P3 => self.config.weight_p3,
        };
        let transitive_dependents = transitive_dependents(graph, &item.id).len() as f64;
        let quick_win = if item.effort <= self.config.quick_win_threshold {
            self.config.quick_win_bonus
        } else {
            0.0
        };
        let on_critical_path = if critical_path.contains(&item.id) {
            self.config.critical_path_bonus
        } else {
            0.0
        };
        w + self.config.dependents_bonus * transitive_dependents + quick_win + on_critical_path
    }

    fn result(&self) -> Option<&AnalysisResult> {
        self.result.as_ref()
    }

    fn graph(&self) -> Option<&DependencyGraph> {
        self.graph.as_ref()
    }

    fn require_known(&self, id: &ItemId) -> Result<(), PriorityError> {
        match self.graph() {
            Some(g) if g.nodes.contains_key(id) => Ok(()),
            _ => Err(PriorityError::IssueNotFound(id.clone())),
        }
    }

    pub fn get_dependencies(&self, id: &ItemId) -> Result<Vec<ItemId>, PriorityError> {
        self.require_known(id)?;
        Ok(self.graph().unwrap().dependencies_of(id))
    }

    pub fn get_transitive_dependencies(&self, id: &ItemId) -> Result<BTreeSet<ItemId>, PriorityError> {
        self.require_known(id)?;
        let graph = self.graph().unwrap();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from(graph.dependencies_of(id));
        while let Some(cur) = queue.pop_front() {
            if seen.insert(cur.clone()) {
                for dep in graph.dependencies_of(&cur) {
                    queue.push_back(dep);
                }
            }
        }
        Ok(seen)
    }

    pub fn get_dependents(&self, id: &ItemId) -> Result<Vec<ItemId>, PriorityError> {
        self.require_known(id)?;
        Ok(self.graph().unwrap().dependents_of(id))
    }

    pub fn depends_on(&self, a: &ItemId, b: &ItemId) -> Result<bool, PriorityError> {
        Ok(self.get_transitive_dependencies(a)?.contains(b))
    }

    /// `ready(item) = status = pending ∧ item ∉ blocked_by_cycle ∧
    /// ∀d ∈ depends_on(item): status(d) = completed`.
    pub fn are_dependencies_resolved(&self, id: &ItemId) -> Result<bool, PriorityError> {
        self.require_known(id)?;
        let graph = self.graph().unwrap();
        for dep in graph.dependencies_of(id) {
            let dep_item = graph.nodes.get(&dep).ok_or_else(|| PriorityError::IssueNotFound(dep.clone()))?;
            if dep_item.status != WorkItemStatus::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_ready(&self, id: &ItemId) -> Result<bool, PriorityError> {
        self.require_known(id)?;
        let graph = self.graph().unwrap();
        let item = graph.nodes.get(id).unwrap();
        let result = self.result().expect("analyze must run before ready()");
        if item.status != WorkItemStatus::Pending {
            return Ok(false);
        }
        if result.blocked_by_cycle.contains(id) {
            return Ok(false);
        }
        self.are_dependencies_resolved(id)
    }

    pub fn get_executable_items(&self) -> Result<Vec<ItemId>, PriorityError> {
        let graph = self
            .graph()
            .ok_or_else(|| PriorityError::Validation("no analysis has run".into()))?;
        let mut out = Vec::new();
        for id in graph.nodes.keys() {
            if self.is_ready(id)? {
                out.push(id.clone());
            }
        }
        let result = self.result().unwrap();
        out.sort_by(|a, b| {
            let sa = result.per_item_scores.get(a).copied().unwrap_or(0.0);
            let sb = result.per_item_scores.get(b).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.cmp(b))
        });
        Ok(out)
    }

    pub fn get_next_executable_item(&self) -> Result<Option<ItemId>, PriorityError> {
        Ok(self.get_executable_items()?.into_iter().next())
    }

    pub fn get_blocked_by_cycle(&self) -> Vec<ItemId> {
        self.result()
            .map(|r| r.blocked_by_cycle.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fetch a copy of an item as currently tracked in the cached graph,
    /// reflecting any `mark_in_progress`/`mark_completed` calls since the
    /// last `analyze`.
    pub fn get_item(&self, id: &ItemId) -> Result<controller_common::types::WorkItem, PriorityError> {
        self.require_known(id)?;
        Ok(self.graph().unwrap().nodes[id].clone())
    }

    /// Mark `id` in progress in the cached graph so it no longer appears
    /// in `get_executable_items` while it is dispatched.
    pub fn mark_in_progress(&mut self, id: &ItemId) -> Result<(), PriorityError> {
        self.require_known(id)?;
        self.graph.as_mut().unwrap().nodes.get_mut(id).unwrap().status = WorkItemStatus::InProgress;
        Ok(())
    }

    /// Mark `id` completed in the cached graph, so its dependents can turn
    /// up in a subsequent `get_executable_items` call without re-running
    /// `analyze`.
    pub fn mark_completed(&mut self, id: &ItemId) -> Result<(), PriorityError> {
        self.require_known(id)?;
        self.graph.as_mut().unwrap().nodes.get_mut(id).unwrap().status = WorkItemStatus::Completed;
        Ok(())
    }
}

fn transitive_dependents(graph: &DependencyGraph, id: &ItemId) -> BTreeSet<ItemId> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from(graph.dependents_of(id));
    while let Some(cur) = queue.pop_front() {
        if seen.insert(cur.clone()) {
            for dep in graph.dependents_of(&cur) {
                queue.push_back(dep);
            }
        }
    }
    seen
}

/// Tarjan's strongly-connected-components algorithm, returning every SCC
/// (including singletons — callers filter to `len() > 1` for cycles).
fn tarjan_scc(graph: &DependencyGraph) -> Vec<Vec<ItemId>> {
    struct State<'a> {
        graph: &'a DependencyGraph,
        index_counter: usize,
        stack: Vec<ItemId>,
        on_stack: HashSet<ItemId>,
        indices: HashMap<ItemId, usize>,
        low_links: HashMap<ItemId, usize>,
        sccs: Vec<Vec<ItemId>>,
    }

    fn strong_connect(state: &mut State, v: &ItemId) {
        state.indices.insert(v.clone(), state.index_counter);
        state.low_links.insert(v.clone(), state.index_counter);
        state.index_counter += 1;
        state.stack.push(v.clone());
        state.on_stack.insert(v.clone());

        for w in state.graph.dependents_of(v) {
            if !state.indices.contains_key(&w) {
                strong_connect(state, &w);
                let w_low = state.low_links[&w];
                let v_low = state.low_links[v];
                state.low_links.insert(v.clone(), v_low.min(w_low));
            } else if state.on_stack.contains(&w) {
                let w_idx = state.indices[&w];
                let v_low = state.low_links[v];
                state.low_links.insert(v.clone(), v_low.min(w_idx));
            }
        }

        if state.low_links[v] == state.indices[v] {
            let mut component = Vec::new();
            loop {
                let w = state.stack.pop().unwrap();
                state.on_stack.remove(&w);
                let is_v = &w == v;
                component.push(w);
                if is_v {
                    break;
                }
            }
            state.sccs.push(component);
        }
    }

    let mut state = State {
        graph,
        index_counter: 0,
        stack: Vec::new(),
        on_stack: HashSet::new(),
        indices: HashMap::new(),
        low_links: HashMap::new(),
        sccs: Vec::new(),
    };

    for id in graph.nodes.keys() {
        if !state.indices.contains_key(id) {
            strong_connect(&mut state, id);
        }
    }

    state.sccs
}

/// Any node that transitively depends on a blocked node is blocked too.
fn propagate_blocked(graph: &DependencyGraph, blocked: &mut BTreeSet<ItemId>) {
    loop {
        let mut added = false;
        for id in graph.nodes.keys() {
            if blocked.contains(id) {
                continue;
            }
            if graph.dependencies_of(id).iter().any(|d| blocked.contains(d)) {
                blocked.insert(id.clone());
                added = true;
            }
        }
        if !added {
            break;
        }
    }
}

/// Longest path (in edge count) from any root, skipping blocked nodes.
fn compute_depths(graph: &DependencyGraph, blocked: &BTreeSet<ItemId>) -> HashMap<ItemId, u32> {
    let mut depths: HashMap<ItemId, u32> = HashMap::new();
    let order = match topo_order(graph, blocked) {
        Some(o) => o,
        None => return depths,
    };
    for id in &order {
        let deps = graph.dependencies_of(id);
        let depth = deps
            .iter()
            .filter(|d| !blocked.contains(*d))
            .map(|d| depths.get(d).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(id.clone(), depth);
    }
    depths
}

/// Longest cumulative-effort chain from any root to any leaf over
/// non-blocked nodes. Ties: lower depth first, then lexicographic item id.
fn compute_critical_path(
    graph: &DependencyGraph,
    blocked: &BTreeSet<ItemId>,
    depths: &HashMap<ItemId, u32>,
) -> Vec<ItemId> {
    let order = match topo_order(graph, blocked) {
        Some(o) => o,
        None => return Vec::new(),
    };

    // best_effort[id] = max cumulative effort of a chain ending at id.
    let mut best_effort: HashMap<ItemId, u32> = HashMap::new();
    let mut predecessor: HashMap<ItemId, Option<ItemId>> = HashMap::new();

    for id in &order {
        let item = &graph.nodes[id];
        let deps: Vec<ItemId> = graph
            .dependencies_of(id)
            .into_iter()
            .filter(|d| !blocked.contains(d))
            .collect();

        if deps.is_empty() {
            best_effort.insert(id.clone(), item.effort);
            predecessor.insert(id.clone(), None);
            continue;
        }

        let mut best_dep: Option<&ItemId> = None;
        let mut best_value = 0u32;
        for dep in &deps {
            let dep_value = *best_effort.get(dep).unwrap_or(&0);
            let better = match best_dep {
                None => true,
                Some(cur) => {
                    dep_value > best_value
                        || (dep_value == best_value
                            && (depths.get(dep).unwrap_or(&0) < depths.get(cur).unwrap_or(&0)
                                || (depths.get(dep) == depths.get(cur) && dep < cur)))
                }
            };
            if better {
                best_dep = Some(dep);
                best_value = dep_value;
            }
        }

        best_effort.insert(id.clone(), best_value + item.effort);
        predecessor.insert(id.clone(), best_dep.cloned());
    }

    let mut best_leaf: Option<&ItemId> = None;
    let mut best_leaf_value = 0u32;
    for id in &order {
        let value = *best_effort.get(id).unwrap_or(&0);
        let better = match best_leaf {
            None => true,
            Some(cur) => {
                value > best_leaf_value
                    || (value == best_leaf_value
                        && (depths.get(id).unwrap_or(&0) < depths.get(cur).unwrap_or(&0)
                            || (depths.get(id) == depths.get(cur) && id < cur)))
            }
        };
        if better {
            best_leaf = Some(id);
            best_leaf_value = value;
        }
    }

    let mut path = Vec::new();
    let mut cur = best_leaf.cloned();
    while let Some(id) = cur {
        let pred = predecessor.get(&id).cloned().flatten();
        path.push(id);
        cur = pred;
    }
    path.reverse();
    path
}

/// Topological order restricted to non-blocked nodes; `None` if a cycle
/// remains among non-blocked nodes (should not happen once `blocked` is
/// fully propagated, but guarded defensively).
fn topo_order(graph: &DependencyGraph, blocked: &BTreeSet<ItemId>) -> Option<Vec<ItemId>> {
    let nodes: Vec<&ItemId> = graph.nodes.keys().filter(|id| !blocked.contains(*id)).collect();
    let mut in_degree: HashMap<ItemId, u32> = HashMap::new();
    for id in &nodes {
        let deps = graph
            .dependencies_of(id)
            .into_iter()
            .filter(|d| !blocked.contains(d))
            .count() as u32;
        in_degree.insert((*id).clone(), deps);
    }

    let mut ready: VecDeque<ItemId> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| id.clone())
        .collect();
    // Deterministic processing order.
    let mut ready_vec: Vec<ItemId> = ready.drain(..).collect();
    ready_vec.sort();
    let mut ready: VecDeque<ItemId> = ready_vec.into();

    let mut order = Vec::new();
    while let Some(id) = ready.pop_front() {
        order.push(id.clone());
        let mut newly_ready = Vec::new();
        for dependent in graph.dependents_of(&id) {
            if blocked.contains(&dependent) {
                continue;
            }
            if let Some(deg) = in_degree.get_mut(&dependent) {
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(dependent);
                }
            }
        }
        newly_ready.sort();
        for n in newly_ready {
            ready.push_back(n);
        }
    }

    if order.len() != nodes.len() {
        return None;
    }
    Some(order)
}

/// Topological order, depth-layered, with items inside a layer sorted by
/// `score` descending then `item_id` ascending for determinism.
fn compute_execution_order(
    graph: &DependencyGraph,
    blocked: &BTreeSet<ItemId>,
    depths: &HashMap<ItemId, u32>,
    scores: &HashMap<ItemId, f64>,
) -> Vec<ItemId> {
    let mut by_depth: BTreeMap<u32, Vec<ItemId>> = BTreeMap::new();
    for id in graph.nodes.keys() {
        if blocked.contains(id) {
            continue;
        }
        let depth = *depths.get(id).unwrap_or(&0);
        by_depth.entry(depth).or_default().push(id.clone());
    }

    let mut order = Vec::new();
    for (_, mut layer) in by_depth {
        layer.sort_by(|a, b| {
            let sa = scores.get(a).copied().unwrap_or(0.0);
            let sb = scores.get(b).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.cmp(b))
        });
        order.extend(layer);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_common::types::WorkItem;

    fn config() -> PriorityConfig {
        PriorityConfig {
            weight_p0: 100.0,
            weight_p1: 75.0,
            weight_p2: 50.0,
            weight_p3: 25.0,
            dependents_bonus: 5.0,
            quick_win_threshold: 2,
            quick_win_bonus: 10.0,
            critical_path_bonus: 15.0,
        }
    }

    fn item(id: &str, priority: Priority, effort: u32) -> WorkItem {
        WorkItem::new(id, priority, effort)
    }

    #[test]
    fn empty_graph_errors() {
        let mut pa = PriorityAnalyzer::new(config());
        let graph = DependencyGraph::new();
        assert!(matches!(pa.analyze(&graph), Err(PriorityError::EmptyGraph)));
    }

    #[test]
    fn cycle_isolation_scenario() {
        // A -> B -> C -> A, plus standalone E.
        let mut graph = DependencyGraph::with_nodes([
            item("A", Priority::P1, 1),
            item("B", Priority::P1, 1),
            item("C", Priority::P1, 1),
            item("E", Priority::P1, 1),
        ]);
        graph.add_edge("A", "B");
        graph.add_edge("B", "C");
        graph.add_edge("C", "A");

        let mut pa = PriorityAnalyzer::new(config());
        let result = pa.analyze(&graph).unwrap();
        assert_eq!(result.cycles.len(), 1);
        assert!(result.blocked_by_cycle.contains(&ItemId::from("A")));
        assert!(result.blocked_by_cycle.contains(&ItemId::from("B")));
        assert!(result.blocked_by_cycle.contains(&ItemId::from("C")));
        assert!(!result.blocked_by_cycle.contains(&ItemId::from("E")));

        let executable = pa.get_executable_items().unwrap();
        assert_eq!(executable, vec![ItemId::from("E")]);
    }

    #[test]
    fn blocked_by_cycle_propagates_to_downstream_nodes() {
        // A -> B -> A (cycle), D depends on B (should also be blocked).
        let mut graph = DependencyGraph::with_nodes([
            item("A", Priority::P1, 1),
            item("B", Priority::P1, 1),
            item("D", Priority::P1, 1),
        ]);
        graph.add_edge("A", "B");
        graph.add_edge("B", "A");
        graph.add_edge("B", "D");

        let mut pa = PriorityAnalyzer::new(config());
        let result = pa.analyze(&graph).unwrap();
        assert!(result.blocked_by_cycle.contains(&ItemId::from("D")));
        assert!(!result.execution_order.contains(&ItemId::from("D")));
    }

    #[test]
    fn determinism_on_repeated_analysis() {
        let mut graph = DependencyGraph::with_nodes([
            item("A", Priority::P2, 3),
            item("B", Priority::P0, 1),
            item("C", Priority::P1, 2),
        ]);
        graph.add_edge("A", "C");

        let mut pa1 = PriorityAnalyzer::new(config());
        let r1 = pa1.analyze(&graph).unwrap().clone();
        let mut pa2 = PriorityAnalyzer::new(config());
        let r2 = pa2.analyze(&graph).unwrap().clone();

        assert_eq!(r1.execution_order, r2.execution_order);
        assert_eq!(r1.cycles.len(), r2.cycles.len());
        assert_eq!(r1.critical_path, r2.critical_path);
    }

    #[test]
    fn quick_win_bonus_applies_at_zero_effort() {
        let graph = DependencyGraph::with_nodes([item("Z", Priority::P3, 0)]);
        let mut pa = PriorityAnalyzer::new(config());
        let result = pa.analyze(&graph).unwrap();
        let score = result.per_item_scores[&ItemId::from("Z")];
        assert_eq!(score, config().weight_p3 + config().quick_win_bonus);
    }

    #[test]
    fn blocked_items_are_marked_in_cycle() {
        let mut graph = DependencyGraph::with_nodes([
            item("A", Priority::P1, 1),
            item("B", Priority::P1, 1),
        ]);
        graph.add_edge("A", "B");
        graph.add_edge("B", "A");

        let mut pa = PriorityAnalyzer::new(config());
        pa.analyze(&graph).unwrap();
        assert_eq!(pa.get_item(&ItemId::from("A")).unwrap().status, WorkItemStatus::InCycle);
        assert_eq!(pa.get_item(&ItemId::from("B")).unwrap().status, WorkItemStatus::InCycle);
    }

    #[test]
    fn mark_completed_makes_dependent_executable() {
        // B depends on A; B can't be ready until A is marked completed.
        let mut graph = DependencyGraph::with_nodes([
            item("A", Priority::P1, 1),
            item("B", Priority::P1, 1),
        ]);
        graph.add_edge("A", "B");

        let mut pa = PriorityAnalyzer::new(config());
        pa.analyze(&graph).unwrap();
        assert_eq!(pa.get_executable_items().unwrap(), vec![ItemId::from("A")]);

        pa.mark_in_progress(&ItemId::from("A")).unwrap();
        assert!(pa.get_executable_items().unwrap().is_empty());

        pa.mark_completed(&ItemId::from("A")).unwrap();
        assert_eq!(pa.get_executable_items().unwrap(), vec![ItemId::from("B")]);
    }

    #[test]
    fn unknown_item_is_an_error() {
        let graph = DependencyGraph::with_nodes([item("A", Priority::P1, 1)]);
        let mut pa = PriorityAnalyzer::new(config());
        pa.analyze(&graph).unwrap();
        let missing = ItemId::from("nope");
        assert!(matches!(
            pa.get_dependencies(&missing),
            Err(PriorityError::IssueNotFound(_))
        ));
    }
}
