//! Execution plan: topological order, scoped bodies, join regions, parallel
//! scopes and sinks.
//!
//! Uses `petgraph` to detect cycles and produce a topological order, then
//! derives everything the scheduler needs as index-based lookups so the hot
//! path never touches string ids.
//!
//! A scoped node (loop, retry, try/catch, timeout) owns a *body*: the nodes
//! reachable from its `body`-handle edges (or from its single outgoing edge
//! when none is labeled), minus anything also reachable from its
//! continuation edges or fed by a node outside the body. Bodies nest but
//! never partially overlap.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use weft_types::node::{JoinStrategy, NodeKind};
use weft_types::workflow::{Edge, HANDLE_BODY, Node, Workflow};

use super::validate::{ValidationError, validate_structure};

/// The subgraph a scoped node runs itself.
#[derive(Debug, Clone, Default)]
pub struct ScopeBody {
    /// Nodes directly owned by this scope, in topological order.
    pub members: Vec<usize>,
    /// Every node inside the body, including nested bodies.
    pub nodes: BTreeSet<usize>,
    /// Direct members with no outgoing edge to another direct member.
    pub terminals: Vec<usize>,
}

/// Nodes a `any`/`first` join cancels once it fires.
#[derive(Debug, Clone, Default)]
pub struct JoinRegion {
    /// Nodes that feed only this join, so failures in them are tolerated
    /// until the join resolves.
    pub region: BTreeSet<usize>,
    /// Dispatching any of these arms the join timeout.
    pub watch: BTreeSet<usize>,
}

/// A validated workflow compiled into index-based lookups.
#[derive(Debug)]
pub struct ExecutionPlan {
    workflow: Arc<Workflow>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    rank: Vec<usize>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    owner: Vec<Option<usize>>,
    bodies: HashMap<usize, ScopeBody>,
    top_level: Vec<usize>,
    joins: HashMap<usize, JoinRegion>,
    parallel: Vec<Vec<usize>>,
    sinks: Vec<usize>,
}

impl ExecutionPlan {
    /// Validate `workflow` and compile it.
    pub fn build(workflow: &Workflow) -> Result<Self, ValidationError> {
        validate_structure(workflow)?;

        let workflow = Arc::new(workflow.clone());
        let n = workflow.nodes.len();
        let index: HashMap<String, usize> = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();

        let mut incoming = vec![Vec::new(); n];
        let mut outgoing = vec![Vec::new(); n];
        let mut graph = DiGraph::<usize, ()>::new();
        let graph_nodes: Vec<_> = (0..n).map(|i| graph.add_node(i)).collect();
        for (e, edge) in workflow.edges.iter().enumerate() {
            let (src, tgt) = (index[&edge.source], index[&edge.target]);
            outgoing[src].push(e);
            incoming[tgt].push(e);
            graph.add_edge(graph_nodes[src], graph_nodes[tgt], ());
        }

        // Topological sort -- detects cycles
        let sorted = toposort(&graph, None).map_err(|cycle| {
            let i = graph[cycle.node_id()];
            ValidationError::CycleDetected(workflow.nodes[i].id.clone())
        })?;
        let order: Vec<usize> = sorted.into_iter().map(|ix| graph[ix]).collect();
        let mut rank = vec![0; n];
        for (pos, &i) in order.iter().enumerate() {
            rank[i] = pos;
        }

        let mut plan = Self {
            workflow,
            index,
            order,
            rank,
            incoming,
            outgoing,
            owner: vec![None; n],
            bodies: HashMap::new(),
            top_level: Vec::new(),
            joins: HashMap::new(),
            parallel: vec![Vec::new(); n],
            sinks: Vec::new(),
        };
        plan.compute_bodies()?;
        plan.compute_joins();
        plan.compute_parallel_scopes();
        plan.compute_sinks();
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn len(&self) -> usize {
        self.workflow.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflow.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.workflow.nodes[idx]
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.workflow.nodes[idx].id
    }

    pub fn edge(&self, e: usize) -> &Edge {
        &self.workflow.edges[e]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Source node index of edge `e`.
    pub fn source(&self, e: usize) -> usize {
        self.index[&self.workflow.edges[e].source]
    }

    /// Target node index of edge `e`.
    pub fn target(&self, e: usize) -> usize {
        self.index[&self.workflow.edges[e].target]
    }

    /// All nodes in topological order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Position of `idx` in the topological order.
    pub fn rank(&self, idx: usize) -> usize {
        self.rank[idx]
    }

    pub fn incoming(&self, idx: usize) -> &[usize] {
        &self.incoming[idx]
    }

    pub fn outgoing(&self, idx: usize) -> &[usize] {
        &self.outgoing[idx]
    }

    /// Innermost scoped node whose body contains `idx`.
    pub fn owner(&self, idx: usize) -> Option<usize> {
        self.owner[idx]
    }

    pub fn body(&self, scoped: usize) -> Option<&ScopeBody> {
        self.bodies.get(&scoped)
    }

    /// Direct members of a scope (`None` is the top level), topologically ordered.
    pub fn members(&self, scope: Option<usize>) -> &[usize] {
        match scope {
            None => &self.top_level,
            Some(s) => self
                .bodies
                .get(&s)
                .map(|b| b.members.as_slice())
                .unwrap_or_default(),
        }
    }

    pub fn join_region(&self, join: usize) -> Option<&JoinRegion> {
        self.joins.get(&join)
    }

    /// Parallel nodes whose scope contains `idx`, outermost first.
    pub fn parallel_scopes(&self, idx: usize) -> &[usize] {
        &self.parallel[idx]
    }

    /// Nodes whose values form the run output, in topological order.
    pub fn sinks(&self) -> &[usize] {
        &self.sinks
    }

    /// Whether `idx` lies inside the body of `scope` (at any depth).
    pub fn is_within(&self, idx: usize, scope: usize) -> bool {
        let mut cursor = self.owner[idx];
        while let Some(o) = cursor {
            if o == scope {
                return true;
            }
            cursor = self.owner[o];
        }
        false
    }

    /// Whether `idx` is a direct member of `scope` or nested inside it.
    fn in_scope(&self, idx: usize, scope: Option<usize>) -> bool {
        match scope {
            None => true,
            Some(s) => self.is_within(idx, s),
        }
    }

    // -----------------------------------------------------------------------
    // Reachability helpers
    // -----------------------------------------------------------------------

    fn descendants(&self, starts: impl IntoIterator<Item = usize>) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = starts.into_iter().collect();
        while let Some(i) = queue.pop_front() {
            if seen.insert(i) {
                queue.extend(self.outgoing[i].iter().map(|&e| self.target(e)));
            }
        }
        seen
    }

    fn ancestors(&self, idx: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> =
            self.incoming[idx].iter().map(|&e| self.source(e)).collect();
        while let Some(i) = queue.pop_front() {
            if seen.insert(i) {
                queue.extend(self.incoming[i].iter().map(|&e| self.source(e)));
            }
        }
        seen
    }

    fn topo_sorted(&self, nodes: impl IntoIterator<Item = usize>) -> Vec<usize> {
        let mut out: Vec<usize> = nodes.into_iter().collect();
        out.sort_by_key(|&i| self.rank[i]);
        out
    }

    // -----------------------------------------------------------------------
    // Bodies
    // -----------------------------------------------------------------------

    fn compute_bodies(&mut self) -> Result<(), ValidationError> {
        let scoped: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&i| self.node(i).kind.is_scoped())
            .collect();

        let mut sets: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        for &s in &scoped {
            sets.insert(s, self.body_nodes(s));
        }

        // Bodies either nest or are disjoint.
        for (i, &a) in scoped.iter().enumerate() {
            for &b in &scoped[i + 1..] {
                let (body_a, body_b) = (&sets[&a], &sets[&b]);
                if body_a.is_disjoint(body_b) {
                    continue;
                }
                let b_in_a = body_a.contains(&b) && body_b.is_subset(body_a);
                let a_in_b = body_b.contains(&a) && body_a.is_subset(body_b);
                if !(b_in_a || a_in_b) {
                    let (first, second) = if a < b { (a, b) } else { (b, a) };
                    return Err(ValidationError::OverlappingScopes {
                        first: self.id(first).to_string(),
                        second: self.id(second).to_string(),
                    });
                }
            }
        }

        // Innermost owner has the smallest body containing the node.
        for (&s, body) in &sets {
            for &n in body {
                let replace = match self.owner[n] {
                    None => true,
                    Some(current) => body.len() < sets[&current].len(),
                };
                if replace {
                    self.owner[n] = Some(s);
                }
            }
        }

        for (s, nodes) in sets {
            let members = self.topo_sorted(nodes.iter().copied().filter(|&n| self.owner[n] == Some(s)));
            let direct: HashSet<usize> = members.iter().copied().collect();
            let terminals = members
                .iter()
                .copied()
                .filter(|&m| {
                    !self.outgoing[m]
                        .iter()
                        .any(|&e| direct.contains(&self.target(e)))
                })
                .collect();
            self.bodies.insert(
                s,
                ScopeBody {
                    members,
                    nodes,
                    terminals,
                },
            );
        }

        self.top_level = self
            .order
            .iter()
            .copied()
            .filter(|&i| self.owner[i].is_none())
            .collect();
        Ok(())
    }

    /// Edges leaving `scoped` that enter its body.
    pub fn body_edges(&self, scoped: usize) -> Vec<usize> {
        let out = &self.outgoing[scoped];
        let labeled: Vec<usize> = out
            .iter()
            .copied()
            .filter(|&e| self.edge(e).source_handle.as_deref() == Some(HANDLE_BODY))
            .collect();
        if labeled.is_empty() && out.len() == 1 {
            return out.clone();
        }
        labeled
    }

    fn body_nodes(&self, s: usize) -> BTreeSet<usize> {
        let body_edges = self.body_edges(s);
        let continuation: Vec<usize> = self.outgoing[s]
            .iter()
            .copied()
            .filter(|e| !body_edges.contains(e))
            .collect();

        let candidates = self.descendants(body_edges.iter().map(|&e| self.target(e)));
        let after = self.descendants(continuation.iter().map(|&e| self.target(e)));
        let upstream = self.ancestors(s);

        let mut body: BTreeSet<usize> = candidates.difference(&after).copied().collect();
        loop {
            let outside_fed: Vec<usize> = body
                .iter()
                .copied()
                .filter(|&n| {
                    self.incoming[n].iter().any(|&e| {
                        let p = self.source(e);
                        p != s && !body.contains(&p) && !upstream.contains(&p)
                    })
                })
                .collect();
            if outside_fed.is_empty() {
                break;
            }
            for n in outside_fed {
                body.remove(&n);
            }
        }
        body
    }

    // -----------------------------------------------------------------------
    // Join regions
    // -----------------------------------------------------------------------

    fn compute_joins(&mut self) {
        let joins: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&i| {
                matches!(
                    &self.node(i).kind,
                    NodeKind::Join(cfg) if cfg.strategy != JoinStrategy::All
                )
            })
            .collect();

        for j in joins {
            let region = self.join_region_for(j);
            self.joins.insert(j, region);
        }
    }

    fn join_region_for(&self, j: usize) -> JoinRegion {
        let scope = self.owner[j];
        let upstream: Vec<usize> = self.topo_sorted(
            self.ancestors(j)
                .into_iter()
                .filter(|&a| self.owner[a] == scope),
        );

        // A candidate feeds nothing but other candidates (or the join).
        let mut candidates: HashSet<usize> = HashSet::new();
        for &a in upstream.iter().rev() {
            let exclusive = self.outgoing[a].iter().all(|&e| {
                let t = self.target(e);
                t == j || candidates.contains(&t) || self.is_within(t, a)
            });
            if exclusive {
                candidates.insert(a);
            }
        }

        // Only nodes on exactly one branch can be cancelled when another wins.
        let mut branches: HashMap<usize, usize> = HashMap::new();
        let mut watch = BTreeSet::new();
        for &e in &self.incoming[j] {
            let tail = self.source(e);
            if self.owner[tail] == scope {
                watch.insert(tail);
            }
            let above = self.ancestors(tail);
            for &c in &candidates {
                if c == tail || above.contains(&c) {
                    *branches.entry(c).or_default() += 1;
                }
            }
        }
        let region: BTreeSet<usize> = branches
            .into_iter()
            .filter(|&(_, count)| count == 1)
            .map(|(c, _)| c)
            .collect();
        watch.extend(region.iter().copied());
        JoinRegion { region, watch }
    }

    // -----------------------------------------------------------------------
    // Parallel scopes
    // -----------------------------------------------------------------------

    fn compute_parallel_scopes(&mut self) {
        let parallels: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&i| matches!(self.node(i).kind, NodeKind::Parallel(_)))
            .collect();

        for p in parallels {
            let scope = self.owner[p];
            let mut seen = HashSet::new();
            let mut queue: VecDeque<usize> =
                self.outgoing[p].iter().map(|&e| self.target(e)).collect();
            while let Some(i) = queue.pop_front() {
                if matches!(self.node(i).kind, NodeKind::Join(_)) || !self.in_scope(i, scope) {
                    continue;
                }
                if seen.insert(i) {
                    queue.extend(self.outgoing[i].iter().map(|&e| self.target(e)));
                }
            }
            for i in seen {
                self.parallel[i].push(p);
            }
        }

        let rank = &self.rank;
        for scopes in &mut self.parallel {
            scopes.sort_by_key(|&p| rank[p]);
        }
    }

    // -----------------------------------------------------------------------
    // Sinks
    // -----------------------------------------------------------------------

    fn compute_sinks(&mut self) {
        let explicit: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&i| {
                let node = self.node(i);
                node.sink || matches!(node.kind, NodeKind::Output(_))
            })
            .collect();
        if !explicit.is_empty() {
            self.sinks = explicit;
            return;
        }

        self.sinks = self
            .top_level
            .iter()
            .copied()
            .filter(|&i| {
                self.outgoing[i]
                    .iter()
                    .all(|&e| self.is_within(self.target(e), i))
            })
            .collect();
    }
}
