//! Flow graph arena.
//!
//! Nodes live in a slab and refer to each other by [`NodeId`]. Every node has
//! at most one provider, so each connected component is a tree rooted at a
//! node without a provider (normally a source). A change anywhere in a tree
//! recomputes that tree only:
//!
//! 1. counters of every node in the tree are integrated up to `now` using
//!    the rates that held until now;
//! 2. demand is summed bottom-up;
//! 3. supply is pushed top-down, each provider splitting what it has among
//!    its consumers with [`max_min_fair`].
//!
//! Rates are in MHz (or W for power trees); integrated work is in rate x
//! seconds.

use super::distributor::max_min_fair;
use crate::error::SimError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Slack allowed when checking that a provider did not hand out more than it
/// had.
const CONSERVATION_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Produces up to `capacity`.
    Source { capacity: f64 },
    /// Shares its own supply among its consumers.
    Distributor,
    /// Terminal consumer with an externally set demand.
    Sink,
}

impl NodeKind {
    fn label(&self) -> &'static str {
        match self {
            NodeKind::Source { .. } => "source",
            NodeKind::Distributor => "distributor",
            NodeKind::Sink => "sink",
        }
    }

    fn is_provider(&self) -> bool {
        !matches!(self, NodeKind::Sink)
    }
}

/// Work accumulated by one node.
///
/// `requested == granted + overcommitted + interfered + lost` always holds
/// up to rounding.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowCounters {
    /// Demand integrated over time.
    pub requested: f64,
    /// Supply that did useful work.
    pub granted: f64,
    /// Demand a connected provider could not supply (contention).
    pub overcommitted: f64,
    /// Supply wasted to co-location interference.
    pub interfered: f64,
    /// Demand with no source behind it at all (e.g. host down).
    pub lost: f64,
}

impl FlowCounters {
    pub fn add(&mut self, other: &FlowCounters) {
        self.requested += other.requested;
        self.granted += other.granted;
        self.overcommitted += other.overcommitted;
        self.interfered += other.interfered;
        self.lost += other.lost;
    }
}

/// Recomputation statistics, used to check that updates stay local.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    pub recomputations: u64,
    pub nodes_visited: u64,
}

#[derive(Debug, Clone)]
struct FlowNode {
    kind: NodeKind,
    provider: Option<NodeId>,
    consumers: Vec<NodeId>,
    demand: f64,
    supply: f64,
    /// Fraction of supply lost to interference (sinks only).
    interference: f64,
    /// Whether the tree this node hangs in has a source at its root.
    powered: bool,
    counters: FlowCounters,
    last_update_ms: u64,
}

impl FlowNode {
    fn new(kind: NodeKind, now_ms: u64) -> Self {
        Self {
            kind,
            provider: None,
            consumers: Vec::new(),
            demand: 0.0,
            supply: 0.0,
            interference: 0.0,
            powered: matches!(kind, NodeKind::Source { .. }),
            counters: FlowCounters::default(),
            last_update_ms: now_ms,
        }
    }

    fn integrate(&mut self, now_ms: u64) {
        if now_ms <= self.last_update_ms {
            return;
        }
        let dt = (now_ms - self.last_update_ms) as f64 / 1000.0;
        let shortfall = (self.demand - self.supply).max(0.0);
        let interfered = self.supply * self.interference;
        let c = &mut self.counters;
        c.requested += self.demand * dt;
        c.granted += (self.supply - interfered) * dt;
        c.interfered += interfered * dt;
        if self.powered {
            c.overcommitted += shortfall * dt;
        } else {
            c.lost += shortfall * dt;
        }
        self.last_update_ms = now_ms;
    }
}

/// A forest of flow trees.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: Vec<Option<FlowNode>>,
    free: Vec<usize>,
    stats: FlowStats,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node.0), Some(Some(_)))
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn add_source(&mut self, capacity: f64, now_ms: u64) -> Result<NodeId, SimError> {
        check_rate(capacity)?;
        Ok(self.insert(FlowNode::new(NodeKind::Source { capacity }, now_ms)))
    }

    pub fn add_distributor(&mut self, now_ms: u64) -> NodeId {
        self.insert(FlowNode::new(NodeKind::Distributor, now_ms))
    }

    pub fn add_sink(&mut self, now_ms: u64) -> NodeId {
        self.insert(FlowNode::new(NodeKind::Sink, now_ms))
    }

    fn insert(&mut self, node: FlowNode) -> NodeId {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                NodeId(i)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn node(&self, id: NodeId) -> Result<&FlowNode, SimError> {
        self.nodes
            .get(id.0)
            .and_then(|n| n.as_ref())
            .ok_or(SimError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut FlowNode, SimError> {
        self.nodes
            .get_mut(id.0)
            .and_then(|n| n.as_mut())
            .ok_or(SimError::UnknownNode(id))
    }

    pub fn kind(&self, node: NodeId) -> Result<NodeKind, SimError> {
        Ok(self.node(node)?.kind)
    }

    pub fn demand(&self, node: NodeId) -> Result<f64, SimError> {
        Ok(self.node(node)?.demand)
    }

    pub fn supply(&self, node: NodeId) -> Result<f64, SimError> {
        Ok(self.node(node)?.supply)
    }

    pub fn provider(&self, node: NodeId) -> Result<Option<NodeId>, SimError> {
        Ok(self.node(node)?.provider)
    }

    pub fn consumers(&self, node: NodeId) -> Result<&[NodeId], SimError> {
        Ok(&self.node(node)?.consumers)
    }

    /// Attach `consumer` below `provider`.
    pub fn connect(
        &mut self,
        consumer: NodeId,
        provider: NodeId,
        now_ms: u64,
    ) -> Result<(), SimError> {
        let kind = self.node(provider)?.kind;
        if !kind.is_provider() {
            return Err(SimError::WrongNodeKind {
                node: provider,
                expected: "source or distributor",
            });
        }
        let c = self.node(consumer)?;
        if matches!(c.kind, NodeKind::Source { .. }) {
            return Err(SimError::WrongNodeKind {
                node: consumer,
                expected: "distributor or sink",
            });
        }
        if c.provider.is_some() {
            return Err(SimError::AlreadyConnected(consumer));
        }
        // the provider must not hang below the consumer
        if self.root(provider)? == consumer {
            return Err(SimError::AlreadyConnected(consumer));
        }

        let upper = self.root(provider)?;
        self.integrate_tree(upper, now_ms)?;
        self.integrate_tree(consumer, now_ms)?;
        self.node_mut(consumer)?.provider = Some(provider);
        self.node_mut(provider)?.consumers.push(consumer);
        self.recompute(upper)
    }

    /// Detach `consumer` from its provider. Both resulting trees are
    /// recomputed.
    pub fn disconnect(&mut self, consumer: NodeId, now_ms: u64) -> Result<(), SimError> {
        let Some(provider) = self.node(consumer)?.provider else {
            return Ok(());
        };
        let upper = self.root(provider)?;
        self.integrate_tree(upper, now_ms)?;
        self.node_mut(provider)?.consumers.retain(|&n| n != consumer);
        self.node_mut(consumer)?.provider = None;
        self.recompute(upper)?;
        self.recompute(consumer)
    }

    /// Change a sink's demand and recompute its tree.
    pub fn set_demand(&mut self, sink: NodeId, demand: f64, now_ms: u64) -> Result<(), SimError> {
        check_rate(demand)?;
        let node = self.node(sink)?;
        if node.kind != NodeKind::Sink {
            return Err(SimError::WrongNodeKind {
                node: sink,
                expected: "sink",
            });
        }
        if node.demand == demand {
            return Ok(());
        }
        let root = self.root(sink)?;
        self.integrate_tree(root, now_ms)?;
        self.node_mut(sink)?.demand = demand;
        self.recompute(root)
    }

    /// Change a source's capacity and recompute its tree.
    pub fn set_capacity(
        &mut self,
        source: NodeId,
        capacity: f64,
        now_ms: u64,
    ) -> Result<(), SimError> {
        check_rate(capacity)?;
        if !matches!(self.node(source)?.kind, NodeKind::Source { .. }) {
            return Err(SimError::WrongNodeKind {
                node: source,
                expected: "source",
            });
        }
        self.integrate_tree(source, now_ms)?;
        self.node_mut(source)?.kind = NodeKind::Source { capacity };
        self.recompute(source)
    }

    /// Set the fraction of a sink's supply that is wasted to interference.
    pub fn set_interference(
        &mut self,
        sink: NodeId,
        fraction: f64,
        now_ms: u64,
    ) -> Result<(), SimError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(SimError::InvalidRate(fraction));
        }
        let node = self.node_mut(sink)?;
        if node.kind != NodeKind::Sink {
            return Err(SimError::WrongNodeKind {
                node: sink,
                expected: "sink",
            });
        }
        node.integrate(now_ms);
        node.interference = fraction;
        Ok(())
    }

    /// Remove a node. Its consumers become roots of their own (unpowered)
    /// trees. Returns the node's final counters.
    pub fn remove(&mut self, node: NodeId, now_ms: u64) -> Result<FlowCounters, SimError> {
        let root = self.root(node)?;
        self.integrate_tree(root, now_ms)?;
        let (provider, consumers) = {
            let n = self.node(node)?;
            (n.provider, n.consumers.clone())
        };
        if let Some(p) = provider {
            self.node_mut(p)?.consumers.retain(|&c| c != node);
        }
        for &c in &consumers {
            self.node_mut(c)?.provider = None;
        }
        let removed = self.nodes[node.0].take().ok_or(SimError::UnknownNode(node))?;
        self.free.push(node.0);
        if root != node {
            self.recompute(root)?;
        }
        for c in consumers {
            self.recompute(c)?;
        }
        Ok(removed.counters)
    }

    /// Drop every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
    }

    /// Counters of `node` integrated up to `now_ms`.
    pub fn counters(&mut self, node: NodeId, now_ms: u64) -> Result<FlowCounters, SimError> {
        let n = self.node_mut(node)?;
        n.integrate(now_ms);
        Ok(n.counters)
    }

    /// Like [`counters`](Self::counters), then zero them.
    pub fn take_counters(&mut self, node: NodeId, now_ms: u64) -> Result<FlowCounters, SimError> {
        let n = self.node_mut(node)?;
        n.integrate(now_ms);
        Ok(std::mem::take(&mut n.counters))
    }

    fn root(&self, mut node: NodeId) -> Result<NodeId, SimError> {
        let mut hops = 0;
        while let Some(p) = self.node(node)?.provider {
            node = p;
            hops += 1;
            if hops > self.nodes.len() {
                return Err(SimError::Internal(format!("flow cycle through {}", node)));
            }
        }
        Ok(node)
    }

    /// Nodes of the tree under `root`, parents before children.
    fn tree(&self, root: NodeId) -> Result<Vec<NodeId>, SimError> {
        let mut order = vec![root];
        let mut i = 0;
        while i < order.len() {
            order.extend_from_slice(&self.node(order[i])?.consumers);
            i += 1;
        }
        Ok(order)
    }

    fn integrate_tree(&mut self, root: NodeId, now_ms: u64) -> Result<(), SimError> {
        for id in self.tree(root)? {
            self.node_mut(id)?.integrate(now_ms);
        }
        Ok(())
    }

    fn recompute(&mut self, root: NodeId) -> Result<(), SimError> {
        let order = self.tree(root)?;
        self.stats.recomputations += 1;
        self.stats.nodes_visited += order.len() as u64;

        // demand, bottom-up
        for &id in order.iter().rev() {
            let n = self.node(id)?;
            if n.kind == NodeKind::Sink {
                continue;
            }
            let total: f64 = n
                .consumers
                .iter()
                .map(|&c| self.node(c).map(|c| c.demand))
                .sum::<Result<f64, SimError>>()?;
            self.node_mut(id)?.demand = total;
        }

        // supply, top-down
        let powered = matches!(self.node(root)?.kind, NodeKind::Source { .. });
        {
            let r = self.node_mut(root)?;
            r.powered = powered;
            r.supply = match r.kind {
                NodeKind::Source { capacity } => r.demand.min(capacity),
                _ => 0.0,
            };
        }
        for &id in &order {
            let n = self.node(id)?;
            if n.consumers.is_empty() {
                continue;
            }
            let available = match n.kind {
                NodeKind::Source { capacity } => capacity,
                _ => n.supply,
            };
            let consumers = n.consumers.clone();
            let demands = consumers
                .iter()
                .map(|&c| self.node(c).map(|c| c.demand))
                .collect::<Result<Vec<f64>, SimError>>()?;
            let grants = max_min_fair(available, &demands);
            let granted: f64 = grants.iter().sum();
            if granted > available + CONSERVATION_EPSILON {
                return Err(SimError::ConservationViolation {
                    node: id,
                    granted,
                    supply: available,
                });
            }
            for (c, g) in consumers.into_iter().zip(grants) {
                let child = self.node_mut(c)?;
                child.supply = g;
                child.powered = powered;
            }
        }
        Ok(())
    }
}

fn check_rate(rate: f64) -> Result<(), SimError> {
    if rate.is_finite() && rate >= 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidRate(rate))
    }
}
