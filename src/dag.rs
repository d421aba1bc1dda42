use fixedbitset::FixedBitSet;
use git2::Oid;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::prelude::*;
use petgraph::unionfind::UnionFind;
use smallvec::SmallVec;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

use crate::commits::CommitMeta;

// -------------------------------------------------------------------------------------------------
// CommitDag
// -------------------------------------------------------------------------------------------------
/// The commit graph of one engine run: a node per commit, an edge from each
/// parent to each child. Parents outside the input set are truncated, turning
/// their children into roots; duplicate parent hashes collapse to one edge.
pub struct CommitDag {
    graph: DiGraph<Oid, ()>,
    index: HashMap<Oid, NodeIndex>,
}

impl CommitDag {
    pub fn build(commits: &[CommitMeta]) -> CommitDag {
        let mut graph = DiGraph::with_capacity(commits.len(), commits.len() * 2);
        let mut index = HashMap::with_capacity(commits.len());
        for meta in commits {
            let idx = graph.add_node(meta.id);
            index.insert(meta.id, idx);
        }
        for meta in commits {
            let child = index[&meta.id];
            for parent in &meta.parents {
                if let Some(&p) = index.get(parent) {
                    // update_edge, not add_edge: duplicate parents collapse
                    graph.update_edge(p, child, ());
                }
            }
        }
        CommitDag { graph, index }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: Oid) -> bool {
        self.index.contains_key(&id)
    }

    /// In-graph parents of a commit, sorted by hash for determinism.
    pub fn parents_of(&self, id: Oid) -> SmallVec<[Oid; 2]> {
        let mut out: SmallVec<[Oid; 2]> = self.graph
            .neighbors_directed(self.index[&id], Incoming)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out
    }

    /// In-graph children of a commit, sorted by hash for determinism.
    pub fn children_of(&self, id: Oid) -> SmallVec<[Oid; 2]> {
        let mut out: SmallVec<[Oid; 2]> = self.graph
            .neighbors_directed(self.index[&id], Outgoing)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out
    }

    pub fn parent_count(&self, id: Oid) -> usize {
        self.graph
            .neighbors_directed(self.index[&id], Incoming)
            .count()
    }

    pub fn child_count(&self, id: Oid) -> usize {
        self.graph
            .neighbors_directed(self.index[&id], Outgoing)
            .count()
    }

    /// Restrict the graph to its largest weakly-connected component.
    ///
    /// Ties on size are broken by the lexicographically smallest member hash.
    pub fn keep_root_component(&self) -> CommitDag {
        if self.graph.node_count() == 0 {
            return CommitDag {
                graph: DiGraph::new(),
                index: HashMap::new(),
            };
        }

        let mut uf = UnionFind::new(self.graph.node_count());
        for edge in self.graph.edge_indices() {
            let (a, b) = self.graph.edge_endpoints(edge).expect("edge should exist");
            uf.union(a.index(), b.index());
        }

        // representative -> (size, smallest member hash)
        let mut components: HashMap<usize, (usize, Oid)> = HashMap::new();
        for idx in self.graph.node_indices() {
            let rep = uf.find(idx.index());
            let oid = self.graph[idx];
            let entry = components.entry(rep).or_insert((0, oid));
            entry.0 += 1;
            if oid < entry.1 {
                entry.1 = oid;
            }
        }
        let (&winner, _) = components
            .iter()
            .max_by(|(_, (na, oa)), (_, (nb, ob))| na.cmp(nb).then(ob.cmp(oa)))
            .expect("at least one component");

        let retained: Vec<CommitMeta> = {
            // Rebuild through CommitMeta-shaped adjacency so edge truncation
            // logic stays in one place.
            let mut metas = Vec::new();
            for idx in self.graph.node_indices() {
                if uf.find(idx.index()) != winner {
                    continue;
                }
                let id = self.graph[idx];
                let parents = self.parents_of(id);
                metas.push(CommitMeta {
                    id,
                    parents,
                    tree: Oid::zero(),
                    author_name: String::new(),
                    author_email: String::new(),
                    when: 0,
                });
            }
            metas
        };
        debug!(
            "kept component of {} commits out of {} ({} components)",
            retained.len(),
            self.graph.node_count(),
            components.len()
        );
        CommitDag::build(&retained)
    }

    /// Contract maximal linear chains into single nodes, preserving commit
    /// order inside each chain. A commit joins its parent's chain when it is
    /// the parent's only child and the parent is its only parent.
    pub fn coalesce(&self) -> ChainGraph {
        let mut chain_of: HashMap<Oid, NodeIndex> = HashMap::new();
        let mut graph: DiGraph<Chain, ()> = DiGraph::new();

        // Chain starts, in deterministic order.
        let mut starts: Vec<Oid> = self
            .graph
            .node_indices()
            .map(|i| self.graph[i])
            .filter(|&id| {
                let parents = self.parents_of(id);
                parents.len() != 1 || self.child_count(parents[0]) != 1
            })
            .collect();
        starts.sort_unstable();

        for start in starts {
            let mut commits = vec![start];
            let mut cur = start;
            loop {
                let children = self.children_of(cur);
                if children.len() != 1 {
                    break;
                }
                let child = children[0];
                if self.parent_count(child) != 1 {
                    break;
                }
                commits.push(child);
                cur = child;
            }
            let head_parents = self.parent_count(start);
            let members = commits.clone();
            let idx = graph.add_node(Chain {
                commits,
                head_parents,
            });
            for c in members {
                chain_of.insert(c, idx);
            }
        }

        // Cross-chain edges, deduplicated.
        for edge in self.graph.edge_indices() {
            let (a, b) = self.graph.edge_endpoints(edge).expect("edge should exist");
            let (ca, cb) = (chain_of[&self.graph[a]], chain_of[&self.graph[b]]);
            if ca != cb {
                graph.update_edge(ca, cb, ());
            }
        }

        ChainGraph { graph, chain_of }
    }
}

// -------------------------------------------------------------------------------------------------
// ChainGraph
// -------------------------------------------------------------------------------------------------
/// One node of the coalesced DAG: a maximal linear run of commits.
#[derive(Clone, Debug)]
pub struct Chain {
    pub commits: Vec<Oid>,
    /// Parent count of the chain's first commit in the full graph; the
    /// topological tie-break key.
    pub head_parents: usize,
}

pub struct ChainGraph {
    graph: DiGraph<Chain, ()>,
    #[allow(dead_code)]
    chain_of: HashMap<Oid, NodeIndex>,
}

impl ChainGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn chain(&self, idx: NodeIndex) -> &Chain {
        &self.graph[idx]
    }

    /// A deterministic topological order of the chains.
    ///
    /// An adaptation of Kahn's algorithm with an ordered frontier: among the
    /// chains ready to be emitted, the one with the fewest head parents wins,
    /// then the smallest head hash.
    pub fn topo_order(&self) -> Vec<NodeIndex> {
        let graph = &self.graph;
        let mut visited_edges = FixedBitSet::with_capacity(graph.edge_count());
        let mut order = Vec::with_capacity(graph.node_count());

        type Key = Reverse<(usize, Oid)>;
        let key = |graph: &DiGraph<Chain, ()>, idx: NodeIndex| -> Key {
            let chain = &graph[idx];
            Reverse((chain.head_parents, chain.commits[0]))
        };

        let mut frontier: BinaryHeap<(Key, NodeIndex)> = graph
            .node_indices()
            .filter(|&idx| graph.neighbors_directed(idx, Incoming).count() == 0)
            .map(|idx| (key(graph, idx), idx))
            .collect();

        while let Some((_, idx)) = frontier.pop() {
            order.push(idx);
            for edge in graph.edges_directed(idx, Outgoing) {
                visited_edges.put(edge.id().index());
                let child = edge.target();
                let ready = !graph
                    .edges_directed(child, Incoming)
                    .any(|e| !visited_edges.contains(e.id().index()));
                if ready {
                    frontier.push((key(graph, child), child));
                }
            }
        }

        debug_assert_eq!(order.len(), graph.node_count(), "commit graph has a cycle");
        order
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    fn oid(n: u8) -> Oid {
        Oid::from_bytes(&[n; 20]).unwrap()
    }

    fn meta(id: u8, parents: &[u8]) -> CommitMeta {
        CommitMeta {
            id: oid(id),
            parents: parents.iter().map(|&p| oid(p)).collect(),
            tree: Oid::zero(),
            author_name: String::new(),
            author_email: String::new(),
            when: 0,
        }
    }

    #[test]
    fn duplicate_parents_collapse() {
        let commits = vec![meta(1, &[]), meta(2, &[1, 1])];
        let dag = CommitDag::build(&commits);
        let expected: SmallVec<[Oid; 2]> = smallvec![oid(1)];
        assert_eq!(dag.parents_of(oid(2)), expected);
    }

    #[test]
    fn out_of_set_parents_truncate() {
        let commits = vec![meta(2, &[9])];
        let dag = CommitDag::build(&commits);
        assert_eq!(dag.parent_count(oid(2)), 0);
    }

    #[test]
    fn largest_component_wins() {
        // 1 -> 2 -> 3 in one component; 4 -> 5 in the other
        let commits = vec![
            meta(1, &[]),
            meta(2, &[1]),
            meta(3, &[2]),
            meta(4, &[]),
            meta(5, &[4]),
        ];
        let kept = CommitDag::build(&commits).keep_root_component();
        assert_eq!(kept.len(), 3);
        assert!(kept.contains(oid(1)));
        assert!(!kept.contains(oid(4)));
    }

    #[test]
    fn component_tie_breaks_by_smallest_hash() {
        let commits = vec![meta(7, &[]), meta(8, &[7]), meta(1, &[]), meta(2, &[1])];
        let kept = CommitDag::build(&commits).keep_root_component();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains(oid(1)));
    }

    #[test]
    fn linear_history_coalesces_to_one_chain() {
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(3, &[2])];
        let chains = CommitDag::build(&commits).coalesce();
        assert_eq!(chains.len(), 1);
        let order = chains.topo_order();
        assert_eq!(
            chains.chain(order[0]).commits,
            vec![oid(1), oid(2), oid(3)]
        );
    }

    #[test]
    fn diamond_coalesces_to_four_chains() {
        // 1 -> 2, 1 -> 3, {2,3} -> 4
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(3, &[1]), meta(4, &[2, 3])];
        let chains = CommitDag::build(&commits).coalesce();
        assert_eq!(chains.len(), 4);
        let order = chains.topo_order();
        assert_eq!(order.len(), 4);
        // Root first, merge last.
        assert_eq!(chains.chain(order[0]).commits, vec![oid(1)]);
        assert_eq!(chains.chain(order[3]).commits, vec![oid(4)]);
        // Ready ties broken by hash: 2 before 3.
        assert_eq!(chains.chain(order[1]).commits, vec![oid(2)]);
        assert_eq!(chains.chain(order[2]).commits, vec![oid(3)]);
    }

    #[test]
    fn chain_does_not_cross_fork() {
        // 1 -> 2 -> 3 and 2 -> 4: 2 has two children, so 3 and 4 start chains
        let commits = vec![meta(1, &[]), meta(2, &[1]), meta(3, &[2]), meta(4, &[2])];
        let chains = CommitDag::build(&commits).coalesce();
        assert_eq!(chains.len(), 3);
    }

    #[test]
    fn empty_input_is_empty() {
        let dag = CommitDag::build(&[]).keep_root_component();
        assert!(dag.is_empty());
        assert_eq!(dag.coalesce().topo_order().len(), 0);
    }
}
