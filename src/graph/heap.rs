use std::{
    fmt,
    fs::File,
    io::{self, Write},
    path::Path,
};

use hashbrown::HashMap;
use log::debug;
use petgraph::{
    dot::Dot,
    stable_graph::{NodeIndex, StableGraph},
    visit::EdgeRef,
    Directed, Direction,
};
use serde::Serialize;

use crate::{
    decode::{ComplexZone, LargeEntry, Magazine, MagazineContext, Region, Zone},
    heap::{free_list, ring},
    inspect::CancelToken,
    layout::{SizeClass, StructLayout},
    serialize::serde_addr,
    source::MemorySource,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum HeapNode {
    Zone {
        #[serde(with = "serde_addr")]
        address: u64,
        name: Option<String>,
    },
    ComplexZone {
        #[serde(with = "serde_addr")]
        address: u64,
    },
    Magazine {
        #[serde(with = "serde_addr")]
        address: u64,
        class: SizeClass,
        index: i32,
    },
    Region {
        #[serde(with = "serde_addr")]
        address: u64,
        class: SizeClass,
    },
    FreeBlock {
        #[serde(with = "serde_addr")]
        address: u64,
        size: u64,
    },
    ReuseCache {
        #[serde(with = "serde_addr")]
        address: u64,
        size: u64,
    },
    LargeEntry {
        #[serde(with = "serde_addr")]
        address: u64,
        size: u64,
        /// On the death-row cache rather than in use.
        cached: bool,
    },
}

impl HeapNode {
    pub fn address(&self) -> u64 {
        match *self {
            HeapNode::Zone { address, .. }
            | HeapNode::ComplexZone { address }
            | HeapNode::Magazine { address, .. }
            | HeapNode::Region { address, .. }
            | HeapNode::FreeBlock { address, .. }
            | HeapNode::ReuseCache { address, .. }
            | HeapNode::LargeEntry { address, .. } => address,
        }
    }
}

impl fmt::Display for HeapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapNode::Zone { address, name } => {
                write!(f, "zone {address:#x}")?;
                if let Some(name) = name {
                    write!(f, " ({name})")?;
                }
                Ok(())
            }
            HeapNode::ComplexZone { address } => write!(f, "szone {address:#x}"),
            HeapNode::Magazine { class, index: -1, .. } => write!(f, "{class} depot"),
            HeapNode::Magazine { class, index, .. } => write!(f, "{class} magazine {index}"),
            HeapNode::Region { address, class } => write!(f, "{class} region {address:#x}"),
            HeapNode::FreeBlock { address, size } => write!(f, "free {address:#x} +{size:#x}"),
            HeapNode::ReuseCache { address, size } => write!(f, "cached {address:#x} +{size:#x}"),
            HeapNode::LargeEntry {
                address,
                size,
                cached,
            } => write!(
                f,
                "large {address:#x} +{size:#x}{}",
                if *cached { " (freed)" } else { "" }
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "edge", rename_all = "snake_case")]
pub enum HeapEdge {
    Owns,
    Helper,
    /// From a magazine to the head of a free-list slot.
    Slot { index: usize },
    NextFree,
    NextRegion,
}

impl fmt::Display for HeapEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapEdge::Owns => Ok(()),
            HeapEdge::Helper => write!(f, "helper"),
            HeapEdge::Slot { index } => write!(f, "slot {index}"),
            HeapEdge::NextFree => write!(f, "next"),
            HeapEdge::NextRegion => write!(f, "next region"),
        }
    }
}

/// The objects reachable from one zone.
///
/// Nodes are unique per address and kind, so a block reached twice (a free
/// list crossing into another slot) is one node with two incoming edges.
pub struct HeapGraph {
    graph: StableGraph<HeapNode, HeapEdge, Directed>,
    nodes: HashMap<(u8, u64), NodeIndex>,
    /// False if building was cancelled.
    pub complete: bool,
}

#[derive(Serialize)]
struct SerializedEdge<'g> {
    from: usize,
    to: usize,
    #[serde(flatten)]
    edge: &'g HeapEdge,
}

#[derive(Serialize)]
struct SerializedGraph<'g> {
    nodes: Vec<&'g HeapNode>,
    edges: Vec<SerializedEdge<'g>>,
    complete: bool,
}

fn kind_tag(node: &HeapNode) -> u8 {
    match node {
        HeapNode::Zone { .. } => 0,
        HeapNode::ComplexZone { .. } => 1,
        HeapNode::Magazine { .. } => 2,
        HeapNode::Region { .. } => 3,
        HeapNode::FreeBlock { .. } => 4,
        HeapNode::ReuseCache { .. } => 5,
        HeapNode::LargeEntry { .. } => 6,
    }
}

impl HeapGraph {
    fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            nodes: HashMap::new(),
            complete: true,
        }
    }

    fn node(&mut self, node: HeapNode) -> NodeIndex {
        let key = (kind_tag(&node), node.address());
        if let Some(&index) = self.nodes.get(&key) {
            return index;
        }
        let index = self.graph.add_node(node);
        self.nodes.insert(key, index);
        index
    }

    fn edge(&mut self, from: NodeIndex, to: NodeIndex, edge: HeapEdge) {
        if !self.graph.edges_connecting(from, to).any(|e| *e.weight() == edge) {
            self.graph.add_edge(from, to, edge);
        }
    }

    /// Walk everything under `zone`, whose complex zones (own first) are
    /// `complex`.
    pub fn build<S>(
        source: &S,
        layout: &StructLayout,
        zone: &Zone,
        complex: &[ComplexZone],
        cancel: &CancelToken,
    ) -> HeapGraph
    where
        S: MemorySource + ?Sized,
    {
        let mut g = HeapGraph::new();
        let root = g.node(HeapNode::Zone {
            address: zone.address,
            name: zone.name.clone(),
        });
        let mut parent = (root, HeapEdge::Owns);
        'zones: for cz in complex {
            let this = g.node(HeapNode::ComplexZone { address: cz.address });
            g.edge(parent.0, this, parent.1);
            parent = (this, HeapEdge::Helper);

            for class in SizeClass::ALL {
                let set = cz.magazine_set(class);
                if set.magazines == 0 {
                    continue;
                }
                for index in set.indices(layout) {
                    if cancel.is_cancelled() {
                        g.complete = false;
                        break 'zones;
                    }
                    let cx = MagazineContext {
                        class,
                        index,
                        slots: cz.free_slots(layout, class),
                    };
                    let address = set.magazine_address(layout, index);
                    match crate::decode::decode_with::<Magazine, _>(source, layout, address, &cx) {
                        Ok(magazine) => {
                            let m = g.node(HeapNode::Magazine { address, class, index });
                            g.edge(this, m, HeapEdge::Owns);
                            if !g.add_magazine(source, layout, cz, &magazine, m, cancel) {
                                g.complete = false;
                                break 'zones;
                            }
                        }
                        Err(e) => debug!("graph: {class} magazine {index} skipped: {e}"),
                    }
                }
            }

            match crate::decode::large_entries(source, layout, &cz.large) {
                Ok(entries) => g.add_large(this, &entries, false),
                Err(e) => debug!("graph: large table of {:#x} skipped: {e}", cz.address),
            }
            let cached: Vec<LargeEntry> = cz.large.cache.iter().filter(|e| !e.is_empty()).copied().collect();
            g.add_large(this, &cached, true);
        }
        debug!(
            "graph of zone {:#x}: {} nodes, {} edges",
            zone.address,
            g.graph.node_count(),
            g.graph.edge_count()
        );
        g
    }

    /// Returns false if cancelled.
    fn add_magazine<S>(
        &mut self,
        source: &S,
        layout: &StructLayout,
        zone: &ComplexZone,
        magazine: &Magazine,
        node: NodeIndex,
        cancel: &CancelToken,
    ) -> bool
    where
        S: MemorySource + ?Sized,
    {
        let ring = ring::walk(source, layout, zone, magazine, cancel);
        let mut previous: Option<NodeIndex> = None;
        for region in &ring.regions {
            let r = self.region(region);
            self.edge(node, r, HeapEdge::Owns);
            if let Some(p) = previous {
                self.edge(p, r, HeapEdge::NextRegion);
            }
            previous = Some(r);
        }
        if !ring.complete {
            return false;
        }

        let quantum = layout.size_class(magazine.class).quantum();
        if let Some(reuse) = magazine.reuse {
            let c = self.node(HeapNode::ReuseCache {
                address: reuse.address,
                size: reuse.msize * quantum,
            });
            self.edge(node, c, HeapEdge::Owns);
        }

        let free = free_list::reconstruct(source, layout, zone, magazine, cancel);
        for slot in &free.slots {
            let mut from = (node, HeapEdge::Slot { index: slot.index });
            for block in &slot.blocks {
                let b = self.node(HeapNode::FreeBlock {
                    address: block.address,
                    size: block.size(quantum),
                });
                self.edge(from.0, b, from.1);
                from = (b, HeapEdge::NextFree);
            }
        }
        free.complete
    }

    fn region(&mut self, region: &Region) -> NodeIndex {
        self.node(HeapNode::Region {
            address: region.address,
            class: region.class,
        })
    }

    fn add_large(&mut self, zone: NodeIndex, entries: &[LargeEntry], cached: bool) {
        for e in entries {
            let n = self.node(HeapNode::LargeEntry {
                address: e.address,
                size: e.size,
                cached,
            });
            self.edge(zone, n, HeapEdge::Owns);
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// In the order they were reached.
    pub fn nodes(&self) -> impl Iterator<Item = &HeapNode> + '_ {
        self.graph.node_indices().map(|i| &self.graph[i])
    }

    /// Nodes nothing points at. This operation is O(N + E)
    pub fn roots(&self) -> Vec<&HeapNode> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph.edges_directed(i, Direction::Incoming).next().is_none())
            .map(|i| &self.graph[i])
            .collect()
    }

    /// Nodes `node` points at, with the edge that leads there.
    pub fn children(&self, node: &HeapNode) -> Vec<(&HeapEdge, &HeapNode)> {
        let Some(&index) = self.nodes.get(&(kind_tag(node), node.address())) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|e| (e.weight(), &self.graph[e.target()]))
            .collect();
        // petgraph lists the newest edge first
        out.reverse();
        out
    }

    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.graph))
    }

    /// Nodes in insertion order and edges between their positions, as JSON.
    pub fn write_to_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        let position: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .enumerate()
            .map(|(i, n)| (n, i))
            .collect();
        let mut edges: Vec<SerializedEdge<'_>> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (from, to) = self.graph.edge_endpoints(e)?;
                Some(SerializedEdge {
                    from: position[&from],
                    to: position[&to],
                    edge: &self.graph[e],
                })
            })
            .collect();
        edges.sort_by_key(|e| (e.from, e.to));
        let out = SerializedGraph {
            nodes: self.nodes().collect(),
            edges,
            complete: self.complete,
        };
        let mut file = File::create(path)?;
        file.write_all(&serde_json::to_vec(&out).map_err(io::Error::from)?)?;
        Ok(())
    }
}
