//! Call-stack aggregation: merging raw backtraces into an attributed
//! call tree, plus a flat per-address companion index.

use std::collections::HashMap;

use crate::Energy;

/// A code address captured from a thread's call stack.
pub type BacktraceAddress = u64;

/// A raw captured call stack with the energy attributed to it.
///
/// `addresses` is ordered outermost frame first; the aggregation graph and
/// the flat index both rely on this convention.
#[derive(Debug, Clone, PartialEq)]
pub struct Backtrace {
    pub addresses: Vec<BacktraceAddress>,
    /// Energy (joules) consumed by the thread over the interval in which
    /// this stack was captured. `None` when the capture carried no energy
    /// reading.
    pub energy: Option<Energy>,
}

/// Symbol information for one code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Name of the image (executable or library) containing the address.
    pub image_name: String,
    /// Offset of the address within the image.
    pub address_in_image: u64,
    /// Name of the symbol containing the address.
    pub symbol_name: String,
    /// Offset of the address within the symbol.
    pub address_in_symbol: u64,
}

/// Maps code addresses to symbol information.
///
/// Resolution failures are not errors: an address that cannot be resolved
/// (JIT code, stripped image, stale stack slot) yields `None` and is shown
/// as "Unknown" by consumers.
pub trait SymbolResolver {
    fn resolve(&self, address: BacktraceAddress) -> Option<SymbolInfo>;
}

/// Resolver that knows no symbols. Used when symbolication is disabled.
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _address: BacktraceAddress) -> Option<SymbolInfo> {
        None
    }
}

/// One node of the aggregated call tree.
#[derive(Debug, Clone)]
pub struct BacktraceNode {
    /// The frame address this node stands for, in its call-path position.
    pub address: BacktraceAddress,
    /// Total energy (joules) of every ingested backtrace whose path passes
    /// through this node.
    pub energy: Energy,
    /// Symbol information for `address`, resolved once when the node was
    /// created. `None` if the resolver had nothing.
    pub symbols: Option<SymbolInfo>,
    /// Callees observed below this frame.
    pub children: Vec<BacktraceNode>,
}

impl BacktraceNode {
    fn new(address: BacktraceAddress, resolver: &dyn SymbolResolver) -> BacktraceNode {
        BacktraceNode {
            address,
            energy: 0.0,
            symbols: resolver.resolve(address),
            children: Vec::new(),
        }
    }
}

/// Call tree aggregating every backtrace seen so far.
///
/// This is a trie keyed by address sequence: two stacks sharing a path
/// prefix converge onto the same nodes for that prefix and diverge into
/// sibling children at the first differing frame. The same address can
/// therefore appear in several nodes, one per calling context.
///
/// Nodes are appended and never removed; the tree grows without bound for
/// the lifetime of ingestion. Long-running callers are expected to call
/// [`BacktraceGraph::reset`] when they discard their views.
#[derive(Default)]
pub struct BacktraceGraph {
    roots: Vec<BacktraceNode>,
}

impl BacktraceGraph {
    pub fn new() -> BacktraceGraph {
        BacktraceGraph::default()
    }

    /// Merges a batch of backtraces into the tree.
    ///
    /// Each stack is walked from the outermost frame inward, finding or
    /// creating one node per frame under the current parent and adding the
    /// stack's energy to every node on the path. Empty stacks are skipped.
    /// Stacks without an energy reading still shape the tree, contributing
    /// zero energy.
    pub fn ingest(&mut self, backtraces: &[Backtrace], resolver: &dyn SymbolResolver) {
        for backtrace in backtraces {
            let Some((&outermost, rest)) = backtrace.addresses.split_first() else {
                continue;
            };
            let energy = backtrace.energy.unwrap_or(0.0);

            let mut node = find_or_create(&mut self.roots, outermost, resolver);
            node.energy += energy;
            for &address in rest {
                node = find_or_create(&mut node.children, address, resolver);
                node.energy += energy;
            }
        }
    }

    /// The root nodes (distinct outermost frames), live view.
    pub fn roots(&self) -> &[BacktraceNode] {
        &self.roots
    }

    /// A deep copy of the tree with siblings ordered by descending energy at
    /// every level, safe to hand to a reader while ingestion continues.
    pub fn ranked_snapshot(&self) -> Vec<BacktraceNode> {
        let mut roots = self.roots.clone();
        rank_recursively(&mut roots);
        roots
    }

    /// Drops all accumulated nodes and energies.
    pub fn reset(&mut self) {
        self.roots.clear();
    }
}

fn find_or_create<'a>(
    siblings: &'a mut Vec<BacktraceNode>,
    address: BacktraceAddress,
    resolver: &dyn SymbolResolver,
) -> &'a mut BacktraceNode {
    // Linear scan: fanout at one call site is small in practice.
    match siblings.iter().position(|n| n.address == address) {
        Some(i) => &mut siblings[i],
        None => {
            siblings.push(BacktraceNode::new(address, resolver));
            siblings.last_mut().unwrap()
        }
    }
}

fn rank_recursively(nodes: &mut Vec<BacktraceNode>) {
    nodes.sort_by(|a, b| b.energy.total_cmp(&a.energy));
    for node in nodes {
        rank_recursively(&mut node.children);
    }
}

/// Per-address energy total, ignoring call-path context.
#[derive(Debug, Clone)]
pub struct FlatBacktraceEntry {
    pub address: BacktraceAddress,
    /// Sum of the energies of every backtrace this address appeared in.
    pub energy: Energy,
    pub symbols: Option<SymbolInfo>,
}

/// Flat companion of [`BacktraceGraph`]: one entry per unique address ever
/// observed, regardless of where in a stack it appeared.
#[derive(Default)]
pub struct FlatBacktraceIndex {
    entries: HashMap<BacktraceAddress, FlatBacktraceEntry>,
}

impl FlatBacktraceIndex {
    pub fn new() -> FlatBacktraceIndex {
        FlatBacktraceIndex::default()
    }

    /// Adds each backtrace's energy to the entry of every address it
    /// contains. An address appearing in five stacks of the batch receives
    /// all five energies. Backtraces without an energy reading contribute
    /// nothing here (unlike in the graph, there is no shape to record).
    pub fn ingest(&mut self, backtraces: &[Backtrace], resolver: &dyn SymbolResolver) {
        for backtrace in backtraces {
            let Some(energy) = backtrace.energy else {
                continue;
            };
            for &address in &backtrace.addresses {
                let entry = self
                    .entries
                    .entry(address)
                    .or_insert_with(|| FlatBacktraceEntry {
                        address,
                        energy: 0.0,
                        symbols: resolver.resolve(address),
                    });
                entry.energy += energy;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by descending accumulated energy ("hottest address"
    /// first), as an owned snapshot.
    pub fn ranked_snapshot(&self) -> Vec<FlatBacktraceEntry> {
        let mut entries: Vec<FlatBacktraceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.energy.total_cmp(&a.energy));
        entries
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
