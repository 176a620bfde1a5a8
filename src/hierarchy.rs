//! Hierarchy builder
//!
//! Builds the OU tree top-down within the configured depth and branching
//! bounds, then splits each per-type object budget across the OUs using a
//! skewed weight so some parts of the org chart are denser than others,
//! the way real directories are. Quota sums always equal the requested
//! totals; the remainder goes to the first OUs in creation order.

use rand::Rng;
use tracing::debug;

use crate::config::{ou_capacity, ForgeConfig};
use crate::errors::{ForgeError, Result};
use crate::model::{derive_dn, ObjectType};
use crate::naming::NameGenerator;

/// Per-OU object quotas
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeQuotas {
    pub groups: u32,
    pub users: u32,
    pub computers: u32,
    pub service_accounts: u32,
    pub gpos: u32,
}

/// One node of the OU tree
#[derive(Debug, Clone)]
pub struct OuNode {
    pub name: String,
    pub dn: String,
    pub depth: u8,
    pub quotas: TypeQuotas,
    pub children: Vec<OuNode>,
}

/// The built OU tree rooted at the domain
#[derive(Debug, Clone)]
pub struct OuTree {
    pub base_dn: String,
    pub roots: Vec<OuNode>,
}

impl OuTree {
    /// All OUs in creation order: depth-first, parents before children
    pub fn flatten(&self) -> Vec<&OuNode> {
        let mut out = Vec::new();
        fn walk<'a>(node: &'a OuNode, out: &mut Vec<&'a OuNode>) {
            out.push(node);
            for child in &node.children {
                walk(child, out);
            }
        }
        for root in &self.roots {
            walk(root, &mut out);
        }
        out
    }

    pub fn total_ous(&self) -> usize {
        self.flatten().len()
    }

    pub fn max_depth(&self) -> u8 {
        self.flatten().iter().map(|n| n.depth).max().unwrap_or(0)
    }
}

// Flat node used while the shape is being decided
struct PendingNode {
    name: String,
    parent: Option<usize>,
    depth: u8,
    child_count: u8,
}

/// Build the OU tree and assign per-type quotas.
///
/// Fails with a configuration error when the requested OU count cannot fit
/// the depth/branching bounds.
pub fn build_tree<R: Rng + ?Sized>(
    config: &ForgeConfig,
    names: &NameGenerator,
    rng: &mut R,
) -> Result<OuTree> {
    let bounds = &config.hierarchy;
    let total_ous = config.counts.ous;

    let capacity = ou_capacity(bounds.max_depth, bounds.max_branching);
    if u64::from(total_ous) > capacity {
        return Err(ForgeError::config(format!(
            "cannot host {} OUs within depth {} and branching {} (capacity {})",
            total_ous, bounds.max_depth, bounds.max_branching, capacity
        )));
    }

    let mut nodes: Vec<PendingNode> = Vec::with_capacity(total_ous as usize);
    let mut root_children: u8 = 0;

    for _ in 0..total_ous {
        // Candidate parents: the domain root plus any OU with spare
        // branching capacity above the depth limit. None encodes the root.
        let mut candidates: Vec<Option<usize>> = Vec::new();
        if root_children < bounds.max_branching {
            candidates.push(None);
        }
        for (idx, node) in nodes.iter().enumerate() {
            if node.depth < bounds.max_depth && node.child_count < bounds.max_branching {
                candidates.push(Some(idx));
            }
        }
        // Unreachable after the capacity check, but keep the error honest
        if candidates.is_empty() {
            return Err(ForgeError::config(
                "OU tree bounds exhausted while placing organizational units".to_string(),
            ));
        }

        let parent = candidates[rng.gen_range(0..candidates.len())];
        let depth = match parent {
            None => 1,
            Some(idx) => nodes[idx].depth + 1,
        };

        let name = unique_sibling_name(&nodes, parent, names, rng);

        match parent {
            None => root_children += 1,
            Some(idx) => nodes[idx].child_count += 1,
        }
        nodes.push(PendingNode {
            name,
            parent,
            depth,
            child_count: 0,
        });
    }

    // Skewed weights decide how dense each OU is; index order keeps the
    // remainder distribution deterministic.
    let weights: Vec<f64> = nodes
        .iter()
        .map(|_| (rng.gen::<f64>() + 0.05).powf(bounds.skew))
        .collect();

    let groups = distribute(config.counts.groups, &weights);
    let users = distribute(config.counts.users, &weights);
    let computers = distribute(config.counts.computers, &weights);
    let service_accounts = distribute(config.counts.service_accounts, &weights);
    let gpos = distribute(config.counts.gpos, &weights);

    let quotas: Vec<TypeQuotas> = (0..nodes.len())
        .map(|i| TypeQuotas {
            groups: groups[i],
            users: users[i],
            computers: computers[i],
            service_accounts: service_accounts[i],
            gpos: gpos[i],
        })
        .collect();

    let tree = assemble(&config.domain.base_dn, &nodes, &quotas);
    debug!(
        ous = tree.total_ous(),
        depth = tree.max_depth(),
        "built OU tree"
    );
    Ok(tree)
}

fn unique_sibling_name<R: Rng + ?Sized>(
    nodes: &[PendingNode],
    parent: Option<usize>,
    names: &NameGenerator,
    rng: &mut R,
) -> String {
    let base = names.org_unit(rng);
    let siblings: Vec<&str> = nodes
        .iter()
        .filter(|n| n.parent == parent)
        .map(|n| n.name.as_str())
        .collect();
    if !siblings.contains(&base.as_str()) {
        return base;
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{} {}", base, suffix);
        if !siblings.contains(&candidate.as_str()) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Split `total` across weighted shares; floors first, then the remainder
/// to the earliest indexes so the sum always equals `total`.
fn distribute(total: u32, weights: &[f64]) -> Vec<u32> {
    if weights.is_empty() {
        return Vec::new();
    }
    let weight_sum: f64 = weights.iter().sum();
    let mut shares: Vec<u32> = weights
        .iter()
        .map(|w| ((f64::from(total) * w / weight_sum).floor()) as u32)
        .collect();
    let assigned: u32 = shares.iter().sum();
    let mut remainder = total - assigned;
    let mut i = 0;
    while remainder > 0 {
        let idx = i % shares.len();
        shares[idx] += 1;
        remainder -= 1;
        i += 1;
    }
    shares
}

fn assemble(base_dn: &str, nodes: &[PendingNode], quotas: &[TypeQuotas]) -> OuTree {
    fn build(
        idx: usize,
        parent_dn: &str,
        nodes: &[PendingNode],
        quotas: &[TypeQuotas],
        children_of: &[Vec<usize>],
    ) -> OuNode {
        let node = &nodes[idx];
        let dn = derive_dn(ObjectType::Ou, &node.name, parent_dn);
        let children = children_of[idx]
            .iter()
            .map(|&c| build(c, &dn, nodes, quotas, children_of))
            .collect();
        OuNode {
            name: node.name.clone(),
            dn,
            depth: node.depth,
            quotas: quotas[idx],
            children,
        }
    }

    let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut roots_idx: Vec<usize> = Vec::new();
    for (idx, node) in nodes.iter().enumerate() {
        match node.parent {
            None => roots_idx.push(idx),
            Some(p) => children_of[p].push(idx),
        }
    }

    let roots = roots_idx
        .into_iter()
        .map(|idx| build(idx, base_dn, nodes, quotas, &children_of))
        .collect();

    OuTree {
        base_dn: base_dn.to_string(),
        roots,
    }
}
