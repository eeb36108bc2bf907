use std::collections::{HashMap, HashSet};

use rand::seq::index::sample;
use rand::thread_rng;

use crate::error::{Result, TreebenchError};
use crate::tree::Tree;

/// Topology metrics for one reference/estimate pair, computed on the
/// shared-taxon restriction of both trees.
#[derive(Debug, Clone)]
pub struct TreeComparison {
    pub ntaxa: usize,
    pub ref_edges: usize,
    pub est_edges: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub symmetric_difference: f64,
    pub robinson_foulds: f64,
    /// Fraction of sampled quartets on which both trees agree.
    /// NaN when no quartet is resolved by both trees.
    pub quartet_score: f64,
}

/// Leaf set of a clade, one bit per shared taxon.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Bitset(Vec<u64>);

impl Bitset {
    fn zero(nwords: usize) -> Self {
        Bitset(vec![0; nwords])
    }

    fn set(&mut self, i: usize) {
        self.0[i / 64] |= 1 << (i % 64);
    }

    fn test(&self, i: usize) -> bool {
        self.0[i / 64] >> (i % 64) & 1 == 1
    }

    fn or_with(&mut self, other: &Bitset) {
        for (w, o) in self.0.iter_mut().zip(&other.0) {
            *w |= o;
        }
    }

    fn complement(&mut self, ntaxa: usize) {
        for w in &mut self.0 {
            *w = !*w;
        }
        let extra = self.0.len() * 64 - ntaxa;
        if extra > 0 {
            let last = self.0.len() - 1;
            self.0[last] &= u64::MAX >> extra;
        }
    }
}

fn duplicate_leaf_check(tree: &Tree) -> Result<()> {
    let mut seen = HashSet::new();
    for label in tree.leaf_labels() {
        if !seen.insert(label) {
            return Err(TreebenchError::DuplicateLeaf {
                path: tree.origin.clone(),
                label: label.to_string(),
            });
        }
    }
    Ok(())
}

/// Canonical non-trivial splits of an unrooted tree, sorted. Each split is
/// stored as the side not containing taxon 0, so equal splits compare equal
/// regardless of which side a clade happened to sit on.
fn split_set(tree: &Tree, index: &HashMap<&str, usize>, ntaxa: usize) -> Vec<Bitset> {
    fn collect(
        tree: &Tree,
        node: usize,
        index: &HashMap<&str, usize>,
        ntaxa: usize,
        nwords: usize,
        out: &mut Vec<Bitset>,
    ) -> Bitset {
        let n = &tree.nodes[node];
        if n.is_leaf() {
            let mut bits = Bitset::zero(nwords);
            if let Some(label) = n.label.as_deref() {
                if let Some(&i) = index.get(label) {
                    bits.set(i);
                }
            }
            return bits;
        }
        let mut bits = Bitset::zero(nwords);
        for &child in &n.children {
            let sub = collect(tree, child, index, ntaxa, nwords, out);
            bits.or_with(&sub);
        }
        if node != tree.root {
            let mut split = bits.clone();
            if split.test(0) {
                split.complement(ntaxa);
            }
            out.push(split);
        }
        bits
    }

    let nwords = (ntaxa + 63) / 64;
    let mut out = Vec::new();
    collect(tree, tree.root, index, ntaxa, nwords, &mut out);
    out.sort();
    out
}

fn intersection_size(a: &[Bitset], b: &[Bitset]) -> usize {
    let mut i = 0;
    let mut j = 0;
    let mut common = 0;
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                common += 1;
                i += 1;
                j += 1;
            }
        }
    }
    common
}

/// Quartet topology induced by a split set: 0 when the lowest-index taxon
/// pairs with the second, 1 with the third, 2 with the fourth. None when no
/// split separates the quartet two against two.
fn quartet_topology(splits: &[Bitset], q: &[usize; 4]) -> Option<u8> {
    for split in splits {
        let m = [
            split.test(q[0]),
            split.test(q[1]),
            split.test(q[2]),
            split.test(q[3]),
        ];
        if m.iter().filter(|&&x| x).count() == 2 {
            let code = if m[1] == m[0] {
                0
            } else if m[2] == m[0] {
                1
            } else {
                2
            };
            return Some(code);
        }
    }
    None
}

fn quartet_count(ntaxa: usize) -> u128 {
    let n = ntaxa as u128;
    n * (n - 1) * (n - 2) * (n - 3) / 24
}

/// Agreement fraction over quartets resolved by both trees. Exhaustive when
/// the quartet count fits the budget, otherwise a uniform sample of taxon
/// quadruples. A budget of zero skips the computation entirely.
fn quartet_score(ref_splits: &[Bitset], est_splits: &[Bitset], ntaxa: usize, budget: usize) -> f64 {
    if budget == 0 {
        return f64::NAN;
    }
    let mut resolved_both = 0usize;
    let mut agree = 0usize;
    let mut tally = |q: &[usize; 4]| {
        if let (Some(r), Some(e)) = (quartet_topology(ref_splits, q), quartet_topology(est_splits, q)) {
            resolved_both += 1;
            if r == e {
                agree += 1;
            }
        }
    };
    if quartet_count(ntaxa) <= budget as u128 {
        for a in 0..ntaxa {
            for b in a + 1..ntaxa {
                for c in b + 1..ntaxa {
                    for d in c + 1..ntaxa {
                        tally(&[a, b, c, d]);
                    }
                }
            }
        }
    } else {
        let mut rng = thread_rng();
        for _ in 0..budget {
            let mut q = [0usize; 4];
            for (slot, i) in q.iter_mut().zip(sample(&mut rng, ntaxa, 4).into_iter()) {
                *slot = i;
            }
            q.sort_unstable();
            tally(&q);
        }
    }
    if resolved_both == 0 {
        f64::NAN
    } else {
        agree as f64 / resolved_both as f64
    }
}

/// Compare an estimated tree against its reference. Both trees are pruned
/// to their shared taxa and forced unrooted before splits are extracted.
pub fn compare_trees(reference: &Tree, estimate: &Tree, quartet_budget: usize) -> Result<TreeComparison> {
    duplicate_leaf_check(reference)?;
    duplicate_leaf_check(estimate)?;

    let ref_leaves: HashSet<&str> = reference.leaf_labels().into_iter().collect();
    let est_leaves: HashSet<&str> = estimate.leaf_labels().into_iter().collect();
    let shared: HashSet<&str> = ref_leaves.intersection(&est_leaves).copied().collect();
    if shared.len() < 4 {
        return Err(TreebenchError::TooFewSharedTaxa {
            reference: reference.origin.clone(),
            estimate: estimate.origin.clone(),
            shared: shared.len(),
        });
    }

    let mut taxa: Vec<&str> = shared.iter().copied().collect();
    taxa.sort_unstable();
    let index: HashMap<&str, usize> = taxa.iter().enumerate().map(|(i, &t)| (t, i)).collect();
    let ntaxa = taxa.len();

    let mut ref_restricted = reference.restrict(&shared);
    ref_restricted.collapse_basal_bifurcation();
    let mut est_restricted = estimate.restrict(&shared);
    est_restricted.collapse_basal_bifurcation();

    let ref_splits = split_set(&ref_restricted, &index, ntaxa);
    let est_splits = split_set(&est_restricted, &index, ntaxa);

    let ref_edges = ref_splits.len();
    let est_edges = est_splits.len();
    let common = intersection_size(&ref_splits, &est_splits);
    let false_positives = est_edges - common;
    let false_negatives = ref_edges - common;

    let disagreement = (false_positives + false_negatives) as f64;
    let internal_total = ref_edges + est_edges;
    let symmetric_difference = if internal_total == 0 {
        0.0
    } else {
        disagreement / internal_total as f64
    };
    let robinson_foulds = disagreement / (2 * ntaxa - 6) as f64;

    let quartet = quartet_score(&ref_splits, &est_splits, ntaxa, quartet_budget);

    Ok(TreeComparison {
        ntaxa,
        ref_edges,
        est_edges,
        false_positives,
        false_negatives,
        symmetric_difference,
        robinson_foulds,
        quartet_score: quartet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(newick: &str) -> Tree {
        Tree::parse(newick, "test", false).unwrap()
    }

    #[test]
    fn identical_trees_have_zero_distance() {
        let reference = tree("((A,B),(C,D));");
        let estimate = tree("((A,B),(C,D));");
        let cmp = compare_trees(&reference, &estimate, 10_000).unwrap();
        assert_eq!(cmp.ntaxa, 4);
        assert_eq!(cmp.ref_edges, 1);
        assert_eq!(cmp.est_edges, 1);
        assert_eq!(cmp.false_positives, 0);
        assert_eq!(cmp.false_negatives, 0);
        assert_eq!(cmp.symmetric_difference, 0.0);
        assert_eq!(cmp.robinson_foulds, 0.0);
        assert_eq!(cmp.quartet_score, 1.0);
    }

    #[test]
    fn conflicting_quartets_have_maximal_distance() {
        let reference = tree("((A,B),(C,D));");
        let estimate = tree("((A,C),(B,D));");
        let cmp = compare_trees(&reference, &estimate, 10_000).unwrap();
        assert_eq!(cmp.false_positives, 1);
        assert_eq!(cmp.false_negatives, 1);
        assert_eq!(cmp.symmetric_difference, 1.0);
        assert_eq!(cmp.robinson_foulds, 1.0);
        assert_eq!(cmp.quartet_score, 0.0);
    }

    #[test]
    fn rooted_and_unrooted_forms_agree() {
        let rooted = tree("((A,B),((C,D),E));");
        let unrooted = tree("(A,B,((C,D),E));");
        let cmp = compare_trees(&rooted, &unrooted, 10_000).unwrap();
        assert_eq!(cmp.ref_edges, 2);
        assert_eq!(cmp.est_edges, 2);
        assert_eq!(cmp.false_positives, 0);
        assert_eq!(cmp.false_negatives, 0);
        assert_eq!(cmp.robinson_foulds, 0.0);
        assert_eq!(cmp.quartet_score, 1.0);
    }

    #[test]
    fn five_taxon_partial_disagreement() {
        let reference = tree("((A,B),(C,(D,E)));");
        let estimate = tree("((A,B),(D,(C,E)));");
        let cmp = compare_trees(&reference, &estimate, 10_000).unwrap();
        assert_eq!(cmp.ntaxa, 5);
        assert_eq!(cmp.ref_edges, 2);
        assert_eq!(cmp.est_edges, 2);
        assert_eq!(cmp.false_positives, 1);
        assert_eq!(cmp.false_negatives, 1);
        assert_eq!(cmp.symmetric_difference, 0.5);
        assert_eq!(cmp.robinson_foulds, 0.5);
        assert!((cmp.quartet_score - 0.6).abs() < 1e-12);
    }

    #[test]
    fn extra_taxa_are_pruned_before_comparison() {
        let reference = tree("((A,B),((C,D),(X,Y)));");
        let estimate = tree("((A,C),(B,D));");
        let cmp = compare_trees(&reference, &estimate, 10_000).unwrap();
        assert_eq!(cmp.ntaxa, 4);
        assert_eq!(cmp.false_positives, 1);
        assert_eq!(cmp.false_negatives, 1);
        assert_eq!(cmp.robinson_foulds, 1.0);
    }

    #[test]
    fn star_trees_have_no_internal_edges() {
        let reference = tree("(A,B,C,D);");
        let estimate = tree("(A,B,C,D);");
        let cmp = compare_trees(&reference, &estimate, 10_000).unwrap();
        assert_eq!(cmp.ref_edges, 0);
        assert_eq!(cmp.est_edges, 0);
        assert_eq!(cmp.symmetric_difference, 0.0);
        assert_eq!(cmp.robinson_foulds, 0.0);
        assert!(cmp.quartet_score.is_nan());
    }

    #[test]
    fn zero_budget_skips_quartets() {
        let reference = tree("((A,B),(C,D));");
        let estimate = tree("((A,B),(C,D));");
        let cmp = compare_trees(&reference, &estimate, 0).unwrap();
        assert!(cmp.quartet_score.is_nan());
        assert_eq!(cmp.robinson_foulds, 0.0);
    }

    #[test]
    fn sampled_quartets_agree_on_identical_trees() {
        let newick = "(((((((((A,B),C),D),E),F),G),H),I),J);";
        let reference = tree(newick);
        let estimate = tree(newick);
        // C(10,4) = 210 > 50 forces the sampling path.
        let cmp = compare_trees(&reference, &estimate, 50).unwrap();
        assert_eq!(cmp.quartet_score, 1.0);
    }

    #[test]
    fn too_few_shared_taxa_is_an_error() {
        let reference = tree("(A,B,(C,D));");
        let estimate = tree("(A,B,(E,F));");
        let err = compare_trees(&reference, &estimate, 0).unwrap_err();
        match err {
            TreebenchError::TooFewSharedTaxa { shared, .. } => assert_eq!(shared, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_leaves_are_rejected() {
        let reference = tree("(A,B,(A,C));");
        let estimate = tree("(A,B,(C,D));");
        assert!(matches!(
            compare_trees(&reference, &estimate, 0),
            Err(TreebenchError::DuplicateLeaf { .. })
        ));
    }
}
