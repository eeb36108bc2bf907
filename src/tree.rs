use std::collections::HashSet;
use std::fs;

use crate::error::{Result, TreebenchError};

/// A node in the arena. Leaves carry a taxon label; internal labels
/// (support values and the like) are parsed but ignored downstream.
#[derive(Debug, Clone)]
pub struct Node {
    pub children: Vec<usize>,
    pub label: Option<String>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// An unrooted-capable phylogenetic tree stored as an index arena.
/// `origin` is the file path (or a caller-supplied tag) used in errors.
#[derive(Debug, Clone)]
pub struct Tree {
    pub nodes: Vec<Node>,
    pub root: usize,
    pub origin: String,
}

fn is_delim(b: u8) -> bool {
    matches!(b, b'(' | b')' | b',' | b':' | b';' | b'[' | b']')
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    idx: usize,
    origin: &'a str,
    fold_underscores: bool,
}

impl<'a> Parser<'a> {
    fn err(&self, message: &str) -> TreebenchError {
        TreebenchError::Newick {
            path: self.origin.to_string(),
            offset: self.idx,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.idx).copied()
    }

    /// Skip whitespace and any number of bracketed comments.
    fn skip_filler(&mut self) -> Result<()> {
        loop {
            while self.idx < self.bytes.len() && self.bytes[self.idx].is_ascii_whitespace() {
                self.idx += 1;
            }
            if self.peek() == Some(b'[') {
                let open = self.idx;
                while self.idx < self.bytes.len() && self.bytes[self.idx] != b']' {
                    self.idx += 1;
                }
                if self.idx >= self.bytes.len() {
                    self.idx = open;
                    return Err(self.err("unterminated comment"));
                }
                self.idx += 1;
            } else {
                return Ok(());
            }
        }
    }

    /// Quoted label: single quotes, doubled quote as escape.
    fn parse_quoted_label(&mut self) -> Result<String> {
        let open = self.idx;
        self.idx += 1;
        let mut label = String::new();
        let mut start = self.idx;
        loop {
            while self.idx < self.bytes.len() && self.bytes[self.idx] != b'\'' {
                self.idx += 1;
            }
            if self.idx >= self.bytes.len() {
                self.idx = open;
                return Err(self.err("unterminated quoted label"));
            }
            label.push_str(&self.text[start..self.idx]);
            if self.bytes.get(self.idx + 1) == Some(&b'\'') {
                label.push('\'');
                self.idx += 2;
                start = self.idx;
            } else {
                self.idx += 1;
                return Ok(label);
            }
        }
    }

    fn parse_label(&mut self) -> Result<Option<String>> {
        self.skip_filler()?;
        match self.peek() {
            Some(b'\'') => Ok(Some(self.parse_quoted_label()?)),
            Some(b) if !is_delim(b) && !b.is_ascii_whitespace() => {
                let start = self.idx;
                while let Some(b) = self.peek() {
                    if is_delim(b) || b.is_ascii_whitespace() {
                        break;
                    }
                    self.idx += 1;
                }
                let raw = &self.text[start..self.idx];
                let label = if self.fold_underscores {
                    raw.replace('_', " ")
                } else {
                    raw.to_string()
                };
                Ok(Some(label))
            }
            _ => Ok(None),
        }
    }

    /// Consume an optional `:length` suffix. The value itself is discarded;
    /// topology is all the downstream metrics use.
    fn skip_branch_length(&mut self) -> Result<()> {
        self.skip_filler()?;
        if self.peek() != Some(b':') {
            return Ok(());
        }
        self.idx += 1;
        self.skip_filler()?;
        let start = self.idx;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E') {
                self.idx += 1;
            } else {
                break;
            }
        }
        if self.idx == start {
            return Err(self.err("expected branch length after ':'"));
        }
        Ok(())
    }

    fn parse_subtree(&mut self, nodes: &mut Vec<Node>) -> Result<usize> {
        self.skip_filler()?;
        if self.peek() == Some(b'(') {
            self.idx += 1;
            let mut children = Vec::new();
            loop {
                children.push(self.parse_subtree(nodes)?);
                self.skip_filler()?;
                match self.peek() {
                    Some(b',') => {
                        self.idx += 1;
                    }
                    Some(b')') => {
                        self.idx += 1;
                        break;
                    }
                    _ => return Err(self.err("expected ',' or ')'")),
                }
            }
            let label = self.parse_label()?;
            self.skip_branch_length()?;
            nodes.push(Node { children, label });
            Ok(nodes.len() - 1)
        } else {
            let label = self.parse_label()?;
            if label.is_none() {
                return Err(self.err("expected leaf label or '('"));
            }
            self.skip_branch_length()?;
            nodes.push(Node {
                children: Vec::new(),
                label,
            });
            Ok(nodes.len() - 1)
        }
    }

    fn parse_tree(&mut self) -> Result<Tree> {
        let mut nodes = Vec::new();
        let root = self.parse_subtree(&mut nodes)?;
        self.skip_filler()?;
        if self.peek() != Some(b';') {
            return Err(self.err("expected ';'"));
        }
        self.idx += 1;
        self.skip_filler()?;
        if self.idx != self.bytes.len() {
            return Err(self.err("trailing content after ';'"));
        }
        Ok(Tree {
            nodes,
            root,
            origin: self.origin.to_string(),
        })
    }
}

impl Tree {
    /// Parse a single Newick tree. `origin` names the source in errors.
    /// When `fold_underscores` is set, underscores in unquoted labels are
    /// read as spaces; quoted labels are always taken verbatim.
    pub fn parse(text: &str, origin: &str, fold_underscores: bool) -> Result<Tree> {
        let mut parser = Parser {
            text,
            bytes: text.as_bytes(),
            idx: 0,
            origin,
            fold_underscores,
        };
        parser.parse_tree()
    }

    /// Read and parse a Newick file holding one tree.
    pub fn load(path: &str, fold_underscores: bool) -> Result<Tree> {
        let text = fs::read_to_string(path).map_err(|source| TreebenchError::Read {
            path: path.to_string(),
            source,
        })?;
        Tree::parse(&text, path, fold_underscores)
    }

    /// Leaf labels in parse order. Unlabeled leaves are skipped.
    pub fn leaf_labels(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .filter_map(|n| n.label.as_deref())
            .collect()
    }

    /// Copy of this tree restricted to the leaves in `keep`. Unifurcations
    /// introduced by the pruning are spliced out, so every internal node of
    /// the result has at least two children.
    pub fn restrict(&self, keep: &HashSet<&str>) -> Tree {
        fn build(tree: &Tree, node: usize, keep: &HashSet<&str>, out: &mut Vec<Node>) -> Option<usize> {
            let n = &tree.nodes[node];
            if n.is_leaf() {
                let label = n.label.as_deref()?;
                if !keep.contains(label) {
                    return None;
                }
                out.push(Node {
                    children: Vec::new(),
                    label: n.label.clone(),
                });
                return Some(out.len() - 1);
            }
            let children: Vec<usize> = n
                .children
                .iter()
                .filter_map(|&c| build(tree, c, keep, out))
                .collect();
            match children.len() {
                0 => None,
                1 => Some(children[0]),
                _ => {
                    out.push(Node {
                        children,
                        label: None,
                    });
                    Some(out.len() - 1)
                }
            }
        }

        let mut nodes = Vec::new();
        let root = build(self, self.root, keep, &mut nodes).unwrap_or_else(|| {
            // Nothing kept; represent the empty tree as a bare unlabeled node.
            nodes.push(Node {
                children: Vec::new(),
                label: None,
            });
            nodes.len() - 1
        });
        Tree {
            nodes,
            root,
            origin: self.origin.clone(),
        }
    }

    /// Force the unrooted interpretation: while the root is a bifurcation
    /// with an internal child, absorb that child so the root has three or
    /// more children. A two-leaf cherry is left alone.
    pub fn collapse_basal_bifurcation(&mut self) {
        loop {
            if self.nodes[self.root].children.len() != 2 {
                return;
            }
            let internal_child = self.nodes[self.root]
                .children
                .iter()
                .copied()
                .find(|&c| !self.nodes[c].is_leaf());
            let Some(child) = internal_child else {
                return;
            };
            let grandchildren = std::mem::take(&mut self.nodes[child].children);
            // The absorbed node must not read as a labeled leaf afterwards.
            self.nodes[child].label = None;
            let root_children = &mut self.nodes[self.root].children;
            root_children.retain(|&c| c != child);
            root_children.extend(grandchildren);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(tree: &Tree) -> Vec<String> {
        let mut v: Vec<String> = tree.leaf_labels().iter().map(|s| s.to_string()).collect();
        v.sort();
        v
    }

    #[test]
    fn parses_binary_tree_with_branch_lengths() {
        let t = Tree::parse("((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.06);", "t", false).unwrap();
        assert_eq!(labels(&t), vec!["A", "B", "C", "D"]);
        assert_eq!(t.nodes[t.root].children.len(), 2);
    }

    #[test]
    fn parses_multifurcation_and_internal_labels() {
        let t = Tree::parse("(A,B,(C,D,E)clade1:1.5);", "t", false).unwrap();
        assert_eq!(labels(&t), vec!["A", "B", "C", "D", "E"]);
        assert_eq!(t.nodes[t.root].children.len(), 3);
    }

    #[test]
    fn parses_quoted_labels() {
        let t = Tree::parse("('Homo sapiens','it''s',C,D);", "t", false).unwrap();
        assert_eq!(labels(&t), vec!["C", "D", "Homo sapiens", "it's"]);
    }

    #[test]
    fn quoted_labels_keep_underscores_when_folding() {
        let t = Tree::parse("(taxon_one,'taxon_two',C,D);", "t", true).unwrap();
        assert_eq!(labels(&t), vec!["C", "D", "taxon one", "taxon_two"]);
    }

    #[test]
    fn skips_comments_and_whitespace() {
        let t = Tree::parse("[&R] ( A , B , [note] (C, D) ) ;", "t", false).unwrap();
        assert_eq!(labels(&t), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn rejects_unbalanced_parentheses() {
        let err = Tree::parse("((A,B),(C,D);", "t", false).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("malformed Newick"), "{msg}");
    }

    #[test]
    fn rejects_missing_semicolon() {
        assert!(Tree::parse("(A,B,(C,D))", "t", false).is_err());
    }

    #[test]
    fn rejects_trailing_content() {
        assert!(Tree::parse("(A,B,(C,D)); junk", "t", false).is_err());
    }

    #[test]
    fn reports_byte_offset() {
        let err = Tree::parse("(A,B,(C,;D));", "t", false).unwrap_err();
        match err {
            TreebenchError::Newick { offset, .. } => assert_eq!(offset, 8),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn restrict_splices_unifurcations() {
        let t = Tree::parse("((A,B),(C,(D,E)));", "t", false).unwrap();
        let keep: HashSet<&str> = ["A", "C", "D"].into_iter().collect();
        let r = t.restrict(&keep);
        assert_eq!(labels(&r), vec!["A", "C", "D"]);
        for node in &r.nodes {
            assert_ne!(node.children.len(), 1);
        }
    }

    #[test]
    fn collapse_gives_root_at_least_three_children() {
        let mut t = Tree::parse("((A,B),(C,D));", "t", false).unwrap();
        t.collapse_basal_bifurcation();
        assert_eq!(t.nodes[t.root].children.len(), 3);
    }

    #[test]
    fn collapse_leaves_cherry_alone() {
        let mut t = Tree::parse("(A,B);", "t", false).unwrap();
        t.collapse_basal_bifurcation();
        assert_eq!(t.nodes[t.root].children.len(), 2);
    }
}
