//! Newick topologies backed by a petgraph arborescence.
//!
//! Labels are kept verbatim: underscores stay underscores, and quoted
//! labels lose only their quotes. Bracketed comments (including rooting
//! tokens such as `[&R]`) are dropped.

use petgraph::{
    stable_graph::{NodeIndex, StableDiGraph},
    visit::EdgeRef,
    Direction,
};
use std::{collections::BTreeSet, fmt::Write};
use thiserror::Error;

/// Characters that end an unquoted label
const DELIMITERS: &[u8] = b"()[]':;,";

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} at byte {position}")]
pub struct NewickError {
    pub message: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clade {
    pub label: Option<String>,
}

/// Edge from parent to child; `rank` keeps sibling order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Branch {
    pub length: Option<f64>,
    rank: usize,
}

#[derive(Debug, Clone)]
pub struct Topology {
    graph: StableDiGraph<Clade, Branch>,
    root: NodeIndex,
    root_length: Option<f64>,
}

impl Topology {
    // --------------------------------------------------
    /// Parse a single tree; the closing `;` may be omitted
    pub fn parse(newick: &str) -> Result<Self, NewickError> {
        let mut reader = NewickReader::new(newick);
        let tree = reader.tree()?;
        reader.skip_filler()?;
        if !reader.at_end() {
            return Err(reader.error("unexpected text after tree"));
        }
        Ok(tree)
    }

    // --------------------------------------------------
    /// Parse every tree in a multi-tree text
    pub fn parse_all(newick: &str) -> Result<Vec<Self>, NewickError> {
        let mut reader = NewickReader::new(newick);
        let mut trees = vec![];
        loop {
            reader.skip_filler()?;
            if reader.at_end() {
                break;
            }
            trees.push(reader.tree()?);
        }
        Ok(trees)
    }

    // --------------------------------------------------
    pub fn label(&self, node: NodeIndex) -> Option<&str> {
        self.graph
            .node_weight(node)
            .and_then(|clade| clade.label.as_deref())
    }

    // --------------------------------------------------
    pub fn children(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .map(|edge| (edge.weight().rank, edge.target()))
            .collect();
        edges.sort_by_key(|(rank, _)| *rank);
        edges.into_iter().map(|(_, child)| child).collect()
    }

    // --------------------------------------------------
    fn parent_edge(&self, node: NodeIndex) -> Option<(NodeIndex, Branch)> {
        self.graph
            .edges_directed(node, Direction::Incoming)
            .next()
            .map(|edge| (edge.source(), *edge.weight()))
    }

    // --------------------------------------------------
    /// Length of the branch above `node`
    pub fn length(&self, node: NodeIndex) -> Option<f64> {
        if node == self.root {
            self.root_length
        } else {
            self.parent_edge(node).and_then(|(_, branch)| branch.length)
        }
    }

    // --------------------------------------------------
    fn is_leaf(&self, node: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .next()
            .is_none()
    }

    // --------------------------------------------------
    pub fn leaves(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&node| self.is_leaf(node))
            .collect()
    }

    // --------------------------------------------------
    pub fn leaf_labels(&self) -> BTreeSet<String> {
        self.leaves()
            .into_iter()
            .flat_map(|leaf| self.label(leaf).map(str::to_string))
            .collect()
    }

    // --------------------------------------------------
    /// Prune to the leaves labelled in `keep`, dropping internal nodes left
    /// without leaves and suppressing nodes left with one child. Returns
    /// the number of leaves kept; when that is zero the tree is unchanged.
    pub fn retain_leaves(&mut self, keep: &BTreeSet<String>) -> usize {
        let original_leaves: BTreeSet<NodeIndex> =
            self.leaves().into_iter().collect();
        let survivors = original_leaves
            .iter()
            .filter(|&&leaf| self.label(leaf).is_some_and(|l| keep.contains(l)))
            .count();
        if survivors == 0 {
            return 0;
        }

        loop {
            let doomed: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|&node| {
                    self.is_leaf(node)
                        && (!original_leaves.contains(&node)
                            || !self
                                .label(node)
                                .is_some_and(|l| keep.contains(l)))
                })
                .collect();
            if doomed.is_empty() {
                break;
            }
            for node in doomed {
                self.graph.remove_node(node);
            }
        }

        self.suppress_unifurcations();
        survivors
    }

    // --------------------------------------------------
    fn suppress_unifurcations(&mut self) {
        loop {
            let single = self.graph.node_indices().find(|&node| {
                self.graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .count()
                    == 1
            });

            let Some(node) = single else { break };
            let child = self.children(node)[0];
            let child_length = self.length(child);

            match self.parent_edge(node) {
                Some((parent, branch)) => {
                    self.graph.remove_node(node);
                    self.graph.add_edge(
                        parent,
                        child,
                        Branch {
                            length: add_lengths(branch.length, child_length),
                            rank: branch.rank,
                        },
                    );
                }
                None => {
                    self.root_length =
                        add_lengths(self.root_length, child_length);
                    self.graph.remove_node(node);
                    self.root = child;
                }
            }
        }
    }

    // --------------------------------------------------
    /// Set every non-zero branch length to 1.0. Missing and zero lengths
    /// are left alone.
    pub fn set_unit_branch_lengths(&mut self) {
        let unit = |length: Option<f64>| match length {
            Some(len) if len != 0. => Some(1.),
            other => other,
        };
        self.root_length = unit(self.root_length);
        for branch in self.graph.edge_weights_mut() {
            branch.length = unit(branch.length);
        }
    }

    // --------------------------------------------------
    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_clade(self.root, &mut out);
        if let Some(len) = self.root_length {
            write!(out, ":{}", format_length(len)).ok();
        }
        out.push(';');
        out
    }

    // --------------------------------------------------
    fn write_clade(&self, node: NodeIndex, out: &mut String) {
        let children = self.children(node);
        if !children.is_empty() {
            out.push('(');
            for (i, &child) in children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_clade(child, out);
                if let Some(len) = self.length(child) {
                    write!(out, ":{}", format_length(len)).ok();
                }
            }
            out.push(')');
        }

        if let Some(label) = self.label(node) {
            out.push_str(&quote_label(label));
        }
    }
}

// --------------------------------------------------
fn add_lengths(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

// --------------------------------------------------
fn format_length(len: f64) -> String {
    if len.is_finite() && len.fract() == 0. {
        format!("{len:.1}")
    } else {
        len.to_string()
    }
}

// --------------------------------------------------
fn quote_label(label: &str) -> String {
    let needs_quotes = label.is_empty()
        || label
            .bytes()
            .any(|b| b.is_ascii_whitespace() || DELIMITERS.contains(&b));
    if needs_quotes {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

// --------------------------------------------------
struct NewickReader<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> NewickReader<'a> {
    fn new(text: &'a str) -> Self {
        NewickReader { text, pos: 0 }
    }

    fn error(&self, message: &str) -> NewickError {
        NewickError {
            message: message.to_string(),
            position: self.pos,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    // --------------------------------------------------
    /// Skip whitespace and bracketed comments
    fn skip_filler(&mut self) -> Result<(), NewickError> {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else if b == b'[' {
                match self.text[self.pos..].find(']') {
                    Some(end) => self.pos += end + 1,
                    None => return Err(self.error("unterminated comment")),
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    // --------------------------------------------------
    fn tree(&mut self) -> Result<Topology, NewickError> {
        let mut graph = StableDiGraph::new();
        let (root, root_length) = self.clade(&mut graph)?;
        self.skip_filler()?;
        match self.peek() {
            Some(b';') => self.pos += 1,
            None => (),
            Some(_) => return Err(self.error("expected ';'")),
        }

        Ok(Topology {
            graph,
            root,
            root_length,
        })
    }

    // --------------------------------------------------
    fn clade(
        &mut self,
        graph: &mut StableDiGraph<Clade, Branch>,
    ) -> Result<(NodeIndex, Option<f64>), NewickError> {
        self.skip_filler()?;
        let node = graph.add_node(Clade { label: None });

        if self.peek() == Some(b'(') {
            self.pos += 1;
            for rank in 0.. {
                let (child, length) = self.clade(graph)?;
                graph.add_edge(node, child, Branch { length, rank });
                self.skip_filler()?;
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }

        self.skip_filler()?;
        let label = self.label()?;
        graph[node].label = label;

        self.skip_filler()?;
        let length = if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_filler()?;
            Some(self.length()?)
        } else {
            None
        };

        Ok((node, length))
    }

    // --------------------------------------------------
    fn label(&mut self) -> Result<Option<String>, NewickError> {
        if self.peek() == Some(b'\'') {
            let mut label = String::new();
            self.pos += 1;
            loop {
                match self.text[self.pos..].find('\'') {
                    Some(end) => {
                        label.push_str(&self.text[self.pos..self.pos + end]);
                        self.pos += end + 1;
                        if self.peek() == Some(b'\'') {
                            label.push('\'');
                            self.pos += 1;
                        } else {
                            return Ok(Some(label));
                        }
                    }
                    None => return Err(self.error("unterminated quoted label")),
                }
            }
        }

        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || DELIMITERS.contains(&b) {
                break;
            }
            self.pos += 1;
        }

        Ok((self.pos > start).then(|| self.text[start..self.pos].to_string()))
    }

    // --------------------------------------------------
    fn length(&mut self) -> Result<f64, NewickError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || DELIMITERS.contains(&b) {
                break;
            }
            self.pos += 1;
        }

        let value = &self.text[start..self.pos];
        value.parse().map_err(|_| NewickError {
            message: format!(r#"bad branch length "{value}""#),
            position: start,
        })
    }
}
