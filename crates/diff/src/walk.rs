//! Simultaneous walk over two JSON trees.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;

use regex::Regex;
use serde_json::{Number, Value as Json};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    MapKey(String),
    SliceIndex(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::MapKey(k) => f.write_str(k),
            PathStep::SliceIndex(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(v: &Json) -> Self {
        match v {
            Json::Null => ValueKind::Null,
            Json::Bool(_) => ValueKind::Bool,
            Json::Number(_) => ValueKind::Number,
            Json::String(_) => ValueKind::String,
            Json::Array(_) => ValueKind::Array,
            Json::Object(_) => ValueKind::Object,
        }
    }
}

/// One difference: the values on each side at `path`. A missing side means
/// the path does not exist there.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub path: Vec<PathStep>,
    pub path_string: String,
    pub value_x: Option<Json>,
    pub value_y: Option<Json>,
}

impl Node {
    pub fn type_x(&self) -> Option<ValueKind> { self.value_x.as_ref().map(ValueKind::of) }
    pub fn type_y(&self) -> Option<ValueKind> { self.value_y.as_ref().map(ValueKind::of) }

    /// Scalar rendering of the "before" value (empty when absent).
    pub fn string_x(&self) -> String { self.value_x.as_ref().map(scalar_string).unwrap_or_default() }
    pub fn string_y(&self) -> String { self.value_y.as_ref().map(scalar_string).unwrap_or_default() }
}

pub(crate) fn scalar_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nodes(Vec<Node>);

impl Nodes {
    pub fn new(nodes: Vec<Node>) -> Self { Self(nodes) }

    pub fn has_diff(&self) -> bool { !self.0.is_empty() }

    /// Nodes whose dotted path matches `re`.
    pub fn find(&self, re: &Regex) -> Vec<&Node> {
        self.0.iter().filter(|n| re.is_match(&n.path_string)).collect()
    }

    pub fn find_by_prefix(&self, prefix: &str) -> Vec<&Node> {
        self.0.iter().filter(|n| n.path_string.starts_with(prefix)).collect()
    }

    pub fn into_inner(self) -> Vec<Node> { self.0 }
}

impl Deref for Nodes {
    type Target = [Node];
    fn deref(&self) -> &[Node] { &self.0 }
}

impl<'a> IntoIterator for &'a Nodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Treat null, "", [] and {} as equal to a missing value.
    pub equate_empty: bool,
    /// Ignore map keys that exist only on the `x` (live) side.
    pub ignore_adding_map_keys: bool,
    /// Compare `3` and `"3"` as equal.
    pub compare_number_and_numeric_string: bool,
}

impl DiffOptions {
    pub fn with_equate_empty(mut self) -> Self { self.equate_empty = true; self }
    pub fn with_ignore_adding_map_keys(mut self) -> Self { self.ignore_adding_map_keys = true; self }
    pub fn with_compare_number_and_numeric_string(mut self) -> Self { self.compare_number_and_numeric_string = true; self }
}

/// Structural diff of two trees.
pub fn diff_values(x: &Json, y: &Json, opts: &DiffOptions) -> Nodes {
    let mut d = Differ { opts, nodes: Vec::new() };
    let mut path = Vec::new();
    d.diff(&mut path, Some(x), Some(y));
    Nodes(d.nodes)
}

struct Differ<'o> {
    opts: &'o DiffOptions,
    nodes: Vec<Node>,
}

impl Differ<'_> {
    fn diff(&mut self, path: &mut Vec<PathStep>, x: Option<&Json>, y: Option<&Json>) {
        match (x, y) {
            (None, None) => {}
            (None, Some(vy)) => {
                if self.opts.equate_empty && is_empty(vy) {
                    return;
                }
                self.add(path, None, Some(vy));
            }
            (Some(vx), None) => {
                if self.opts.ignore_adding_map_keys && matches!(path.last(), Some(PathStep::MapKey(_))) {
                    return;
                }
                if self.opts.equate_empty && is_empty(vx) {
                    return;
                }
                self.add(path, Some(vx), None);
            }
            (Some(vx), Some(vy)) => self.diff_present(path, vx, vy),
        }
    }

    fn diff_present(&mut self, path: &mut Vec<PathStep>, vx: &Json, vy: &Json) {
        match (vx, vy) {
            (Json::Object(mx), Json::Object(my)) => {
                let keys: BTreeSet<&String> = mx.keys().chain(my.keys()).collect();
                for k in keys {
                    path.push(PathStep::MapKey(k.clone()));
                    self.diff(path, mx.get(k), my.get(k));
                    path.pop();
                }
            }
            (Json::Array(ax), Json::Array(ay)) => {
                for i in 0..ax.len().max(ay.len()) {
                    path.push(PathStep::SliceIndex(i));
                    self.diff(path, ax.get(i), ay.get(i));
                    path.pop();
                }
            }
            (Json::Number(a), Json::Number(b)) => {
                if !numbers_equal(a, b) {
                    self.add(path, Some(vx), Some(vy));
                }
            }
            (Json::Number(n), Json::String(s)) | (Json::String(s), Json::Number(n))
                if self.opts.compare_number_and_numeric_string =>
            {
                if s.trim().parse::<f64>().ok() != n.as_f64() {
                    self.add(path, Some(vx), Some(vy));
                }
            }
            _ if vx == vy => {}
            _ => {
                if self.opts.equate_empty && is_empty(vx) && is_empty(vy) {
                    return;
                }
                self.add(path, Some(vx), Some(vy));
            }
        }
    }

    fn add(&mut self, path: &[PathStep], x: Option<&Json>, y: Option<&Json>) {
        self.nodes.push(Node {
            path: path.to_vec(),
            path_string: path_string(path),
            value_x: x.cloned(),
            value_y: y.cloned(),
        });
    }
}

pub(crate) fn path_string(path: &[PathStep]) -> String {
    path.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".")
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    a == b || a.as_f64() == b.as_f64()
}

fn is_empty(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.is_empty(),
        Json::Array(a) => a.is_empty(),
        Json::Object(m) => m.is_empty(),
        _ => false,
    }
}
