//! YAML-like rendering of diff nodes.

use std::fmt::Write as _;

use serde_json::Value as Json;

use crate::walk::{scalar_string, Node, Nodes, PathStep};

pub const MASKED_VALUE: &str = "*****";

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Values of nodes whose dotted path starts with this prefix are masked.
    pub mask_path_prefix: Option<String>,
}

/// Renders nodes as indented YAML lines prefixed with `-`, `+` or a space.
///
/// Each line is `<mark><pad><indent>key: value` where the indent is two
/// spaces per depth; consecutive nodes share their common parents.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    opts: RenderOptions,
}

const LEFT_PADDING: &str = " ";

impl Renderer {
    pub fn new(opts: RenderOptions) -> Self { Self { opts } }

    pub fn render(&self, nodes: &Nodes) -> String {
        let mut out = String::new();
        let mut prev: &[PathStep] = &[];
        for node in nodes {
            let Some((last, parents)) = node.path.split_last() else {
                self.print_value(&mut out, '-', node.value_x.as_ref(), None, 0);
                self.print_value(&mut out, '+', node.value_y.as_ref(), None, 0);
                continue;
            };
            let shared = prev.iter().zip(parents.iter()).take_while(|(a, b)| a == b).count();
            for (depth, step) in parents.iter().enumerate().skip(shared) {
                line(&mut out, ' ', depth, &step_label(step, false));
            }
            let depth = parents.len();
            let (x, y) = self.masked(node);
            self.print_value(&mut out, '-', x.as_ref(), Some(last), depth);
            self.print_value(&mut out, '+', y.as_ref(), Some(last), depth);
            prev = &node.path;
        }
        out
    }

    fn masked(&self, node: &Node) -> (Option<Json>, Option<Json>) {
        let hide = self
            .opts
            .mask_path_prefix
            .as_deref()
            .map(|p| node.path_string.starts_with(p))
            .unwrap_or(false);
        let mask = |v: &Option<Json>| v.as_ref().map(|v| if hide { Json::String(MASKED_VALUE.into()) } else { v.clone() });
        (mask(&node.value_x), mask(&node.value_y))
    }

    fn print_value(&self, out: &mut String, mark: char, v: Option<&Json>, step: Option<&PathStep>, depth: usize) {
        let Some(v) = v else { return };
        let label = step.map(|s| step_label(s, true)).unwrap_or_default();
        match v {
            Json::Object(map) if map.is_empty() => line(out, mark, depth, &format!("{}{{}}", label)),
            Json::Array(items) if items.is_empty() => line(out, mark, depth, &format!("{}[]", label)),
            Json::Object(map) => {
                line(out, mark, depth, label.trim_end());
                for (k, child) in map {
                    self.print_value(out, mark, Some(child), Some(&PathStep::MapKey(k.clone())), depth + 1);
                }
            }
            Json::Array(items) => {
                line(out, mark, depth, label.trim_end());
                for (i, child) in items.iter().enumerate() {
                    self.print_value(out, mark, Some(child), Some(&PathStep::SliceIndex(i)), depth + 1);
                }
            }
            Json::String(s) if s.contains('\n') => {
                line(out, mark, depth, &format!("{}|", label));
                for l in s.trim_end_matches('\n').lines() {
                    line(out, mark, depth + 1, l);
                }
            }
            scalar => line(out, mark, depth, &format!("{}{}", label, scalar_string(scalar))),
        }
    }
}

/// `key: ` / `- ` when a value follows, `key:` / `-` for a parent line.
fn step_label(step: &PathStep, with_value: bool) -> String {
    match (step, with_value) {
        (PathStep::MapKey(k), true) => format!("{}: ", k),
        (PathStep::MapKey(k), false) => format!("{}:", k),
        (PathStep::SliceIndex(_), true) => "- ".to_string(),
        (PathStep::SliceIndex(_), false) => "-".to_string(),
    }
}

fn line(out: &mut String, mark: char, depth: usize, text: &str) {
    let _ = writeln!(out, "{}{}{}{}", mark, LEFT_PADDING, "  ".repeat(depth), text);
}
