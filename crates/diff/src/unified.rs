//! Line-based unified diff.

use std::fmt::Write as _;

const CONTEXT_LINES: usize = 3;
/// Above this many DP cells the changed region is emitted as one replace hunk.
const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op<'a> {
    Equal(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Unified diff of `old` against `new` with three lines of context; empty
/// when the inputs are equal.
pub fn unified_diff(old: &str, new: &str) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let ops = line_ops(&a, &b);
    render_hunks(&ops)
}

fn line_ops<'a>(a: &[&'a str], b: &[&'a str]) -> Vec<Op<'a>> {
    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (am, bm) = (&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]);

    let mut ops: Vec<Op<'a>> = a[..prefix].iter().map(|l| Op::Equal(l)).collect();
    if (am.len() + 1) * (bm.len() + 1) > MAX_LCS_CELLS {
        ops.extend(am.iter().map(|l| Op::Delete(l)));
        ops.extend(bm.iter().map(|l| Op::Insert(l)));
    } else {
        ops.extend(lcs_ops(am, bm));
    }
    ops.extend(a[a.len() - suffix..].iter().map(|l| Op::Equal(l)));
    ops
}

fn lcs_ops<'a>(a: &[&'a str], b: &[&'a str]) -> Vec<Op<'a>> {
    let (n, m) = (a.len(), b.len());
    let w = m + 1;
    // dp[i * w + j] = LCS length of a[i..] and b[j..]
    let mut dp = vec![0u32; (n + 1) * w];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i * w + j] = if a[i] == b[j] {
                dp[(i + 1) * w + j + 1] + 1
            } else {
                dp[(i + 1) * w + j].max(dp[i * w + j + 1])
            };
        }
    }
    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            ops.push(Op::Equal(a[i]));
            i += 1;
            j += 1;
        } else if dp[(i + 1) * w + j] >= dp[i * w + j + 1] {
            ops.push(Op::Delete(a[i]));
            i += 1;
        } else {
            ops.push(Op::Insert(b[j]));
            j += 1;
        }
    }
    ops.extend(a[i..].iter().map(|l| Op::Delete(l)));
    ops.extend(b[j..].iter().map(|l| Op::Insert(l)));
    ops
}

fn render_hunks(ops: &[Op<'_>]) -> String {
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(_)))
        .map(|(i, _)| i)
        .collect();
    let mut out = String::new();
    let Some(&first) = changes.first() else { return out };

    // Group changes whose gap fits in the shared context.
    let mut groups: Vec<(usize, usize)> = Vec::new();
    let (mut start, mut end) = (first, first);
    for &c in &changes[1..] {
        if c - end > 2 * CONTEXT_LINES {
            groups.push((start, end));
            start = c;
        }
        end = c;
    }
    groups.push((start, end));

    for (first_change, last_change) in groups {
        let lo = first_change.saturating_sub(CONTEXT_LINES);
        let hi = (last_change + CONTEXT_LINES + 1).min(ops.len());
        let old_before = ops[..lo].iter().filter(|o| !matches!(o, Op::Insert(_))).count();
        let new_before = ops[..lo].iter().filter(|o| !matches!(o, Op::Delete(_))).count();
        let old_len = ops[lo..hi].iter().filter(|o| !matches!(o, Op::Insert(_))).count();
        let new_len = ops[lo..hi].iter().filter(|o| !matches!(o, Op::Delete(_))).count();
        let _ = writeln!(
            out,
            "@@ -{} +{} @@",
            range(old_before, old_len),
            range(new_before, new_len)
        );
        for op in &ops[lo..hi] {
            let _ = match op {
                Op::Equal(l) => writeln!(out, " {}", l),
                Op::Delete(l) => writeln!(out, "-{}", l),
                Op::Insert(l) => writeln!(out, "+{}", l),
            };
        }
    }
    out
}

fn range(before: usize, len: usize) -> String {
    match len {
        0 => format!("{},0", before),
        1 => format!("{}", before + 1),
        _ => format!("{},{}", before + 1, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equal_inputs_give_empty_diff() {
        assert_eq!(unified_diff("a\nb\n", "a\nb\n"), "");
    }

    #[test]
    fn single_line_change_with_context() {
        let old = "a\nb\nc\nd\ne\nf\ng\n";
        let new = "a\nb\nc\nD\ne\nf\ng\n";
        let want = "@@ -1,7 +1,7 @@\n a\n b\n c\n-d\n+D\n e\n f\n g\n";
        assert_eq!(unified_diff(old, new), want);
    }

    #[test]
    fn distant_changes_form_separate_hunks() {
        let old: String = (1..=20).map(|i| format!("{}\n", i)).collect();
        let new: String = (1..=20)
            .map(|i| match i {
                2 => "two\n".to_string(),
                19 => "nineteen\n".to_string(),
                _ => format!("{}\n", i),
            })
            .collect();
        let got = unified_diff(&old, &new);
        assert_eq!(got.matches("@@ -").count(), 2, "got={}", got);
        assert!(got.starts_with("@@ -1,5 +1,5 @@\n 1\n-2\n+two\n"));
    }

    #[test]
    fn pure_insertion() {
        assert_eq!(unified_diff("", "x\n"), "@@ -0,0 +1 @@\n+x\n");
    }
}
