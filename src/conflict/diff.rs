//! Line-level LCS diff and union merge

// Above this many table cells the diff is skipped and treated as a full rewrite
const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp<'a> {
    Equal(&'a str),
    /// Only in the left side
    Left(&'a str),
    /// Only in the right side
    Right(&'a str),
}

/// Length of the longest common subsequence of lines
pub fn lcs_len(a: &str, b: &str) -> usize {
    let a: Vec<&str> = a.lines().collect();
    let b: Vec<&str> = b.lines().collect();
    let prefix = common_prefix(&a, &b);
    let suffix = common_suffix(&a[prefix..], &b[prefix..]);
    let (mid_a, mid_b) = (&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]);
    let middle = match lcs_table(mid_a, mid_b) {
        Some(table) => table[0][0] as usize,
        None => 0,
    };
    prefix + suffix + middle
}

/// Fraction of lines that differ, relative to the longer side
pub fn change_ratio(a: &str, b: &str) -> f64 {
    let max_lines = a.lines().count().max(b.lines().count());
    if max_lines == 0 {
        return 0.0;
    }
    (max_lines - lcs_len(a, b)) as f64 / max_lines as f64
}

/// Line diff between `a` and `b`, or `None` when the inputs are too large
pub fn diff_lines<'a>(a: &'a str, b: &'a str) -> Option<Vec<DiffOp<'a>>> {
    let a: Vec<&str> = a.lines().collect();
    let b: Vec<&str> = b.lines().collect();
    let prefix = common_prefix(&a, &b);
    let suffix = common_suffix(&a[prefix..], &b[prefix..]);
    let (mid_a, mid_b) = (&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]);
    let table = lcs_table(mid_a, mid_b)?;

    let mut ops: Vec<DiffOp<'a>> = a[..prefix].iter().map(|l| DiffOp::Equal(*l)).collect();
    let (mut i, mut j) = (0, 0);
    while i < mid_a.len() && j < mid_b.len() {
        if mid_a[i] == mid_b[j] {
            ops.push(DiffOp::Equal(mid_a[i]));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            ops.push(DiffOp::Left(mid_a[i]));
            i += 1;
        } else {
            ops.push(DiffOp::Right(mid_b[j]));
            j += 1;
        }
    }
    ops.extend(mid_a[i..].iter().map(|l| DiffOp::Left(*l)));
    ops.extend(mid_b[j..].iter().map(|l| DiffOp::Right(*l)));
    ops.extend(a[a.len() - suffix..].iter().map(|l| DiffOp::Equal(*l)));
    Some(ops)
}

/// Union of both sides when every differing hunk is one-sided
///
/// Returns `None` if any hunk has lines from both sides, which would need a
/// human to decide the order or the winner.
pub fn merge_union(a: &str, b: &str) -> Option<String> {
    let ops = diff_lines(a, b)?;
    let mut merged: Vec<&str> = Vec::with_capacity(ops.len());
    let (mut hunk_left, mut hunk_right) = (false, false);

    for op in ops {
        match op {
            DiffOp::Equal(line) => {
                hunk_left = false;
                hunk_right = false;
                merged.push(line);
            }
            DiffOp::Left(line) => {
                hunk_left = true;
                if hunk_right {
                    return None;
                }
                merged.push(line);
            }
            DiffOp::Right(line) => {
                hunk_right = true;
                if hunk_left {
                    return None;
                }
                merged.push(line);
            }
        }
    }

    let mut out = merged.join("\n");
    if a.ends_with('\n') || b.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

fn common_prefix(a: &[&str], b: &[&str]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[&str], b: &[&str]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

// table[i][j] = LCS length of a[i..] and b[j..]
fn lcs_table(a: &[&str], b: &[&str]) -> Option<Vec<Vec<u32>>> {
    if (a.len() + 1).saturating_mul(b.len() + 1) > MAX_LCS_CELLS {
        return None;
    }
    let mut table = vec![vec![0u32; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    Some(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lcs_and_ratio() {
        let a = "a\nb\nc\nd\n";
        let b = "a\nx\nc\nd\n";
        assert_eq!(lcs_len(a, b), 3);
        assert!((change_ratio(a, b) - 0.25).abs() < 1e-9);
        assert_eq!(change_ratio("", ""), 0.0);
        assert_eq!(change_ratio("one\ntwo", "three\nfour"), 1.0);
    }

    #[test]
    fn test_one_sided_hunks_merge() {
        let base_plus_import = "use a;\nuse b;\n\nfn main() {}\n";
        let base_plus_helper = "use a;\n\nfn main() {}\nfn helper() {}\n";
        let merged = merge_union(base_plus_import, base_plus_helper).unwrap();
        assert_eq!(merged, "use a;\nuse b;\n\nfn main() {}\nfn helper() {}\n");
    }

    #[test]
    fn test_two_sided_hunk_is_ambiguous() {
        let a = "{\n  \"port\": 8080\n}\n";
        let b = "{\n  \"port\": 9090\n}\n";
        assert_eq!(merge_union(a, b), None);
    }

    #[test]
    fn test_diff_ops() {
        let ops = diff_lines("a\nb", "a\nc").unwrap();
        assert_eq!(
            ops,
            vec![DiffOp::Equal("a"), DiffOp::Left("b"), DiffOp::Right("c")]
        );
    }
}
