//! Deployment diff state.
//!
//! Remembers the last deployment text acknowledged by the service and
//! turns each subsequent snapshot into a sequence of byte-exact text
//! edits against it. Edits are computed with a line-based Myers diff;
//! both ends of the protocol must agree that applying the edit list to
//! the baseline reproduces the new text byte-for-byte, which the
//! SHA-256 checkpoint hash lets the service verify independently.

use anyhow::{anyhow, bail};
use sha2::{Digest, Sha256};

use groundwork_types::wire::TextEdit;

use crate::errors::{CheckpointError, Result};
use crate::serialize::MarshaledDeployment;

/// Lowercase-hex SHA-256 over the UTF-8 bytes of `text`.
#[must_use]
pub fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// A computed delta: the edit list plus the hash the service must
/// observe after applying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentDelta {
    pub edits: Vec<TextEdit>,
    pub checkpoint_hash: String,
}

/// Tracks the last-saved deployment text and the PATCH sequence number
/// within one update.
///
/// Not synchronized: `Save` callers must be single-writer, which the
/// persister's `&mut self` contract enforces.
#[derive(Debug)]
pub struct DeploymentDiffState {
    last_saved: Option<MarshaledDeployment>,
    sequence_number: u64,
    cutoff_bytes: u64,
}

impl DeploymentDiffState {
    /// A fresh diff state for one update. `cutoff_bytes` is the size at
    /// which snapshots become eligible for delta transport.
    #[must_use]
    pub fn new(cutoff_bytes: u64) -> Self {
        Self {
            last_saved: None,
            sequence_number: 1,
            cutoff_bytes,
        }
    }

    /// Sequence number for the next PATCH request. Advances on every
    /// call: the sequence is monotonic per save attempt within one
    /// update, so a retry after a failed upload ships a byte-identical
    /// body modulo the sequence number.
    pub fn next_sequence_number(&mut self) -> u64 {
        let current = self.sequence_number;
        self.sequence_number += 1;
        current
    }

    /// The baseline the next diff would be computed against.
    #[must_use]
    pub fn last_saved(&self) -> Option<&MarshaledDeployment> {
        self.last_saved.as_ref()
    }

    /// Whether `deployment` should ship as a delta: a baseline must
    /// exist, and the serialized size must be at or above the cutoff.
    /// Below the cutoff a verbatim upload is cheaper than the diff
    /// computation.
    #[must_use]
    pub fn should_diff(&self, deployment: &MarshaledDeployment) -> bool {
        self.last_saved.is_some() && deployment.size() as u64 >= self.cutoff_bytes
    }

    /// Compute the edits taking the baseline to `deployment`, plus the
    /// post-apply hash.
    ///
    /// # Errors
    ///
    /// Fails if no baseline has been saved yet.
    pub fn diff(&self, deployment: &MarshaledDeployment) -> Result<DeploymentDelta> {
        let baseline = self
            .last_saved
            .as_ref()
            .ok_or_else(|| CheckpointError::State(anyhow!("no baseline to diff against")))?;
        Ok(DeploymentDelta {
            edits: compute_edits(&baseline.raw, &deployment.raw),
            checkpoint_hash: sha256_hex(&deployment.raw),
        })
    }

    /// Record a successful save: `deployment` becomes the baseline.
    /// Never called on failure, so a retry of the same snapshot re-diffs
    /// from the previous baseline.
    pub fn saved(&mut self, deployment: MarshaledDeployment) {
        self.last_saved = Some(deployment);
    }
}

/// Compute the text edits taking `before` to `after`.
///
/// The diff is line-based: both texts are split into terminator-keeping
/// lines, a Myers shortest edit script is computed over the lines, and
/// adjacent delete/insert runs are coalesced into byte-offset edits.
#[must_use]
pub fn compute_edits(before: &str, after: &str) -> Vec<TextEdit> {
    let a = split_lines(before);
    let b = split_lines(after);
    let ops = myers_ops(&a, &b);

    let mut edits = Vec::new();
    let mut pending: Option<TextEdit> = None;
    let mut a_idx = 0;
    let mut b_idx = 0;
    let mut a_offset = 0;

    for op in ops {
        match op {
            DiffOp::Equal => {
                if let Some(edit) = pending.take() {
                    edits.push(edit);
                }
                a_offset += a[a_idx].len();
                a_idx += 1;
                b_idx += 1;
            }
            DiffOp::Delete => {
                let len = a[a_idx].len();
                let edit = pending.get_or_insert_with(|| TextEdit {
                    start: a_offset,
                    end: a_offset,
                    text: String::new(),
                });
                edit.end += len;
                a_offset += len;
                a_idx += 1;
            }
            DiffOp::Insert => {
                let edit = pending.get_or_insert_with(|| TextEdit {
                    start: a_offset,
                    end: a_offset,
                    text: String::new(),
                });
                edit.text.push_str(b[b_idx]);
                b_idx += 1;
            }
        }
    }
    if let Some(edit) = pending.take() {
        edits.push(edit);
    }
    edits
}

/// Apply an edit list to `base`, producing the post-apply text. Edits
/// must be sorted, non-overlapping, in-bounds, and aligned to character
/// boundaries; the service applies the same validation independently.
///
/// # Errors
///
/// Fails on a malformed edit list.
pub fn apply_edits(base: &str, edits: &[TextEdit]) -> anyhow::Result<String> {
    let mut result = String::with_capacity(base.len());
    let mut cursor = 0;
    for edit in edits {
        if edit.start < cursor || edit.end < edit.start || edit.end > base.len() {
            bail!(
                "edit [{}, {}) is out of order or out of bounds",
                edit.start,
                edit.end
            );
        }
        if !base.is_char_boundary(edit.start) || !base.is_char_boundary(edit.end) {
            bail!(
                "edit [{}, {}) is not aligned to character boundaries",
                edit.start,
                edit.end
            );
        }
        result.push_str(&base[cursor..edit.start]);
        result.push_str(&edit.text);
        cursor = edit.end;
    }
    result.push_str(&base[cursor..]);
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffOp {
    Equal,
    Delete,
    Insert,
}

/// Split into lines, keeping terminators so that concatenating the
/// lines reproduces the input exactly.
fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            lines.push(&text[start..=i]);
            start = i + 1;
        }
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }
    lines
}

/// Myers O(ND) shortest edit script over line slices.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn myers_ops(a: &[&str], b: &[&str]) -> Vec<DiffOp> {
    let n = a.len();
    let m = b.len();
    if n == 0 && m == 0 {
        return Vec::new();
    }

    let max = (n + m) as isize;
    let offset = max;
    let width = (2 * max + 1) as usize;
    let mut v = vec![0usize; width];
    let mut trace = Vec::new();

    let mut found_d = 0;
    'search: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let ik = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[ik - 1] < v[ik + 1]) {
                v[ik + 1]
            } else {
                v[ik - 1] + 1
            };
            let mut y = (x as isize - k) as usize;
            while x < n && y < m && a[x] == b[y] {
                x += 1;
                y += 1;
            }
            v[ik] = x;
            if x >= n && y >= m {
                found_d = d;
                break 'search;
            }
            k += 2;
        }
    }

    // Backtrack through the trace, emitting ops in reverse.
    let mut ops = Vec::new();
    let mut x = n as isize;
    let mut y = m as isize;
    for d in (1..=found_d).rev() {
        let v = &trace[d as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize] as isize;
        let prev_y = prev_x - prev_k;
        while x > prev_x && y > prev_y {
            ops.push(DiffOp::Equal);
            x -= 1;
            y -= 1;
        }
        if prev_k == k + 1 {
            ops.push(DiffOp::Insert);
        } else {
            ops.push(DiffOp::Delete);
        }
        x = prev_x;
        y = prev_y;
    }
    while x > 0 && y > 0 {
        ops.push(DiffOp::Equal);
        x -= 1;
        y -= 1;
    }
    ops.reverse();
    ops
}
