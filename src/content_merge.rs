// Copyright 2024 The Reposync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Word-level three-way content merge, used by the merge engine to decide
//! whether a path that changed on both sides can still be merged
//! automatically or needs inline conflict markers.

use diff::Result as DiffResult;

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_same_word(a: u8, b: u8) -> bool {
    (is_word_byte(a) && is_word_byte(b)) || a & 0x80 != 0
}

/// Splits `data` into maximal runs of word bytes or maximal runs of
/// non-word bytes, so a merge can relocate whole words/whitespace rather
/// than individual bytes.
fn tokenize(data: &[u8]) -> Vec<&[u8]> {
    let mut output = vec![];
    let mut start = 0;
    let mut prev: Option<u8> = None;
    for (i, &b) in data.iter().enumerate() {
        if let Some(p) = prev {
            if !is_same_word(p, b) {
                output.push(&data[start..i]);
                start = i;
            }
        }
        prev = Some(b);
    }
    if start < data.len() {
        output.push(&data[start..]);
    }
    output
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MergeHunk {
    Resolved(Vec<u8>),
    Conflict { left: Vec<u8>, right: Vec<u8> },
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MergeResult {
    Resolved(Vec<u8>),
    Conflict(Vec<MergeHunk>),
}

/// Three-way merges `left` and `right` against `base` at word granularity.
/// A region untouched on one side takes the other side's content; a region
/// both sides edited identically resolves to that content; a region both
/// sides edited differently becomes a [`MergeHunk::Conflict`].
pub fn merge(base: &[u8], left: &[u8], right: &[u8]) -> MergeResult {
    let base_tokens = tokenize(base);
    let left_tokens = tokenize(left);
    let right_tokens = tokenize(right);

    let left_diff = diff::slice(&base_tokens, &left_tokens);
    let right_diff = diff::slice(&base_tokens, &right_tokens);

    let mut hunk: Vec<u8> = vec![];
    let mut hunks: Vec<MergeHunk> = vec![];
    let mut left_it = left_diff.iter();
    let mut right_it = right_diff.iter();
    let mut left_hunk = left_it.next();
    let mut right_hunk = right_it.next();

    loop {
        match (left_hunk, right_hunk) {
            (None, None) => break,
            (Some(DiffResult::Both(before, after)), _) if before == after => match right_hunk.unwrap() {
                DiffResult::Both(_, after) => {
                    hunk.extend_from_slice(after);
                    left_hunk = left_it.next();
                    right_hunk = right_it.next();
                }
                DiffResult::Left(_) => {
                    left_hunk = left_it.next();
                    right_hunk = right_it.next();
                }
                DiffResult::Right(after) => {
                    hunk.extend_from_slice(after);
                    right_hunk = right_it.next();
                }
            },
            (_, Some(DiffResult::Both(before, after))) if before == after => match left_hunk.unwrap() {
                DiffResult::Both(_, after) => {
                    hunk.extend_from_slice(after);
                    left_hunk = left_it.next();
                    right_hunk = right_it.next();
                }
                DiffResult::Left(_) => {
                    left_hunk = left_it.next();
                    right_hunk = right_it.next();
                }
                DiffResult::Right(after) => {
                    hunk.extend_from_slice(after);
                    left_hunk = left_it.next();
                }
            },
            (Some(DiffResult::Left(_)), Some(DiffResult::Left(_))) => {
                left_hunk = left_it.next();
                right_hunk = right_it.next();
            }
            (Some(DiffResult::Right(l)), Some(DiffResult::Right(r))) => {
                if l == r {
                    hunk.extend_from_slice(l);
                } else {
                    if !hunk.is_empty() {
                        hunks.push(MergeHunk::Resolved(std::mem::take(&mut hunk)));
                    }
                    hunks.push(MergeHunk::Conflict { left: l.to_vec(), right: r.to_vec() });
                }
                left_hunk = left_it.next();
                right_hunk = right_it.next();
            }
            (Some(DiffResult::Right(l)), None) => {
                hunk.extend_from_slice(l);
                left_hunk = left_it.next();
            }
            (None, Some(DiffResult::Right(r))) => {
                hunk.extend_from_slice(r);
                right_hunk = right_it.next();
            }
            _ => {
                // Any remaining combination is a structural mismatch between
                // the two diffs against the same base, which tokenize/diff
                // cannot produce; treat the whole file as conflicting rather
                // than panicking on untrusted input.
                return MergeResult::Conflict(vec![MergeHunk::Conflict {
                    left: left.to_vec(),
                    right: right.to_vec(),
                }]);
            }
        }
    }

    if hunks.is_empty() {
        MergeResult::Resolved(hunk)
    } else {
        if !hunk.is_empty() {
            hunks.push(MergeHunk::Resolved(hunk));
        }
        MergeResult::Conflict(hunks)
    }
}

/// Renders a [`MergeResult::Conflict`] as a text file with inline
/// `<<<<<<<`/`=======`/`>>>>>>>` markers around each conflicting hunk.
pub fn render_conflict_markers(hunks: &[MergeHunk], left_label: &str, right_label: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for hunk in hunks {
        match hunk {
            MergeHunk::Resolved(data) => out.extend_from_slice(data),
            MergeHunk::Conflict { left, right } => {
                out.extend_from_slice(format!("<<<<<<< {left_label}\n").as_bytes());
                out.extend_from_slice(left);
                if !left.ends_with(b"\n") {
                    out.push(b'\n');
                }
                out.extend_from_slice(b"=======\n");
                out.extend_from_slice(right);
                if !right.ends_with(b"\n") {
                    out.push(b'\n');
                }
                out.extend_from_slice(format!(">>>>>>> {right_label}\n").as_bytes());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_edit_on_both_sides_resolves() {
        assert_eq!(merge(b"a", b"a b", b"a b"), MergeResult::Resolved(b"a b".to_vec()));
    }

    #[test]
    fn one_sided_edit_resolves_to_the_edit() {
        assert_eq!(merge(b"a", b"a b", b"a"), MergeResult::Resolved(b"a b".to_vec()));
        assert_eq!(merge(b"a", b"a", b"a b"), MergeResult::Resolved(b"a b".to_vec()));
    }

    #[test]
    fn conflicting_edits_produce_a_conflict_hunk() {
        assert_eq!(
            merge(b"a", b"b", b"c"),
            MergeResult::Conflict(vec![MergeHunk::Conflict { left: b"b".to_vec(), right: b"c".to_vec() }])
        );
    }

    #[test]
    fn render_conflict_markers_wraps_conflicting_region() {
        let hunks = vec![
            MergeHunk::Resolved(b"a ".to_vec()),
            MergeHunk::Conflict { left: b"b".to_vec(), right: b"c".to_vec() },
        ];
        let rendered = render_conflict_markers(&hunks, "ours", "theirs");
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.starts_with("a <<<<<<< ours\nb\n=======\nc\n>>>>>>> theirs\n"));
    }
}
