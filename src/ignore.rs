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

//! The fixed, case-sensitive ignore ruleset applied to worktree walks during
//! staging and untracked-file detection. Unlike `.gitignore`, this set is
//! process-wide and never configured per-repo.

const IGNORED_SUFFIXES: &[&str] = &["~", "#", ".tmp", ".TMP"];
const IGNORED_OFFICE_LOCKS: &[&str] = &[
    "~$*.doc", "~$*.docx", "~$*.xls", "~$*.xlsx", "~$*.ppt", "~$*.pptx",
];
const IGNORED_EXACT: &[&str] = &["Thumbs.db", ".DS_Store"];
const WINDOWS_ILLEGAL_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '\x08', '\t'];

/// Returns true iff `filename` (a single path component, not a full path)
/// must be excluded from both staging and untracked-file detection.
pub fn is_ignored_filename(filename: &str) -> bool {
    if IGNORED_EXACT.contains(&filename) {
        return true;
    }
    if IGNORED_SUFFIXES.iter().any(|suffix| filename.ends_with(suffix)) {
        return true;
    }
    if IGNORED_OFFICE_LOCKS
        .iter()
        .any(|pattern| matches_office_lock(filename, pattern))
    {
        return true;
    }
    if filename.chars().any(|c| WINDOWS_ILLEGAL_CHARS.contains(&c) || (c as u32) <= 0x1F) {
        return true;
    }
    if filename.ends_with(' ') {
        return true;
    }
    false
}

/// Matches patterns of the form `~$*.ext` against `filename`.
fn matches_office_lock(filename: &str, pattern: &str) -> bool {
    let (prefix, suffix) = pattern.split_once('*').expect("office lock patterns contain '*'");
    filename.len() >= prefix.len() + suffix.len()
        && filename.starts_with(prefix)
        && filename.ends_with(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_backup_and_temp_suffixes() {
        for name in ["foo~", "foo#", "foo.tmp", "foo.TMP"] {
            assert!(is_ignored_filename(name), "{name} should be ignored");
        }
    }

    #[test]
    fn ignores_office_lock_files() {
        assert!(is_ignored_filename("~$budget.xlsx"));
        assert!(!is_ignored_filename("~$budget.txt"));
    }

    #[test]
    fn ignores_exact_names() {
        assert!(is_ignored_filename("Thumbs.db"));
        assert!(is_ignored_filename(".DS_Store"));
    }

    #[test]
    fn is_case_sensitive() {
        assert!(is_ignored_filename("foo.tmp"));
        assert!(is_ignored_filename("foo.TMP"));
        assert!(!is_ignored_filename("foo.Tmp"));
    }

    #[test]
    fn ignores_windows_illegal_characters_and_control_bytes() {
        assert!(is_ignored_filename("a:b"));
        assert!(is_ignored_filename("a\tb"));
        assert!(is_ignored_filename("a\u{1}b"));
        assert!(!is_ignored_filename("a_b"));
    }

    #[test]
    fn ignores_trailing_space() {
        assert!(is_ignored_filename("foo.txt "));
        assert!(!is_ignored_filename("foo.txt"));
    }
}
