//! Host-side implementations of the namespace functions the REPL exposes
//! to executed code: `files_containing`, `files_importing`, `file_exists`,
//! `list_files_matching`, `get_file_slice`.
//!
//! The functions here are called over IPC by the sandboxed child process
//! (see `rlm::repl`); `repo` itself is transferred once at session start.

use glob::Pattern;
use regex::Regex;

use crate::types::RepoContext;

/// Files whose content matches `pattern` (a regex).
pub fn files_containing(repo: &RepoContext, pattern: &str) -> Vec<String> {
    let Ok(re) = Regex::new(pattern) else { return Vec::new() };
    repo.files
        .iter()
        .filter(|(_, content)| re.is_match(content))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Files whose `structure.imports` mentions `module`.
pub fn files_importing(repo: &RepoContext, module: &str) -> Vec<String> {
    repo.structure
        .iter()
        .filter(|(_, info)| info.imports.iter().any(|i| i == module || i.starts_with(module)))
        .map(|(path, _)| path.clone())
        .collect()
}

pub fn file_exists(repo: &RepoContext, path: &str) -> bool {
    repo.files.contains_key(path)
}

/// Files whose path matches a glob pattern.
pub fn list_files_matching(repo: &RepoContext, glob_pattern: &str) -> Vec<String> {
    let Ok(pattern) = Pattern::new(glob_pattern) else { return Vec::new() };
    repo.files
        .keys()
        .filter(|path| pattern.matches(path))
        .cloned()
        .collect()
}

/// 1-based inclusive line range.
pub fn get_file_slice(
    repo: &RepoContext,
    path: &str,
    start_line: usize,
    end_line: usize,
) -> Option<String> {
    let content = repo.files.get(path)?;
    let lines: Vec<&str> = content.lines().collect();
    if start_line == 0 || start_line > lines.len() {
        return Some(String::new());
    }
    let end = end_line.min(lines.len());
    Some(lines[start_line - 1..end].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_repo() -> RepoContext {
        let mut files = BTreeMap::new();
        files.insert("a.py".to_string(), "import os\nimport sys\nprint('hi')\n".to_string());
        files.insert("b.py".to_string(), "x = 1\n".to_string());
        RepoContext { files, ..Default::default() }
    }

    #[test]
    fn files_containing_matches_regex() {
        let repo = sample_repo();
        assert_eq!(files_containing(&repo, "print"), vec!["a.py".to_string()]);
    }

    #[test]
    fn file_exists_checks_map() {
        let repo = sample_repo();
        assert!(file_exists(&repo, "a.py"));
        assert!(!file_exists(&repo, "missing.py"));
    }

    #[test]
    fn get_file_slice_is_one_based_inclusive() {
        let repo = sample_repo();
        let slice = get_file_slice(&repo, "a.py", 1, 2).unwrap();
        assert_eq!(slice, "import os\nimport sys");
    }

    #[test]
    fn list_files_matching_glob() {
        let repo = sample_repo();
        let mut matches = list_files_matching(&repo, "*.py");
        matches.sort();
        assert_eq!(matches, vec!["a.py".to_string(), "b.py".to_string()]);
    }
}
