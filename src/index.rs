//! In-memory hierarchical namespace for the archive: a case-insensitive,
//! case-preserving tree of directories and file records addressed by
//! slash-delimited paths.
//!
//! Directories live in an arena; a child refers to its parent by index, never
//! by an owning pointer. File records are referenced by their full path; the
//! record descriptors themselves are owned by the archive's record sets.

use std::collections::HashSet;

use regex::RegexBuilder;

use crate::error::SafeError;

pub const DELIMITER: char = '/';

/// Characters never allowed inside a path segment. The delimiter itself is
/// handled by splitting and is not part of this set.
pub const FORBIDDEN_CHARS: &[char] =
    &['\\', ':', '*', '?', '"', '<', '>', '|', '\0', '\n', '\t'];

/// Replacement used for forbidden characters unless the caller configures
/// another one (or none, which deletes them).
pub const DEFAULT_SUBSTITUTE: char = '_';

/// Replace every forbidden character in a single path segment with
/// `substitute`, or delete it when no substitute is given.
pub fn sanitize_name(name: &str, substitute: Option<char>) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if FORBIDDEN_CHARS.contains(&ch) {
            if let Some(sub) = substitute {
                out.push(sub);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Sanitize every segment of a path, preserving the leading delimiter.
pub fn sanitize_path(path: &str, substitute: Option<char>) -> String {
    let absolute = path.starts_with(DELIMITER);
    let joined = path
        .split(DELIMITER)
        .filter(|s| !s.is_empty())
        .map(|seg| sanitize_name(seg, substitute))
        .collect::<Vec<_>>()
        .join(&DELIMITER.to_string());
    if absolute {
        format!("{}{}", DELIMITER, joined)
    } else {
        joined
    }
}

/// Case folding rule for the whole crate: plain Unicode lowercasing,
/// independent of any locale.
pub fn comparable(s: &str) -> String {
    s.to_lowercase()
}

/// Final segment of a path ("" for the root).
pub fn leaf_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(DELIMITER);
    match trimmed.rfind(DELIMITER) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Everything up to (but excluding) the final segment; "/" for top-level paths.
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches(DELIMITER);
    match trimmed.rfind(DELIMITER) {
        Some(0) | None => "/",
        Some(pos) => &trimmed[..pos],
    }
}

pub type FolderId = usize;
pub const ROOT: FolderId = 0;

/// A resolved tree entry: a directory or the full path of a file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Folder(FolderId),
    Record(String),
}

#[derive(Debug, Clone)]
enum Child {
    Folder(FolderId),
    Record { name: String, path: String },
}

#[derive(Debug)]
pub struct Folder {
    pub name: String,
    comparable_name: String,
    pub parent: Option<FolderId>,
    children: Vec<Child>,
}

/// The archive's directory tree. The root has the empty name and no parent.
#[derive(Debug)]
pub struct FolderTree {
    folders: Vec<Folder>,
}

impl FolderTree {
    pub fn new() -> Self {
        Self {
            folders: vec![Folder {
                name: String::new(),
                comparable_name: String::new(),
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn folder(&self, id: FolderId) -> &Folder {
        &self.folders[id]
    }

    /// Full delimiter-joined path of a directory; "/" for the root.
    pub fn full_path(&self, mut id: FolderId) -> String {
        let mut names = Vec::new();
        while let Some(parent) = self.folders[id].parent {
            names.push(self.folders[id].name.clone());
            id = parent;
        }
        names.reverse();
        format!("{}{}", DELIMITER, names.join(&DELIMITER.to_string()))
    }

    fn child_position(&self, id: FolderId, name: &str) -> Option<usize> {
        let wanted = comparable(name);
        self.folders[id].children.iter().position(|c| match c {
            Child::Folder(fid) => self.folders[*fid].comparable_name == wanted,
            Child::Record { name, .. } => comparable(name) == wanted,
        })
    }

    fn child_entry(&self, id: FolderId, name: &str) -> Option<Entry> {
        self.child_position(id, name)
            .map(|pos| match &self.folders[id].children[pos] {
                Child::Folder(fid) => Entry::Folder(*fid),
                Child::Record { path, .. } => Entry::Record(path.clone()),
            })
    }

    /// Directories first, then case-folded name; applied after every insert.
    fn sort_children(&mut self, id: FolderId) {
        let mut children = std::mem::take(&mut self.folders[id].children);
        children.sort_by(|a, b| self.child_sort_key(a).cmp(&self.child_sort_key(b)));
        self.folders[id].children = children;
    }

    fn child_sort_key(&self, child: &Child) -> (u8, String) {
        match child {
            Child::Folder(fid) => (0, self.folders[*fid].comparable_name.clone()),
            Child::Record { name, .. } => (1, comparable(name)),
        }
    }

    /// Create every missing ancestor directory along `path`. With
    /// `last_is_file` the final segment is left alone (it is reserved for a
    /// file record to be attached separately) and the returned directory is
    /// the record's parent. Fails if an intermediate segment already exists as
    /// a file record.
    pub fn mkdir(&mut self, path: &str, last_is_file: bool) -> Result<FolderId, SafeError> {
        let segments: Vec<&str> = path.split(DELIMITER).filter(|s| !s.is_empty()).collect();
        let take = if last_is_file {
            segments.len().saturating_sub(1)
        } else {
            segments.len()
        };

        let mut cur = ROOT;
        for seg in &segments[..take] {
            match self.child_entry(cur, seg) {
                Some(Entry::Folder(fid)) => cur = fid,
                Some(Entry::Record(_)) => {
                    return Err(SafeError::Validation(format!(
                        "'{}' already exists as a file",
                        seg
                    )));
                }
                None => {
                    self.folders.push(Folder {
                        name: seg.to_string(),
                        comparable_name: comparable(seg),
                        parent: Some(cur),
                        children: Vec::new(),
                    });
                    let fid = self.folders.len() - 1;
                    self.folders[cur].children.push(Child::Folder(fid));
                    self.sort_children(cur);
                    cur = fid;
                }
            }
        }
        Ok(cur)
    }

    /// Resolve a path to an entry. A leading delimiter is absolute from the
    /// root, `.` is the current directory, `..` its parent (the root is its
    /// own parent); a bare delimiter resolves to the root.
    pub fn resolve(&self, path: &str, current: FolderId) -> Option<Entry> {
        let mut cur = if path.starts_with(DELIMITER) { ROOT } else { current };
        let segments: Vec<&str> = path.split(DELIMITER).filter(|s| !s.is_empty()).collect();

        for (i, seg) in segments.iter().enumerate() {
            match *seg {
                "." => {}
                ".." => cur = self.folders[cur].parent.unwrap_or(ROOT),
                name => match self.child_entry(cur, name)? {
                    Entry::Folder(fid) => cur = fid,
                    Entry::Record(record_path) => {
                        // A record can only terminate a path.
                        if i + 1 == segments.len() {
                            return Some(Entry::Record(record_path));
                        }
                        return None;
                    }
                },
            }
        }
        Some(Entry::Folder(cur))
    }

    /// Match a glob pattern against the tree. Relativity rules are the same as
    /// [`resolve`](Self::resolve); a `*` inside a segment matches any run of
    /// characters within that segment, case-insensitively. Results are
    /// de-duplicated and insertion-ordered.
    pub fn match_glob(&self, pattern: &str, current: FolderId) -> Result<Vec<Entry>, SafeError> {
        let start = if pattern.starts_with(DELIMITER) { ROOT } else { current };
        let segments: Vec<&str> = pattern.split(DELIMITER).filter(|s| !s.is_empty()).collect();

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        if segments.is_empty() {
            self.push_entry(Entry::Folder(start), &mut out, &mut seen);
            return Ok(out);
        }
        self.glob_step(start, &segments, &mut out, &mut seen)?;
        Ok(out)
    }

    fn push_entry(&self, entry: Entry, out: &mut Vec<Entry>, seen: &mut HashSet<String>) {
        let key = match &entry {
            Entry::Folder(fid) => comparable(&self.full_path(*fid)),
            Entry::Record(path) => comparable(path),
        };
        if seen.insert(key) {
            out.push(entry);
        }
    }

    fn glob_step(
        &self,
        folder: FolderId,
        segments: &[&str],
        out: &mut Vec<Entry>,
        seen: &mut HashSet<String>,
    ) -> Result<(), SafeError> {
        let seg = segments[0];
        let rest = &segments[1..];
        let last = rest.is_empty();

        let step = |entry: Entry, out: &mut Vec<Entry>, seen: &mut HashSet<String>| {
            if last {
                self.push_entry(entry, out, seen);
                Ok(())
            } else if let Entry::Folder(fid) = entry {
                self.glob_step(fid, rest, out, seen)
            } else {
                Ok(())
            }
        };

        match seg {
            "." => step(Entry::Folder(folder), out, seen)?,
            ".." => step(
                Entry::Folder(self.folders[folder].parent.unwrap_or(ROOT)),
                out,
                seen,
            )?,
            _ if seg.contains('*') => {
                let re = segment_regex(seg)?;
                // Snapshot the children to keep the traversal order stable.
                let matches: Vec<Entry> = self.folders[folder]
                    .children
                    .iter()
                    .filter_map(|c| match c {
                        Child::Folder(fid) if re.is_match(&self.folders[*fid].name) => {
                            Some(Entry::Folder(*fid))
                        }
                        Child::Record { name, path } if re.is_match(name) => {
                            Some(Entry::Record(path.clone()))
                        }
                        _ => None,
                    })
                    .collect();
                for entry in matches {
                    step(entry, out, seen)?;
                }
            }
            name => {
                if let Some(entry) = self.child_entry(folder, name) {
                    step(entry, out, seen)?;
                }
            }
        }
        Ok(())
    }

    /// Attach a file record to its parent directory, which must already exist.
    /// Fails if a sibling (directory or record) carries the same name.
    pub fn attach(&mut self, path: &str) -> Result<(), SafeError> {
        let name = leaf_name(path);
        if name.is_empty() {
            return Err(SafeError::Validation(format!("invalid record path '{}'", path)));
        }
        let parent = match self.resolve(parent_path(path), ROOT) {
            Some(Entry::Folder(fid)) => fid,
            Some(Entry::Record(_)) => {
                return Err(SafeError::Validation(format!(
                    "destination '{}' is not a directory",
                    parent_path(path)
                )));
            }
            None => {
                return Err(SafeError::Validation(format!(
                    "destination directory '{}' does not exist",
                    parent_path(path)
                )));
            }
        };
        if self.child_position(parent, name).is_some() {
            return Err(SafeError::Validation(format!(
                "'{}' already exists in '{}'",
                name,
                parent_path(path)
            )));
        }
        self.folders[parent].children.push(Child::Record {
            name: name.to_string(),
            path: path.to_string(),
        });
        self.sort_children(parent);
        Ok(())
    }

    /// Remove the named child (directory or record) from its parent.
    /// Returns false if there is nothing to remove.
    pub fn detach(&mut self, path: &str) -> bool {
        let name = leaf_name(path);
        let parent = match self.resolve(parent_path(path), ROOT) {
            Some(Entry::Folder(fid)) => fid,
            _ => return false,
        };
        match self.child_position(parent, name) {
            Some(pos) => {
                // A detached directory's arena slot is simply orphaned.
                self.folders[parent].children.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self, id: FolderId) -> bool {
        self.folders[id].children.is_empty()
    }

    /// Immediate children of a directory, in display order.
    pub fn children(&self, id: FolderId) -> Vec<Entry> {
        self.folders[id]
            .children
            .iter()
            .map(|c| match c {
                Child::Folder(fid) => Entry::Folder(*fid),
                Child::Record { path, .. } => Entry::Record(path.clone()),
            })
            .collect()
    }

    /// Paths of every record anywhere below a directory.
    pub fn records_under(&self, id: FolderId) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_records(id, &mut out);
        out
    }

    fn collect_records(&self, id: FolderId, out: &mut Vec<String>) {
        for child in &self.folders[id].children {
            match child {
                Child::Folder(fid) => self.collect_records(*fid, out),
                Child::Record { path, .. } => out.push(path.clone()),
            }
        }
    }
}

impl Default for FolderTree {
    fn default() -> Self {
        Self::new()
    }
}

fn segment_regex(segment: &str) -> Result<regex::Regex, SafeError> {
    let mut pattern = String::from("^");
    for ch in segment.chars() {
        if ch == '*' {
            pattern.push_str(".*");
        } else {
            pattern.push_str(&regex::escape(&ch.to_string()));
        }
    }
    pattern.push('$');
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| SafeError::Validation(format!("bad wildcard pattern '{}': {}", segment, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_path(tree: &FolderTree, entry: &Entry) -> String {
        match entry {
            Entry::Folder(fid) => tree.full_path(*fid),
            Entry::Record(path) => path.clone(),
        }
    }

    #[test]
    fn mkdir_creates_ancestors_and_reserves_file_leaf() {
        let mut tree = FolderTree::new();
        let parent = tree.mkdir("/docs/reports/2024/q1.txt", true).unwrap();
        assert_eq!(tree.full_path(parent), "/docs/reports/2024");
        // The leaf was not created as a directory.
        assert!(tree.resolve("/docs/reports/2024/q1.txt", ROOT).is_none());
    }

    #[test]
    fn mkdir_fails_when_segment_is_a_file() {
        let mut tree = FolderTree::new();
        tree.mkdir("/docs/readme.txt", true).unwrap();
        tree.attach("/docs/readme.txt").unwrap();

        let result = tree.mkdir("/docs/readme.txt/nested", true);
        assert!(matches!(result, Err(SafeError::Validation(_))));
    }

    #[test]
    fn resolve_handles_relative_segments() {
        let mut tree = FolderTree::new();
        let q1 = tree.mkdir("/docs/2024", false).unwrap();

        assert_eq!(tree.resolve("/", ROOT), Some(Entry::Folder(ROOT)));
        assert_eq!(tree.resolve(".", q1), Some(Entry::Folder(q1)));
        match tree.resolve("..", q1) {
            Some(Entry::Folder(fid)) => assert_eq!(tree.full_path(fid), "/docs"),
            other => panic!("unexpected: {:?}", other),
        }
        // The root is its own parent.
        assert_eq!(tree.resolve("../..", q1).map(|e| entry_path(&tree, &e)), Some("/".into()));
        assert_eq!(
            tree.resolve("/docs/2024", ROOT).map(|e| entry_path(&tree, &e)),
            Some("/docs/2024".into())
        );
    }

    #[test]
    fn resolve_is_case_insensitive_but_case_preserving() {
        let mut tree = FolderTree::new();
        tree.mkdir("/Docs", false).unwrap();
        tree.mkdir("/Docs/Notes.TXT", true).unwrap();
        tree.attach("/Docs/Notes.TXT").unwrap();

        match tree.resolve("/docs/notes.txt", ROOT) {
            Some(Entry::Record(path)) => assert_eq!(path, "/Docs/Notes.TXT"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn attach_rejects_duplicate_and_missing_parent() {
        let mut tree = FolderTree::new();
        tree.mkdir("/a/file.bin", true).unwrap();
        tree.attach("/a/file.bin").unwrap();

        assert!(matches!(tree.attach("/a/FILE.BIN"), Err(SafeError::Validation(_))));
        assert!(matches!(tree.attach("/missing/x"), Err(SafeError::Validation(_))));
    }

    #[test]
    fn detach_removes_and_reports_absent() {
        let mut tree = FolderTree::new();
        tree.mkdir("/a/file.bin", true).unwrap();
        tree.attach("/a/file.bin").unwrap();

        assert!(tree.detach("/a/file.bin"));
        assert!(!tree.detach("/a/file.bin"));
        assert!(tree.resolve("/a/file.bin", ROOT).is_none());
    }

    fn glob_fixture() -> FolderTree {
        let mut tree = FolderTree::new();
        for dir in ["1", "2"] {
            for child in ["1", "2", "3"] {
                let path = format!("/{}/{}{}", dir, dir, child);
                tree.mkdir(&path, true).unwrap();
                tree.attach(&path).unwrap();
            }
        }
        tree
    }

    #[test]
    fn glob_matches_within_segments_only() {
        let tree = glob_fixture();
        let hits: Vec<String> = tree
            .match_glob("/*/*2", ROOT)
            .unwrap()
            .iter()
            .map(|e| entry_path(&tree, e))
            .collect();
        assert_eq!(hits, vec!["/1/12".to_string(), "/2/22".to_string()]);
    }

    #[test]
    fn glob_prefix_wildcard_recurses_into_matching_dirs() {
        let tree = glob_fixture();
        let hits: Vec<String> = tree
            .match_glob("/1*/*", ROOT)
            .unwrap()
            .iter()
            .map(|e| entry_path(&tree, e))
            .collect();
        assert_eq!(hits, vec!["/1/11".to_string(), "/1/12".to_string(), "/1/13".to_string()]);
    }

    #[test]
    fn glob_never_duplicates_entries() {
        let mut tree = FolderTree::new();
        tree.mkdir("/shared/item", true).unwrap();
        tree.attach("/shared/item").unwrap();

        // Both wildcard segments match the same single directory.
        let hits = tree.match_glob("/s*a*/*", ROOT).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(entry_path(&tree, &hits[0]), "/shared/item");
    }

    #[test]
    fn children_sort_directories_first() {
        let mut tree = FolderTree::new();
        tree.mkdir("/zeta.txt", true).unwrap();
        tree.attach("/zeta.txt").unwrap();
        tree.mkdir("/beta", false).unwrap();
        tree.mkdir("/alpha", false).unwrap();

        let names: Vec<String> = tree
            .children(ROOT)
            .iter()
            .map(|e| entry_path(&tree, e))
            .collect();
        assert_eq!(names, vec!["/alpha", "/beta", "/zeta.txt"]);
    }

    #[test]
    fn sanitize_substitutes_every_forbidden_character() {
        for &ch in FORBIDDEN_CHARS {
            let name = format!("a{}b", ch);
            assert_eq!(sanitize_name(&name, Some('#')), "a#b");
            assert_eq!(sanitize_name(&name, None), "ab");
        }
        assert_eq!(sanitize_name("clean-name.txt", Some('#')), "clean-name.txt");
        assert_eq!(sanitize_path("/a:b/c*d.txt", Some('_')), "/a_b/c_d.txt");
    }

    #[test]
    fn leaf_and_parent_helpers() {
        assert_eq!(leaf_name("/docs/notes.txt"), "notes.txt");
        assert_eq!(parent_path("/docs/notes.txt"), "/docs");
        assert_eq!(parent_path("/notes.txt"), "/");
        assert_eq!(leaf_name("/"), "");
    }
}
