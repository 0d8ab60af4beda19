// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::fmt::Write as _;

use indextree::{Arena, NodeId};
use thiserror::Error;

use crate::path;

/// Kind of node stored in the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Regular,
    Directory,
    Symlink(String),
}

/// Flags field as read from the info-map line format, preserved verbatim
/// for round-trip writes while also exposing the bits planning code cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags(String);

impl Flags {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn raw(&self) -> &str {
        &self.0
    }

    pub fn is_executable(&self) -> bool {
        self.0.contains('x')
    }
}

/// A single file or directory entry in an info-map.
#[derive(Clone, Debug)]
pub struct Entry {
    pub path: String,
    pub kind: Kind,
    pub flags: Flags,
    pub revision: u64,
    pub checksum: Option<String>,
    pub size: Option<u64>,
    /// Set by the sync/install planner once a download destination is known.
    pub download_path: Option<String>,
    user_data: Option<String>,
}

impl Entry {
    fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: Kind::Directory,
            flags: Flags::default(),
            revision: 0,
            checksum: None,
            size: None,
            download_path: None,
            user_data: None,
        }
    }

    /// Build a regular-file entry, carrying over another entry's `user_data`
    /// (used when a planner copies an entry from one tree into another).
    pub fn file_like(path: impl Into<String>, kind: Kind, flags: Flags, revision: u64, checksum: Option<String>, size: Option<u64>, like: &Entry) -> Self {
        Self {
            path: path.into(),
            kind,
            flags,
            revision,
            checksum,
            size,
            download_path: like.download_path.clone(),
            user_data: like.user_data.clone(),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, Kind::Regular)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Directory)
    }

    pub fn user_data(&self) -> Option<&str> {
        self.user_data.as_deref()
    }
}

/// Scope a [`InfoMap::set_user_data`] call applies to, relative to the target path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// The target node only.
    Only,
    /// The target and every descendant.
    All,
    /// The target (if a file) and every descendant file.
    File,
    /// The target (if a directory) and every descendant directory.
    Dir,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing parent: {0}")]
    MissingParent(String),
    #[error("no such path: {0}")]
    NotFound(String),
    #[error("malformed info-map line {0}: {1:?}")]
    Malformed(usize, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A path tree of files and directories, each carrying revision/checksum/size/flags.
///
/// Internal (directory) nodes have no revision of their own: it is always the
/// max of their children, recomputed whenever the tree is mutated in bulk.
#[derive(Debug)]
pub struct InfoMap {
    arena: Arena<Entry>,
    map: HashMap<String, NodeId>,
    root: NodeId,
}

impl Default for InfoMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InfoMap {
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let root = arena.new_node(Entry::directory("/"));
        let mut map = HashMap::new();
        map.insert("/".to_string(), root);
        Self { arena, map, root }
    }

    /// Parse the line-oriented info-map text format:
    /// `<path>, <flags>, <revision>[, <checksum>, <size>]`
    /// Lines starting with `#` are comments and are skipped.
    pub fn read(data: &str) -> Result<Self, Error> {
        let mut map = Self::new();
        for (lineno, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                return Err(Error::Malformed(lineno + 1, line.to_string()));
            }
            let entry_path = fields[0];
            let flags = Flags::new(fields[1]);
            let revision: u64 = fields[2]
                .parse()
                .map_err(|_| Error::Malformed(lineno + 1, line.to_string()))?;
            let checksum = fields.get(3).filter(|s| !s.is_empty()).map(|s| s.to_string());
            let size = fields
                .get(4)
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse().ok());

            let kind = if flags.raw().contains('d') {
                Kind::Directory
            } else if let Some(target) = flags.raw().strip_prefix("sl:") {
                Kind::Symlink(target.to_string())
            } else {
                Kind::Regular
            };

            let entry = Entry {
                path: entry_path.to_string(),
                kind,
                flags,
                revision,
                checksum,
                size,
                download_path: None,
                user_data: None,
            };
            map.insert(entry)?;
        }
        map.rebuild_revisions();
        Ok(map)
    }

    /// Serialise the tree back to the line-oriented format, sorted by path for determinism.
    pub fn write_to_string(&self) -> String {
        let mut paths: Vec<&String> = self.map.keys().filter(|p| p.as_str() != "/").collect();
        paths.sort();

        let mut out = String::new();
        for path in paths {
            let node = self.map[path];
            let entry = self.arena[node].get();
            let _ = write!(out, "{}, {}, {}", entry.path, entry.flags.raw(), entry.revision);
            if let Some(checksum) = &entry.checksum {
                let _ = write!(out, ", {checksum}");
                if let Some(size) = entry.size {
                    let _ = write!(out, ", {size}");
                }
            }
            out.push('\n');
        }
        out
    }

    /// Insert an entry, auto-vivifying any missing parent directories.
    pub fn insert(&mut self, entry: Entry) -> Result<(), Error> {
        if let Some(parent) = path::parent(&entry.path) {
            self.ensure_dir(parent);
        }
        let path = entry.path.clone();
        let node = if let Some(&existing) = self.map.get(&path) {
            *self.arena[existing].get_mut() = entry;
            existing
        } else {
            let node = self.arena.new_node(entry);
            self.map.insert(path.clone(), node);
            node
        };
        if let Some(parent) = path::parent(&path) {
            self.attach(node, parent)?;
        }
        Ok(())
    }

    fn ensure_dir(&mut self, dir_path: &str) {
        if self.map.contains_key(dir_path) {
            return;
        }
        if let Some(parent) = path::parent(dir_path) {
            self.ensure_dir(parent);
        }
        let node = self.arena.new_node(Entry::directory(dir_path));
        self.map.insert(dir_path.to_string(), node);
        if let Some(parent) = path::parent(dir_path) {
            let _ = self.attach(node, parent);
        }
    }

    fn attach(&mut self, node: NodeId, parent: &str) -> Result<(), Error> {
        let &parent_node = self.map.get(parent).ok_or_else(|| Error::MissingParent(parent.to_string()))?;
        if node.ancestors(&self.arena).any(|a| a == parent_node) {
            return Ok(());
        }
        if node.parent(&self.arena) != Some(parent_node) {
            parent_node.append(node, &mut self.arena);
        }
        Ok(())
    }

    /// Look up a single entry by path.
    pub fn get(&self, entry_path: &str) -> Option<&Entry> {
        self.map.get(entry_path).map(|n| self.arena[*n].get())
    }

    /// Iterate every entry in the tree (pre-order, root excluded), filtered by predicate.
    pub fn walk<'a>(&'a self, filter: impl Fn(&Entry) -> bool + 'a) -> impl Iterator<Item = &'a Entry> + 'a {
        self.root
            .descendants(&self.arena)
            .skip(1)
            .map(|n| self.arena[n].get())
            .filter(move |e| filter(e))
    }

    pub fn len(&self) -> usize {
        self.map.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute every directory's revision as the max of its children, bottom-up.
    pub fn rebuild_revisions(&mut self) {
        let post_order: Vec<NodeId> = self.root.descendants(&self.arena).collect::<Vec<_>>();
        for node in post_order.into_iter().rev() {
            if !matches!(self.arena[node].get().kind, Kind::Directory) {
                continue;
            }
            let max_child = node
                .children(&self.arena)
                .map(|c| self.arena[c].get().revision)
                .max()
                .unwrap_or(0);
            self.arena[node].get_mut().revision = max_child;
        }
    }

    /// Model the rule that files unchanged since `base` belong to the current
    /// revision for staleness purposes: bump every entry's revision up to `base`.
    pub fn bump_to_base_revision(&mut self, base: u64) {
        for node in self.root.descendants(&self.arena).skip(1).collect::<Vec<_>>() {
            let entry = self.arena[node].get_mut();
            entry.revision = entry.revision.max(base);
        }
        self.rebuild_revisions();
    }

    /// Remove every entry (and, for directories, everything beneath it) matching `pred`.
    /// When `post_order` is true children are evaluated (and removed) before their parents,
    /// which is required so a directory emptied by this same pass can itself be matched.
    pub fn remove_if(&mut self, pred: impl Fn(&Entry) -> bool, post_order: bool) {
        let mut order: Vec<NodeId> = self.root.descendants(&self.arena).skip(1).collect();
        if post_order {
            order.reverse();
        }
        for node in order {
            if node.ancestors(&self.arena).skip(1).all(|a| self.arena.get(a).is_some()) && self.arena.get(node).is_some() {
                let matched = pred(self.arena[node].get());
                if matched {
                    self.remove_node(node);
                }
            }
        }
    }

    /// Remove a single path, and its subtree if it is a directory.
    pub fn remove_at(&mut self, entry_path: &str) -> Result<(), Error> {
        let node = *self.map.get(entry_path).ok_or_else(|| Error::NotFound(entry_path.to_string()))?;
        self.remove_node(node);
        Ok(())
    }

    fn remove_node(&mut self, node: NodeId) {
        if self.arena.get(node).is_none() {
            return;
        }
        let paths: Vec<String> = node
            .descendants(&self.arena)
            .map(|n| self.arena[n].get().path.clone())
            .collect();
        node.remove_subtree(&mut self.arena);
        for p in paths {
            self.map.remove(&p);
        }
    }

    /// Remove empty directories, deepest first.
    pub fn prune_empty_dirs(&mut self) {
        let mut again = true;
        while again {
            again = false;
            let dirs: Vec<NodeId> = self
                .root
                .descendants(&self.arena)
                .skip(1)
                .filter(|n| matches!(self.arena[*n].get().kind, Kind::Directory))
                .collect();
            for node in dirs {
                if self.arena.get(node).is_some() && node.children(&self.arena).next().is_none() {
                    self.remove_node(node);
                    again = true;
                }
            }
        }
    }

    /// Keep only files whose revision equals `version`, then prune dirs left empty.
    pub fn filter_in_version(&mut self, version: u64) {
        self.remove_if(|e| matches!(e.kind, Kind::Regular) && e.revision != version, true);
        self.prune_empty_dirs();
    }

    pub fn set_user_data(&mut self, entry_path: &str, value: impl Into<String>, scope: Scope) -> Result<(), Error> {
        let node = *self.map.get(entry_path).ok_or_else(|| Error::NotFound(entry_path.to_string()))?;
        let value = value.into();
        match scope {
            Scope::Only => {
                self.arena[node].get_mut().user_data = Some(value);
            }
            Scope::All => {
                for n in node.descendants(&self.arena).collect::<Vec<_>>() {
                    self.arena[n].get_mut().user_data = Some(value.clone());
                }
            }
            Scope::File => {
                for n in node.descendants(&self.arena).collect::<Vec<_>>() {
                    if matches!(self.arena[n].get().kind, Kind::Regular) {
                        self.arena[n].get_mut().user_data = Some(value.clone());
                    }
                }
            }
            Scope::Dir => {
                for n in node.descendants(&self.arena).collect::<Vec<_>>() {
                    if matches!(self.arena[n].get().kind, Kind::Directory) {
                        self.arena[n].get_mut().user_data = Some(value.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_creates_implicit_parents() {
        let map = InfoMap::read("/usr/bin/nano, f, 5, deadbeef, 1024\n").unwrap();
        assert!(map.get("/usr/bin").unwrap().is_dir());
        assert!(map.get("/usr/bin/nano").unwrap().is_file());
        assert_eq!(map.get("/usr/bin/nano").unwrap().revision, 5);
    }

    #[test]
    fn directory_revision_is_max_of_children() {
        let map = InfoMap::read(
            "/a/one, f, 2\n\
             /a/two, f, 7\n",
        )
        .unwrap();
        assert_eq!(map.get("/a").unwrap().revision, 7);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let map = InfoMap::read("# header\n\n/x, f, 1\n").unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn filter_in_version_prunes_stale_files_and_empty_dirs() {
        let mut map = InfoMap::read(
            "/keep/here, f, 3\n\
             /drop/there, f, 1\n",
        )
        .unwrap();
        map.filter_in_version(3);
        assert!(map.get("/keep/here").is_some());
        assert!(map.get("/drop/there").is_none());
        assert!(map.get("/drop").is_none());
    }

    #[test]
    fn bump_to_base_revision_raises_stale_entries() {
        let mut map = InfoMap::read("/a, f, 1\n").unwrap();
        map.bump_to_base_revision(10);
        assert_eq!(map.get("/a").unwrap().revision, 10);
    }

    #[test]
    fn round_trip_is_stable() {
        let original = "/a, f, 1, aa, 10\n/b, d, 1\n";
        let map = InfoMap::read(original).unwrap();
        let written = map.write_to_string();
        let reparsed = InfoMap::read(&written).unwrap();
        assert_eq!(reparsed.get("/a").unwrap().revision, map.get("/a").unwrap().revision);
    }

    #[test]
    fn set_user_data_scopes() {
        let mut map = InfoMap::read("/d/a, f, 1\n/d/b, f, 1\n").unwrap();
        map.set_user_data("/d", "needed", Scope::File).unwrap();
        assert_eq!(map.get("/d/a").unwrap().user_data(), Some("needed"));
        assert_eq!(map.get("/d").unwrap().user_data(), None);
    }
}
