// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Sync planner (component E): reconciles a remote info-map, a local
//! have-map, and the install set's required sources into a minimal
//! download list.

use std::collections::HashSet;

use infomap::{Entry, InfoMap, Kind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("source not found in remote map: {0}")]
    SourceNotFound(String),
    #[error("source {0} expected a {1} but the remote target is a {2}")]
    WrongKind(String, &'static str, &'static str),
    #[error("info-map")]
    InfoMap(#[from] infomap::Error),
}

/// `install_sources` tag recognised on a required item's source entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
    File,
    Files,
    Dir,
    DirCont,
}

impl SourceTag {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("!file") => SourceTag::File,
            Some("!files") => SourceTag::Files,
            Some("!dir_cont") => SourceTag::DirCont,
            _ => SourceTag::Dir,
        }
    }
}

/// A single required source: a path into the remote tree, tagged with how
/// much of that subtree is needed.
#[derive(Debug, Clone)]
pub struct RequiredSource {
    pub path: String,
    pub tag: SourceTag,
}

/// A file that needs to move from the remote repository to local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOp {
    pub path: String,
    pub revision: u64,
    pub checksum: Option<String>,
    pub dest: String,
    /// The file is a `wtar` archive marker and must be unpacked after download.
    pub needs_unwtar: bool,
}

#[derive(Debug, Default)]
pub struct SyncPlan {
    pub downloads: Vec<DownloadOp>,
    pub new_have: InfoMap,
}

const WTAR_SUFFIX: &str = ".wtar";

/// Run the reconciliation algorithm: mark what's needed from `required`,
/// prune everything else from `remote`, diff the remainder against `have`,
/// and emit the minimal download list plus the replacement have-map.
pub fn plan(remote: &mut InfoMap, have: &InfoMap, required: &[RequiredSource], base_repo_rev: u64, dest_root: &str) -> Result<SyncPlan, Error> {
    remote.bump_to_base_revision(base_repo_rev);

    let mut needed: HashSet<String> = HashSet::new();
    for source in required {
        mark_needed(remote, source, &mut needed)?;
    }

    remote.remove_if(|entry| !needed.contains(&entry.path), true);
    remote.prune_empty_dirs();

    let mut new_have = InfoMap::new();
    let mut downloads = Vec::new();

    for entry in remote.walk(|e| matches!(e.kind, Kind::Regular)) {
        let dest = format!("{}/{}", dest_root.trim_end_matches('/'), entry.path.trim_start_matches('/'));

        let up_to_date = have
            .get(&entry.path)
            .map(|have_entry| have_entry.revision == entry.revision)
            .unwrap_or(false);

        let mut new_entry = Entry::file_like(
            entry.path.clone(),
            entry.kind.clone(),
            entry.flags.clone(),
            entry.revision,
            entry.checksum.clone(),
            entry.size,
            entry,
        );
        new_entry.download_path = Some(dest.clone());
        new_have.insert(new_entry)?;

        if !up_to_date {
            downloads.push(DownloadOp {
                path: entry.path.clone(),
                revision: entry.revision,
                checksum: entry.checksum.clone(),
                dest,
                needs_unwtar: entry.path.ends_with(WTAR_SUFFIX),
            });
        }
    }

    downloads.sort_by(|a, b| a.path.cmp(&b.path));
    new_have.rebuild_revisions();

    Ok(SyncPlan { downloads, new_have })
}

fn mark_needed(remote: &InfoMap, source: &RequiredSource, needed: &mut HashSet<String>) -> Result<(), Error> {
    let entry = remote.get(&source.path).ok_or_else(|| Error::SourceNotFound(source.path.clone()))?;

    match source.tag {
        SourceTag::File => {
            if !entry.is_file() {
                return Err(Error::WrongKind(source.path.clone(), "file", "directory"));
            }
            needed.insert(entry.path.clone());
        }
        SourceTag::Files => {
            if !entry.is_dir() {
                return Err(Error::WrongKind(source.path.clone(), "directory", "file"));
            }
            needed.insert(entry.path.clone());
            for child in remote.walk(|e| e.path.starts_with(&format!("{}/", source.path)) && e.is_file() && is_direct_child(&source.path, &e.path)) {
                needed.insert(child.path.clone());
            }
        }
        SourceTag::Dir | SourceTag::DirCont => {
            if !entry.is_dir() {
                return Err(Error::WrongKind(source.path.clone(), "directory", "file"));
            }
            needed.insert(entry.path.clone());
            let prefix = format!("{}/", source.path);
            for descendant in remote.walk(|e| e.path.starts_with(&prefix)) {
                needed.insert(descendant.path.clone());
            }
        }
    }
    Ok(())
}

fn is_direct_child(parent: &str, candidate: &str) -> bool {
    candidate
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| !rest.contains('/'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_remote() -> InfoMap {
        InfoMap::read(
            "/shared/a.bin, f, 3, aaaa, 10\n\
             /shared/icons/one.png, f, 3, bbbb, 5\n\
             /shared/icons/two.png, f, 3, cccc, 5\n",
        )
        .unwrap()
    }

    #[test]
    fn single_file_source_downloads_only_that_file() {
        let mut remote = sample_remote();
        let have = InfoMap::new();
        let required = vec![RequiredSource {
            path: "/shared/a.bin".to_string(),
            tag: SourceTag::File,
        }];
        let plan = plan(&mut remote, &have, &required, 0, "/cache").unwrap();
        assert_eq!(plan.downloads.len(), 1);
        assert_eq!(plan.downloads[0].path, "/shared/a.bin");
    }

    #[test]
    fn already_current_have_entry_is_not_redownloaded() {
        let mut remote = sample_remote();
        let have = InfoMap::read("/shared/a.bin, f, 3, aaaa, 10\n").unwrap();
        let required = vec![RequiredSource {
            path: "/shared/a.bin".to_string(),
            tag: SourceTag::File,
        }];
        let plan = plan(&mut remote, &have, &required, 0, "/cache").unwrap();
        assert!(plan.downloads.is_empty());
    }

    #[test]
    fn dir_cont_source_pulls_every_descendant() {
        let mut remote = sample_remote();
        let have = InfoMap::new();
        let required = vec![RequiredSource {
            path: "/shared/icons".to_string(),
            tag: SourceTag::DirCont,
        }];
        let plan = plan(&mut remote, &have, &required, 0, "/cache").unwrap();
        assert_eq!(plan.downloads.len(), 2);
    }

    #[test]
    fn missing_source_is_an_error() {
        let mut remote = sample_remote();
        let have = InfoMap::new();
        let required = vec![RequiredSource {
            path: "/nope".to_string(),
            tag: SourceTag::File,
        }];
        assert!(plan(&mut remote, &have, &required, 0, "/cache").is_err());
    }
}
