// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Filesystem [`Action`]s (component G's primitives) for the batch kinds the
//! planner emits: cloning synced sources into target folders, hard-linking,
//! and removing stale installs. Downloads themselves already landed on disk
//! by the time these run — `Kind::Sync` here is a log-only marker.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use fnmatch::PatternSet;
use fs_err as fs;
use sha2::{Digest, Sha256};

use crate::batch::Kind;
use crate::executor::{Action, ActionError, Context};

/// Copy engine for `Kind::Copy`: recurses into directories, preserves
/// symlinks, skips files that are already in place, and falls back from
/// hard-linking to a full copy on the first `link` failure for the rest of
/// the run.
///
/// Per-file skip logic: a destination with the same inode as the source, or
/// the same size and mtime, is left untouched; otherwise the destination is
/// chmod'd `a+rw` (and has its flags cleared if matched by
/// `no_flags_patterns`) before copying or linking over it.
pub struct RsyncClone {
    pub source: String,
    pub dest: String,
    pub ignore_patterns: PatternSet,
    pub no_hard_link_patterns: PatternSet,
    pub no_flags_patterns: PatternSet,
    pub prefer_hard_links: bool,
    pub copy_owner: bool,
    pub copy_stat: bool,
    pub delete_extraneous_files: bool,
    pub symlinks_as_symlinks: bool,
    pub ignore_dangling_symlinks: bool,
    pub avoid_copy_markers: Vec<String>,
}

impl Default for RsyncClone {
    fn default() -> Self {
        Self {
            source: String::new(),
            dest: String::new(),
            ignore_patterns: PatternSet::default(),
            no_hard_link_patterns: PatternSet::default(),
            no_flags_patterns: PatternSet::default(),
            prefer_hard_links: true,
            copy_owner: false,
            copy_stat: true,
            delete_extraneous_files: false,
            symlinks_as_symlinks: true,
            ignore_dangling_symlinks: true,
            avoid_copy_markers: Vec::new(),
        }
    }
}

impl Action for RsyncClone {
    fn call(&mut self, _ctx: &mut Context) -> Result<(), ActionError> {
        let src = Path::new(&self.source).to_path_buf();
        let dst = Path::new(&self.dest).to_path_buf();
        self.copy_recursive(&src, &dst, "")
    }
}

impl RsyncClone {
    fn copy_recursive(&mut self, src: &Path, dst: &Path, rel: &str) -> Result<(), ActionError> {
        if !rel.is_empty() && self.ignore_patterns.is_match(rel) {
            return Ok(());
        }

        let link_meta = fs::symlink_metadata(src).map_err(|e| stat_error(src, &e))?;

        if link_meta.file_type().is_symlink() {
            return self.copy_symlink(src, dst, rel, &link_meta);
        }
        if link_meta.is_dir() {
            return self.copy_directory(src, dst, rel);
        }
        self.copy_file(src, dst, rel, &link_meta)
    }

    fn copy_directory(&mut self, src: &Path, dst: &Path, rel: &str) -> Result<(), ActionError> {
        if self.directory_skippable_via_marker(src, dst) {
            return Ok(());
        }

        fs::create_dir_all(dst).map_err(|e| ActionError::new(format!("mkdir {}: {e}", dst.display())))?;

        let entries = fs::read_dir(src).map_err(|e| ActionError::new(format!("scandir {}: {e}", src.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| ActionError::new(format!("scandir {}: {e}", src.display())))?;
            let name = entry.file_name();
            let child_rel = join_rel(rel, &name.to_string_lossy());
            self.copy_recursive(&src.join(&name), &dst.join(&name), &child_rel)?;
        }

        if self.delete_extraneous_files {
            self.delete_extraneous(src, dst)?;
        }
        if self.copy_stat {
            copy_stat(src, dst)?;
        }
        Ok(())
    }

    fn copy_file(&mut self, src: &Path, dst: &Path, rel: &str, src_meta: &std::fs::Metadata) -> Result<(), ActionError> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| ActionError::new(format!("mkdir {}: {e}", parent.display())))?;
        }

        if same_inode_or_unchanged(src_meta, dst) {
            return Ok(());
        }

        if let Ok(dst_meta) = fs::symlink_metadata(dst) {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = dst_meta.permissions();
            perms.set_mode(perms.mode() | 0o666);
            let _ = fs::set_permissions(dst, perms);
        }
        if self.no_flags_patterns.is_match(rel) {
            clear_flags(dst);
        }

        if self.prefer_hard_links && !self.no_hard_link_patterns.is_match(rel) {
            match fs::hard_link(src, dst) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    log::warn!("hard link failed for {}, falling back to copy for the rest of this run", src.display());
                    self.prefer_hard_links = false;
                }
            }
        }

        let _ = fs::remove_file(dst);
        fs::copy(src, dst).map_err(|e| ActionError::new(format!("copy {} -> {}: {e}", src.display(), dst.display())))?;

        if self.copy_stat {
            copy_stat(src, dst)?;
        }
        if self.copy_owner {
            copy_owner(src, dst, src_meta)?;
        }
        Ok(())
    }

    fn copy_symlink(&mut self, src: &Path, dst: &Path, rel: &str, link_meta: &std::fs::Metadata) -> Result<(), ActionError> {
        if !self.symlinks_as_symlinks {
            let meta = fs::metadata(src).map_err(|e| stat_error(src, &e))?;
            return if meta.is_dir() {
                self.copy_directory(src, dst, rel)
            } else {
                self.copy_file(src, dst, rel, &meta)
            };
        }

        let target = fs::read_link(src).map_err(|e| ActionError::new(format!("readlink {}: {e}", src.display())))?;
        let resolved = if target.is_absolute() { target.clone() } else { src.parent().unwrap_or(Path::new(".")).join(&target) };
        if fs::symlink_metadata(&resolved).is_err() {
            if self.ignore_dangling_symlinks {
                return Ok(());
            }
            return Err(ActionError::new(format!("dangling symlink {} -> {}", src.display(), target.display())));
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| ActionError::new(format!("mkdir {}: {e}", parent.display())))?;
        }
        if let Ok(existing) = fs::symlink_metadata(dst) {
            if existing.file_type().is_symlink() && fs::read_link(dst).map(|l| l == target).unwrap_or(false) {
                return Ok(());
            }
        }
        let _ = fs::remove_file(dst);
        std::os::unix::fs::symlink(&target, dst).map_err(|e| ActionError::new(format!("symlink {} -> {}: {e}", dst.display(), target.display())))?;

        let _ = link_meta;
        Ok(())
    }

    fn directory_skippable_via_marker(&self, src: &Path, dst: &Path) -> bool {
        self.avoid_copy_markers.iter().any(|marker| {
            let src_sum = sha256_file(&src.join(marker));
            let dst_sum = sha256_file(&dst.join(marker));
            matches!((src_sum, dst_sum), (Ok(a), Ok(b)) if a == b)
        })
    }

    fn delete_extraneous(&self, src: &Path, dst: &Path) -> Result<(), ActionError> {
        let entries = match fs::read_dir(dst) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ActionError::new(format!("scandir {}: {e}", dst.display()))),
        };
        for entry in entries {
            let entry = entry.map_err(|e| ActionError::new(format!("scandir {}: {e}", dst.display())))?;
            let name = entry.file_name();
            if fs::symlink_metadata(src.join(&name)).is_ok() {
                continue;
            }
            let path = dst.join(&name);
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let result = if is_dir { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
            result.map_err(|e| ActionError::new(format!("remove extraneous {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

fn join_rel(rel: &str, name: &str) -> String {
    if rel.is_empty() { name.to_string() } else { format!("{rel}/{name}") }
}

fn stat_error(path: &Path, e: &std::io::Error) -> ActionError {
    ActionError::new(format!("stat {}: {e}", path.display())).doing(path.display().to_string())
}

fn same_inode_or_unchanged(src_meta: &std::fs::Metadata, dst: &Path) -> bool {
    let Ok(dst_meta) = fs::symlink_metadata(dst) else { return false };
    if src_meta.ino() == dst_meta.ino() && src_meta.dev() == dst_meta.dev() {
        return true;
    }
    src_meta.len() == dst_meta.len() && src_meta.mtime() == dst_meta.mtime()
}

fn sha256_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    Ok(Sha256::digest(bytes).into())
}

fn copy_stat(src: &Path, dst: &Path) -> Result<(), ActionError> {
    let meta = fs::symlink_metadata(src).map_err(|e| stat_error(src, &e))?;
    fs::set_permissions(dst, meta.permissions()).map_err(|e| ActionError::new(format!("chmod {}: {e}", dst.display())))?;

    let mtime = nix::sys::time::TimeSpec::new(meta.mtime(), meta.mtime_nsec());
    let atime = nix::sys::time::TimeSpec::new(meta.atime(), meta.atime_nsec());
    nix::sys::stat::utimensat(None, dst, &atime, &mtime, nix::sys::stat::UtimensatFlags::FollowSymlink)
        .map_err(|e| ActionError::new(format!("set mtime on {}: {e}", dst.display())).ignorable())?;
    Ok(())
}

fn copy_owner(_src: &Path, dst: &Path, src_meta: &std::fs::Metadata) -> Result<(), ActionError> {
    nix::unistd::chown(dst, Some(nix::unistd::Uid::from_raw(src_meta.uid())), Some(nix::unistd::Gid::from_raw(src_meta.gid())))
        .map_err(|e| ActionError::new(format!("chown {}: {e}", dst.display())).ignorable())
}

/// Clear the "no dump"/immutable-style flags matched by `no_flags_patterns`.
/// Only macOS/BSD filesystems carry such flags at all; elsewhere this is a
/// no-op.
#[cfg(target_os = "macos")]
fn clear_flags(path: &Path) {
    let _ = std::process::Command::new("chflags").arg("nouchg,noschg").arg(path).status();
}

#[cfg(not(target_os = "macos"))]
fn clear_flags(_path: &Path) {}

/// Hard-link `target` at `link_path`, creating parent directories as needed.
pub struct Link {
    pub target: String,
    pub link_path: String,
}

impl Action for Link {
    fn call(&mut self, _ctx: &mut Context) -> Result<(), ActionError> {
        let link_path = std::path::Path::new(&self.link_path);
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ActionError::new(format!("mkdir {}: {e}", parent.display())))?;
        }
        let _ = fs::remove_file(link_path);
        fs::hard_link(&self.target, link_path).map_err(|e| ActionError::new(format!("link {} -> {}: {e}", self.target, self.link_path)).ignorable())
    }
}

/// Remove a file or directory tree at `path`. Missing paths are treated as
/// already-satisfied rather than an error, since removal is idempotent.
pub struct Remove {
    pub path: String,
}

impl Action for Remove {
    fn call(&mut self, _ctx: &mut Context) -> Result<(), ActionError> {
        let path = std::path::Path::new(&self.path);
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ActionError::new(format!("stat {}: {e}", path.display()))),
        };
        let result = if meta.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
        result.map_err(|e| ActionError::new(format!("remove {}: {e}", path.display())))
    }
}

/// No-op marker: by the time the batch executes, `Kind::Sync` entries have
/// already been fetched by [`crate::download::fetch_all`].
pub struct Sync {
    pub dest: String,
}

impl Action for Sync {
    fn call(&mut self, _ctx: &mut Context) -> Result<(), ActionError> {
        log::info!("synced {}", self.dest);
        Ok(())
    }
}

/// Map a batch [`Kind`] to its concrete filesystem action. `Kind::Group`
/// carries no action of its own (it's a pure context manager).
pub fn dispatch(kind: &Kind) -> Option<Box<dyn Action>> {
    match kind {
        Kind::Copy { source, dest } => Some(Box::new(RsyncClone {
            source: source.clone(),
            dest: dest.clone(),
            ..RsyncClone::default()
        })),
        Kind::Link { target, link_path } => Some(Box::new(Link {
            target: target.clone(),
            link_path: link_path.clone(),
        })),
        Kind::Remove { path } => Some(Box::new(Remove { path: path.clone() })),
        Kind::Sync { dest, .. } => Some(Box::new(Sync { dest: dest.clone() })),
        Kind::Action { .. } | Kind::Group { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir(label: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("instl-fs-actions-test-{label}-{}", std::process::id()));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn copy_file_creates_destination() {
        let dir = tempdir("copy-file");
        let src = dir.join("src.txt");
        std::fs::write(&src, b"hello").unwrap();
        let dst = dir.join("nested").join("dst.txt");

        let mut ctx = Context::new(1);
        let mut action = RsyncClone {
            source: src.display().to_string(),
            dest: dst.display().to_string(),
            prefer_hard_links: false,
            ..RsyncClone::default()
        };
        action.call(&mut ctx).unwrap();

        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hello");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn copy_dir_recurses() {
        let dir = tempdir("copy-dir");
        let src = dir.join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        std::fs::write(src.join("sub").join("b.txt"), b"b").unwrap();
        let dst = dir.join("dst");

        let mut ctx = Context::new(1);
        let mut action = RsyncClone {
            source: src.display().to_string(),
            dest: dst.display().to_string(),
            prefer_hard_links: false,
            ..RsyncClone::default()
        };
        action.call(&mut ctx).unwrap();

        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(dst.join("sub").join("b.txt")).unwrap(), "b");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn copy_skips_file_already_in_place_by_size_and_mtime() {
        let dir = tempdir("copy-skip");
        let src = dir.join("src.txt");
        std::fs::write(&src, b"hello").unwrap();
        let dst = dir.join("dst.txt");
        std::fs::copy(&src, &dst).unwrap();
        let same_mtime = std::fs::metadata(&src).unwrap().modified().unwrap();
        std::fs::File::open(&dst).unwrap().set_modified(same_mtime).unwrap();

        // Make dst read-only so a real copy attempt would fail; the skip
        // check must short-circuit before that would matter.
        let mut perms = std::fs::metadata(&dst).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&dst, perms).unwrap();

        let mut ctx = Context::new(1);
        let mut action = RsyncClone {
            source: src.display().to_string(),
            dest: dst.display().to_string(),
            prefer_hard_links: false,
            ..RsyncClone::default()
        };
        action.call(&mut ctx).unwrap();

        let mut perms = std::fs::metadata(&dst).unwrap().permissions();
        perms.set_readonly(false);
        std::fs::set_permissions(&dst, perms).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn symlink_is_preserved_by_default() {
        let dir = tempdir("copy-symlink");
        let target = dir.join("target.txt");
        std::fs::write(&target, b"hello").unwrap();
        let src_link = dir.join("link");
        std::os::unix::fs::symlink(&target, &src_link).unwrap();
        let dst_link = dir.join("dst-link");

        let mut ctx = Context::new(1);
        let mut action = RsyncClone {
            source: src_link.display().to_string(),
            dest: dst_link.display().to_string(),
            prefer_hard_links: false,
            ..RsyncClone::default()
        };
        action.call(&mut ctx).unwrap();

        let read_back = std::fs::symlink_metadata(&dst_link).unwrap();
        assert!(read_back.file_type().is_symlink());
        assert_eq!(std::fs::read_link(&dst_link).unwrap(), target);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn dangling_symlink_is_skipped_not_an_error() {
        let dir = tempdir("copy-dangling");
        let src_link = dir.join("link");
        std::os::unix::fs::symlink(dir.join("does-not-exist"), &src_link).unwrap();
        let dst_link = dir.join("dst-link");

        let mut ctx = Context::new(1);
        let mut action = RsyncClone {
            source: src_link.display().to_string(),
            dest: dst_link.display().to_string(),
            prefer_hard_links: false,
            ..RsyncClone::default()
        };
        action.call(&mut ctx).unwrap();

        assert!(std::fs::symlink_metadata(&dst_link).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_extraneous_files_removes_stale_destination_entries() {
        let dir = tempdir("copy-delete-extraneous");
        let src = dir.join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("keep.txt"), b"keep").unwrap();
        let dst = dir.join("dst");
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(dst.join("stale.txt"), b"stale").unwrap();

        let mut ctx = Context::new(1);
        let mut action = RsyncClone {
            source: src.display().to_string(),
            dest: dst.display().to_string(),
            prefer_hard_links: false,
            delete_extraneous_files: true,
            ..RsyncClone::default()
        };
        action.call(&mut ctx).unwrap();

        assert!(dst.join("keep.txt").exists());
        assert!(!dst.join("stale.txt").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn remove_missing_path_is_not_an_error() {
        let mut ctx = Context::new(1);
        let mut action = Remove {
            path: "/nonexistent/instl-test-path".into(),
        };
        assert!(action.call(&mut ctx).is_ok());
    }
}
