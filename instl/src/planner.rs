// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Install planner (component D): from a set of main install targets,
//! compute the full transitive install set and partition it by target
//! folder and by sync folder.

use std::collections::{BTreeMap, BTreeSet};

use index::{Database, InstallStatus};
use thiserror::Error;
use varstore::VarStore;

pub const SYNTH_REPAIR: &str = "__REPAIR_INSTALLED_ITEMS__";
pub const SYNTH_UPDATE: &str = "__UPDATE_INSTALLED_ITEMS__";
pub const SYNTH_ALL_ITEMS: &str = "__ALL_ITEMS_IID__";
pub const SYNTH_ALL_GUIDS: &str = "__ALL_GUIDS_IID__";

const SYNTHETIC_NAMES: &[&str] = &[SYNTH_REPAIR, SYNTH_UPDATE, SYNTH_ALL_ITEMS, SYNTH_ALL_GUIDS];

#[derive(Debug, Error)]
pub enum Error {
    #[error("index store")]
    Index(#[from] index::Error),
    #[error("variable store")]
    Var(#[from] varstore::Error),
}

/// The final, deterministic output of a planning pass: every installable
/// item grouped by where its files land.
#[derive(Debug, Default, Clone)]
pub struct InstallPlan {
    pub by_target_folder: BTreeMap<String, Vec<String>>,
    pub by_sync_folder: BTreeMap<String, Vec<String>>,
    pub orphan_targets: Vec<String>,
}

/// Run the full planning algorithm described for the install planner:
/// target parsing, synthetic cohort resolution, status transitions,
/// dependency closure, and folder partitioning. Locks the item/detail
/// tables against further mutation on success.
pub fn plan(db: &Database, vars: &mut VarStore, targets: &[String], ignored_iids: &[String]) -> Result<InstallPlan, Error> {
    let (candidate_iids, candidate_guids): (Vec<String>, Vec<String>) = {
        let (known, maybe_guid) = db.iids_from_iids(targets)?;
        (known, maybe_guid)
    };

    let mut orphans = Vec::new();
    let (guid_iids, guid_orphans) = db.iids_from_guids(&candidate_guids)?;
    orphans.extend(guid_orphans);

    let mut resolved: BTreeSet<String> = candidate_iids.into_iter().collect();
    resolved.extend(guid_iids);

    let mut main_iids: BTreeSet<String> = BTreeSet::new();
    let mut update_iids: BTreeSet<String> = BTreeSet::new();

    for iid in resolved {
        if SYNTHETIC_NAMES.contains(&iid.as_str()) {
            let members = db.get_details_for_active_iids("depends", true, None)?;
            let members: Vec<String> = members.into_iter().filter(|(owner, _)| owner == &iid).map(|(_, v)| v).collect();
            match iid.as_str() {
                SYNTH_REPAIR | SYNTH_ALL_ITEMS | SYNTH_ALL_GUIDS => main_iids.extend(members),
                SYNTH_UPDATE => update_iids.extend(members),
                _ => unreachable!(),
            }
        } else {
            main_iids.insert(iid);
        }
    }

    // Repair (main) wins over update when both reduce to the same IID.
    for iid in &main_iids {
        update_iids.remove(iid);
    }

    let main_list: Vec<String> = main_iids.into_iter().collect();
    let update_list: Vec<String> = update_iids.into_iter().collect();

    let (main_list, main_orphans) = db.iids_from_iids(&main_list)?;
    let (update_list, update_orphans) = db.iids_from_iids(&update_list)?;
    orphans.extend(main_orphans);
    orphans.extend(update_orphans);
    orphans.sort();
    orphans.dedup();

    if !ignored_iids.is_empty() {
        db.set_ignore(ignored_iids)?;
    }

    db.change_status_if(InstallStatus::None, InstallStatus::Main, &main_list)?;
    let main_closure = db.recursive_deps(InstallStatus::Main)?;
    db.change_status_if(InstallStatus::None, InstallStatus::Depend, &main_closure)?;

    db.change_status_if(InstallStatus::None, InstallStatus::Update, &update_list)?;
    let update_closure = db.recursive_deps(InstallStatus::Update)?;
    db.change_status_if(InstallStatus::None, InstallStatus::Depend, &update_closure)?;

    let mut by_target_folder: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut by_sync_folder: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (iid, folder, _tag, direct_sync) in db.target_folders_to_items()? {
        let folder = normalize_path(&folder);
        if direct_sync {
            by_sync_folder.entry(folder).or_default().push(iid);
        } else {
            by_target_folder.entry(folder).or_default().push(iid);
        }
    }

    let sync_root = vars.resolve("LOCAL_REPO_SYNC_DIR", "/").unwrap_or_default();
    for (iid, source_path, _tag) in db.source_folders_to_items_without_target_folders()? {
        let relative_dir = source_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let folder = normalize_path(&format!("{sync_root}/{relative_dir}"));
        by_sync_folder.entry(folder).or_default().push(iid);
    }

    for items in by_target_folder.values_mut().chain(by_sync_folder.values_mut()) {
        items.sort();
        items.dedup();
    }

    let full_list: Vec<String> = by_target_folder
        .values()
        .chain(by_sync_folder.values())
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    vars.set("__FULL_LIST_OF_INSTALL_TARGETS__", full_list, None);
    vars.set("__MAIN_INSTALL_IIDS__", main_list, None);
    vars.set("__MAIN_UPDATE_IIDS__", update_list, None);
    vars.set("__ORPHAN_INSTALL_TARGETS__", orphans.clone(), None);

    db.lock_tables()?;

    Ok(InstallPlan {
        by_target_folder,
        by_sync_folder,
        orphan_targets: orphans,
    })
}

/// Collapse `//` and trailing `/` the way partition keys must be normalised
/// so that two spellings of the same folder never produce two partitions.
fn normalize_path(path: &str) -> String {
    let mut out: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    if out.is_empty() {
        out.push("");
    }
    format!("/{}", out.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::doc::parse;

    fn setup(yaml_index: &str) -> (Database, VarStore) {
        let db = Database::new(":memory:").unwrap();
        let doc = parse(yaml_index).unwrap();
        db.read_index(&doc).unwrap();
        db.resolve_inheritance().unwrap();
        db.activate_all().unwrap();
        db.create_default_items(&[]).unwrap();
        let mut vars = VarStore::new();
        vars.set("LOCAL_REPO_SYNC_DIR", vec!["/var/cache/sync".to_string()], None);
        (db, vars)
    }

    #[test]
    fn simple_install_partitions_by_target_folder() {
        let (db, mut vars) = setup(
            "A:\n  install_folders: [/apps/A]\n  install_sources:\n    - {path: shared/a.bin, tag: \"!file\"}\n",
        );
        let plan = plan(&db, &mut vars, &["A".to_string()], &[]).unwrap();
        assert_eq!(plan.by_target_folder.get("/apps/A"), Some(&vec!["A".to_string()]));
        assert!(plan.orphan_targets.is_empty());
    }

    #[test]
    fn dependency_closure_is_included_as_depend() {
        let (db, mut vars) = setup(
            "A:\n  depends: [B]\n  install_folders: [/apps/A]\n\
             B:\n  depends: [C]\n  install_folders: [/apps/B]\n\
             C:\n  install_folders: [/apps/C]\n",
        );
        let plan = plan(&db, &mut vars, &["A".to_string()], &[]).unwrap();
        let all: Vec<&String> = plan.by_target_folder.values().flatten().collect();
        assert!(all.contains(&&"B".to_string()));
        assert!(all.contains(&&"C".to_string()));
    }

    #[test]
    fn orphan_target_is_reported_not_fatal() {
        let (db, mut vars) = setup("A:\n  install_folders: [/apps/A]\n");
        let plan = plan(&db, &mut vars, &["NOPE".to_string()], &[]).unwrap();
        assert_eq!(plan.orphan_targets, vec!["NOPE".to_string()]);
    }
}
