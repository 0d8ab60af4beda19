// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Command-line surface: parses arguments, wires the variable store, index
//! store, planner, sync planner, batch accumulator, and executor together.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use fs_err as fs;
use index::Database;
use infomap::InfoMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use varstore::VarStore;

use instl::{batch, download, executor, planner, sync};

#[derive(Debug, Error)]
pub enum Error {
    #[error("read index/require input")]
    Io(#[from] std::io::Error),
    #[error("parse input document")]
    Yaml(#[from] serde_yaml::Error),
    #[error("index store")]
    Index(#[from] index::Error),
    #[error("variable store")]
    Var(#[from] varstore::Error),
    #[error("install planner")]
    Planner(#[from] planner::Error),
    #[error("info-map")]
    InfoMap(#[from] infomap::Error),
    #[error("sync planner")]
    Sync(#[from] sync::Error),
    #[error("download")]
    Download(#[from] download::Error),
    #[error("invalid source URL")]
    Url(#[from] url::ParseError),
    #[error("ignore pattern")]
    Pattern(#[from] fnmatch::Error),
    #[error("execution")]
    Execution(#[from] executor::ExecutionError),
    #[error("prompt")]
    Dialog(#[from] dialoguer::Error),
}

/// Site-wide settings layered vendor-then-admin under `--repo-root`, holding
/// defaults a caller would otherwise have to repeat on every invocation.
#[derive(Debug, Default, Deserialize, Serialize)]
struct SiteConfig {
    /// Default `--source` URL used when an install omits one.
    #[serde(default)]
    source: Option<String>,
    /// Target folder globs excluded from every install's copy section.
    #[serde(default)]
    ignore_patterns: Vec<String>,
}

impl config::Config for SiteConfig {
    fn domain() -> String {
        "instl".into()
    }

    fn merge(self, other: Self) -> Self {
        SiteConfig {
            source: other.source.or(self.source),
            ignore_patterns: self.ignore_patterns.into_iter().chain(other.ignore_patterns).collect(),
        }
    }
}

/// `CARGO_PKG_VERSION`, with the short git commit hash appended when built
/// from a git checkout (set by `build.rs`, absent from e.g. a source tarball).
fn version() -> String {
    match option_env!("GIT_HASH") {
        Some(hash) => format!("{} ({hash})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").into(),
    }
}

#[derive(Parser)]
#[command(name = "instl", version = version(), about = "Install/update orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Where to keep the SQLite index store. Defaults to an in-memory store.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Repository root under which index/require YAML documents live.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and run an install for the given IIDs or GUIDs.
    Install {
        targets: Vec<String>,
        #[arg(long)]
        ignore: Vec<String>,
        /// Base URL of the remote repository to sync from. Omit to skip
        /// syncing and operate purely on what's already in the sync folder.
        #[arg(long)]
        source: Option<Url>,
        /// Target folder glob to exclude from the copy section, on top of
        /// whatever the site config's `ignore_patterns` already excludes.
        #[arg(long)]
        skip_path: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt before executing the batch.
        #[arg(long)]
        yes: bool,
    },
    /// Print the resolved install plan without executing anything.
    Plan { targets: Vec<String> },
    /// Generate a shell completion script on stdout.
    Completions { shell: clap_complete::Shell },
    /// Generate a troff man page on stdout.
    Manpages,
}

pub async fn process() -> Result<(), Error> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "instl", &mut std::io::stdout());
            return Ok(());
        }
        Command::Manpages => {
            clap_mangen::Man::new(Cli::command()).render(&mut std::io::stdout())?;
            return Ok(());
        }
        _ => {}
    }

    let store_url = cli.store.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| ":memory:".to_string());
    let db = Database::new(&store_url)?;

    let index_doc = read_doc(&cli.repo_root.join("index.yaml"))?;
    db.read_index(&index_doc)?;
    if let Some(require_doc) = read_doc_optional(&cli.repo_root.join("require.yaml"))? {
        db.read_require(&require_doc)?;
    }
    db.resolve_inheritance()?;
    db.activate_all()?;
    db.create_default_items(&[])?;

    let mut vars = VarStore::new();
    vars.set_normpath_suffixes(["_DIR".to_string(), "_PATH".to_string()]);
    vars.set("LOCAL_REPO_SYNC_DIR", [cli.repo_root.join("sync").display().to_string()], None);
    vars.set("LOCAL_REPO_BOOKKEEPING_DIR", [cli.repo_root.join("bookkeeping").display().to_string()], None);

    let site_config = config::Manager::new(&cli.repo_root, "instl").load::<SiteConfig>().await.unwrap_or_default();

    match cli.command {
        Command::Plan { targets } => {
            let plan = planner::plan(&db, &mut vars, &targets, &[])?;
            print_plan(&plan);
        }
        Command::Install { targets, ignore, source, skip_path, dry_run, yes } => {
            let plan = planner::plan(&db, &mut vars, &targets, &ignore)?;
            print_plan(&plan);
            if !plan.orphan_targets.is_empty() {
                log::warn!("unresolved install targets: {:?}", plan.orphan_targets);
            }

            let source = match source {
                Some(url) => Some(url),
                None => site_config.source.as_deref().map(Url::parse).transpose()?,
            };
            let skip_patterns = fnmatch::PatternSet::local_and_global(&skip_path, &site_config.ignore_patterns)?;

            let mut batch_acc = batch::BatchAccumulator::new();

            if let Some(source) = &source {
                let sync_plan = resolve_sync_plan(&db, &mut vars, &cli.repo_root, source).await?;
                build_sync_section(&mut batch_acc, &sync_plan);
                if !dry_run {
                    download::fetch_all(source, &sync_plan.downloads).await?;
                    persist_have(&cli.repo_root, &sync_plan.new_have)?;
                }
            }

            let install_sources = db.get_sync_folders_and_sources_for_active_iids()?.into_iter().fold(
                BTreeMap::<String, Vec<String>>::new(),
                |mut map, (iid, path, _tag)| {
                    map.entry(iid).or_default().push(path);
                    map
                },
            );
            build_copy_section(&mut batch_acc, &plan, &install_sources, &skip_patterns, &mut vars)?;

            if dry_run {
                println!("{batch_acc}");
                return Ok(());
            }

            let confirmed = if yes {
                true
            } else {
                dialoguer::Confirm::with_theme(&dialoguer::theme::ColorfulTheme::default())
                    .with_prompt("Proceed with install?")
                    .default(false)
                    .interact()?
            };
            if !confirmed {
                log::warn!("install cancelled");
                return Ok(());
            }

            executor::run(&mut batch_acc, |op| instl::fs_actions::dispatch(&op.kind))?;
        }
        Command::Completions { .. } | Command::Manpages => unreachable!("handled above"),
    }

    Ok(())
}

fn print_plan(plan: &planner::InstallPlan) {
    for (folder, iids) in &plan.by_target_folder {
        println!("{folder}: {}", iids.join(", "));
    }
    for (folder, iids) in &plan.by_sync_folder {
        println!("(direct-sync) {folder}: {}", iids.join(", "));
    }
}

/// Fetch the remote info-map, load whatever `have` map was persisted from a
/// previous run, and reconcile them against the active install set's
/// required sources.
async fn resolve_sync_plan(db: &Database, vars: &mut VarStore, repo_root: &std::path::Path, source: &Url) -> Result<sync::SyncPlan, Error> {
    let info_map_url = source.join("info_map.txt")?;
    let remote_text = reqwest::get(info_map_url).await.map_err(download::Error::from)?.text().await.map_err(download::Error::from)?;
    let mut remote = InfoMap::read(&remote_text)?;

    let have_path = repo_root.join("bookkeeping").join("have.txt");
    let have = match fs::read_to_string(&have_path) {
        Ok(text) => InfoMap::read(&text)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => InfoMap::new(),
        Err(err) => return Err(err.into()),
    };

    let required = db
        .get_sync_folders_and_sources_for_active_iids()?
        .into_iter()
        .unique_by(|(_, path, _)| path.clone())
        .map(|(_folder, path, tag)| sync::RequiredSource {
            path,
            tag: sync::SourceTag::parse(tag.as_deref()),
        })
        .collect::<Vec<_>>();

    let sync_root = vars.resolve("LOCAL_REPO_SYNC_DIR", "/").unwrap_or_default();
    Ok(sync::plan(&mut remote, &have, &required, 0, &sync_root)?)
}

fn persist_have(repo_root: &std::path::Path, have: &InfoMap) -> Result<(), Error> {
    let bookkeeping = repo_root.join("bookkeeping");
    fs::create_dir_all(&bookkeeping)?;
    fs::write(bookkeeping.join("have.txt"), have.write_to_string())?;
    Ok(())
}

fn build_sync_section(batch_acc: &mut batch::BatchAccumulator, plan: &sync::SyncPlan) {
    let mut group = batch::Op::anonymous_group("Sync");
    for download in &plan.downloads {
        group.push(batch::Op::new(batch::Kind::Sync {
            url: download.path.clone(),
            dest: download.dest.clone(),
        }));
    }
    batch_acc.push(batch::Section::Sync, group);
}

fn build_copy_section(
    batch_acc: &mut batch::BatchAccumulator,
    plan: &planner::InstallPlan,
    install_sources: &BTreeMap<String, Vec<String>>,
    skip: &fnmatch::PatternSet,
    vars: &mut VarStore,
) -> Result<(), Error> {
    for (folder, iids) in &plan.by_target_folder {
        if skip.is_match(folder) {
            log::info!("skipping {folder}: matched an ignore pattern");
            continue;
        }
        let mut group = batch::Op::anonymous_group(folder.clone());
        for iid in iids {
            let Some(sources) = install_sources.get(iid) else {
                log::warn!("{iid} has no install_sources, skipping");
                continue;
            };
            for source_path in sources {
                let source = vars.resolve_str(&format!("$(LOCAL_REPO_SYNC_DIR)/{source_path}"))?;
                let basename = source_path.rsplit('/').next().unwrap_or(source_path);
                let dest = format!("{}/{basename}", folder.trim_end_matches('/'));
                group.push(batch::Op::new(batch::Kind::Copy { source, dest }));
            }
        }
        batch_acc.push(batch::Section::Copy, group);
    }
    Ok(())
}

fn read_doc(path: &std::path::Path) -> Result<index::doc::Node, Error> {
    let text = fs::read_to_string(path)?;
    Ok(index::doc::parse(&text)?)
}

fn read_doc_optional(path: &std::path::Path) -> Result<Option<index::doc::Node>, Error> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(index::doc::parse(&text)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
