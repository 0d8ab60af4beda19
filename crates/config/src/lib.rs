// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Vendor/admin YAML configuration layering: a base file plus an optional
//! `.d/` override directory, merged vendor-then-admin so site-local files win.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{fs, io};
use tokio_stream::wrappers::ReadDirStream;

const EXTENSION: &str = "yaml";

/// A configuration domain mergeable across layered files, most-specific last.
pub trait Config: DeserializeOwned {
    fn domain() -> String;

    fn merge(self, other: Self) -> Self;
}

#[derive(Debug, Clone)]
pub struct Manager {
    program: String,
    root: PathBuf,
}

impl Manager {
    pub fn new(root: impl Into<PathBuf>, program: impl ToString) -> Self {
        Self {
            program: program.to_string(),
            root: root.into(),
        }
    }

    /// Load and merge every layer for `T`: vendor base, vendor `.d/`, admin
    /// base, admin `.d/`, in that order so admin overrides vendor.
    pub async fn load<T: Config>(&self) -> Option<T> {
        let domain = T::domain();

        let mut configs = vec![];

        let searches = [
            (Entry::File, Base::Vendor),
            (Entry::Directory, Base::Vendor),
            (Entry::File, Base::Admin),
            (Entry::Directory, Base::Admin),
        ];

        for (entry, base) in searches {
            let search = Search { root: &self.root, base };
            for path in enumerate_paths(entry, search, &self.program, &domain).await {
                if let Some(config) = read_config(path).await {
                    configs.push(config);
                }
            }
        }

        configs.into_iter().reduce(T::merge)
    }

    /// Persist `config` as a named admin-scope override file.
    pub async fn save<T: Config + Serialize>(&self, name: impl fmt::Display, config: &T) -> Result<(), SaveError> {
        let domain = T::domain();

        let search = Search {
            root: &self.root,
            base: Base::Admin,
        };
        let dir = search.dir(&self.program, &domain);

        fs::create_dir_all(&dir).await.map_err(|io| SaveError::CreateDir(dir.clone(), io))?;

        let path = dir.join(format!("{name}.{EXTENSION}"));

        let serialized = serde_yaml::to_string(config)?;

        fs::write(&path, serialized).await.map_err(|io| SaveError::Write(path, io))?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("create config dir {0:?}")]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("serialize config")]
    Yaml(#[from] serde_yaml::Error),
    #[error("write config file {0:?}")]
    Write(PathBuf, #[source] io::Error),
}

async fn enumerate_paths(entry: Entry, search: Search<'_>, program: &str, domain: &str) -> Vec<PathBuf> {
    match entry {
        Entry::File => {
            let file = search.file(program, domain);

            if file.exists() {
                vec![file]
            } else {
                vec![]
            }
        }
        Entry::Directory => {
            if let Ok(read_dir) = fs::read_dir(search.dir(program, domain)).await {
                ReadDirStream::new(read_dir)
                    .filter_map(|entry| async {
                        let entry = entry.ok()?;
                        let path = entry.path();
                        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();

                        if path.exists() && extension == EXTENSION {
                            Some(path)
                        } else {
                            None
                        }
                    })
                    .collect()
                    .await
            } else {
                vec![]
            }
        }
    }
}

async fn read_config<T: Config>(path: PathBuf) -> Option<T> {
    let bytes = fs::read(path).await.ok()?;
    serde_yaml::from_slice(&bytes).ok()
}

#[derive(Clone, Copy)]
enum Base {
    Admin,
    Vendor,
}

impl Base {
    fn path(&self) -> &'static str {
        match self {
            Base::Admin => "etc",
            Base::Vendor => "usr/share",
        }
    }
}

enum Entry {
    File,
    Directory,
}

struct Search<'a> {
    root: &'a Path,
    base: Base,
}

impl<'a> Search<'a> {
    fn file(&self, program: &str, domain: &str) -> PathBuf {
        self.root
            .join(self.base.path())
            .join(program)
            .join(format!("{domain}.{EXTENSION}"))
    }

    fn dir(&self, program: &str, domain: &str) -> PathBuf {
        self.root.join(self.base.path()).join(program).join(format!("{domain}.d"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    impl Config for Sample {
        fn domain() -> String {
            "sample".into()
        }

        fn merge(self, other: Self) -> Self {
            other
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir();
        let manager = Manager::new(&dir, "instl");
        manager.save("local", &Sample { value: 7 }).await.unwrap();

        let loaded: Sample = manager.load().await.unwrap();
        assert_eq!(loaded, Sample { value: 7 });

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> PathBuf {
        let path = std::env::temp_dir().join(format!("instl-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}
