// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};

use diesel::prelude::*;
use diesel::sql_types::{Integer, Nullable, Text};
use diesel::{Connection as _, RunQueryDsl, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;

use crate::doc::{self, Node};
use crate::schema::{details, items};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const INSTALL_SET_STATUSES: &[i32] = &[1, 2, 3];

/// `install_status` on an [`items`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InstallStatus {
    None = 0,
    Main = 1,
    Update = 2,
    Depend = 3,
    Remove = -1,
}

impl InstallStatus {
    fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("diesel")]
    Diesel(#[from] diesel::result::Error),
    #[error("diesel connection")]
    Connection(#[from] diesel::ConnectionError),
    #[error("diesel migration")]
    Migration(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("cyclic inherit involving {0}")]
    InheritCycle(String),
    #[error("table {0} is locked")]
    LockedTable(String),
}

#[derive(Clone)]
struct Connection(Arc<Mutex<SqliteConnection>>);

impl Connection {
    fn new(connection: SqliteConnection) -> Self {
        Self(Arc::new(Mutex::new(connection)))
    }

    fn exec<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> T) -> T {
        let mut guard = self.0.lock().expect("mutex guard");
        f(&mut guard)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = items)]
struct ItemRow {
    iid: String,
    inherit_resolved: bool,
    from_index: bool,
    from_require: bool,
    install_status: i32,
    ignore: bool,
}

#[derive(Queryable, Insertable, Clone)]
#[diesel(table_name = details)]
struct DetailRow {
    original_iid: String,
    owner_iid: String,
    os_id: String,
    detail_name: String,
    detail_value: String,
    generation: i32,
    tag: Option<String>,
    os_is_active: bool,
}

#[derive(Clone, Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(url: &str) -> Result<Self, Error> {
        let mut conn = SqliteConnection::establish(url)?;
        conn.run_pending_migrations(MIGRATIONS).map_err(Error::Migration)?;
        Ok(Self {
            conn: Connection::new(conn),
        })
    }

    /// Wipe the physical store. Called at the start of each planning pass.
    pub fn wipe(&self) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::delete(details::table).execute(conn)?;
            diesel::delete(items::table).execute(conn)?;
            Ok(())
        })
    }

    fn ensure_item(conn: &mut SqliteConnection, iid: &str, from_index: bool, from_require: bool) -> Result<(), Error> {
        let existing = items::table
            .filter(items::iid.eq(iid))
            .select(items::iid)
            .first::<String>(conn)
            .optional()?;

        if existing.is_some() {
            diesel::update(items::table.filter(items::iid.eq(iid)))
                .set((
                    items::from_index.eq(items::from_index.or::<bool, diesel::sql_types::Bool>(from_index)),
                    items::from_require.eq(items::from_require.or::<bool, diesel::sql_types::Bool>(from_require)),
                ))
                .execute(conn)?;
        } else {
            diesel::insert_into(items::table)
                .values(ItemRow {
                    iid: iid.to_string(),
                    inherit_resolved: false,
                    from_index,
                    from_require,
                    install_status: InstallStatus::None.code(),
                    ignore: false,
                })
                .execute(conn)?;
        }
        Ok(())
    }

    /// Read an index document: IID → item record, with `common` and the six
    /// OS-keyed submaps (`Mac`, `Mac32`, `Mac64`, `Win`, `Win32`, `Win64`).
    pub fn read_index(&self, document: &Node) -> Result<(), Error> {
        self.conn.exec(|conn| {
            for (iid, record) in map_pairs(document) {
                Self::ensure_item(conn, iid, true, false)?;
                read_item_record(conn, iid, record, 0)?;
            }
            Ok(())
        })
    }

    /// Read a require document: IID → `{guid, version, require_by}` or a bare
    /// sequence of `require_by` values. `read_index` must run first: unknown
    /// installer names in `require_by` are only detected once the index's
    /// items are present.
    pub fn read_require(&self, document: &Node) -> Result<(), Error> {
        self.conn.exec(|conn| {
            for (iid, record) in map_pairs(document) {
                Self::ensure_item(conn, iid, false, true)?;

                let require_by_values: Vec<(String, Option<String>)> = match record {
                    Node::Seq(_) => record.scalars(),
                    Node::Map(_) => record.get("require_by").map(Node::scalars).unwrap_or_default(),
                    Node::Scalar(..) => Vec::new(),
                };

                if let Node::Map(_) = record {
                    for (value, _) in record.get("guid").map(Node::scalars).unwrap_or_default() {
                        insert_detail(conn, iid, iid, "common", "guid", &value.to_lowercase(), 0, None)?;
                    }
                    for (value, _) in record.get("version").map(Node::scalars).unwrap_or_default() {
                        insert_detail(conn, iid, iid, "common", "require_version", &value, 0, None)?;
                    }
                }

                for (installer, _) in require_by_values {
                    let known = items::table
                        .filter(items::iid.eq(&installer))
                        .select(items::iid)
                        .first::<String>(conn)
                        .optional()?
                        .is_some();
                    let name = if known { "require_by" } else { "deprecated_require_by" };
                    insert_detail(conn, iid, iid, "common", name, &installer, 0, None)?;
                }
            }
            Ok(())
        })
    }

    /// Resolve `inherit` for every item not yet resolved: copy each
    /// ancestor's resolved detail rows (except `name` and `inherit`) into the
    /// child with `generation + 1`. Cycles are fatal. Missing parents are
    /// reported via the returned warning list but do not abort resolution.
    pub fn resolve_inheritance(&self) -> Result<Vec<String>, Error> {
        self.conn.exec(|conn| {
            let pending: Vec<String> = items::table
                .filter(items::inherit_resolved.eq(false))
                .select(items::iid)
                .load(conn)?;

            let mut warnings = Vec::new();
            for iid in pending {
                let mut visiting = HashSet::new();
                resolve_one(conn, &iid, &mut visiting, &mut warnings)?;
            }
            Ok(warnings)
        })
    }

    /// Set `os_is_active` true for every detail whose `os_id` is `common` or
    /// named in `os_names`, false otherwise.
    pub fn activate(&self, os_names: &[&str]) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::update(details::table)
                .set(details::os_is_active.eq(false))
                .execute(conn)?;

            diesel::update(details::table.filter(details::os_id.eq("common")))
                .set(details::os_is_active.eq(true))
                .execute(conn)?;

            if !os_names.is_empty() {
                diesel::update(details::table.filter(details::os_id.eq_any(os_names)))
                    .set(details::os_is_active.eq(true))
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    pub fn activate_all(&self) -> Result<(), Error> {
        self.conn
            .exec(|conn| diesel::update(details::table).set(details::os_is_active.eq(true)).execute(conn).map(|_| ()))
            .map_err(Error::from)
    }

    /// Translate guids to IIDs via a temporary join table, exactly mirroring
    /// the reference implementation's orphan-detection strategy: every input
    /// guid starts as a row with a null IID, matches are appended, and any
    /// guid left with fewer than two rows never matched.
    pub fn iids_from_guids(&self, guids: &[String]) -> Result<(Vec<String>, Vec<String>), Error> {
        self.conn.exec(|conn| {
            conn.transaction(|conn| {
                diesel::sql_query("CREATE TEMP TABLE guid_to_iid_temp_t (guid TEXT, iid TEXT)").execute(conn)?;

                let unique: HashSet<&String> = guids.iter().collect();
                for guid in &unique {
                    diesel::sql_query("INSERT INTO guid_to_iid_temp_t (guid) VALUES (?)")
                        .bind::<Text, _>(guid.as_str())
                        .execute(conn)?;
                }

                diesel::sql_query(
                    "INSERT INTO guid_to_iid_temp_t (guid, iid) \
                     SELECT details.detail_value, details.owner_iid FROM details \
                     WHERE details.detail_name = 'guid' \
                     AND details.detail_value IN (SELECT guid FROM guid_to_iid_temp_t WHERE iid IS NULL)",
                )
                .execute(conn)?;

                #[derive(QueryableByName)]
                struct GuidRow {
                    #[diesel(sql_type = Text)]
                    guid: String,
                }
                let orphans: Vec<GuidRow> = diesel::sql_query(
                    "SELECT guid FROM guid_to_iid_temp_t GROUP BY guid HAVING count(guid) < 2",
                )
                .load(conn)?;

                #[derive(QueryableByName)]
                struct IidRow {
                    #[diesel(sql_type = Text)]
                    iid: String,
                }
                let translated: Vec<IidRow> =
                    diesel::sql_query("SELECT DISTINCT iid FROM guid_to_iid_temp_t WHERE iid IS NOT NULL ORDER BY iid")
                        .load(conn)?;

                diesel::sql_query("DROP TABLE guid_to_iid_temp_t").execute(conn)?;

                Ok((
                    translated.into_iter().map(|r| r.iid).collect(),
                    orphans.into_iter().map(|r| r.guid).collect(),
                ))
            })
        })
    }

    /// Split `iids` into those that exist in the store and those that don't.
    pub fn iids_from_iids(&self, iids: &[String]) -> Result<(Vec<String>, Vec<String>), Error> {
        self.conn.exec(|conn| {
            let existing: HashSet<String> = items::table
                .filter(items::iid.eq_any(iids))
                .select(items::iid)
                .load::<String>(conn)?
                .into_iter()
                .collect();

            let (found, orphan): (Vec<_>, Vec<_>) = iids.iter().cloned().partition(|iid| existing.contains(iid));
            Ok((found, orphan))
        })
    }

    /// The transitive closure over active `depends` details, starting from
    /// every non-ignored item currently at `status`.
    pub fn recursive_deps(&self, status: InstallStatus) -> Result<Vec<String>, Error> {
        #[derive(QueryableByName)]
        struct IidRow {
            #[diesel(sql_type = Text)]
            iid: String,
        }

        self.conn.exec(|conn| {
            let rows: Vec<IidRow> = diesel::sql_query(
                "WITH RECURSIVE find_dependants(_iid_) AS ( \
                    SELECT iid FROM items WHERE install_status = ? AND ignore = 0 \
                    UNION \
                    SELECT details.detail_value FROM details, find_dependants, items AS owner, items AS target \
                    WHERE details.detail_name = 'depends' \
                    AND details.owner_iid = find_dependants._iid_ \
                    AND details.os_is_active = 1 \
                    AND owner.iid = find_dependants._iid_ \
                    AND owner.ignore = 0 \
                    AND target.iid = details.detail_value \
                    AND target.ignore = 0 \
                 ) SELECT _iid_ AS iid FROM find_dependants",
            )
            .bind::<Integer, _>(status.code())
            .load(conn)?;
            Ok(rows.into_iter().map(|r| r.iid).collect())
        })
    }

    pub fn change_status_if(&self, old: InstallStatus, new: InstallStatus, iids: &[String]) -> Result<(), Error> {
        if iids.is_empty() {
            return Ok(());
        }
        self.conn.exec(|conn| {
            diesel::update(
                items::table
                    .filter(items::iid.eq_any(iids))
                    .filter(items::install_status.eq(old.code()))
                    .filter(items::ignore.eq(false)),
            )
            .set(items::install_status.eq(new.code()))
            .execute(conn)
            .map(|_| ())
            .map_err(Error::from)
        })
    }

    pub fn change_status(&self, new: InstallStatus, iids: &[String]) -> Result<(), Error> {
        if iids.is_empty() {
            return Ok(());
        }
        self.conn.exec(|conn| {
            diesel::update(items::table.filter(items::iid.eq_any(iids)).filter(items::ignore.eq(false)))
                .set(items::install_status.eq(new.code()))
                .execute(conn)
                .map(|_| ())
                .map_err(Error::from)
        })
    }

    pub fn set_ignore(&self, iids: &[String]) -> Result<(), Error> {
        if iids.is_empty() {
            return Ok(());
        }
        self.conn.exec(|conn| {
            diesel::update(items::table.filter(items::iid.eq_any(iids)))
                .set(items::ignore.eq(true))
                .execute(conn)
                .map(|_| ())
                .map_err(Error::from)
        })
    }

    /// Build the four synthetic items: `__ALL_ITEMS_IID__`, `__ALL_GUIDS_IID__`,
    /// `__REPAIR_INSTALLED_ITEMS__`, `__UPDATE_INSTALLED_ITEMS__`.
    pub fn create_default_items(&self, ignored: &[String]) -> Result<(), Error> {
        self.conn.exec(|conn| {
            let all_iids: Vec<String> = items::table.select(items::iid).load(conn)?;
            Self::insert_synthetic(conn, "__ALL_ITEMS_IID__", &all_iids, ignored)?;

            let guid_owners: Vec<String> = details::table
                .filter(details::detail_name.eq("guid"))
                .select(details::owner_iid)
                .distinct()
                .load(conn)?;
            Self::insert_synthetic(conn, "__ALL_GUIDS_IID__", &guid_owners, ignored)?;

            let installed: Vec<String> = items::table.filter(items::from_require.eq(true)).select(items::iid).load(conn)?;
            Self::insert_synthetic(conn, "__REPAIR_INSTALLED_ITEMS__", &installed, ignored)?;

            #[derive(QueryableByName)]
            struct IidRow {
                #[diesel(sql_type = Text)]
                iid: String,
            }
            let stale: Vec<IidRow> = diesel::sql_query(
                "SELECT items.iid AS iid FROM items \
                 JOIN details AS req ON req.owner_iid = items.iid AND req.detail_name = 'require_version' \
                 JOIN details AS idx ON idx.owner_iid = items.iid AND idx.detail_name = 'version' \
                 WHERE items.from_require = 1 AND req.detail_value <> idx.detail_value",
            )
            .load(conn)?;
            Self::insert_synthetic(
                conn,
                "__UPDATE_INSTALLED_ITEMS__",
                &stale.into_iter().map(|r| r.iid).collect::<Vec<_>>(),
                ignored,
            )?;

            Ok(())
        })
    }

    fn insert_synthetic(conn: &mut SqliteConnection, name: &str, depends_on: &[String], ignored: &[String]) -> Result<(), Error> {
        diesel::insert_into(items::table)
            .values(ItemRow {
                iid: name.to_string(),
                inherit_resolved: true,
                from_index: false,
                from_require: false,
                install_status: InstallStatus::None.code(),
                ignore: ignored.iter().any(|i| i == name),
            })
            .execute(conn)?;

        for depends in depends_on {
            insert_detail(conn, name, name, "common", "depends", depends, 0, None)?;
        }
        Ok(())
    }

    /// `(iid, install_folder, tag, direct_sync)` for all active, non-ignored,
    /// installable items.
    pub fn target_folders_to_items(&self) -> Result<Vec<(String, String, Option<String>, bool)>, Error> {
        self.conn.exec(|conn| {
            let rows: Vec<(String, String, Option<String>)> = details::table
                .inner_join(items::table.on(items::iid.eq(details::owner_iid)))
                .filter(details::detail_name.eq("install_folders"))
                .filter(details::os_is_active.eq(true))
                .filter(items::ignore.eq(false))
                .filter(items::install_status.eq_any(INSTALL_SET_STATUSES))
                .select((details::owner_iid, details::detail_value, details::tag))
                .load(conn)?;

            rows.into_iter()
                .map(|(iid, folder, tag)| {
                    let direct_sync = Self::direct_sync_flag(conn, &iid)?;
                    Ok((iid, folder, tag, direct_sync))
                })
                .collect()
        })
    }

    fn direct_sync_flag(conn: &mut SqliteConnection, iid: &str) -> Result<bool, Error> {
        let value: Option<String> = details::table
            .filter(details::owner_iid.eq(iid))
            .filter(details::detail_name.eq("direct_sync"))
            .filter(details::os_is_active.eq(true))
            .select(details::detail_value)
            .first(conn)
            .optional()?;
        Ok(matches!(value.as_deref(), Some("1") | Some("true") | Some("yes")))
    }

    /// Items with `install_sources` but no `install_folders` (icon-like, sync-only).
    pub fn source_folders_to_items_without_target_folders(&self) -> Result<Vec<(String, String, Option<String>)>, Error> {
        self.conn.exec(|conn| {
            diesel::sql_query(
                "SELECT src.owner_iid AS iid, src.detail_value AS detail_value, src.tag AS tag FROM details AS src \
                 JOIN items ON items.iid = src.owner_iid \
                 WHERE src.detail_name = 'install_sources' AND src.os_is_active = 1 \
                 AND items.ignore = 0 AND items.install_status IN (1, 2, 3) \
                 AND NOT EXISTS ( \
                    SELECT 1 FROM details AS folders \
                    WHERE folders.owner_iid = src.owner_iid \
                    AND folders.detail_name = 'install_folders' \
                 )",
            )
            .load::<SourceRow>(conn)
            .map(|rows| rows.into_iter().map(|r| (r.iid, r.detail_value, r.tag)).collect())
            .map_err(Error::from)
        })
    }

    /// `(iid, install_sources path, tag)` for every active, installable item.
    pub fn get_sync_folders_and_sources_for_active_iids(&self) -> Result<Vec<(String, String, Option<String>)>, Error> {
        self.get_details_and_tag_for_active_iids("install_sources")
    }

    pub fn get_details_for_active_iids(&self, name: &str, unique: bool, limit: Option<i64>) -> Result<Vec<(String, String)>, Error> {
        self.conn.exec(|conn| {
            let mut query = details::table
                .inner_join(items::table.on(items::iid.eq(details::owner_iid)))
                .filter(details::detail_name.eq(name))
                .filter(details::os_is_active.eq(true))
                .filter(items::ignore.eq(false))
                .select((details::owner_iid, details::detail_value))
                .into_boxed();

            if let Some(limit) = limit {
                query = query.limit(limit);
            }

            let rows: Vec<(String, String)> = query.load(conn)?;
            if unique {
                let mut seen = HashSet::new();
                Ok(rows.into_iter().filter(|r| seen.insert(r.clone())).collect())
            } else {
                Ok(rows)
            }
        })
    }

    pub fn get_details_and_tag_for_active_iids(&self, name: &str) -> Result<Vec<(String, String, Option<String>)>, Error> {
        self.conn.exec(|conn| {
            details::table
                .inner_join(items::table.on(items::iid.eq(details::owner_iid)))
                .filter(details::detail_name.eq(name))
                .filter(details::os_is_active.eq(true))
                .filter(items::ignore.eq(false))
                .select((details::owner_iid, details::detail_value, details::tag))
                .load(conn)
                .map_err(Error::from)
        })
    }

    /// Forbid INSERT/UPDATE/DELETE on `items` and `details` until [`Database::unlock_tables`].
    pub fn lock_tables(&self) -> Result<(), Error> {
        self.conn.exec(|conn| {
            for table in ["items", "details"] {
                for (op, verb) in [("INSERT", "INSERTs"), ("UPDATE", "UPDATEs"), ("DELETE", "DELETEs")] {
                    let sql = format!(
                        "CREATE TRIGGER IF NOT EXISTS lock_{op}_{table} BEFORE {op} ON {table} \
                         BEGIN SELECT RAISE(ABORT, '{table} is locked, no {verb}'); END"
                    );
                    diesel::sql_query(sql).execute(conn)?;
                }
            }
            Ok(())
        })
    }

    pub fn unlock_tables(&self) -> Result<(), Error> {
        self.conn.exec(|conn| {
            for table in ["items", "details"] {
                for op in ["INSERT", "UPDATE", "DELETE"] {
                    diesel::sql_query(format!("DROP TRIGGER IF EXISTS lock_{op}_{table}")).execute(conn)?;
                }
            }
            Ok(())
        })
    }
}

#[derive(QueryableByName)]
struct SourceRow {
    #[diesel(sql_type = Text)]
    iid: String,
    #[diesel(sql_type = Text)]
    detail_value: String,
    #[diesel(sql_type = Nullable<Text>)]
    tag: Option<String>,
}

fn map_pairs(document: &Node) -> Vec<(&str, &Node)> {
    match document {
        Node::Map(pairs) => pairs.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        _ => Vec::new(),
    }
}

const STRUCTURAL_KEYS: &[&str] = &[
    "name",
    "guid",
    "install_sources",
    "install_folders",
    "inherit",
    "previous_sources",
    "info_map",
    "version",
    "phantom_version",
    "direct_sync",
    "remark",
    "Mac",
    "Mac32",
    "Mac64",
    "Win",
    "Win32",
    "Win64",
];

fn read_item_record(conn: &mut SqliteConnection, iid: &str, record: &Node, _depth: u32) -> Result<(), Error> {
    read_item_record_os(conn, iid, record, "common")
}

fn read_item_record_os(conn: &mut SqliteConnection, iid: &str, record: &Node, os_id: &str) -> Result<(), Error> {
    let Node::Map(pairs) = record else { return Ok(()) };

    for (key, value) in pairs {
        match key.as_str() {
            "name" if os_id == "common" => {
                // `name` is authored but never copied to inheritors; we still
                // record it so lookups by name work before inheritance.
                if let Some(name) = value.as_str() {
                    insert_detail(conn, iid, iid, os_id, "name", name, 0, None)?;
                }
            }
            "guid" => {
                for (v, _) in value.scalars() {
                    insert_detail(conn, iid, iid, os_id, "guid", &v.to_lowercase(), 0, None)?;
                }
            }
            "install_sources" => {
                for (path, tag) in value.scalars() {
                    insert_install_source(conn, iid, os_id, &path, tag.as_deref())?;
                }
            }
            "inherit" if os_id == "common" => {
                for (v, _) in value.scalars() {
                    insert_detail(conn, iid, iid, os_id, "inherit", &v, 0, None)?;
                }
            }
            "Mac" | "Mac32" | "Mac64" | "Win" | "Win32" | "Win64" if os_id == "common" => {
                read_item_record_os(conn, iid, value, key)?;
            }
            _ => {
                for (v, _) in value.scalars() {
                    insert_detail(conn, iid, iid, os_id, key, &v, 0, None)?;
                }
            }
        }
    }
    Ok(())
}

/// `install_sources` expansion: absolute paths are stored verbatim (leading
/// `/` stripped); relative paths materialise once per OS group the `os_id`
/// belongs to, prefixed with that group's name.
fn insert_install_source(conn: &mut SqliteConnection, iid: &str, os_id: &str, path: &str, tag: Option<&str>) -> Result<(), Error> {
    let tag = Some(tag.unwrap_or("!dir").to_string());

    if let Some(stripped) = path.strip_prefix('/') {
        insert_detail(conn, iid, iid, os_id, "install_sources", stripped, 0, tag)?;
        return Ok(());
    }

    let mut wrote_any = false;
    if doc::MAC_GROUP.contains(&os_id) {
        let value = format!("Mac/{path}");
        insert_detail(conn, iid, iid, os_id, "install_sources", &value, 0, tag.clone())?;
        wrote_any = true;
    }
    if doc::WIN_GROUP.contains(&os_id) {
        let value = format!("Win/{path}");
        insert_detail(conn, iid, iid, os_id, "install_sources", &value, 0, tag.clone())?;
        wrote_any = true;
    }
    if !wrote_any {
        insert_detail(conn, iid, iid, os_id, "install_sources", path, 0, tag)?;
    }
    Ok(())
}

fn insert_detail(
    conn: &mut SqliteConnection,
    original_iid: &str,
    owner_iid: &str,
    os_id: &str,
    detail_name: &str,
    detail_value: &str,
    generation: i32,
    tag: Option<String>,
) -> Result<(), Error> {
    diesel::insert_into(details::table)
        .values(DetailRow {
            original_iid: original_iid.to_string(),
            owner_iid: owner_iid.to_string(),
            os_id: os_id.to_string(),
            detail_name: detail_name.to_string(),
            detail_value: detail_value.to_string(),
            generation,
            tag,
            os_is_active: os_id == "common",
        })
        .execute(conn)?;
    Ok(())
}

fn resolve_one(conn: &mut SqliteConnection, iid: &str, visiting: &mut HashSet<String>, warnings: &mut Vec<String>) -> Result<(), Error> {
    let already_resolved: bool = items::table
        .filter(items::iid.eq(iid))
        .select(items::inherit_resolved)
        .first(conn)
        .optional()?
        .unwrap_or(true);
    if already_resolved {
        return Ok(());
    }

    if !visiting.insert(iid.to_string()) {
        return Err(Error::InheritCycle(iid.to_string()));
    }

    let parents: Vec<String> = details::table
        .filter(details::owner_iid.eq(iid))
        .filter(details::detail_name.eq("inherit"))
        .select(details::detail_value)
        .load(conn)?;

    for parent in &parents {
        let exists: bool = items::table
            .filter(items::iid.eq(parent))
            .select(items::iid)
            .first::<String>(conn)
            .optional()?
            .is_some();
        if !exists {
            warnings.push(format!("{iid} inherits from unknown item {parent}"));
            continue;
        }

        resolve_one(conn, parent, visiting, warnings)?;

        let parent_details: Vec<DetailRow> = details::table
            .filter(details::owner_iid.eq(parent))
            .filter(details::detail_name.ne("name"))
            .filter(details::detail_name.ne("inherit"))
            .select((
                details::original_iid,
                details::owner_iid,
                details::os_id,
                details::detail_name,
                details::detail_value,
                details::generation,
                details::tag,
                details::os_is_active,
            ))
            .load(conn)?;

        for row in parent_details {
            diesel::insert_into(details::table)
                .values(DetailRow {
                    original_iid: row.original_iid,
                    owner_iid: iid.to_string(),
                    os_id: row.os_id,
                    detail_name: row.detail_name,
                    detail_value: row.detail_value,
                    generation: row.generation + 1,
                    tag: row.tag,
                    os_is_active: row.os_is_active,
                })
                .execute(conn)?;
        }
    }

    visiting.remove(iid);
    diesel::update(items::table.filter(items::iid.eq(iid)))
        .set(items::inherit_resolved.eq(true))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::parse;

    fn seeded_db(yaml: &str) -> Database {
        let db = Database::new(":memory:").unwrap();
        let doc = parse(yaml).unwrap();
        db.read_index(&doc).unwrap();
        db
    }

    #[test]
    fn read_index_creates_items_and_common_details() {
        let db = seeded_db(
            "A:\n  name: Item A\n  install_folders: [/apps/A]\n  install_sources:\n    - {path: shared/a.bin, tag: \"!file\"}\n",
        );
        let (found, orphan) = db.iids_from_iids(&["A".to_string()]).unwrap();
        assert_eq!(found, vec!["A".to_string()]);
        assert!(orphan.is_empty());
    }

    #[test]
    fn os_group_relative_source_expands_to_both_prefixes() {
        let db = seeded_db("A:\n  install_sources:\n    - {path: bits/a, tag: \"!file\"}\n");
        db.activate_all().unwrap();
        let rows = db.get_details_and_tag_for_active_iids("install_sources").unwrap();
        let paths: Vec<&str> = rows.iter().map(|(_, v, _)| v.as_str()).collect();
        assert!(paths.contains(&"Mac/bits/a"));
        assert!(paths.contains(&"Win/bits/a"));
    }

    #[test]
    fn absolute_source_path_is_stored_verbatim_without_leading_slash() {
        let db = seeded_db("A:\n  install_sources:\n    - {path: /abs/path, tag: \"!file\"}\n");
        db.activate_all().unwrap();
        let rows = db.get_details_and_tag_for_active_iids("install_sources").unwrap();
        assert_eq!(rows[0].1, "abs/path");
    }

    #[test]
    fn inheritance_copies_parent_details_with_incremented_generation() {
        let db = seeded_db(
            "Base:\n  install_folders: [/apps/base]\n\
             Child:\n  inherit: [Base]\n",
        );
        db.resolve_inheritance().unwrap();
        db.activate_all().unwrap();
        let rows = db.get_details_for_active_iids("install_folders", false, None).unwrap();
        assert!(rows.iter().any(|(iid, v)| iid == "Child" && v == "/apps/base"));
    }

    #[test]
    fn dependency_closure_promotes_reachable_items() {
        let db = seeded_db(
            "A:\n  depends: [B]\n\
             B:\n  depends: [C]\n\
             C:\n  name: leaf\n",
        );
        db.activate_all().unwrap();
        db.change_status_if(InstallStatus::None, InstallStatus::Main, &["A".to_string()]).unwrap();
        let closure = db.recursive_deps(InstallStatus::Main).unwrap();
        assert!(closure.contains(&"B".to_string()));
        assert!(closure.contains(&"C".to_string()));
    }

    #[test]
    fn dependency_closure_excludes_ignored_items_and_their_dependants() {
        let db = seeded_db(
            "A:\n  depends: [B]\n\
             B:\n  depends: [C]\n\
             C:\n  name: leaf\n",
        );
        db.activate_all().unwrap();
        db.set_ignore(&["B".to_string()]).unwrap();
        db.change_status_if(InstallStatus::None, InstallStatus::Main, &["A".to_string()]).unwrap();
        let closure = db.recursive_deps(InstallStatus::Main).unwrap();
        assert!(!closure.contains(&"B".to_string()));
        assert!(!closure.contains(&"C".to_string()));
    }

    #[test]
    fn locked_tables_reject_mutation() {
        let db = seeded_db("A:\n  name: a\n");
        db.lock_tables().unwrap();
        let err = db.set_ignore(&["A".to_string()]);
        assert!(err.is_err());
        db.unlock_tables().unwrap();
        db.set_ignore(&["A".to_string()]).unwrap();
    }

    #[test]
    fn guid_translation_reports_orphans() {
        let db = seeded_db("A:\n  guid: GUID-1\n");
        let (found, orphan) = db.iids_from_guids(&["guid-1".to_string(), "guid-missing".to_string()]).unwrap();
        assert_eq!(found, vec!["A".to_string()]);
        assert_eq!(orphan, vec!["guid-missing".to_string()]);
    }

    #[test]
    fn create_default_items_builds_all_items_cohort() {
        let db = seeded_db("A:\n  name: a\nB:\n  name: b\n");
        db.create_default_items(&[]).unwrap();
        db.activate_all().unwrap();
        let rows = db.get_details_for_active_iids("depends", false, None).unwrap();
        let all_items_deps: Vec<&str> = rows
            .iter()
            .filter(|(iid, _)| iid == "__ALL_ITEMS_IID__")
            .map(|(_, v)| v.as_str())
            .collect();
        assert!(all_items_deps.contains(&"A"));
        assert!(all_items_deps.contains(&"B"));
    }
}
