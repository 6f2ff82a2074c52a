//! Scripting collaborator for local SQLite files.
//!
//! A "server" is a directory and its databases are the files directly inside it that
//! match the configured globs. Files are opened read-only on the calling thread, which
//! the job has already switched to the execution context's identity.

use crate::backup::function_path;
use crate::backup::impersonation::ExecutionContext;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDebugObjectAndFnName, AddFunctionName};
use crate::backup::scripter::{ObjectCategory, SchemaScripter, ScriptedObject, ServerSession};

use bon::Builder;
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobSet, GlobSetBuilder};
use itertools::Itertools;
use rusqlite::{Connection, OpenFlags};
use walkdir::WalkDir;

use std::path::{Path, PathBuf};

const SYSTEM_OBJECT_PREFIX: &str = "sqlite_";

fn default_database_globs() -> Vec<String> {
    vec!["*.db".into(), "*.sqlite".into(), "*.sqlite3".into()]
}

#[derive(Clone, Debug, Builder, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SqliteScripter {
    #[builder(default = default_database_globs(), into)]
    database_globs: Vec<String>,
}

impl Default for SqliteScripter {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SqliteScripter {
    fn globset(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for glob in &self.database_globs {
            builder.add(Glob::new(glob)?);
        }
        Ok(builder.build()?)
    }

    fn list_databases(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let globset = self.globset()?;
        let mut databases = Vec::new();
        for entry in WalkDir::new(dir)
            .follow_links(true)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if globset.is_match(&name) {
                databases.push((name, entry.into_path()));
            } else {
                tracing::trace!("Skipping {:?}, glob not match", entry.path());
            }
        }
        Ok(databases)
    }
}

impl SchemaScripter for SqliteScripter {
    fn connect(&self, server: &str, context: &ExecutionContext) -> Result<Box<dyn ServerSession>> {
        tracing::debug!(
            "Opening {server:?} as {}",
            context.principal().unwrap_or("process identity")
        );
        let dir = PathBuf::from(server);
        if !dir.is_dir() {
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{server:?} is not a directory"),
            )));
        }
        let databases = self
            .list_databases(&dir)
            .add_debug_object_and_fn_name(self.clone(), "connect")?;
        Ok(Box::new(SqliteSession { databases }))
    }
}

struct SqliteSession {
    databases: Vec<(String, PathBuf)>,
}

impl SqliteSession {
    fn open(&self, database: &str) -> Result<Connection> {
        let path = self
            .databases
            .iter()
            .find(|(name, _)| name == database)
            .map(|(_, path)| path)
            .ok_or_else(|| {
                Error::from(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("unknown database {database:?}"),
                ))
            })?;
        Ok(Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }
}

fn is_system_name(name: &str) -> bool {
    name.starts_with(SYSTEM_OBJECT_PREFIX)
}

fn statement(sql: &str) -> String {
    format!("{};", sql.trim_end().trim_end_matches(';'))
}

fn database_options(conn: &Connection, database: &str) -> Result<Vec<ScriptedObject>> {
    let encoding: String = conn.query_row("PRAGMA encoding", [], |row| row.get(0))?;
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let application_id: i64 = conn.query_row("PRAGMA application_id", [], |row| row.get(0))?;
    Ok(vec![ScriptedObject::new(
        database,
        vec![
            format!("PRAGMA encoding = '{encoding}';"),
            format!("PRAGMA page_size = {page_size};"),
            format!("PRAGMA user_version = {user_version};"),
            format!("PRAGMA application_id = {application_id};"),
        ],
    )])
}

fn schema_objects(conn: &Connection, kind: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master WHERE type = ?1 AND sql IS NOT NULL ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([kind], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
    Ok(rows)
}

/// Each table with its indexes and triggers, like a table scripted with its dependents.
fn tables(conn: &Connection) -> Result<Vec<ScriptedObject>> {
    let mut dependents = conn.prepare(
        "SELECT sql FROM sqlite_master \
         WHERE type IN ('index', 'trigger') AND tbl_name = ?1 AND sql IS NOT NULL \
         ORDER BY rowid",
    )?;
    let objects = schema_objects(conn, "table")?
        .into_iter()
        .map(|(name, sql)| -> Result<ScriptedObject> {
            let scripts = std::iter::once(Ok(statement(&sql)))
                .chain(
                    dependents
                        .query_map([&name], |row| row.get::<_, String>(0))?
                        .map_ok(|sql| statement(&sql)),
                )
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ScriptedObject {
                is_system_object: is_system_name(&name),
                name,
                scripts,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(objects)
}

fn views(conn: &Connection) -> Result<Vec<ScriptedObject>> {
    Ok(schema_objects(conn, "view")?
        .into_iter()
        .map(|(name, sql)| ScriptedObject {
            is_system_object: is_system_name(&name),
            name,
            scripts: vec![statement(&sql)],
        })
        .collect())
}

impl ServerSession for SqliteSession {
    fn databases(&self) -> Result<Vec<String>> {
        Ok(self.databases.iter().map(|(name, _)| name.clone()).collect())
    }

    #[named]
    fn script(&self, database: &str, category: ObjectCategory) -> Result<Vec<ScriptedObject>> {
        let conn = self.open(database).add_fn_name(function_path!())?;
        match category {
            ObjectCategory::Database => database_options(&conn, database),
            ObjectCategory::Tables => tables(&conn),
            ObjectCategory::Views => views(&conn),
            _ => Ok(Vec::new()),
        }
        .add_fn_name(function_path!())
    }
}
