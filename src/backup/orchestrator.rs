use crate::backup::function_path;
use crate::backup::impersonation::{ExecutionContext, ImpersonationHandle, LogonProvider};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::sanitize::{safe_join, PathStyle};
use crate::backup::scheduler::{Job, JobScheduler};
use crate::backup::scripter::{ObjectCategory, SchemaScripter, ScriptedObject, ServerSession};
use crate::backup::settings::BackupSettings;
use crate::backup::writer::{category_file_name, write_category};

use function_name::named;
use itertools::Itertools;
use validator::Validate;

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;

/// What one server job did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerReport {
    pub server: String,
    pub connected: bool,
    /// Directories written, one per database.
    pub backed_up: Vec<PathBuf>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl ServerReport {
    fn new<S: Into<String>>(server: S) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }
}

/// Aggregate of every server report, in configured server order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub servers: Vec<ServerReport>,
}

impl RunSummary {
    pub fn databases_backed_up(&self) -> usize {
        self.servers.iter().map(|s| s.backed_up.len()).sum()
    }

    pub fn databases_failed(&self) -> usize {
        self.servers.iter().map(|s| s.failed.len()).sum()
    }

    pub fn unreachable_servers(&self) -> Vec<&str> {
        self.servers
            .iter()
            .filter(|s| !s.connected)
            .map(|s| s.server.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.databases_failed() == 0 && self.unreachable_servers().is_empty()
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} servers, {} databases backed up, {} failed",
            self.servers.len(),
            self.databases_backed_up(),
            self.databases_failed()
        )?;
        let unreachable = self.unreachable_servers();
        if !unreachable.is_empty() {
            write!(f, ", unreachable: {}", unreachable.iter().join(", "))?;
        }
        Ok(())
    }
}

/// Runs one backup over every configured server.
pub struct BackupOrchestrator<S, L> {
    settings: Arc<BackupSettings>,
    scripter: Arc<S>,
    logon: L,
    path_style: PathStyle,
}

impl<S: SchemaScripter + 'static, L: LogonProvider> BackupOrchestrator<S, L> {
    pub fn new(settings: BackupSettings, scripter: S, logon: L) -> Self {
        Self {
            settings: Arc::new(settings),
            scripter: Arc::new(scripter),
            logon,
            path_style: PathStyle::native(),
        }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Validates, optionally impersonates, then fans out one job per server and waits.
    ///
    /// Only configuration, credential and backup root problems fail the run; per-server
    /// and per-database failures end up in the summary. Each job enters the execution
    /// context on its own worker thread for its whole body.
    pub fn run(&self) -> Result<RunSummary> {
        self.settings
            .validate()
            .map_err(Error::from)
            .add_msg("Settings validation failed")?;

        let mut impersonation = match self.settings.credentials() {
            Some(credentials) => Some(ImpersonationHandle::begin(&self.logon, credentials)?),
            None => None,
        };
        let context = impersonation
            .as_ref()
            .map(ImpersonationHandle::context)
            .unwrap_or_else(ExecutionContext::process);

        let root = self.settings.backup_root();
        std::fs::create_dir_all(root)
            .map_err(|source| Error::FileSystem {
                path: root.clone(),
                source,
            })
            .add_msg("Cannot create backup root")?;

        let scheduler = JobScheduler::new(self.settings.max_concurrency())?;
        let (report_tx, report_rx) = channel();
        let jobs = self
            .settings
            .servers()
            .iter()
            .map(|server| self.server_job(server, &context, report_tx.clone()))
            .collect_vec();
        drop(report_tx);

        scheduler.run_all(jobs);

        if let Some(handle) = impersonation.as_mut() {
            // The summary is returned even when reverting fails.
            if let Err(e) = handle.end() {
                tracing::error!("Backup finished but reverting impersonation failed:\n{e}");
            }
        }

        let mut reports: Vec<ServerReport> = report_rx.into_iter().collect();
        let order = self.settings.servers();
        reports.sort_by_key(|r| order.iter().position(|s| *s == r.server));
        let summary = RunSummary { servers: reports };
        tracing::info!("Backup finished: {summary}");
        Ok(summary)
    }

    fn server_job(&self, server: &str, context: &ExecutionContext, report_tx: Sender<ServerReport>) -> Job {
        let settings = self.settings.clone();
        let scripter = self.scripter.clone();
        let context = context.clone();
        let path_style = self.path_style;
        let server = server.to_string();
        Job::new(server.clone(), move || {
            let mut report = ServerReport::new(&server);
            let result = context.enter().and_then(|_identity| {
                backup_server(&settings, scripter.as_ref(), &context, path_style, &mut report)
            });
            match (result, report_tx.send(report).map_err(Error::from)) {
                (Err(e), Err(send_error)) => Err(e.chain(send_error)),
                (result, sent) => result.and(sent),
            }
        })
    }
}

/// Backs up every matching database of one server, recording progress in `report`.
///
/// A failing database is logged, recorded and skipped; the combined errors are
/// returned once every database was attempted. A credential or configuration failure
/// while scripting stops the remaining databases of this server.
pub fn backup_server<S: SchemaScripter + ?Sized>(
    settings: &BackupSettings,
    scripter: &S,
    context: &ExecutionContext,
    path_style: PathStyle,
    report: &mut ServerReport,
) -> Result<()> {
    let server = report.server.clone();
    let session = scripter
        .connect(&server, context)
        .and_then(|session| session.databases().map(|dbs| (session, dbs)))
        .map_err(|e| Error::ServerConnection {
            server: server.clone(),
            source: Box::new(e),
        });
    let (session, databases) = session?;
    report.connected = true;

    let mut errors = Vec::new();
    for database in databases {
        if !settings.should_back_up(&database) {
            tracing::debug!("Skipping {server}.{database}, filtered out");
            report.skipped.push(database);
            continue;
        }

        match backup_database(settings, session.as_ref(), path_style, &server, &database) {
            Ok(dir) => report.backed_up.push(dir),
            // Identity or configuration problems would repeat for every remaining database.
            Err(e) if matches!(&e, Error::DatabaseScripting { source, .. } if source.is_fatal()) => {
                tracing::error!("Backup of {server}.{database} failed, giving up on {server}");
                report.failed.push(database);
                errors.push(e);
                break;
            }
            Err(e) => {
                tracing::warn!("Backup of {server}.{database} failed, continuing");
                report.failed.push(database);
                errors.push(e);
            }
        }
    }

    convert_error_vec(errors)
}

/// Writes the numbered category files of one database and returns its directory.
#[named]
pub fn backup_database(
    settings: &BackupSettings,
    session: &dyn ServerSession,
    path_style: PathStyle,
    server: &str,
    database: &str,
) -> Result<PathBuf> {
    let root = settings.backup_root().to_string_lossy();
    let dir = safe_join(&root, &[server, database], path_style)?;
    std::fs::create_dir_all(&dir).map_err(|source| Error::FileSystem {
        path: dir.clone(),
        source,
    })?;

    for (sequence, category) in (1..).zip(ObjectCategory::ALL) {
        tracing::info!("{server}.{database}.{category}");
        let objects = session
            .script(database, category)
            .map_err(|e| Error::DatabaseScripting {
                server: server.into(),
                database: database.into(),
                category,
                source: Box::new(e),
            })?;

        let file_name = category_file_name(sequence, category);
        let dir_str = dir.to_string_lossy();
        let path = safe_join(&dir_str, &[file_name], path_style)?;
        write_file(&path, database, category, &objects).add_fn_name(function_path!())?;
    }

    Ok(dir)
}

fn write_file(
    path: &Path,
    database: &str,
    category: ObjectCategory,
    objects: &[ScriptedObject],
) -> Result<()> {
    let to_fs_error = |source| Error::FileSystem {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = File::create(path).map(BufWriter::new).map_err(to_fs_error)?;
    let written = write_category(&mut writer, database, category, objects).map_err(to_fs_error)?;
    writer.flush().map_err(to_fs_error)?;
    tracing::trace!("Wrote {written} objects to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::filter::NamePattern;
    use crate::backup::impersonation::tests::{CountingToken, FakeLogonProvider};
    use crate::backup::impersonation::IdentityToken;
    use crate::backup::scripter::sqlite::tests::create_database;
    use crate::backup::scripter::sqlite::SqliteScripter;
    use crate::backup::settings::Credentials;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory servers: server -> databases.
    ///
    /// A `broken` database fails on Tables; a `denied` one fails with a credential error.
    /// With a watched token, every call made off the impersonated thread is counted.
    #[derive(Default)]
    struct FakeScripter {
        servers: HashMap<String, Vec<String>>,
        connections: AtomicUsize,
        principals: Mutex<Vec<Option<String>>>,
        watched_token: Option<Arc<CountingToken>>,
        calls_without_identity: Arc<AtomicUsize>,
    }

    impl FakeScripter {
        fn with(servers: &[(&str, &[&str])]) -> Self {
            Self {
                servers: servers
                    .iter()
                    .map(|(s, dbs)| (s.to_string(), dbs.iter().map(|d| d.to_string()).collect()))
                    .collect(),
                ..Self::default()
            }
        }

        fn watching(mut self, token: Arc<CountingToken>) -> Self {
            self.watched_token = Some(token);
            self
        }
    }

    fn check_identity(token: &Option<Arc<CountingToken>>, misses: &AtomicUsize) {
        if let Some(token) = token {
            if !token.is_active_on_current_thread() {
                misses.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl SchemaScripter for FakeScripter {
        fn connect(&self, server: &str, context: &ExecutionContext) -> Result<Box<dyn ServerSession>> {
            self.connections.fetch_add(1, Ordering::SeqCst);
            check_identity(&self.watched_token, &self.calls_without_identity);
            self.principals
                .lock()
                .unwrap()
                .push(context.principal().map(str::to_string));
            match self.servers.get(server) {
                Some(databases) => Ok(Box::new(FakeSession {
                    databases: databases.clone(),
                    watched_token: self.watched_token.clone(),
                    calls_without_identity: self.calls_without_identity.clone(),
                })),
                None => Err(Error::Configuration(format!("no route to {server}"))),
            }
        }
    }

    struct FakeSession {
        databases: Vec<String>,
        watched_token: Option<Arc<CountingToken>>,
        calls_without_identity: Arc<AtomicUsize>,
    }

    impl ServerSession for FakeSession {
        fn databases(&self) -> Result<Vec<String>> {
            check_identity(&self.watched_token, &self.calls_without_identity);
            Ok(self.databases.clone())
        }

        fn script(&self, database: &str, category: ObjectCategory) -> Result<Vec<ScriptedObject>> {
            check_identity(&self.watched_token, &self.calls_without_identity);
            if database == "broken" && category == ObjectCategory::Tables {
                return Err(Error::from(std::io::Error::other("lost connection")));
            }
            if database == "denied" {
                return Err(Error::Credential {
                    principal: "backup".into(),
                    code: Some(5),
                    reason: "access is denied".into(),
                });
            }
            Ok(vec![
                ScriptedObject::new(format!("{category}_1"), vec![format!("-- {database} {category} 1")]),
                ScriptedObject::system(format!("{category}_sys"), vec![format!("-- {database} {category} sys")]),
            ])
        }
    }

    fn settings(root: &Path, servers: &[&str]) -> BackupSettings {
        BackupSettings::builder()
            .servers(servers.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .backup_root(root)
            .exclude(vec![NamePattern::parse("tempdb").unwrap()])
            .max_concurrency(2)
            .build()
    }

    fn orchestrator(
        settings: BackupSettings,
        scripter: FakeScripter,
    ) -> BackupOrchestrator<FakeScripter, FakeLogonProvider> {
        BackupOrchestrator::new(settings, scripter, FakeLogonProvider::accepting("secret"))
    }

    fn files_under(dir: &Path) -> Vec<String> {
        let mut names = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect_vec();
        names.sort();
        names
    }

    #[test]
    fn test_excluded_databases_get_no_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let scripter = FakeScripter::with(&[("S1", &["app", "tempdb"]), ("S2", &["tempdb"])]);

        let summary = orchestrator(settings(root, &["S1", "S2"]), scripter).run().unwrap();

        let app_dir = root.join("S1").join("app");
        assert_eq!(
            files_under(&app_dir),
            ObjectCategory::ALL
                .iter()
                .enumerate()
                .map(|(i, c)| category_file_name(i + 1, *c))
                .collect_vec()
        );
        assert_eq!(files_under(&root.join("S1")), vec!["app".to_string()]);
        assert!(!root.join("S2").join("tempdb").exists());
        assert!(!root.join("S2").exists());

        assert_eq!(summary.servers.len(), 2);
        assert_eq!(summary.servers[0].server, "S1");
        assert_eq!(summary.servers[0].backed_up, vec![app_dir]);
        assert_eq!(summary.servers[0].skipped, vec!["tempdb".to_string()]);
        assert!(summary.servers[1].backed_up.is_empty());
        assert!(summary.is_complete());
    }

    #[test]
    fn test_category_file_contents() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let scripter = FakeScripter::with(&[("S1", &["app"])]);

        orchestrator(settings(root, &["S1"]), scripter).run().unwrap();

        let dir = root.join("S1").join("app");
        let database = std::fs::read_to_string(dir.join("001 Database.sql")).unwrap();
        assert_eq!(database, "-- app Database 1\n-- app Database sys\n");

        let tables = std::fs::read_to_string(dir.join("009 Tables.sql")).unwrap();
        assert_eq!(tables, "USE [app]\nGO\n-- app Tables 1\n");

        let schemas = std::fs::read_to_string(dir.join("002 Schemas.sql")).unwrap();
        assert!(schemas.starts_with("USE [app]\nGO\n"));
        assert!(schemas.contains("-- app Schemas sys"));
    }

    #[test]
    fn test_failures_do_not_stop_siblings() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let scripter = FakeScripter::with(&[("S1", &["broken", "app"]), ("S3", &["other"])]);

        let summary = orchestrator(settings(root, &["S1", "unreachable", "S3"]), scripter)
            .run()
            .unwrap();

        assert_eq!(summary.unreachable_servers(), vec!["unreachable"]);
        assert_eq!(summary.servers[0].failed, vec!["broken".to_string()]);
        assert_eq!(summary.databases_backed_up(), 2);
        assert!(root.join("S1").join("app").join("012 Functions.sql").exists());
        assert!(root.join("S3").join("other").join("012 Functions.sql").exists());
        assert!(!summary.is_complete());
        assert_eq!(
            summary.to_string(),
            "3 servers, 2 databases backed up, 1 failed, unreachable: unreachable"
        );
    }

    #[test]
    fn test_named_instance_is_one_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let server = if cfg!(windows) { r"SQL01\PROD" } else { "SQL01/PROD" };
        let scripter = FakeScripter::with(&[(server, &["app:main"])]);

        orchestrator(settings(root, &[server]), scripter).run().unwrap();

        assert!(root.join("SQL01_PROD").join("app_main").join("001 Database.sql").exists());
    }

    #[test]
    fn test_invalid_settings_dispatch_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let scripter = FakeScripter::with(&[("S1", &["app"])]);
        let orchestrator = orchestrator(settings(temp_dir.path(), &[]), scripter);

        let error = orchestrator.run().unwrap_err();
        assert!(error.is_fatal());
        assert_eq!(orchestrator.scripter.connections.load(Ordering::SeqCst), 0);
    }

    fn credentialed(root: &Path, servers: &[&str], password: &str) -> BackupSettings {
        BackupSettings::builder()
            .servers(servers.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .backup_root(root)
            .credentials(Credentials::from_qualified_user(r"CORP\backup", password))
            .max_concurrency(2)
            .build()
    }

    #[test]
    fn test_invalid_credentials_dispatch_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("backups");
        let orchestrator = orchestrator(
            credentialed(&root, &["S1"], "wrong"),
            FakeScripter::with(&[("S1", &["app"])]),
        );

        match orchestrator.run() {
            Err(Error::Credential { code, .. }) => assert_eq!(code, Some(1326)),
            other => panic!("Expected credential error, got {other:?}"),
        }
        assert_eq!(orchestrator.scripter.connections.load(Ordering::SeqCst), 0);
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_backup_root_is_created_by_the_run() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("nested").join("backups");

        orchestrator(settings(&root, &["S1"]), FakeScripter::with(&[("S1", &["app"])]))
            .run()
            .unwrap();

        assert!(root.join("S1").join("app").join("001 Database.sql").exists());
    }

    #[test]
    fn test_every_collaborator_call_runs_under_the_identity() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FakeLogonProvider::accepting("secret");
        let token = provider.token.clone();
        let scripter = FakeScripter::with(&[("S1", &["a", "b"]), ("S2", &["c"]), ("S3", &["d"])])
            .watching(token.clone());
        let orchestrator = BackupOrchestrator::new(
            credentialed(temp_dir.path(), &["S1", "S2", "S3"], "secret"),
            scripter,
            provider,
        );

        let summary = orchestrator.run().unwrap();

        assert_eq!(summary.databases_backed_up(), 4);
        assert_eq!(orchestrator.scripter.connections.load(Ordering::SeqCst), 3);
        assert_eq!(
            orchestrator.scripter.calls_without_identity.load(Ordering::SeqCst),
            0
        );
        // Once for the run, once per job; every one of them reverted.
        assert_eq!(token.impersonations.load(Ordering::SeqCst), 4);
        assert_eq!(token.reverts.load(Ordering::SeqCst), 4);
        assert!(token.active_threads.lock().unwrap().is_empty());

        let principals = orchestrator.scripter.principals.lock().unwrap();
        assert_eq!(principals.len(), 3);
        assert!(principals.iter().all(|p| p.as_deref() == Some(r"CORP\backup")));
    }

    #[test]
    fn test_failed_revert_keeps_the_summary() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = BackupOrchestrator::new(
            credentialed(temp_dir.path(), &["S1"], "secret"),
            FakeScripter::with(&[("S1", &["app"])]),
            FakeLogonProvider::failing_revert("secret"),
        );

        let summary = orchestrator.run().unwrap();

        assert_eq!(summary.databases_backed_up(), 1);
        assert!(summary.is_complete());
    }

    #[test]
    fn test_credential_failure_on_a_database_stops_that_server_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let scripter = FakeScripter::with(&[("S1", &["denied", "app"]), ("S2", &["other"])]);

        let summary = orchestrator(settings(root, &["S1", "S2"]), scripter).run().unwrap();

        assert_eq!(summary.servers[0].failed, vec!["denied".to_string()]);
        assert!(summary.servers[0].backed_up.is_empty());
        assert!(!root.join("S1").join("app").exists());
        assert_eq!(summary.servers[1].backed_up.len(), 1);
    }

    #[test]
    fn test_without_credentials_jobs_run_as_process() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            settings(temp_dir.path(), &["S1"]),
            FakeScripter::with(&[("S1", &["a"])]),
        );

        orchestrator.run().unwrap();

        assert_eq!(orchestrator.logon.token.impersonations.load(Ordering::SeqCst), 0);
        assert_eq!(*orchestrator.scripter.principals.lock().unwrap(), vec![None]);
    }

    #[test]
    fn test_sqlite_end_to_end() {
        let servers_dir = TempDir::new().unwrap();
        let backups_dir = TempDir::new().unwrap();
        let server = servers_dir.path().join("server1");
        std::fs::create_dir(&server).unwrap();
        create_database(&server.join("sales.db"));
        create_database(&server.join("tempdb.db"));
        let server = server.to_string_lossy().into_owned();

        let settings = BackupSettings::builder()
            .servers(vec![server.clone()])
            .backup_root(backups_dir.path())
            .exclude(vec![NamePattern::parse("tempdb*").unwrap()])
            .build();
        let summary = BackupOrchestrator::new(settings, SqliteScripter::default(), FakeLogonProvider::accepting("x"))
            .run()
            .unwrap();

        assert_eq!(summary.databases_backed_up(), 1);
        let dir = &summary.servers[0].backed_up[0];
        assert!(dir.starts_with(backups_dir.path()));
        assert!(dir.ends_with("sales.db"));
        let tables = std::fs::read_to_string(dir.join("009 Tables.sql")).unwrap();
        assert!(tables.starts_with("USE [sales.db]\nGO\nCREATE TABLE customers"));
        assert!(!tables.contains("sqlite_sequence"));
        assert_eq!(files_under(dir).len(), ObjectCategory::ALL.len());
    }

    #[test]
    fn test_identity_token_trait_object_is_shareable() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn IdentityToken>();
        assert_send_sync::<ExecutionContext>();
    }
}
