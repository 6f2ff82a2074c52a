use clap::Parser;
use sql_schema_backup::backup::filter::NamePattern;
use sql_schema_backup::backup::impersonation::SystemLogonProvider;
use sql_schema_backup::backup::orchestrator::BackupOrchestrator;
use sql_schema_backup::backup::result_error::result::Result;
use sql_schema_backup::backup::scripter::sqlite::SqliteScripter;
use sql_schema_backup::backup::settings::{BackupSettings, Credentials, DEFAULT_MAX_CONCURRENCY};
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info, warn};

/// Script the schema of every database on a set of servers
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of a YAML settings file, replaces the inline options
    #[arg(
        short,
        long,
        conflicts_with_all = ["threads", "folder", "user", "servers", "include", "exclude"]
    )]
    config: Option<PathBuf>,

    /// Maximum number of servers backed up at once
    #[arg(short, long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    threads: usize,

    /// Backup root folder
    #[arg(short, long, required_unless_present = "config")]
    folder: Option<PathBuf>,

    /// Alternate logon, `DOMAIN\user` or `user`
    #[arg(short, long, requires = "password")]
    user: Option<String>,

    /// Password for the alternate logon, ignored without `--user`
    #[arg(short, long, env = "SQL_SCHEMA_BACKUP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Comma separated server names
    #[arg(short, long, value_delimiter = ',', required_unless_present = "config")]
    servers: Vec<String>,

    /// Database name patterns to back up: `name`, `prefix*` or `*suffix`
    #[arg(short, long, value_delimiter = ',')]
    include: Vec<NamePattern>,

    /// Database name patterns to skip, applied after include
    #[arg(short, long, value_delimiter = ',')]
    exclude: Vec<NamePattern>,
}

impl Args {
    fn into_settings(self) -> Result<BackupSettings> {
        if let Some(config) = &self.config {
            return BackupSettings::load_yaml(config);
        }

        let credentials = self
            .user
            .zip(self.password)
            .map(|(user, password)| Credentials::from_qualified_user(&user, password));
        Ok(BackupSettings::builder()
            .maybe_credentials(credentials)
            .servers(self.servers)
            .backup_root(self.folder.unwrap_or_default())
            .include(self.include)
            .exclude(self.exclude)
            .max_concurrency(self.threads)
            .build())
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = args.into_settings().and_then(|settings| {
        BackupOrchestrator::new(settings, SqliteScripter::default(), SystemLogonProvider).run()
    });

    match res {
        Ok(summary) if summary.is_complete() => info!("{summary}"),
        Ok(summary) => warn!("Backup finished with failures: {summary}"),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
