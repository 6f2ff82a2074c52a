//! # sql-schema-backup
//!
//! Scripts the schema of every database on a set of servers into per-database folders.
//!
//! ## Features
//!
//! - **Fan-out**: one job per server on a bounded worker pool
//! - **Filtering**: exact, prefix and suffix database name patterns, include then exclude
//! - **Safe paths**: reserved characters and named-instance separators are flattened
//! - **Alternate credentials**: optional logon scoped to the whole run
//! - **Partial failure**: a broken server or database never stops its siblings
//!
//! ## Quick Start
//!
//! ```no_run
//! use sql_schema_backup::backup::impersonation::SystemLogonProvider;
//! use sql_schema_backup::backup::orchestrator::BackupOrchestrator;
//! use sql_schema_backup::backup::scripter::sqlite::SqliteScripter;
//! use sql_schema_backup::backup::settings::BackupSettings;
//!
//! let settings = BackupSettings::load_yaml("settings.yml")?;
//! let summary = BackupOrchestrator::new(settings, SqliteScripter::default(), SystemLogonProvider).run()?;
//! println!("{summary}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
