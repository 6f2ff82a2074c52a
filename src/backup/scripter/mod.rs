pub mod sqlite;

use crate::backup::impersonation::ExecutionContext;
use crate::backup::result_error::result::Result;
use derive_more::Display;

/// Object kinds scripted per database, in output file order.
///
/// `Display` gives the file name token.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ObjectCategory {
    #[display("Database")]
    Database,
    #[display("Schemas")]
    Schemas,
    #[display("Database Rules")]
    Rules,
    #[display("Database Triggers")]
    DatabaseTriggers,
    #[display("Database Roles")]
    Roles,
    #[display("Users")]
    Users,
    #[display("Data Types")]
    UserDefinedDataTypes,
    #[display("Types")]
    UserDefinedTypes,
    #[display("Tables")]
    Tables,
    #[display("Views")]
    Views,
    #[display("Procedures")]
    Procedures,
    #[display("Functions")]
    Functions,
}

impl ObjectCategory {
    pub const ALL: [ObjectCategory; 12] = [
        Self::Database,
        Self::Schemas,
        Self::Rules,
        Self::DatabaseTriggers,
        Self::Roles,
        Self::Users,
        Self::UserDefinedDataTypes,
        Self::UserDefinedTypes,
        Self::Tables,
        Self::Views,
        Self::Procedures,
        Self::Functions,
    ];

    /// Categories whose system objects are left out of the backup.
    pub fn skips_system_objects(self) -> bool {
        matches!(
            self,
            Self::Tables | Self::Views | Self::Procedures | Self::Functions
        )
    }

    /// The database creation script runs before the database exists, so it gets no `USE`.
    pub fn has_use_preamble(self) -> bool {
        self != Self::Database
    }
}

/// One scripted object, already rendered by the collaborator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptedObject {
    pub name: String,
    pub is_system_object: bool,
    pub scripts: Vec<String>,
}

impl ScriptedObject {
    pub fn new<S: Into<String>>(name: S, scripts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            is_system_object: false,
            scripts,
        }
    }

    pub fn system<S: Into<String>>(name: S, scripts: Vec<String>) -> Self {
        Self {
            is_system_object: true,
            ..Self::new(name, scripts)
        }
    }
}

/// Database introspection and scripting service.
pub trait SchemaScripter: Send + Sync {
    /// Opens a session on `server` under the identity carried by `context`.
    fn connect(&self, server: &str, context: &ExecutionContext) -> Result<Box<dyn ServerSession>>;
}

/// A connection to one server, used by a single job.
pub trait ServerSession {
    /// Database names in enumeration order.
    fn databases(&self) -> Result<Vec<String>>;

    /// Objects of `category` in `database`, in enumeration order.
    fn script(&self, database: &str, category: ObjectCategory) -> Result<Vec<ScriptedObject>>;
}
