use crate::backup::filter::InvalidPatternError;
use crate::backup::result_error::{AddDebugObjectAndFnName, AddFunctionName, AddMsg};
use crate::backup::scripter::ObjectCategory;
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::mpsc::SendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid settings:\n{}", indent::indent_all_with("  ", .0.to_string()))]
    InvalidSettings(#[from] validator::ValidationErrors),
    #[error(transparent)]
    InvalidPattern(#[from] InvalidPatternError),
    #[error("Logon as {principal} failed: {reason}{}", native_code_suffix(.code))]
    Credential {
        principal: String,
        code: Option<i32>,
        reason: String,
    },
    #[error("Cannot connect to server {server:?}:\n{}", indent::indent_all_with("  ", source.to_string()))]
    ServerConnection {
        server: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Scripting {category} of {server}.{database} failed:\n{}", indent::indent_all_with("  ", source.to_string()))]
    DatabaseScripting {
        server: String,
        database: String,
        category: ObjectCategory,
        #[source]
        source: Box<Error>,
    },
    #[error("Cannot write {path:?}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error("{0}")]
    ChannelSendError(String),
    #[error("Job {job} panicked: {payload}")]
    JobPanicked { job: String, payload: String },
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{}:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

fn native_code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (native error code {c})"))
        .unwrap_or_default()
}

impl<S: Into<String>, O: Debug + Send + 'static> AddDebugObjectAndFnName<S, O> for Error {
    fn add_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<SendError<D>> for Error {
    fn from(value: SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Whether the error must abort the whole run instead of a single server or database.
    ///
    /// Context wrappers are looked through; an aggregate is fatal if any member is.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Configuration(_)
            | Error::InvalidSettings(_)
            | Error::InvalidPattern(_)
            | Error::Credential { .. }
            | Error::ThreadPoolBuildError(_)
            | Error::SerdeYml(_) => true,
            Error::WithMsg { error, .. }
            | Error::WithFnName { error, .. }
            | Error::WithDebugObjAndFnName { error, .. } => error.is_fatal(),
            Error::LotsOfError(errors) => errors.iter().any(Error::is_fatal),
            _ => false,
        }
    }
}
