pub mod filter;
pub mod impersonation;
pub mod orchestrator;
pub mod redacted;
pub mod result_error;
pub mod sanitize;
pub mod scheduler;
pub mod scripter;
pub mod settings;
pub mod validate;
pub mod writer;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
