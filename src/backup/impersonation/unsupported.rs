use crate::backup::impersonation::{IdentityToken, LogonProvider};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::settings::Credentials;
use std::sync::Arc;

/// Alternate-identity logon only exists on Windows; elsewhere every attempt is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnsupportedLogonProvider;

impl LogonProvider for UnsupportedLogonProvider {
    fn logon(&self, credentials: &Credentials) -> Result<Arc<dyn IdentityToken>> {
        Err(Error::Credential {
            principal: credentials.principal(),
            code: None,
            reason: "logon with alternate credentials is only supported on Windows".into(),
        })
    }
}
