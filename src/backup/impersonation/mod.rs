//! Scoped execution under alternate credentials.
//!
//! [`ImpersonationHandle::begin`] logs on through a [`LogonProvider`] and switches the
//! calling thread to the alternate identity. The handle reverts exactly once, either
//! through [`ImpersonationHandle::end`] or when it is dropped, so every exit path
//! restores the original identity.
//!
//! Worker threads do not inherit the impersonated state. Jobs receive the identity
//! explicitly as an [`ExecutionContext`], switch their own thread with
//! [`ExecutionContext::enter`] for the whole job body, and hand it to the scripting
//! collaborator.

#[cfg(not(windows))]
mod unsupported;
#[cfg(windows)]
mod windows;

use crate::backup::result_error::result::Result;
use crate::backup::settings::Credentials;
use std::fmt::Debug;
use std::sync::Arc;

#[cfg(not(windows))]
pub use unsupported::UnsupportedLogonProvider as SystemLogonProvider;
#[cfg(windows)]
pub use windows::{WindowsLogonProvider as SystemLogonProvider, WindowsToken};

/// An alternate identity obtained from a successful logon.
///
/// Dropping the last reference releases the underlying OS token.
pub trait IdentityToken: Debug + Send + Sync {
    /// `DOMAIN\user` or `user`.
    fn principal(&self) -> &str;

    /// Switches the calling thread to this identity.
    fn impersonate(&self) -> Result<()>;

    /// Restores the calling thread's own identity.
    fn revert(&self) -> Result<()>;
}

pub trait LogonProvider {
    /// Fails with [`Error::Credential`](crate::backup::result_error::error::Error::Credential) when the credentials are rejected.
    fn logon(&self, credentials: &Credentials) -> Result<Arc<dyn IdentityToken>>;
}

/// Identity every collaborator call runs under.
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    identity: Option<Arc<dyn IdentityToken>>,
}

impl ExecutionContext {
    /// Runs as the calling process identity.
    pub fn process() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&Arc<dyn IdentityToken>> {
        self.identity.as_ref()
    }

    pub fn principal(&self) -> Option<&str> {
        self.identity.as_deref().map(IdentityToken::principal)
    }

    pub fn is_impersonated(&self) -> bool {
        self.identity.is_some()
    }

    /// Switches the calling thread to this identity until the guard drops.
    ///
    /// The process context enters nothing and its guard reverts nothing.
    pub fn enter(&self) -> Result<ContextGuard> {
        if let Some(token) = &self.identity {
            token.impersonate()?;
            tracing::debug!("Thread entered identity {}", token.principal());
        }
        Ok(ContextGuard {
            identity: self.identity.clone(),
        })
    }
}

/// Reverts the calling thread when dropped; must drop on the thread that entered.
#[derive(Debug)]
#[must_use = "the identity is reverted as soon as the guard drops"]
pub struct ContextGuard {
    identity: Option<Arc<dyn IdentityToken>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(token) = self.identity.take() {
            if let Err(e) = token.revert() {
                tracing::error!("Reverting thread identity {} failed: {e}", token.principal());
            }
        }
    }
}

#[derive(Debug)]
pub struct ImpersonationHandle {
    token: Arc<dyn IdentityToken>,
    active: bool,
}

impl ImpersonationHandle {
    pub fn begin<P: LogonProvider + ?Sized>(provider: &P, credentials: &Credentials) -> Result<Self> {
        let token = provider.logon(credentials)?;
        token.impersonate()?;
        tracing::info!("Impersonating {}", token.principal());
        Ok(Self {
            token,
            active: true,
        })
    }

    pub fn context(&self) -> ExecutionContext {
        ExecutionContext {
            identity: Some(self.token.clone()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Reverts to the original identity. Calling it again is a no-op.
    pub fn end(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        tracing::info!("Reverting impersonation of {}", self.token.principal());
        self.token.revert()
    }
}

impl Drop for ImpersonationHandle {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            tracing::error!("Reverting impersonation failed: {e}");
        }
    }
}
