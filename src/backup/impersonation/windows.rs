use crate::backup::impersonation::{IdentityToken, LogonProvider};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::settings::Credentials;
use std::sync::Arc;
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};
use windows_sys::Win32::Security::{
    ImpersonateLoggedOnUser, LogonUserW, RevertToSelf, LOGON32_LOGON_INTERACTIVE,
    LOGON32_PROVIDER_DEFAULT,
};
use zeroize::Zeroizing;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error(principal: &str, reason: &str) -> Error {
    // SAFETY: reads the calling thread's last-error value.
    let code = unsafe { GetLastError() };
    Error::Credential {
        principal: principal.into(),
        code: Some(code as i32),
        reason: reason.into(),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsLogonProvider;

impl LogonProvider for WindowsLogonProvider {
    fn logon(&self, credentials: &Credentials) -> Result<Arc<dyn IdentityToken>> {
        let principal = credentials.principal();
        let username = wide(credentials.username());
        let domain = credentials.domain().as_deref().map(wide);
        let password = Zeroizing::new(wide(credentials.password().inner()));
        let mut handle: HANDLE = std::ptr::null_mut();

        // SAFETY: all strings are NUL-terminated UTF-16 buffers that outlive the call,
        // and `handle` is a valid out pointer.
        let ok = unsafe {
            LogonUserW(
                username.as_ptr(),
                domain.as_ref().map_or(std::ptr::null(), |d| d.as_ptr()),
                password.as_ptr(),
                LOGON32_LOGON_INTERACTIVE,
                LOGON32_PROVIDER_DEFAULT,
                &mut handle,
            )
        };
        if ok == 0 {
            return Err(last_error(&principal, "LogonUserW rejected the credentials"));
        }

        tracing::debug!("Logged on as {principal}");
        Ok(Arc::new(WindowsToken { handle, principal }))
    }
}

/// Primary token returned by `LogonUserW`, closed on drop.
#[derive(Debug)]
pub struct WindowsToken {
    handle: HANDLE,
    principal: String,
}

// SAFETY: a token handle is a kernel object reference usable from any thread.
unsafe impl Send for WindowsToken {}
// SAFETY: the handle is never mutated after construction.
unsafe impl Sync for WindowsToken {}

impl IdentityToken for WindowsToken {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn impersonate(&self) -> Result<()> {
        // SAFETY: `handle` is an open token for the lifetime of `self`.
        if unsafe { ImpersonateLoggedOnUser(self.handle) } == 0 {
            return Err(last_error(&self.principal, "ImpersonateLoggedOnUser failed"));
        }
        Ok(())
    }

    fn revert(&self) -> Result<()> {
        // SAFETY: no arguments; reverts the calling thread.
        if unsafe { RevertToSelf() } == 0 {
            return Err(last_error(&self.principal, "RevertToSelf failed"));
        }
        Ok(())
    }
}

impl Drop for WindowsToken {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful `LogonUserW` and is closed once.
        if unsafe { CloseHandle(self.handle) } == 0 {
            tracing::warn!("Closing logon token of {} failed", self.principal);
        }
    }
}
