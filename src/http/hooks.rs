use super::{Request, Response};
use crate::error::{HttpErrorKind, TransportCode};
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a hook. It is treated exactly like a native failure of the
/// wrapped kind.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct HookError(#[from] HttpErrorKind);

impl HookError {
    pub fn new(kind: HttpErrorKind) -> Self {
        Self(kind)
    }

    pub fn user_cancelled(message: impl Into<String>) -> Self {
        Self(HttpErrorKind::UserCancelled(message.into()))
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self(HttpErrorKind::ResponseStatusCode {
            status,
            message: message.into(),
        })
    }

    pub fn transport(code: TransportCode, message: impl Into<String>) -> Self {
        Self(HttpErrorKind::Transport {
            code,
            message: message.into(),
        })
    }

    pub fn into_kind(self) -> HttpErrorKind {
        self.0
    }
}

/// Runs before a request is sent and may rewrite it
pub type BeforeHook = Arc<dyn Fn(&mut Request) -> Result<(), HookError> + Send + Sync>;

/// Runs after a response arrives and may rewrite it
pub type AfterHook = Arc<dyn Fn(&Request, &mut Response) -> Result<(), HookError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, hook: BeforeHook) -> Self {
        self.before.push(hook);
        self
    }

    pub fn after(mut self, hook: AfterHook) -> Self {
        self.after.push(hook);
        self
    }

    pub fn run_before(&self, request: &mut Request) -> Result<(), HookError> {
        for hook in &self.before {
            hook(request)?;
        }
        Ok(())
    }

    pub fn run_after(&self, request: &Request, response: &mut Response) -> Result<(), HookError> {
        for hook in &self.after {
            hook(request, response)?;
        }
        Ok(())
    }
}
