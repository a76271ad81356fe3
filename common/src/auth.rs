// Authorization gate for the background scheduler

use crate::errors::AuthError;
use serde::{Deserialize, Serialize};

/// Roles allowed to run the scheduler when none are configured
pub const DEFAULT_PRIVILEGED_ROLES: [&str; 2] = ["admin", "lead"];

/// The actor on whose behalf the scheduler runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub is_authenticated: bool,
    pub role: String,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(role: impl Into<String>) -> Self {
        Self {
            is_authenticated: true,
            role: role.into(),
        }
    }
}

/// Decides whether an actor may run the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    privileged_roles: Vec<String>,
}

fn normalize(role: &str) -> String {
    role.trim().to_lowercase()
}

impl AuthPolicy {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut privileged_roles: Vec<String> = roles
            .into_iter()
            .map(|r| normalize(r.as_ref()))
            .filter(|r| !r.is_empty())
            .collect();
        privileged_roles.sort_unstable();
        privileged_roles.dedup();
        Self { privileged_roles }
    }

    pub fn privileged_roles(&self) -> &[String] {
        &self.privileged_roles
    }

    /// Role comparison ignores case and surrounding whitespace
    pub fn authorize(&self, ctx: &AuthContext) -> Result<(), AuthError> {
        if !ctx.is_authenticated {
            return Err(AuthError::NotAuthenticated);
        }
        let role = normalize(&ctx.role);
        if self.privileged_roles.iter().any(|r| *r == role) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions(ctx.role.clone()))
        }
    }

    pub fn permits(&self, ctx: &AuthContext) -> bool {
        self.authorize(ctx).is_ok()
    }
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PRIVILEGED_ROLES)
    }
}
