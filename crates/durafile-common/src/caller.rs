//! Authenticated caller context
//!
//! Authentication happens upstream; the core only receives the validated
//! identity and checks it against the roles each operation admits.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of an authenticated caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ServiceAccount,
    Admin,
    Operator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ServiceAccount => "service-account",
            Self::Admin => "admin",
            Self::Operator => "operator",
        })
    }
}

/// Identity handed to the core by the authentication layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub subject: String,
    pub role: Role,
    /// Whether the bearer token was still valid when the request arrived
    pub token_valid: bool,
}

impl CallerContext {
    pub fn new(subject: impl Into<String>, role: Role) -> Self {
        Self {
            subject: subject.into(),
            role,
            token_valid: true,
        }
    }

    /// Internal caller used by background tasks of the element itself
    #[must_use]
    pub fn system() -> Self {
        Self::new("system", Role::Admin)
    }

    /// Check that the caller holds a valid token and one of `allowed`
    pub fn require(&self, allowed: &[Role], operation: &str) -> Result<()> {
        if !self.token_valid {
            return Err(Error::AccessDenied(format!(
                "{operation}: token for '{}' is no longer valid",
                self.subject
            )));
        }
        if !allowed.contains(&self.role) {
            return Err(Error::AccessDenied(format!(
                "{operation}: role {} not permitted for '{}'",
                self.role, self.subject
            )));
        }
        Ok(())
    }
}
