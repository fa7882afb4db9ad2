//! Token authentication hook
//!
//! Every inbound message passes its `token` through an [`Authenticator`]
//! before dispatch. The authenticator can reject the message or resolve the
//! caller to a member id, which then takes precedence over any id the client
//! put in its payload.

use std::collections::HashMap;

use crate::error::AuthError;
use crate::message::MemberId;

/// Who sent a message, as far as the authenticator can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Accepted without a resolved member id; payload ids are used as given.
    Anonymous,
    Member(MemberId),
}

impl Identity {
    pub fn member_id(&self) -> Option<MemberId> {
        match self {
            Identity::Anonymous => None,
            Identity::Member(id) => Some(*id),
        }
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Accepts every token as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _token: &str) -> Result<Identity, AuthError> {
        Ok(Identity::Anonymous)
    }
}

/// Fixed token table. Unknown or empty tokens are rejected.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, MemberId>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, MemberId>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens
            .get(token)
            .map(|id| Identity::Member(*id))
            .ok_or(AuthError::InvalidToken)
    }
}
