//! Authentication handling

use popgen_core::{AuthConfig, AuthMode, Error, Identity, Result, Role, UserEntry};

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() { return false; }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Resolves a caller credential (the raw `Authorization` header) to an identity.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, credential: Option<&str>) -> Result<Identity>;
}

/// Extract the token from `Bearer <token>`. A bare token is accepted as well.
pub fn bearer_token(header: &str) -> Option<&str> {
    const SCHEME: &str = "bearer";
    let header = header.trim();
    let token = match (header.get(..SCHEME.len()), header.get(SCHEME.len()..)) {
        (Some(scheme), Some(rest))
            if scheme.eq_ignore_ascii_case(SCHEME)
                && (rest.is_empty() || rest.starts_with(char::is_whitespace)) =>
        {
            rest.trim()
        }
        _ => header,
    };
    (!token.is_empty()).then_some(token)
}

/// Static token table from configuration.
#[derive(Clone, Debug)]
pub struct TokenIdentityProvider {
    mode: AuthMode,
    users: Vec<UserEntry>,
}

impl TokenIdentityProvider {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self { mode: config.mode.clone(), users: config.users.clone() }
    }
}

impl IdentityProvider for TokenIdentityProvider {
    fn resolve(&self, credential: Option<&str>) -> Result<Identity> {
        match self.mode {
            AuthMode::None => Ok(Identity::new("anonymous", Role::Admin)),
            AuthMode::Token => {
                let provided = credential
                    .and_then(bearer_token)
                    .ok_or_else(|| Error::unauthorized("token required"))?;
                self.users
                    .iter()
                    .find(|u| constant_time_eq(u.token.as_bytes(), provided.as_bytes()))
                    .map(|u| Identity::new(u.username.clone(), u.role))
                    .ok_or_else(|| Error::unauthorized("invalid token"))
            }
        }
    }
}
