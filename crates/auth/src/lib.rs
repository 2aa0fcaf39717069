//! Accounts, credential verification, and stateless session tokens.
//!
//! The user directory is seeded once at process start and never written
//! afterwards; a restart recreates it from configuration, so there is no
//! account persistence in this scope. Session validity is determined purely
//! by token signature and expiry at verification time; there is no
//! server-side session store and no revocation.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

pub const ERR_TOKEN_MISSING: &str = "ERR_TOKEN_MISSING";
pub const ERR_TOKEN_INVALID: &str = "ERR_TOKEN_INVALID";
pub const ERR_TOKEN_EXPIRED: &str = "ERR_TOKEN_EXPIRED";
pub const ERR_INVALID_CREDENTIALS: &str = "ERR_INVALID_CREDENTIALS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The one outcome shared by unknown-user and wrong-password failures,
    /// so callers cannot probe which accounts exist.
    pub fn invalid_credentials() -> Self {
        Self::new(ERR_INVALID_CREDENTIALS, "invalid username or password")
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    /// Permission set derived deterministically from the role at account
    /// creation time. Never empty.
    pub fn default_permissions(&self) -> Vec<String> {
        use askdb_policy::capability as cap;

        let caps: &[&str] = match self {
            Role::Admin => &[cap::WILDCARD],
            Role::Editor => &[cap::READ, cap::INSERT, cap::UPDATE, cap::DELETE, cap::ANALYZE],
            Role::Viewer => &[cap::READ, cap::ANALYZE],
        };
        caps.iter().map(|c| c.to_string()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub permissions: Vec<String>,
}

impl User {
    pub fn has_capability(&self, cap: &str) -> bool {
        askdb_policy::has_capability(&self.permissions, cap)
    }

    pub fn allows_destructive(&self) -> bool {
        askdb_policy::allows_destructive(&self.permissions)
    }
}

/// Hash a password with bcrypt on the blocking pool; the hash embeds its
/// salt and cost.
pub async fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        bcrypt::hash(password, cost)
            .map_err(|err| AuthError::new("ERR_INTERNAL", format!("password hashing failed: {err}")))
    })
    .await
    .map_err(|_| AuthError::new("ERR_INTERNAL", "password hashing task failed"))?
}

async fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || {
        bcrypt::verify(password, &hash)
            .map_err(|err| AuthError::new("ERR_INTERNAL", format!("password check failed: {err}")))
    })
    .await
    .map_err(|_| AuthError::new("ERR_INTERNAL", "password check task failed"))?
}

/// In-memory account directory, seeded at startup and read-only afterwards.
pub struct UserDirectory {
    users: HashMap<String, User>,
    // Hash verified against for unknown usernames so lookup misses cost the
    // same as password mismatches.
    decoy_hash: String,
}

impl UserDirectory {
    /// Build the directory from `(username, password, role)` seed accounts.
    /// Permissions are derived from the role; duplicate usernames keep the
    /// first entry.
    pub async fn seeded(accounts: &[(String, String, Role)], cost: u32) -> Result<Self, AuthError> {
        let mut users = HashMap::new();
        for (username, password, role) in accounts {
            if users.contains_key(username) {
                continue;
            }
            let password_hash = hash_password(password, cost).await?;
            users.insert(
                username.clone(),
                User {
                    username: username.clone(),
                    password_hash,
                    role: *role,
                    permissions: role.default_permissions(),
                },
            );
        }

        let decoy_hash = hash_password("decoy-password", cost).await?;

        Ok(Self { users, decoy_hash })
    }

    pub fn get(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check a plaintext credential pair. Unknown usernames and wrong
    /// passwords produce the identical `ERR_INVALID_CREDENTIALS` outcome.
    pub async fn verify(&self, username: &str, password: &str) -> Result<&User, AuthError> {
        let Some(user) = self.users.get(username) else {
            // Burn a comparable amount of work before failing.
            let _ = verify_password(password, &self.decoy_hash).await;
            return Err(AuthError::invalid_credentials());
        };

        if verify_password(password, &user.password_hash).await? {
            Ok(user)
        } else {
            Err(AuthError::invalid_credentials())
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    iat: u64,
    exp: u64,
}

/// Mints and verifies HS256 session tokens with a server-held secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// A missing or empty secret is a startup condition, never a
    /// per-request error.
    pub fn new(secret: &str, ttl: Duration) -> Result<Self, AuthError> {
        if secret.trim().is_empty() {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "session token secret must be non-empty",
            ));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    /// Stateless mint: subject, role, issued-at, absolute expiry.
    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let iat = unix_now_secs();
        let claims = Claims {
            sub: user.username.clone(),
            role: user.role,
            iat,
            exp: iat.saturating_add(self.ttl.as_secs()),
        };

        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| AuthError::new("ERR_INTERNAL", "failed to sign session token"))
    }

    /// Resolve the bearer token in `headers` back to a live user record.
    /// Stale claims are never trusted over the current directory: a valid
    /// signature whose subject no longer exists is an invalid token.
    pub fn verify_headers<'a>(
        &self,
        headers: &HeaderMap,
        directory: &'a UserDirectory,
    ) -> Result<&'a User, AuthError> {
        let token = bearer_token(headers)?;
        self.verify_token(&token, directory)
    }

    pub fn verify_token<'a>(
        &self,
        token: &str,
        directory: &'a UserDirectory,
    ) -> Result<&'a User, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let decoded = decode::<Claims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AuthError::new(ERR_TOKEN_EXPIRED, "Token has expired")
                }
                _ => AuthError::new(ERR_TOKEN_INVALID, "Invalid token"),
            }
        })?;

        directory
            .get(&decoded.claims.sub)
            .ok_or_else(|| AuthError::new(ERR_TOKEN_INVALID, "Invalid token"))
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Extract the bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::new(ERR_TOKEN_MISSING, "Token is missing"))?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AuthError::new(ERR_TOKEN_INVALID, "Authorization must be a Bearer token")
        })?;

    Ok(token.to_string())
}
