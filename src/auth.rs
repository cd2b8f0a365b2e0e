// ============================================================================
// Auth Verifier
// ============================================================================
//
// Resolves a credential on the incoming request to a Principal. Methods are
// tried in a fixed order: API key header, bearer token, basic. The first
// method whose credential parses is authoritative; if that credential is
// invalid the request fails without trying the others.
//
// Token revocation (logout/refresh) goes through the shared store as
// `blacklist:<jti>` entries whose TTL matches the remaining token life.
//
// ============================================================================

use crate::cache::store::TieredStore;
use crate::config::AuthConfig;
use crate::error::{GatewayError, GatewayResult};
use anyhow::{Context, Result};
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use uuid::Uuid;

const BLACKLIST_PREFIX: &str = "blacklist:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
            Permission::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "delete" => Ok(Permission::Delete),
            "admin" => Ok(Permission::Admin),
            other => anyhow::bail!("Unknown permission: {}", other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Basic,
}

/// Summary of the API key record attached to a principal.
#[derive(Clone, Debug)]
pub struct ApiKeySummary {
    pub name: String,
    /// Per-key quota override, when the record carries one.
    pub quota_max_requests: Option<u32>,
    pub quota_window_ms: Option<u64>,
}

/// The authenticated identity attached to a request. Built per request
/// from the credential; never cached across requests.
#[derive(Clone, Debug)]
pub struct Principal {
    pub id: String,
    pub method: AuthMethod,
    pub permissions: HashSet<Permission>,
    pub api_key: Option<ApiKeySummary>,
}

impl Principal {
    /// Admin implies every other permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&permission)
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains(&Permission::Admin)
    }

    /// Rate-limit bucket key for this identity.
    pub fn quota_key(&self) -> String {
        match self.method {
            AuthMethod::ApiKey => format!("apikey:{}", self.id),
            _ => format!("user:{}", self.id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub permissions: HashSet<Permission>,
}

#[derive(Clone, Debug)]
pub struct ApiKeyRecord {
    pub key: String,
    pub name: String,
    pub permissions: HashSet<Permission>,
    pub quota_max_requests: Option<u32>,
    pub quota_window_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// In-memory credential records. Durable credential storage is an external
/// collaborator; this store exists so the auth surface is exercisable.
#[derive(Default)]
pub struct CredentialStore {
    users: RwLock<HashMap<String, UserRecord>>,
    api_keys: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl CredentialStore {
    pub async fn add_user(
        &self,
        username: &str,
        password: &str,
        permissions: HashSet<Permission>,
    ) -> Result<UserRecord> {
        let record = UserRecord {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)
                .context("Failed to hash password")?,
            permissions,
        };
        let mut users = self.users.write().await;
        users.insert(username.to_string(), record.clone());
        Ok(record)
    }

    pub async fn find_user(&self, username: &str) -> Option<UserRecord> {
        self.users.read().await.get(username).cloned()
    }

    pub async fn find_user_by_id(&self, id: &str) -> Option<UserRecord> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.id == id)
            .cloned()
    }

    pub async fn insert_api_key(&self, record: ApiKeyRecord) {
        let mut keys = self.api_keys.write().await;
        keys.insert(record.key.clone(), record);
    }

    /// Constant-time lookup over the key set: every stored key is compared
    /// so timing does not reveal near-matches.
    pub async fn find_api_key(&self, presented: &str) -> Option<ApiKeyRecord> {
        let keys = self.api_keys.read().await;
        let mut found: Option<ApiKeyRecord> = None;
        for record in keys.values() {
            if bool::from(record.key.as_bytes().ct_eq(presented.as_bytes())) {
                found = Some(record.clone());
            }
        }
        found
    }

    pub async fn touch_api_key(&self, key: &str) {
        let mut keys = self.api_keys.write().await;
        if let Some(record) = keys.get_mut(key) {
            record.last_used = Some(Utc::now());
        }
    }

    pub async fn list_api_keys(&self) -> Vec<ApiKeyRecord> {
        self.api_keys.read().await.values().cloned().collect()
    }
}

pub struct AuthManager {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    store: CredentialStore,
    blacklist: Arc<TieredStore>,
}

impl AuthManager {
    pub fn new(config: AuthConfig, blacklist: Arc<TieredStore>) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
            store: CredentialStore::default(),
            blacklist,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    // ========================================================================
    // Token lifecycle
    // ========================================================================

    pub fn create_token(&self, user_id: &str) -> Result<(String, String, i64)> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.config.token_ttl_secs);
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            jti: jti.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: self.config.jwt_issuer.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("Failed to encode JWT token")?;
        Ok((token, jti, exp.timestamp()))
    }

    pub fn decode_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.jwt_issuer.clone()]);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .context("Token verification failed")?;
        Ok(data.claims)
    }

    /// Decode and reject blacklisted tokens.
    pub async fn verify_token(&self, token: &str) -> GatewayResult<Claims> {
        let claims = self
            .decode_token(token)
            .map_err(|e| GatewayError::Unauthenticated(format!("Invalid token: {}", e)))?;
        if self.is_blacklisted(&claims.jti).await {
            return Err(GatewayError::Unauthenticated(
                "Token has been revoked".to_string(),
            ));
        }
        Ok(claims)
    }

    pub async fn is_blacklisted(&self, jti: &str) -> bool {
        self.blacklist
            .exists(&format!("{}{}", BLACKLIST_PREFIX, jti))
            .await
    }

    /// Blacklist a token for the remainder of its life.
    pub async fn blacklist(&self, jti: &str, exp: i64) {
        let remaining = (exp - Utc::now().timestamp()).max(1) as u64;
        self.blacklist
            .set_ex(&format!("{}{}", BLACKLIST_PREFIX, jti), "1", remaining)
            .await;
    }

    // ========================================================================
    // Request verification
    // ========================================================================

    /// Resolve the request's credential to a Principal.
    pub async fn verify_request(&self, headers: &HeaderMap) -> GatewayResult<Principal> {
        // API key header first
        if self.config.api_key_enabled {
            if let Some(presented) = headers
                .get(self.config.api_key_header.as_str())
                .and_then(|v| v.to_str().ok())
            {
                return self.verify_api_key(presented).await;
            }
        }

        let authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if self.config.jwt_enabled {
            if let Some(token) = authorization.strip_prefix("Bearer ") {
                return self.verify_bearer(token).await;
            }
        }

        if self.config.basic_enabled {
            if let Some(encoded) = authorization.strip_prefix("Basic ") {
                return self.verify_basic(encoded).await;
            }
        }

        Err(GatewayError::Unauthenticated(
            "No credentials provided".to_string(),
        ))
    }

    async fn verify_api_key(&self, presented: &str) -> GatewayResult<Principal> {
        let record = self
            .store
            .find_api_key(presented)
            .await
            .ok_or_else(|| GatewayError::Unauthenticated("Invalid API key".to_string()))?;

        self.store.touch_api_key(&record.key).await;

        Ok(Principal {
            id: record.key.clone(),
            method: AuthMethod::ApiKey,
            permissions: record.permissions.clone(),
            api_key: Some(ApiKeySummary {
                name: record.name,
                quota_max_requests: record.quota_max_requests,
                quota_window_ms: record.quota_window_ms,
            }),
        })
    }

    async fn verify_bearer(&self, token: &str) -> GatewayResult<Principal> {
        let claims = self.verify_token(token).await?;
        let permissions = match self.store.find_user_by_id(&claims.sub).await {
            Some(user) => user.permissions,
            None => HashSet::from([Permission::Read]),
        };
        Ok(Principal {
            id: claims.sub,
            method: AuthMethod::Jwt,
            permissions,
            api_key: None,
        })
    }

    async fn verify_basic(&self, encoded: &str) -> GatewayResult<Principal> {
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| GatewayError::Unauthenticated("Malformed basic credential".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| GatewayError::Unauthenticated("Malformed basic credential".to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| GatewayError::Unauthenticated("Malformed basic credential".to_string()))?;

        let user = self.authenticate(username, password).await?;
        Ok(Principal {
            id: user.id,
            method: AuthMethod::Basic,
            permissions: user.permissions,
            api_key: None,
        })
    }

    /// Verify a username/password pair against the credential store.
    pub async fn authenticate(&self, username: &str, password: &str) -> GatewayResult<UserRecord> {
        let user = self
            .store
            .find_user(username)
            .await
            .ok_or_else(|| GatewayError::Unauthenticated("Invalid credentials".to_string()))?;
        let valid = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| GatewayError::Internal(format!("Password verification failed: {}", e)))?;
        if !valid {
            return Err(GatewayError::Unauthenticated(
                "Invalid credentials".to_string(),
            ));
        }
        Ok(user)
    }

    /// Mint an API key record. Key material is random and shown once.
    pub async fn create_api_key(
        &self,
        name: &str,
        permissions: HashSet<Permission>,
        quota_max_requests: Option<u32>,
        quota_window_ms: Option<u64>,
    ) -> ApiKeyRecord {
        use rand::Rng;
        let raw: [u8; 24] = rand::thread_rng().gen();
        let key = format!(
            "pk_{}",
            raw.iter().map(|b| format!("{:02x}", b)).collect::<String>()
        );
        let record = ApiKeyRecord {
            key,
            name: name.to_string(),
            permissions,
            quota_max_requests,
            quota_window_ms,
            created_at: Utc::now(),
            last_used: None,
        };
        self.store.insert_api_key(record.clone()).await;
        record
    }
}
