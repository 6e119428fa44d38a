//! Bearer credential authentication and scope authorization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::{AuthConfig, TokenConfig};
use crate::error::{GatewayError, Result};
use crate::types::TenantId;
use crate::utils::sha256;

/// Permission families a credential can carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Signing, proof of ownership, request status.
    #[serde(alias = "keyOperationToken")]
    KeyOperation,
    /// Generate, suspend, resume, revoke, rotate, renew.
    #[serde(alias = "keyManagementToken")]
    KeyManagement,
    /// Audit export and recovery.
    #[serde(alias = "serviceToken")]
    Service,
}

/// Who a credential belongs to and what it may do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: TenantId,
    pub scopes: Vec<Scope>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

/// Resolves a raw token to an identity. `Ok(None)` means the token is unknown.
#[async_trait]
pub trait CredentialIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<Option<Identity>>;
}

/// Tokens provisioned through configuration.
pub struct StaticTokenIntrospector {
    tokens: Vec<([u8; 32], Identity)>,
}

impl StaticTokenIntrospector {
    pub fn new(tokens: &[TokenConfig]) -> Self {
        let tokens = tokens
            .iter()
            .map(|t| {
                (
                    sha256(t.token.as_bytes()),
                    Identity {
                        tenant_id: t.tenant_id.clone(),
                        scopes: t.scopes.clone(),
                        expires_at: t.expires_at,
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl CredentialIntrospector for StaticTokenIntrospector {
    async fn introspect(&self, token: &str) -> Result<Option<Identity>> {
        let presented = sha256(token.as_bytes());
        let mut found = None;
        // Scan every entry so timing does not depend on match position
        for (digest, identity) in &self.tokens {
            if bool::from(digest[..].ct_eq(&presented[..])) && found.is_none() {
                found = Some(identity.clone());
            }
        }
        Ok(found)
    }
}

/// Default bound on cached introspection results.
pub const MAX_CACHED_CREDENTIALS: usize = 4096;

struct CachedIdentity {
    identity: Identity,
    valid_until: DateTime<Utc>,
}

pub struct AuthGate {
    introspector: Arc<dyn CredentialIntrospector>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<[u8; 32], CachedIdentity>>,
    cache_limit: usize,
}

/// Accepts `Bearer <token>` or a bare token.
fn extract_token(credential: &str) -> &str {
    let trimmed = credential.trim();
    match trimmed.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => trimmed,
    }
}

impl AuthGate {
    pub fn new(introspector: Arc<dyn CredentialIntrospector>, cache_ttl: Duration) -> Self {
        Self {
            introspector,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            cache_limit: MAX_CACHED_CREDENTIALS,
        }
    }

    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit;
        self
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(Arc::new(StaticTokenIntrospector::new(&config.tokens)), config.cache_ttl())
    }

    /// Resolve `credential` to an identity or fail with `Unauthorized`.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity> {
        let token = credential.map(extract_token).unwrap_or("");
        if token.is_empty() {
            return Err(GatewayError::unauthorized("missing bearer credential"));
        }

        let cache_key = sha256(token.as_bytes());
        let now = Utc::now();
        {
            let mut cache = self.cache.lock();
            match cache.get(&cache_key) {
                Some(hit) if hit.valid_until > now => return Ok(hit.identity.clone()),
                Some(_) => {
                    cache.remove(&cache_key);
                }
                None => {}
            }
        }

        let identity = self
            .introspector
            .introspect(token)
            .await?
            .ok_or_else(|| GatewayError::unauthorized("invalid bearer credential"))?;

        if let Some(expires_at) = identity.expires_at {
            if expires_at <= now {
                warn!(tenant_id = %identity.tenant_id, %expires_at, "expired credential presented");
                return Err(GatewayError::unauthorized("credential expired"));
            }
        }

        let ttl = chrono::Duration::from_std(self.cache_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut valid_until = now + ttl;
        if let Some(expires_at) = identity.expires_at {
            valid_until = valid_until.min(expires_at);
        }
        if valid_until > now && self.cache_limit > 0 {
            let mut cache = self.cache.lock();
            cache.retain(|_, cached| cached.valid_until > now);
            if cache.len() >= self.cache_limit && !cache.contains_key(&cache_key) {
                // Full of live entries: drop the one closest to expiry
                let soonest = cache.iter().min_by_key(|(_, cached)| cached.valid_until).map(|(key, _)| *key);
                if let Some(key) = soonest {
                    cache.remove(&key);
                }
            }
            cache.insert(cache_key, CachedIdentity { identity: identity.clone(), valid_until });
        }
        debug!(tenant_id = %identity.tenant_id, scopes = ?identity.scopes, "credential introspected");
        Ok(identity)
    }

    /// Fail with `Forbidden` unless `identity` carries `scope`.
    pub fn authorize(&self, identity: &Identity, scope: Scope) -> Result<()> {
        if identity.has_scope(scope) {
            Ok(())
        } else {
            Err(GatewayError::forbidden(format!(
                "tenant {} lacks the {:?} scope",
                identity.tenant_id, scope
            )))
        }
    }

    pub fn cached_credentials(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingIntrospector {
        inner: StaticTokenIntrospector,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialIntrospector for CountingIntrospector {
        async fn introspect(&self, token: &str) -> Result<Option<Identity>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.introspect(token).await
        }
    }

    fn token(token: &str, expires_at: Option<DateTime<Utc>>) -> TokenConfig {
        TokenConfig {
            token: token.into(),
            tenant_id: "tenant-a".into(),
            scopes: vec![Scope::KeyOperation],
            expires_at,
        }
    }

    fn gate(tokens: &[TokenConfig], ttl: Duration) -> (AuthGate, Arc<CountingIntrospector>) {
        let introspector = Arc::new(CountingIntrospector {
            inner: StaticTokenIntrospector::new(tokens),
            calls: AtomicU32::new(0),
        });
        (AuthGate::new(introspector.clone(), ttl), introspector)
    }

    #[tokio::test]
    async fn test_bearer_and_bare_tokens_resolve() {
        let (gate, _) = gate(&[token("s3cret", None)], Duration::from_secs(60));
        let a = gate.authenticate(Some("Bearer s3cret")).await.unwrap();
        let b = gate.authenticate(Some("s3cret")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.tenant_id.as_str(), "tenant-a");
    }

    #[tokio::test]
    async fn test_missing_and_unknown_are_unauthorized() {
        let (gate, _) = gate(&[token("s3cret", None)], Duration::from_secs(60));
        assert!(matches!(gate.authenticate(None).await, Err(GatewayError::Unauthorized { .. })));
        assert!(matches!(gate.authenticate(Some("Bearer ")).await, Err(GatewayError::Unauthorized { .. })));
        assert!(matches!(gate.authenticate(Some("wrong")).await, Err(GatewayError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_introspection_is_cached() {
        let (gate, introspector) = gate(&[token("s3cret", None)], Duration::from_secs(60));
        for _ in 0..5 {
            gate.authenticate(Some("s3cret")).await.unwrap();
        }
        assert_eq!(introspector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.cached_credentials(), 1);
    }

    #[tokio::test]
    async fn test_cache_never_outlives_token() {
        let expires = Utc::now() + chrono::Duration::milliseconds(100);
        let (gate, _) = gate(&[token("short", Some(expires))], Duration::from_secs(300));
        gate.authenticate(Some("short")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(gate.authenticate(Some("short")).await, Err(GatewayError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_expired_entries_are_pruned_on_insert() {
        let expires = Utc::now() + chrono::Duration::milliseconds(100);
        let tokens = [token("short", Some(expires)), token("other", None)];
        let (gate, _) = gate(&tokens, Duration::from_secs(300));
        gate.authenticate(Some("short")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // "short" is never presented again
        gate.authenticate(Some("other")).await.unwrap();
        assert_eq!(gate.cached_credentials(), 1);
    }

    #[tokio::test]
    async fn test_cache_size_is_bounded() {
        let tokens: Vec<TokenConfig> = (0..5).map(|n| token(&format!("t{}", n), None)).collect();
        let (gate, introspector) = gate(&tokens, Duration::from_secs(60));
        let gate = gate.with_cache_limit(3);
        for n in 0..5 {
            gate.authenticate(Some(&format!("t{}", n))).await.unwrap();
        }
        assert_eq!(gate.cached_credentials(), 3);

        // The most recent entries stayed
        gate.authenticate(Some("t4")).await.unwrap();
        assert_eq!(introspector.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_missing_scope_is_forbidden() {
        let (gate, _) = gate(&[token("s3cret", None)], Duration::from_secs(60));
        let identity = gate.authenticate(Some("s3cret")).await.unwrap();
        assert!(gate.authorize(&identity, Scope::KeyOperation).is_ok());
        assert!(matches!(
            gate.authorize(&identity, Scope::KeyManagement),
            Err(GatewayError::Forbidden { .. })
        ));
    }
}
