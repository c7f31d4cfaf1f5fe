//! Identity gate. Every request crosses this before any handler: the
//! edge-issued Cloudflare Access token is verified against the team's JWKS
//! (cached for an hour), the audience checked, and the email claim gated by
//! the admin-maintained allowlist.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::config::Config;
use crate::errors::{GatewayError, GatewayResult};
use crate::settings::SettingsStore;

pub const ACCESS_TOKEN_HEADER: &str = "cf-access-jwt-assertion";
pub const DEV_EMAIL_HEADER: &str = "x-dev-email";
pub const DEV_EMAIL_PARAM: &str = "devEmail";

const JWKS_TTL: Duration = Duration::from_secs(60 * 60);
const JWKS_FETCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub email: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    email: Option<String>,
}

struct CachedJwks {
    keys: Vec<Jwk>,
    fetched_at: Instant,
}

pub struct IdentityGate {
    config: Arc<Config>,
    settings: Arc<SettingsStore>,
    http: reqwest::Client,
    jwks: tokio::sync::RwLock<Option<CachedJwks>>,
}

impl IdentityGate {
    pub fn new(config: Arc<Config>, settings: Arc<SettingsStore>) -> Self {
        Self {
            config,
            settings,
            http: reqwest::Client::new(),
            jwks: tokio::sync::RwLock::new(None),
        }
    }

    /// Verifies the request identity. Works from raw headers and query
    /// parameters so HTTP middleware and WS upgrades share one path.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> GatewayResult<AuthUser> {
        if self.config.dev_auth && !self.config.is_production() {
            let dev_email = headers
                .get(DEV_EMAIL_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .or_else(|| query.get(DEV_EMAIL_PARAM).cloned());
            if let Some(email) = dev_email {
                return self.gate_email(email.trim().to_lowercase());
            }
        }

        let token = headers
            .get(ACCESS_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::Unauthorized)?;

        let aud = self
            .config
            .cf_access_aud
            .as_deref()
            .ok_or_else(|| GatewayError::Config("CF_ACCESS_AUD not configured".into()))?;

        let header = decode_header(token).map_err(|e| {
            debug!("[auth] undecodable token header: {e}");
            GatewayError::Unauthorized
        })?;
        let kid = header.kid.ok_or(GatewayError::Unauthorized)?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[aud]);
        let data = decode::<AccessClaims>(token, &key, &validation).map_err(|e| {
            debug!("[auth] token rejected: {e}");
            GatewayError::Unauthorized
        })?;

        let email = data
            .claims
            .email
            .ok_or(GatewayError::Unauthorized)?
            .trim()
            .to_lowercase();
        self.gate_email(email)
    }

    fn gate_email(&self, email: String) -> GatewayResult<AuthUser> {
        if email.is_empty() {
            return Err(GatewayError::Unauthorized);
        }
        if self.settings.allowlist_is_empty() {
            if self.config.is_production() {
                return Err(GatewayError::Config("allowlist not configured".into()));
            }
            return Err(GatewayError::Forbidden);
        }
        if !self.settings.is_allowed(&email) {
            return Err(GatewayError::Forbidden);
        }
        let is_admin = self.settings.is_admin(&email);
        Ok(AuthUser { email, is_admin })
    }

    async fn decoding_key(&self, kid: &str) -> GatewayResult<DecodingKey> {
        if let Some(key) = self.key_from_cache(kid, false).await {
            return Ok(key);
        }
        self.refresh_jwks().await?;
        self.key_from_cache(kid, true)
            .await
            .ok_or(GatewayError::Unauthorized)
    }

    async fn key_from_cache(&self, kid: &str, allow_stale: bool) -> Option<DecodingKey> {
        let cache = self.jwks.read().await;
        let cached = cache.as_ref()?;
        if !allow_stale && cached.fetched_at.elapsed() >= JWKS_TTL {
            return None;
        }
        cached
            .keys
            .iter()
            .filter(|k| k.kty == "RSA" && k.kid.as_deref() == Some(kid))
            .find_map(|k| {
                let n = k.n.as_deref()?;
                let e = k.e.as_deref()?;
                DecodingKey::from_rsa_components(n, e).ok()
            })
    }

    /// Remote fetch with exponential backoff; the one place in the core where
    /// retries are acceptable.
    async fn refresh_jwks(&self) -> GatewayResult<()> {
        let team_domain = self
            .config
            .cf_access_team_domain
            .as_deref()
            .ok_or_else(|| GatewayError::Config("CF_ACCESS_TEAM_DOMAIN not configured".into()))?;
        let url = format!("https://{team_domain}/cdn-cgi/access/certs");

        let mut delay = Duration::from_millis(200);
        let mut last_error = None;
        for attempt in 0..JWKS_FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            match self.fetch_jwks(&url).await {
                Ok(doc) => {
                    *self.jwks.write().await = Some(CachedJwks {
                        keys: doc.keys,
                        fetched_at: Instant::now(),
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!("[auth] jwks fetch attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }
        Err(GatewayError::Internal(format!(
            "jwks fetch failed: {}",
            last_error.unwrap_or_else(|| "unknown".into())
        )))
    }

    async fn fetch_jwks(&self, url: &str) -> Result<JwksDocument, String> {
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        response.json::<JwksDocument>().await.map_err(|e| e.to_string())
    }
}

/// Router middleware: verified identity lands in request extensions; handlers
/// read it with `Extension<AuthUser>`.
pub async fn auth_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let query = parse_query(request.uri().query());
    match state.auth.authenticate(request.headers(), &query).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    match raw {
        Some(raw) => url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect(),
        None => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Environment};

    fn test_config(dev_auth: bool, production: bool) -> Arc<Config> {
        Arc::new(Config {
            host: "127.0.0.1".into(),
            port: 0,
            environment: if production {
                Environment::Production
            } else {
                Environment::Development
            },
            repo_roots: vec![],
            allowlist_emails: vec![],
            admin_emails: vec![],
            cf_access_team_domain: None,
            cf_access_aud: None,
            dev_auth,
            max_sessions_per_user: 3,
            max_total_sessions: 20,
            disconnected_ttl_minutes: 20,
            max_file_size_bytes: 2_000_000,
            tasks_enabled: false,
            claude_path: "claude".into(),
            data_dir: std::env::temp_dir(),
        })
    }

    fn store(allow: &[&str], admin: &[&str]) -> Arc<SettingsStore> {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SettingsStore::load(
            tmp.path(),
            allow.iter().map(|s| s.to_string()).collect(),
            admin.iter().map(|s| s.to_string()).collect(),
        );
        // Leak the tempdir so the store path stays valid for the test.
        std::mem::forget(tmp);
        Arc::new(store)
    }

    #[tokio::test]
    async fn dev_mode_header_is_gated_by_allowlist() {
        let gate = IdentityGate::new(test_config(true, false), store(&["a@x"], &[]));
        let mut headers = HeaderMap::new();
        headers.insert(DEV_EMAIL_HEADER, "A@X".parse().unwrap());

        let user = gate.authenticate(&headers, &HashMap::new()).await.unwrap();
        assert_eq!(user.email, "a@x");
        assert!(!user.is_admin);

        headers.insert(DEV_EMAIL_HEADER, "intruder@x".parse().unwrap());
        let err = gate.authenticate(&headers, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden));
    }

    #[tokio::test]
    async fn dev_mode_off_requires_token() {
        let gate = IdentityGate::new(test_config(false, false), store(&["a@x"], &[]));
        let mut headers = HeaderMap::new();
        headers.insert(DEV_EMAIL_HEADER, "a@x".parse().unwrap());
        let err = gate.authenticate(&headers, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized));
    }

    #[tokio::test]
    async fn admin_flag_follows_settings() {
        let gate = IdentityGate::new(test_config(true, false), store(&["a@x"], &["a@x"]));
        let params: HashMap<String, String> =
            [(DEV_EMAIL_PARAM.to_string(), "a@x".to_string())].into();
        let user = gate.authenticate(&HeaderMap::new(), &params).await.unwrap();
        assert!(user.is_admin);
    }

    #[test]
    fn query_parsing_decodes_components() {
        let parsed = parse_query(Some("repoId=r%2Fdemo&devEmail=a%40x&flag"));
        assert_eq!(parsed.get("repoId").unwrap(), "r/demo");
        assert_eq!(parsed.get("devEmail").unwrap(), "a@x");
        assert_eq!(parsed.get("flag").unwrap(), "");
    }
}
