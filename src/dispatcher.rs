//! External webhook dispatcher.
//!
//! `dispatch` fans an event out to every enabled subscriber and settles
//! the deliveries in parallel; a slow or failing subscriber never blocks
//! another, and nothing propagates to the event producer. Per subscriber
//! the circuit-breaker gate runs first, then the event/instance filters;
//! each delivery builds the signed/authed request and drives the retry
//! loop from the subscriber's own config.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::PgPool;

use crate::breaker::CircuitBreakerSet;
use crate::events::EventKind;
use crate::webhooks::{
    self, AuthenticationConfig, SignatureAlgorithm, Webhook,
};

/// JWT minted per delivery expires after ten minutes.
const JWT_TTL_SECS: u64 = 600;

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: u64,
    exp: u64,
    app: &'static str,
    action: &'static str,
}

/// Outcome of one subscriber delivery (all retries settled).
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct WebhookDispatcher {
    db: PgPool,
    http: reqwest::Client,
    breakers: Arc<CircuitBreakerSet>,
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl WebhookDispatcher {
    pub fn new(db: PgPool, http: reqwest::Client, breakers: Arc<CircuitBreakerSet>) -> Self {
        Self {
            db,
            http,
            breakers,
            dispatched: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Fan an event out to all matching subscribers. Returns after every
    /// delivery has settled; never errors toward the producer.
    pub async fn dispatch(&self, event: EventKind, payload: Value, instance: Option<String>) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let rows = match webhooks::list_enabled(&self.db).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("dispatch {}: failed to load subscribers: {}", event, e);
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        let deliveries = rows.iter().filter_map(|row| {
            let hook = Webhook::from(row);
            // Breaker gate first: an open circuit skips the subscriber
            // before any filter runs.
            if !self.breakers.allow(hook.id) {
                tracing::warn!(
                    "webhook {} ({}): circuit open, skipping {}",
                    hook.name,
                    hook.id,
                    event
                );
                return None;
            }
            if !self.matches(&hook, event, instance.as_deref()) {
                return None;
            }
            Some(self.deliver(hook, event, payload.clone(), instance.clone()))
        });
        futures_util::future::join_all(deliveries).await;
    }

    /// Subscriber-side filters: event list (empty = all) and instance
    /// allow/deny lists.
    fn matches(&self, hook: &Webhook, event: EventKind, instance: Option<&str>) -> bool {
        if !hook.events.is_empty() && !hook.events.iter().any(|e| e == event.as_str()) {
            return false;
        }
        hook.filter_config.matches(instance)
    }

    /// Deliver one event to one subscriber, driving the retry loop and
    /// recording stats + breaker transitions. Returns the outcome for
    /// callers that care (the test endpoint); `dispatch` ignores it.
    /// Re-checks the breaker gate so direct callers are covered too;
    /// `dispatch` has already passed it by the time this runs.
    pub async fn deliver(
        &self,
        hook: Webhook,
        event: EventKind,
        payload: Value,
        instance: Option<String>,
    ) -> DeliveryOutcome {
        let started = Instant::now();

        if !self.breakers.allow(hook.id) {
            tracing::warn!(
                "webhook {} ({}): circuit open, skipping {}",
                hook.name,
                hook.id,
                event
            );
            return DeliveryOutcome {
                success: false,
                attempts: 0,
                duration_ms: 0,
                error: Some("circuit breaker open".into()),
            };
        }

        let envelope = json!({
            "event": event.as_str(),
            "instance": instance,
            "data": payload,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "webhook": { "id": hook.id.to_string(), "name": hook.name },
        });
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("webhook {}: envelope serialization failed: {}", hook.id, e);
                return self.settle_failure(&hook, started, 0, format!("serialize: {}", e)).await;
            }
        };

        let headers = match build_headers(&hook, &body) {
            Ok(headers) => headers,
            Err(e) => {
                tracing::error!("webhook {} ({}): bad header config: {}", hook.name, hook.id, e);
                return self.settle_failure(&hook, started, 0, e).await;
            }
        };

        let retry = &hook.retry_config;
        let timeout = Duration::from_millis(hook.timeout_ms.max(0) as u64);
        let mut last_error = String::new();

        for attempt in 1..=retry.max_attempts {
            let attempt_started = Instant::now();
            let result = self
                .http
                .post(&hook.url)
                .headers(headers.clone())
                .timeout(timeout)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() || status.is_redirection() {
                        let duration = attempt_started.elapsed().as_millis() as u64;
                        tracing::info!(
                            "webhook {} ({}): {} delivered, status {} in {}ms (attempt {}/{})",
                            hook.name,
                            hook.id,
                            event,
                            status.as_u16(),
                            duration,
                            attempt,
                            retry.max_attempts
                        );
                        webhooks::record_success(&self.db, hook.id, duration).await;
                        self.breakers.record_success(hook.id);
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                        return DeliveryOutcome {
                            success: true,
                            attempts: attempt,
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: None,
                        };
                    }
                    if retry.is_non_retryable(status.as_u16()) {
                        let error = format!("non-retryable status {}", status.as_u16());
                        return self.settle_failure(&hook, started, attempt, error).await;
                    }
                    last_error = format!("status {}", status.as_u16());
                }
                Err(e) if e.is_timeout() => {
                    last_error = format!("timeout after {}ms", hook.timeout_ms);
                }
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                }
            }

            if attempt < retry.max_attempts {
                let delay = retry.backoff_delay(attempt, rand::thread_rng().gen_range(-1.0..=1.0));
                tracing::debug!(
                    "webhook {}: attempt {}/{} failed ({}), retrying in {:.1}s",
                    hook.id,
                    attempt,
                    retry.max_attempts,
                    last_error,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.settle_failure(&hook, started, retry.max_attempts, last_error)
            .await
    }

    async fn settle_failure(
        &self,
        hook: &Webhook,
        started: Instant,
        attempts: u32,
        error: String,
    ) -> DeliveryOutcome {
        tracing::warn!(
            "webhook {} ({}): delivery failed after {} attempt(s): {}",
            hook.name,
            hook.id,
            attempts,
            error
        );
        webhooks::record_failure(&self.db, hook.id, &error).await;
        self.breakers.record_failure(hook.id);
        self.failed.fetch_add(1, Ordering::Relaxed);
        DeliveryOutcome {
            success: false,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(error),
        }
    }

    /// Process-local counters for the metrics endpoint.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.dispatched.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

// ── Request construction ────────────────────────────────────────────────

/// Static headers + content-type + auth + optional body signature.
fn build_headers(hook: &Webhook, body: &[u8]) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    for (name, value) in &hook.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("invalid header name: {}", name))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| format!("invalid header value for {}", name))?;
        headers.insert(name, value);
    }

    match &hook.authentication {
        AuthenticationConfig::None => {}
        AuthenticationConfig::Bearer { token } => {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| "invalid bearer token".to_string())?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        AuthenticationConfig::Basic { user, pass } => {
            let encoded = BASE64.encode(format!("{}:{}", user, pass));
            let value = HeaderValue::from_str(&format!("Basic {}", encoded))
                .map_err(|_| "invalid basic credentials".to_string())?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        AuthenticationConfig::ApiKey { token, header } => {
            let name = HeaderName::from_bytes(header.as_bytes())
                .map_err(|_| format!("invalid api-key header name: {}", header))?;
            let value =
                HeaderValue::from_str(token).map_err(|_| "invalid api-key token".to_string())?;
            headers.insert(name, value);
        }
        AuthenticationConfig::Jwt { secret } => {
            let token = mint_jwt(secret).map_err(|e| format!("jwt mint failed: {}", e))?;
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| "invalid jwt".to_string())?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
    }

    let security = &hook.security_config;
    if security.enable_signature_validation {
        let secret = security
            .signature_secret
            .as_deref()
            .ok_or_else(|| "signature enabled without secret".to_string())?;
        let signature = sign_body(security.signature_algorithm, secret, body);
        let name = HeaderName::from_bytes(security.signature_header.as_bytes())
            .map_err(|_| format!("invalid signature header: {}", security.signature_header))?;
        let value = HeaderValue::from_str(&signature)
            .map_err(|_| "invalid signature value".to_string())?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// `<algo>=<hex hmac of the raw body>` — the value receivers recompute.
pub fn sign_body(algorithm: SignatureAlgorithm, secret: &str, body: &[u8]) -> String {
    let hexmac = match algorithm {
        SignatureAlgorithm::Sha256 => {
            let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        SignatureAlgorithm::Sha1 => {
            let mut mac = Hmac::<sha1::Sha1>::new_from_slice(secret.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        SignatureAlgorithm::Md5 => {
            let mut mac = Hmac::<md5::Md5>::new_from_slice(secret.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
    };
    format!("{}={}", algorithm.as_str(), hexmac)
}

fn mint_jwt(secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let iat = chrono::Utc::now().timestamp().max(0) as u64;
    let claims = JwtClaims {
        iat,
        exp: iat + JWT_TTL_SECS,
        app: "relaypool",
        action: "webhook",
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::SecurityConfig;

    fn hook_with(auth: AuthenticationConfig, security: SecurityConfig) -> Webhook {
        Webhook {
            id: uuid::Uuid::new_v4(),
            name: "t".into(),
            url: "https://hooks.example.com".into(),
            enabled: true,
            description: None,
            events: vec![],
            headers: Default::default(),
            authentication: auth,
            retry_config: Default::default(),
            security_config: security,
            filter_config: Default::default(),
            timeout_ms: 30_000,
        }
    }

    #[test]
    fn hmac_sha256_known_value() {
        // Receiver-side recomputation must produce the identical header.
        let body = br#"{"ping":1}"#;
        let value = sign_body(SignatureAlgorithm::Sha256, "0123456789abcdef", body);
        assert!(value.starts_with("sha256="));
        let hex_part = value.strip_prefix("sha256=").unwrap();
        assert_eq!(hex_part.len(), 64);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));

        let mut mac =
            Hmac::<sha2::Sha256>::new_from_slice(b"0123456789abcdef").unwrap();
        mac.update(body);
        assert_eq!(hex_part, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn signature_algorithms_have_distinct_lengths() {
        let body = b"x";
        let s256 = sign_body(SignatureAlgorithm::Sha256, "kkkkkkkkkkkkkkkk", body);
        let s1 = sign_body(SignatureAlgorithm::Sha1, "kkkkkkkkkkkkkkkk", body);
        let m5 = sign_body(SignatureAlgorithm::Md5, "kkkkkkkkkkkkkkkk", body);
        assert_eq!(s256.strip_prefix("sha256=").unwrap().len(), 64);
        assert_eq!(s1.strip_prefix("sha1=").unwrap().len(), 40);
        assert_eq!(m5.strip_prefix("md5=").unwrap().len(), 32);
    }

    #[test]
    fn bearer_auth_header() {
        let hook = hook_with(
            AuthenticationConfig::Bearer { token: "tok".into() },
            SecurityConfig::default(),
        );
        let headers = build_headers(&hook, b"{}").unwrap();
        assert_eq!(headers["authorization"], "Bearer tok");
        assert_eq!(headers["content-type"], "application/json");
    }

    #[test]
    fn basic_auth_header_is_base64() {
        let hook = hook_with(
            AuthenticationConfig::Basic {
                user: "u".into(),
                pass: "p".into(),
            },
            SecurityConfig::default(),
        );
        let headers = build_headers(&hook, b"{}").unwrap();
        assert_eq!(headers["authorization"], "Basic dTpw");
    }

    #[test]
    fn api_key_uses_configured_header() {
        let hook = hook_with(
            AuthenticationConfig::ApiKey {
                token: "secret".into(),
                header: "X-Api-Key".into(),
            },
            SecurityConfig::default(),
        );
        let headers = build_headers(&hook, b"{}").unwrap();
        assert_eq!(headers["x-api-key"], "secret");
        assert!(!headers.contains_key("authorization"));
    }

    #[test]
    fn jwt_auth_mints_decodable_token() {
        let hook = hook_with(
            AuthenticationConfig::Jwt {
                secret: "jwt-secret-000000".into(),
            },
            SecurityConfig::default(),
        );
        let headers = build_headers(&hook, b"{}").unwrap();
        let auth = headers["authorization"].to_str().unwrap();
        let token = auth.strip_prefix("Bearer ").unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(b"jwt-secret-000000"),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims["app"], "relaypool");
        assert_eq!(decoded.claims["action"], "webhook");
        let iat = decoded.claims["iat"].as_u64().unwrap();
        let exp = decoded.claims["exp"].as_u64().unwrap();
        assert_eq!(exp - iat, JWT_TTL_SECS);
    }

    #[test]
    fn signature_header_present_when_enabled() {
        let hook = hook_with(
            AuthenticationConfig::None,
            SecurityConfig {
                enable_signature_validation: true,
                signature_secret: Some("0123456789abcdef".into()),
                signature_header: "X-Hub-Signature".into(),
                signature_algorithm: SignatureAlgorithm::Sha256,
            },
        );
        let body = br#"{"ping":1}"#;
        let headers = build_headers(&hook, body).unwrap();
        let expected = sign_body(SignatureAlgorithm::Sha256, "0123456789abcdef", body);
        assert_eq!(headers["x-hub-signature"], expected.as_str());
    }

    #[test]
    fn custom_headers_are_merged() {
        let mut hook = hook_with(AuthenticationConfig::None, SecurityConfig::default());
        hook.headers.insert("X-Custom".into(), "42".into());
        let headers = build_headers(&hook, b"{}").unwrap();
        assert_eq!(headers["x-custom"], "42");
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let mut hook = hook_with(AuthenticationConfig::None, SecurityConfig::default());
        hook.headers.insert("bad name".into(), "v".into());
        assert!(build_headers(&hook, b"{}").is_err());
    }
}
