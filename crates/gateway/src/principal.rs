//! Calling-account resolution
//!
//! The gate attributes a request to a farmer account using, in order of
//! preference: a bearer JWT, a session token, an explicit `farmer_id` query
//! parameter, and (for WhatsApp-originated calls) the sender's phone
//! number. Resolution failure is not an error; unattributable requests pass
//! through ungated.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use avaolo_shared::FarmerId;

/// JWT claims carried by authenticated callers.
#[derive(Debug, Deserialize)]
pub struct Claims {
    /// Farmer id
    pub sub: String,
    pub exp: usize,
}

/// Decode the farmer id from a `Bearer` token, if present and valid.
pub fn farmer_from_bearer(headers: &HeaderMap, jwt_secret: &str) -> Option<FarmerId> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    Uuid::parse_str(&data.claims.sub).ok().map(FarmerId)
}

/// Extract a session token from the `ava_session` cookie or the
/// `X-Session-Token` header.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers.get("x-session-token").and_then(|v| v.to_str().ok()) {
        return Some(token.to_string());
    }

    let cookies = headers.get("cookie").and_then(|v| v.to_str().ok())?;
    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == "ava_session" {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Resolve a session token against the sessions table.
pub async fn farmer_from_session(pool: &PgPool, token: &str) -> Option<FarmerId> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT farmer_id FROM sessions WHERE token = $1 AND expires_at > NOW()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::warn!(error = %e, "Session lookup failed");
        e
    })
    .ok()
    .flatten();

    row.map(|(id,)| FarmerId(id))
}

/// Pull `farmer_id` out of a raw query string.
pub fn farmer_from_query(query: &str) -> Option<FarmerId> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "farmer_id")
        .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok())
        .map(FarmerId)
}

/// Pull the sender (`From` field) out of a Twilio form-encoded body.
pub fn whatsapp_sender(body: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(body)
        .find(|(name, _)| name == "From")
        .map(|(_, value)| value.into_owned())
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_farmer_from_query() {
        let id = Uuid::new_v4();
        let query = format!("foo=bar&farmer_id={}", id);
        assert_eq!(farmer_from_query(&query), Some(FarmerId(id)));
        assert_eq!(farmer_from_query("foo=bar"), None);
        assert_eq!(farmer_from_query("farmer_id=not-a-uuid"), None);
    }

    #[test]
    fn test_whatsapp_sender_decoded() {
        let body = b"MessageSid=SM123&From=whatsapp%3A%2B385911234567&Body=hello";
        assert_eq!(
            whatsapp_sender(body).as_deref(),
            Some("whatsapp:+385911234567")
        );
        assert_eq!(whatsapp_sender(b"Body=hello"), None);
        assert_eq!(whatsapp_sender(b"From="), None);
    }

    #[test]
    fn test_session_token_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "theme=dark; ava_session=tok123".parse().unwrap());
        assert_eq!(session_token(&headers).as_deref(), Some("tok123"));

        let mut headers = HeaderMap::new();
        headers.insert("x-session-token", "tok456".parse().unwrap());
        assert_eq!(session_token(&headers).as_deref(), Some("tok456"));

        assert_eq!(session_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_bearer_rejects_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer not-a-jwt".parse().unwrap());
        assert_eq!(farmer_from_bearer(&headers, "secret"), None);
    }
}
