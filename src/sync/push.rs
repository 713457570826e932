//! Push collaborator
//!
//! The work loop hands every item to an [`ItemPusher`]. The HTTP
//! implementation posts one record per request to the destination API and
//! reports the raw outcome; deciding whether a failure is throttling is the
//! governor's job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;
use utoipa::ToSchema;

/// One product record submitted for sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ItemInput {
    /// Source identifier, used for error reporting and retry-subset lookups
    #[schema(example = "sku-1042")]
    pub external_id: String,
    /// Mapped record forwarded to the destination unchanged
    #[schema(value_type = Object)]
    pub payload: JsonValue,
}

/// Successful push acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReceipt {
    /// Identifier the destination assigned, when it returns one
    pub destination_id: Option<String>,
}

/// Raw push failure as observed by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The destination answered with a non-success status
    #[error("destination returned HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// The destination rejected the record without an HTTP status
    #[error("destination rejected item: {message}")]
    Rejected {
        code: Option<String>,
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// Transport failure or timeout
    #[error("network error: {details}")]
    Network { details: String, timed_out: bool },
}

impl PushError {
    pub fn code(&self) -> Option<&str> {
        match self {
            PushError::Http { code, .. } | PushError::Rejected { code, .. } => code.as_deref(),
            PushError::Network { timed_out: true, .. } => Some("TIMEOUT"),
            PushError::Network { .. } => Some("NETWORK_ERROR"),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PushError::Http { message, .. } | PushError::Rejected { message, .. } => message,
            PushError::Network { details, .. } => details,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            PushError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            PushError::Http {
                retry_after_secs, ..
            }
            | PushError::Rejected {
                retry_after_secs, ..
            } => *retry_after_secs,
            PushError::Network { .. } => None,
        }
    }
}

pub type PushResult = Result<PushReceipt, PushError>;

/// Pushes a single item to the destination account.
///
/// Implementations must not retry throttled calls themselves; the engine
/// pauses and re-pushes the same item.
#[async_trait]
pub trait ItemPusher: Send + Sync {
    async fn push(&self, destination_key: &str, item: &ItemInput) -> PushResult;
}

/// Error body shape accepted from the destination API.
#[derive(Debug, Default, Deserialize)]
struct DestinationErrorBody {
    #[serde(default, alias = "error_code")]
    code: Option<String>,
    #[serde(default, alias = "error", alias = "detail")]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DestinationItemBody {
    #[serde(default)]
    id: Option<JsonValue>,
}

#[derive(Serialize)]
struct PushBody<'a> {
    destination_key: &'a str,
    external_id: &'a str,
    payload: &'a JsonValue,
}

/// [`ItemPusher`] speaking JSON over HTTP: `POST {base}/items`.
#[derive(Debug, Clone)]
pub struct HttpItemPusher {
    http_client: Client,
    items_endpoint: Url,
    token: Option<String>,
}

impl HttpItemPusher {
    pub fn new(
        api_base: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let base = Url::parse(api_base)?;
        let items_endpoint = if base.path().ends_with('/') {
            base.join("items")?
        } else {
            Url::parse(&format!("{}/items", base.as_str().trim_end_matches('/')))?
        };

        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            items_endpoint,
            token,
        })
    }

    pub fn items_endpoint(&self) -> &Url {
        &self.items_endpoint
    }
}

#[async_trait]
impl ItemPusher for HttpItemPusher {
    async fn push(&self, destination_key: &str, item: &ItemInput) -> PushResult {
        let mut request = self
            .http_client
            .post(self.items_endpoint.clone())
            .header(header::ACCEPT, "application/json")
            .json(&PushBody {
                destination_key,
                external_id: &item.external_id,
                payload: &item.payload,
            });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| PushError::Network {
            details: format!("push request failed: {}", e),
            timed_out: e.is_timeout(),
        })?;

        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| parse_retry_after(raw, Utc::now()));

        let body = response.text().await.map_err(|e| PushError::Network {
            details: format!("failed to read destination response: {}", e),
            timed_out: e.is_timeout(),
        })?;

        if status.is_success() {
            let parsed: DestinationItemBody = serde_json::from_str(&body).unwrap_or_default();
            let destination_id = parsed.id.map(|id| match id {
                JsonValue::String(s) => s,
                other => other.to_string(),
            });
            return Ok(PushReceipt { destination_id });
        }

        let parsed: DestinationErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = parsed
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback_message(status, &body));

        Err(PushError::Http {
            status: status.as_u16(),
            code: parsed.code,
            message,
            retry_after_secs,
        })
    }
}

fn fallback_message(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        trimmed.chars().take(512).collect()
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.num_seconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_retry_after("2", now), Some(2));
        assert_eq!(parse_retry_after(" 120 ", now), Some(120));
        assert_eq!(
            parse_retry_after("Thu, 01 Oct 2026 12:00:30 GMT", now),
            Some(30)
        );
        assert_eq!(
            parse_retry_after("Thu, 01 Oct 2026 11:00:00 GMT", now),
            Some(0)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn items_endpoint_joins_base_path() {
        let pusher =
            HttpItemPusher::new("https://dest.example/api/v2", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            pusher.items_endpoint().as_str(),
            "https://dest.example/api/v2/items"
        );

        let pusher =
            HttpItemPusher::new("https://dest.example/api/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            pusher.items_endpoint().as_str(),
            "https://dest.example/api/items"
        );
    }

    #[test]
    fn push_error_accessors() {
        let err = PushError::Network {
            details: "timed out".to_string(),
            timed_out: true,
        };
        assert_eq!(err.code(), Some("TIMEOUT"));
        assert_eq!(err.status(), None);

        let err = PushError::Http {
            status: 422,
            code: Some("INVALID_PRICE".to_string()),
            message: "price must be positive".to_string(),
            retry_after_secs: None,
        };
        assert_eq!(err.code(), Some("INVALID_PRICE"));
        assert_eq!(err.status(), Some(422));
        assert_eq!(err.message(), "price must be positive");
    }
}
