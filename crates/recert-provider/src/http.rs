use recert_core::RecertError;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;

/// Send `request`, mapping transport failures to a provider error.
pub(crate) async fn send(
    provider: &'static str,
    request: RequestBuilder,
) -> Result<Response, RecertError> {
    request
        .send()
        .await
        .map_err(|e| RecertError::provider(provider, format!("request failed: {e}")))
}

/// Decode a successful JSON body, or turn a failure status into an error.
pub(crate) async fn json(provider: &'static str, response: Response) -> Result<Value, RecertError> {
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(provider, response).await);
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    response
        .json()
        .await
        .map_err(|e| RecertError::provider(provider, format!("invalid response body: {e}")))
}

/// Error for a non-success response, including the body text.
pub(crate) async fn status_error(provider: &'static str, response: Response) -> RecertError {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    RecertError::provider(provider, format!("API error {status} from {url}: {body}"))
}

/// String field of a JSON object, or an error naming the field.
pub(crate) fn str_field<'a>(
    provider: &'static str,
    value: &'a Value,
    field: &str,
) -> Result<&'a str, RecertError> {
    value[field]
        .as_str()
        .ok_or_else(|| RecertError::provider(provider, format!("response is missing '{field}'")))
}

/// Parse an RFC 3339 timestamp field, if present.
pub(crate) fn time_field(value: &Value, field: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    value[field]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
}
