use crate::error::ApiError;
use bytes::Bytes;
use http::{HeaderMap, Response};
use http_body_util::BodyExt;
use serde_json::Value;
use std::time::{Duration, SystemTime};

/// Maximum body preview carried by `ApiError::HttpStatus` (8KB).
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Boxed response body; holds either the raw or the decompressed stream.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Parse a `Retry-After` header: delay-seconds or an HTTP-date.
///
/// Returns `None` when the header is missing, unparseable, negative, or a
/// date in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

/// Turn a response into its JSON payload.
///
/// Non-2xx statuses become `ApiError::HttpStatus` with a bounded body
/// preview. An empty 2xx body decodes to `Value::Null`. A GraphQL envelope
/// with a non-empty `errors` array becomes `ApiError::GraphQl`.
///
/// # Errors
/// Status, body-size, transport and JSON failures as described above.
pub async fn json_payload(
    response: Response<ResponseBody>,
    max_body_size: usize,
) -> Result<Value, ApiError> {
    let bytes = checked_body(response, max_body_size).await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_json::from_slice(&bytes)?;
    graphql_errors(&value).map_or(Ok(value), |messages| Err(ApiError::GraphQl { messages }))
}

fn graphql_errors(value: &Value) -> Option<Vec<String>> {
    let errors = value.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .map(|e| {
                e.get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| e.to_string(), str::to_owned)
            })
            .collect(),
    )
}

/// Read the body of a 2xx response, or build `ApiError::HttpStatus` otherwise.
///
/// # Errors
/// See [`json_payload`].
pub async fn checked_body(
    response: Response<ResponseBody>,
    max_body_size: usize,
) -> Result<Bytes, ApiError> {
    let status = response.status();

    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());

        // A huge error body must not hide the status itself
        let preview_limit = max_body_size.min(ERROR_BODY_PREVIEW_LIMIT);
        let body_preview = match read_body_limited(response, preview_limit).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(ApiError::BodyTooLarge { .. }) => "<body too large for preview>".to_owned(),
            Err(e) => return Err(e),
        };

        return Err(ApiError::HttpStatus {
            status,
            body_preview,
            retry_after,
        });
    }

    read_body_limited(response, max_body_size).await
}

/// Collect the (possibly decompressed) body, failing once `limit` bytes are exceeded.
///
/// The limit applies after decompression.
///
/// # Errors
/// `ApiError::BodyTooLarge` past the limit, `ApiError::Transport` on stream errors.
pub async fn read_body_limited(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, ApiError> {
    let mut body = std::pin::pin!(response.into_body());
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ApiError::Transport(e.into()))?;
        if let Some(chunk) = frame.data_ref() {
            let actual = collected.len() + chunk.len();
            if actual > limit {
                return Err(ApiError::BodyTooLarge { limit, actual });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}
