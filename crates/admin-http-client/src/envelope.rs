//! Decoding of raw transport responses into a [`ResponseEnvelope`].

use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ApiError;

/// Response body shape, chosen from the declared content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Text,
    Binary,
}

impl ContentKind {
    #[must_use]
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(raw) = content_type else {
            return Self::Binary;
        };
        let essence = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence == "application/json" || essence.ends_with("+json") {
            Self::Json
        } else if essence.starts_with("text/") {
            Self::Text
        } else {
            Self::Binary
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Deserialize into a caller type.
    ///
    /// Text becomes a JSON string and an empty binary body becomes `null`, so
    /// `String`, `()` and `Option<T>` callers work against text and 204 replies.
    pub fn deserialize<T>(self) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let value = match self {
            Self::Json(value) => value,
            Self::Text(text) => Value::String(text),
            Self::Binary(bytes) if bytes.is_empty() => Value::Null,
            Self::Binary(bytes) => {
                return Err(ApiError::Decode {
                    message: format!("expected a JSON payload, got {} binary bytes", bytes.len()),
                });
            }
        };
        serde_json::from_value(value).map_err(ApiError::decode)
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Json(value) => value.to_string().into_bytes(),
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// Normalized view of one transport round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub data: Payload,
    pub status: Option<u16>,
    pub ok: Option<bool>,
    /// Server-defined business status, distinct from the transport status.
    pub code: Option<i64>,
    pub msg: Option<String>,
}

pub fn decode_body(
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ResponseEnvelope, ApiError> {
    let mut envelope = ResponseEnvelope {
        data: Payload::Binary(Vec::new()),
        status: Some(status),
        ok: Some((200..=299).contains(&status)),
        code: None,
        msg: None,
    };

    match ContentKind::from_content_type(content_type) {
        ContentKind::Json => {
            let value: Value = serde_json::from_slice(body).map_err(ApiError::decode)?;
            match value {
                Value::Object(mut object) => {
                    envelope.code = object.get("code").and_then(business_code);
                    envelope.msg = object
                        .get("msg")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    envelope.data = match object.remove("data") {
                        Some(data) => Payload::Json(data),
                        None => Payload::Json(Value::Object(object)),
                    };
                }
                other => envelope.data = Payload::Json(other),
            }
        }
        ContentKind::Text => {
            let text = String::from_utf8_lossy(body).into_owned();
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                envelope.msg = Some(trimmed.to_string());
            }
            envelope.data = Payload::Text(text);
        }
        ContentKind::Binary => envelope.data = Payload::Binary(body.to_vec()),
    }

    Ok(envelope)
}

/// Integral JSON number, whether sent as `401` or `401.0`.
fn business_code(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|code| code.fract() == 0.0 && code.abs() < 9.0e15)
            .map(|code| code as i64)
    })
}

pub async fn decode_response(response: reqwest::Response) -> Result<ResponseEnvelope, ApiError> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .await
        .map_err(|error| ApiError::network(&error))?;
    decode_body(status, content_type.as_deref(), &bytes)
}
