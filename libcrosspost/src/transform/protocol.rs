//! Message contract between the pool and a transform worker
//!
//! One JSON object per line. A request names the source and the target
//! normalization; the reply carries the resulting bytes base64-encoded:
//!
//! ```text
//! -> {"location":"/tmp/a.png","quality":80,"type":"image/png","width":800}
//! <- {"code":"SUCCESS","data":{"buffer":"iVBORw0...","type":"image/jpeg"}}
//! <- {"code":"ERROR","err":"Failed to decode /tmp/a.png: ..."}
//! ```

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::TransformError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformRequest {
    /// Source path, or the cache key of an in-memory file
    pub location: String,
    /// Target quality, 1..=100. 100 means "do not reduce"
    pub quality: u8,
    /// Requested output MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Maximum output width in pixels
    pub width: u32,
    /// Inline source bytes for files that do not live on disk
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes_opt")]
    pub buffer: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformedFile {
    #[serde(with = "base64_bytes")]
    pub buffer: Vec<u8>,
    #[serde(rename = "type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformResponse {
    Success { data: TransformedFile },
    Error { err: String },
}

impl TransformResponse {
    pub fn into_result(self) -> Result<TransformedFile, TransformError> {
        match self {
            TransformResponse::Success { data } => Ok(data),
            TransformResponse::Error { err } => Err(TransformError::Failed(err)),
        }
    }
}

impl From<Result<TransformedFile, TransformError>> for TransformResponse {
    fn from(result: Result<TransformedFile, TransformError>) -> Self {
        match result {
            Ok(data) => TransformResponse::Success { data },
            Err(e) => TransformResponse::Error { err: e.to_string() },
        }
    }
}

/// Serialize a message as a single newline-terminated line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

pub mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = TransformRequest {
            location: "a.png".to_string(),
            quality: 80,
            mime_type: "image/png".to_string(),
            width: 800,
            buffer: None,
        };
        let line = encode_line(&request).unwrap();
        assert_eq!(
            line,
            "{\"location\":\"a.png\",\"quality\":80,\"type\":\"image/png\",\"width\":800}\n"
        );
        let parsed: TransformRequest = decode_line(&line).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_request_with_inline_buffer() {
        let parsed: TransformRequest = decode_line(
            r#"{"location":"buffer:1","quality":100,"type":"image/png","width":10,"buffer":"AAEC"}"#,
        )
        .unwrap();
        assert_eq!(parsed.buffer, Some(vec![0, 1, 2]));
    }

    #[test]
    fn test_success_response_wire_format() {
        let response = TransformResponse::Success {
            data: TransformedFile {
                buffer: b"hi".to_vec(),
                mime_type: "image/jpeg".to_string(),
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            r#"{"code":"SUCCESS","data":{"buffer":"aGk=","type":"image/jpeg"}}"#
        );
    }

    #[test]
    fn test_error_response_becomes_transform_error() {
        let response: TransformResponse =
            decode_line(r#"{"code":"ERROR","err":"cannot decode"}"#).unwrap();
        assert_eq!(
            response.into_result(),
            Err(TransformError::Failed("cannot decode".to_string()))
        );
    }

    #[test]
    fn test_from_result() {
        let response: TransformResponse =
            Err(TransformError::UnsupportedType("image/tiff".to_string())).into();
        match response {
            TransformResponse::Error { err } => assert!(err.contains("image/tiff")),
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result: Result<TransformResponse, _> =
            decode_line(r#"{"code":"SUCCESS","data":{"buffer":"***","type":"image/png"}}"#);
        assert!(result.is_err());
    }
}
