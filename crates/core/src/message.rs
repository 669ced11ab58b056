//! Inner HTTP part messages and body segmentation.
//!
//! A request or response body is base64-encoded and split into parts of
//! at most [`PART_SIZE`] base64 characters; each part travels as the
//! content of its own inner event. Part 0 additionally carries the HTTP
//! line/headers. The receiver reassembles by `partIndex`.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Maximum base64 characters per part.
///
/// Sized so that even after two layers of encryption and stringification
/// the outermost event content stays well under relay message limits.
pub const PART_SIZE: usize = 32_768;

/// Maximum length of a correlation id.
const MAX_ID_LEN: usize = 100;

/// Errors raised by part-message validation and reassembly.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid id: must be 1..={MAX_ID_LEN} characters")]
    InvalidId,

    #[error("parts must be >= 1")]
    NoParts,

    #[error("partIndex {index} out of range for {parts} parts")]
    PartIndexOutOfRange { index: u64, parts: u64 },

    #[error("part 0 is missing {0}")]
    MissingFirstPartField(&'static str),

    #[error("status {0} out of range")]
    StatusOutOfRange(i64),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

/// One part of a tunneled HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Correlation id, echoed back by the destination
    pub id: String,
    #[serde(rename = "partIndex")]
    pub part_index: u64,
    pub parts: u64,
    #[serde(rename = "bodyBase64")]
    pub body_base64: String,
    /// Present iff `part_index == 0`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// One part of a tunneled HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    #[serde(rename = "partIndex")]
    pub part_index: u64,
    pub parts: u64,
    #[serde(rename = "bodyBase64")]
    pub body_base64: String,
    /// Present iff `part_index == 0`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

fn validate_common(id: &str, part_index: u64, parts: u64) -> Result<(), MessageError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(MessageError::InvalidId);
    }
    if parts == 0 {
        return Err(MessageError::NoParts);
    }
    if part_index >= parts {
        return Err(MessageError::PartIndexOutOfRange {
            index: part_index,
            parts,
        });
    }
    Ok(())
}

impl RequestMessage {
    pub fn validate(&self) -> Result<(), MessageError> {
        validate_common(&self.id, self.part_index, self.parts)?;
        if self.part_index == 0 {
            if self.method.is_none() {
                return Err(MessageError::MissingFirstPartField("method"));
            }
            if self.url.is_none() {
                return Err(MessageError::MissingFirstPartField("url"));
            }
            if self.headers.is_none() {
                return Err(MessageError::MissingFirstPartField("headers"));
            }
        }
        Ok(())
    }
}

impl ResponseMessage {
    pub fn validate(&self) -> Result<(), MessageError> {
        validate_common(&self.id, self.part_index, self.parts)?;
        if self.part_index == 0 {
            match self.status {
                None => return Err(MessageError::MissingFirstPartField("status")),
                Some(s) if !(100..=599).contains(&s) => {
                    return Err(MessageError::StatusOutOfRange(s));
                }
                Some(_) => {}
            }
            if self.headers.is_none() {
                return Err(MessageError::MissingFirstPartField("headers"));
            }
        }
        Ok(())
    }
}

/// Base64-encode a body and split it into parts.
///
/// An empty body still yields exactly one empty part, so every request
/// and response has at least a part 0.
pub fn segment_body(body: &[u8]) -> Vec<String> {
    let encoded = BASE64_STANDARD.encode(body);
    if encoded.is_empty() {
        return vec![String::new()];
    }
    encoded
        .as_bytes()
        .chunks(PART_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// Concatenate parts in index order and decode the base64 body.
pub fn assemble_body(parts_in_order: &[String]) -> Result<Vec<u8>, MessageError> {
    let joined: String = parts_in_order.concat();
    Ok(BASE64_STANDARD.decode(joined.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(part_index: u64, parts: u64) -> ResponseMessage {
        ResponseMessage {
            id: "req-1".to_string(),
            part_index,
            parts,
            body_base64: String::new(),
            status: if part_index == 0 { Some(200) } else { None },
            headers: if part_index == 0 {
                Some(BTreeMap::new())
            } else {
                None
            },
        }
    }

    #[test]
    fn test_empty_body_is_one_empty_part() {
        assert_eq!(segment_body(&[]), vec![String::new()]);
    }

    #[test]
    fn test_part_size_boundary() {
        // 24576 raw bytes encode to exactly 32768 base64 chars
        let body = vec![0u8; 24_576];
        let parts = segment_body(&body);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), PART_SIZE);

        // one more 3-byte group pushes the encoding to 32772 chars
        let body = vec![0u8; 24_579];
        let parts = segment_body(&body);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), PART_SIZE);
        assert_eq!(parts[1].len(), 4);
    }

    #[test]
    fn test_segment_assemble_roundtrip() {
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let parts = segment_body(&body);
        assert!(parts.len() > 1);
        assert_eq!(assemble_body(&parts).unwrap(), body);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = RequestMessage {
            id: "abc".to_string(),
            part_index: 0,
            parts: 1,
            body_base64: String::new(),
            method: Some("GET".to_string()),
            url: Some("/x".to_string()),
            headers: Some(BTreeMap::new()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"partIndex\":0"));
        assert!(json.contains("\"bodyBase64\":\"\""));
        assert!(json.contains("\"method\":\"GET\""));
    }

    #[test]
    fn test_later_parts_omit_first_part_fields() {
        let msg = RequestMessage {
            id: "abc".to_string(),
            part_index: 1,
            parts: 2,
            body_base64: "aGk=".to_string(),
            method: None,
            url: None,
            headers: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("method"));
        assert!(!json.contains("url"));
        assert!(!json.contains("headers"));
    }

    #[test]
    fn test_response_validation() {
        assert!(response(0, 2).validate().is_ok());
        assert!(response(1, 2).validate().is_ok());

        let mut bad = response(0, 1);
        bad.id = String::new();
        assert!(matches!(bad.validate(), Err(MessageError::InvalidId)));

        let mut bad = response(0, 1);
        bad.id = "x".repeat(101);
        assert!(matches!(bad.validate(), Err(MessageError::InvalidId)));

        let mut bad = response(0, 1);
        bad.parts = 0;
        assert!(matches!(bad.validate(), Err(MessageError::NoParts)));

        let bad = response(2, 2);
        assert!(matches!(
            bad.validate(),
            Err(MessageError::PartIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_response_first_part_requires_status_and_headers() {
        let mut msg = response(0, 1);
        msg.status = None;
        assert!(matches!(
            msg.validate(),
            Err(MessageError::MissingFirstPartField("status"))
        ));

        let mut msg = response(0, 1);
        msg.status = Some(99);
        assert!(matches!(
            msg.validate(),
            Err(MessageError::StatusOutOfRange(99))
        ));
        msg.status = Some(600);
        assert!(matches!(
            msg.validate(),
            Err(MessageError::StatusOutOfRange(600))
        ));

        let mut msg = response(0, 1);
        msg.headers = None;
        assert!(matches!(
            msg.validate(),
            Err(MessageError::MissingFirstPartField("headers"))
        ));
    }

    #[test]
    fn test_status_must_be_integer_json() {
        let json = r#"{"id":"a","partIndex":0,"parts":1,"bodyBase64":"","status":200.5,"headers":{}}"#;
        assert!(serde_json::from_str::<ResponseMessage>(json).is_err());

        let json = r#"{"id":"a","partIndex":0,"parts":1,"bodyBase64":"","status":200,"headers":{"x":1}}"#;
        assert!(serde_json::from_str::<ResponseMessage>(json).is_err());
    }
}
