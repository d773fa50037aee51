//! Opaque pagination cursor.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use super::{Result, StorageError};

/// Position of the next page: the pinned list version and the number of rows
/// already consumed from the ordered scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueToken {
    #[serde(rename = "ResourceVersion")]
    pub resource_version: i64,
    #[serde(rename = "StartOffset")]
    pub start_offset: i64,
    #[serde(rename = "SortAscending", default)]
    pub sort_ascending: bool,
}

impl ContinueToken {
    pub fn new(resource_version: i64, start_offset: i64, sort_ascending: bool) -> Self {
        Self {
            resource_version,
            start_offset,
            sort_ascending,
        }
    }

    /// Encode as base64 of the JSON form.
    pub fn encode(&self) -> String {
        // Serializing a struct of plain integers and a bool cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64_STANDARD.encode(json)
    }

    /// Decode a token produced by [`ContinueToken::encode`].
    pub fn decode(token: &str) -> Result<Self> {
        let json = BASE64_STANDARD
            .decode(token)
            .map_err(|e| StorageError::BadRequest(format!("invalid continue token: {e}")))?;
        let token: ContinueToken = serde_json::from_slice(&json)
            .map_err(|e| StorageError::BadRequest(format!("invalid continue token: {e}")))?;
        if token.resource_version < 0 || token.start_offset < 0 {
            return Err(StorageError::BadRequest(
                "invalid continue token: negative position".to_string(),
            ));
        }
        Ok(token)
    }
}

impl std::fmt::Display for ContinueToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for token in [
            ContinueToken::new(0, 0, false),
            ContinueToken::new(1_712_000_000_000_123, 500, true),
            ContinueToken::new(42, 7, false),
        ] {
            assert_eq!(ContinueToken::decode(&token.encode()).unwrap(), token);
        }
    }

    #[test]
    fn test_wire_format() {
        let token = ContinueToken::new(12, 3, true);
        let json = BASE64_STANDARD.decode(token.encode()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["ResourceVersion"], 12);
        assert_eq!(value["StartOffset"], 3);
        assert_eq!(value["SortAscending"], true);
    }

    #[test]
    fn test_missing_sort_field_defaults_descending() {
        let raw = BASE64_STANDARD.encode(r#"{"ResourceVersion":5,"StartOffset":2}"#);
        let token = ContinueToken::decode(&raw).unwrap();
        assert_eq!(token, ContinueToken::new(5, 2, false));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ContinueToken::decode("%%%").unwrap_err().is_bad_request());
        let not_json = BASE64_STANDARD.encode("hello");
        assert!(ContinueToken::decode(&not_json).unwrap_err().is_bad_request());
        let negative = BASE64_STANDARD.encode(r#"{"ResourceVersion":-1,"StartOffset":0}"#);
        assert!(ContinueToken::decode(&negative).unwrap_err().is_bad_request());
    }
}
