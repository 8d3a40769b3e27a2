// Request and reply bodies exchanged between nodes and with clients.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serde helpers encoding byte fields as standard base64 strings
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: From<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(T::from)
            .map_err(D::Error::custom)
    }

    pub mod option {
        use super::STANDARD;
        use base64::Engine as _;
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<T, S>(bytes: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
        where
            T: AsRef<[u8]>,
            S: Serializer,
        {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes.as_ref())),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
        where
            T: From<Vec<u8>>,
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(encoded) => STANDARD
                    .decode(encoded.as_bytes())
                    .map(|raw| Some(T::from(raw)))
                    .map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Body of `Put` and `PutApply`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    #[serde(with = "base64_bytes")]
    pub key: Bytes,
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
    /// Time-to-live in seconds
    pub ttl: u64,
    /// Create-only semantics
    #[serde(default)]
    pub unique: bool,
}

/// Body of `Get`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    #[serde(with = "base64_bytes")]
    pub key: Bytes,
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub token: Option<Bytes>,
}

/// One value inside a Get page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
    /// Seconds since the entry was stored
    pub age: u64,
    /// Seconds left before expiry
    pub ttl: u64,
}

/// Reply to `Get`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPage {
    pub entries: Vec<PageEntry>,
    /// Entries left beyond this page
    pub remaining: u32,
    /// Present only when `remaining > 0`
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub token: Option<Bytes>,
}

/// One record of a diagnostic dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpEntry {
    #[serde(with = "base64_bytes")]
    pub key: Bytes,
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolReply {
    pub result: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountReply {
    pub count: usize,
}

/// Body of the client-facing `put` and `create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPutRequest {
    #[serde(with = "base64_bytes")]
    pub key: Bytes,
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
    pub ttl: u64,
}

/// Body of the client-facing `get`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientGetRequest {
    #[serde(with = "base64_bytes")]
    pub key: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_fields_are_base64_strings() {
        let request = PutRequest {
            key: Bytes::from_static(b"key"),
            value: Bytes::from_static(b"\x00\xff"),
            ttl: 30,
            unique: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["key"], "a2V5");
        assert_eq!(json["value"], "AP8=");
    }

    #[test]
    fn page_without_token_omits_field() {
        let page = GetPage::default();
        let json = serde_json::to_string(&page).unwrap();
        assert!(!json.contains("token"));
        let back: GetPage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.token, None);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let result: Result<GetRequest, _> = serde_json::from_str(r#"{"key":"***"}"#);
        assert!(result.is_err());
    }
}
