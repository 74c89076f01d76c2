use super::error::{DatabaseError, StoreError};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

/// A schemaless record as stored in a collection.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Field holding the store-assigned id of every document.
pub const ID_FIELD: &str = "_id";

/// Field holding the owning tenant of every document.
pub const CLIENT_ID_FIELD: &str = "client_id";

static OBJECT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

lazy_static! {
    static ref PROCESS_UNIQUE: [u8; 5] = rand::random();
}

/// Store-assigned document identifier.
///
/// Twelve bytes: a big-endian unix timestamp in seconds, five random bytes
/// fixed per process and a three byte counter. Rendered as 24 lowercase hex
/// characters, so ids generated by one process sort in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];

        let timestamp = chrono::Utc::now().timestamp() as u32;
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());

        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);

        let counter = OBJECT_ID_COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF;
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);

        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidId(s.to_string()));
        }

        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| StoreError::InvalidId(s.to_string()))?;
        }

        Ok(Self(bytes))
    }
}

/// Tenant identifier. Every generic read, write and delete is scoped by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Result<Self, DatabaseError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DatabaseError::InvalidClientId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClientId {
    type Error = DatabaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ClientId {
    type Error = DatabaseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::new();
        let hex = id.to_hex();

        assert_eq!(hex.len(), 24);
        assert_eq!(hex.parse::<ObjectId>().unwrap(), id);
    }

    #[test]
    fn test_object_ids_sort_in_creation_order() {
        let ids: Vec<String> = (0..100).map(|_| ObjectId::new().to_hex()).collect();
        let mut sorted = ids.clone();
        sorted.sort();

        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_invalid_object_id() {
        assert!("".parse::<ObjectId>().is_err());
        assert!("507f1f77bcf86cd79943901".parse::<ObjectId>().is_err());
        assert!("zzzf1f77bcf86cd799439011".parse::<ObjectId>().is_err());
        assert!("+07f1f77bcf86cd79943901a".parse::<ObjectId>().is_err());
        assert!("507f1f77bcf86cd79943901é".parse::<ObjectId>().is_err());
        assert!("507f1f77bcf86cd799439011".parse::<ObjectId>().is_ok());
    }

    #[test]
    fn test_client_id_rejects_blank() {
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new("   ").is_err());
        assert_eq!(ClientId::new("123").unwrap().as_str(), "123");
    }
}
