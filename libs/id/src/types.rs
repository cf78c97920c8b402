//! Generated identifiers.

use crate::define_id;

define_id!(TransactionId, "txn");
define_id!(CommandId, "cmd");
define_id!(RequestId, "req");

/// Notification sequence number.
///
/// Assigned by the emitting scheduler process in increasing order; not
/// ULID-based because consumers only need relative ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(u64);

impl EventId {
    /// Creates a new EventId.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the following sequence number.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_roundtrip() {
        let id = TransactionId::new();
        let parsed: TransactionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("txn_"));
    }

    #[test]
    fn test_transaction_id_invalid_prefix() {
        let result: Result<TransactionId, _> = "cmd_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_missing_separator_and_empty() {
        let result: Result<CommandId, _> = "cmd01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::MissingSeparator));

        let result: Result<CommandId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<RequestId, _> = "req_nope".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_roundtrip() {
        let id = CommandId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: CommandId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_transaction_ids_sort_by_creation() {
        let first = TransactionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = TransactionId::new();
        assert!(first < second);
    }

    #[test]
    fn test_event_id_next() {
        let id = EventId::new(41);
        assert_eq!(id.next().value(), 42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "41");
    }
}
