use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConversationId, "conv");
branded_id!(TurnId, "turn");
branded_id!(ContentRefId, "content");

/// Identity of an external content source (e.g. a browser tab).
///
/// Unlike the branded ids this is assigned by the embedder and is stable
/// across navigations of the same tab.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub i64);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_has_prefix() {
        let id = ConversationId::new();
        assert!(id.as_str().starts_with("conv_"), "got: {id}");
    }

    #[test]
    fn turn_id_has_prefix() {
        let id = TurnId::new();
        assert!(id.as_str().starts_with("turn_"), "got: {id}");
    }

    #[test]
    fn content_ref_id_has_prefix() {
        let id = ContentRefId::new();
        assert!(id.as_str().starts_with("content_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ConversationId::new(), ConversationId::new());
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = TurnId::new();
        let parsed: TurnId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn content_id_serializes_as_number() {
        let json = serde_json::to_string(&ContentId(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<ConversationId> = (0..50).map(|_| ConversationId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
