//! Document serializers

use crate::datum::Datum;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Serializer used for a table's documents. Persisted per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    MsgPack,
}

impl Codec {
    pub fn encode(&self, datum: &Datum) -> Result<Vec<u8>> {
        match self {
            Codec::Json => serde_json::to_vec(datum)
                .map_err(|e| Error::Serialization(format!("JSON encode failed: {}", e))),
            Codec::MsgPack => rmp_serde::to_vec(datum)
                .map_err(|e| Error::Serialization(format!("MessagePack encode failed: {}", e))),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Datum> {
        match self {
            Codec::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::Serialization(format!("JSON decode failed: {}", e))),
            Codec::MsgPack => rmp_serde::from_slice(bytes)
                .map_err(|e| Error::Serialization(format!("MessagePack decode failed: {}", e))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::MsgPack => "msgpack",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "msgpack" | "messagepack" => Ok(Codec::MsgPack),
            other => Err(Error::Config(format!("Unknown codec: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codecs_preserve_numbers() -> Result<()> {
        let doc = Datum::from(json!({"n": 7, "f": 2.5, "whole": 3.0, "s": "x", "l": [1, null]}));
        for codec in [Codec::Json, Codec::MsgPack] {
            let decoded = codec.decode(&codec.encode(&doc)?)?;
            assert_eq!(decoded.get("n"), Some(&Datum::Integer(7)), "{}", codec.name());
            assert_eq!(decoded.get("f"), Some(&Datum::Float(2.5)));
            assert_eq!(decoded.get("s").and_then(Datum::as_str), Some("x"));
        }
        Ok(())
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Codec::Json.decode(b"{not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_parse_name() -> Result<()> {
        assert_eq!("MsgPack".parse::<Codec>()?, Codec::MsgPack);
        assert!("yaml".parse::<Codec>().is_err());
        Ok(())
    }
}
