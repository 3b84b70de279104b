use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque content identifier of a swarm. For static files this is the Merkle
/// root hash of the file; for live streams it is any agreed byte string.
///
/// Hex-encoded on the command line and in tracker messages, raw bytes on the
/// wire.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwarmId(Box<[u8]>);

impl SwarmId {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        SwarmId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_string(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for SwarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for SwarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl FromStr for SwarmId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.is_empty() {
            anyhow::bail!("swarm id must not be empty");
        }
        Ok(SwarmId(bytes.into()))
    }
}

impl Serialize for SwarmId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for SwarmId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SwarmId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let s = "87a5e6618b2af6f92854eb83e2664d09af7db138";
        let id = SwarmId::from_str(s).unwrap();
        assert_eq!(id.as_string(), s);
        assert_eq!(id.as_bytes().len(), 20);
        assert_eq!(format!("{id}"), s);
    }

    #[test]
    fn test_rejects_empty_and_bad_hex() {
        assert!(SwarmId::from_str("").is_err());
        assert!(SwarmId::from_str("zz").is_err());
    }
}
