use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

use md4w::MD4_EMPTY;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<const N: usize>(pub [u8; N]);

impl<const N: usize> Id<N> {
    pub fn new(from: [u8; N]) -> Id<N> {
        Id(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        let mut v = [0u8; N];
        if b.len() != N {
            anyhow::bail!("buffer length must be {}, but it's {}", N, b.len());
        }
        v.copy_from_slice(b);
        Ok(Id(v))
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl<const N: usize> Default for Id<N> {
    fn default() -> Self {
        Id([0; N])
    }
}

impl<const N: usize> std::fmt::Debug for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl<const N: usize> std::fmt::Display for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl<const N: usize> FromStr for Id<N> {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; N];
        if s.len() != N * 2 {
            anyhow::bail!("expected a hex string of length {}", N * 2);
        }
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id(out))
    }
}

impl<const N: usize> Serialize for Id<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de, const N: usize> Deserialize<'de> for Id<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor<const N: usize>;

        impl<'de, const N: usize> serde::de::Visitor<'de> for IdVisitor<N> {
            type Value = Id<N>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a byte array or hex string of length {N}")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id::<N>::from_str(v).map_err(E::custom)
            }

            fn visit_borrowed_bytes<E>(self, v: &'de [u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(v)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != N {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut buf = [0u8; N];
                buf.copy_from_slice(v);
                Ok(Id(buf))
            }
        }

        deserializer.deserialize_any(IdVisitor {})
    }
}

/// The 16-byte MD4 digest used throughout ed2k: file identifiers, piece
/// hashes, client hashes.
pub type Md4Hash = Id<16>;

impl Md4Hash {
    /// MD4 of the empty input, also appended as the "terminal hash" to the
    /// hash set of files that are an exact multiple of the piece size.
    pub const TERMINAL: Md4Hash = Id(MD4_EMPTY);

    /// The default client hash: the terminal hash with the classic eMule
    /// marker bytes at positions 5 and 14.
    pub fn default_client_hash() -> Md4Hash {
        let mut h = Self::TERMINAL;
        h.0[5] = 14;
        h.0[14] = 111;
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let s = "000102030405060708090A0B0C0D0F0D";
        let h = Md4Hash::from_str(s).unwrap();
        assert_eq!(h.as_string(), s);
        // Mixed case parses, prints upper.
        let h2 = Md4Hash::from_str("000102030405f6c70b090a0B0c0D0f0D").unwrap();
        assert_eq!(h2.as_string(), "000102030405F6C70B090A0B0C0D0F0D");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Md4Hash::from_str("too short").is_err());
        assert!(Md4Hash::from_str("000102030405F6C7XB09KA0B0C0D0F0D").is_err());
    }

    #[test]
    fn test_terminal_hash() {
        assert_eq!(
            Md4Hash::TERMINAL.as_string(),
            "31D6CFE0D16AE931B73C59D7E0C089C0"
        );
    }

    #[test]
    fn test_default_client_hash_markers() {
        let h = Md4Hash::default_client_hash();
        assert_eq!(h.0[5], 14);
        assert_eq!(h.0[14], 111);
        assert_eq!(h.0[0], 0x31);
    }

    #[test]
    fn test_ordering_matches_byte_order() {
        let a = Md4Hash::from_str("000102030405060708090A0B0C0D0F0D").unwrap();
        let b = Md4Hash::from_str("0A0102030405060708090A0B0C0D0F0D").unwrap();
        assert!(b > a);
    }
}
