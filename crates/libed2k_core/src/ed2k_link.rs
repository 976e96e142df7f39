use std::str::FromStr;

use anyhow::Context;

use crate::hash_id::Md4Hash;

/// A parsed `ed2k://|file|<name>|<size>|<md4>|/` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed2kLink {
    pub name: String,
    pub size: u64,
    pub hash: Md4Hash,
}

impl Ed2kLink {
    pub fn new(name: impl Into<String>, size: u64, hash: Md4Hash) -> Self {
        Self {
            name: name.into(),
            size,
            hash,
        }
    }

    /// Parse an ed2k file link.
    pub fn parse(link: &str) -> anyhow::Result<Ed2kLink> {
        let rest = link
            .strip_prefix("ed2k://")
            .context("expected scheme ed2k://")?;
        let mut parts = rest.split('|');
        // The scheme is followed by "|file|...", so the first split element
        // is empty.
        let leading = parts.next().unwrap_or_default();
        if !leading.is_empty() {
            anyhow::bail!("malformed ed2k link: data before first separator");
        }
        match parts.next() {
            Some("file") => {}
            other => anyhow::bail!("unsupported ed2k link kind {other:?}"),
        }
        let name = parts.next().context("ed2k link missing file name")?;
        if name.is_empty() {
            anyhow::bail!("ed2k link has an empty file name");
        }
        let size: u64 = parts
            .next()
            .context("ed2k link missing file size")?
            .parse()
            .context("ed2k link has a non-numeric file size")?;
        let hash = Md4Hash::from_str(parts.next().context("ed2k link missing hash")?)
            .context("ed2k link has an invalid hash")?;
        Ok(Ed2kLink {
            name: name.to_owned(),
            size,
            hash,
        })
    }
}

impl FromStr for Ed2kLink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Ed2kLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ed2k://|file|{}|{}|{}|/", self.name, self.size, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let link =
            Ed2kLink::parse("ed2k://|file|Ubuntu.iso|3654957056|31D6CFE0D16AE931B73C59D7E0C089C0|/")
                .unwrap();
        assert_eq!(link.name, "Ubuntu.iso");
        assert_eq!(link.size, 3654957056);
        assert_eq!(link.hash, Md4Hash::TERMINAL);
    }

    #[test]
    fn test_round_trip() {
        let link = Ed2kLink::new("some file.bin", 12345, Md4Hash::default_client_hash());
        let reparsed = Ed2kLink::parse(&link.to_string()).unwrap();
        assert_eq!(link, reparsed);
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in [
            "http://example.com",
            "ed2k://|server|1.2.3.4|4661|/",
            "ed2k://|file||100|31D6CFE0D16AE931B73C59D7E0C089C0|/",
            "ed2k://|file|x|notanumber|31D6CFE0D16AE931B73C59D7E0C089C0|/",
            "ed2k://|file|x|100|shorthash|/",
        ] {
            assert!(Ed2kLink::parse(bad).is_err(), "{bad}");
        }
    }
}
