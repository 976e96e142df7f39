// Wrapper for MD4 libraries to be able to swap them easily.
//
// The ed2k file identifier is MD4, so piece hashing is the majority of CPU
// usage when importing large shares. The pure-Rust implementation is the
// default; openssl can be faster where its legacy provider is available.

#[cfg(feature = "md4-rust")]
pub type Md4 = Md4Rust;

#[cfg(feature = "md4-openssl")]
pub type Md4 = Md4Openssl;

/// MD4 of the empty input. Doubles as the eDonkey "terminal hash".
pub const MD4_EMPTY: [u8; 16] = [
    0x31, 0xd6, 0xcf, 0xe0, 0xd1, 0x6a, 0xe9, 0x31, 0xb7, 0x3c, 0x59, 0xd7, 0xe0, 0xc0, 0x89,
    0xc0,
];

pub trait IMd4 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 16];
}

#[cfg(feature = "md4-rust")]
pub struct Md4Rust {
    inner: md4::Md4,
}

#[cfg(feature = "md4-rust")]
impl IMd4 for Md4Rust {
    fn new() -> Self {
        use md4::Digest;
        Md4Rust {
            inner: md4::Md4::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use md4::Digest;
        md4::Md4::update(&mut self.inner, buf)
    }

    fn finish(self) -> [u8; 16] {
        use md4::Digest;
        let mut output = [0u8; 16];
        md4::Md4::finalize_into(self.inner, (&mut output[..]).into());
        output
    }
}

#[cfg(feature = "md4-openssl")]
pub struct Md4Openssl {
    inner: openssl::hash::Hasher,
}

#[cfg(feature = "md4-openssl")]
impl IMd4 for Md4Openssl {
    fn new() -> Self {
        Self {
            inner: openssl::hash::Hasher::new(openssl::hash::MessageDigest::md4())
                .expect("openssl md4 unavailable"),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf).expect("openssl md4 update failed")
    }

    fn finish(mut self) -> [u8; 16] {
        let result = self.inner.finish().expect("openssl md4 finish failed");
        debug_assert_eq!(result.len(), 16);
        let mut result_arr = [0u8; 16];
        result_arr.copy_from_slice(&result);
        result_arr
    }
}

pub fn md4_digest(buf: &[u8]) -> [u8; 16] {
    let mut h = Md4::new();
    h.update(buf);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(digest: [u8; 16]) -> String {
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    // RFC 1320 appendix A.5.
    #[test]
    fn test_rfc1320_vectors() {
        for (input, expected) in [
            (&b""[..], "31d6cfe0d16ae931b73c59d7e0c089c0"),
            (&b"a"[..], "bde52cb31de33e46245e05fbdbd6fb24"),
            (&b"abc"[..], "a448017aaf21d8525fc10ae87aa6729d"),
            (&b"message digest"[..], "d9130a8164549fe818874806e1c7014b"),
            (
                &b"abcdefghijklmnopqrstuvwxyz"[..],
                "d79e1c308aa5bbcdeea8ed63df412da9",
            ),
            (
                &b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789"[..],
                "043f8582f241db351ce627e153e7f0e4",
            ),
        ] {
            assert_eq!(hex(md4_digest(input)), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_empty_constant_matches() {
        assert_eq!(md4_digest(b""), MD4_EMPTY);
    }

    #[test]
    fn test_incremental_equals_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut h = Md4::new();
        for chunk in data.chunks(7) {
            h.update(chunk);
        }
        assert_eq!(h.finish(), md4_digest(data));
    }
}
