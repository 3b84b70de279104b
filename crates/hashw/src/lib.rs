// Wrapper for the SHA family so the rest of the client can select the
// digest at runtime from the PPSPP hash-function code carried in handshakes.

use sha1::Digest;

/// Hash function codes per the PPSPP "Merkle hash function" handshake option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashFunction {
    pub fn from_wire(code: u8) -> Option<Self> {
        Some(match code {
            0 => HashFunction::Sha1,
            1 => HashFunction::Sha224,
            2 => HashFunction::Sha256,
            3 => HashFunction::Sha384,
            4 => HashFunction::Sha512,
            _ => return None,
        })
    }

    pub fn to_wire(&self) -> u8 {
        match self {
            HashFunction::Sha1 => 0,
            HashFunction::Sha224 => 1,
            HashFunction::Sha256 => 2,
            HashFunction::Sha384 => 3,
            HashFunction::Sha512 => 4,
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashFunction::Sha1 => 20,
            HashFunction::Sha224 => 28,
            HashFunction::Sha256 => 32,
            HashFunction::Sha384 => 48,
            HashFunction::Sha512 => 64,
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            HashFunction::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashFunction::Sha224 => Hasher::Sha224(sha2::Sha224::new()),
            HashFunction::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashFunction::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            HashFunction::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    /// One-shot digest of a byte slice.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut h = self.hasher();
        h.update(data);
        h.finish()
    }
}

pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha224(sha2::Sha224),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn update(&mut self, buf: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(buf),
            Hasher::Sha224(h) => h.update(buf),
            Hasher::Sha256(h) => h.update(buf),
            Hasher::Sha384(h) => h.update(buf),
            Hasher::Sha512(h) => h.update(buf),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha224(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_lengths() {
        for f in [
            HashFunction::Sha1,
            HashFunction::Sha224,
            HashFunction::Sha256,
            HashFunction::Sha384,
            HashFunction::Sha512,
        ] {
            assert_eq!(f.digest(b"hello").len(), f.digest_len());
            assert_eq!(HashFunction::from_wire(f.to_wire()), Some(f));
        }
    }

    #[test]
    fn test_sha1_known_vector() {
        // sha1("abc")
        assert_eq!(
            HashFunction::Sha1.digest(b"abc"),
            hex_literal("a9993e364706816aba3e25717850c26c9cd0d89d"),
        );
    }

    fn hex_literal(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut h = HashFunction::Sha256.hasher();
        h.update(b"foo");
        h.update(b"bar");
        assert_eq!(h.finish(), HashFunction::Sha256.digest(b"foobar"));
    }
}
