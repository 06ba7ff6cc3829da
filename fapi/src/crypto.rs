// SPDX-License-Identifier: MIT

//! Hashing for name computation, policy digest folding and the NV extend
//! pipeline.
//!
//! Only the SHA-2 family is implemented; `Sha1` is part of the constant
//! table for completeness but starting a SHA-1 sequence reports
//! `NotImplemented`.

use crate::error::{Error, Result};
use crate::types::HashAlg;
use sha2::{Digest, Sha256, Sha384, Sha512};

enum Inner {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// An incremental hash computation under a fixed algorithm.
pub struct HashSequence {
    alg: HashAlg,
    inner: Inner,
}

impl HashSequence {
    /// Starts a hash sequence.
    ///
    /// # Errors
    ///
    /// Returns `NotImplemented` for algorithms without a backing
    /// implementation.
    pub fn start(alg: HashAlg) -> Result<HashSequence> {
        let inner = match alg {
            HashAlg::Sha256 => Inner::Sha256(Sha256::new()),
            HashAlg::Sha384 => Inner::Sha384(Sha384::new()),
            HashAlg::Sha512 => Inner::Sha512(Sha512::new()),
            HashAlg::Sha1 => return Err(Error::NotImplemented),
        };
        Ok(HashSequence { alg, inner })
    }

    /// Feeds data into the sequence.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Sha256(h) => h.update(data),
            Inner::Sha384(h) => h.update(data),
            Inner::Sha512(h) => h.update(data),
        }
    }

    /// Finishes the sequence and returns the digest.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        match self.inner {
            Inner::Sha256(h) => h.finalize().to_vec(),
            Inner::Sha384(h) => h.finalize().to_vec(),
            Inner::Sha512(h) => h.finalize().to_vec(),
        }
    }

    /// The algorithm the sequence was started under.
    #[must_use]
    pub fn alg(&self) -> HashAlg {
        self.alg
    }
}

/// One-shot digest of `data` under `alg`.
///
/// # Errors
///
/// Returns `NotImplemented` for algorithms without a backing implementation.
pub fn hash(alg: HashAlg, data: &[u8]) -> Result<Vec<u8>> {
    let mut seq = HashSequence::start(alg)?;
    seq.update(data);
    Ok(seq.finish())
}

#[cfg(test)]
mod tests {
    use super::{hash, HashSequence};
    use crate::error::Error;
    use crate::types::HashAlg;

    #[test]
    fn sha256_abc() {
        // NIST test vector.
        let digest = hash(HashAlg::Sha256, b"abc").unwrap();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut seq = HashSequence::start(HashAlg::Sha384).unwrap();
        seq.update(b"ab");
        seq.update(b"c");
        assert_eq!(seq.finish(), hash(HashAlg::Sha384, b"abc").unwrap());
    }

    #[test]
    fn sha1_unimplemented() {
        assert_eq!(hash(HashAlg::Sha1, b"abc"), Err(Error::NotImplemented));
    }
}
