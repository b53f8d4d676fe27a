//! Digest utilities for TapeIO
//!
//! Objects and archives are identified for integrity purposes by a
//! hex-encoded SHA-2 digest. Digests are always computed while streaming so
//! content never has to be buffered in memory.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

/// Supported digest algorithms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestType {
    Sha256,
    #[default]
    Sha512,
}

impl DigestType {
    /// Canonical algorithm name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
        }
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "SHA-256" | "SHA256" => Ok(Self::Sha256),
            "SHA-512" | "SHA512" => Ok(Self::Sha512),
            other => Err(crate::Error::invalid_argument(format!(
                "unsupported digest type: {other}"
            ))),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Streaming digest calculator
pub struct DigestCalculator {
    digest_type: DigestType,
    hasher: Hasher,
    length: u64,
}

impl DigestCalculator {
    #[must_use]
    pub fn new(digest_type: DigestType) -> Self {
        let hasher = match digest_type {
            DigestType::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestType::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self {
            digest_type,
            hasher,
            length: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
        self.length += data.len() as u64;
    }

    /// Number of bytes hashed so far
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    /// Finalize and return the lowercase hex digest
    #[must_use]
    pub fn finalize_hex(self) -> String {
        match self.hasher {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }

    /// Reset the calculator for reuse
    pub fn reset(&mut self) {
        *self = Self::new(self.digest_type);
    }
}

/// Hex digest of an in-memory buffer
#[must_use]
pub fn digest_hex(digest_type: DigestType, data: &[u8]) -> String {
    let mut calculator = DigestCalculator::new(digest_type);
    calculator.update(data);
    calculator.finalize_hex()
}

/// Reader adapter hashing every byte that flows through it
pub struct DigestReader<R> {
    inner: R,
    calculator: DigestCalculator,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R, digest_type: DigestType) -> Self {
        Self {
            inner,
            calculator: DigestCalculator::new(digest_type),
        }
    }

    /// Bytes read through the adapter so far
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.calculator.length()
    }

    /// Consume the adapter and return the hex digest of everything read
    #[must_use]
    pub fn finalize_hex(self) -> String {
        self.calculator.finalize_hex()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.calculator.update(&buf[..n]);
        Ok(n)
    }
}
