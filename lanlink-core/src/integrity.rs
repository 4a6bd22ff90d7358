//! Integrity: SHA-256 digests for file transfers, verified on completion.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Digest of an in-memory byte slice.
pub fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Streaming digest of a reader, for files too large to slurp twice.
pub fn digest_reader<R: Read>(reader: &mut R) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Verify reassembled bytes against the digest announced in the offer.
pub fn verify(data: &[u8], expected: &[u8; 32]) -> bool {
    digest(data) == *expected
}
