// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

use sha2::{Digest, Sha256};

pub const DIGEST_SIZE: usize = 32;

pub type Digest256 = [u8; DIGEST_SIZE];

/// Incremental SHA-256 over the plaintext image, fed in flash-write order.
#[derive(Clone, Default)]
pub struct ImageHasher {
    inner: Sha256,
    bytes: u64,
}

impl ImageHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> Digest256 {
        self.inner.finalize().into()
    }
}

/// Calculates the SHA-256 of the given data
pub fn sha256(data: &[u8]) -> Digest256 {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn empty_input_gives_empty_string_digest() {
        assert_eq!(
            ImageHasher::new().finish(),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data = b"Hello, ESP32 Encrypted Firmware!";
        let mut hasher = ImageHasher::new();
        hasher.update(&data[..5]);
        hasher.update(&[]);
        hasher.update(&data[5..]);

        assert_eq!(hasher.bytes_hashed(), 32);
        assert_eq!(
            hasher.finish(),
            hex!("63bf86cf04e9bf54944d2892cfe12c95b89551efe8c508ce9d4e6a962d4d4103")
        );
        assert_eq!(
            sha256(data),
            hex!("63bf86cf04e9bf54944d2892cfe12c95b89551efe8c508ce9d4e6a962d4d4103")
        );
    }
}
