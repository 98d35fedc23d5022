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

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::{trace, warn};

use crate::error::OtaError;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

pub type Aes256Key = [u8; KEY_SIZE];
pub type Iv = [u8; IV_SIZE];

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Streaming AES-256-CBC decryption context.
///
/// The chaining value is carried between calls, so feeding a body in several
/// block-aligned pieces yields the same plaintext as one call over the whole
/// body. A rejected call poisons the context; it has to be dropped and a new
/// one created for the next session.
pub struct CbcDecryptor {
    state: Option<Aes256CbcDec>,
    blocks: u64,
}

impl CbcDecryptor {
    pub fn new(key: &Aes256Key, iv: &Iv) -> Self {
        Self {
            state: Some(Aes256CbcDec::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )),
            blocks: 0,
        }
    }

    /// Decrypts `ciphertext` into the front of `plaintext`, returning the
    /// number of plaintext bytes produced (always `ciphertext.len()`).
    pub fn update(&mut self, ciphertext: &[u8], plaintext: &mut [u8]) -> Result<usize, OtaError> {
        if plaintext.len() < ciphertext.len() {
            warn!(
                "Plaintext buffer of {} bytes cannot hold {} bytes of ciphertext",
                plaintext.len(),
                ciphertext.len()
            );
            self.state = None;
            return Err(OtaError::InvalidArg);
        }
        let out = &mut plaintext[..ciphertext.len()];
        out.copy_from_slice(ciphertext);
        self.update_in_place(out)?;
        Ok(ciphertext.len())
    }

    pub fn update_in_place(&mut self, data: &mut [u8]) -> Result<(), OtaError> {
        if self.state.is_none() {
            return Err(OtaError::NotInitialized);
        }
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            warn!("Rejecting {} byte ciphertext chunk, not block aligned", data.len());
            self.state = None;
            return Err(OtaError::InvalidArg);
        }

        let Some(state) = self.state.as_mut() else {
            return Err(OtaError::NotInitialized);
        };
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            state.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.blocks += (data.len() / BLOCK_SIZE) as u64;
        trace!("Decrypted {} bytes, {} blocks so far", data.len(), self.blocks);
        Ok(())
    }

    /// Number of blocks decrypted since the context was created.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
}

/// AES-256-CBC encryption counterpart, used to produce wire images.
pub struct CbcEncryptor {
    state: Aes256CbcEnc,
}

impl CbcEncryptor {
    pub fn new(key: &Aes256Key, iv: &Iv) -> Self {
        Self {
            state: Aes256CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
        }
    }

    pub fn update_in_place(&mut self, data: &mut [u8]) -> Result<(), OtaError> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(OtaError::InvalidArg);
        }
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.state.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}
