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

//! Wire format of an encrypted firmware image.
//!
//! ```text
//! [0, 16)   IV, random per image
//! [16, N)   AES-256-CBC(PKCS#7(plaintext)), N - 16 a positive multiple of 16
//! ```
//!
//! The detached signature is a raw PKCS#1 v1.5 / SHA-256 signature over the
//! unpadded plaintext and travels separately.

use alloc::vec::Vec;

use crate::crypto::cipher::{Aes256Key, BLOCK_SIZE, CbcDecryptor, CbcEncryptor, IV_SIZE, Iv};
use crate::crypto::padding;
use crate::error::OtaError;

/// Length of the wire image for a plaintext of `plaintext_len` bytes.
pub fn encrypted_len(plaintext_len: usize) -> usize {
    IV_SIZE + padding::padded_len(plaintext_len)
}

/// Checks a declared wire length before any byte is streamed.
pub fn check_wire_len(wire_len: u64) -> Result<u64, OtaError> {
    if wire_len <= IV_SIZE as u64 {
        return Err(OtaError::Truncated);
    }
    let body = wire_len - IV_SIZE as u64;
    if body % BLOCK_SIZE as u64 != 0 {
        return Err(OtaError::InvalidArg);
    }
    Ok(body)
}

/// Encrypts a plaintext image into its wire form.
pub fn seal(key: &Aes256Key, iv: &Iv, plaintext: &[u8]) -> Result<Vec<u8>, OtaError> {
    let mut wire = Vec::with_capacity(encrypted_len(plaintext.len()));
    wire.extend_from_slice(iv);
    wire.extend_from_slice(&padding::pad(plaintext));

    CbcEncryptor::new(key, iv).update_in_place(&mut wire[IV_SIZE..])?;
    Ok(wire)
}

/// Decrypts a complete wire image held in memory and strips the padding.
pub fn open(key: &Aes256Key, wire: &[u8]) -> Result<Vec<u8>, OtaError> {
    check_wire_len(wire.len() as u64)?;
    let (iv, body) = wire.split_at(IV_SIZE);
    let mut iv_bytes = [0u8; IV_SIZE];
    iv_bytes.copy_from_slice(iv);

    let mut plaintext = body.to_vec();
    CbcDecryptor::new(key, &iv_bytes).update_in_place(&mut plaintext)?;
    let len = padding::unpad(&plaintext)?.len();
    plaintext.truncate(len);
    Ok(plaintext)
}
