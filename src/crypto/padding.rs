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

//! PKCS#7 padding on the 16 byte cipher block.

use alloc::vec::Vec;

use crate::crypto::cipher::BLOCK_SIZE;
use crate::error::OtaError;

/// Number of padding bytes appended to `data_len` bytes, always in `1..=16`.
pub fn padding_len(data_len: usize) -> usize {
    BLOCK_SIZE - data_len % BLOCK_SIZE
}

pub fn padded_len(data_len: usize) -> usize {
    data_len + padding_len(data_len)
}

pub fn pad(data: &[u8]) -> Vec<u8> {
    let n = padding_len(data.len());
    let mut out = Vec::with_capacity(data.len() + n);
    out.extend_from_slice(data);
    out.resize(data.len() + n, n as u8);
    out
}

/// Strips the padding from the tail of a decrypted body and returns the data
/// part. `data` has to be a non-empty multiple of the block size.
pub fn unpad(data: &[u8]) -> Result<&[u8], OtaError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(OtaError::InvalidPadding);
    }
    let n = data[data.len() - 1] as usize;
    if n == 0 || n > BLOCK_SIZE {
        return Err(OtaError::InvalidPadding);
    }
    let (body, tail) = data.split_at(data.len() - n);
    if tail.iter().any(|&b| b as usize != n) {
        return Err(OtaError::InvalidPadding);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_value_equals_count() {
        for len in 0..=48 {
            let data = alloc::vec![0xA5u8; len];
            let padded = pad(&data);
            let n = padded.len() - len;

            assert_eq!(padded.len() % BLOCK_SIZE, 0);
            assert!((1..=BLOCK_SIZE).contains(&n));
            assert!(padded[len..].iter().all(|&b| b as usize == n));
            assert_eq!(unpad(&padded).unwrap(), &data[..]);
        }
    }

    #[test]
    fn block_aligned_input_gets_full_block() {
        assert_eq!(padded_len(0), 16);
        assert_eq!(padded_len(16), 32);
        assert_eq!(padded_len(32), 48);
        assert_eq!(padded_len(17), 32);
    }

    #[test]
    fn rejects_zero_and_oversized_pad_byte() {
        let mut block = [0u8; 16];
        assert_eq!(unpad(&block), Err(OtaError::InvalidPadding));
        block[15] = 17;
        assert_eq!(unpad(&block), Err(OtaError::InvalidPadding));
    }

    #[test]
    fn rejects_inconsistent_tail() {
        let mut block = [3u8; 16];
        block[13] = 2;
        assert_eq!(unpad(&block), Err(OtaError::InvalidPadding));
    }

    #[test]
    fn rejects_misaligned_input() {
        assert_eq!(unpad(&[]), Err(OtaError::InvalidPadding));
        assert_eq!(unpad(&[1u8; 15]), Err(OtaError::InvalidPadding));
    }

    #[test]
    fn full_padding_block_strips_to_empty() {
        assert_eq!(unpad(&[16u8; 16]).unwrap(), &[] as &[u8]);
    }
}
