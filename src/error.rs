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

use core::fmt;
use embedded_storage::nor_flash::NorFlashErrorKind;

/// Everything that can fail an OTA session or a boot-state request.
///
/// Backend failures keep the numeric code reported by the collaborator so the
/// caller can log it as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// Misaligned, empty or otherwise malformed argument
    InvalidArg,
    /// The transport reported an error, value is its code (HTTP status or I/O code)
    Transport(i32),
    /// The stream ended before the expected number of bytes arrived
    Truncated,
    /// No data arrived within the idle timeout
    Timeout,
    /// The crypto primitive reported an error, value is its code
    CryptoBackend(i32),
    InvalidPadding,
    SignatureInvalid,
    /// The flash driver failed, value is the driver's error code
    FlashWrite(i32),
    /// The image does not fit the slot or exceeds its declared size
    Overflow,
    Cancelled,
    /// A component was used before it was set up (e.g. no public key installed)
    NotInitialized,
    /// The boot-state machine refused the request in the current slot state
    InvalidState,
}

impl OtaError {
    /// Stable numeric identifier of the error kind.
    pub fn kind_code(&self) -> u8 {
        match self {
            OtaError::InvalidArg => 1,
            OtaError::Transport(_) => 2,
            OtaError::Truncated => 3,
            OtaError::Timeout => 4,
            OtaError::CryptoBackend(_) => 5,
            OtaError::InvalidPadding => 6,
            OtaError::SignatureInvalid => 7,
            OtaError::FlashWrite(_) => 8,
            OtaError::Overflow => 9,
            OtaError::Cancelled => 10,
            OtaError::NotInitialized => 11,
            OtaError::InvalidState => 12,
        }
    }

    /// Code passed through from the failing backend, if any.
    pub fn backend_code(&self) -> Option<i32> {
        match self {
            OtaError::Transport(code)
            | OtaError::CryptoBackend(code)
            | OtaError::FlashWrite(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg => write!(f, "invalid argument"),
            Self::Transport(code) => write!(f, "transport error (code {})", code),
            Self::Truncated => write!(f, "stream ended before the expected length"),
            Self::Timeout => write!(f, "timed out waiting for data"),
            Self::CryptoBackend(code) => write!(f, "crypto backend error (code {})", code),
            Self::InvalidPadding => write!(f, "invalid PKCS#7 padding"),
            Self::SignatureInvalid => write!(f, "firmware signature is invalid"),
            Self::FlashWrite(code) => write!(f, "flash write failed (code {})", code),
            Self::Overflow => write!(f, "image does not fit the update slot"),
            Self::Cancelled => write!(f, "update cancelled"),
            Self::NotInitialized => write!(f, "not initialized"),
            Self::InvalidState => write!(f, "operation not allowed in the current boot state"),
        }
    }
}

impl core::error::Error for OtaError {}

impl From<NorFlashErrorKind> for OtaError {
    fn from(err: NorFlashErrorKind) -> Self {
        let code = match err {
            NorFlashErrorKind::NotAligned => 1,
            NorFlashErrorKind::OutOfBounds => 2,
            NorFlashErrorKind::Other => 3,
            _ => -1,
        };
        OtaError::FlashWrite(code)
    }
}
