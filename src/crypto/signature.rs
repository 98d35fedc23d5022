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

//! RSA PKCS#1 v1.5 / SHA-256 verification against the image signing key.
//!
//! The key is compiled into the firmware as a DER `SubjectPublicKeyInfo` and
//! parsed once into process-wide state with [`install_public_key`]. Later calls
//! are no-ops returning the same verifier, and readers never need a lock since
//! the parsed key is never mutated.

use log::{error, info, warn};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::Sha256;
use spin::Once;

use crate::crypto::hash::Digest256;
use crate::error::OtaError;

static PUBLIC_KEY: Once<SignatureVerifier> = Once::new();

pub struct SignatureVerifier {
    key: RsaPublicKey,
}

impl SignatureVerifier {
    /// Parses a DER encoded `SubjectPublicKeyInfo`. Anything that is not a
    /// well formed RSA key is rejected.
    pub fn from_public_key_der(der: &[u8]) -> Result<Self, OtaError> {
        let key = RsaPublicKey::from_public_key_der(der).map_err(|e| {
            error!("Failed to parse RSA public key: {}", e);
            OtaError::InvalidArg
        })?;
        Ok(Self { key })
    }

    /// Signature length in bytes, equal to the modulus size.
    pub fn modulus_len(&self) -> usize {
        self.key.size()
    }

    pub fn verify(&self, digest: &Digest256, signature: &[u8]) -> Result<(), OtaError> {
        if signature.len() != self.modulus_len() {
            warn!(
                "Signature is {} bytes, expected {}",
                signature.len(),
                self.modulus_len()
            );
            return Err(OtaError::SignatureInvalid);
        }

        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .map_err(|e| {
                warn!("Signature verification failed: {}", e);
                OtaError::SignatureInvalid
            })
    }
}

/// Parses and installs the process-wide verification key. Idempotent: once a
/// key is installed, later calls return it without looking at `der`.
pub fn install_public_key(der: &[u8]) -> Result<&'static SignatureVerifier, OtaError> {
    PUBLIC_KEY.try_call_once(|| {
        let verifier = SignatureVerifier::from_public_key_der(der)?;
        info!(
            "RSA verification key installed ({} bit)",
            verifier.modulus_len() * 8
        );
        Ok(verifier)
    })
}

/// The installed verification key.
pub fn public_key() -> Result<&'static SignatureVerifier, OtaError> {
    PUBLIC_KEY.get().ok_or(OtaError::NotInitialized)
}
