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

//! Building, signing and checking wire images on the host.

use anyhow::{Context, Result, bail};
use log::info;
use rand::RngCore;
use rsa::Pkcs1v15Sign;
use secure_ota::crypto::{IV_SIZE, SignatureVerifier, sha256};
use secure_ota::image;
use sha2::Sha256;
use std::path::Path;

use crate::keys;
use crate::util::{read_binary_file, write_binary_file};

/// Encrypts `input` into `IV || AES-256-CBC(PKCS#7(firmware))` under a fresh IV.
pub(crate) fn encrypt(input: &Path, output: &Path, key_path: &Path) -> Result<()> {
    let key = keys::load_aes_key(key_path, true)?;
    let plaintext = read_binary_file(input)?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let wire = image::seal(&key, &iv, &plaintext).context("Encryption failed")?;
    write_binary_file(output, &wire)?;

    info!(
        "Encrypted {} ({} bytes) into {} ({} bytes)",
        input.display(),
        plaintext.len(),
        output.display(),
        wire.len()
    );
    info!("IV: {}", hex::encode(iv));
    info!("Plaintext SHA-256: {}", hex::encode(sha256(&plaintext)));
    Ok(())
}

pub(crate) fn decrypt(input: &Path, output: &Path, key_path: &Path) -> Result<()> {
    let key = keys::load_aes_key(key_path, false)?;
    let wire = read_binary_file(input)?;
    let plaintext = image::open(&key, &wire)
        .with_context(|| format!("Failed to decrypt {}", input.display()))?;
    write_binary_file(output, &plaintext)?;

    info!("Decrypted {} bytes into {}", plaintext.len(), output.display());
    info!("Plaintext SHA-256: {}", hex::encode(sha256(&plaintext)));
    Ok(())
}

/// Signs the SHA-256 digest of the plaintext firmware. With `aes_key`, `input`
/// is a wire image that is decrypted first.
pub(crate) fn sign(input: &Path, key_path: &Path, output: &Path, aes_key: Option<&Path>) -> Result<()> {
    let private_key = keys::load_private_key(key_path)?;
    let plaintext = plaintext_of(input, aes_key)?;
    let digest = sha256(&plaintext);

    let signature = private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .context("Signing failed")?;
    write_binary_file(output, &signature)?;

    info!("Signed digest {}", hex::encode(digest));
    info!("Wrote {} byte signature to {}", signature.len(), output.display());
    Ok(())
}

/// Checks a signature the same way the device does.
pub(crate) fn verify(input: &Path, signature_path: &Path, public_key: &Path, aes_key: Option<&Path>) -> Result<()> {
    let der = keys::load_public_key_der(public_key)?;
    let verifier = SignatureVerifier::from_public_key_der(&der)
        .with_context(|| format!("{} is not a usable RSA public key", public_key.display()))?;
    let plaintext = plaintext_of(input, aes_key)?;
    let signature = read_binary_file(signature_path)?;

    if signature.len() != verifier.modulus_len() {
        bail!(
            "Signature is {} bytes, key modulus is {} bytes",
            signature.len(),
            verifier.modulus_len()
        );
    }

    verifier
        .verify(&sha256(&plaintext), &signature)
        .context("Signature does not match the firmware")?;
    info!("Signature OK for {}", input.display());
    Ok(())
}

fn plaintext_of(input: &Path, aes_key: Option<&Path>) -> Result<Vec<u8>> {
    let bytes = read_binary_file(input)?;
    match aes_key {
        None => Ok(bytes),
        Some(key_path) => {
            let key = keys::load_aes_key(key_path, false)?;
            image::open(&key, &bytes).with_context(|| format!("Failed to decrypt {}", input.display()))
        }
    }
}
