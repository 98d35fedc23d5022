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

//! Key material: the RSA signing pair and the AES image key.

use anyhow::{Context, Result, bail};
use log::{info, warn};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use secure_ota::crypto::{Aes256Key, KEY_SIZE};
use std::fs;
use std::path::Path;

use crate::util::{read_binary_file, write_binary_file};

const PEM_PREFIX: &[u8] = b"-----BEGIN";

/// Writes `private_key.pem` (PKCS#8), `public_key.der` and `public_key.pem`
/// (SubjectPublicKeyInfo). The DER file is what the device embeds.
pub(crate) fn generate_signing_keys(out_dir: &Path, bits: usize) -> Result<()> {
    info!("Generating {} bit RSA key pair", bits);
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits).context("Key generation failed")?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("Failed to encode private key")?;
    let public_der = public_key
        .to_public_key_der()
        .context("Failed to encode public key")?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .context("Failed to encode public key")?;

    let private_path = out_dir.join("private_key.pem");
    write_binary_file(&private_path, private_pem.as_bytes())?;
    write_binary_file(&out_dir.join("public_key.der"), public_der.as_bytes())?;
    write_binary_file(&out_dir.join("public_key.pem"), public_pem.as_bytes())?;

    info!("Keys written to {}", out_dir.display());
    warn!("Keep {} secret", private_path.display());
    Ok(())
}

pub(crate) fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let bytes = read_binary_file(path)?;
    let key = if bytes.starts_with(PEM_PREFIX) {
        let pem = std::str::from_utf8(&bytes).context("Private key PEM is not UTF-8")?;
        RsaPrivateKey::from_pkcs8_pem(pem)
    } else {
        RsaPrivateKey::from_pkcs8_der(&bytes)
    };
    key.with_context(|| format!("{} is not a PKCS#8 RSA private key", path.display()))
}

/// DER `SubjectPublicKeyInfo` from a DER or PEM file.
pub(crate) fn load_public_key_der(path: &Path) -> Result<Vec<u8>> {
    let bytes = read_binary_file(path)?;
    if !bytes.starts_with(PEM_PREFIX) {
        return Ok(bytes);
    }
    let pem = std::str::from_utf8(&bytes).context("Public key PEM is not UTF-8")?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .with_context(|| format!("{} is not an RSA public key", path.display()))?;
    Ok(key
        .to_public_key_der()
        .context("Failed to encode public key")?
        .as_bytes()
        .to_vec())
}

/// Reads a 32-byte AES key stored raw or as hex. With `create`, a missing file
/// is filled with a fresh random key first.
pub(crate) fn load_aes_key(path: &Path, create: bool) -> Result<Aes256Key> {
    if create && !path.exists() {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        write_binary_file(path, &key)?;
        warn!("Generated new AES-256 key in {}", path.display());
        return Ok(key);
    }

    let bytes = fs::read(path).with_context(|| format!("Failed to read key {}", path.display()))?;
    parse_aes_key(&bytes).with_context(|| format!("Bad AES key in {}", path.display()))
}

fn parse_aes_key(bytes: &[u8]) -> Result<Aes256Key> {
    if let Ok(key) = Aes256Key::try_from(bytes) {
        return Ok(key);
    }
    let text = std::str::from_utf8(bytes).map(str::trim).unwrap_or_default();
    let decoded = hex::decode(text).unwrap_or_default();
    match Aes256Key::try_from(decoded.as_slice()) {
        Ok(key) => Ok(key),
        Err(_) => bail!("expected {} raw bytes or {} hex digits", KEY_SIZE, 2 * KEY_SIZE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_key_raw_or_hex() {
        let raw: Vec<u8> = (0..32).collect();
        assert_eq!(parse_aes_key(&raw).unwrap().to_vec(), raw);

        let hex_text = format!("{}\n", hex::encode(&raw));
        assert_eq!(parse_aes_key(hex_text.as_bytes()).unwrap().to_vec(), raw);

        assert!(parse_aes_key(&raw[..31]).is_err());
        assert!(parse_aes_key(b"not a key").is_err());
    }
}
