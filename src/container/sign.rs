//! Detached ed25519 artifact signatures.
//!
//! Keys are raw 32-byte files; signatures are raw 64-byte files named
//! `<artifact>.sig`. Nothing here is armored or wrapped - the container
//! format is the envelope.

use crate::config::SIG_SUFFIX;
use crate::error::{LpmError, Result};
use crate::fsio::safe_write;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::path::{Path, PathBuf};

fn read_key_bytes<const N: usize>(path: &Path, what: &str) -> Result<[u8; N]> {
    let data = std::fs::read(path)
        .map_err(|err| LpmError::InvalidInput(format!("cannot read {what} {}: {err}", path.display())))?;
    data.as_slice()
        .try_into()
        .map_err(|_| LpmError::InvalidInput(format!("{what} {} must be {N} bytes", path.display())))
}

/// What: Generate a signing keypair.
///
/// Inputs:
/// - `key_path`: Destination of the private key (written mode 0600).
/// - `pub_path`: Destination of the public key (written mode 0644).
pub fn generate_keypair(key_path: &Path, pub_path: &Path) -> Result<()> {
    let mut rng = rand_core::OsRng;
    let signing = SigningKey::generate(&mut rng);
    safe_write(key_path, signing.as_bytes(), Some(0o600))?;
    safe_write(pub_path, signing.verifying_key().as_bytes(), Some(0o644))?;
    Ok(())
}

/// Sibling signature path of an artifact.
#[must_use]
pub fn signature_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(SIG_SUFFIX);
    PathBuf::from(name)
}

/// What: Sign an artifact, writing `<artifact>.sig`.
///
/// Output:
/// - The signature path.
pub fn sign_artifact(artifact: &Path, key_path: &Path) -> Result<PathBuf> {
    let key: [u8; 32] = read_key_bytes(key_path, "signing key")?;
    let signing = SigningKey::from_bytes(&key);
    let payload = std::fs::read(artifact)?;
    let signature = signing.sign(&payload);
    let sig_path = signature_path(artifact);
    safe_write(&sig_path, &signature.to_bytes(), Some(0o644))?;
    Ok(sig_path)
}

/// What: Verify an artifact against its detached signature.
///
/// Inputs:
/// - `artifact`: Artifact to check.
/// - `sig_path`: Signature file (usually [`signature_path`]).
/// - `pub_path`: Public verification key.
///
/// # Errors
///
/// `LpmError::SignatureInvalid` when the signature file is missing,
/// malformed, or does not verify.
pub fn verify_signature(artifact: &Path, sig_path: &Path, pub_path: &Path) -> Result<()> {
    let display = artifact.display().to_string();
    if !sig_path.exists() {
        return Err(LpmError::SignatureInvalid(format!(
            "{display}: missing signature {}",
            sig_path.display()
        )));
    }
    let key: [u8; 32] = read_key_bytes(pub_path, "verification key")?;
    let verifying = VerifyingKey::from_bytes(&key)
        .map_err(|err| LpmError::InvalidInput(format!("bad verification key: {err}")))?;
    let sig_bytes: [u8; 64] = std::fs::read(sig_path)?
        .as_slice()
        .try_into()
        .map_err(|_| LpmError::SignatureInvalid(format!("{display}: malformed signature")))?;
    let signature = Signature::from_bytes(&sig_bytes);
    let payload = std::fs::read(artifact)?;
    verifying
        .verify(&payload, &signature)
        .map_err(|_| LpmError::SignatureInvalid(display))
}
