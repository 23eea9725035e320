use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

const KEY_FILE_PERMS: u32 = 0o600;

/// Loads the secp256k1 wallet key from a raw 32-byte file.
///
/// # Errors
///
/// Returns an error if the key file is missing, has wrong permissions or
/// wrong length, or does not hold a valid secp256k1 scalar.
pub fn load_signer(path: &Path) -> anyhow::Result<PrivateKeySigner> {
    if !path.exists() {
        anyhow::bail!(
            "no wallet key at {}; run `keyrelay keygen` first",
            path.display()
        );
    }

    let permissions = fs::metadata(path)?.permissions().mode();
    if permissions & 0o077 != 0 {
        anyhow::bail!(
            "key file {} has overly permissive permissions ({:o}), must be 0600",
            path.display(),
            permissions & 0o777
        );
    }

    let seed = fs::read(path)?;
    if seed.len() != 32 {
        anyhow::bail!("key file must contain exactly 32 bytes, got {}", seed.len());
    }

    Ok(PrivateKeySigner::from_bytes(&B256::from_slice(&seed))?)
}

/// Generates a new wallet key and writes it to `path` with mode 0600.
///
/// # Errors
///
/// Returns an error if a key already exists at `path` or file I/O fails.
pub fn generate_key_file(path: &Path) -> anyhow::Result<PrivateKeySigner> {
    if path.exists() {
        anyhow::bail!("refusing to overwrite existing key at {}", path.display());
    }

    let (signer, seed) = generate_signer()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Create file with restrictive permissions atomically
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(KEY_FILE_PERMS)
        .open(path)?;
    file.write_all(&seed)?;

    Ok(signer)
}

/// Generates a fresh wallet key from OS randomness.
///
/// # Errors
///
/// Returns an error in the negligible case that the random bytes are not a
/// valid scalar.
pub fn generate_signer() -> anyhow::Result<(PrivateKeySigner, [u8; 32])> {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let signer = PrivateKeySigner::from_bytes(&B256::from(seed))?;
    Ok((signer, seed))
}
