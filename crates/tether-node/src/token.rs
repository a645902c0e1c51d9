// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bearer-token handling for the auth handshake.
//!
//! The raw token exists in memory and on the operator's screen, nowhere
//! else. What reaches disk is its SHA-256 digest, so a leaked token file
//! buys an attacker nothing short of inverting the hash. Presented tokens
//! are digested and compared in constant time during `auth`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use tether_rpc::TokenVerifier;

/// SHA-256 digest of a bearer token — the only form ever persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDigest([u8; 32]);

impl TokenDigest {
    /// Digest a token string.
    pub fn of(token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Constant-time check of a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        Self::of(presented).0.ct_eq(&self.0).into()
    }

    fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn from_hex(text: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(text.trim()).context("token digest is not valid hex")?;
        match <[u8; 32]>::try_from(bytes) {
            Ok(digest) => Ok(Self(digest)),
            Err(_) => bail!("token digest must be exactly 32 bytes"),
        }
    }
}

impl TokenVerifier for TokenDigest {
    fn verify(&self, token: &str) -> bool {
        self.matches(token)
    }
}

/// Mint a fresh 256-bit token from the OS CSPRNG, rendered as base64url
/// for the operator to copy.
pub fn mint_token() -> String {
    use base64::Engine as _;
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(seed)
}

/// On-disk record, YAML:
/// ```yaml
/// digest: "9f86d081…"
/// ```
#[derive(Debug, Serialize, Deserialize)]
struct DigestRecord {
    digest: String,
}

/// Digest storage at a fixed path, e.g. `~/.local/share/tether/token.yaml`.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the stored digest back.
    pub fn read(&self) -> anyhow::Result<TokenDigest> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("no token file at {}", self.path.display()))?;
        let record: DigestRecord = serde_yaml::from_str(&text)
            .with_context(|| format!("malformed token file {}", self.path.display()))?;
        TokenDigest::from_hex(&record.digest)
    }

    /// Mint a new token and store its digest. The previous token stops
    /// working the moment this returns; the new one is handed back for
    /// one-time display.
    pub fn rotate(&self) -> anyhow::Result<String> {
        let token = mint_token();
        self.store_digest(&TokenDigest::of(&token))?;
        Ok(token)
    }

    /// First start mints, later starts read. The raw token is `Some` only
    /// when it was just minted and still needs showing.
    pub fn open(&self) -> anyhow::Result<(TokenDigest, Option<String>)> {
        if self.exists() {
            Ok((self.read()?, None))
        } else {
            let token = self.rotate()?;
            Ok((TokenDigest::of(&token), Some(token)))
        }
    }

    fn store_digest(&self, digest: &TokenDigest) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("preparing {}", dir.display()))?;
        }
        let record = DigestRecord {
            digest: digest.to_hex(),
        };
        let yaml = serde_yaml::to_string(&record).context("encoding token digest")?;
        write_owner_only(&self.path, &yaml)
            .with_context(|| format!("storing token digest at {}", self.path.display()))
    }
}

/// Owner-only file write; 0o600 where the platform supports it.
fn write_owner_only(path: &Path, contents: &str) -> anyhow::Result<()> {
    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_43_chars_and_unique() {
        let a = mint_token();
        let b = mint_token();
        // base64url of 32 bytes, no padding.
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_matches_only_the_original_token() {
        let token = mint_token();
        let digest = TokenDigest::of(&token);
        assert!(digest.matches(&token));
        assert!(!digest.matches("something else"));
        assert!(!digest.matches(""));
    }

    #[test]
    fn digest_hex_round_trips() {
        let digest = TokenDigest::of("abc");
        let back = TokenDigest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(TokenDigest::from_hex("not hex").is_err());
        assert!(TokenDigest::from_hex("abcd").is_err(), "wrong length");
    }

    #[test]
    fn store_open_mints_once_then_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.yaml"));
        assert!(!store.exists());

        let (digest, minted) = store.open().unwrap();
        let token = minted.expect("first open must mint");
        assert!(digest.matches(&token));

        let (digest_again, minted_again) = store.open().unwrap();
        assert!(minted_again.is_none(), "second open must read");
        assert!(digest_again.matches(&token));
    }

    #[test]
    fn rotate_invalidates_the_previous_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.yaml"));
        let old = store.rotate().unwrap();
        let new = store.rotate().unwrap();

        let digest = store.read().unwrap();
        assert!(!digest.matches(&old));
        assert!(digest.matches(&new));
    }
}
