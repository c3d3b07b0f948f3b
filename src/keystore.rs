//! Alias → key lookup backed by SQLite, private keys stored as `ncryptsec`.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use nostr_sdk::{nips::nip49::EncryptedSecretKey, FromBech32, Keys, PublicKey};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use crate::error::{Error, Result};

/// Supplies the key store password when a private key has to be decrypted.
pub trait PasswordProvider: Send + Sync {
    fn password(&self) -> Result<String>;
}

impl<F> PasswordProvider for F
where
    F: Fn() -> Result<String> + Send + Sync,
{
    fn password(&self) -> Result<String> {
        self()
    }
}

/// Interactive terminal prompt with echo disabled.
pub struct PromptPassword {
    prompt: String,
}

impl PromptPassword {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl PasswordProvider for PromptPassword {
    fn password(&self) -> Result<String> {
        Ok(rpassword::prompt_password(&self.prompt)?)
    }
}

/// Asks the inner provider at most once and remembers the answer.
///
/// Failed attempts are not cached, so a cancelled prompt can be retried.
pub struct CachedPassword<P> {
    inner: P,
    cached: Mutex<Option<String>>,
}

impl<P: PasswordProvider> CachedPassword<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }
}

impl<P: PasswordProvider> PasswordProvider for CachedPassword<P> {
    fn password(&self) -> Result<String> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pw) = cached.as_ref() {
            return Ok(pw.clone());
        }
        let pw = self.inner.password()?;
        *cached = Some(pw.clone());
        Ok(pw)
    }
}

/// What the store holds for an alias.
#[derive(Debug)]
pub enum StoredKey {
    /// Decrypted private key.
    Secret(Keys),
    /// Entry without a private key; it cannot sign.
    PublicOnly(PublicKey),
}

/// Read-only view of the key store database.
pub struct KeyStore {
    path: PathBuf,
    conn: Connection,
    password: Box<dyn PasswordProvider>,
}

impl KeyStore {
    /// Open an existing store; a missing file is an error.
    pub fn open(path: &Path, password: Box<dyn PasswordProvider>) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            password,
        })
    }

    /// Look up `alias`. Private keys are decrypted on demand, which is the
    /// only point the password provider is consulted.
    pub fn get(&self, alias: &str) -> Result<Option<StoredKey>> {
        let row = self
            .conn
            .query_row(
                "SELECT pub_k, priv_k FROM keys WHERE alias = ?1",
                [alias],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        let Some((pub_k, priv_k)) = row else {
            debug!("alias {alias} not found in {}", self.path.display());
            return Ok(None);
        };
        let stored = match priv_k.filter(|s| !s.is_empty()) {
            None => StoredKey::PublicOnly(
                PublicKey::from_hex(&pub_k).map_err(|e| Error::Key(e.to_string()))?,
            ),
            Some(enc) => {
                let keys = decrypt(&enc, &self.password.password()?)?;
                if keys.public_key().to_hex() != pub_k {
                    return Err(Error::Key(format!(
                        "stored key for {alias} does not match its public key"
                    )));
                }
                StoredKey::Secret(keys)
            }
        };
        Ok(Some(stored))
    }
}

/// Decrypt a NIP-49 `ncryptsec1…` string.
fn decrypt(ncryptsec: &str, password: &str) -> Result<Keys> {
    let encrypted =
        EncryptedSecretKey::from_bech32(ncryptsec).map_err(|e| Error::Key(e.to_string()))?;
    let secret = encrypted
        .decrypt(password)
        .map_err(|e| Error::Key(format!("cannot decrypt: {e}")))?;
    Ok(Keys::new(secret))
}

#[cfg(test)]
pub(crate) fn create_store(path: &Path, entries: &[(&str, &Keys, Option<&str>)]) -> Result<()> {
    use nostr_sdk::{nips::nip49::KeySecurity, ToBech32};

    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS keys (alias TEXT PRIMARY KEY, pub_k TEXT NOT NULL, priv_k TEXT)",
    )?;
    for (alias, keys, password) in entries {
        let priv_k = match password {
            Some(pw) => {
                let enc = EncryptedSecretKey::new(keys.secret_key(), *pw, 4, KeySecurity::Unknown)
                    .map_err(|e| Error::Key(e.to_string()))?;
                Some(enc.to_bech32().map_err(|e| Error::Key(e.to_string()))?)
            }
            None => None,
        };
        conn.execute(
            "INSERT INTO keys (alias, pub_k, priv_k) VALUES (?1, ?2, ?3)",
            rusqlite::params![alias, keys.public_key().to_hex(), priv_k],
        )?;
    }
    Ok(())
}
