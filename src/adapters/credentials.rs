//! Credential material for database credential stores

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use kube::ResourceExt;
use rand::RngCore;
use sha2::Sha256;

use crate::composer::Engine;
use crate::crd::Database;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of generated passwords in hex characters
const PASSWORD_LEN: usize = 24;

/// Supplies the key/value pairs stored in an intent's credential store.
///
/// Implementations must be deterministic for a given intent so that
/// composing the same intent twice yields identical objects.
pub trait CredentialPolicy: Send + Sync {
    fn credentials(&self, intent: &Database, engine: Engine) -> BTreeMap<String, String>;
}

/// Derives passwords from an operator-wide seed with HMAC-SHA256
#[derive(Clone)]
pub struct DerivedCredentials {
    seed: Vec<u8>,
}

impl DerivedCredentials {
    pub fn new(seed: impl Into<Vec<u8>>) -> Self {
        Self { seed: seed.into() }
    }

    /// Parse a hex encoded seed
    pub fn from_hex(seed: &str) -> Result<Self> {
        let seed = hex::decode(seed.trim())
            .map_err(|e| Error::config(format!("Invalid credential seed: {}", e)))?;
        if seed.len() < 16 {
            return Err(Error::config(
                "Credential seed must be at least 16 bytes (32 hex characters)",
            ));
        }
        Ok(Self::new(seed))
    }

    /// Draw a fresh random seed
    pub fn random() -> Self {
        let mut seed = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::new(seed)
    }

    fn password(&self, namespace: &str, name: &str, key: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.seed).expect("HMAC can take key of any size");
        mac.update(format!("{}/{}/{}", namespace, name, key).as_bytes());
        let mut encoded = hex::encode(mac.finalize().into_bytes());
        encoded.truncate(PASSWORD_LEN);
        encoded
    }
}

impl std::fmt::Debug for DerivedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedCredentials")
            .field("seed", &"<redacted>")
            .finish()
    }
}

impl CredentialPolicy for DerivedCredentials {
    fn credentials(&self, intent: &Database, engine: Engine) -> BTreeMap<String, String> {
        let name = intent.name_any();
        let namespace = intent.namespace().unwrap_or_else(|| "default".to_string());
        let password = |key: &str| self.password(&namespace, &name, key);

        let pairs = match engine {
            Engine::Mysql => vec![
                ("MYSQL_ROOT_PASSWORD", password("MYSQL_ROOT_PASSWORD")),
                ("MYSQL_USER", "admin".to_string()),
                ("MYSQL_PASSWORD", password("MYSQL_PASSWORD")),
                ("MYSQL_DATABASE", name.clone()),
            ],
            Engine::Postgres => vec![
                ("POSTGRES_PASSWORD", password("POSTGRES_PASSWORD")),
                ("POSTGRES_USER", "postgres".to_string()),
                ("POSTGRES_DB", name.clone()),
            ],
        };

        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}
