//! RSA key material per actor.
//!
//! The built-in actor's private key lives passphrase-encrypted in
//! configuration; parrot accounts' keys are stored in the database, wrapped
//! with the same passphrase. Keys at rest use encrypted PKCS#8 PEM.

use crate::config::Config;
use crate::db::Repo;
use crate::error::AppError;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use std::sync::Arc;

const KEY_BITS: usize = 2048;

pub struct KeyStore {
    cfg: Arc<Config>,
    repo: Arc<Repo>,
}

impl KeyStore {
    pub fn new(cfg: Arc<Config>, repo: Arc<Repo>) -> KeyStore {
        KeyStore { cfg, repo }
    }

    /// Loads and decrypts an actor's private key.
    pub async fn get_priv_key(&self, handle: &str) -> Result<RsaPrivateKey, AppError> {
        let pem = if handle == self.cfg.birb.user {
            self.cfg.birb.priv_key.clone()
        } else {
            self.repo
                .get_priv_key(handle)
                .await?
                .filter(|pem| !pem.is_empty())
                .ok_or(AppError::NotFound)?
        };
        let passphrase = self.cfg.secrets.birb_privkey_passphrase.clone();
        // key decryption runs a KDF, keep it off the async threads
        tokio::task::spawn_blocking(move || decode_priv_key(&pem, &passphrase))
            .await
            .map_err(AppError::internal)?
    }

    /// Generates a keypair for a new parrot actor. Returns
    /// `(public PEM, encrypted private PEM)`.
    pub async fn make_key_pair(&self) -> Result<(String, String), AppError> {
        let passphrase = self.cfg.secrets.birb_privkey_passphrase.clone();
        tokio::task::spawn_blocking(move || make_key_pair_blocking(&passphrase))
            .await
            .map_err(AppError::internal)?
    }
}

fn make_key_pair_blocking(passphrase: &str) -> Result<(String, String), AppError> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(AppError::internal)?;
    let priv_pem = key
        .to_pkcs8_encrypted_pem(&mut rng, passphrase.as_bytes(), LineEnding::LF)
        .map_err(AppError::internal)?;
    let pub_pem = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(AppError::internal)?;
    Ok((pub_pem, priv_pem.to_string()))
}

fn decode_priv_key(pem: &str, passphrase: &str) -> Result<RsaPrivateKey, AppError> {
    if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
        RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
            .map_err(AppError::internal)
    } else if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(pem).map_err(AppError::internal)
    } else {
        RsaPrivateKey::from_pkcs8_pem(pem).map_err(AppError::internal)
    }
}

/// One RSA key for the whole test suite; generation is slow.
#[cfg(test)]
pub(crate) fn test_key_pair_pem() -> &'static (String, String) {
    use std::sync::OnceLock;
    static KEY: OnceLock<(String, String)> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, KEY_BITS).expect("generate test key");
        let pub_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("encode test key");
        let priv_pem = key.to_pkcs8_pem(LineEnding::LF).expect("encode test key");
        (pub_pem, priv_pem.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;

    #[test]
    fn key_pair_round_trips_through_encryption() {
        let (pub_pem, priv_pem) = make_key_pair_blocking("hunter2").unwrap();
        assert!(pub_pem.contains("BEGIN PUBLIC KEY"));
        assert!(priv_pem.contains("BEGIN ENCRYPTED PRIVATE KEY"));

        let key = decode_priv_key(&priv_pem, "hunter2").unwrap();
        assert_eq!(key.size() * 8, KEY_BITS);
        assert!(decode_priv_key(&priv_pem, "wrong-passphrase").is_err());
    }
}
