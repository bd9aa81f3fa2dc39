/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Abstraction around the daemon's home directory: the static identity
 * (`private_key`/`public_key`, analogous to the teacher's
 * `identity.secret`/`identity.public`) and the control-socket auth token.
 * Grounded directly on `zerotier-system-service/src/datadir.rs`'s
 * `DataDir` (same `open`/`load_identity`/`save_identity`/`authtoken` shape)
 * with its `local.conf`/`localconfig::Config` persistence dropped: spec.md
 * §1 calls "persistent JSON configuration stores" an external collaborator,
 * out of this core's scope, and every other piece of device-scoped state
 * here already arrives and is queried over the live `get=1`/`set=1`
 * control socket instead of a config file.
 */

use std::path::PathBuf;

use tokio::sync::Mutex;

use wireguard_crypto::dh::KeyPair;

use crate::utils::{fs_restrict_permissions, read_limit, DEFAULT_FILE_IO_READ_LIMIT};

const AUTH_TOKEN_DEFAULT_LENGTH: usize = 48;
const AUTH_TOKEN_POSSIBLE_CHARS: &str = "0123456789abcdefghijklmnopqrstuvwxyz";
const AUTH_TOKEN_FILENAME: &str = "authtoken.secret";
const PRIVATE_KEY_FILENAME: &str = "private_key";

pub struct DataDir {
    pub base_path: PathBuf,
    authtoken: Mutex<String>,
}

impl DataDir {
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_path = path.into();
        if !base_path.is_dir() {
            let _ = tokio::fs::create_dir_all(&base_path).await;
            if !base_path.is_dir() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "base path not found and cannot be created",
                ));
            }
        }
        Ok(Self { base_path, authtoken: Mutex::new(String::new()) })
    }

    /// Load the static identity from `private_key`, hex-encoded. Returns
    /// `Ok(None)` (rather than an error) when the file is simply absent, so
    /// callers can distinguish "first run" from "corrupt data directory".
    pub async fn load_identity(&self) -> std::io::Result<Option<KeyPair>> {
        let path = self.base_path.join(PRIVATE_KEY_FILENAME);
        if !path.is_file() {
            return Ok(None);
        }
        let data = read_limit(&path, DEFAULT_FILE_IO_READ_LIMIT).await?;
        let text = String::from_utf8_lossy(&data);
        let bytes: [u8; 32] = hex::decode(text.trim())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "private_key is not 32 bytes"))?;
        Ok(Some(KeyPair::from_bytes(&bytes)))
    }

    /// Save a freshly generated identity, owner-only readable.
    pub async fn save_identity(&self, keypair: &KeyPair) -> std::io::Result<()> {
        let path = self.base_path.join(PRIVATE_KEY_FILENAME);
        tokio::fs::write(&path, hex::encode(keypair.private_bytes())).await?;
        fs_restrict_permissions(&path);
        Ok(())
    }

    /// Load the identity, generating and persisting a fresh one on first run.
    pub async fn load_or_generate_identity(&self) -> std::io::Result<KeyPair> {
        match self.load_identity().await? {
            Some(keypair) => Ok(keypair),
            None => {
                let keypair = KeyPair::generate();
                self.save_identity(&keypair).await?;
                Ok(keypair)
            }
        }
    }

    /// Get the control socket's authorization token, creating and saving it
    /// on first use.
    pub async fn authtoken(&self) -> std::io::Result<String> {
        let mut authtoken = self.authtoken.lock().await;
        if authtoken.is_empty() {
            let path = self.base_path.join(AUTH_TOKEN_FILENAME);
            match read_limit(&path, 4096).await {
                Ok(bytes) => *authtoken = String::from_utf8_lossy(&bytes).trim().to_string(),
                Err(_) => {
                    let mut tmp = String::with_capacity(AUTH_TOKEN_DEFAULT_LENGTH);
                    let chars = AUTH_TOKEN_POSSIBLE_CHARS.as_bytes();
                    for _ in 0..AUTH_TOKEN_DEFAULT_LENGTH {
                        let idx = (rand::random::<u32>() as usize) % chars.len();
                        tmp.push(chars[idx] as char);
                    }
                    tokio::fs::write(&path, tmp.as_bytes()).await?;
                    fs_restrict_permissions(&path);
                    *authtoken = tmp;
                }
            }
        }
        Ok(authtoken.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_run_generates_and_persists_an_identity() {
        let dir = tempdir();
        let data_dir = DataDir::open(dir.clone()).await.unwrap();
        let keypair = data_dir.load_or_generate_identity().await.unwrap();

        let reloaded = DataDir::open(dir.clone()).await.unwrap();
        let loaded = reloaded.load_identity().await.unwrap().expect("identity persisted");
        assert_eq!(loaded.public_bytes(), keypair.public_bytes());

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn authtoken_is_stable_across_reopen() {
        let dir = tempdir();
        let data_dir = DataDir::open(dir.clone()).await.unwrap();
        let token_a = data_dir.authtoken().await.unwrap();

        let reopened = DataDir::open(dir.clone()).await.unwrap();
        let token_b = reopened.authtoken().await.unwrap();
        assert_eq!(token_a, token_b);

        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("wgcored-test-{}", rand::random::<u64>()));
        p
    }
}
