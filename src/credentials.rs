use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

const KEY_FILE: &str = ".mailgram_key";

fn encryption_key() -> Result<Aes256Gcm> {
    let key_path = PathBuf::from(KEY_FILE);
    let key_bytes = if key_path.exists() {
        fs::read(&key_path)?
    } else {
        // Generate new key
        let mut fresh = [0u8; 32];
        OsRng.fill_bytes(&mut fresh);
        fs::write(&key_path, fresh)?;
        fresh.to_vec()
    };
    Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| anyhow!("Failed to create cipher from key: {}", e))
}

fn encrypt_secret(cipher: &Aes256Gcm, secret: &str) -> Result<String> {
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, secret.as_bytes())
        .map_err(|e| anyhow!("Failed to encrypt secret: {}", e))?;

    let mut combined = Vec::new();
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&combined))
}

fn decrypt_secret(cipher: &Aes256Gcm, stored: &str) -> Result<String> {
    let combined = BASE64
        .decode(stored.trim())
        .map_err(|e| anyhow!("Failed to decode base64: {}", e))?;
    if combined.len() < 12 {
        return Err(anyhow!("Secret file is truncated"));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("Failed to decrypt secret: {}", e))?;

    String::from_utf8(plaintext).context("Decrypted secret is not valid UTF-8")
}

/// Returns the named secret, prompting for it on first use and keeping it
/// encrypted on disk afterwards.
pub fn get_secret(name: &str, prompt: &str) -> Result<String> {
    let cipher = encryption_key()?;
    let secret_path = PathBuf::from(format!(".mailgram_{name}"));

    let secret = if secret_path.exists() {
        // Read and decrypt the stored secret
        let stored = fs::read_to_string(&secret_path)?;
        decrypt_secret(&cipher, &stored)?
    } else {
        // Prompt for the secret and store it
        let secret = rpassword::prompt_password(prompt)?;
        let encrypted = encrypt_secret(&cipher, &secret)?;
        fs::write(&secret_path, encrypted)?;
        secret
    };

    Ok(secret)
}
