//! Submission of profile parameter values, in the clear or sealed.
//!
//! Secure params are sealed with a NaCl box (X25519 + XSalsa20-Poly1305):
//! an ephemeral keypair is generated per value and its public half travels in
//! [`SecureData::key`] so the server can open the box with the profile's
//! private key.

use async_trait::async_trait;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use tracing::debug;

use crate::client::models::SecureData;
use crate::client::DrpApi;
use crate::error::ProviderError;

/// Length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Seals a plaintext for the holder of `public_key`.
pub trait Sealer: Send + Sync {
    /// Encrypt `plaintext` for `public_key`.
    fn seal(&self, public_key: &[u8], plaintext: &[u8]) -> Result<SecureData, ProviderError>;
}

/// [`Sealer`] using `crypto_box`'s `SalsaBox`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxSealer;

impl Sealer for BoxSealer {
    fn seal(&self, public_key: &[u8], plaintext: &[u8]) -> Result<SecureData, ProviderError> {
        let key_bytes: [u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| {
            ProviderError::Crypto(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                public_key.len()
            ))
        })?;
        let recipient = PublicKey::from(key_bytes);

        let ephemeral = SecretKey::generate(&mut OsRng);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let payload = SalsaBox::new(&recipient, &ephemeral)
            .encrypt(&nonce, plaintext)
            .map_err(|err| ProviderError::Crypto(err.to_string()))?;

        Ok(SecureData {
            key: ephemeral.public_key().as_bytes().to_vec(),
            nonce: nonce.to_vec(),
            payload,
        })
    }
}

/// Turns a user-supplied value into the body posted to
/// `/profiles/<profile>/params/<name>`.
#[async_trait]
pub trait ParamSubmitter: Send + Sync {
    /// The request body for `value`.
    async fn payload(
        &self,
        api: &dyn DrpApi,
        profile: &str,
        value: &str,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Build the payload and set it on the profile.
    async fn submit(
        &self,
        api: &dyn DrpApi,
        profile: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ProviderError> {
        let payload = self.payload(api, profile, value).await?;
        api.set_profile_param(profile, name, &payload).await
    }
}

/// Posts the value as a JSON string.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSubmitter;

#[async_trait]
impl ParamSubmitter for PlainSubmitter {
    async fn payload(
        &self,
        _api: &dyn DrpApi,
        _profile: &str,
        value: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        Ok(serde_json::Value::String(value.to_string()))
    }
}

/// Fetches the profile's public key and posts a sealed [`SecureData`].
#[derive(Debug, Clone, Default)]
pub struct EncryptedSubmitter<S> {
    sealer: S,
}

impl<S: Sealer> EncryptedSubmitter<S> {
    /// Use `sealer` to encrypt values.
    pub fn new(sealer: S) -> Self {
        Self { sealer }
    }
}

#[async_trait]
impl<S: Sealer> ParamSubmitter for EncryptedSubmitter<S> {
    async fn payload(
        &self,
        api: &dyn DrpApi,
        profile: &str,
        value: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let public_key = api.profile_public_key(profile).await?;
        // DRP decrypts to JSON, so the string is sealed in its JSON form.
        let plaintext = serde_json::to_vec(value)?;
        let sealed = self.sealer.seal(&public_key, &plaintext)?;
        debug!(profile, "sealed secure param value");
        Ok(serde_json::to_value(sealed)?)
    }
}

/// The submission strategy for a secure or plain value.
pub fn submitter_for(secure: bool) -> Box<dyn ParamSubmitter> {
    if secure {
        Box::new(EncryptedSubmitter::new(BoxSealer))
    } else {
        Box::new(PlainSubmitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDrp;
    use crypto_box::aead::generic_array::GenericArray;
    use serde_json::json;

    fn open(secret: &SecretKey, data: &SecureData) -> Vec<u8> {
        let sender: [u8; PUBLIC_KEY_LEN] = data.key.as_slice().try_into().unwrap();
        SalsaBox::new(&PublicKey::from(sender), secret)
            .decrypt(GenericArray::from_slice(&data.nonce), data.payload.as_slice())
            .unwrap()
    }

    #[test]
    fn test_box_sealer_round_trip() {
        let recipient = SecretKey::generate(&mut OsRng);
        let sealed = BoxSealer
            .seal(recipient.public_key().as_bytes(), b"\"s3cret\"")
            .unwrap();

        assert_eq!(sealed.nonce.len(), 24);
        assert_eq!(sealed.key.len(), PUBLIC_KEY_LEN);
        assert_ne!(sealed.payload, b"\"s3cret\"".to_vec());
        assert_eq!(open(&recipient, &sealed), b"\"s3cret\"".to_vec());
    }

    #[test]
    fn test_box_sealer_rejects_short_key() {
        let err = BoxSealer.seal(&[1, 2, 3], b"x").unwrap_err();
        assert!(matches!(err, ProviderError::Crypto(_)));
    }

    #[tokio::test]
    async fn test_plain_submitter_posts_string() {
        let drp = MemoryDrp::new();
        submitter_for(false)
            .submit(&drp, "global", "ntp-servers", "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(
            drp.get_profile_param("global", "ntp-servers").await.unwrap(),
            json!("10.0.0.1")
        );
    }

    #[tokio::test]
    async fn test_encrypted_submitter_seals_for_profile_key() {
        let recipient = SecretKey::generate(&mut OsRng);
        let drp = MemoryDrp::new().with_public_key("global", recipient.public_key().as_bytes());

        submitter_for(true)
            .submit(&drp, "global", "bios-password", "hunter2")
            .await
            .unwrap();

        let stored = drp
            .get_profile_param("global", "bios-password")
            .await
            .unwrap();
        let sealed: SecureData = serde_json::from_value(stored).unwrap();
        let opened: String = serde_json::from_slice(&open(&recipient, &sealed)).unwrap();
        assert_eq!(opened, "hunter2");
    }

    #[tokio::test]
    async fn test_encrypted_submitter_needs_public_key() {
        let drp = MemoryDrp::new();
        let err = submitter_for(true)
            .payload(&drp, "nokey", "hunter2")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
