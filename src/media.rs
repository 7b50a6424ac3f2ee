//! Short-lived real-time media credentials.
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaRole {
    Publisher,
    Subscriber,
}

/// What a token grants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaGrant {
    pub channel: String,
    pub uid: u32,
    pub role: MediaRole,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaToken {
    pub token: String,
    pub app_id: String,
    pub channel: String,
    pub uid: u32,
    pub role: MediaRole,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenIssuer: Send + Sync + 'static {
    async fn issue(&self, grant: MediaGrant) -> Result<MediaToken, Error>;
}

/// Numeric media uid for an account: the last 8 hex digits of its id,
/// reduced below one million.
pub fn participant_uid(account: Uuid) -> u32 {
    let bytes = account.as_bytes();
    let tail = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    tail % 1_000_000
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    app_id: String,
    channel: String,
    uid: u32,
    role: MediaRole,
    exp: i64,
}

/// Signs grants with HMAC-SHA256 over the app certificate.
/// Token layout: `base64url(claims json) . base64url(signature)`.
pub struct HmacTokenIssuer {
    app_id: String,
    certificate: Vec<u8>,
}

impl HmacTokenIssuer {
    pub fn new(app_id: impl Into<String>, certificate: impl AsRef<[u8]>) -> Result<Self, Error> {
        let app_id = app_id.into();
        let certificate = certificate.as_ref().to_vec();
        if app_id.is_empty() || certificate.is_empty() {
            return Err(Error::Config(
                "media app id and certificate are required".to_string(),
            ));
        }
        Ok(Self {
            app_id,
            certificate,
        })
    }

    fn mac(&self) -> Result<HmacSha256, Error> {
        HmacSha256::new_from_slice(&self.certificate)
            .map_err(|e| Error::DependencyFailure(format!("media signer: {e}")))
    }

    /// Check signature and expiry; returns the grant on success.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<MediaGrant, Error> {
        let invalid = || Error::Forbidden("invalid media token".to_string());

        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| invalid())?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or_else(invalid)?;

        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or_else(invalid)?;
        if claims.app_id != self.app_id || expires_at <= now {
            return Err(invalid());
        }

        Ok(MediaGrant {
            channel: claims.channel,
            uid: claims.uid,
            role: claims.role,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenIssuer for HmacTokenIssuer {
    async fn issue(&self, grant: MediaGrant) -> Result<MediaToken, Error> {
        let claims = Claims {
            app_id: self.app_id.clone(),
            channel: grant.channel.clone(),
            uid: grant.uid,
            role: grant.role,
            exp: grant.expires_at.timestamp(),
        };
        let raw = serde_json::to_vec(&claims)
            .map_err(|e| Error::DependencyFailure(format!("media claims: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(raw);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(MediaToken {
            token: format!("{payload}.{signature}"),
            app_id: self.app_id.clone(),
            channel: grant.channel,
            uid: grant.uid,
            role: grant.role,
            expires_at: grant.expires_at,
        })
    }
}
