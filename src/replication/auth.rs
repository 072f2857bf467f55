//! Force-sync authorization.
//!
//! A primary signs forceResync/forceWipe requests with its delegate key and
//! the secondary verifies them against the key the registry lists for the
//! user's primary.

use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{Error, Result};

/// Signatures older than this are rejected
pub const FORCE_SYNC_SIGNATURE_MAX_AGE_SECS: i64 = 300;

/// Which destructive action a signature authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceAction {
    Resync,
    Wipe,
}

impl ForceAction {
    fn as_str(&self) -> &'static str {
        match self {
            ForceAction::Resync => "force_resync",
            ForceAction::Wipe => "force_wipe",
        }
    }
}

fn signing_message(action: ForceAction, wallets: &[String], timestamp: i64) -> Vec<u8> {
    format!("triplica-sync:{}:{}:{}", action.as_str(), wallets.join(","), timestamp).into_bytes()
}

/// Signs force-sync requests with this node's delegate key
pub struct SyncSigner {
    key: SigningKey,
}

impl SyncSigner {
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let bytes: [u8; 32] = hex::decode(private_key)
            .map_err(|e| Error::Config(format!("Invalid delegate key: {}", e)))?
            .try_into()
            .map_err(|_| Error::Config("Delegate key must be 32 bytes".into()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Hex-encoded verifying key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Sign now; returns (timestamp, hex signature)
    pub fn sign(&self, action: ForceAction, wallets: &[String]) -> (i64, String) {
        let timestamp = Utc::now().timestamp();
        let signature = self.key.sign(&signing_message(action, wallets, timestamp));
        (timestamp, hex::encode(signature.to_bytes()))
    }
}

/// Verify a force-sync signature against a hex verifying key
pub fn verify_force_sync(
    public_key: &str,
    action: ForceAction,
    wallets: &[String],
    timestamp: Option<i64>,
    signature: Option<&str>,
) -> Result<()> {
    let timestamp = timestamp.ok_or_else(|| Error::Signature("missing timestamp".into()))?;
    let signature = signature.ok_or_else(|| Error::Signature("missing signature".into()))?;

    let age = Utc::now().timestamp() - timestamp;
    if !(-FORCE_SYNC_SIGNATURE_MAX_AGE_SECS..=FORCE_SYNC_SIGNATURE_MAX_AGE_SECS).contains(&age) {
        return Err(Error::Signature(format!("signature timestamp is {}s off", age)));
    }

    let key_bytes: [u8; 32] = hex::decode(public_key)
        .map_err(|e| Error::Signature(format!("bad public key: {}", e)))?
        .try_into()
        .map_err(|_| Error::Signature("public key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::Signature(format!("bad public key: {}", e)))?;

    let sig_bytes: [u8; 64] = hex::decode(signature)
        .map_err(|e| Error::Signature(format!("bad signature encoding: {}", e)))?
        .try_into()
        .map_err(|_| Error::Signature("signature must be 64 bytes".into()))?;

    key.verify(
        &signing_message(action, wallets, timestamp),
        &Signature::from_bytes(&sig_bytes),
    )
    .map_err(|_| Error::Signature("signature does not match the primary's delegate key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(seed: u8) -> SyncSigner {
        SyncSigner::from_hex(&hex::encode([seed; 32])).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let primary = signer(1);
        let wallets = vec!["0xabc".to_string()];
        let (ts, sig) = primary.sign(ForceAction::Resync, &wallets);

        verify_force_sync(&primary.public_key_hex(), ForceAction::Resync, &wallets, Some(ts), Some(&sig))
            .unwrap();
    }

    #[test]
    fn test_reject_wrong_key_action_or_wallet() {
        let primary = signer(1);
        let other = signer(2);
        let wallets = vec!["0xabc".to_string()];
        let (ts, sig) = primary.sign(ForceAction::Resync, &wallets);

        assert!(verify_force_sync(&other.public_key_hex(), ForceAction::Resync, &wallets, Some(ts), Some(&sig)).is_err());
        assert!(verify_force_sync(&primary.public_key_hex(), ForceAction::Wipe, &wallets, Some(ts), Some(&sig)).is_err());
        assert!(verify_force_sync(
            &primary.public_key_hex(),
            ForceAction::Resync,
            &["0xdef".to_string()],
            Some(ts),
            Some(&sig)
        )
        .is_err());
        assert!(verify_force_sync(&primary.public_key_hex(), ForceAction::Resync, &wallets, Some(ts), None).is_err());
    }

    #[test]
    fn test_reject_stale_signature() {
        let primary = signer(1);
        let wallets = vec!["0xabc".to_string()];
        let ts = Utc::now().timestamp() - FORCE_SYNC_SIGNATURE_MAX_AGE_SECS - 10;
        let sig = primary.key.sign(&signing_message(ForceAction::Wipe, &wallets, ts));

        let result = verify_force_sync(
            &primary.public_key_hex(),
            ForceAction::Wipe,
            &wallets,
            Some(ts),
            Some(&hex::encode(sig.to_bytes())),
        );
        assert!(matches!(result, Err(Error::Signature(_))));
    }
}
