// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Token signing material.
//!
//! The token codec never looks at keys directly; it signs and
//! verifies through a [`Secrets`] capability, so pre-shared-key and
//! public-key deployments run the same datapath.

use core::fmt;
use core::fmt::Display;
use ed25519_dalek::SIGNATURE_LENGTH;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The length of an HMAC-SHA256 tag.
pub const PSK_SIGNATURE_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecretsKind {
    Psk,
    Pki,
}

impl Display for SecretsKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Psk => "PSK",
            Self::Pki => "PKI",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SecretsError {
    /// The key material could not be used.
    BadKey(String),

    /// The signature did not verify.
    BadSignature,

    /// The signer's key is not one we trust.
    UntrustedKey,
}

impl Display for SecretsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadKey(msg) => write!(f, "bad key: {msg}"),
            Self::BadSignature => write!(f, "signature verification failed"),
            Self::UntrustedKey => write!(f, "signer key is not trusted"),
        }
    }
}

impl std::error::Error for SecretsError {}

pub trait Secrets: Send + Sync {
    fn kind(&self) -> SecretsKind;

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SecretsError>;

    /// Verify `sig` over `data`. `key` is the signer key carried in
    /// the token, empty when the signer did not send one.
    fn verify(
        &self,
        data: &[u8],
        sig: &[u8],
        key: &[u8],
    ) -> Result<(), SecretsError>;

    /// The exact length of every signature [`Secrets::sign()`]
    /// produces.
    fn signature_len(&self) -> usize;

    /// The key placed in our tokens for the peer to verify against.
    fn transmitted_key(&self) -> Vec<u8>;
}

/// A key shared by every enforcer, used as an HMAC-SHA256 key.
pub struct PskSecrets {
    key: Vec<u8>,
}

impl PskSecrets {
    pub fn new(key: &[u8]) -> Result<Self, SecretsError> {
        if key.is_empty() {
            return Err(SecretsError::BadKey("empty pre-shared key".into()));
        }
        Ok(Self { key: key.to_vec() })
    }

    fn mac(&self) -> Result<HmacSha256, SecretsError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SecretsError::BadKey(e.to_string()))
    }
}

impl Secrets for PskSecrets {
    fn kind(&self) -> SecretsKind {
        SecretsKind::Psk
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SecretsError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(
        &self,
        data: &[u8],
        sig: &[u8],
        _key: &[u8],
    ) -> Result<(), SecretsError> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(sig).map_err(|_| SecretsError::BadSignature)
    }

    fn signature_len(&self) -> usize {
        PSK_SIGNATURE_LEN
    }

    fn transmitted_key(&self) -> Vec<u8> {
        vec![]
    }
}

/// An Ed25519 signing key plus the set of peer keys we accept.
pub struct PkiSecrets {
    signing: SigningKey,
    trusted: Vec<VerifyingKey>,
}

impl PkiSecrets {
    /// Our own verifying key is always trusted.
    pub fn new(secret: &[u8; 32], trusted: Vec<VerifyingKey>) -> Self {
        let signing = SigningKey::from_bytes(secret);
        let mut trusted = trusted;
        let own = signing.verifying_key();
        if !trusted.contains(&own) {
            trusted.push(own);
        }
        Self { signing, trusted }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }
}

impl Secrets for PkiSecrets {
    fn kind(&self) -> SecretsKind {
        SecretsKind::Pki
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SecretsError> {
        Ok(self.signing.sign(data).to_bytes().to_vec())
    }

    fn verify(
        &self,
        data: &[u8],
        sig: &[u8],
        key: &[u8],
    ) -> Result<(), SecretsError> {
        let key: &[u8; 32] = key
            .try_into()
            .map_err(|_| SecretsError::BadKey("wrong key length".into()))?;
        let vk = VerifyingKey::from_bytes(key)
            .map_err(|e| SecretsError::BadKey(e.to_string()))?;

        if !self.trusted.contains(&vk) {
            return Err(SecretsError::UntrustedKey);
        }

        let sig = Signature::from_slice(sig)
            .map_err(|_| SecretsError::BadSignature)?;
        vk.verify_strict(data, &sig).map_err(|_| SecretsError::BadSignature)
    }

    fn signature_len(&self) -> usize {
        SIGNATURE_LENGTH
    }

    fn transmitted_key(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }
}
