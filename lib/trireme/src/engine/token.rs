// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The handshake token codec.
//!
//! SYN and SYN-ACK tokens carry the sender's claims:
//!
//! ```text
//! header(4) | kind(1) | len(2, BE) | postcard(claims)(len) | signature
//! ```
//!
//! The ACK token only proves possession of both nonces and has a
//! fixed size, [`TokenEngine::ack_size()`], which both ends know
//! before it is sent:
//!
//! ```text
//! header(4) | kind(1) | sender nonce(16) | receiver nonce(16) | signature
//! ```
//!
//! The signature covers every byte that precedes it. Every decoding
//! failure is an error; no partially verified claims ever escape.

use super::connection::AuthInfo;
use super::pucontext::PuContext;
use super::secrets::Secrets;
use super::secrets::SecretsError;
use super::tags::TagStore;
use crate::api::CompressionType;
use crate::api::DATAPATH_VERSION;
use crate::time::unix_secs;
use alloc::sync::Arc;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use subtle::ConstantTimeEq;

pub const NONCE_LEN: usize = 16;
pub type Nonce = [u8; NONCE_LEN];

pub const EPHEMERAL_KEY_LEN: usize = 32;

pub const CLAIMS_HEADER_LEN: usize = 4;

/// header + kind + length.
pub const TOKEN_PREFIX_LEN: usize = CLAIMS_HEADER_LEN + 1 + 2;

/// Everything in an ACK token except the signature.
pub const ACK_TOKEN_FIXED_LEN: usize = CLAIMS_HEADER_LEN + 1 + 2 * NONCE_LEN;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenError {
    /// The buffer is shorter than the token it announces.
    Truncated { need: usize, have: usize },

    /// The claims header is malformed.
    BadHeader(&'static str),

    WrongKind { expected: TokenKind, actual: u8 },

    /// The claims payload failed to decode.
    Decode(String),

    Encode(String),

    Signature(SecretsError),

    Expired { expires: u64, now: u64 },

    /// The nonces in the token are not the ones this connection
    /// exchanged.
    NonceMismatch,

    /// The connection has not learned the peer's nonce yet.
    MissingRemoteNonce,
}

impl Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated { need, have } => {
                write!(f, "token truncated: need {need}, have {have}")
            }
            Self::BadHeader(what) => write!(f, "bad claims header: {what}"),
            Self::WrongKind { expected, actual } => {
                write!(f, "expected {expected} token, got kind {actual}")
            }
            Self::Decode(msg) => write!(f, "claims decode: {msg}"),
            Self::Encode(msg) => write!(f, "claims encode: {msg}"),
            Self::Signature(e) => write!(f, "{e}"),
            Self::Expired { expires, now } => {
                write!(f, "token expired at {expires}, now {now}")
            }
            Self::NonceMismatch => write!(f, "nonce mismatch"),
            Self::MissingRemoteNonce => write!(f, "remote nonce not known"),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<SecretsError> for TokenError {
    fn from(e: SecretsError) -> Self {
        Self::Signature(e)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenKind {
    Syn = 1,
    SynAck = 2,
    Ack = 3,
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Syn => "SYN",
            Self::SynAck => "SYN-ACK",
            Self::Ack => "ACK",
        };
        write!(f, "{s}")
    }
}

impl TokenKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Syn),
            2 => Some(Self::SynAck),
            3 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// The fixed prefix of every token.
///
/// Byte 0 holds the datapath version (bits 7..2) and the compression
/// type (bits 1..0); bit 7 of byte 1 is the encryption flag. All
/// other bits are reserved: written as zero, ignored on read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClaimsHeader {
    pub version: u8,
    pub compression: CompressionType,
    pub encrypt: bool,
}

impl ClaimsHeader {
    pub fn to_bytes(&self) -> [u8; CLAIMS_HEADER_LEN] {
        [
            (self.version << 2) | (self.compression as u8 & 0x03),
            if self.encrypt { 0x80 } else { 0 },
            0,
            0,
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let Some(hdr) = bytes.get(..CLAIMS_HEADER_LEN) else {
            return Err(TokenError::Truncated {
                need: CLAIMS_HEADER_LEN,
                have: bytes.len(),
            });
        };

        let compression = CompressionType::from_bits(hdr[0] & 0x03)
            .ok_or(TokenError::BadHeader("compression type"))?;

        Ok(Self {
            version: hdr[0] >> 2,
            compression,
            encrypt: hdr[1] & 0x80 != 0,
        })
    }
}

/// The signed body of a SYN or SYN-ACK token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct ClaimsPayload {
    tags: TagStore,
    compressed_tags: TagStore,
    lcl: Nonce,
    rmt: Option<Nonce>,
    ek: Option<Vec<u8>>,
    id: String,
    public_key: Vec<u8>,
    expires: u64,
}

/// The decoded claims of a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionClaims {
    pub header: ClaimsHeader,
    pub kind: TokenKind,
    pub tags: TagStore,
    pub compressed_tags: TagStore,
    /// The sender's nonce.
    pub lcl: Nonce,
    /// Our nonce, echoed by a SYN-ACK.
    pub rmt: Option<Nonce>,
    pub ek: Option<Vec<u8>>,
    /// The sender's PU ID.
    pub id: String,
    pub expires: u64,
}

impl ConnectionClaims {
    /// The tags policy is matched against: identity followed by the
    /// compressed tags.
    pub fn policy_tags(&self) -> TagStore {
        self.tags.merged(&self.compressed_tags)
    }
}

/// Creates and verifies tokens with one set of secrets.
#[derive(Clone)]
pub struct TokenEngine {
    secrets: Arc<dyn Secrets>,
    validity_secs: u64,
    compression: CompressionType,
    encrypt: bool,
}

impl TokenEngine {
    pub fn new(
        secrets: Arc<dyn Secrets>,
        validity_secs: u64,
        compression: CompressionType,
        encrypt: bool,
    ) -> Self {
        Self { secrets, validity_secs, compression, encrypt }
    }

    pub fn secrets(&self) -> &Arc<dyn Secrets> {
        &self.secrets
    }

    pub fn header(&self) -> ClaimsHeader {
        ClaimsHeader {
            version: DATAPATH_VERSION,
            compression: self.compression,
            encrypt: self.encrypt,
        }
    }

    /// The size of every ACK token.
    pub fn ack_size(&self) -> usize {
        ACK_TOKEN_FIXED_LEN + self.secrets.signature_len()
    }

    pub fn create_syn_token(
        &self,
        ctx: &PuContext,
        auth: &mut AuthInfo,
    ) -> Result<Vec<u8>, TokenError> {
        self.create_claims_token(TokenKind::Syn, ctx, auth, None)
    }

    /// The SYN-ACK echoes the nonce learned from the SYN.
    pub fn create_synack_token(
        &self,
        ctx: &PuContext,
        auth: &mut AuthInfo,
    ) -> Result<Vec<u8>, TokenError> {
        let rmt = auth.remote_nonce.ok_or(TokenError::MissingRemoteNonce)?;
        self.create_claims_token(TokenKind::SynAck, ctx, auth, Some(rmt))
    }

    fn create_claims_token(
        &self,
        kind: TokenKind,
        ctx: &PuContext,
        auth: &mut AuthInfo,
        rmt: Option<Nonce>,
    ) -> Result<Vec<u8>, TokenError> {
        let ek = if self.encrypt {
            let key = auth
                .local_ephemeral_key
                .get_or_insert_with(rand::random::<[u8; EPHEMERAL_KEY_LEN]>);
            Some(key.to_vec())
        } else {
            None
        };

        // With compression on only the compressed form travels.
        let tags = match self.compression {
            CompressionType::None => ctx.identity().clone(),
            _ => TagStore::new(),
        };

        let payload = ClaimsPayload {
            tags,
            compressed_tags: ctx.compressed_tags().clone(),
            lcl: auth.local_nonce,
            rmt,
            ek,
            id: ctx.id().into(),
            public_key: self.secrets.transmitted_key(),
            expires: unix_secs() + self.validity_secs,
        };

        let body = postcard::to_allocvec(&payload)
            .map_err(|e| TokenError::Encode(e.to_string()))?;
        let len = u16::try_from(body.len())
            .map_err(|_| TokenError::Encode("claims too large".into()))?;

        let mut token = Vec::with_capacity(
            TOKEN_PREFIX_LEN + body.len() + self.secrets.signature_len(),
        );
        token.extend_from_slice(&self.header().to_bytes());
        token.push(kind as u8);
        token.extend_from_slice(&len.to_be_bytes());
        token.extend_from_slice(&body);
        let sig = self.secrets.sign(&token)?;
        token.extend_from_slice(&sig);
        Ok(token)
    }

    /// The ACK token: our nonce then the peer's, signed.
    pub fn create_ack_token(
        &self,
        auth: &AuthInfo,
    ) -> Result<Vec<u8>, TokenError> {
        let rmt = auth.remote_nonce.ok_or(TokenError::MissingRemoteNonce)?;
        let mut token = Vec::with_capacity(self.ack_size());
        token.extend_from_slice(&self.header().to_bytes());
        token.push(TokenKind::Ack as u8);
        token.extend_from_slice(&auth.local_nonce);
        token.extend_from_slice(&rmt);
        let sig = self.secrets.sign(&token)?;
        token.extend_from_slice(&sig);
        Ok(token)
    }

    /// The total length of the SYN or SYN-ACK token at the start of
    /// `data`, read from its prefix.
    pub fn token_len(&self, data: &[u8]) -> Result<usize, TokenError> {
        let Some(prefix) = data.get(..TOKEN_PREFIX_LEN) else {
            return Err(TokenError::Truncated {
                need: TOKEN_PREFIX_LEN,
                have: data.len(),
            });
        };
        let body = usize::from(u16::from_be_bytes([prefix[5], prefix[6]]));
        Ok(TOKEN_PREFIX_LEN + body + self.secrets.signature_len())
    }

    /// Verify and decode the SYN or SYN-ACK token at the start of
    /// `data`, recording what was learned about the peer in `auth`.
    ///
    /// Returns the claims and the number of bytes the token
    /// occupied. A SYN-ACK must echo our own nonce.
    pub fn parse_token(
        &self,
        auth: &mut AuthInfo,
        data: &[u8],
    ) -> Result<(ConnectionClaims, usize), TokenError> {
        let (claims, public_key, total) = self.decode_claims(data)?;

        if claims.kind == TokenKind::SynAck {
            let echoed = claims.rmt.ok_or(TokenError::NonceMismatch)?;
            if !bool::from(echoed[..].ct_eq(&auth.local_nonce[..])) {
                return Err(TokenError::NonceMismatch);
            }
        }

        auth.remote_nonce = Some(claims.lcl);
        auth.remote_context_id = Some(claims.id.clone());
        auth.remote_public_key = public_key;
        auth.remote_ephemeral_key = claims.ek.clone();
        auth.claims = Some(claims.clone());
        Ok((claims, total))
    }

    /// Verify and decode a SYN or SYN-ACK token outside of any
    /// connection. The nonce echo is not checked.
    pub fn inspect_token(
        &self,
        data: &[u8],
    ) -> Result<(ConnectionClaims, usize), TokenError> {
        let (claims, _, total) = self.decode_claims(data)?;
        Ok((claims, total))
    }

    fn decode_claims(
        &self,
        data: &[u8],
    ) -> Result<(ConnectionClaims, Vec<u8>, usize), TokenError> {
        let header = ClaimsHeader::from_bytes(data)?;
        let total = self.token_len(data)?;
        if data.len() < total {
            return Err(TokenError::Truncated { need: total, have: data.len() });
        }

        let kind = match TokenKind::from_byte(data[CLAIMS_HEADER_LEN]) {
            Some(k @ (TokenKind::Syn | TokenKind::SynAck)) => k,
            _ => {
                return Err(TokenError::WrongKind {
                    expected: TokenKind::Syn,
                    actual: data[CLAIMS_HEADER_LEN],
                });
            }
        };

        let sig_at = total - self.secrets.signature_len();
        let body = &data[TOKEN_PREFIX_LEN..sig_at];
        let payload: ClaimsPayload = postcard::from_bytes(body)
            .map_err(|e| TokenError::Decode(e.to_string()))?;

        self.secrets.verify(
            &data[..sig_at],
            &data[sig_at..total],
            &payload.public_key,
        )?;

        let now = unix_secs();
        if payload.expires < now {
            return Err(TokenError::Expired { expires: payload.expires, now });
        }

        let claims = ConnectionClaims {
            header,
            kind,
            tags: payload.tags,
            compressed_tags: payload.compressed_tags,
            lcl: payload.lcl,
            rmt: payload.rmt,
            ek: payload.ek,
            id: payload.id,
            expires: payload.expires,
        };
        Ok((claims, payload.public_key, total))
    }

    /// Verify the ACK token at the start of `data`: the sender's
    /// nonce must be the one it sent us and the receiver nonce must
    /// be ours.
    pub fn parse_ack_token(
        &self,
        auth: &AuthInfo,
        data: &[u8],
    ) -> Result<(), TokenError> {
        let size = self.ack_size();
        if data.len() < size {
            return Err(TokenError::Truncated { need: size, have: data.len() });
        }

        ClaimsHeader::from_bytes(data)?;
        if data[CLAIMS_HEADER_LEN] != TokenKind::Ack as u8 {
            return Err(TokenError::WrongKind {
                expected: TokenKind::Ack,
                actual: data[CLAIMS_HEADER_LEN],
            });
        }

        self.secrets.verify(
            &data[..ACK_TOKEN_FIXED_LEN],
            &data[ACK_TOKEN_FIXED_LEN..size],
            &auth.remote_public_key,
        )?;

        let rmt = auth.remote_nonce.ok_or(TokenError::MissingRemoteNonce)?;
        let at = CLAIMS_HEADER_LEN + 1;
        let sender = &data[at..at + NONCE_LEN];
        let receiver = &data[at + NONCE_LEN..at + 2 * NONCE_LEN];

        let ok = sender.ct_eq(&rmt[..]) & receiver.ct_eq(&auth.local_nonce[..]);
        if !bool::from(ok) {
            return Err(TokenError::NonceMismatch);
        }
        Ok(())
    }
}
