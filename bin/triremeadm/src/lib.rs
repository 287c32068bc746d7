// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Trireme administration library

pub mod print;
pub mod replay;

use slog::Drain;
use slog::Logger;
use std::path::Path;
use std::sync::Arc;
use trireme::api::PuPolicy;
use trireme::config::ConfigError;
use trireme::engine::secrets::PskSecrets;
use trireme::engine::secrets::Secrets;
use trireme::engine::secrets::SecretsError;
use trireme::engine::token::ACK_TOKEN_FIXED_LEN;
use trireme::engine::token::CLAIMS_HEADER_LEN;
use trireme::engine::token::ClaimsHeader;
use trireme::engine::token::ConnectionClaims;
use trireme::engine::token::NONCE_LEN;
use trireme::engine::token::TokenEngine;
use trireme::engine::token::TokenError;
use trireme::engine::token::TokenKind;
use trireme::provider::LogLevel;
use trireme::provider::LogProvider;

#[derive(Debug, thiserror::Error)]
pub enum AdmError {
    #[error("{path}: {msg}")]
    Policy { path: String, msg: String },

    #[error("bad capture: {0}")]
    Pcap(String),

    #[error("unsupported capture link type {0}")]
    Linktype(i32),

    #[error("token is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("unknown token kind {0}")]
    TokenKind(u8),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Routes datapath logging into an slog [`Logger`].
pub struct SlogLog(pub Logger);

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Debug => slog::debug!(self.0, "{}", msg),
            LogLevel::Note => slog::info!(self.0, "{}", msg),
            LogLevel::Warn => slog::warn!(self.0, "{}", msg),
            LogLevel::Error => slog::error!(self.0, "{}", msg),
        }
    }
}

/// A terminal logger filtered by `RUST_LOG`.
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!())
}

/// Load a PU policy from a TOML file.
pub fn load_policy(path: &Path) -> Result<PuPolicy, AdmError> {
    let s = std::fs::read_to_string(path)?;
    toml::from_str(&s).map_err(|e| AdmError::Policy {
        path: path.display().to_string(),
        msg: e.to_string(),
    })
}

pub fn psk(key: &str) -> Result<Arc<dyn Secrets>, AdmError> {
    Ok(Arc::new(PskSecrets::new(key.as_bytes())?))
}

/// What could be learned from a token.
#[derive(Debug)]
pub enum TokenSummary {
    /// A SYN or SYN-ACK token with a good signature.
    Claims { len: usize, claims: ConnectionClaims },

    /// An ACK token. Its signature covers nonces only the two ends of
    /// the connection know, so it is decoded but not verified.
    Ack { header: ClaimsHeader, sender: Vec<u8>, receiver: Vec<u8> },
}

/// Decode a token and verify it with `secrets` where possible.
pub fn decode_token(
    bytes: &[u8],
    secrets: Arc<dyn Secrets>,
) -> Result<TokenSummary, AdmError> {
    let header = ClaimsHeader::from_bytes(bytes)?;
    let kind_byte = bytes.get(CLAIMS_HEADER_LEN).copied().ok_or(
        TokenError::Truncated { need: CLAIMS_HEADER_LEN + 1, have: bytes.len() },
    )?;

    match TokenKind::from_byte(kind_byte) {
        Some(TokenKind::Ack) => {
            if bytes.len() < ACK_TOKEN_FIXED_LEN {
                return Err(TokenError::Truncated {
                    need: ACK_TOKEN_FIXED_LEN,
                    have: bytes.len(),
                }
                .into());
            }
            let at = CLAIMS_HEADER_LEN + 1;
            Ok(TokenSummary::Ack {
                header,
                sender: bytes[at..at + NONCE_LEN].to_vec(),
                receiver: bytes[at + NONCE_LEN..at + 2 * NONCE_LEN].to_vec(),
            })
        }

        Some(_) => {
            let tokens =
                TokenEngine::new(secrets, 0, header.compression, header.encrypt);
            let (claims, len) = tokens.inspect_token(bytes)?;
            Ok(TokenSummary::Claims { len, claims })
        }

        None => Err(AdmError::TokenKind(kind_byte)),
    }
}
