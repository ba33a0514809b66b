//! License token format used by the `license` / `license_apply` TCP command.
//!
//! Layout lifted from `license/license_gen.py::make_token`: a payload of
//! `ver(1)=2 || tier(1) || exp_ts_be32(4) || mac(6)`, signed with
//! ECDSA-P256-SHA256, base32-encoded with `=` padding stripped.
//!
//! Key management is explicitly out of scope for this pipeline — the signing
//! primitive is abstracted behind [`LicenseSigner`] so the dispatcher never
//! touches a private key. The dispatcher itself only forwards an
//! already-minted token string from a command payload; this module exists so
//! an operator tool (or a test) can mint one.

use data_encoding::BASE32;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseTier {
    Basic,
    Advanced,
    Pro,
}

impl LicenseTier {
    pub fn code(self) -> u8 {
        match self {
            LicenseTier::Basic => 0x01,
            LicenseTier::Advanced => 0x02,
            LicenseTier::Pro => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Option<LicenseTier> {
        match code {
            0x01 => Some(LicenseTier::Basic),
            0x02 => Some(LicenseTier::Advanced),
            0x03 => Some(LicenseTier::Pro),
            _ => None,
        }
    }
}

const TOKEN_VERSION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicensePayload {
    pub tier: LicenseTier,
    pub exp_ts: u32,
    pub mac: [u8; 6],
}

impl LicensePayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.push(TOKEN_VERSION);
        buf.push(self.tier.code());
        buf.extend_from_slice(&self.exp_ts.to_be_bytes());
        buf.extend_from_slice(&self.mac);
        buf
    }
}

/// Abstracts the ECDSA-P256-SHA256 signing primitive. Key custody and
/// rotation live outside this crate; callers inject an implementation.
pub trait LicenseSigner {
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseError {
    InvalidBase32,
    TooShort,
    SigLenMismatch { declared: usize, actual: usize },
    UnknownTier(u8),
}

impl fmt::Display for LicenseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseError::InvalidBase32 => write!(f, "license token is not valid base32"),
            LicenseError::TooShort => write!(f, "license token is shorter than the fixed payload"),
            LicenseError::SigLenMismatch { declared, actual } => write!(
                f,
                "license token declares sig_len={declared} but {actual} bytes remain"
            ),
            LicenseError::UnknownTier(c) => write!(f, "unknown license tier code 0x{c:02X}"),
        }
    }
}

impl std::error::Error for LicenseError {}

/// Build `B32(payload || sig_len || sig)` with `=` padding stripped.
pub fn make_token(payload: &LicensePayload, signer: &dyn LicenseSigner) -> String {
    let payload_bytes = payload.to_bytes();
    let sig = signer.sign(&payload_bytes);
    let mut token_bytes = payload_bytes;
    token_bytes.push(sig.len() as u8);
    token_bytes.extend_from_slice(&sig);
    BASE32.encode(&token_bytes).trim_end_matches('=').to_owned()
}

/// Decode a token's payload and raw signature bytes (signature verification
/// is the caller's concern, not this crate's).
pub fn decode_token(token: &str) -> Result<(LicensePayload, Vec<u8>), LicenseError> {
    let padded = pad_base32(token);
    let bytes = BASE32
        .decode(padded.as_bytes())
        .map_err(|_| LicenseError::InvalidBase32)?;
    if bytes.len() < 13 {
        return Err(LicenseError::TooShort);
    }
    let tier = LicenseTier::from_code(bytes[1]).ok_or(LicenseError::UnknownTier(bytes[1]))?;
    let exp_ts = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
    let mac: [u8; 6] = bytes[6..12].try_into().unwrap();
    let sig_len = bytes[12] as usize;
    let sig = &bytes[13..];
    if sig.len() != sig_len {
        return Err(LicenseError::SigLenMismatch {
            declared: sig_len,
            actual: sig.len(),
        });
    }
    Ok((
        LicensePayload { tier, exp_ts, mac },
        sig.to_vec(),
    ))
}

fn pad_base32(s: &str) -> String {
    let rem = s.len() % 8;
    if rem == 0 {
        s.to_owned()
    } else {
        format!("{s}{}", "=".repeat(8 - rem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSigner(Vec<u8>);
    impl LicenseSigner for FixedSigner {
        fn sign(&self, _payload: &[u8]) -> Vec<u8> {
            self.0.clone()
        }
    }

    #[test]
    fn token_round_trips() {
        let payload = LicensePayload {
            tier: LicenseTier::Advanced,
            exp_ts: 1_800_000_000,
            mac: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
        };
        let signer = FixedSigner(vec![0xAA; 70]);
        let token = make_token(&payload, &signer);
        assert!(!token.contains('='));

        let (decoded_payload, decoded_sig) = decode_token(&token).unwrap();
        assert_eq!(decoded_payload, payload);
        assert_eq!(decoded_sig, vec![0xAA; 70]);
    }

    #[test]
    fn rejects_short_tokens() {
        let token = BASE32.encode(&[1, 2, 3]);
        assert_eq!(decode_token(&token), Err(LicenseError::TooShort));
    }

    #[test]
    fn tier_codes_match_license_gen() {
        assert_eq!(LicenseTier::Basic.code(), 0x01);
        assert_eq!(LicenseTier::Advanced.code(), 0x02);
        assert_eq!(LicenseTier::Pro.code(), 0x03);
    }
}
