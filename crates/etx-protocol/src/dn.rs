//! Device Number (DN) canonicalisation.
//!
//! A DN identifies one physical device by 6 bytes, canonically rendered as
//! 12 uppercase hex characters. Devices, control messages and the discovery
//! probe all send DNs in different shapes (raw bytes, a big-endian integer,
//! or a decorated hex string); every boundary in this crate funnels through
//! [`Dn::normalize`] so the rest of the pipeline only ever sees the canonical
//! form.
//!
//! The `"ALL"` broadcast literal is deliberately NOT accepted by
//! [`Dn::normalize`] — see [`Target`] for the one call site allowed to treat
//! it as a selector rather than a literal DN.

use std::fmt;

/// A canonical 6-byte device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dn([u8; 6]);

/// Anything that can be normalised into a [`Dn`].
#[derive(Debug, Clone)]
pub enum DnInput<'a> {
    Bytes([u8; 6]),
    Int(u64),
    Str(&'a str),
}

impl<'a> From<[u8; 6]> for DnInput<'a> {
    fn from(b: [u8; 6]) -> Self {
        DnInput::Bytes(b)
    }
}

impl<'a> From<u64> for DnInput<'a> {
    fn from(v: u64) -> Self {
        DnInput::Int(v)
    }
}

impl<'a> From<&'a str> for DnInput<'a> {
    fn from(s: &'a str) -> Self {
        DnInput::Str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnError {
    /// Hex string did not decode to exactly 6 bytes after normalisation.
    BadLength(usize),
    /// Non-hex characters remained after stripping separators.
    NotHex(String),
    /// Integer DN does not fit in 6 bytes (> 2^48 - 1).
    IntOutOfRange(u64),
    /// The literal `"ALL"` was rejected — it is only valid as a [`Target`].
    BroadcastLiteralRejected,
}

impl fmt::Display for DnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnError::BadLength(n) => write!(f, "DN must be 6 bytes (12 hex chars), got {n} bytes"),
            DnError::NotHex(s) => write!(f, "DN contains non-hex characters: '{s}'"),
            DnError::IntOutOfRange(v) => write!(f, "DN integer {v} does not fit in 6 bytes"),
            DnError::BroadcastLiteralRejected => {
                write!(f, "'ALL' is not a valid device DN in this context")
            }
        }
    }
}

impl std::error::Error for DnError {}

impl Dn {
    /// Normalise any supported input shape into a canonical `Dn`.
    ///
    /// Rejects the `"ALL"` broadcast literal unconditionally; callers that
    /// need to accept a broadcast selector must go through [`Target::parse`]
    /// instead.
    pub fn normalize<'a>(input: impl Into<DnInput<'a>>) -> Result<Dn, DnError> {
        match input.into() {
            DnInput::Bytes(b) => Ok(Dn(b)),
            DnInput::Int(v) => {
                if v > 0xFFFF_FFFF_FFFF {
                    return Err(DnError::IntOutOfRange(v));
                }
                let be = v.to_be_bytes();
                let mut b = [0u8; 6];
                b.copy_from_slice(&be[2..8]);
                Ok(Dn(b))
            }
            DnInput::Str(s) => {
                if s.eq_ignore_ascii_case("all") {
                    return Err(DnError::BroadcastLiteralRejected);
                }
                Self::from_decorated_str(s)
            }
        }
    }

    fn from_decorated_str(s: &str) -> Result<Dn, DnError> {
        let stripped: String = s
            .chars()
            .filter(|c| *c != ':' && *c != '-' && !c.is_whitespace())
            .collect();
        if stripped.is_empty() || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DnError::NotHex(s.to_owned()));
        }
        let upper = stripped.to_ascii_uppercase();
        if upper.len() > 12 {
            return Err(DnError::BadLength(upper.len().div_ceil(2)));
        }
        // Right-align to 12 hex chars (zero-pad on the left).
        let padded = format!("{upper:0>12}");
        let mut bytes = [0u8; 6];
        for i in 0..6 {
            bytes[i] = u8::from_str_radix(&padded[i * 2..i * 2 + 2], 16)
                .map_err(|_| DnError::NotHex(s.to_owned()))?;
        }
        Ok(Dn(bytes))
    }

    /// The canonical 12-character uppercase hex representation.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// A command/control target: either one device, or the broadcast selector.
///
/// Only [`Target::parse`] ever produces [`Target::All`] — every other path in
/// the pipeline normalises through [`Dn::normalize`], which rejects `"ALL"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Device(Dn),
    All,
}

impl Target {
    pub fn parse(s: &str) -> Result<Target, DnError> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Target::All);
        }
        Dn::from_decorated_str(s).map(Target::Device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalisation_agrees_across_input_shapes() {
        let expected = "010203040506";
        assert_eq!(
            Dn::normalize([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]).unwrap().hex(),
            expected
        );
        assert_eq!(Dn::normalize(0x010203040506u64).unwrap().hex(), expected);
        assert_eq!(
            Dn::normalize("01:02:03:04:05:06").unwrap().hex(),
            expected
        );
        assert_eq!(Dn::normalize("010203040506").unwrap().hex(), expected);
    }

    #[test]
    fn normalize_is_idempotent() {
        let dn = Dn::normalize("ABCDEF012345").unwrap();
        let dn2 = Dn::normalize(dn.hex().as_str()).unwrap();
        assert_eq!(dn, dn2);
    }

    #[test]
    fn short_strings_are_right_aligned() {
        let dn = Dn::normalize("ABCD").unwrap();
        assert_eq!(dn.hex(), "000000000ABCD".chars().rev().take(12).collect::<String>().chars().rev().collect::<String>());
    }

    #[test]
    fn dashes_and_spaces_are_stripped() {
        assert_eq!(
            Dn::normalize("ab-cd-ef-01-02-03").unwrap().hex(),
            "ABCDEF010203"
        );
        assert_eq!(
            Dn::normalize("ab cd ef 01 02 03").unwrap().hex(),
            "ABCDEF010203"
        );
    }

    #[test]
    fn rejects_all_literal_in_normalize() {
        assert_eq!(Dn::normalize("ALL"), Err(DnError::BroadcastLiteralRejected));
        assert_eq!(Dn::normalize("all"), Err(DnError::BroadcastLiteralRejected));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(Dn::normalize("ZZZZZZZZZZZZ"), Err(DnError::NotHex(_))));
    }

    #[test]
    fn int_out_of_range_is_rejected() {
        assert!(matches!(
            Dn::normalize(1u64 << 49),
            Err(DnError::IntOutOfRange(_))
        ));
    }

    #[test]
    fn target_parse_accepts_broadcast_and_device() {
        assert_eq!(Target::parse("ALL").unwrap(), Target::All);
        assert_eq!(
            Target::parse("010203040506").unwrap(),
            Target::Device(Dn::normalize("010203040506").unwrap())
        );
    }
}
