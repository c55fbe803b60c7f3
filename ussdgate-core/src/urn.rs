// ABOUTME: Strict tel URN normalisation for senders arriving on a channel.
// ABOUTME: Produces E.164-style paths using the channel country's calling code.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TEL_SCHEME: &str = "tel";

/// Numbers at or below this many digits are short codes and are kept local.
const MAX_SHORT_CODE_LEN: usize = 6;

/// Calling codes for countries where USSD channels are commonly deployed.
const CALLING_CODES: &[(&str, &str)] = &[
    ("BI", "257"),
    ("CD", "243"),
    ("CM", "237"),
    ("ET", "251"),
    ("GB", "44"),
    ("GH", "233"),
    ("IN", "91"),
    ("KE", "254"),
    ("MW", "265"),
    ("NG", "234"),
    ("RW", "250"),
    ("SN", "221"),
    ("SO", "252"),
    ("TZ", "255"),
    ("UG", "256"),
    ("US", "1"),
    ("ZA", "27"),
    ("ZM", "260"),
    ("ZW", "263"),
];

/// A `tel` URN whose path is strictly numeric, optionally `+`-prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TelUrn {
    path: String,
}

impl TelUrn {
    /// Normalise a raw sender number for the given ISO country.
    pub fn for_country(number: &str, country: Option<&str>) -> Result<Self> {
        let cleaned: String = number
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
            .collect();

        let (has_plus, digits) = match cleaned.strip_prefix('+') {
            Some(rest) => (true, rest.to_string()),
            None => match cleaned.strip_prefix("00") {
                Some(rest) if rest.len() > MAX_SHORT_CODE_LEN => (true, rest.to_string()),
                _ => (false, cleaned.clone()),
            },
        };

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            bail!("phone number supplied is not a number: {}", number);
        }

        if has_plus {
            return Ok(Self {
                path: format!("+{}", digits),
            });
        }
        if digits.len() <= MAX_SHORT_CODE_LEN {
            return Ok(Self { path: digits });
        }

        let code = country.and_then(calling_code);
        let path = match code {
            Some(code) if digits.starts_with('0') => format!("+{}{}", code, &digits[1..]),
            Some(code) if digits.starts_with(code) => format!("+{}", digits),
            Some(code) => format!("+{}{}", code, digits),
            None => digits,
        };
        Ok(Self { path })
    }

    /// The URN path, e.g. `+250788383383`. Used as the sender half of session keys.
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn calling_code(country: &str) -> Option<&'static str> {
    CALLING_CODES
        .iter()
        .find(|(iso, _)| iso.eq_ignore_ascii_case(country))
        .map(|(_, code)| *code)
}

impl fmt::Display for TelUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", TEL_SCHEME, self.path)
    }
}

impl TryFrom<String> for TelUrn {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        let path = value
            .strip_prefix("tel:")
            .ok_or_else(|| anyhow::anyhow!("not a tel URN: {}", value))?;
        Self::for_country(path, None)
    }
}

impl From<TelUrn> for String {
    fn from(urn: TelUrn) -> Self {
        urn.to_string()
    }
}
