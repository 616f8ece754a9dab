//! `WWW-Authenticate` parsing.
//!
//! Servers may send several challenges in one header, and some of them do not
//! follow RFC 9110 (unquoted values with spaces, missing commas). Parsing is
//! tolerant: every bare token starts a new challenge and `key=value` pairs
//! attach to the latest one, so a broken neighbour never hides a well-formed
//! `Bearer` challenge.

use std::sync::LazyLock;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use http::HeaderMap;
use http::header::WWW_AUTHENTICATE;
use regex::Regex;

use crate::error::AuthError;

#[allow(clippy::expect_used)] // constant pattern, validated by the tests below
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<key>[A-Za-z0-9!#$%&'*+.^_`|~-]+)\s*=\s*(?:"(?P<quoted>(?:[^"\\]|\\.)*)"|(?P<bare>[^\s,"]*))|(?P<scheme>[A-Za-z0-9!#$%&'*+.^_`|~-]+)"#,
    )
    .expect("static regex should not panic")
});

const DECODE_CONFIG: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, DECODE_CONFIG);
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, DECODE_CONFIG);

/// One authentication challenge: a scheme and its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    params: Vec<(String, String)>,
}

impl Challenge {
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn is_bearer(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("bearer")
    }

    /// First value of parameter `name` (case-insensitive)
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params_named(name).next()
    }

    /// Every value of parameter `name`, in header order
    pub fn params_named<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.params
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All parameters, in header order
    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

/// Parse every challenge in a `WWW-Authenticate` value
#[must_use]
pub fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();
    for caps in TOKEN_REGEX.captures_iter(header) {
        if let Some(scheme) = caps.name("scheme") {
            challenges.push(Challenge {
                scheme: scheme.as_str().to_owned(),
                params: Vec::new(),
            });
            continue;
        }
        let (Some(key), Some(current)) = (caps.name("key"), challenges.last_mut()) else {
            continue;
        };
        let value = match caps.name("quoted") {
            Some(quoted) => unescape(quoted.as_str()),
            None => caps
                .name("bare")
                .map_or_else(String::new, |m| m.as_str().to_owned()),
        };
        current.params.push((key.as_str().to_owned(), value));
    }
    challenges
}

/// Parse the challenges of every `WWW-Authenticate` header in `headers`
#[must_use]
pub fn challenges_from_headers(headers: &HeaderMap) -> Vec<Challenge> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(parse_challenges)
        .collect()
}

/// Claims requested by a continuous access evaluation challenge, decoded.
///
/// A CAE challenge is a `Bearer` challenge with `error="insufficient_claims"`
/// and a `claims` parameter. Returns `Ok(None)` when there is none.
///
/// # Errors
/// [`AuthError::InvalidChallenge`] when the claims conflict, are empty or do
/// not decode to UTF-8 text.
pub fn cae_claims(challenges: &[Challenge]) -> Result<Option<String>, AuthError> {
    let mut found: Option<&str> = None;
    for challenge in challenges.iter().filter(|c| c.is_bearer()) {
        let insufficient = challenge
            .param("error")
            .is_some_and(|e| e.eq_ignore_ascii_case("insufficient_claims"));
        if !insufficient {
            continue;
        }
        for claims in challenge.params_named("claims") {
            match found {
                Some(previous) if previous != claims => {
                    return Err(AuthError::InvalidChallenge(
                        "multiple conflicting claims parameters".to_owned(),
                    ));
                }
                _ => found = Some(claims),
            }
        }
    }
    found.map(decode_claims).transpose()
}

/// Decode a base64 (standard or URL-safe, padding optional) claims blob
///
/// # Errors
/// [`AuthError::InvalidChallenge`] when the value is empty, not base64 or not UTF-8.
pub fn decode_claims(encoded: &str) -> Result<String, AuthError> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(AuthError::InvalidChallenge("empty claims".to_owned()));
    }
    let bytes = LENIENT_STANDARD
        .decode(encoded)
        .or_else(|_| LENIENT_URL_SAFE.decode(encoded))
        .map_err(|e| AuthError::InvalidChallenge(format!("claims are not base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| AuthError::InvalidChallenge("claims are not UTF-8".to_owned()))
}

fn unescape(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
