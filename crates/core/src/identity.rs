//! Candidate identity normalization and reference-row selection
//!
//! Both steps run before anything is written: normalization decides whether
//! a candidate is worth a reference lookup at all, and selection reduces the
//! denormalized lookup result to one individual and one household key.

use std::sync::OnceLock;

use beacon_schemas::{MatchType, ReferenceRow};
use regex::Regex;

/// Why a candidate was rejected before lookup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateError {
    #[error("candidate is empty")]
    Empty,

    #[error("candidate too short ({0} chars)")]
    TooShort(usize),

    #[error("candidate has no separator")]
    MissingSeparator,

    #[error("candidate is not a valid {0}")]
    Malformed(MatchType),
}

const MIN_EMAIL_LEN: usize = 6;
const MIN_PHONE_DIGITS: usize = 10;
const MAX_PHONE_DIGITS: usize = 15;

fn email_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| {
        let label = r"[a-z0-9](?:[a-z0-9-]*[a-z0-9])?";
        Regex::new(&format!(r"^[^@\s]+@{label}(?:\.{label})+$"))
            .unwrap_or_else(|e| panic!("email pattern does not compile: {e}"))
    })
}

/// Normalize a candidate key of the given type
pub fn normalize_candidate(match_type: MatchType, raw: &str) -> Result<String, CandidateError> {
    match match_type {
        MatchType::Email => normalize_email(raw),
        MatchType::Phone => normalize_phone(raw),
    }
}

/// Canonical form of an email address
///
/// Lowercases, strips `+tag` sub-addressing for every domain, and applies the
/// provider rules for Gmail (dot-insensitive local part, `googlemail.com`
/// alias) and Yahoo (`-tag` sub-addressing).
pub fn normalize_email(raw: &str) -> Result<String, CandidateError> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(CandidateError::Empty);
    }
    let len = email.chars().count();
    if len < MIN_EMAIL_LEN {
        return Err(CandidateError::TooShort(len));
    }
    let Some((local, domain)) = email.rsplit_once('@') else {
        return Err(CandidateError::MissingSeparator);
    };
    // An unescaped `+` in a form-encoded payload arrives as a space
    let local = local.split_whitespace().collect::<Vec<_>>().join("+");
    let shaped = email_shape().is_match(&format!("{local}@{domain}"));
    if local.is_empty() || local.contains('@') || !shaped {
        return Err(CandidateError::Malformed(MatchType::Email));
    }

    let mut local = local.split('+').next().unwrap_or_default().to_string();
    let mut domain = domain.to_string();

    match domain.as_str() {
        "gmail.com" | "googlemail.com" => {
            local.retain(|c| c != '.');
            domain = "gmail.com".to_string();
        }
        "yahoo.com" | "ymail.com" | "rocketmail.com" => {
            if let Some((base, _tag)) = local.split_once('-') {
                local = base.to_string();
            }
        }
        _ => {}
    }

    if local.is_empty() {
        return Err(CandidateError::Malformed(MatchType::Email));
    }
    Ok(format!("{local}@{domain}"))
}

/// Canonical form of a phone number: digits only, with country code
///
/// A leading `00` international prefix is dropped and 10-digit numbers are
/// assumed to be NANP (`1` prepended).
pub fn normalize_phone(raw: &str) -> Result<String, CandidateError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CandidateError::Empty);
    }

    let mut digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if let Some(rest) = digits.strip_prefix("00") {
        digits = rest.to_string();
    }
    if digits.len() < MIN_PHONE_DIGITS {
        return Err(CandidateError::TooShort(digits.len()));
    }
    if digits.len() > MAX_PHONE_DIGITS {
        return Err(CandidateError::Malformed(MatchType::Phone));
    }
    if digits.len() == MIN_PHONE_DIGITS {
        digits.insert(0, '1');
    }
    Ok(digits)
}

/// Keys chosen from a reference lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub individual_key: Option<String>,
    pub group_key: Option<String>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.individual_key.is_none() && self.group_key.is_none()
    }
}

/// Pick one individual key and one household key from lookup rows
///
/// Unreliable rows are discarded. Individual and household keys are chosen
/// independently: each is taken from the reliable row with the highest
/// recency ordinal that carries that key. Equal ordinals fall back to the
/// lexicographically smallest key so the choice never depends on row order.
pub fn select_resolution(rows: &[ReferenceRow]) -> Resolution {
    let reliable = || rows.iter().filter(|row| row.reliability_flags.is_reliable());

    let pick = |key: fn(&ReferenceRow) -> Option<&String>| {
        reliable()
            .filter_map(|row| {
                key(row)
                    .filter(|k| !k.is_empty())
                    .map(|k| (row.recency_ordinal, k))
            })
            .max_by(|(ord_a, key_a), (ord_b, key_b)| ord_a.cmp(ord_b).then(key_b.cmp(key_a)))
            .map(|(_, k)| k.clone())
    };

    Resolution {
        individual_key: pick(|row| row.individual_key.as_ref()),
        group_key: pick(|row| row.group_key.as_ref()),
    }
}
