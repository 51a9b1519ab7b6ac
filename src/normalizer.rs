// 🧹 Field Normalizer
// Turns whatever the extractor returned into canonical card fields.
// Never fails: missing or garbled input becomes an empty value and the
// validator decides what that means.

use crate::clock::{Clock, SystemClock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

// ============================================================================
// CARD FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardField {
    CardNumber,
    Expiration,
    HolderName,
    BankName,
}

impl CardField {
    /// Column name in the `cards` table
    pub fn name(&self) -> &'static str {
        match self {
            CardField::CardNumber => "card_number",
            CardField::Expiration => "expiration",
            CardField::HolderName => "holder_name",
            CardField::BankName => "bank_name",
        }
    }

    /// Map an extractor field name onto a card field.
    /// Case, `_`, `-` and spaces are ignored ("CardHolderName" == "card_holder_name").
    pub fn from_key(key: &str) -> Option<CardField> {
        let folded: String = key
            .chars()
            .filter(|c| !matches!(*c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match folded.as_str() {
            "cardnumber" | "number" => Some(CardField::CardNumber),
            "expiration" | "expirationdate" | "expirydate" | "expiry" | "validthru" => {
                Some(CardField::Expiration)
            }
            "holdername" | "cardholdername" | "cardholder" | "cardname" | "name" => {
                Some(CardField::HolderName)
            }
            "bankname" | "issuingbank" | "issuer" | "bank" => Some(CardField::BankName),
            _ => None,
        }
    }
}

impl fmt::Display for CardField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// RAW EXTRACTION
// ============================================================================

/// Field name -> candidate strings, exactly as the extractor produced them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawExtraction {
    fields: BTreeMap<String, Vec<String>>,
}

impl RawExtraction {
    pub fn new() -> Self {
        RawExtraction::default()
    }

    /// Builder pattern: add one candidate
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.fields
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(|values| values.is_empty())
    }

    /// All candidates for a card field, across every alias, in key order
    pub fn candidates(&self, field: CardField) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(move |(key, _)| CardField::from_key(key) == Some(field))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
    }

    /// First candidate that is not blank
    pub fn first(&self, field: CardField) -> Option<&str> {
        self.candidates(field).find(|value| !value.trim().is_empty())
    }

    /// Lenient JSON reader: an object whose values are strings, numbers or
    /// arrays of those. Anything else is skipped. Returns None for non-objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut raw = RawExtraction::new();

        for (key, value) in object {
            match value {
                serde_json::Value::Array(items) => {
                    for item in items {
                        if let Some(text) = json_scalar(item) {
                            raw.push(key, &text);
                        }
                    }
                }
                other => {
                    if let Some(text) = json_scalar(other) {
                        raw.push(key, &text);
                    }
                }
            }
        }

        Some(raw)
    }
}

fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// EXPIRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Expiry {
    pub year: i32,
    pub month: u32,
}

impl Expiry {
    pub fn new(month: u32, year: i32) -> Self {
        Expiry { year, month }
    }

    /// Parse the stored `MM/YYYY` form
    pub fn from_canonical(text: &str) -> Option<Expiry> {
        let (month, year) = text.split_once('/')?;
        if year.len() != 4 {
            return None;
        }
        let month: u32 = month.parse().ok()?;
        let year: i32 = year.parse().ok()?;
        (1..=12).contains(&month).then_some(Expiry { year, month })
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

static COMPACT_EXPIRY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{2})(\d{4}|\d{2})$").ok());

// Digits on either side end the match, letters do not ("THRU08/31")
static SEPARATED_EXPIRY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:^|\D)(\d{1,2})\s*[/\-.]\s*(\d{4}|\d{2})(?:\D|$)").ok()
});

/// Parse "MM/YY", "MM/YYYY", "MMYY", "MMYYYY" (also `-` or `.` separated,
/// one-digit months allowed when separated). Two-digit years land in the
/// century starting at `century_base`.
pub fn parse_expiry(text: &str, century_base: i32) -> Option<Expiry> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let compact = COMPACT_EXPIRY.as_ref()?;
    let separated = SEPARATED_EXPIRY.as_ref()?;

    let caps = compact
        .captures(text)
        .or_else(|| separated.captures(text))?;

    let month: u32 = caps.get(1)?.as_str().parse().ok()?;
    let year_text = caps.get(2)?.as_str();
    let year: i32 = year_text.parse().ok()?;
    let year = if year_text.len() == 2 {
        century_base + year
    } else {
        year
    };

    if !(1..=12).contains(&month) {
        return None;
    }

    Some(Expiry { year, month })
}

// ============================================================================
// NAME POLICY
// ============================================================================

/// How holder names are cleaned up. Bank names only get whitespace cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamePolicy {
    /// Drop punctuation (`J. O'NEIL` -> `J ONEIL`); hyphens become spaces
    pub strip_punctuation: bool,
    pub uppercase: bool,
}

impl Default for NamePolicy {
    fn default() -> Self {
        NamePolicy {
            strip_punctuation: true,
            uppercase: false,
        }
    }
}

pub fn normalize_card_number(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_holder_name(text: &str, policy: &NamePolicy) -> String {
    let cleaned: String = if policy.strip_punctuation {
        text.chars()
            .filter_map(|c| match c {
                '-' => Some(' '),
                c if c.is_ascii_punctuation() => None,
                '\u{2018}' | '\u{2019}' | '\u{00B4}' => None,
                c => Some(c),
            })
            .collect()
    } else {
        text.to_string()
    };

    let collapsed = normalize_whitespace(&cleaned);
    if policy.uppercase {
        collapsed.to_uppercase()
    } else {
        collapsed
    }
}

/// Last four digits only, for logs and messages
pub fn mask_card_number(number: &str) -> String {
    let digits: Vec<char> = number.chars().collect();
    let tail: String = digits[digits.len().saturating_sub(4)..].iter().collect();
    format!("****{}", tail)
}

// ============================================================================
// CANDIDATE FIELDS
// ============================================================================

/// Normalizer output, validator input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateFields {
    pub card_number: String,
    pub expiration: Option<Expiry>,
    pub holder_name: String,
    pub bank_name: String,
}

impl From<&CandidateFields> for RawExtraction {
    fn from(fields: &CandidateFields) -> Self {
        let mut raw = RawExtraction::new();
        raw.push(CardField::CardNumber.name(), &fields.card_number);
        if let Some(expiry) = fields.expiration {
            raw.push(CardField::Expiration.name(), &expiry.to_string());
        }
        raw.push(CardField::HolderName.name(), &fields.holder_name);
        raw.push(CardField::BankName.name(), &fields.bank_name);
        raw
    }
}

// ============================================================================
// NORMALIZER
// ============================================================================

pub struct FieldNormalizer {
    policy: NamePolicy,
    clock: Arc<dyn Clock>,
}

impl FieldNormalizer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        FieldNormalizer {
            policy: NamePolicy::default(),
            clock,
        }
    }

    pub fn with_policy(mut self, policy: NamePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &NamePolicy {
        &self.policy
    }

    pub fn normalize(&self, raw: &RawExtraction) -> CandidateFields {
        let century_base = self.clock.current().century_base();

        CandidateFields {
            card_number: raw
                .first(CardField::CardNumber)
                .map(normalize_card_number)
                .unwrap_or_default(),
            expiration: raw
                .first(CardField::Expiration)
                .and_then(|text| parse_expiry(text, century_base)),
            holder_name: raw
                .first(CardField::HolderName)
                .map(|text| normalize_holder_name(text, &self.policy))
                .unwrap_or_default(),
            bank_name: raw
                .first(CardField::BankName)
                .map(normalize_whitespace)
                .unwrap_or_default(),
        }
    }
}

impl Default for FieldNormalizer {
    fn default() -> Self {
        FieldNormalizer::new(Arc::new(SystemClock))
    }
}
