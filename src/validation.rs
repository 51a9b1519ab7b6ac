// ✅ Card Validator
// Six independent rules over normalized fields. Every rule runs, so a
// rejected card comes back with every reason at once.

use crate::clock::{Clock, SystemClock, YearMonth};
use crate::normalizer::{CandidateFields, CardField};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const MIN_CARD_DIGITS: usize = 12;
pub const MAX_CARD_DIGITS: usize = 19;

// ============================================================================
// RULES & VERDICT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    NumberFormat,
    Checksum,
    ExpiryFormat,
    ExpiryNotPast,
    HolderName,
    BankName,
}

impl Rule {
    pub fn name(&self) -> &'static str {
        match self {
            Rule::NumberFormat => "number_format",
            Rule::Checksum => "checksum",
            Rule::ExpiryFormat => "expiry_format",
            Rule::ExpiryNotPast => "expiry_not_past",
            Rule::HolderName => "holder_name",
            Rule::BankName => "bank_name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFailure {
    pub field: CardField,
    pub rule: Rule,
    pub reason: String,
}

impl fmt::Display for FieldFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_valid: bool,
    pub failures: Vec<FieldFailure>,
}

impl Verdict {
    fn from_failures(failures: Vec<FieldFailure>) -> Self {
        Verdict {
            is_valid: failures.is_empty(),
            failures,
        }
    }

    pub fn failed(&self, rule: Rule) -> bool {
        self.failures.iter().any(|f| f.rule == rule)
    }

    pub fn summary(&self) -> String {
        if self.is_valid {
            return "valid".to_string();
        }
        self.failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ============================================================================
// LUHN
// ============================================================================

/// Luhn checksum. Walks right-to-left, doubling every second digit (the check
/// digit itself is never doubled). Empty or non-digit input fails.
pub fn luhn_valid(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let mut total = 0u32;
    for (index, c) in number.chars().rev().enumerate() {
        let Some(digit) = c.to_digit(10) else {
            return false;
        };
        total += if index % 2 == 1 {
            let doubled = digit * 2;
            if doubled > 9 {
                doubled - 9
            } else {
                doubled
            }
        } else {
            digit
        };
    }

    total % 10 == 0
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct CardValidator {
    clock: Arc<dyn Clock>,
}

impl CardValidator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        CardValidator { clock }
    }

    pub fn validate(&self, fields: &CandidateFields) -> Verdict {
        let now = self.clock.current();
        let mut failures = Vec::new();

        // Rules 1 and 2: format and checksum are reported separately
        if let Some(failure) = check_number_format(&fields.card_number) {
            failures.push(failure);
        }
        if !luhn_valid(&fields.card_number) {
            failures.push(FieldFailure {
                field: CardField::CardNumber,
                rule: Rule::Checksum,
                reason: "Card number fails the Luhn checksum".to_string(),
            });
        }

        // Rules 3 and 4: an unparseable expiry is reported once, not twice
        match fields.expiration {
            None => failures.push(FieldFailure {
                field: CardField::Expiration,
                rule: Rule::ExpiryFormat,
                reason: "Expiration date is missing or unreadable".to_string(),
            }),
            Some(expiry) => {
                if YearMonth::new(expiry.year, expiry.month) < now {
                    failures.push(FieldFailure {
                        field: CardField::Expiration,
                        rule: Rule::ExpiryNotPast,
                        reason: format!(
                            "Card expired {} (current month {:02}/{:04})",
                            expiry, now.month, now.year
                        ),
                    });
                }
            }
        }

        // Rule 5
        if let Some(failure) = check_holder_name(&fields.holder_name) {
            failures.push(failure);
        }

        // Rule 6
        if fields.bank_name.trim().is_empty() {
            failures.push(FieldFailure {
                field: CardField::BankName,
                rule: Rule::BankName,
                reason: "Bank name is empty".to_string(),
            });
        }

        Verdict::from_failures(failures)
    }
}

impl Default for CardValidator {
    fn default() -> Self {
        CardValidator::new(Arc::new(SystemClock))
    }
}

fn check_number_format(number: &str) -> Option<FieldFailure> {
    let fail = |reason: String| FieldFailure {
        field: CardField::CardNumber,
        rule: Rule::NumberFormat,
        reason,
    };

    if number.is_empty() {
        return Some(fail("Card number is missing".to_string()));
    }
    if !number.chars().all(|c| c.is_ascii_digit()) {
        return Some(fail("Card number contains non-digit characters".to_string()));
    }
    if !(MIN_CARD_DIGITS..=MAX_CARD_DIGITS).contains(&number.len()) {
        return Some(fail(format!(
            "Card number has {} digits, expected {}-{}",
            number.len(),
            MIN_CARD_DIGITS,
            MAX_CARD_DIGITS
        )));
    }
    None
}

fn check_holder_name(name: &str) -> Option<FieldFailure> {
    let fail = |reason: &str| FieldFailure {
        field: CardField::HolderName,
        rule: Rule::HolderName,
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Some(fail("Holder name is empty"));
    }
    if !name.chars().all(|c| c.is_alphabetic() || c == ' ') {
        return Some(fail("Holder name may only contain letters and spaces"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::normalizer::Expiry;

    fn validator_at(year: i32, month: u32) -> CardValidator {
        CardValidator::new(Arc::new(FixedClock::at(year, month)))
    }

    fn good_fields() -> CandidateFields {
        CandidateFields {
            card_number: "4532015112830366".to_string(),
            expiration: Some(Expiry::new(12, 2031)),
            holder_name: "GABRIEL LIMA".to_string(),
            bank_name: "Bank X".to_string(),
        }
    }

    #[test]
    fn test_luhn_known_vectors() {
        assert!(luhn_valid("4532015112830366"));
        assert!(!luhn_valid("4532015112830367"));
        assert!(luhn_valid("4111111111111111"));
        assert!(luhn_valid("5555555555554444"));
        assert!(luhn_valid("378282246310005"));
        assert!(!luhn_valid(""));
        assert!(!luhn_valid("4532a15112830366"));
    }

    #[test]
    fn test_luhn_single_digit_mutation_fails() {
        let valid = "4532015112830366";
        for position in 0..valid.len() {
            let original = valid.as_bytes()[position] - b'0';
            let mutated_digit = (original + 1) % 10;
            let mut mutated = valid.to_string();
            mutated.replace_range(
                position..position + 1,
                &mutated_digit.to_string(),
            );
            assert!(
                !luhn_valid(&mutated),
                "mutating position {} should break the checksum",
                position
            );
        }
    }

    #[test]
    fn test_valid_card_passes() {
        let verdict = validator_at(2026, 10).validate(&good_fields());
        assert!(verdict.is_valid, "{}", verdict.summary());
        assert!(verdict.failures.is_empty());
    }

    #[test]
    fn test_checksum_failure_reported() {
        let mut fields = good_fields();
        fields.card_number = "4532015112830367".to_string();
        let verdict = validator_at(2026, 10).validate(&fields);
        assert!(!verdict.is_valid);
        assert!(verdict.failed(Rule::Checksum));
        assert!(!verdict.failed(Rule::NumberFormat));
    }

    #[test]
    fn test_expiry_boundary() {
        let validator = validator_at(2030, 1);

        let mut fields = good_fields();
        fields.expiration = Some(Expiry::new(12, 2029));
        assert!(validator.validate(&fields).failed(Rule::ExpiryNotPast));

        fields.expiration = Some(Expiry::new(1, 2030));
        assert!(validator.validate(&fields).is_valid);

        fields.expiration = Some(Expiry::new(2, 2030));
        assert!(validator.validate(&fields).is_valid);
    }

    #[test]
    fn test_missing_expiry_reported_once() {
        let mut fields = good_fields();
        fields.expiration = None;
        let verdict = validator_at(2026, 10).validate(&fields);
        assert!(verdict.failed(Rule::ExpiryFormat));
        assert!(!verdict.failed(Rule::ExpiryNotPast));
        assert_eq!(verdict.failures.len(), 1);
    }

    #[test]
    fn test_failures_accumulate_in_rule_order() {
        let verdict = validator_at(2026, 10).validate(&CandidateFields::default());
        let rules: Vec<Rule> = verdict.failures.iter().map(|f| f.rule).collect();
        assert_eq!(
            rules,
            vec![
                Rule::NumberFormat,
                Rule::Checksum,
                Rule::ExpiryFormat,
                Rule::HolderName,
                Rule::BankName,
            ]
        );
        assert!(!verdict.is_valid);
    }

    #[test]
    fn test_number_length_bounds() {
        let validator = validator_at(2026, 10);
        let mut fields = good_fields();

        // 11 digits, Luhn-valid
        fields.card_number = "00000000000".to_string();
        let verdict = validator.validate(&fields);
        assert!(verdict.failed(Rule::NumberFormat));
        assert!(!verdict.failed(Rule::Checksum));

        fields.card_number = "000000000000".to_string();
        assert!(validator.validate(&fields).is_valid);

        fields.card_number = "0".repeat(20);
        assert!(validator.validate(&fields).failed(Rule::NumberFormat));
    }

    #[test]
    fn test_holder_name_letters_only() {
        let validator = validator_at(2026, 10);
        let mut fields = good_fields();

        fields.holder_name = "G4BRIEL LIMA".to_string();
        assert!(validator.validate(&fields).failed(Rule::HolderName));

        fields.holder_name = "José Ñúñez".to_string();
        assert!(validator.validate(&fields).is_valid);
    }

    #[test]
    fn test_summary_lists_reasons() {
        let mut fields = good_fields();
        fields.bank_name = String::new();
        let verdict = validator_at(2026, 10).validate(&fields);
        assert_eq!(verdict.summary(), "bank_name: Bank name is empty");
    }
}
