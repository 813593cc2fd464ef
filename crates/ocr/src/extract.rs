use std::str::FromStr;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tally_core::{ExpenseCategory, Money};

use crate::types::StructuredFields;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// Amounts need exactly two fractional digits; the trailing group rejects a third.
re!(re_total_label, r"(?i)total[\s:$]*(\d+[.,]\d{2})(?:\D|$)");
re!(re_amount_label, r"(?i)amount[\s:$]*(\d+[.,]\d{2})(?:\D|$)");
re!(re_balance_label, r"(?i)balance[\s:$]*(\d+[.,]\d{2})(?:\D|$)");
re!(re_currency, r"\$\s*(\d+[.,]\d{2})(?:\D|$)");

re!(re_date_dmy, r"\b\d{1,2}[-/]\d{1,2}[-/]\d{2,4}\b");
re!(re_date_ymd, r"\b\d{4}[-/]\d{1,2}[-/]\d{1,2}\b");
re!(re_date_month_name,
    r"(?i)\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\s+\d{1,2}[,\s]+\d{4}\b");

/// A pattern and the parser applied to its first match.
type Rule<T> = (fn() -> &'static Regex, fn(&Captures<'_>) -> Option<T>);

const TOTAL_RULES: &[Rule<Money>] = &[
    (re_total_label, parse_amount),
    (re_amount_label, parse_amount),
    (re_balance_label, parse_amount),
    (re_currency, parse_amount),
];

const DATE_RULES: &[Rule<String>] = &[
    (re_date_dmy, whole_match),
    (re_date_ymd, whole_match),
    (re_date_month_name, whole_match),
];

/// Lines scanned from the top when looking for the merchant name.
const MERCHANT_SCAN_LINES: usize = 5;

fn parse_amount(c: &Captures<'_>) -> Option<Money> {
    let raw = c.get(1)?.as_str().replace(',', ".");
    Money::from_str(&raw).ok()
}

fn whole_match(c: &Captures<'_>) -> Option<String> {
    Some(c.get(0)?.as_str().to_string())
}

/// First rule whose pattern matches and whose parser accepts the match.
fn first_match<T>(text: &str, rules: &[Rule<T>]) -> Option<T> {
    rules
        .iter()
        .find_map(|(pattern, parse)| pattern().captures(text).and_then(|c| parse(&c)))
}

// ── Public extraction API ─────────────────────────────────────────────────────

pub struct Extractor;

impl Extractor {
    /// Extract structured fields from recognized receipt text. Never fails;
    /// fields without a matching rule stay `None`.
    pub fn extract(text: &str) -> StructuredFields {
        StructuredFields {
            merchant: Self::extract_merchant(text),
            total: Self::extract_total(text),
            date: Self::extract_date(text),
            category: ExpenseCategory::classify(text),
            location: None,
        }
    }

    pub fn extract_total(text: &str) -> Option<Money> {
        first_match(text, TOTAL_RULES)
    }

    /// The matched substring, case and separators untouched.
    pub fn extract_date(text: &str) -> Option<String> {
        first_match(text, DATE_RULES)
    }

    /// First short header line that is all caps or title case and has no digits.
    pub fn extract_merchant(text: &str) -> Option<String> {
        text.split('\n')
            .take(MERCHANT_SCAN_LINES)
            .map(str::trim)
            .find(|line| {
                line.chars().count() > 3
                    && !line.chars().any(char::is_numeric)
                    && (is_upper(line) || is_title(line))
            })
            .map(str::to_string)
    }
}

// ── Case helpers ──────────────────────────────────────────────────────────────

/// At least one cased character and no lower-case ones.
fn is_upper(s: &str) -> bool {
    let mut cased = false;
    for c in s.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            cased = true;
        }
    }
    cased
}

/// Every word starts upper-case and continues lower-case; uncased characters
/// separate words.
fn is_title(s: &str) -> bool {
    let mut cased = false;
    let mut previous_cased = false;
    for c in s.chars() {
        if c.is_uppercase() {
            if previous_cased {
                return false;
            }
            previous_cased = true;
            cased = true;
        } else if c.is_lowercase() {
            if !previous_cased {
                return false;
            }
            previous_cased = true;
            cased = true;
        } else {
            previous_cased = false;
        }
    }
    cased
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    #[test]
    fn extracts_acme_receipt() {
        let fields = Extractor::extract("ACME MARKET\nTOTAL: $12.50\n01/15/2024");
        assert_eq!(fields.merchant.as_deref(), Some("ACME MARKET"));
        assert_eq!(fields.total, Some(money("12.50")));
        assert_eq!(fields.total.unwrap().amount().to_string(), "12.50");
        assert_eq!(fields.date.as_deref(), Some("01/15/2024"));
        assert!(fields.location.is_none());
    }

    #[test]
    fn empty_text_extracts_nothing() {
        assert!(Extractor::extract("").is_empty());
    }

    // ── Total ────────────────────────────────────────────────────────────────

    #[test]
    fn total_label_wins_over_bare_currency() {
        let text = "Coffee $3.00\nTotal 9.75";
        assert_eq!(Extractor::extract_total(text), Some(money("9.75")));
    }

    #[test]
    fn total_rules_in_order() {
        assert_eq!(Extractor::extract_total("AMOUNT: 20.00"), Some(money("20.00")));
        assert_eq!(Extractor::extract_total("Balance $7.10"), Some(money("7.10")));
        assert_eq!(Extractor::extract_total("paid $ 4.25 cash"), Some(money("4.25")));
    }

    #[test]
    fn comma_separator_is_normalized() {
        assert_eq!(Extractor::extract_total("TOTAL 15,99"), Some(money("15.99")));
    }

    #[test]
    fn three_fractional_digits_rejected() {
        assert_eq!(Extractor::extract_total("TOTAL 1.234"), None);
        // The labeled amount is malformed, the bare one still counts.
        assert_eq!(Extractor::extract_total("TOTAL 1.234\n$8.00"), Some(money("8.00")));
    }

    #[test]
    fn amount_at_end_of_text() {
        assert_eq!(Extractor::extract_total("total:12.00"), Some(money("12.00")));
    }

    #[test]
    fn no_amount_is_none() {
        assert_eq!(Extractor::extract_total("THANK YOU"), None);
        assert_eq!(Extractor::extract_total("total 12"), None);
    }

    // ── Date ─────────────────────────────────────────────────────────────────

    #[test]
    fn dmy_before_ymd() {
        assert_eq!(
            Extractor::extract_date("2024-03-09 then 9/3/24").as_deref(),
            Some("9/3/24")
        );
    }

    #[test]
    fn ymd_not_misread_as_dmy() {
        assert_eq!(Extractor::extract_date("Date 2024-03-09").as_deref(), Some("2024-03-09"));
    }

    #[test]
    fn month_name_date_kept_verbatim() {
        assert_eq!(
            Extractor::extract_date("Issued January 5, 2024 at noon").as_deref(),
            Some("January 5, 2024")
        );
        assert_eq!(Extractor::extract_date("DEC 31 2023").as_deref(), Some("DEC 31 2023"));
    }

    #[test]
    fn no_date_is_none() {
        assert_eq!(Extractor::extract_date("no dates here 12"), None);
    }

    // ── Merchant ─────────────────────────────────────────────────────────────

    #[test]
    fn merchant_title_case() {
        let text = "  Blue Bottle Coffee  \n1 Latte 4.50";
        assert_eq!(Extractor::extract_merchant(text).as_deref(), Some("Blue Bottle Coffee"));
    }

    #[test]
    fn merchant_skips_short_and_numeric_lines() {
        let text = "ABC\nSTORE 42\nwelcome friends\nCORNER SHOP\nTOTAL 3.00";
        assert_eq!(Extractor::extract_merchant(text).as_deref(), Some("CORNER SHOP"));
    }

    #[test]
    fn merchant_only_scans_first_five_lines() {
        let text = "1\n2\n3\n4\n5\nLATE HEADER";
        assert_eq!(Extractor::extract_merchant(text), None);
    }

    #[test]
    fn merchant_handles_unicode_case() {
        assert_eq!(Extractor::extract_merchant("CAFÉ ÉTOILE").as_deref(), Some("CAFÉ ÉTOILE"));
        assert_eq!(Extractor::extract_merchant("Über Bäckerei").as_deref(), Some("Über Bäckerei"));
    }

    #[test]
    fn case_helpers() {
        assert!(is_upper("ACME & SONS"));
        assert!(!is_upper("& -"));
        assert!(is_title("Joe Pizza"));
        assert!(!is_title("McDonald Place"));
        assert!(!is_title("joe pizza"));
    }

    // ── Category ─────────────────────────────────────────────────────────────

    #[test]
    fn category_from_keywords() {
        let fields = Extractor::extract("GRAND HOTEL\nRoom 101\nTOTAL 120.00");
        assert_eq!(fields.category, Some(ExpenseCategory::Accommodation));
        assert_eq!(Extractor::extract("CITY TAXI CO").category, Some(ExpenseCategory::Transportation));
        assert_eq!(Extractor::extract("HARDWARE").category, None);
    }
}
