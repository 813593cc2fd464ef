use serde::{Deserialize, Serialize};
use std::fmt;

/// Expense categories a receipt can be filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpenseCategory {
    Meals,
    Accommodation,
    Transportation,
    #[serde(rename = "Office Supplies")]
    OfficeSupplies,
}

/// Keyword groups in match priority order. Keywords are lower-case and are
/// matched as plain substrings of the lower-cased receipt text.
pub const KEYWORD_GROUPS: &[(ExpenseCategory, &[&str])] = &[
    (
        ExpenseCategory::Meals,
        &["restaurant", "cafe", "diner", "food", "kitchen"],
    ),
    (
        ExpenseCategory::Accommodation,
        &["hotel", "inn", "lodge", "marriott", "hilton"],
    ),
    (
        ExpenseCategory::Transportation,
        &["uber", "lyft", "taxi", "cab", "transport"],
    ),
    (
        ExpenseCategory::OfficeSupplies,
        &["office", "staples", "depot", "supplies"],
    ),
];

impl ExpenseCategory {
    /// First keyword group with a member contained in `text` wins.
    pub fn classify(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        KEYWORD_GROUPS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(category, _)| *category)
    }
}

impl fmt::Display for ExpenseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpenseCategory::Meals => write!(f, "Meals"),
            ExpenseCategory::Accommodation => write!(f, "Accommodation"),
            ExpenseCategory::Transportation => write!(f, "Transportation"),
            ExpenseCategory::OfficeSupplies => write!(f, "Office Supplies"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(
            ExpenseCategory::classify("JOE'S DINER\nTOTAL 12.00"),
            Some(ExpenseCategory::Meals)
        );
        assert_eq!(
            ExpenseCategory::classify("Hilton Garden"),
            Some(ExpenseCategory::Accommodation)
        );
    }

    #[test]
    fn earlier_group_wins() {
        // "food" (Meals) and "uber" (Transportation) both present.
        assert_eq!(
            ExpenseCategory::classify("UBER EATS food delivery"),
            Some(ExpenseCategory::Meals)
        );
    }

    #[test]
    fn no_keyword_is_none() {
        assert_eq!(ExpenseCategory::classify("HARDWARE STORE\nNAILS 3.00"), None);
        assert_eq!(ExpenseCategory::classify(""), None);
    }

    #[test]
    fn display_and_serde_names_agree() {
        for (category, _) in KEYWORD_GROUPS {
            let json = serde_json::to_string(category).unwrap();
            assert_eq!(json, format!("\"{category}\""));
        }
    }

    #[test]
    fn every_group_is_lower_case_and_non_empty() {
        for (_, keywords) in KEYWORD_GROUPS {
            assert!(!keywords.is_empty());
            assert!(keywords.iter().all(|k| *k == k.to_lowercase()));
        }
    }
}
