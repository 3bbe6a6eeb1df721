//! Loose dose and frequency text as reported by the oracle.

use insight_core::ParseRecoverable;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedDose {
    pub amount: Option<f64>,
    pub unit: Option<String>,
}

/// Frequency text after the abbreviation lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Frequency {
    /// Known abbreviation; `text` keeps what the oracle wrote.
    Timed { code: &'static str, text: String },
    FreeText(String),
}

/// Reads the leading amount token; thousands separators are ignored.
pub fn parse_amount(token: &str) -> Result<f64, ParseRecoverable> {
    let cleaned = token.replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseRecoverable {
            token: token.to_string(),
        }),
    }
}

/// `"1,000 mg"` -> 1000.0 / `mg`. An unreadable amount is logged and left unset.
pub fn parse_dose(text: &str) -> ParsedDose {
    let text = text.trim();
    let (amount_token, rest) = match text.split_once(' ') {
        Some((head, tail)) => (head, Some(tail)),
        None => (text, None),
    };

    let amount = match parse_amount(amount_token) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(dose = %text, "{err}");
            None
        }
    };

    let unit = rest
        .and_then(|tail| tail.split_whitespace().next())
        .filter(|token| parse_amount(token).is_err())
        .map(str::to_string);

    ParsedDose { amount, unit }
}

pub fn parse_frequency(text: &str) -> Frequency {
    match text {
        "Q AM" | "Q AM." | "AM" => Frequency::Timed {
            code: "AM",
            text: text.to_string(),
        },
        "Q PM" | "Q PM." | "PM" => Frequency::Timed {
            code: "PM",
            text: text.to_string(),
        },
        other => Frequency::FreeText(other.to_string()),
    }
}
