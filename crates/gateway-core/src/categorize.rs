//! Transaction normalisation and categorisation (spec §4.7 "Normalisation
//! and categorisation"). Pure functions: categorisation depends only on
//! merchant text, normalisation is idempotent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Groceries,
    Transport,
    EatingOut,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Groceries => "groceries",
            Category::Transport => "transport",
            Category::EatingOut => "eating_out",
            Category::Other => "other",
        }
    }
}

const GROCERIES: &[&str] = &["tesco", "aldi", "lidl", "asda", "market", "grocery"];
const TRANSPORT: &[&str] = &["uber", "bolt", "tfl", "transport", "train", "bus"];
const EATING_OUT: &[&str] = &["coffee", "cafe", "restaurant", "pizza", "bar"];

/// Case-insensitive substring match against the static keyword table.
pub fn categorize(merchant: &str) -> Category {
    let lower = merchant.to_lowercase();
    if GROCERIES.iter().any(|kw| lower.contains(kw)) {
        Category::Groceries
    } else if TRANSPORT.iter().any(|kw| lower.contains(kw)) {
        Category::Transport
    } else if EATING_OUT.iter().any(|kw| lower.contains(kw)) {
        Category::EatingOut
    } else {
        Category::Other
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalisedTransaction {
    pub id: String,
    pub date: String,
    #[serde(rename = "valueDate", skip_serializing_if = "Option::is_none")]
    pub value_date: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub merchant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub category: Category,
    pub raw: Value,
}

/// Applies the debit/credit sign rule to a raw amount magnitude.
///
/// - `DBIT` forces a negative magnitude.
/// - `CRDT` forces a positive magnitude.
/// - Anything else preserves the sign already present on `amount`.
pub fn apply_sign_rule(amount: f64, credit_debit_indicator: Option<&str>) -> f64 {
    match credit_debit_indicator {
        Some(ind) if ind.eq_ignore_ascii_case("DBIT") => -amount.abs(),
        Some(ind) if ind.eq_ignore_ascii_case("CRDT") => amount.abs(),
        _ => amount,
    }
}

/// Normalises a raw upstream transaction record into the tool-facing shape.
/// Idempotent: calling this on an already-normalised value's `raw` payload
/// yields the same result, since the sign rule and categorisation are pure
/// functions of fields that survive the round trip.
pub fn normalise(raw: Value) -> NormalisedTransaction {
    let id = raw
        .get("id")
        .or_else(|| raw.get("entry_reference"))
        .or_else(|| raw.get("transactionId"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let date = raw
        .get("date")
        .or_else(|| raw.get("booking_date"))
        .or_else(|| raw.get("bookingDate"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let value_date = raw
        .get("valueDate")
        .or_else(|| raw.get("value_date"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let raw_amount = raw
        .get("amount")
        .or_else(|| raw.get("transactionAmount"))
        .and_then(|v| v.get("amount").or(Some(v)))
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0.0);
    let currency = raw
        .get("amount")
        .or_else(|| raw.get("transactionAmount"))
        .and_then(|v| v.get("currency"))
        .or_else(|| raw.get("currency"))
        .and_then(|v| v.as_str())
        .unwrap_or("EUR")
        .to_string();
    let indicator = raw
        .get("credit_debit_indicator")
        .or_else(|| raw.get("creditDebitIndicator"))
        .and_then(|v| v.as_str());
    let amount = apply_sign_rule(raw_amount, indicator);
    let merchant = raw
        .get("merchant")
        .or_else(|| raw.get("creditorName"))
        .or_else(|| raw.get("creditor").and_then(|c| c.get("name")))
        .or_else(|| raw.get("debtor").and_then(|d| d.get("name")))
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown")
        .to_string();
    let description = raw
        .get("description")
        .or_else(|| raw.get("remittance_information"))
        .or_else(|| raw.get("remittanceInformationUnstructured"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let reference = raw
        .get("reference")
        .or_else(|| raw.get("entry_reference"))
        .or_else(|| raw.get("endToEndId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let category = categorize(&merchant);

    NormalisedTransaction {
        id,
        date,
        value_date,
        amount,
        currency,
        merchant,
        description,
        reference,
        category,
        raw,
    }
}
