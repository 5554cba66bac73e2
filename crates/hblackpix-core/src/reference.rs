//! Payment `external_reference` parsing.
//!
//! Mercado Pago echoes back the reference attached when a PIX charge was
//! created. Three shapes are in circulation:
//!
//! - `plan_<user uuid>_<plan id>` for subscription purchases
//! - `invoice_<invoice uuid>` for invoice payments
//! - a bare invoice uuid, from before the prefix was introduced

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use uuid::Uuid;

static PLAN_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^plan_([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})_(\S+)$",
    )
    .unwrap()
});

/// What a payment reference points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedReference {
    PlanPurchase { user_id: Uuid, plan_id: String },
    InvoicePayment { invoice_id: Uuid },
    Unknown { raw: String },
}

impl ParsedReference {
    pub fn parse(reference: &str) -> Self {
        let trimmed = reference.trim();

        if let Some(captures) = PLAN_REFERENCE.captures(trimmed) {
            if let Ok(user_id) = Uuid::parse_str(&captures[1]) {
                return ParsedReference::PlanPurchase {
                    user_id,
                    plan_id: captures[2].to_string(),
                };
            }
        }

        let invoice = trimmed.strip_prefix("invoice_").unwrap_or(trimmed);
        // Uuid::parse_str also accepts braced and urn forms; only the hyphenated one is valid here
        if invoice.len() == 36 {
            if let Ok(invoice_id) = Uuid::parse_str(invoice) {
                return ParsedReference::InvoicePayment { invoice_id };
            }
        }

        ParsedReference::Unknown {
            raw: reference.to_string(),
        }
    }

    /// Canonical reference string for this target.
    pub fn to_reference(&self) -> String {
        match self {
            ParsedReference::PlanPurchase { user_id, plan_id } => {
                format!("plan_{}_{}", user_id, plan_id)
            }
            ParsedReference::InvoicePayment { invoice_id } => format!("invoice_{}", invoice_id),
            ParsedReference::Unknown { raw } => raw.clone(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ParsedReference::Unknown { .. })
    }
}

impl fmt::Display for ParsedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b";

    #[test]
    fn test_plan_purchase() {
        let parsed = ParsedReference::parse(&format!("plan_{}_pro_monthly", USER));
        assert_eq!(
            parsed,
            ParsedReference::PlanPurchase {
                user_id: Uuid::parse_str(USER).unwrap(),
                plan_id: "pro_monthly".to_string(),
            }
        );
    }

    #[test]
    fn test_invoice_with_and_without_prefix() {
        let expected = ParsedReference::InvoicePayment {
            invoice_id: Uuid::parse_str(USER).unwrap(),
        };
        assert_eq!(ParsedReference::parse(&format!("invoice_{}", USER)), expected);
        assert_eq!(ParsedReference::parse(USER), expected);
        assert_eq!(expected.to_reference(), format!("invoice_{}", USER));
    }

    #[test]
    fn test_unknown_keeps_raw() {
        for raw in ["", "plan_not-a-uuid_basic", "invoice_123", "order-42"] {
            let parsed = ParsedReference::parse(raw);
            assert_eq!(parsed, ParsedReference::Unknown { raw: raw.to_string() });
            assert!(!parsed.is_known());
        }
        assert!(!ParsedReference::parse(&format!("plan_{}_", USER)).is_known());
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(ParsedReference::parse(USER)).unwrap();
        assert_eq!(json["kind"], "invoice_payment");
        assert_eq!(json["invoice_id"], USER);
    }
}
