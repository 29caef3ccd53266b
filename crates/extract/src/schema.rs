use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tallyslip_core::{Category, Receipt, UnvalidatedReceipt};

use crate::extractor::ExtractError;

/// JSON Schema of the object the model must return.
pub fn receipt_schema() -> Value {
    let categories: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "merchant": {
                "type": "string",
                "description": "Name of the store or business as printed on the receipt"
            },
            "transaction_date": {
                "type": "string",
                "format": "date",
                "description": "Date of purchase in YYYY-MM-DD format"
            },
            "total": {
                "type": "number",
                "description": "Final amount paid, including tax and tip"
            },
            "category": {
                "type": "string",
                "enum": categories,
                "description": "Spending category that best fits the purchase"
            },
            "lineItems": {
                "type": "array",
                "description": "Purchased items in the order they appear on the receipt",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "quantity": { "type": "number", "default": 1 },
                        "price": {
                            "type": "number",
                            "description": "Total price for this line (quantity times unit price)"
                        }
                    },
                    "required": ["description", "price"]
                }
            }
        },
        "required": ["merchant", "transaction_date", "total", "category", "lineItems"]
    })
}

/// Text inserted at `{format_instructions}`. Built once and reused.
pub fn format_instructions() -> &'static str {
    static TEXT: OnceLock<String> = OnceLock::new();
    TEXT.get_or_init(|| {
        format!(
            "The output should be formatted as a JSON instance that conforms to the JSON schema below.\n\
             Return only the JSON object, with no commentary. Amounts are plain numbers without \
             currency symbols.\n\n\
             Here is the output schema:\n```json\n{:#}\n```",
            receipt_schema()
        )
    })
}

fn re_think() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("invalid regex"))
}

/// Pull the receipt out of a raw model reply.
///
/// Reasoning blocks, code fences and prose around the object are tolerated:
/// the first `{` that starts a complete JSON object wins, and anything after
/// that object is ignored. Text without a parseable object is
/// `MalformedResponse`; an object that does not describe a valid receipt is
/// `SchemaValidation`.
pub fn parse_response(text: &str) -> Result<Receipt, ExtractError> {
    let cleaned = re_think().replace_all(text, "");
    let value = first_object(&cleaned).map_err(|reason| {
        ExtractError::MalformedResponse(format!("{reason}: {}", snippet(text)))
    })?;

    let raw: UnvalidatedReceipt =
        serde_json::from_value(value).map_err(|e| ExtractError::SchemaValidation(e.to_string()))?;
    Receipt::validate(raw).map_err(|e| ExtractError::SchemaValidation(e.to_string()))
}

/// Decode one value at each `{` in turn; the stream deserializer stops at the
/// end of that value, so trailing text never reaches the parser.
fn first_object(text: &str) -> Result<Value, String> {
    let mut first_error = None;
    for (start, _) in text.match_indices('{') {
        match serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>().next() {
            Some(Ok(value @ Value::Object(_))) => return Ok(value),
            Some(Err(e)) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
            _ => {}
        }
    }
    Err(first_error.unwrap_or_else(|| "no JSON object in model output".to_string()))
}

fn snippet(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((i, _)) => format!("{}…", &text[..i]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tallyslip_core::Money;

    const GOOD: &str = r#"{
        "merchant": "Walmart",
        "transaction_date": "2024-03-02",
        "total": 23.47,
        "category": "Groceries",
        "lineItems": [
            { "description": "Milk", "quantity": 2, "price": 7.98 },
            { "description": "Bread", "price": 3.49 },
            { "description": "Eggs", "quantity": 1, "price": 12.00 }
        ]
    }"#;

    #[test]
    fn parses_plain_json() {
        let r = parse_response(GOOD).unwrap();
        assert_eq!(r.merchant(), "Walmart");
        assert_eq!(r.transaction_date(), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(r.total(), Money::from_cents(2347));
        assert_eq!(r.category(), Category::Groceries);
    }

    #[test]
    fn line_items_keep_receipt_order_and_default_quantity() {
        let r = parse_response(GOOD).unwrap();
        let names: Vec<&str> = r.line_items().iter().map(|l| l.description.as_str()).collect();
        assert_eq!(names, ["Milk", "Bread", "Eggs"]);
        assert_eq!(r.line_items()[1].quantity, 1.0);
        assert_eq!(r.line_items()[0].quantity, 2.0);
    }

    #[test]
    fn fenced_json_with_reasoning_is_accepted() {
        let text = format!("<think>the total is {{maybe}} 23.47</think>\nSure:\n```json\n{GOOD}\n```\n");
        assert_eq!(parse_response(&text).unwrap().merchant(), "Walmart");
    }

    #[test]
    fn prose_only_is_malformed() {
        let err = parse_response("I could not read this receipt.").unwrap_err();
        assert!(matches!(err, ExtractError::MalformedResponse(_)));
    }

    #[test]
    fn truncated_json_is_malformed() {
        let err = parse_response(r#"{"merchant": "A", "total": } oops"#).unwrap_err();
        assert!(matches!(err, ExtractError::MalformedResponse(_)));
    }

    #[test]
    fn braces_in_trailing_prose_are_ignored() {
        let text = format!("{GOOD}\nNote: I filled {{category}} from the store name.");
        assert_eq!(parse_response(&text).unwrap().merchant(), "Walmart");
    }

    #[test]
    fn braces_in_leading_prose_are_skipped() {
        let text = format!("Result for {{receipt}}:\n{GOOD}");
        let r = parse_response(&text).unwrap();
        assert_eq!(r.category(), Category::Groceries);
        assert_eq!(r.line_items().len(), 3);
    }

    #[test]
    fn unknown_category_fails_validation() {
        let text = GOOD.replace("Groceries", "Entertainment");
        let err = parse_response(&text).unwrap_err();
        assert!(matches!(err, ExtractError::SchemaValidation(_)));
    }

    #[test]
    fn missing_date_fails_validation() {
        let text = GOOD.replace(r#""transaction_date": "2024-03-02","#, "");
        assert!(matches!(parse_response(&text), Err(ExtractError::SchemaValidation(_))));
    }

    #[test]
    fn string_amount_fails_validation() {
        let text = GOOD.replace("23.47", "\"$23.47\"");
        assert!(matches!(parse_response(&text), Err(ExtractError::SchemaValidation(_))));
    }

    #[test]
    fn blank_merchant_fails_validation() {
        let text = GOOD.replace("Walmart", " ");
        assert!(matches!(parse_response(&text), Err(ExtractError::SchemaValidation(_))));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let text = GOOD.replacen('{', r#"{ "currency": "USD", "tax": 1.2,"#, 1);
        assert!(parse_response(&text).is_ok());
    }

    #[test]
    fn instructions_embed_schema_and_categories() {
        let text = format_instructions();
        assert!(text.contains("\"lineItems\""));
        assert!(text.contains("Food & Drink"));
        assert!(std::ptr::eq(text, format_instructions()));

        let schema = receipt_schema();
        assert_eq!(schema["properties"]["category"]["enum"].as_array().unwrap().len(), Category::ALL.len());
    }

    #[test]
    fn long_garbage_is_truncated_in_error() {
        let text = "x".repeat(500);
        match parse_response(&text).unwrap_err() {
            ExtractError::MalformedResponse(msg) => assert!(msg.len() < 200),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
