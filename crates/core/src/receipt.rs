use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Food & Drink")]
    FoodAndDrink,
    Groceries,
    Travel,
    Shopping,
    Utilities,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::FoodAndDrink,
        Category::Groceries,
        Category::Travel,
        Category::Shopping,
        Category::Utilities,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::FoodAndDrink => "Food & Drink",
            Category::Groceries => "Groceries",
            Category::Travel => "Travel",
            Category::Shopping => "Shopping",
            Category::Utilities => "Utilities",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown category: '{s}'"))
    }
}

fn default_quantity() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    /// Line total (quantity × unit price). Negative for discounts and refunds.
    pub price: Money,
}

#[derive(Debug, Error, PartialEq)]
pub enum ReceiptError {
    #[error("merchant must not be blank")]
    BlankMerchant,
    #[error("line item {index} has non-positive quantity {quantity}")]
    InvalidQuantity { index: usize, quantity: f64 },
}

/// A receipt exactly as the model described it, before any invariant checks.
#[derive(Debug, Clone, Deserialize)]
pub struct UnvalidatedReceipt {
    pub merchant: String,
    #[serde(alias = "date", alias = "date_time")]
    pub transaction_date: NaiveDate,
    pub total: Money,
    pub category: Category,
    #[serde(rename = "lineItems", alias = "line_items")]
    pub line_items: Vec<LineItem>,
}

/// A receipt whose fields all passed validation. There is no way to mutate one
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    merchant: String,
    transaction_date: NaiveDate,
    total: Money,
    category: Category,
    #[serde(rename = "lineItems")]
    line_items: Vec<LineItem>,
}

impl Receipt {
    pub fn validate(raw: UnvalidatedReceipt) -> Result<Receipt, ReceiptError> {
        let merchant = raw.merchant.trim();
        if merchant.is_empty() {
            return Err(ReceiptError::BlankMerchant);
        }

        if let Some((index, item)) = raw
            .line_items
            .iter()
            .enumerate()
            .find(|(_, item)| !(item.quantity.is_finite() && item.quantity > 0.0))
        {
            return Err(ReceiptError::InvalidQuantity { index, quantity: item.quantity });
        }

        Ok(Receipt {
            merchant: merchant.to_string(),
            transaction_date: raw.transaction_date,
            total: raw.total,
            category: raw.category,
            line_items: raw.line_items,
        })
    }

    pub fn merchant(&self) -> &str {
        &self.merchant
    }

    pub fn transaction_date(&self) -> NaiveDate {
        self.transaction_date
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn line_items(&self) -> &[LineItem] {
        &self.line_items
    }

    /// Sum of the line item prices. Often differs from `total` (tax, tips,
    /// unlisted items), so it is informational only.
    pub fn line_items_total(&self) -> Money {
        self.line_items.iter().map(|l| l.price).sum()
    }
}
