use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::item::Item;
use crate::merchant::MerchantType;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptId(pub i64);

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReceiptError {
    #[error("Subtotal {subtotal} plus tax {tax} does not match total {total}")]
    TotalMismatch { subtotal: Money, tax: Money, total: Money },
    #[error("Negative amount on receipt: {0}")]
    NegativeAmount(Money),
}

/// A scanned receipt. `raw_text` holds the recognized lines of every page, page-separated,
/// exactly as recognized; nothing here parses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: Option<ReceiptId>,
    pub merchant_name: String,
    pub merchant_type: MerchantType,
    pub date: NaiveDate,
    pub subtotal: Money,
    pub tax_amount: Money,
    pub total: Money,
    pub raw_text: String,
    pub items: Vec<Item>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Receipt {
    pub fn new(merchant_name: impl Into<String>, merchant_type: MerchantType, date: NaiveDate) -> Self {
        let now = Utc::now();
        Receipt {
            id: None,
            merchant_name: merchant_name.into(),
            merchant_type,
            date,
            subtotal: Money::zero(),
            tax_amount: Money::zero(),
            total: Money::zero(),
            raw_text: String::new(),
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn items_total(&self) -> Money {
        self.items.iter().map(Item::total_price).sum()
    }

    pub fn items_tax(&self) -> Money {
        self.items.iter().map(Item::tax).sum()
    }

    /// Checks amounts are non-negative and, once a subtotal has been entered,
    /// that subtotal + tax adds up to the total.
    pub fn validate(&self) -> Result<(), ReceiptError> {
        for amount in [self.subtotal, self.tax_amount, self.total] {
            if amount < Money::zero() {
                return Err(ReceiptError::NegativeAmount(amount));
            }
        }
        if !self.subtotal.is_zero() && self.subtotal + self.tax_amount != self.total {
            return Err(ReceiptError::TotalMismatch {
                subtotal: self.subtotal,
                tax: self.tax_amount,
                total: self.total,
            });
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
