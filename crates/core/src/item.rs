use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::money::Money;

/// Tax flag printed beside an item on Ontario grocery receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaxCode {
    /// HST 13% (Ontario).
    #[serde(rename = "H")]
    Hst,
    #[serde(rename = "E")]
    Exempt,
    #[default]
    #[serde(rename = "")]
    None,
    /// Walmart's HST flag.
    #[serde(rename = "J")]
    HstWalmart,
    /// Zero-rated (Walmart).
    #[serde(rename = "D")]
    ZeroRated,
    /// Multi-buy rewards.
    #[serde(rename = "M")]
    MultiBuy,
}

impl TaxCode {
    pub fn code(self) -> &'static str {
        match self {
            TaxCode::Hst => "H",
            TaxCode::Exempt => "E",
            TaxCode::None => "",
            TaxCode::HstWalmart => "J",
            TaxCode::ZeroRated => "D",
            TaxCode::MultiBuy => "M",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "H" => Some(TaxCode::Hst),
            "E" => Some(TaxCode::Exempt),
            "" => Some(TaxCode::None),
            "J" => Some(TaxCode::HstWalmart),
            "D" => Some(TaxCode::ZeroRated),
            "M" => Some(TaxCode::MultiBuy),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            TaxCode::Hst | TaxCode::HstWalmart => "HST (13%)",
            TaxCode::Exempt | TaxCode::ZeroRated => "Tax Exempt",
            TaxCode::None => "No Tax",
            TaxCode::MultiBuy => "Multi-buy",
        }
    }

    pub fn rate(self) -> Decimal {
        match self {
            TaxCode::Hst | TaxCode::HstWalmart => Decimal::new(13, 2),
            _ => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ItemCategory {
    Produce,
    Dairy,
    Meat,
    Bakery,
    Frozen,
    Beverages,
    Snacks,
    Household,
    #[serde(rename = "Personal Care")]
    Personal,
    #[default]
    Uncategorized,
}

impl fmt::Display for ItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemCategory::Produce => write!(f, "Produce"),
            ItemCategory::Dairy => write!(f, "Dairy"),
            ItemCategory::Meat => write!(f, "Meat"),
            ItemCategory::Bakery => write!(f, "Bakery"),
            ItemCategory::Frozen => write!(f, "Frozen"),
            ItemCategory::Beverages => write!(f, "Beverages"),
            ItemCategory::Snacks => write!(f, "Snacks"),
            ItemCategory::Household => write!(f, "Household"),
            ItemCategory::Personal => write!(f, "Personal Care"),
            ItemCategory::Uncategorized => write!(f, "Uncategorized"),
        }
    }
}

impl std::str::FromStr for ItemCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Produce" => Ok(ItemCategory::Produce),
            "Dairy" => Ok(ItemCategory::Dairy),
            "Meat" => Ok(ItemCategory::Meat),
            "Bakery" => Ok(ItemCategory::Bakery),
            "Frozen" => Ok(ItemCategory::Frozen),
            "Beverages" => Ok(ItemCategory::Beverages),
            "Snacks" => Ok(ItemCategory::Snacks),
            "Household" => Ok(ItemCategory::Household),
            "Personal Care" => Ok(ItemCategory::Personal),
            "Uncategorized" => Ok(ItemCategory::Uncategorized),
            other => Err(format!("Unknown item category: '{other}'")),
        }
    }
}

/// A single purchased line on a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Option<i64>,
    pub name: String,
    pub price: Money,
    pub quantity: u32,
    pub unit_price: Money,
    pub tax_code: TaxCode,
    pub category: ItemCategory,
    /// SKU or PLU as printed, when the store prints one.
    pub item_code: Option<String>,
}

impl Item {
    /// Unit price defaults to `price`; quantity defaults to one.
    pub fn new(name: impl Into<String>, price: Money) -> Self {
        Item {
            id: None,
            name: name.into(),
            price,
            quantity: 1,
            unit_price: price,
            tax_code: TaxCode::None,
            category: ItemCategory::Uncategorized,
            item_code: None,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_tax_code(mut self, tax_code: TaxCode) -> Self {
        self.tax_code = tax_code;
        self
    }

    pub fn with_category(mut self, category: ItemCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_item_code(mut self, code: impl Into<String>) -> Self {
        self.item_code = Some(code.into());
        self
    }

    pub fn total_price(&self) -> Money {
        self.price * self.quantity
    }

    pub fn tax(&self) -> Money {
        self.total_price().apply_rate(self.tax_code.rate())
    }
}
