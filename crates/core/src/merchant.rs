use serde::{Deserialize, Serialize};
use std::fmt;

/// Stores with dedicated receipt layouts. Anything else is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MerchantType {
    #[serde(rename = "Costco")]
    Costco,
    #[serde(rename = "T&T")]
    TAndT,
    #[serde(rename = "Walmart")]
    Walmart,
    #[serde(rename = "No Frills")]
    NoFrills,
    #[serde(rename = "Food Basics")]
    FoodBasics,
    #[default]
    #[serde(rename = "Unknown")]
    Unknown,
}

impl MerchantType {
    pub const ALL: [MerchantType; 6] = [
        MerchantType::Costco,
        MerchantType::TAndT,
        MerchantType::Walmart,
        MerchantType::NoFrills,
        MerchantType::FoodBasics,
        MerchantType::Unknown,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            MerchantType::Costco => "Costco",
            MerchantType::TAndT => "T&T",
            MerchantType::Walmart => "Walmart",
            MerchantType::NoFrills => "No Frills",
            MerchantType::FoodBasics => "Food Basics",
            MerchantType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for MerchantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for MerchantType {
    type Err = String;

    /// Accepts display names case-insensitively, plus a few spellings seen on receipt headers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "costco" | "costco wholesale" => Ok(MerchantType::Costco),
            "t&t" | "t&t supermarket" | "tnt" => Ok(MerchantType::TAndT),
            "walmart" => Ok(MerchantType::Walmart),
            "no frills" | "nofrills" => Ok(MerchantType::NoFrills),
            "food basics" | "foodbasics" => Ok(MerchantType::FoodBasics),
            "unknown" | "" => Ok(MerchantType::Unknown),
            other => Err(format!("Unknown merchant type: '{other}'")),
        }
    }
}
