pub mod item;
pub mod merchant;
pub mod money;
pub mod receipt;

pub use item::{Item, ItemCategory, TaxCode};
pub use merchant::MerchantType;
pub use money::Money;
pub use receipt::{Receipt, ReceiptError, ReceiptId};
