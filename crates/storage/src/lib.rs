pub mod db;

pub use db::{
    add_item, create_db, create_in_memory_db, delete_receipt, get_receipt_by_id,
    get_receipt_pages, insert_scanned_receipt, list_receipts, spending_summary, update_receipt,
    DbPool, MerchantTotal, PageRecord, SpendingSummary, StorageError,
};
