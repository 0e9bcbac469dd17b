use chrono::{DateTime, NaiveDate, Utc};
use receiptscan_core::{Item, ItemCategory, MerchantType, Money, Receipt, ReceiptError, ReceiptId, TaxCode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Invalid receipt: {0}")]
    Invalid(#[from] ReceiptError),
    #[error("Receipt has no id")]
    MissingId,
    #[error("Corrupt value in {table}.{column}: '{value}'")]
    Corrupt { table: &'static str, column: &'static str, value: String },
}

/// OCR output for one page of a stored receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub page_index: u32,
    /// Content hash of the stored page image.
    pub image_hash: String,
    pub attachment_path: Option<String>,
    pub raw_text: String,
    pub line_count: u32,
    pub mean_confidence: f32,
    pub processing_time_seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MerchantTotal {
    pub merchant: String,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpendingSummary {
    pub receipt_count: i64,
    pub total_spent: Money,
    pub average_receipt: Money,
    /// Highest total first.
    pub by_merchant: Vec<MerchantTotal>,
}

pub async fn create_db(path: &Path) -> Result<DbPool, StorageError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    tracing::debug!("record store ready at {}", path.display());

    Ok(pool)
}

/// A private database that lives as long as the pool. Used by tests and dry runs.
pub async fn create_in_memory_db() -> Result<DbPool, StorageError> {
    let options = "sqlite::memory:"
        .parse::<SqliteConnectOptions>()?
        .foreign_keys(true);
    // A single connection that never expires: closing it would drop the database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            merchant_name TEXT NOT NULL,
            merchant_type TEXT NOT NULL DEFAULT 'Unknown',
            date TEXT NOT NULL,
            subtotal_cents INTEGER NOT NULL DEFAULT 0,
            tax_cents INTEGER NOT NULL DEFAULT 0,
            total_cents INTEGER NOT NULL DEFAULT 0,
            raw_text TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receipt_pages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            receipt_id INTEGER NOT NULL,
            page_index INTEGER NOT NULL,
            image_hash TEXT NOT NULL,
            attachment_path TEXT,
            raw_text TEXT NOT NULL,
            line_count INTEGER NOT NULL,
            mean_confidence REAL NOT NULL,
            processing_time_seconds REAL NOT NULL,
            UNIQUE (receipt_id, page_index),
            FOREIGN KEY (receipt_id) REFERENCES receipts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            receipt_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            price_cents INTEGER NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            unit_price_cents INTEGER NOT NULL,
            tax_code TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL DEFAULT 'Uncategorized',
            item_code TEXT,
            FOREIGN KEY (receipt_id) REFERENCES receipts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_receipts_date ON receipts(date)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Store a receipt with its items and per-page OCR output in one transaction.
pub async fn insert_scanned_receipt(
    pool: &DbPool,
    receipt: &Receipt,
    pages: &[PageRecord],
) -> Result<ReceiptId, StorageError> {
    receipt.validate()?;
    let mut tx = pool.begin().await?;

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO receipts (merchant_name, merchant_type, date, subtotal_cents, tax_cents, total_cents, raw_text, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id"
    )
    .bind(&receipt.merchant_name)
    .bind(receipt.merchant_type.display_name())
    .bind(receipt.date.to_string())
    .bind(receipt.subtotal.to_cents())
    .bind(receipt.tax_amount.to_cents())
    .bind(receipt.total.to_cents())
    .bind(&receipt.raw_text)
    .bind(receipt.created_at.to_rfc3339())
    .bind(receipt.updated_at.to_rfc3339())
    .fetch_one(&mut *tx)
    .await?;

    for item in &receipt.items {
        insert_item(&mut tx, id, item).await?;
    }

    for page in pages {
        sqlx::query(
            "INSERT INTO receipt_pages (receipt_id, page_index, image_hash, attachment_path, raw_text, line_count, mean_confidence, processing_time_seconds) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(id)
        .bind(page.page_index as i64)
        .bind(&page.image_hash)
        .bind(&page.attachment_path)
        .bind(&page.raw_text)
        .bind(page.line_count as i64)
        .bind(page.mean_confidence as f64)
        .bind(page.processing_time_seconds)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(receipt_id = id, pages = pages.len(), "receipt stored");
    Ok(ReceiptId(id))
}

async fn insert_item(
    conn: &mut sqlx::SqliteConnection,
    receipt_id: i64,
    item: &Item,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO items (receipt_id, name, price_cents, quantity, unit_price_cents, tax_code, category, item_code) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id"
    )
    .bind(receipt_id)
    .bind(&item.name)
    .bind(item.price.to_cents())
    .bind(item.quantity as i64)
    .bind(item.unit_price.to_cents())
    .bind(item.tax_code.code())
    .bind(item.category.to_string())
    .bind(&item.item_code)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

pub async fn add_item(pool: &DbPool, receipt_id: ReceiptId, item: &Item) -> Result<i64, StorageError> {
    let mut conn = pool.acquire().await?;
    let id = insert_item(&mut conn, receipt_id.0, item).await?;
    sqlx::query("UPDATE receipts SET updated_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(receipt_id.0)
        .execute(&mut *conn)
        .await?;
    Ok(id)
}

/// Overwrite the header fields (merchant, date, amounts, text) of a stored receipt.
/// Returns `false` when no receipt has that id.
pub async fn update_receipt(pool: &DbPool, receipt: &Receipt) -> Result<bool, StorageError> {
    let id = receipt.id.ok_or(StorageError::MissingId)?;
    receipt.validate()?;
    let result = sqlx::query(
        "UPDATE receipts SET merchant_name = ?, merchant_type = ?, date = ?, subtotal_cents = ?, tax_cents = ?, total_cents = ?, raw_text = ?, updated_at = ? WHERE id = ?"
    )
    .bind(&receipt.merchant_name)
    .bind(receipt.merchant_type.display_name())
    .bind(receipt.date.to_string())
    .bind(receipt.subtotal.to_cents())
    .bind(receipt.tax_amount.to_cents())
    .bind(receipt.total.to_cents())
    .bind(&receipt.raw_text)
    .bind(Utc::now().to_rfc3339())
    .bind(id.0)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

type ReceiptRow = (i64, String, String, String, i64, i64, i64, String, String, String);

const RECEIPT_COLUMNS: &str =
    "id, merchant_name, merchant_type, date, subtotal_cents, tax_cents, total_cents, raw_text, created_at, updated_at";

fn parse_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StorageError::Corrupt { table: "receipts", column, value })
}

fn receipt_from_row(r: ReceiptRow) -> Result<Receipt, StorageError> {
    let date = NaiveDate::parse_from_str(&r.3, "%Y-%m-%d")
        .map_err(|_| StorageError::Corrupt { table: "receipts", column: "date", value: r.3.clone() })?;
    Ok(Receipt {
        id: Some(ReceiptId(r.0)),
        merchant_name: r.1,
        merchant_type: r.2.parse::<MerchantType>().unwrap_or_default(),
        date,
        subtotal: Money::from_cents(r.4),
        tax_amount: Money::from_cents(r.5),
        total: Money::from_cents(r.6),
        raw_text: r.7,
        items: Vec::new(),
        created_at: parse_timestamp("created_at", r.8)?,
        updated_at: parse_timestamp("updated_at", r.9)?,
    })
}

pub async fn get_receipt_by_id(pool: &DbPool, id: ReceiptId) -> Result<Option<Receipt>, StorageError> {
    let row = sqlx::query_as::<_, ReceiptRow>(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let mut receipt = receipt_from_row(row)?;

    let items = sqlx::query_as::<_, (i64, String, i64, i64, i64, String, String, Option<String>)>(
        "SELECT id, name, price_cents, quantity, unit_price_cents, tax_code, category, item_code FROM items WHERE receipt_id = ? ORDER BY id"
    )
    .bind(id.0)
    .fetch_all(pool)
    .await?;

    receipt.items = items
        .into_iter()
        .map(|r| {
            let tax_code = TaxCode::from_code(&r.5).ok_or_else(|| StorageError::Corrupt {
                table: "items",
                column: "tax_code",
                value: r.5.clone(),
            })?;
            Ok(Item {
                id: Some(r.0),
                name: r.1,
                price: Money::from_cents(r.2),
                quantity: u32::try_from(r.3).unwrap_or(1),
                unit_price: Money::from_cents(r.4),
                tax_code,
                category: r.6.parse::<ItemCategory>().unwrap_or_default(),
                item_code: r.7,
            })
        })
        .collect::<Result<_, StorageError>>()?;

    Ok(Some(receipt))
}

pub async fn get_receipt_pages(pool: &DbPool, id: ReceiptId) -> Result<Vec<PageRecord>, StorageError> {
    let rows = sqlx::query_as::<_, (i64, String, Option<String>, String, i64, f64, f64)>(
        "SELECT page_index, image_hash, attachment_path, raw_text, line_count, mean_confidence, processing_time_seconds FROM receipt_pages WHERE receipt_id = ? ORDER BY page_index"
    )
    .bind(id.0)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| PageRecord {
            page_index: r.0 as u32,
            image_hash: r.1,
            attachment_path: r.2,
            raw_text: r.3,
            line_count: r.4 as u32,
            mean_confidence: r.5 as f32,
            processing_time_seconds: r.6,
        })
        .collect())
}

/// Most recent purchases first. Items are not loaded.
pub async fn list_receipts(pool: &DbPool, limit: i64) -> Result<Vec<Receipt>, StorageError> {
    let rows = sqlx::query_as::<_, ReceiptRow>(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts ORDER BY date DESC, id DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(receipt_from_row).collect()
}

/// Returns `false` when nothing was deleted. Pages and items go with the receipt.
pub async fn delete_receipt(pool: &DbPool, id: ReceiptId) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM receipts WHERE id = ?")
        .bind(id.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn spending_summary(pool: &DbPool) -> Result<SpendingSummary, StorageError> {
    let (count, total_cents): (i64, i64) =
        sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(total_cents), 0) FROM receipts")
            .fetch_one(pool)
            .await?;

    let by_merchant = sqlx::query_as::<_, (String, i64)>(
        "SELECT merchant_name, SUM(total_cents) AS spent FROM receipts GROUP BY merchant_name ORDER BY spent DESC, merchant_name"
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(merchant, cents)| MerchantTotal { merchant, total: Money::from_cents(cents) })
    .collect();

    let average_cents = if count > 0 {
        (total_cents as f64 / count as f64).round() as i64
    } else {
        0
    };

    Ok(SpendingSummary {
        receipt_count: count,
        total_spent: Money::from_cents(total_cents),
        average_receipt: Money::from_cents(average_cents),
        by_merchant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn receipt(name: &str, merchant: MerchantType, d: u32, total_cents: i64) -> Receipt {
        let mut r = Receipt::new(name, merchant, date(d));
        r.total = Money::from_cents(total_cents);
        r.raw_text = format!("{}\nTOTAL {}", name.to_uppercase(), Money::from_cents(total_cents));
        r
    }

    fn page(index: u32, text: &str) -> PageRecord {
        PageRecord {
            page_index: index,
            image_hash: format!("{index:064x}"),
            attachment_path: None,
            raw_text: text.to_string(),
            line_count: text.lines().count() as u32,
            mean_confidence: 0.875,
            processing_time_seconds: 0.42,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let pool = create_in_memory_db().await.unwrap();
        let mut r = receipt("T&T Supermarket", MerchantType::TAndT, 3, 4550);
        r.items = vec![
            Item::new("白菜 Bok Choy", Money::from_cents(399)).with_category(ItemCategory::Produce),
            Item::new("Paper Towel", Money::from_cents(1000))
                .with_quantity(2)
                .with_tax_code(TaxCode::Hst)
                .with_item_code("4011"),
        ];

        let id = insert_scanned_receipt(&pool, &r, &[page(0, "T&T\n白菜 3.99"), page(1, "TOTAL 45.50")])
            .await
            .unwrap();

        let stored = get_receipt_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.merchant_name, "T&T Supermarket");
        assert_eq!(stored.merchant_type, MerchantType::TAndT);
        assert_eq!(stored.date, date(3));
        assert_eq!(stored.total, Money::from_cents(4550));
        assert_eq!(stored.raw_text, r.raw_text);
        assert_eq!(stored.items.len(), 2);
        assert_eq!(stored.items[0].name, "白菜 Bok Choy");
        assert_eq!(stored.items[0].category, ItemCategory::Produce);
        assert_eq!(stored.items[1].quantity, 2);
        assert_eq!(stored.items[1].tax_code, TaxCode::Hst);
        assert_eq!(stored.items[1].item_code.as_deref(), Some("4011"));

        let pages = get_receipt_pages(&pool, id).await.unwrap();
        assert_eq!(pages, vec![page(0, "T&T\n白菜 3.99"), page(1, "TOTAL 45.50")]);
    }

    #[tokio::test]
    async fn missing_receipt_is_none() {
        let pool = create_in_memory_db().await.unwrap();
        assert!(get_receipt_by_id(&pool, ReceiptId(99)).await.unwrap().is_none());
        assert!(!delete_receipt(&pool, ReceiptId(99)).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_receipt_is_rejected() {
        let pool = create_in_memory_db().await.unwrap();
        let mut r = receipt("Walmart", MerchantType::Walmart, 1, 1200);
        r.subtotal = Money::from_cents(1000);
        r.tax_amount = Money::from_cents(130);
        let err = insert_scanned_receipt(&pool, &r, &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(ReceiptError::TotalMismatch { .. })));
        assert!(list_receipts(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_page_index_rolls_back() {
        let pool = create_in_memory_db().await.unwrap();
        let r = receipt("Costco", MerchantType::Costco, 1, 15099);
        let result = insert_scanned_receipt(&pool, &r, &[page(0, "a"), page(0, "b")]).await;
        assert!(matches!(result, Err(StorageError::Db(_))));
        assert!(list_receipts(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let pool = create_in_memory_db().await.unwrap();
        for (d, name) in [(1, "Costco"), (9, "Walmart"), (5, "No Frills")] {
            insert_scanned_receipt(&pool, &receipt(name, MerchantType::Unknown, d, 100), &[])
                .await
                .unwrap();
        }
        let names: Vec<String> = list_receipts(&pool, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.merchant_name)
            .collect();
        assert_eq!(names, ["Walmart", "No Frills"]);
    }

    #[tokio::test]
    async fn add_item_and_update() {
        let pool = create_in_memory_db().await.unwrap();
        let id = insert_scanned_receipt(&pool, &receipt("Food Basics", MerchantType::FoodBasics, 2, 0), &[])
            .await
            .unwrap();
        add_item(&pool, id, &Item::new("豆腐 Tofu", Money::from_cents(249))).await.unwrap();

        let mut stored = get_receipt_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(stored.items.len(), 1);

        stored.total = Money::from_cents(249);
        assert!(update_receipt(&pool, &stored).await.unwrap());
        let reread = get_receipt_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(reread.total, Money::from_cents(249));

        let unsaved = receipt("Nowhere", MerchantType::Unknown, 2, 0);
        assert!(matches!(update_receipt(&pool, &unsaved).await, Err(StorageError::MissingId)));
    }

    #[tokio::test]
    async fn delete_cascades_to_pages_and_items() {
        let pool = create_in_memory_db().await.unwrap();
        let mut r = receipt("Costco", MerchantType::Costco, 4, 699);
        r.items = vec![Item::new("Organic Milk", Money::from_cents(699))];
        let id = insert_scanned_receipt(&pool, &r, &[page(0, "MILK 6.99")]).await.unwrap();

        assert!(delete_receipt(&pool, id).await.unwrap());
        assert!(get_receipt_pages(&pool, id).await.unwrap().is_empty());
        let (items,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(items, 0);
    }

    #[tokio::test]
    async fn summary_totals_by_merchant() {
        let pool = create_in_memory_db().await.unwrap();
        for (name, cents) in [("Costco", 15099), ("T&T", 4550), ("Costco", 1001)] {
            insert_scanned_receipt(&pool, &receipt(name, MerchantType::Unknown, 1, cents), &[])
                .await
                .unwrap();
        }
        let s = spending_summary(&pool).await.unwrap();
        assert_eq!(s.receipt_count, 3);
        assert_eq!(s.total_spent, Money::from_cents(20650));
        assert_eq!(s.average_receipt, Money::from_cents(6883));
        assert_eq!(
            s.by_merchant,
            vec![
                MerchantTotal { merchant: "Costco".into(), total: Money::from_cents(16100) },
                MerchantTotal { merchant: "T&T".into(), total: Money::from_cents(4550) },
            ]
        );
    }

    #[tokio::test]
    async fn empty_summary() {
        let pool = create_in_memory_db().await.unwrap();
        let s = spending_summary(&pool).await.unwrap();
        assert_eq!(s.receipt_count, 0);
        assert!(s.total_spent.is_zero());
        assert!(s.by_merchant.is_empty());
    }

    #[tokio::test]
    async fn on_disk_db_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipts.db");
        {
            let pool = create_db(&path).await.unwrap();
            insert_scanned_receipt(&pool, &receipt("Costco", MerchantType::Costco, 1, 100), &[])
                .await
                .unwrap();
            pool.close().await;
        }
        let pool = create_db(&path).await.unwrap();
        assert_eq!(list_receipts(&pool, 10).await.unwrap().len(), 1);
    }
}
