use anyhow::{bail, Context as _};
use chrono::NaiveDate;
use receiptscan_core::{MerchantType, Receipt, ReceiptId};
use receiptscan_ocr::{
    ContentHash, OcrEngine, RawImage, RecognitionResult, RecognitionService, ScanOrchestrator,
    ScanSession, ScanState, ScannerConfig,
};
use receiptscan_storage::{DbPool, PageRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type Engine = Arc<dyn OcrEngine>;

/// Settings shared by every subcommand.
pub struct Context {
    config: ScannerConfig,
    data_dir: PathBuf,
    #[cfg_attr(not(feature = "tesseract"), allow(dead_code))]
    tessdata: Option<String>,
}

impl Context {
    pub fn new(config: ScannerConfig, data_dir: PathBuf, tessdata: Option<String>) -> Self {
        Self { config, data_dir, tessdata }
    }

    fn engine(&self) -> Engine {
        #[cfg(feature = "tesseract")]
        {
            Arc::new(receiptscan_ocr::TesseractRecognizer::new(self.tessdata.clone()))
        }
        #[cfg(not(feature = "tesseract"))]
        {
            Arc::new(receiptscan_ocr::UnavailableEngine::new(
                "this build has no OCR engine; rebuild with `--features tesseract`",
            ))
        }
    }

    fn orchestrator(&self, preprocess: bool) -> anyhow::Result<ScanOrchestrator<Engine>> {
        let service = RecognitionService::with_config(self.engine(), self.config.clone())
            .context("invalid scanner configuration")?;
        Ok(ScanOrchestrator::new(Arc::new(service)).with_preprocessing(preprocess))
    }

    async fn db(&self) -> anyhow::Result<DbPool> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating {}", self.data_dir.display()))?;
        let pool = receiptscan_storage::create_db(&self.data_dir.join("receipts.db")).await?;
        Ok(pool)
    }

    fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }
}

// ── Scanning ──────────────────────────────────────────────────────────────────

pub async fn scan(
    ctx: &Context,
    paths: &[PathBuf],
    preprocess: bool,
    save: bool,
    merchant: Option<String>,
    date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let pages = paths
        .iter()
        .map(|p| RawImage::open(p).with_context(|| format!("reading {}", p.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let scans = ctx.orchestrator(preprocess)?;
    let session = scans.process_batch(pages).await?;
    print_session(&session);

    if let ScanState::Failed(error) = session.state() {
        bail!("scan failed: {error}");
    }
    if save {
        let pool = ctx.db().await?;
        let id = save_session(ctx, &pool, &session, merchant, date).await?;
        println!("Saved as receipt #{}", id.0);
    }
    Ok(())
}

pub async fn watch(
    ctx: &Context,
    dir: Option<PathBuf>,
    preprocess: bool,
    save: bool,
) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| ctx.data_dir.join("intake"));
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let scans = ctx.orchestrator(preprocess)?;
    let pool = if save { Some(ctx.db().await?) } else { None };

    // The channel bridges the notify watcher thread and the scan loop.
    let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
    let _watcher = receiptscan_ocr::spawn_intake_watcher(&dir, tx)
        .with_context(|| format!("watching {}", dir.display()))?;
    tracing::info!("watching intake folder: {}", dir.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = rx.recv() => {
                let Some(path) = received else { break };
                if let Err(e) = scan_dropped_file(ctx, &scans, pool.as_ref(), &path).await {
                    tracing::warn!("{}: {e:#}", path.display());
                }
            }
        }
    }
    tracing::info!("stopped watching");
    Ok(())
}

async fn scan_dropped_file(
    ctx: &Context,
    scans: &ScanOrchestrator<Engine>,
    pool: Option<&DbPool>,
    path: &Path,
) -> anyhow::Result<()> {
    let page = RawImage::open(path).with_context(|| format!("reading {}", path.display()))?;
    println!("{}", path.display());
    let session = scans.process_batch(vec![page]).await?;
    print_session(&session);

    if let ScanState::Failed(error) = session.state() {
        bail!("{error}");
    }
    if let Some(pool) = pool {
        let id = save_session(ctx, pool, &session, None, None).await?;
        println!("Saved as receipt #{}", id.0);
    }
    Ok(())
}

fn print_session(session: &ScanSession) {
    for (index, result) in session.results().iter().enumerate() {
        print_page(index + 1, result);
    }
    println!(
        "{} page(s), {} line(s), {}",
        session.results().len(),
        session.total_lines_recognized(),
        session.state()
    );
}

fn print_page(number: usize, result: &RecognitionResult) {
    println!(
        "── Page {number} ── {} lines, {:.0}% mean confidence, {:.2}s",
        result.lines().len(),
        result.mean_confidence() * 100.0,
        result.processing_time_seconds()
    );
    for line in result.lines() {
        println!("[{:>3.0}%] {}", line.confidence() * 100.0, line.text());
    }
}

/// Store the page images under their content hash and record the receipt.
async fn save_session(
    ctx: &Context,
    pool: &DbPool,
    session: &ScanSession,
    merchant: Option<String>,
    date: Option<NaiveDate>,
) -> anyhow::Result<ReceiptId> {
    let attachments = ctx.attachments_dir();
    let mut records = Vec::with_capacity(session.results().len());

    for (index, (page, result)) in session.pages().iter().zip(session.results()).enumerate() {
        let png = page.encode_png().context("encoding page image")?;
        let hash = ContentHash::of(&png);
        let path = hash.attachment_path(&attachments, "png");
        if !tokio::fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &png)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
        records.push(page_record(index, &hash, &path, result));
    }

    let text = session.combined_text();
    let (name, merchant_type) = merchant_from_flag(merchant);
    let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());

    let mut receipt = Receipt::new(name, merchant_type, date);
    receipt.raw_text = text;
    let id = receiptscan_storage::insert_scanned_receipt(pool, &receipt, &records).await?;
    Ok(id)
}

fn page_record(index: usize, hash: &ContentHash, path: &Path, result: &RecognitionResult) -> PageRecord {
    PageRecord {
        page_index: index as u32,
        image_hash: hash.to_hex(),
        attachment_path: Some(path.display().to_string()),
        raw_text: result.raw_text().to_string(),
        line_count: result.lines().len() as u32,
        mean_confidence: result.mean_confidence(),
        processing_time_seconds: result.processing_time_seconds(),
    }
}

/// Recognized text is stored as-is; the merchant comes only from `--merchant`.
fn merchant_from_flag(merchant: Option<String>) -> (String, MerchantType) {
    match merchant {
        Some(name) => {
            let merchant_type = name.parse().unwrap_or_default();
            (name, merchant_type)
        }
        None => (MerchantType::Unknown.display_name().to_string(), MerchantType::Unknown),
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

pub async fn list(ctx: &Context, limit: i64) -> anyhow::Result<()> {
    let pool = ctx.db().await?;
    let receipts = receiptscan_storage::list_receipts(&pool, limit).await?;
    if receipts.is_empty() {
        println!("No receipts stored.");
        return Ok(());
    }
    for r in receipts {
        let id = r.id.map(|id| id.0).unwrap_or_default();
        println!("#{id:<5} {}  {:<24} {:>12}", r.date, r.merchant_name, r.total.to_string());
    }
    Ok(())
}

pub async fn show(ctx: &Context, id: i64) -> anyhow::Result<()> {
    let pool = ctx.db().await?;
    let id = ReceiptId(id);
    let Some(receipt) = receiptscan_storage::get_receipt_by_id(&pool, id).await? else {
        bail!("no receipt #{}", id.0);
    };

    println!("{} ({}) on {}", receipt.merchant_name, receipt.merchant_type, receipt.date);
    println!("Subtotal {}  Tax {}  Total {}", receipt.subtotal, receipt.tax_amount, receipt.total);
    for item in &receipt.items {
        println!(
            "  {:<32} x{:<3} {:>10} {}",
            item.name,
            item.quantity,
            item.total_price().to_string(),
            item.tax_code.code()
        );
    }
    for page in receiptscan_storage::get_receipt_pages(&pool, id).await? {
        println!(
            "── Page {} ── {} lines, {:.0}% mean confidence",
            page.page_index + 1,
            page.line_count,
            page.mean_confidence * 100.0
        );
        println!("{}", page.raw_text);
    }
    Ok(())
}

pub async fn delete(ctx: &Context, id: i64) -> anyhow::Result<()> {
    let pool = ctx.db().await?;
    if !receiptscan_storage::delete_receipt(&pool, ReceiptId(id)).await? {
        bail!("no receipt #{id}");
    }
    println!("Deleted receipt #{id}");
    Ok(())
}

pub async fn stats(ctx: &Context) -> anyhow::Result<()> {
    let pool = ctx.db().await?;
    let summary = receiptscan_storage::spending_summary(&pool).await?;
    println!("Receipts:  {}", summary.receipt_count);
    println!("Spent:     {}", summary.total_spent);
    println!("Average:   {}", summary.average_receipt);
    for entry in &summary.by_merchant {
        println!("  {:<24} {:>12}", entry.merchant, entry.total.to_string());
    }
    Ok(())
}

pub fn languages(ctx: &Context) -> anyhow::Result<()> {
    let configured = &ctx.config.recognition.languages;
    for language in ctx.engine().supported_languages() {
        let mark = if configured.contains(&language) { "*" } else { " " };
        println!("{mark} {language}");
    }
    Ok(())
}
