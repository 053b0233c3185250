//! Drover persistence: app image history and image process metadata.
//! Synchronous; deploys are not latency sensitive here.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use drover_core::ImageMetadata;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::debug;

pub trait ImageStore: Send + Sync {
    /// Record `image` as the newest image of `app`.
    fn append_app_image_name(&self, app: &str, image: &str) -> Result<()>;
    /// History of `app`, oldest first.
    fn app_images(&self, app: &str) -> Result<Vec<String>>;
    fn current_app_image(&self, app: &str) -> Result<Option<String>>;
    fn save_image_metadata(&self, image: &str, meta: &ImageMetadata) -> Result<()>;
    fn image_metadata(&self, image: &str) -> Result<Option<ImageMetadata>>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct SqliteImageStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteImageStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("DROVER_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS app_images (
                app   TEXT NOT NULL,
                image TEXT NOT NULL,
                ts    INTEGER NOT NULL
            )",
            [],
        )
        .context("creating app_images table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_app_images_app ON app_images(app)", []).ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS image_metadata (
                image TEXT PRIMARY KEY,
                data  TEXT NOT NULL
            )",
            [],
        )
        .context("creating image_metadata table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }
}

impl ImageStore for SqliteImageStore {
    fn append_app_image_name(&self, app: &str, image: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let db = lock(&self.db);
        db.execute(
            "INSERT INTO app_images(app, image, ts) VALUES (?1, ?2, ?3)",
            (app, image, now_ts()),
        )
        .with_context(|| format!("appending image {} to app {}", image, app))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(app = %app, image = %image, "image appended");
        Ok(())
    }

    fn app_images(&self, app: &str) -> Result<Vec<String>> {
        let started = std::time::Instant::now();
        let db = lock(&self.db);
        let mut stmt = db.prepare("SELECT image FROM app_images WHERE app = ?1 ORDER BY rowid ASC")?;
        let mut rows = stmt.query([app])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn current_app_image(&self, app: &str) -> Result<Option<String>> {
        let db = lock(&self.db);
        let mut stmt = db.prepare("SELECT image FROM app_images WHERE app = ?1 ORDER BY rowid DESC LIMIT 1")?;
        let mut rows = stmt.query([app])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn save_image_metadata(&self, image: &str, meta: &ImageMetadata) -> Result<()> {
        let data = serde_json::to_string(meta).context("encoding image metadata")?;
        let db = lock(&self.db);
        db.execute(
            "INSERT INTO image_metadata(image, data) VALUES (?1, ?2)
             ON CONFLICT(image) DO UPDATE SET data = excluded.data",
            (image, &data),
        )
        .with_context(|| format!("saving metadata of image {}", image))?;
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn image_metadata(&self, image: &str) -> Result<Option<ImageMetadata>> {
        let db = lock(&self.db);
        let mut stmt = db.prepare("SELECT data FROM image_metadata WHERE image = ?1")?;
        let mut rows = stmt.query([image])?;
        let Some(row) = rows.next()? else { return Ok(None) };
        let data: String = row.get(0)?;
        let meta = serde_json::from_str(&data).with_context(|| format!("decoding metadata of image {}", image))?;
        Ok(Some(meta))
    }
}

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct MemImageStore {
    images: Mutex<FxHashMap<String, Vec<String>>>,
    metadata: Mutex<FxHashMap<String, ImageMetadata>>,
}

impl MemImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageStore for MemImageStore {
    fn append_app_image_name(&self, app: &str, image: &str) -> Result<()> {
        lock(&self.images).entry(app.to_string()).or_default().push(image.to_string());
        Ok(())
    }

    fn app_images(&self, app: &str) -> Result<Vec<String>> {
        Ok(lock(&self.images).get(app).cloned().unwrap_or_default())
    }

    fn current_app_image(&self, app: &str) -> Result<Option<String>> {
        Ok(lock(&self.images).get(app).and_then(|v| v.last().cloned()))
    }

    fn save_image_metadata(&self, image: &str, meta: &ImageMetadata) -> Result<()> {
        lock(&self.metadata).insert(image.to_string(), meta.clone());
        Ok(())
    }

    fn image_metadata(&self, image: &str) -> Result<Option<ImageMetadata>> {
        Ok(lock(&self.metadata).get(image).cloned())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".drover");
        let _ = std::fs::create_dir_all(&p);
        p.push("drover.db");
        return p.to_string_lossy().to_string();
    }
    "drover.db".to_string()
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
