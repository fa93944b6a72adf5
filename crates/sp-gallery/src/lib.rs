use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rocksdb::{DB, IteratorMode, Options};
use sp_api_types::SmileRecord;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Minimum score for a selfie to enter the gallery.
pub const QUALIFYING_SCORE: f64 = 5.0;

/// Persistence for qualifying smiles. Every implementation applies the
/// same read-time filter and newest-first ordering, so backends are
/// drop-in substitutes for one another.
#[async_trait]
pub trait GalleryStore: Send + Sync {
    /// Stores raw image bytes and returns a displayable handle.
    async fn store_image(&self, image: &[u8]) -> Result<String>;

    async fn persist(&self, record: &SmileRecord) -> Result<()>;

    /// Records with `score >= min_score`, strictly newest first.
    async fn list(&self, min_score: f64) -> Result<Vec<SmileRecord>>;
}

fn data_url(image: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(image))
}

fn filter_and_sort(mut records: Vec<SmileRecord>, min_score: f64) -> Vec<SmileRecord> {
    records.retain(|record| record.score >= min_score);
    records.sort_by(|a, b| b.created_at_epoch_ms.cmp(&a.created_at_epoch_ms));
    records
}

/// Ephemeral backend. Entries are prepended so same-millisecond records
/// still list newest first.
#[derive(Default)]
pub struct InMemoryGallery {
    records: RwLock<Vec<SmileRecord>>,
}

#[async_trait]
impl GalleryStore for InMemoryGallery {
    async fn store_image(&self, image: &[u8]) -> Result<String> {
        Ok(data_url(image))
    }

    async fn persist(&self, record: &SmileRecord) -> Result<()> {
        let mut guard = self.records.write().await;
        guard.insert(0, record.clone());
        Ok(())
    }

    async fn list(&self, min_score: f64) -> Result<Vec<SmileRecord>> {
        let guard = self.records.read().await;
        Ok(filter_and_sort(guard.clone(), min_score))
    }
}

pub struct RocksDbGallery {
    db: Arc<DB>,
}

impl RocksDbGallery {
    pub fn open_default(path: &str) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn key_for_record(created_at_epoch_ms: u128, record_id: &str) -> String {
        format!("smile:{created_at_epoch_ms:020}:{record_id}")
    }
}

#[async_trait]
impl GalleryStore for RocksDbGallery {
    async fn store_image(&self, image: &[u8]) -> Result<String> {
        Ok(data_url(image))
    }

    async fn persist(&self, record: &SmileRecord) -> Result<()> {
        let key = Self::key_for_record(record.created_at_epoch_ms, &Uuid::new_v4().to_string());
        let value = serde_json::to_vec(record)?;
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    async fn list(&self, min_score: f64) -> Result<Vec<SmileRecord>> {
        let mut records = Vec::new();

        for entry in self.db.iterator(IteratorMode::Start) {
            let (key, value) = entry?;
            if !key.as_ref().starts_with(b"smile:") {
                continue;
            }
            records.push(serde_json::from_slice::<SmileRecord>(&value)?);
        }

        Ok(filter_and_sort(records, min_score))
    }
}

/// Networked backend against a Supabase-style REST API.
///
/// Reads `SMILE_GALLERY_URL` and `SMILE_GALLERY_API_KEY` from the
/// environment at construction time.
pub struct HttpGallery {
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpGallery {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        let endpoint = endpoint
            .or_else(|| std::env::var("SMILE_GALLERY_URL").ok())
            .unwrap_or_else(|| "http://localhost:54321".to_string());
        let api_key = api_key
            .or_else(|| std::env::var("SMILE_GALLERY_API_KEY").ok())
            .unwrap_or_default();

        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGallery {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[async_trait]
impl GalleryStore for HttpGallery {
    async fn store_image(&self, image: &[u8]) -> Result<String> {
        let object_name = format!("{}.jpg", Uuid::new_v4());
        let url = format!("{}/storage/v1/object/smiles/{}", self.endpoint, object_name);

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .header("content-type", "image/jpeg")
            .body(image.to_vec())
            .send()
            .await
            .context("gallery image upload transport")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("gallery image upload HTTP {status}: {text}");
        }

        Ok(format!(
            "{}/storage/v1/object/public/smiles/{}",
            self.endpoint, object_name
        ))
    }

    async fn persist(&self, record: &SmileRecord) -> Result<()> {
        let url = format!("{}/rest/v1/smile_images", self.endpoint);

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .header("prefer", "return=minimal")
            .json(&[record])
            .send()
            .await
            .context("gallery persist transport")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("gallery persist HTTP {status}: {text}");
        }

        Ok(())
    }

    async fn list(&self, min_score: f64) -> Result<Vec<SmileRecord>> {
        let url = format!(
            "{}/rest/v1/smile_images?select=*&score=gte.{}&order=created_at_epoch_ms.desc",
            self.endpoint, min_score
        );

        let response = self
            .http
            .get(&url)
            .header("apikey", &self.api_key)
            .send()
            .await
            .context("gallery list transport")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("gallery list HTTP {status}: {text}");
        }

        let records: Vec<SmileRecord> = response.json().await.context("gallery list parse")?;

        // The server already filters and orders; re-apply locally so this
        // backend stays behaviorally identical to the local ones even
        // against a misconfigured table.
        Ok(filter_and_sort(records, min_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, score: f64, created_at_epoch_ms: u128) -> SmileRecord {
        SmileRecord {
            url: url.to_owned(),
            score,
            created_at_epoch_ms,
        }
    }

    #[tokio::test]
    async fn in_memory_filters_below_threshold() -> Result<()> {
        let gallery = InMemoryGallery::default();
        gallery.persist(&record("a", 4.9, 1)).await?;
        gallery.persist(&record("b", 5.0, 2)).await?;
        gallery.persist(&record("c", 0.0, 3)).await?;
        gallery.persist(&record("d", 10.0, 4)).await?;

        let listed = gallery.list(QUALIFYING_SCORE).await?;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|entry| entry.score >= QUALIFYING_SCORE));

        Ok(())
    }

    #[tokio::test]
    async fn in_memory_lists_newest_first() -> Result<()> {
        let gallery = InMemoryGallery::default();
        gallery.persist(&record("old", 6.0, 100)).await?;
        gallery.persist(&record("mid", 7.0, 200)).await?;
        gallery.persist(&record("new", 5.5, 300)).await?;

        let listed = gallery.list(QUALIFYING_SCORE).await?;
        let urls: Vec<&str> = listed.iter().map(|entry| entry.url.as_str()).collect();
        assert_eq!(urls, vec!["new", "mid", "old"]);

        Ok(())
    }

    #[tokio::test]
    async fn in_memory_same_millisecond_keeps_latest_first() -> Result<()> {
        let gallery = InMemoryGallery::default();
        gallery.persist(&record("first", 6.0, 500)).await?;
        gallery.persist(&record("second", 6.0, 500)).await?;

        let listed = gallery.list(QUALIFYING_SCORE).await?;
        let urls: Vec<&str> = listed.iter().map(|entry| entry.url.as_str()).collect();
        assert_eq!(urls, vec!["second", "first"]);

        Ok(())
    }

    #[tokio::test]
    async fn data_url_handle_is_displayable() -> Result<()> {
        let gallery = InMemoryGallery::default();
        let handle = gallery.store_image(&[0xff, 0xd8, 0xff]).await?;
        assert!(handle.starts_with("data:image/jpeg;base64,"));
        Ok(())
    }

    fn temp_db_path() -> String {
        std::env::temp_dir()
            .join(format!("sp-gallery-test-{}", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn rocksdb_roundtrip_filters_and_orders() -> Result<()> {
        let path = temp_db_path();
        let gallery = RocksDbGallery::open_default(&path)?;

        gallery.persist(&record("skip", 2.0, 10)).await?;
        gallery.persist(&record("old", 5.0, 20)).await?;
        gallery.persist(&record("new", 9.9, 30)).await?;

        let listed = gallery.list(QUALIFYING_SCORE).await?;
        let urls: Vec<&str> = listed.iter().map(|entry| entry.url.as_str()).collect();
        assert_eq!(urls, vec!["new", "old"]);

        drop(gallery);
        let _ = std::fs::remove_dir_all(&path);
        Ok(())
    }

    #[tokio::test]
    async fn rocksdb_survives_reopen() -> Result<()> {
        let path = temp_db_path();

        {
            let gallery = RocksDbGallery::open_default(&path)?;
            gallery.persist(&record("kept", 7.2, 42)).await?;
        }

        let gallery = RocksDbGallery::open_default(&path)?;
        let listed = gallery.list(QUALIFYING_SCORE).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].url, "kept");
        assert_eq!(listed[0].score, 7.2);

        drop(gallery);
        let _ = std::fs::remove_dir_all(&path);
        Ok(())
    }
}
