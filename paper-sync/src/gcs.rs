//! Google Cloud Storage implementation of the core [`ObjectStore`].
//!
//! Talks to the JSON API directly. Uploads are skipped when the object
//! already has the local file's size and MD5; renames are a server-side
//! rewrite followed by removal of the source object.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use paper_sync_core::contract::{BoxError, ObjectStore, UploadOutcome};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::io;
use std::path::Path;
use tracing::{debug, info};

use crate::gcp::{ApiClient, GcpError, STORAGE_SCOPE};

const API_ROOT: &str = "https://storage.googleapis.com/storage/v1/b";
const UPLOAD_ROOT: &str = "https://storage.googleapis.com/upload/storage/v1/b";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectMeta>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    /// Decimal string, as the API sends it.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    done: bool,
    rewrite_token: Option<String>,
}

pub struct GcsObjectStore {
    api: ApiClient,
    bucket: String,
}

impl GcsObjectStore {
    pub fn new(api: ApiClient, bucket: impl Into<String>) -> Self {
        Self {
            api,
            bucket: bucket.into(),
        }
    }

    /// `.../b/{bucket}/o/{key}` with the key as a single encoded segment.
    fn object_url(&self, key: &str, suffix: &[&str]) -> Result<Url, GcpError> {
        let mut url = Url::parse(API_ROOT).map_err(|e| GcpError::Decode(e.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| GcpError::Decode("API root cannot be a base".to_string()))?;
            segments.push(&self.bucket).push("o").push(key);
            segments.extend(suffix);
        }
        Ok(url)
    }

    async fn metadata(&self, key: &str) -> Result<Option<ObjectMeta>, GcpError> {
        let url = self.object_url(key, &[])?;
        let response = self
            .api
            .send(STORAGE_SCOPE, &[StatusCode::NOT_FOUND], |http| {
                http.get(url.clone())
                    .query(&[("fields", "name,size,md5Hash")])
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json::<ObjectMeta>().await?))
    }

    async fn rewrite(&self, key: &str, new_key: &str) -> Result<(), GcpError> {
        let url = self.object_url(key, &["rewriteTo", "b", self.bucket.as_str(), "o", new_key])?;
        let mut token: Option<String> = None;
        loop {
            let response = self
                .api
                .send(STORAGE_SCOPE, &[], |http| {
                    let req = http.post(url.clone()).json(&serde_json::json!({}));
                    match &token {
                        Some(t) => req.query(&[("rewriteToken", t.as_str())]),
                        None => req,
                    }
                })
                .await?;
            let progress: RewriteResponse = response.json().await?;
            if progress.done {
                return Ok(());
            }
            debug!(key, new_key, "Rewrite in progress");
            token = progress.rewrite_token;
            if token.is_none() {
                return Err(GcpError::Decode(
                    "rewrite not done and no rewrite token".to_string(),
                ));
            }
        }
    }
}

/// Base64 MD5, in the form GCS reports `md5Hash`.
pub fn md5_base64(bytes: &[u8]) -> String {
    STANDARD.encode(Md5::digest(bytes))
}

/// A local file read once for upload. Retries clone `body`, which shares the buffer.
struct MediaPayload {
    body: Bytes,
    size: u64,
    md5: String,
}

async fn read_payload(local: &Path) -> io::Result<MediaPayload> {
    let body = Bytes::from(tokio::fs::read(local).await?);
    Ok(MediaPayload {
        size: body.len() as u64,
        md5: md5_base64(&body),
        body,
    })
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BoxError> {
        let url = format!("{API_ROOT}/{}/o", self.bucket);
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = self
                .api
                .send(STORAGE_SCOPE, &[], |http| {
                    let req = http.get(&url).query(&[
                        ("prefix", prefix),
                        ("fields", "items(name),nextPageToken"),
                    ]);
                    match &page_token {
                        Some(t) => req.query(&[("pageToken", t.as_str())]),
                        None => req,
                    }
                })
                .await?;
            let page: ObjectList = response.json().await.map_err(GcpError::from)?;
            keys.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }
        debug!(bucket = %self.bucket, prefix, objects = keys.len(), "Listed bucket");
        Ok(keys)
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<UploadOutcome, BoxError> {
        let payload = read_payload(local).await?;
        let size = payload.size;

        if let Some(existing) = self.metadata(key).await? {
            let same_size = existing.size.as_deref() == Some(size.to_string().as_str());
            let same_md5 = existing.md5_hash.as_deref().map_or(true, |h| h == payload.md5);
            if same_size && same_md5 {
                debug!(bucket = %self.bucket, key, "Object unchanged");
                return Ok(UploadOutcome::Unchanged);
            }
        }

        let url = format!("{UPLOAD_ROOT}/{}/o", self.bucket);
        self.api
            .send(STORAGE_SCOPE, &[], |http| {
                http.post(&url)
                    .query(&[("uploadType", "media"), ("name", key)])
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(payload.body.clone())
            })
            .await?;
        info!(bucket = %self.bucket, key, bytes = size, "Uploaded object");
        Ok(UploadOutcome::Uploaded { bytes: size })
    }

    async fn rename(&self, key: &str, new_key: &str) -> Result<(), BoxError> {
        self.rewrite(key, new_key).await?;
        let url = self.object_url(key, &[])?;
        self.api
            .send(STORAGE_SCOPE, &[StatusCode::NOT_FOUND], |http| {
                http.delete(url.clone())
            })
            .await?;
        info!(bucket = %self.bucket, key, new_key, "Renamed object");
        Ok(())
    }
}
