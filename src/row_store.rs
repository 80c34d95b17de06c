use std::collections::BTreeSet;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::CouchSettings;
use crate::error::IngestError;
use crate::grouper::SampleBatchRecord;
use crate::sanitize::sanitize_id;

/// Document store holding one [`SampleBatchRecord`] per sample of an upload.
pub trait RowStore: Send + Sync {
    fn bulk_add(&self, records: &[SampleBatchRecord]) -> Result<(), IngestError>;
    fn find_by_filename(&self, filename: &str) -> Result<Vec<SampleBatchRecord>, IngestError>;
    /// Removes every record of the upload; returns how many were removed.
    fn delete_by_filename(&self, filename: &str) -> Result<usize, IngestError>;
    /// Distinct upload filenames, sorted.
    fn filenames(&self) -> Result<Vec<String>, IngestError>;
}

impl<T: RowStore + ?Sized> RowStore for &T {
    fn bulk_add(&self, records: &[SampleBatchRecord]) -> Result<(), IngestError> {
        (**self).bulk_add(records)
    }

    fn find_by_filename(&self, filename: &str) -> Result<Vec<SampleBatchRecord>, IngestError> {
        (**self).find_by_filename(filename)
    }

    fn delete_by_filename(&self, filename: &str) -> Result<usize, IngestError> {
        (**self).delete_by_filename(filename)
    }

    fn filenames(&self) -> Result<Vec<String>, IngestError> {
        (**self).filenames()
    }
}

/// Records kept as one JSON array per upload under `root`.
#[derive(Debug, Clone)]
pub struct FileRowStore {
    root: Utf8PathBuf,
}

impl FileRowStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn upload_path(&self, filename: &str) -> Utf8PathBuf {
        self.root.join(format!("{}.json", sanitize_id(filename)))
    }

    fn read_file(path: &Utf8Path) -> Result<Vec<SampleBatchRecord>, IngestError> {
        if !path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| IngestError::RowStorePayload(format!("{path}: {err}")))
    }

    fn write_atomic(path: &Utf8Path, records: &[SampleBatchRecord]) -> Result<(), IngestError> {
        let parent = path
            .parent()
            .ok_or_else(|| IngestError::Filesystem("invalid row store path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec_pretty(records)
            .map_err(|err| IngestError::RowStorePayload(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("kira-sg-rows")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl RowStore for FileRowStore {
    fn bulk_add(&self, records: &[SampleBatchRecord]) -> Result<(), IngestError> {
        let mut by_upload: Vec<(String, Vec<SampleBatchRecord>)> = Vec::new();
        for record in records {
            match by_upload
                .iter_mut()
                .find(|(filename, _)| filename == record.filename())
            {
                Some((_, batch)) => batch.push(record.clone()),
                None => by_upload.push((record.filename().to_string(), vec![record.clone()])),
            }
        }
        for (filename, batch) in by_upload {
            let path = self.upload_path(&filename);
            let mut stored = Self::read_file(&path)?;
            stored.extend(batch);
            Self::write_atomic(&path, &stored)?;
            debug!(%path, records = stored.len(), "wrote row store file");
        }
        Ok(())
    }

    fn find_by_filename(&self, filename: &str) -> Result<Vec<SampleBatchRecord>, IngestError> {
        let records = Self::read_file(&self.upload_path(filename))?;
        Ok(records
            .into_iter()
            .filter(|record| record.filename() == filename)
            .collect())
    }

    fn delete_by_filename(&self, filename: &str) -> Result<usize, IngestError> {
        let path = self.upload_path(filename);
        let records = Self::read_file(&path)?;
        let (removed, kept): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| record.filename() == filename);
        if kept.is_empty() {
            if path.as_std_path().exists() {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| IngestError::Filesystem(err.to_string()))?;
            }
        } else {
            Self::write_atomic(&path, &kept)?;
        }
        Ok(removed.len())
    }

    fn filenames(&self) -> Result<Vec<String>, IngestError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.extension() != Some("json") {
                continue;
            }
            for record in Self::read_file(&path)? {
                names.insert(record.meta.filename);
            }
        }
        Ok(names.into_iter().collect())
    }
}

/// CouchDB database reached over its HTTP API.
#[derive(Clone)]
pub struct CouchRowStore {
    client: Client,
    database_url: String,
    username: Option<String>,
    password: Option<String>,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    docs: Vec<Value>,
    #[serde(default)]
    bookmark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkResult {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct Tombstone<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_rev")]
    rev: &'a str,
    #[serde(rename = "_deleted")]
    deleted: bool,
}

impl CouchRowStore {
    pub fn new(settings: &CouchSettings) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sg/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::RowStoreHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| IngestError::RowStoreHttp(err.to_string()))?;

        Ok(Self {
            client,
            database_url: format!(
                "{}/{}",
                settings.url.trim_end_matches('/'),
                settings.database
            ),
            username: settings.username.clone(),
            password: settings.password.clone(),
            page_size: 1000,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, IngestError> {
        let response = self
            .authorize(request)
            .send()
            .map_err(|err| IngestError::RowStoreHttp(err.to_string()))?;
        Self::handle_status(response)
    }

    fn handle_status(response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "row store request failed".to_string());
        Err(IngestError::RowStoreStatus { status, message })
    }

    /// Creates the database; an existing one is left alone.
    pub fn ensure_database(&self) -> Result<(), IngestError> {
        let response = self
            .authorize(self.client.put(&self.database_url))
            .send()
            .map_err(|err| IngestError::RowStoreHttp(err.to_string()))?;
        if response.status().as_u16() == 412 {
            return Ok(());
        }
        Self::handle_status(response)?;
        Ok(())
    }

    fn bulk_docs<T: Serialize>(&self, docs: &[T]) -> Result<(), IngestError> {
        let results: Vec<BulkResult> = self
            .send(
                self.client
                    .post(format!("{}/_bulk_docs", self.database_url))
                    .json(&json!({ "docs": docs })),
            )?
            .json()
            .map_err(|err| IngestError::RowStorePayload(err.to_string()))?;
        let rejected = results
            .iter()
            .filter(|result| result.error.is_some())
            .collect::<Vec<_>>();
        if let Some(first) = rejected.first() {
            return Err(IngestError::RowStorePayload(format!(
                "{} document(s) rejected, first {}: {} {}",
                rejected.len(),
                first.id.as_deref().unwrap_or("?"),
                first.error.as_deref().unwrap_or_default(),
                first.reason.as_deref().unwrap_or_default()
            )));
        }
        Ok(())
    }

    fn find_all(&self, selector: Value, fields: Option<&[&str]>) -> Result<Vec<Value>, IngestError> {
        let mut docs = Vec::new();
        let mut bookmark: Option<String> = None;
        loop {
            let mut body = json!({ "selector": &selector, "limit": self.page_size });
            if let Some(fields) = fields {
                body["fields"] = json!(fields);
            }
            if let Some(bookmark) = &bookmark {
                body["bookmark"] = json!(bookmark);
            }
            let page: FindResponse = self
                .send(
                    self.client
                        .post(format!("{}/_find", self.database_url))
                        .json(&body),
                )?
                .json()
                .map_err(|err| IngestError::RowStorePayload(err.to_string()))?;
            let count = page.docs.len();
            docs.extend(page.docs);
            if count < self.page_size || page.bookmark.is_none() {
                break;
            }
            bookmark = page.bookmark;
        }
        Ok(docs)
    }
}

impl RowStore for CouchRowStore {
    fn bulk_add(&self, records: &[SampleBatchRecord]) -> Result<(), IngestError> {
        self.bulk_docs(records)?;
        debug!(records = records.len(), "sent bulk docs");
        Ok(())
    }

    fn find_by_filename(&self, filename: &str) -> Result<Vec<SampleBatchRecord>, IngestError> {
        self.find_all(json!({ "meta.filename": filename }), None)?
            .into_iter()
            .map(|doc| {
                serde_json::from_value(doc)
                    .map_err(|err| IngestError::RowStorePayload(err.to_string()))
            })
            .collect()
    }

    fn delete_by_filename(&self, filename: &str) -> Result<usize, IngestError> {
        let records = self.find_by_filename(filename)?;
        let tombstones = records
            .iter()
            .filter_map(|record| {
                Some(Tombstone {
                    id: record.id.as_deref()?,
                    rev: record.rev.as_deref()?,
                    deleted: true,
                })
            })
            .collect::<Vec<_>>();
        for chunk in tombstones.chunks(self.page_size) {
            self.bulk_docs(chunk)?;
        }
        Ok(tombstones.len())
    }

    fn filenames(&self) -> Result<Vec<String>, IngestError> {
        let docs = self.find_all(
            json!({ "meta.filename": { "$exists": true } }),
            Some(&["meta.filename"][..]),
        )?;
        let names = docs
            .iter()
            .filter_map(|doc| doc.pointer("/meta/filename").and_then(Value::as_str))
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        Ok(names.into_iter().collect())
    }
}
