//! Archive acquisition and chunk orchestration
//!
//! The unified archive is published behind a Google-Drive-style download
//! URL. Files this large cannot be virus-scanned, so the first request
//! returns an HTML interstitial carrying a hidden form; the real download
//! needs the form's `id`, `export`, `confirm` and `uuid` fields echoed
//! back. A corrupt download is deleted and refetched up to three times.

use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{chunker, CsvPricing, PairWindow, CHUNKING_THREADS};
use crate::error::{Result, TaxGraphError};

// Initial download endpoint; big files answer with the interstitial.
const ARCHIVE_QUERY_URL: &str = "https://docs.google.com/uc";

// Download endpoint the interstitial form posts to.
const ARCHIVE_DOWNLOAD_URL: &str = "https://drive.usercontent.google.com/download";

// File id of the unified archive; rotates when a new quarter is published.
const ARCHIVE_FILE_ID: &str = "11WtjXA9kvVYV9KDoebGV5U75dmcA3bJa";

const INTERSTITIAL_MARKER: &str = "Google Drive - Virus scan warning";
const DOWNLOAD_PROMPT: &str = "Do you want to download the file now?[yn]";
const DELETE_PROMPT: &str = "Do you want to delete the file now?[yn]";
const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

static FORM_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r#"name="id"\s+value="([^"]+)""#).unwrap());
static FORM_EXPORT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"name="export"\s+value="([^"]+)""#).unwrap());
static FORM_CONFIRM: Lazy<Regex> = Lazy::new(|| Regex::new(r#"name="confirm"\s+value="([^"]+)""#).unwrap());
static FORM_UUID: Lazy<Regex> = Lazy::new(|| Regex::new(r#"name="uuid"\s+value="([^"]+)""#).unwrap());

/// The four hidden form fields the interstitial carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterstitialForm {
    pub id: String,
    pub export: String,
    pub confirm: String,
    pub uuid: String,
}

/// Harvest the hidden download form from the interstitial HTML. `None`
/// when any field is missing, which means the page layout changed.
pub(crate) fn parse_interstitial(html: &str) -> Option<InterstitialForm> {
    let capture = |re: &Regex| re.captures(html).map(|c| c[1].to_string());
    Some(InterstitialForm {
        id: capture(&FORM_ID)?,
        export: capture(&FORM_EXPORT)?,
        confirm: capture(&FORM_CONFIRM)?,
        uuid: capture(&FORM_UUID)?,
    })
}

impl CsvPricing {
    /// Chunk every archive entry for the pair. Returns `false` when the
    /// pair is not in the archive (or the archive is absent and the user
    /// declined the download).
    pub(crate) async fn unzip_and_chunk(&mut self, base_asset: &str, quote_asset: &str, all_bars: bool) -> Result<bool> {
        if !self.archive_path.exists() {
            info!("In order to provide accurate pricing, a large (4.1+ gb) zipfile needs to be downloaded.");
            if self.force_download || (self.confirm)(DOWNLOAD_PROMPT) {
                self.download_archive().await?;
            } else {
                return Ok(false);
            }
        }

        info!("Attempting to retrieve {base_asset}{quote_asset} pair from the unified CSV archive.");
        let mut successful = false;
        for _ in 0..2 {
            match self.read_pair_entries(base_asset, quote_asset, all_bars).await {
                Ok(Some(csv_files)) => {
                    let windows = self.chunk_files(csv_files).await?;
                    for (key, window) in windows {
                        self.cached_pairs.insert(key, window);
                    }
                    successful = true;
                    break;
                }
                Ok(None) => {
                    debug!("Market {base_asset}{quote_asset} not found in archive. Skipping file read.");
                    return Ok(false);
                }
                Err(_) => {
                    info!("Corrupt unified CSV file found, deleting and trying again.");
                    self.remove_archive();
                    if self.force_download || (self.confirm)(DOWNLOAD_PROMPT) {
                        self.download_archive().await?;
                    }
                }
            }
        }

        if !successful {
            return Err(TaxGraphError::runtime(
                "CSV file is either corrupt or not available. Giving up.",
            ));
        }

        self.save_pair_index()?;
        self.unchunked_assets.remove(base_asset);
        debug!("Leftover assets: {:?}", self.unchunked_assets);
        if self.unchunked_assets.is_empty() {
            info!(
                "All of the CSV files for your assets have been processed. You can probably safely delete \
                 the master CSV file located at {:?}. However, if you add assets later, you will need to \
                 re-download the file.",
                self.archive_path
            );
            if (self.confirm)(DELETE_PROMPT) {
                self.remove_archive();
            }
        }

        Ok(true)
    }

    // Read the CSV text of every archive entry matching the pair (every
    // entry of the base asset for bundle queries, since the optimizer will
    // want the sibling quotes too). `None` when nothing matches.
    async fn read_pair_entries(
        &self,
        base_asset: &str,
        quote_asset: &str,
        all_bars: bool,
    ) -> Result<Option<Vec<(String, String)>>> {
        let archive_path = self.archive_path.clone();
        let prefix = if all_bars {
            base_asset.to_string()
        } else {
            format!("{base_asset}{quote_asset}_")
        };
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<(String, String)>>> {
            let file = std::fs::File::open(&archive_path)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| TaxGraphError::runtime(format!("unreadable archive {archive_path:?}: {e}")))?;
            let matching: Vec<String> = archive
                .file_names()
                .filter(|name| name.starts_with(&prefix))
                .map(str::to_string)
                .collect();
            if matching.is_empty() {
                return Ok(None);
            }
            let mut csv_files = Vec::with_capacity(matching.len());
            for name in matching {
                debug!("Reading in file {name} for CSV pricing.");
                let mut entry = archive
                    .by_name(&name)
                    .map_err(|e| TaxGraphError::runtime(format!("corrupt archive entry {name}: {e}")))?;
                let mut contents = String::new();
                std::io::Read::read_to_string(&mut entry, &mut contents)?;
                csv_files.push((name, contents));
            }
            Ok(Some(csv_files))
        })
        .await
        .map_err(|e| TaxGraphError::runtime(format!("archive reader task failed: {e}")))?
    }

    // Rechunk the extracted CSV texts on a small blocking pool.
    async fn chunk_files(&self, csv_files: Vec<(String, String)>) -> Result<HashMap<String, PairWindow>> {
        let cache_dir = self.cache_dir.clone();
        let results: Vec<Result<HashMap<String, PairWindow>>> = futures::stream::iter(csv_files)
            .map(|(file_name, contents)| {
                let cache_dir = cache_dir.clone();
                async move {
                    tokio::task::spawn_blocking(move || chunker::chunk_csv(&file_name, &contents, &cache_dir))
                        .await
                        .map_err(|e| TaxGraphError::runtime(format!("chunking task failed: {e}")))?
                }
            })
            .buffer_unordered(CHUNKING_THREADS)
            .collect()
            .await;

        let mut windows = HashMap::new();
        for result in results {
            windows.extend(result?);
        }
        Ok(windows)
    }

    // Download the archive, working through the interstitial when one is
    // served, and validate the result is a readable zip.
    pub(crate) async fn download_archive(&self) -> Result<()> {
        if let Some(parent) = self.archive_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut attempts: u32 = 0;
        loop {
            let response = self
                .http
                .get(ARCHIVE_QUERY_URL)
                .query(&[("export", "download"), ("confirm", "1"), ("id", ARCHIVE_FILE_ID)])
                .send()
                .await?;

            let is_html = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains("text/html"));

            if is_html {
                let html = response.text().await?;
                if !html.contains(INTERSTITIAL_MARKER) {
                    return Err(TaxGraphError::runtime(
                        "archive endpoint returned HTML without the virus-scan form",
                    ));
                }
                let form = parse_interstitial(&html).ok_or_else(|| {
                    TaxGraphError::runtime("failed to extract download parameters from interstitial HTML")
                })?;
                info!(
                    "Downloading the unified CSV from {ARCHIVE_DOWNLOAD_URL}?id={}&export={}&confirm={}&uuid={}",
                    form.id, form.export, form.confirm, form.uuid
                );
                let download = self
                    .http
                    .get(ARCHIVE_DOWNLOAD_URL)
                    .query(&[
                        ("id", form.id.as_str()),
                        ("export", form.export.as_str()),
                        ("confirm", form.confirm.as_str()),
                        ("uuid", form.uuid.as_str()),
                    ])
                    .send()
                    .await?;
                stream_to_file(download, &self.archive_path).await?;
            } else {
                stream_to_file(response, &self.archive_path).await?;
            }

            if self.archive_is_valid().await {
                return Ok(());
            }
            attempts += 1;
            if attempts >= MAX_DOWNLOAD_ATTEMPTS {
                return Err(TaxGraphError::runtime("Invalid zipfile. Giving up. Try again later."));
            }
            self.remove_archive();
            info!("Downloaded file is invalid, trying to download again.");
        }
    }

    async fn archive_is_valid(&self) -> bool {
        let path = self.archive_path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::open(&path)
                .ok()
                .and_then(|file| zip::ZipArchive::new(file).ok())
                .is_some()
        })
        .await
        .unwrap_or(false)
    }

    pub(crate) fn remove_archive(&self) {
        match std::fs::remove_file(&self.archive_path) {
            Ok(()) => info!("{:?} has been safely deleted.", self.archive_path),
            Err(_) => info!("File {:?} not found.", self.archive_path),
        }
    }
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}
