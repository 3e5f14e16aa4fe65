//! Payload fetching and archive extraction for server provisioning.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{EngineError, Result};
use crate::paths::normalize_rel_path;

// Hard safety limit: 8GiB.
const MAX_DOWNLOAD_BYTES: u64 = 8 * 1024 * 1024 * 1024;
const PROGRESS_LOG_EVERY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    pub bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("steward-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::download("", format!("build http client: {e}")))?;
        Ok(Self { client })
    }

    /// Streams `url` into `dest`. The body lands in a temp file that is renamed into place
    /// only once complete.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<DownloadReport> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let started = Instant::now();
        tracing::info!(url, dest = %dest.display(), "download started");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::download(url, e))?
            .error_for_status()
            .map_err(|e| EngineError::download(url, e))?;

        let tmp = part_path(dest);
        let mut f = tokio::fs::File::create(&tmp).await?;
        let mut total: u64 = 0;
        let mut next_report = PROGRESS_LOG_EVERY_BYTES;
        let mut stream = resp.bytes_stream();

        let streamed: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| EngineError::download(url, e))?;
                total = total.saturating_add(chunk.len() as u64);
                if total > MAX_DOWNLOAD_BYTES {
                    return Err(EngineError::download(url, "download too large"));
                }
                f.write_all(&chunk).await?;
                if total >= next_report {
                    tracing::info!(url, bytes = total, "download progress");
                    next_report = next_report.saturating_add(PROGRESS_LOG_EVERY_BYTES);
                }
            }
            f.flush().await?;
            Ok(())
        }
        .await;
        drop(f);

        if let Err(err) = streamed {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        tokio::fs::rename(&tmp, dest).await?;

        let report = DownloadReport {
            bytes: total,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            url,
            bytes = report.bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "download finished"
        );
        Ok(report)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Extracts every entry of a zip archive into `dest_dir`. Returns the number of files written.
///
/// All entry names are checked before anything is written: one absolute or escaping entry
/// fails the whole archive.
pub async fn unpack(archive: &Path, dest_dir: &Path) -> Result<usize> {
    let archive = archive.to_path_buf();
    let dest = dest_dir.to_path_buf();
    let task_archive = archive.clone();
    let count = tokio::task::spawn_blocking(move || extract_zip_safely(&task_archive, &dest))
        .await
        .map_err(|e| EngineError::unpack(&archive, format!("unpack task failed: {e}")))??;
    tracing::info!(
        archive = %archive.display(),
        dest = %dest_dir.display(),
        files = count,
        "archive unpacked"
    );
    Ok(count)
}

struct PlannedEntry {
    index: usize,
    rel: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
}

fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> Result<usize> {
    let f = fs::File::open(zip_path).map_err(|e| EngineError::unpack(zip_path, e))?;
    let mut archive = zip::ZipArchive::new(f).map_err(|e| EngineError::unpack(zip_path, e))?;

    let mut plan = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive
            .by_index_raw(i)
            .map_err(|e| EngineError::unpack(zip_path, e))?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed)
            .map_err(|e| EngineError::unpack(zip_path, format!("entry {name:?}: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        plan.push(PlannedEntry {
            index: i,
            rel,
            is_dir: file.is_dir(),
            mode: file.unix_mode(),
        });
    }

    fs::create_dir_all(out_dir)?;
    let mut written = 0;
    for entry in plan {
        let out_path = out_dir.join(&entry.rel);
        if entry.is_dir {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = archive
            .by_index(entry.index)
            .map_err(|e| EngineError::unpack(zip_path, e))?;
        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out).map_err(|e| EngineError::unpack(zip_path, e))?;

        #[cfg(unix)]
        if let Some(mode) = entry.mode {
            use std::os::unix::fs::PermissionsExt;
            // Keep the executable bits of launch scripts.
            let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777));
        }
        written += 1;
    }
    Ok(written)
}
