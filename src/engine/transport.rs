use super::download::{Downloader, ProgressSink};
use crate::model::BuildDescriptor;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Chunk size for copying builds off the mirror (64 KB)
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Copies builds from a mirror on the local filesystem (plain paths or `file://` URLs).
#[derive(Debug, Clone, Default)]
pub struct LocalDownloader;

fn source_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

#[async_trait]
impl Downloader for LocalDownloader {
    async fn fetch(
        &self,
        build: &BuildDescriptor,
        partial: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let src = source_path(&build.url);
        let mut input = tokio::fs::File::open(&src)
            .await
            .with_context(|| format!("open build {}", src.display()))?;
        let total = input
            .metadata()
            .await
            .with_context(|| format!("stat build {}", src.display()))?
            .len();
        let mut output = tokio::fs::File::create(partial)
            .await
            .with_context(|| format!("create {}", partial.display()))?;

        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut current = 0u64;
        progress.report(current, total);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let n = input.read(&mut buf).await.context("read build")?;
            if n == 0 {
                break;
            }
            output
                .write_all(&buf[..n])
                .await
                .with_context(|| format!("write {}", partial.display()))?;
            current += n as u64;
            progress.report(current, total);
        }
        output.flush().await.context("flush download")?;
        Ok(())
    }
}
