use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::wsproto::FileMeta;

/// Destination for the bytes of one received file.
pub trait Sink: Send {
    fn write(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    /// Flush and finalize. Calling it a second time is a no-op.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Discard whatever was written so far.
    fn abort(&mut self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

/// Opens a [`Sink`] for each incoming file.
pub trait SinkFactory: Send + Sync {
    fn open<'a>(&'a self, meta: &'a FileMeta) -> BoxFuture<'a, Result<Box<dyn Sink>>>;
}

/// Writes received files into a download directory.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SinkFactory for FileSinkFactory {
    fn open<'a>(&'a self, meta: &'a FileMeta) -> BoxFuture<'a, Result<Box<dyn Sink>>> {
        async move {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("create {}", self.dir.display()))?;
            let (path, file) = create_unique(&self.dir, &sanitize_file_name(&meta.name)).await?;
            crate::logging::info_kv(
                "receiving file",
                &[("path", &path.display().to_string()), ("size", &meta.size.to_string())],
            );
            Ok(Box::new(FileSink {
                path,
                file: Some(BufWriter::new(file)),
            }) as Box<dyn Sink>)
        }
        .boxed()
    }
}

pub struct FileSink {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn write(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        async move {
            let FileSink { path, file } = self;
            let file = file
                .as_mut()
                .with_context(|| format!("{} already closed", path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("write {}", path.display()))
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            if let Some(mut file) = self.file.take() {
                file.flush().await?;
                file.into_inner()
                    .sync_all()
                    .await
                    .with_context(|| format!("sync {}", self.path.display()))?;
            }
            Ok(())
        }
        .boxed()
    }

    fn abort(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if self.file.take().is_some() {
                let _ = tokio::fs::remove_file(&self.path).await;
            }
        }
        .boxed()
    }
}

/// Strip directories and characters that are unsafe in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `name`, then `name (1)`, `name (2)`, ... until one does not exist yet.
async fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File)> {
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    for n in 0u32..10_000 {
        let candidate = if n == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{stem} ({n}){ext}"))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", candidate.display()))
            }
        }
    }
    anyhow::bail!("no free file name for {name} in {}", dir.display())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub bytes: Vec<u8>,
}

/// Keeps completed files in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    done: Arc<Mutex<Vec<ReceivedFile>>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files that were closed successfully, in completion order.
    pub fn received(&self) -> Vec<ReceivedFile> {
        match self.done.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open<'a>(&'a self, meta: &'a FileMeta) -> BoxFuture<'a, Result<Box<dyn Sink>>> {
        let sink = MemorySink {
            meta: meta.clone(),
            buf: Vec::with_capacity(meta.size.min(64 * 1024 * 1024) as usize),
            done: Some(self.done.clone()),
        };
        async move { Ok(Box::new(sink) as Box<dyn Sink>) }.boxed()
    }
}

pub struct MemorySink {
    meta: FileMeta,
    buf: Vec<u8>,
    done: Option<Arc<Mutex<Vec<ReceivedFile>>>>,
}

impl Sink for MemorySink {
    fn write(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        let res = if self.done.is_some() {
            self.buf.extend_from_slice(&bytes);
            Ok(())
        } else {
            Err(anyhow::anyhow!("{} already closed", self.meta.name))
        };
        async move { res }.boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        if let Some(done) = self.done.take() {
            let file = ReceivedFile {
                meta: self.meta.clone(),
                bytes: std::mem::take(&mut self.buf),
            };
            match done.lock() {
                Ok(mut g) => g.push(file),
                Err(poisoned) => poisoned.into_inner().push(file),
            }
        }
        async { Ok(()) }.boxed()
    }

    fn abort(&mut self) -> BoxFuture<'_, ()> {
        self.done = None;
        self.buf.clear();
        async {}.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn meta(name: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.to_string(),
            size,
            mime_type: "application/octet-stream".to_string(),
        }
    }

    #[test]
    fn sanitize_strips_paths_and_reserved_chars() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\a?b*.txt"), "a_b_.txt");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name(""), "download");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    #[tokio::test]
    async fn file_sink_writes_and_picks_unique_names() {
        let dir = std::env::temp_dir().join(format!("mayadrop-sink-{}", Uuid::new_v4()));
        let factory = FileSinkFactory::new(&dir);

        let mut first = factory.open(&meta("report.txt", 5)).await.unwrap();
        first.write(b"hello".to_vec()).await.unwrap();
        first.close().await.unwrap();
        first.close().await.unwrap();

        let mut second = factory.open(&meta("report.txt", 3)).await.unwrap();
        second.write(b"bye".to_vec()).await.unwrap();
        second.close().await.unwrap();

        assert_eq!(std::fs::read(dir.join("report.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(dir.join("report (1).txt")).unwrap(), b"bye");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn aborted_file_sink_removes_partial_file() {
        let dir = std::env::temp_dir().join(format!("mayadrop-sink-{}", Uuid::new_v4()));
        let factory = FileSinkFactory::new(&dir);
        let mut sink = factory.open(&meta("partial.bin", 10)).await.unwrap();
        sink.write(vec![1, 2, 3]).await.unwrap();
        sink.abort().await;
        assert!(!dir.join("partial.bin").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn memory_sink_records_only_closed_files() {
        let factory = MemorySinkFactory::new();
        let mut kept = factory.open(&meta("a", 2)).await.unwrap();
        kept.write(vec![1]).await.unwrap();
        kept.write(vec![2]).await.unwrap();
        kept.close().await.unwrap();

        let mut dropped = factory.open(&meta("b", 1)).await.unwrap();
        dropped.write(vec![9]).await.unwrap();
        dropped.abort().await;

        let got = factory.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].meta.name, "a");
        assert_eq!(got[0].bytes, vec![1, 2]);
        assert!(kept.write(vec![3]).await.is_err());
    }
}
