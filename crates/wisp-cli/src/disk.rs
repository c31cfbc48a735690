use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};
use wisp_transfer::files::DEFAULT_MIME;
use wisp_transfer::{FileSink, FileSource};
use wisp_types::FileDescriptor;

/// A file on disk offered by the sender. Reads seek on one shared handle.
pub struct DiskFile {
    descriptor: FileDescriptor,
    file: Mutex<fs::File>,
}

impl DiskFile {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        Ok(DiskFile {
            descriptor: FileDescriptor {
                mime: guess_mime(&name).to_string(),
                name,
                size: metadata.len(),
            },
            file: Mutex::new(file),
        })
    }
}

impl FileSource for DiskFile {
    fn descriptor(&self) -> FileDescriptor {
        self.descriptor.clone()
    }

    fn read_range(&self, offset: u64, len: usize) -> BoxFuture<'_, io::Result<Bytes>> {
        Box::pin(async move {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
    }
}

fn guess_mime(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") | Some("md") => "text/plain",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("mp4") => "video/mp4",
        _ => DEFAULT_MIME,
    }
}

/// Writes received files into one directory, under their announced names.
pub struct DirectorySink {
    dir: PathBuf,
    current: Option<(u32, PathBuf, fs::File)>,
}

impl DirectorySink {
    pub async fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        info!("Writing received files to {}", dir.display());
        Ok(DirectorySink {
            dir: dir.to_path_buf(),
            current: None,
        })
    }
}

impl FileSink for DirectorySink {
    fn begin_file<'a>(&'a mut self, index: u32, file: &'a FileDescriptor) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let path = self.dir.join(safe_file_name(&file.name, index));
            let handle = fs::File::create(&path).await?;
            debug!("file {index}: writing {} bytes to {}", file.size, path.display());
            self.current = Some((index, path, handle));
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let Some((_, _, handle)) = self.current.as_mut() else {
                return Err(io::Error::other("write before begin_file"));
            };
            handle.write_all(&data).await
        })
    }

    fn finish_file(&mut self, index: u32) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            match self.current.take() {
                Some((current, path, mut handle)) if current == index => {
                    handle.flush().await?;
                    handle.sync_all().await?;
                    info!("Saved {}", path.display());
                    Ok(())
                }
                other => {
                    self.current = other;
                    Err(io::Error::other(format!("finish_file({index}) without matching begin_file")))
                }
            }
        })
    }
}

/// The peer chooses the name; keep only a plain final component.
fn safe_file_name(name: &str, index: u32) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("file-{index}")
    } else {
        cleaned.to_string()
    }
}
