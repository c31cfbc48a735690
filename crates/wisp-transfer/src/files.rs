/// File access seams. The engine never touches a filesystem: the sender reads
/// byte ranges from a `FileSource`, the receiver writes through a `FileSink`.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use wisp_types::FileDescriptor;

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// A file the sender can slice.
pub trait FileSource: Send + Sync {
    fn descriptor(&self) -> FileDescriptor;

    /// Read `len` bytes starting at `offset`.
    fn read_range(&self, offset: u64, len: usize) -> BoxFuture<'_, io::Result<Bytes>>;
}

/// Where the receiver puts incoming files. Calls arrive strictly in order:
/// `begin_file`, the file's payloads via `write`, then `finish_file`.
pub trait FileSink: Send {
    fn begin_file<'a>(&'a mut self, index: u32, file: &'a FileDescriptor) -> BoxFuture<'a, io::Result<()>>;

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, io::Result<()>>;

    fn finish_file(&mut self, index: u32) -> BoxFuture<'_, io::Result<()>>;
}

/// In-memory file.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    descriptor: FileDescriptor,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::with_mime(name, DEFAULT_MIME, data)
    }

    pub fn with_mime(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        MemoryFile {
            descriptor: FileDescriptor {
                name: name.into(),
                size: data.len() as u64,
                mime: mime.into(),
            },
            data,
        }
    }
}

impl FileSource for MemoryFile {
    fn descriptor(&self) -> FileDescriptor {
        self.descriptor.clone()
    }

    fn read_range(&self, offset: u64, len: usize) -> BoxFuture<'_, io::Result<Bytes>> {
        let start = offset as usize;
        let result = match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(self.data.slice(start..end)),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {start}+{len} past end of {}", self.descriptor.name),
            )),
        };
        Box::pin(async move { result })
    }
}

/// A file collected by `MemorySink`.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub index: u32,
    pub descriptor: FileDescriptor,
    pub data: Bytes,
    pub finished: bool,
}

#[derive(Default)]
struct SinkState {
    files: Vec<ReceivedFile>,
    current: Option<(u32, FileDescriptor, BytesMut)>,
}

/// Collects received files in memory. Clones share the same storage, so a
/// test can keep one clone and hand the other to a session.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
    write_delay: Option<Duration>,
    active_writes: Arc<AtomicUsize>,
    max_concurrent_writes: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write take `delay`, to exercise ordering under slow storage.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Finished and in-progress files, in arrival order.
    pub fn files(&self) -> Vec<ReceivedFile> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut files = state.files.clone();
        if let Some((index, descriptor, data)) = &state.current {
            files.push(ReceivedFile {
                index: *index,
                descriptor: descriptor.clone(),
                data: Bytes::copy_from_slice(data),
                finished: false,
            });
        }
        files
    }

    /// Highest number of writes ever in progress at once.
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_concurrent_writes.load(Ordering::SeqCst)
    }
}

impl FileSink for MemorySink {
    fn begin_file<'a>(&'a mut self, index: u32, file: &'a FileDescriptor) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.current = Some((index, file.clone(), BytesMut::with_capacity(file.size as usize)));
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_writes.fetch_max(active, Ordering::SeqCst);
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            let result = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                match state.current.as_mut() {
                    Some((_, _, buf)) => {
                        buf.extend_from_slice(&data);
                        Ok(())
                    }
                    None => Err(io::Error::other("write before begin_file")),
                }
            };
            self.active_writes.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn finish_file(&mut self, index: u32) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.current.take() {
                Some((current, descriptor, data)) if current == index => {
                    state.files.push(ReceivedFile {
                        index,
                        descriptor,
                        data: data.freeze(),
                        finished: true,
                    });
                    Ok(())
                }
                other => {
                    state.current = other;
                    Err(io::Error::other(format!("finish_file({index}) without matching begin_file")))
                }
            }
        })
    }
}
