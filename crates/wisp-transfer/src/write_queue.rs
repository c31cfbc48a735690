/// Receiver write-through queue.
///
/// A dedicated task owns the `FileSink` and processes jobs one at a time, so
/// payload N+1 never starts writing before payload N has resolved. A
/// `chunk_ack` goes to the sender only after its payload's write succeeded.
/// The first write failure is reported once and stops the queue.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use wisp_types::{FileDescriptor, Progress, ProtocolMessage};

use crate::error::TransferError;
use crate::events::SessionEvent;
use crate::files::FileSink;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::transport::{PeerLink, send_message};

enum WriteJob {
    Begin { index: u32, file: FileDescriptor },
    Chunk { seq: u64, data: Bytes },
    Finish { index: u32 },
    Flush(oneshot::Sender<WriteTally>),
}

/// Bytes written so far, as of the last processed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteTally {
    /// Bytes of the current (or just finished) file.
    pub file_received: u64,
    pub total_received: u64,
    pub chunks: u64,
}

pub struct WriteQueue {
    jobs: mpsc::UnboundedSender<WriteJob>,
    failures: mpsc::UnboundedReceiver<TransferError>,
    task: JoinHandle<()>,
}

struct Writer {
    sink: Box<dyn FileSink>,
    link: Arc<dyn PeerLink>,
    events: mpsc::UnboundedSender<SessionEvent>,
    logger: Arc<dyn TransferLogger>,
    session_id: Uuid,
    expected_total: u64,
    tally: WriteTally,
}

impl WriteQueue {
    pub fn spawn(
        sink: Box<dyn FileSink>,
        link: Arc<dyn PeerLink>,
        events: mpsc::UnboundedSender<SessionEvent>,
        logger: Arc<dyn TransferLogger>,
        session_id: Uuid,
        expected_total: u64,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let writer = Writer {
            sink,
            link,
            events,
            logger,
            session_id,
            expected_total,
            tally: WriteTally::default(),
        };
        let task = tokio::spawn(writer.run(jobs_rx, fail_tx));
        WriteQueue {
            jobs: jobs_tx,
            failures: fail_rx,
            task,
        }
    }

    pub fn begin_file(&self, index: u32, file: FileDescriptor) {
        self.push(WriteJob::Begin { index, file });
    }

    pub fn write(&self, seq: u64, data: Bytes) {
        self.push(WriteJob::Chunk { seq, data });
    }

    pub fn finish_file(&self, index: u32) {
        self.push(WriteJob::Finish { index });
    }

    /// Wait until every job queued so far has been processed.
    pub async fn flush(&mut self) -> Result<WriteTally, TransferError> {
        let (tx, rx) = oneshot::channel();
        self.push(WriteJob::Flush(tx));
        match rx.await {
            Ok(tally) => Ok(tally),
            // The writer reports its failure before dropping the job.
            Err(_) => Err(self
                .failures
                .try_recv()
                .unwrap_or_else(|_| TransferError::Io("write queue stopped before flush".into()))),
        }
    }

    /// Resolves with the first write failure; pending forever if none occurs.
    pub async fn failed(&mut self) -> TransferError {
        match self.failures.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    fn push(&self, job: WriteJob) {
        // A stopped writer has already reported its failure.
        let _ = self.jobs.send(job);
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Writer {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<WriteJob>, failures: mpsc::UnboundedSender<TransferError>) {
        while let Some(job) = jobs.recv().await {
            if let Err(e) = self.process(job).await {
                self.log(TransferEvent::Error {
                    message: e.to_string(),
                });
                let _ = failures.send(e);
                return;
            }
        }
    }

    async fn process(&mut self, job: WriteJob) -> Result<(), TransferError> {
        match job {
            WriteJob::Begin { index, file } => {
                self.tally.file_received = 0;
                self.sink.begin_file(index, &file).await?;
            }
            WriteJob::Chunk { seq, data } => {
                let len = data.len() as u64;
                self.sink.write(data).await?;
                self.tally.file_received += len;
                self.tally.total_received += len;
                self.tally.chunks += 1;

                let ack = ProtocolMessage::ChunkAck {
                    seq,
                    received: self.tally.file_received,
                };
                if let Err(e) = send_message(self.link.as_ref(), &ack) {
                    tracing::trace!("chunk_ack {seq} not sent: {e}");
                }
                self.log(TransferEvent::ChunkWritten {
                    seq,
                    received: self.tally.file_received,
                });
                let _ = self.events.send(SessionEvent::Progress(Progress::new(
                    self.tally.total_received,
                    self.expected_total,
                )));
            }
            WriteJob::Finish { index } => {
                self.sink.finish_file(index).await?;
            }
            WriteJob::Flush(done) => {
                let _ = done.send(self.tally);
            }
        }
        Ok(())
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "receiver.writer",
            session_id: Some(self.session_id),
            event,
        });
    }
}
