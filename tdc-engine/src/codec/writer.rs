use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{LittleEndian, WriteBytesExt};
use flume::TrySendError;
use tracing::{debug, info, warn};

use crate::codec::header::{StreamHeader, FIRST_TIMESTAMP_OFFSET};
use crate::codec::records;
use crate::errors::Error;
use crate::headers::FileFormat;
use crate::Event;

/// Number of batches that can wait for the disk before new ones are dropped
pub const WRITER_QUEUE_BATCHES: usize = 256;

/// Background file writer.
///
/// Batches are handed over with [`StreamWriter::submit`], which never blocks,
/// and written by a dedicated thread. Only the initial open can fail; I/O
/// errors afterwards are logged and end the recording silently.
pub struct StreamWriter {
    path: PathBuf,
    sender: Option<flume::Sender<Arc<Vec<Event>>>>,
    handle: Option<JoinHandle<u64>>,
}

impl StreamWriter {
    /// Creates or truncates `path` and starts the writer thread.
    ///
    /// For formats with a header, `header` is written first with its format
    /// field replaced by `format`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        format: FileFormat,
        header: StreamHeader,
    ) -> Result<Self, Error> {
        if format == FileFormat::None {
            return Err(Error::InvalidParameter(String::from(
                "cannot write timestamps without a format",
            )));
        }
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);

        let header = if format.has_header() {
            let header = StreamHeader { format, ..header };
            out.write_all(&header.to_bytes())?;
            Some(header)
        } else {
            None
        };

        let (sender, receiver) = flume::bounded(WRITER_QUEUE_BATCHES);
        let thread_path = path.clone();
        let handle = std::thread::spawn(move || {
            write_loop(receiver, out, format, header.is_some(), &thread_path)
        });

        info!("writing {:?} timestamps to {}", format, path.display());
        Ok(Self {
            path,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queues a batch for writing. Returns `false` if it had to be dropped.
    pub fn submit(&self, events: Arc<Vec<Event>>) -> bool {
        match &self.sender {
            Some(sender) => match sender.try_send(events) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("writer queue full, dropping batch");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// Like [`StreamWriter::submit`], but waits for room in the queue.
    pub fn submit_wait(&self, events: Arc<Vec<Event>>) -> bool {
        match &self.sender {
            Some(sender) => sender.send(events).is_ok(),
            None => false,
        }
    }

    /// Writes out everything queued, closes the file and returns the number of
    /// records written.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        drop(self.sender.take());
        let written = match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("writer thread for {} panicked", self.path.display());
                0
            }),
            None => 0,
        };
        info!("stopped writing to {}, {} records", self.path.display(), written);
        written
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn write_loop(
    receiver: flume::Receiver<Arc<Vec<Event>>>,
    mut out: BufWriter<File>,
    format: FileFormat,
    mut needs_first_timestamp: bool,
    path: &Path,
) -> u64 {
    let mut written = 0;
    let mut failed = false;
    let mut bytes = Vec::new();

    for batch in receiver.iter() {
        if failed || batch.is_empty() {
            continue;
        }
        bytes.clear();
        let encoded = records::encode_events(format, &batch, &mut bytes);

        let result = (|| -> std::io::Result<()> {
            if let (true, Some(first)) = (needs_first_timestamp, encoded.first_time) {
                patch_first_timestamp(&mut out, first)?;
                needs_first_timestamp = false;
            }
            out.write_all(&bytes)
        })();

        match result {
            Ok(()) => written += encoded.records as u64,
            Err(e) => {
                warn!("write to {} failed, recording stopped: {}", path.display(), e);
                failed = true;
            }
        }
    }

    if let Err(e) = out.flush() {
        warn!("flushing {} failed: {}", path.display(), e);
    }
    debug!("writer thread for {} done", path.display());
    written
}

fn patch_first_timestamp(out: &mut BufWriter<File>, first: i64) -> std::io::Result<()> {
    let end = out.seek(SeekFrom::Current(0))?;
    out.seek(SeekFrom::Start(FIRST_TIMESTAMP_OFFSET))?;
    out.write_i64::<LittleEndian>(first)?;
    out.seek(SeekFrom::Start(end))?;
    Ok(())
}
