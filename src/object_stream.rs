//! Length-prefixed JSON object stream over any duplex byte transport.
//!
//! A reader task owns the read half and feeds every chunk into an [`Inbox`]:
//! an append-only buffer, a queue of finished results and a queue of parked
//! consumers. Results finish strictly in arrival order and are matched to
//! consumers in the order they asked, so a consumer always gets the oldest
//! result nobody else has taken.
//!
//! A consumer whose receive future was dropped is skipped; the result goes
//! to the next live consumer in line, or waits for the next receive.

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::BackupError;
use crate::protocol_core::{decode_payload, encode_message, parse_length_prefix, LengthPrefix};

type Outcome = Result<Value, BackupError>;

const READ_CHUNK: usize = 64 * 1024;

enum Claim {
    Ready(Outcome),
    Wait(oneshot::Receiver<Outcome>),
    Closed,
}

/// Receive-side reassembly state.
///
/// `waiters` is only non-empty while `ready` is empty.
#[derive(Default)]
struct Inbox {
    buffer: BytesMut,
    /// Payload length of the frame being parsed, once its prefix is read
    expected_len: Option<usize>,
    /// Finished results nobody has claimed yet, oldest first
    ready: VecDeque<Outcome>,
    /// Parked consumers, oldest first
    waiters: VecDeque<oneshot::Sender<Outcome>>,
    terminated: bool,
}

impl Inbox {
    fn feed(&mut self, chunk: &[u8]) {
        if self.terminated {
            return;
        }
        self.buffer.extend_from_slice(chunk);
        while let Some(outcome) = self.advance() {
            self.deliver(outcome);
        }
    }

    /// Try to complete the frame being parsed
    fn advance(&mut self) -> Option<Outcome> {
        let len = match self.expected_len {
            Some(len) => len,
            None if self.buffer.is_empty() => return None,
            None => match parse_length_prefix(&self.buffer) {
                LengthPrefix::Incomplete => return None,
                LengthPrefix::Invalid(reason) => {
                    // No way to find the next frame boundary; drop what we have
                    debug!(%reason, discarded = self.buffer.len(), "unframeable input");
                    self.buffer.clear();
                    return Some(Err(BackupError::Parse(reason)));
                }
                LengthPrefix::Complete { len, digits } => {
                    let _ = self.buffer.split_to(digits);
                    self.expected_len = Some(len);
                    len
                }
            },
        };
        if self.buffer.len() < len {
            return None;
        }
        self.expected_len = None;
        let payload = self.buffer.split_to(len);
        trace!(len, "frame complete");
        Some(decode_payload(&payload))
    }

    /// Hand a finished result to the oldest live consumer, or queue it
    fn deliver(&mut self, mut outcome: Outcome) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(outcome) {
                Ok(()) => return,
                // Consumer went away; the next one in line gets it
                Err(back) => outcome = back,
            }
        }
        self.ready.push_back(outcome);
    }

    fn claim(&mut self) -> Claim {
        if let Some(outcome) = self.ready.pop_front() {
            return Claim::Ready(outcome);
        }
        if self.terminated {
            return Claim::Closed;
        }
        self.waiters.retain(|w| !w.is_closed());
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        Claim::Wait(rx)
    }

    /// Stop accepting input. `head_error` goes to the oldest consumer (or is
    /// queued for the next receive); every other waiter is rejected with
    /// `Closed`. Finished results stay claimable.
    fn terminate(&mut self, head_error: Option<BackupError>) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.buffer.clear();
        self.expected_len = None;

        if let Some(err) = head_error {
            self.deliver(Err(err));
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(BackupError::Closed));
        }
    }

    /// Peer closed its write side
    fn finish(&mut self) {
        if !self.buffer.is_empty() || self.expected_len.is_some() {
            self.terminate(Some(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-message",
            ))));
        } else {
            self.terminate(None);
        }
    }
}

async fn read_loop<R>(mut reader: R, inbox: Arc<Mutex<Inbox>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                trace!("peer closed stream");
                inbox.lock().finish();
                break;
            }
            Ok(n) => inbox.lock().feed(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "stream read failed");
                inbox.lock().terminate(Some(BackupError::Io(e)));
                break;
            }
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Sends and receives discrete JSON objects over a byte transport.
///
/// Must be created inside a tokio runtime: construction spawns the reader task.
pub struct ObjectStream {
    inbox: Arc<Mutex<Inbox>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    reader: JoinHandle<()>,
}

impl ObjectStream {
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let inbox = Arc::new(Mutex::new(Inbox::default()));
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&inbox)));
        ObjectStream {
            inbox,
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            reader,
        }
    }

    /// Serialize and write one message. Nothing is written if `msg` is absent
    /// (serializes to `null`) or is not a JSON object.
    pub async fn send_message<M>(&self, msg: &M) -> Result<(), BackupError>
    where
        M: Serialize + ?Sized,
    {
        let value = serde_json::to_value(msg)
            .map_err(|e| BackupError::InvalidArgument(e.to_string()))?;
        let frame = encode_message(&value)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BackupError::Closed)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Next message in arrival order
    pub async fn receive_message(&self) -> Result<Value, BackupError> {
        let claim = self.inbox.lock().claim();
        match claim {
            Claim::Ready(outcome) => outcome,
            Claim::Closed => Err(BackupError::Closed),
            Claim::Wait(rx) => rx.await.unwrap_or(Err(BackupError::Closed)),
        }
    }

    /// Release the transport and reject pending receives. Idempotent.
    pub async fn close(&self) {
        self.inbox.lock().terminate(None);
        self.reader.abort();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// True once the stream was closed locally or the peer went away
    pub fn is_closed(&self) -> bool {
        self.inbox.lock().terminated
    }
}

impl Drop for ObjectStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
