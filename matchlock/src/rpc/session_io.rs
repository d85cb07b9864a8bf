//! Per-session stdin/stdout/resize plumbing for `exec_pipe`/`exec_tty`
//!: "stdin pump, stdout delivery, and the RPC call future
//! run in separate tasks sharing bounded channels." Everything here is
//! keyed by the owning request's numeric `id` so a later notification
//! (`exec_pipe.stdin`, `exec_tty.resize`, ...) can find the right session.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::vmm::ResizeEvent;

const STDIN_CHANNEL_CAPACITY: usize = 64;
const STDIN_DUPLEX_BUFFER: usize = 64 * 1024;

pub enum SessionInput {
    Data(Vec<u8>),
    Eof,
}

/// Bridges `exec_pipe.stdin`/`.stdin_eof` (or `exec_tty.stdin`/`.stdin_eof`)
/// notifications into an `AsyncRead` the `Machine` trait can consume.
/// Dropping the duplex write half on `Eof` (or on sender disconnect) is
/// what surfaces EOF to the reader side.
pub fn stdin_bridge() -> (mpsc::Sender<SessionInput>, Box<dyn AsyncRead + Unpin + Send>) {
    let (tx, mut rx) = mpsc::channel::<SessionInput>(STDIN_CHANNEL_CAPACITY);
    let (read_half, mut write_half): (DuplexStream, DuplexStream) = tokio::io::duplex(STDIN_DUPLEX_BUFFER);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                SessionInput::Data(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                SessionInput::Eof => break,
            }
        }
        // write_half drops here, closing the duplex and surfacing EOF.
    });

    (tx, Box::new(read_half))
}

/// Forwards bytes written by `Machine::exec_interactive`'s `stdout` sink to
/// an unbounded channel a separate task drains into RPC notifications --
/// `poll_write` never blocks, matching the non-blocking pump style used
/// elsewhere in this crate (`pump_to_channel`).
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelWriter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "notification channel closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Resize-event coalescing. `push`
/// always just overwrites the pending slot; the forwarder task only ever
/// sees the most recent value by the time it gets to send.
pub struct ResizeCoalescer {
    pending: Mutex<Option<ResizeEvent>>,
    notify: Notify,
}

impl ResizeCoalescer {
    /// Spawns the forwarder and returns `(coalescer, receiver-for-Machine)`.
    pub fn spawn() -> (std::sync::Arc<Self>, mpsc::Receiver<ResizeEvent>) {
        let this = std::sync::Arc::new(Self {
            pending: Mutex::new(None),
            notify: Notify::new(),
        });
        let (tx, rx) = mpsc::channel(1);

        let worker = this.clone();
        tokio::spawn(async move {
            loop {
                worker.notify.notified().await;
                let next = worker.pending.lock().await.take();
                if let Some(event) = next {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        (this, rx)
    }

    pub async fn push(&self, event: ResizeEvent) {
        *self.pending.lock().await = Some(event);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn stdin_bridge_delivers_data_then_eof() {
        let (tx, mut reader) = stdin_bridge();
        tx.send(SessionInput::Data(b"hello".to_vec())).await.unwrap();
        tx.send(SessionInput::Eof).await.unwrap();
        drop(tx);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn stdin_bridge_eof_on_sender_drop_without_explicit_eof() {
        let (tx, mut reader) = stdin_bridge();
        tx.send(SessionInput::Data(b"partial".to_vec())).await.unwrap();
        drop(tx);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"partial");
    }

    #[tokio::test]
    async fn channel_writer_forwards_writes() {
        let (mut writer, mut rx) = ChannelWriter::new();
        writer.write_all(b"chunk").await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, b"chunk");
    }

    #[tokio::test]
    async fn resize_coalescer_drops_intermediate_events_when_forwarder_is_behind() {
        let (coalescer, mut rx) = ResizeCoalescer::spawn();
        coalescer.push(ResizeEvent { rows: 10, cols: 20 }).await;
        coalescer.push(ResizeEvent { rows: 11, cols: 21 }).await;
        coalescer.push(ResizeEvent { rows: 12, cols: 22 }).await;

        let first = rx.recv().await.unwrap();
        assert_eq!((first.rows, first.cols), (12, 22));
    }
}
