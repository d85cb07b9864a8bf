//! Serial writer discipline: "a single mutex serializes every
//! write to the output channel; response and notification framing must
//! never interleave bytes." Every response and notification, from whatever
//! task produced it, funnels through one `write_line` call.

use matchlock_shared::{MatchlockError, MatchlockResult};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::protocol::OutboundMessage;

pub struct OutputWriter<W> {
    sink: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> OutputWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink: Mutex::new(sink) }
    }

    /// Serializes `msg` and writes it as one line. Held across both the
    /// serialize and the write so two concurrent callers can never
    /// interleave partial frames.
    pub async fn send(&self, msg: impl Into<OutboundMessage>) -> MatchlockResult<()> {
        let msg = msg.into();
        let mut line = serde_json::to_vec(&msg).map_err(|e| MatchlockError::Rpc(format!("serializing outbound message: {e}")))?;
        line.push(b'\n');

        let mut sink = self.sink.lock().await;
        sink.write_all(&line)
            .await
            .map_err(|e| MatchlockError::Rpc(format!("writing RPC output: {e}")))?;
        sink.flush()
            .await
            .map_err(|e| MatchlockError::Rpc(format!("flushing RPC output: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{RpcNotification, RpcResponse};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_sends_never_interleave_lines() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let writer = Arc::new(OutputWriter::new(client));

        let mut handles = Vec::new();
        for i in 0..50 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                writer
                    .send(RpcResponse::success(i, serde_json::json!({ "n": i })))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(writer);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let _ = server.read_to_end(&mut buf).await;
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 50);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).expect("each line is one complete JSON object");
        }
    }

    #[tokio::test]
    async fn notification_serializes_without_id_field() {
        let (client, mut server) = tokio::io::duplex(4096);
        let writer = OutputWriter::new(client);
        writer
            .send(RpcNotification::new("event", serde_json::json!({"kind": "policy_denied"})))
            .await
            .unwrap();
        drop(writer);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let _ = server.read_to_end(&mut buf).await;
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["method"], "event");
        assert!(value.get("id").is_none());
    }
}
