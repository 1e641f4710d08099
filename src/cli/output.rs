//! JSON Lines output of protocol messages.

use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};

use crate::models::Message;

/// Writes one JSON document per line and flushes after each, so a consumer
/// sees every acknowledgement as soon as it is produced.
pub struct MessageWriter<W> {
    inner: W,
    written: u64,
}

impl MessageWriter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub async fn write(&mut self, message: &Message) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
