use anyhow::{Context, Result};
use async_trait::async_trait;
use playtrace_core::FinishedSessionRecord;
use playtrace_engine::SessionSink;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};

/// One JSON object per finished session, newline separated.
pub struct JsonLinesSink<W> {
    out: W,
}

impl JsonLinesSink<Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W> SessionSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write(&mut self, record: &FinishedSessionRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("failed to encode record")?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.out.flush().await?;
        Ok(())
    }
}
