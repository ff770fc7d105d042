//! Stdin source: newline-delimited JSON messages, for local runs.

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::channels::{IngestSource, MessageStream};
use crate::error::IngestError;

/// Reads one JSON message per line from stdin.
pub struct StdinSource;

impl StdinSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestSource for StdinSource {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn connect(&self) -> Result<MessageStream, IngestError> {
        Ok(line_stream("stdin", tokio::io::stdin()))
    }
}

/// Turn a reader into a stream of non-empty lines.
///
/// A read error yields one `Disconnected` item; EOF ends the stream.
pub(crate) fn line_stream<R>(name: &str, reader: R) -> MessageStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let name = name.to_string();

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(line.as_bytes().to_vec())).is_err() {
                        break;
                    }
                }
                Ok(None) => break, // EOF
                Err(e) => {
                    let _ = tx.send(Err(IngestError::Disconnected {
                        name: name.clone(),
                        reason: e.to_string(),
                    }));
                    break;
                }
            }
        }
    });

    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    Box::pin(stream)
}
