//! Streaming chat response driver.
//!
//! Feeds an HTTP response body, or any chunk stream, through an
//! [`EnvelopeDecoder`] and collects the visible prose and the envelopes.

use std::fmt::Display;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde::Serialize;
use tracing::{debug, info};

use crate::envelope::{Envelope, EnvelopeDecoder};
use crate::error::{Result, StreamError};

pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatTranscript {
    pub visible_text: String,
    pub envelopes: Vec<Envelope>,
}

/// Drain `chunks` through `decoder`, finalizing it once the stream ends.
///
/// On a read error the decoder is left unfinalized and holds whatever was pushed
/// so far.
pub async fn decode_chunk_stream<S, B, E>(
    chunks: S,
    decoder: &mut EnvelopeDecoder,
) -> Result<Vec<Envelope>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut envelopes = Vec::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|error| StreamError::Read(error.to_string()))?;
        envelopes.extend(decoder.push(chunk.as_ref()));
    }
    decoder.finalize();
    Ok(envelopes)
}

#[derive(Debug, Clone)]
pub struct ChatStreamClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl ChatStreamClient {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: DEFAULT_CHAT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// POST `body` to `url` and decode the streamed response.
    pub async fn stream<T>(
        &self,
        url: &str,
        body: &T,
        mut decoder: EnvelopeDecoder,
    ) -> Result<ChatTranscript>
    where
        T: Serialize + ?Sized,
    {
        let response = self
            .http
            .post(url)
            .header(ACCEPT, "text/plain, application/x-ndjson")
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                body,
            });
        }
        debug!(url, "chat stream opened");

        let envelopes = decode_chunk_stream(response.bytes_stream(), &mut decoder).await?;
        info!(
            url,
            envelopes = envelopes.len(),
            visible_bytes = decoder.visible_text().len(),
            "chat stream finished"
        );
        Ok(ChatTranscript {
            visible_text: decoder.into_visible_text(),
            envelopes,
        })
    }
}

impl Default for ChatStreamClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}
