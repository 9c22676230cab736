//! Byte-level framing for streamed responses. SSE bodies are split with
//! `eventsource-stream`, newline delimited JSON with a `LinesCodec`; either
//! way each fragment is handed to the backend's normalizer.

use async_stream::stream;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{StreamExt, TryStreamExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use super::normalizer::StreamNormalizer;
use crate::errors::ProviderError;
use crate::providers::base::EventStream;

/// Longest single NDJSON line accepted before the stream is failed
const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Read a `text/event-stream` body. Only the `data` payload is forwarded;
/// the normalizers read the event type from the payload itself. A `[DONE]`
/// sentinel ends the stream.
pub fn sse_stream<N>(response: reqwest::Response, mut normalizer: N) -> EventStream
where
    N: StreamNormalizer + 'static,
{
    let mut events = Box::pin(response.bytes_stream().eventsource());

    Box::pin(stream! {
        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) => event,
                Err(EventStreamError::Transport(e)) => {
                    yield Err(ProviderError::Transport(e.to_string()).into());
                    return;
                }
                Err(e) => {
                    tracing::warn!("skipping malformed sse frame: {}", e);
                    continue;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }

            match normalizer.normalize(data) {
                Ok(out) => {
                    for item in out {
                        yield Ok(item);
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            }
        }

        for item in normalizer.finish() {
            yield Ok(item);
        }
    })
}

/// Read a newline delimited JSON body, one fragment per non-empty line
pub fn ndjson_stream<N>(response: reqwest::Response, mut normalizer: N) -> EventStream
where
    N: StreamNormalizer + 'static,
{
    let bytes = Box::pin(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );
    let mut lines = FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    );

    Box::pin(stream! {
        while let Some(next) = lines.next().await {
            let line = match next {
                Ok(line) => line,
                Err(LinesCodecError::Io(e)) => {
                    yield Err(ProviderError::Transport(e.to_string()).into());
                    return;
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    yield Err(ProviderError::ResponseFormat("line exceeds maximum length".into()).into());
                    return;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match normalizer.normalize(line) {
                Ok(out) => {
                    for item in out {
                        yield Ok(item);
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            }
        }

        for item in normalizer.finish() {
            yield Ok(item);
        }
    })
}
