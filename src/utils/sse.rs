//! Minimal server-sent-events decoder: yields the `data` payload of each event and stops at
//! the `[DONE]` marker used by chat-completion streams.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::{BrokerError, Result};

const DONE_MARKER: &str = "[DONE]";

/// Upper bounds on what a misbehaving upstream can make us buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

struct SseDecoder<R> {
    reader: R,
    limits: SseLimits,
    line: Vec<u8>,
    done: bool,
}

impl<R> SseDecoder<R>
where
    R: AsyncBufRead + Unpin,
{
    fn new(reader: R, limits: SseLimits) -> Self {
        Self {
            reader,
            limits,
            line: Vec::new(),
            done: false,
        }
    }

    /// Reads one line, without its terminator. `None` at end of input.
    async fn next_line(&mut self) -> Result<Option<&str>> {
        self.line.clear();
        let cap = self.limits.max_line_bytes.max(1);
        let read = (&mut self.reader)
            .take(cap as u64 + 1)
            .read_until(b'\n', &mut self.line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        let line = self.line.strip_suffix(b"\n").unwrap_or(&self.line[..]);
        if line.len() > cap {
            return Err(BrokerError::InvalidResponse(format!(
                "SSE line exceeds max_line_bytes={cap}"
            )));
        }
        let line = std::str::from_utf8(line)
            .map_err(|err| BrokerError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?;
        Ok(Some(line.trim_end_matches('\r')))
    }

    async fn next_event(&mut self) -> Result<Option<String>> {
        while !self.done {
            let Some(data) = self.read_event().await? else {
                self.done = true;
                break;
            };
            if data.trim() == DONE_MARKER {
                self.done = true;
                break;
            }
            if !data.is_empty() {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Accumulates `data` lines up to the blank line that ends an event. `None` once input is
    /// exhausted without a pending event.
    async fn read_event(&mut self) -> Result<Option<String>> {
        let max_event_bytes = self.limits.max_event_bytes;
        let mut data: Option<String> = None;

        while let Some(line) = self.next_line().await? {
            if line.is_empty() {
                if data.is_some() {
                    break;
                }
                continue;
            }
            // Comments, `event:`, `id:` and `retry:` fields carry nothing we relay.
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.strip_prefix(' ').unwrap_or(payload);

            let buffer = data.get_or_insert_with(String::new);
            let separator = usize::from(!buffer.is_empty());
            if buffer.len() + separator + payload.len() > max_event_bytes {
                return Err(BrokerError::InvalidResponse(format!(
                    "SSE event exceeds max_event_bytes={max_event_bytes}"
                )));
            }
            if separator == 1 {
                buffer.push('\n');
            }
            buffer.push_str(payload);
        }
        Ok(data)
    }
}

pub fn sse_data_stream_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        SseDecoder::new(reader, limits),
        |mut decoder| async move {
            let event = decoder.next_event().await?;
            Ok(event.map(|data| (data, decoder)))
        },
    ))
}

pub fn sse_data_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    sse_data_stream_from_reader_with_limits(reader, SseLimits::default())
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    sse_data_stream_from_reader(BufReader::new(StreamReader::new(bytes)))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::StreamExt;

    use super::*;

    fn reader<C: Into<Bytes>>(chunks: Vec<C>) -> impl AsyncBufRead + Unpin + Send + 'static {
        let chunks: Vec<_> = chunks
            .into_iter()
            .map(|chunk| Ok::<_, std::io::Error>(chunk.into()))
            .collect();
        BufReader::new(StreamReader::new(stream::iter(chunks)))
    }

    async fn collect(stream: BoxStream<'static, Result<String>>) -> Result<Vec<String>> {
        stream.try_collect().await
    }

    #[tokio::test]
    async fn yields_data_until_done_marker() -> Result<()> {
        let input = ": keep-alive\n\n\
            event: message\n\
            data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n\
            data: line1\r\n\
            data: line2\r\n\r\n\
            data: [DONE]\n\n\
            data: ignored\n\n";

        let out = collect(sse_data_stream_from_reader(reader(vec![input]))).await?;
        assert_eq!(
            out,
            vec![
                "{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}",
                "line1\nline2",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn events_may_span_chunks_and_end_without_blank_line() -> Result<()> {
        let out = collect(sse_data_stream_from_reader(reader(vec![
            "data: hel",
            "lo\n",
            "\ndata: wor",
            "ld",
        ])))
        .await?;
        assert_eq!(out, vec!["hello", "world"]);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_lines_and_events_are_errors() {
        let long_line = format!("data: {}\n\n", "x".repeat(1024));
        let mut stream = sse_data_stream_from_reader_with_limits(
            reader(vec![long_line]),
            SseLimits {
                max_line_bytes: 64,
                max_event_bytes: 4096,
            },
        );
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("max_line_bytes"));

        let many_lines = "data: aaaaaaaaaa\n".repeat(20);
        let mut stream = sse_data_stream_from_reader_with_limits(
            reader(vec![many_lines]),
            SseLimits {
                max_line_bytes: 4096,
                max_event_bytes: 64,
            },
        );
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("max_event_bytes"));
    }
}
