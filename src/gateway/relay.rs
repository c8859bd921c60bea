use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::model::FragmentStream;
use crate::stream::{AbortableStream, StreamAbortHandle, abortable_stream};
use crate::utils::task::AbortOnDrop;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One line of a relayed stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFrame {
    Data(String),
    Error(String),
}

impl StreamFrame {
    pub fn encode(&self) -> Bytes {
        let value = match self {
            Self::Data(data) => json!({ "data": data }),
            Self::Error(error) => json!({ "error": error }),
        };
        let mut line = value.to_string();
        line.push('\n');
        Bytes::from(line)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RelayOutcome {
    Completed { frames: u64 },
    Cancelled { frames: u64 },
    Failed { frames: u64 },
}

#[derive(Clone, Debug)]
pub struct StreamRelay {
    channel_capacity: usize,
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self {
            channel_capacity: 1,
        }
    }
}

impl StreamRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Starts pulling `fragments` on a background task. Must be called inside a tokio runtime.
    pub fn relay(&self, fragments: FragmentStream) -> RelayStream {
        let AbortableStream { handle, stream } = abortable_stream(fragments);
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        let pump_handle = handle.clone();
        let task = AbortOnDrop::spawn(async move {
            let outcome = pump(stream, tx, &pump_handle).await;
            match outcome {
                RelayOutcome::Completed { frames } => {
                    tracing::debug!(frames, "stream relay completed");
                }
                RelayOutcome::Cancelled { frames } => {
                    tracing::info!(frames, "stream relay cancelled by client");
                }
                RelayOutcome::Failed { frames } => {
                    tracing::warn!(frames, "stream relay ended with upstream error");
                }
            }
        });

        RelayStream {
            rx,
            abort: handle,
            _task: task,
        }
    }
}

async fn pump(
    mut fragments: FragmentStream,
    tx: mpsc::Sender<Bytes>,
    abort: &StreamAbortHandle,
) -> RelayOutcome {
    let mut frames = 0u64;
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return RelayOutcome::Cancelled { frames },
            next = fragments.next() => next,
        };

        match next {
            Some(Ok(fragment)) => {
                if tx.send(StreamFrame::Data(fragment).encode()).await.is_err() {
                    return RelayOutcome::Cancelled { frames };
                }
                frames += 1;
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "upstream stream failed");
                let frame = StreamFrame::Error(err.summary()).encode();
                if tx.send(frame).await.is_err() {
                    return RelayOutcome::Cancelled { frames };
                }
                return RelayOutcome::Failed { frames: frames + 1 };
            }
            None if abort.is_aborted() => return RelayOutcome::Cancelled { frames },
            None => return RelayOutcome::Completed { frames },
        }
    }
}

/// Body stream of encoded frames. Dropping it (the client went away) stops the upstream pull.
pub struct RelayStream {
    rx: mpsc::Receiver<Bytes>,
    abort: StreamAbortHandle,
    _task: AbortOnDrop,
}

impl RelayStream {
    pub fn abort_handle(&self) -> StreamAbortHandle {
        self.abort.clone()
    }
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("aborted", &self.abort.is_aborted())
            .finish_non_exhaustive()
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures_util::stream;

    use super::*;
    use crate::{BrokerError, Result};

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    async fn collect_lines(relay: RelayStream) -> Vec<String> {
        let chunks: Vec<Bytes> = relay.map(|chunk| chunk.unwrap()).collect().await;
        chunks
            .into_iter()
            .map(|chunk| String::from_utf8(chunk.to_vec()).unwrap())
            .collect()
    }

    async fn wait_for(flag: &AtomicBool) -> bool {
        for _ in 0..100 {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        flag.load(Ordering::SeqCst)
    }

    #[test]
    fn frames_encode_as_json_lines() {
        assert_eq!(
            StreamFrame::Data("he said \"hi\"".to_string()).encode(),
            Bytes::from("{\"data\":\"he said \\\"hi\\\"\"}\n")
        );
        assert_eq!(
            StreamFrame::Error("boom".to_string()).encode(),
            Bytes::from("{\"error\":\"boom\"}\n")
        );
    }

    #[tokio::test]
    async fn relays_one_frame_per_fragment_in_order() {
        let fragments = stream::iter(vec![
            Ok("Hel".to_string()),
            Ok("lo".to_string()),
            Ok("!".to_string()),
        ])
        .boxed();

        let lines = collect_lines(StreamRelay::new().relay(fragments)).await;
        assert_eq!(
            lines,
            vec![
                "{\"data\":\"Hel\"}\n",
                "{\"data\":\"lo\"}\n",
                "{\"data\":\"!\"}\n"
            ]
        );
    }

    #[tokio::test]
    async fn upstream_error_emits_single_terminal_frame() {
        let fragments = stream::iter(vec![
            Ok("partial".to_string()),
            Err(BrokerError::InvalidResponse("secret detail".to_string())),
            Ok("never".to_string()),
        ])
        .boxed();

        let lines = collect_lines(StreamRelay::new().relay(fragments)).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "{\"data\":\"partial\"}\n");
        assert_eq!(lines[1], "{\"error\":\"unexpected upstream response\"}\n");
    }

    #[tokio::test]
    async fn dropping_relay_drops_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let fragments = stream::iter(vec![Ok::<_, BrokerError>("first".to_string())])
            .chain(stream::pending())
            .map(move |item: Result<String>| {
                let _keep = &flag;
                item
            })
            .boxed();

        let mut relay = StreamRelay::new().relay(fragments);
        let first = relay.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from("{\"data\":\"first\"}\n"));
        assert!(!dropped.load(Ordering::SeqCst));

        drop(relay);
        assert!(wait_for(&dropped).await);
    }

    #[tokio::test]
    async fn abort_handle_ends_stream_and_drops_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let fragments = stream::pending::<Result<String>>()
            .map(move |item| {
                let _keep = &flag;
                item
            })
            .boxed();

        let mut relay = StreamRelay::new().relay(fragments);
        relay.abort_handle().abort();

        let next = tokio::time::timeout(Duration::from_secs(1), relay.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(wait_for(&dropped).await);
    }
}
