use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use futures_util::StreamExt;
use futures_util::stream;
use futures_util::task::AtomicWaker;

use crate::Result;
use crate::model::FragmentStream;

#[derive(Clone, Debug)]
pub struct StreamAbortHandle {
    aborted: Arc<AtomicBool>,
    waker: Arc<AtomicWaker>,
}

impl StreamAbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

pub struct AbortableStream {
    pub handle: StreamAbortHandle,
    pub stream: FragmentStream,
}

/// Wraps `stream` so that [`StreamAbortHandle::abort`] ends it and drops the inner stream,
/// releasing whatever upstream connection it holds.
pub fn abortable_stream(stream: FragmentStream) -> AbortableStream {
    let aborted = Arc::new(AtomicBool::new(false));
    let waker = Arc::new(AtomicWaker::new());
    let handle = StreamAbortHandle {
        aborted: aborted.clone(),
        waker: waker.clone(),
    };

    let mut inner = Some(stream);
    let stream = stream::poll_fn(move |cx: &mut Context<'_>| {
        waker.register(cx.waker());

        if aborted.load(Ordering::SeqCst) {
            inner.take();
            return Poll::Ready(None);
        }

        let Some(stream) = inner.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(stream).poll_next(cx) {
            Poll::Ready(None) => {
                inner.take();
                Poll::Ready(None)
            }
            other => other,
        }
    })
    .boxed();

    AbortableStream { handle, stream }
}

/// Drains a fragment stream into one string, stopping at the first error.
pub async fn collect_fragments(mut stream: FragmentStream) -> Result<String> {
    let mut out = String::new();
    while let Some(fragment) = stream.next().await {
        out.push_str(&fragment?);
    }
    Ok(out)
}
