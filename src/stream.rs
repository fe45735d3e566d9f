use std::{io, mem};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{Response, IntoResponse};
use bytes::{Bytes, BytesMut};
use futures::{ready, Stream};
use http_body::{Body, SizeHint, Frame};
use pin_project::{pin_project, pinned_drop};
use tokio::io::ReadBuf;

use crate::plan::ServingPlan;
use crate::RangeBody;

/// Default upper bound on the bytes read from the source per chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Where a stream session is in its lifecycle.
///
/// A session starts in `HeadersSent`: by the time a body exists its plan is
/// final and the response head is committed. Both terminal phases have
/// released the byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    HeadersSent,
    Streaming,
    Completed,
    Aborted,
}

/// Response body stream. Implements [`Stream`], [`Body`], and [`IntoResponse`].
///
/// Yields exactly the planned byte interval in chunks of at most the body's
/// [`RangeBody::chunk_size`]. A chunk is only read when the consumer polls for
/// the next one, so at most one chunk per session is held in memory.
///
/// Any failure (seek or read error, or the source ending before the planned
/// length) is yielded once as an [`io::Error`], after which the stream is
/// finished and the source has been dropped.
#[pin_project(project = RangedStreamProj, PinnedDrop)]
pub struct RangedStream<B> {
    state: StreamState,
    start: u64,
    length: u64,
    sent: u64,
    chunk_size: usize,
    #[pin]
    body: Option<B>,
}

impl<B: RangeBody + Send + 'static> RangedStream<B> {
    pub(crate) fn new(body: B, plan: &ServingPlan) -> Self {
        let chunk_size = body.chunk_size().max(1);
        RangedStream {
            state: StreamState::Seek,
            start: plan.start(),
            length: plan.length(),
            sent: 0,
            chunk_size,
            body: Some(body),
        }
    }
}

impl<B> RangedStream<B> {
    pub fn phase(&self) -> SessionPhase {
        match self.state {
            StreamState::Seek => SessionPhase::HeadersSent,
            StreamState::Seeking | StreamState::Reading { .. } => SessionPhase::Streaming,
            StreamState::Completed => SessionPhase::Completed,
            StreamState::Aborted => SessionPhase::Aborted,
        }
    }

    /// Bytes handed to the consumer so far.
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Total bytes this stream will yield when it completes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// A transfer that began reading but stopped short of its planned length.
    /// A body dropped before its first poll (a HEAD response) never began.
    fn is_interrupted(&self) -> bool {
        self.phase() == SessionPhase::Streaming && self.sent < self.length
    }
}

impl<B> std::fmt::Debug for RangedStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangedStream")
            .field("phase", &self.phase())
            .field("start", &self.start)
            .field("length", &self.length)
            .field("sent", &self.sent)
            .finish()
    }
}

#[derive(Debug)]
enum StreamState {
    Seek,
    Seeking,
    Reading { buffer: BytesMut },
    Completed,
    Aborted,
}

impl StreamState {
    fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Aborted)
    }
}

enum Step {
    Chunk(Bytes),
    Done,
    Failed(io::Error),
}

impl<B: RangeBody> RangedStreamProj<'_, B> {
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Step> {
        // never read past the plan, whatever the source still holds
        if *self.sent >= *self.length {
            return Poll::Ready(Step::Done);
        }

        let Some(mut body) = self.body.as_mut().as_pin_mut() else {
            return Poll::Ready(Step::Done);
        };

        loop {
            match self.state {
                StreamState::Seek => match body.as_mut().start_seek(*self.start) {
                    Err(e) => return Poll::Ready(Step::Failed(e)),
                    Ok(()) => *self.state = StreamState::Seeking,
                },

                StreamState::Seeking => match body.as_mut().poll_complete(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Step::Failed(e)),
                    Poll::Ready(Ok(())) => {
                        let buffer = BytesMut::with_capacity(*self.chunk_size);
                        *self.state = StreamState::Reading { buffer };
                    }
                },

                StreamState::Reading { buffer } => {
                    let remaining = *self.length - *self.sent;
                    let uninit = buffer.spare_capacity_mut();

                    // the smaller of the buffer size and the number of bytes remaining
                    let nbytes = std::cmp::min(
                        uninit.len(),
                        usize::try_from(remaining).unwrap_or(usize::MAX),
                    );

                    let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

                    match ready!(body.as_mut().poll_read(cx, &mut read_buf)) {
                        Err(e) => return Poll::Ready(Step::Failed(e)),
                        Ok(()) => {
                            let n = read_buf.filled().len();
                            if n == 0 {
                                let e = io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    format!(
                                        "byte source ended after {} of {} planned bytes",
                                        *self.sent, *self.length,
                                    ),
                                );
                                return Poll::Ready(Step::Failed(e));
                            }

                            // SAFETY: poll_read has initialised `n` more bytes
                            // directly after the current length of `buffer`
                            unsafe { buffer.set_len(buffer.len() + n); }

                            // n <= remaining, so this cannot overshoot the plan
                            *self.sent += n as u64;

                            let next = if *self.sent < *self.length {
                                BytesMut::with_capacity(*self.chunk_size)
                            } else {
                                BytesMut::new()
                            };
                            let chunk = mem::replace(buffer, next);

                            return Poll::Ready(Step::Chunk(chunk.freeze()));
                        }
                    }
                }

                StreamState::Completed | StreamState::Aborted => return Poll::Ready(Step::Done),
            }
        }
    }

    /// Enter a terminal state and release the byte source.
    fn finish(&mut self, state: StreamState) {
        *self.state = state;
        self.body.set(None);
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn is_end_stream(&self) -> bool {
        self.state.is_terminal() || self.sent >= self.length
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length - self.sent)
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        if this.state.is_terminal() {
            return Poll::Ready(None);
        }

        match ready!(this.poll_step(cx)) {
            Step::Chunk(chunk) => Poll::Ready(Some(Ok(chunk))),
            Step::Done => {
                tracing::trace!(start = *this.start, length = *this.length, "stream session completed");
                this.finish(StreamState::Completed);
                Poll::Ready(None)
            }
            Step::Failed(e) => {
                tracing::warn!(
                    start = *this.start,
                    length = *this.length,
                    sent = *this.sent,
                    error = %e,
                    "aborting stream session",
                );
                this.finish(StreamState::Aborted);
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

#[pinned_drop]
impl<B> PinnedDrop for RangedStream<B> {
    fn drop(self: Pin<&mut Self>) {
        if self.is_interrupted() {
            // the consumer went away mid-transfer, usually a client disconnect
            tracing::debug!(
                start = self.start,
                length = self.length,
                sent = self.sent,
                "stream session dropped before completion",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures::{pin_mut, Stream, StreamExt};
    use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

    use super::*;
    use crate::plan::{resolve, ServingPlan};
    use crate::KnownSize;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn collect_chunks(stream: impl Stream<Item = io::Result<Bytes>>) -> io::Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await.transpose()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    fn stream_over(data: Vec<u8>, plan: &ServingPlan, chunk_size: usize) -> RangedStream<KnownSize<Cursor<Vec<u8>>>> {
        let len = data.len() as u64;
        RangedStream::new(KnownSize::sized(Cursor::new(data), len).with_chunk_size(chunk_size), plan)
    }

    /// Wraps a cursor and records when it is dropped.
    struct Tracked {
        inner: Cursor<Vec<u8>>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl AsyncRead for Tracked {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncSeek for Tracked {
        fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
            Pin::new(&mut self.inner).start_seek(position)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
            Pin::new(&mut self.inner).poll_complete(cx)
        }
    }

    /// Seeks fine, fails every read.
    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk on fire")))
        }
    }

    impl AsyncSeek for Broken {
        fn start_seek(self: Pin<&mut Self>, _: io::SeekFrom) -> io::Result<()> {
            Ok(())
        }

        fn poll_complete(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<u64>> {
            Poll::Ready(Ok(0))
        }
    }

    #[tokio::test]
    async fn test_partial_body_is_byte_exact() {
        let data = pattern(1000);
        let plan = resolve(Some("bytes=200-399"), 1000).unwrap();

        let chunks = collect_chunks(stream_over(data.clone(), &plan, CHUNK_SIZE)).await.unwrap();
        assert_eq!(&data[200..400], &chunks.concat()[..]);
    }

    #[tokio::test]
    async fn test_chunks_are_bounded() {
        let data = pattern(1000);
        let plan = resolve(Some("bytes=3-"), 1000).unwrap();

        let chunks = collect_chunks(stream_over(data.clone(), &plan, 64)).await.unwrap();
        assert!(chunks.iter().all(|chunk| !chunk.is_empty() && chunk.len() <= 64));
        assert_eq!(&data[3..], &chunks.concat()[..]);
    }

    #[tokio::test]
    async fn test_stops_at_planned_length() {
        // the source holds more than the plan claims the resource has
        let plan = ServingPlan::full(10);
        let stream = RangedStream::new(KnownSize::sized(Cursor::new(pattern(100)), 10), &plan);

        let chunks = collect_chunks(stream).await.unwrap();
        assert_eq!(pattern(10), chunks.concat());
    }

    #[tokio::test]
    async fn test_empty_plan_yields_nothing() {
        let stream = stream_over(Vec::new(), &ServingPlan::full(0), CHUNK_SIZE);
        pin_mut!(stream);

        assert!(stream.next().await.is_none());
        assert_eq!(SessionPhase::Completed, stream.phase());
        assert!(Body::is_end_stream(&*stream));
    }

    #[tokio::test]
    async fn test_premature_eof_aborts() {
        let plan = ServingPlan::full(100);
        let stream = RangedStream::new(KnownSize::sized(Cursor::new(pattern(30)), 100).with_chunk_size(16), &plan);
        pin_mut!(stream);

        let mut received = 0;
        let err = loop {
            match stream.next().await {
                Some(Ok(chunk)) => received += chunk.len(),
                Some(Err(e)) => break e,
                None => panic!("stream ended without reporting the short source"),
            }
        };

        assert_eq!(30, received);
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
        assert_eq!(SessionPhase::Aborted, stream.phase());
        assert_eq!(30, stream.bytes_sent());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_aborts() {
        let plan = ServingPlan::full(10);
        let stream = RangedStream::new(KnownSize::sized(Broken, 10), &plan);
        pin_mut!(stream);

        assert_matches!(stream.next().await, Some(Err(e)) if e.kind() == io::ErrorKind::Other);
        assert_eq!(SessionPhase::Aborted, stream.phase());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_source_released_on_completion() {
        let dropped = Arc::new(AtomicBool::new(false));
        let source = Tracked { inner: Cursor::new(pattern(50)), dropped: dropped.clone() };
        let plan = resolve(Some("bytes=-20"), 50).unwrap();
        let stream = RangedStream::new(KnownSize::sized(source, 50), &plan);
        pin_mut!(stream);

        assert_eq!(SessionPhase::HeadersSent, stream.phase());
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&pattern(50)[30..], &chunk[..]);
        assert_eq!(SessionPhase::Streaming, stream.phase());
        assert!(!dropped.load(Ordering::SeqCst));

        assert!(stream.next().await.is_none());
        assert_eq!(SessionPhase::Completed, stream.phase());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_source_released_on_disconnect() {
        let dropped = Arc::new(AtomicBool::new(false));
        let source = Tracked { inner: Cursor::new(pattern(500)), dropped: dropped.clone() };
        let plan = ServingPlan::full(500);
        let mut stream = Box::pin(RangedStream::new(KnownSize::sized(source, 500).with_chunk_size(100), &plan));

        assert_eq!(100, stream.next().await.unwrap().unwrap().len());
        assert!(stream.is_interrupted());
        drop(stream);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_size_hint_tracks_progress() {
        let plan = resolve(Some("bytes=0-99"), 1000).unwrap();
        let stream = stream_over(pattern(1000), &plan, 40);
        pin_mut!(stream);

        assert_eq!(Some(100), Body::size_hint(&*stream).exact());
        stream.next().await.unwrap().unwrap();
        assert_eq!(Some(60), Body::size_hint(&*stream).exact());
    }

    #[tokio::test]
    async fn test_unpolled_and_finished_sessions_are_not_interrupted() {
        let plan = resolve(Some("bytes=10-19"), 1000).unwrap();
        let stream = stream_over(pattern(1000), &plan, 4);
        pin_mut!(stream);

        // a HEAD response drops the body in this state
        assert!(!stream.is_interrupted());

        stream.next().await.unwrap().unwrap();
        assert!(stream.is_interrupted());

        let mut rest = 0;
        while let Some(chunk) = stream.next().await {
            rest += chunk.unwrap().len();
        }
        assert_eq!(6, rest);
        assert!(!stream.is_interrupted());
        assert_eq!(SessionPhase::Completed, stream.phase());
    }
}
