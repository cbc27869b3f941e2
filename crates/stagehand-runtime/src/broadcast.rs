//! Write fan-out for a process's output stream.
//!
//! A [`StreamBroadcaster`] is one logical writer backed by an append-only
//! list of destinations. Every write goes to every destination in the
//! order they were added, under a single lock that also serializes
//! additions, so a destination is never added in the middle of a write and
//! all destinations observe the same sequence of writes from the moment
//! they joined.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A writer that can be shared between broadcasters.
pub type SharedWriter = Arc<Mutex<dyn AsyncWrite + Send + Unpin>>;

/// Wraps a writer so it can be added to a broadcaster.
pub fn shared<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(writer))
}

/// Something a broadcaster can write to.
pub enum Destination {
    /// A single writer.
    Writer(SharedWriter),
    /// Another broadcaster, flattened to the destinations it holds at the
    /// time it is added.
    Broadcaster(StreamBroadcaster),
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Writer(_) => f.write_str("Destination::Writer"),
            Self::Broadcaster(_) => f.write_str("Destination::Broadcaster"),
        }
    }
}

/// Fan-out writer over an append-only destination list.
///
/// Cloning yields a handle to the same list.
#[derive(Clone, Default)]
pub struct StreamBroadcaster {
    destinations: Arc<Mutex<Vec<SharedWriter>>>,
}

impl std::fmt::Debug for StreamBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBroadcaster").finish_non_exhaustive()
    }
}

impl StreamBroadcaster {
    /// Creates a broadcaster with no destinations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broadcaster over the given destinations, flattening any
    /// broadcasters among them.
    pub async fn with_destinations(destinations: impl IntoIterator<Item = Destination>) -> Self {
        let broadcaster = Self::new();
        for destination in destinations {
            broadcaster.add(destination).await;
        }
        broadcaster
    }

    /// Appends a destination. Nothing is removed or deduplicated.
    pub async fn add(&self, destination: Destination) {
        let writers = match destination {
            Destination::Writer(writer) => vec![writer],
            Destination::Broadcaster(other) => other.destinations.lock().await.clone(),
        };
        self.destinations.lock().await.extend(writers);
    }

    /// Returns the number of underlying destinations.
    pub async fn len(&self) -> usize {
        self.destinations.lock().await.len()
    }

    /// Returns whether there are no destinations.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Writes `buf` in full to every destination, in the order they were
    /// added.
    ///
    /// # Errors
    ///
    /// Stops at the first destination that fails or accepts fewer bytes
    /// than offered (`WriteZero`). Destinations before it have received
    /// the whole buffer; destinations after it have received nothing.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let destinations = self.destinations.lock().await;
        for destination in destinations.iter() {
            let mut writer = destination.lock().await;
            writer.write_all(buf).await?;
        }
        Ok(buf.len())
    }
}

/// Copies `reader` into `broadcaster` until end-of-stream, duplicating
/// every chunk into `tee` first when one is given.
///
/// A failing tee is dropped with a warning; clients keep receiving output.
/// Returns the number of bytes copied.
///
/// # Errors
///
/// Returns the first read or broadcast error.
pub async fn pump<R>(
    mut reader: R,
    broadcaster: StreamBroadcaster,
    mut tee: Option<SharedWriter>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; 32 * 1024];
    let mut total = 0_u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        let tee_error = match &tee {
            Some(tee) => tee.lock().await.write_all(&buf[..n]).await.err(),
            None => None,
        };
        if let Some(e) = tee_error {
            tracing::warn!(error = %e, "output capture failed, continuing without it");
            tee = None;
        }
        let _ = broadcaster.write(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts at most `capacity` bytes in total, then reports zero-length writes.
    struct ShortWriter {
        capacity: usize,
        written: Vec<u8>,
    }

    impl AsyncWrite for ShortWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.capacity - self.written.len());
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn buffer() -> (SharedWriter, Arc<Mutex<Vec<u8>>>) {
        let inner = Arc::new(Mutex::new(Vec::new()));
        let writer: SharedWriter = Arc::new(Mutex::new(VecWriter(Arc::clone(&inner))));
        (writer, inner)
    }

    struct VecWriter(Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for VecWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.try_lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn every_destination_gets_every_byte() {
        let (a, a_buf) = buffer();
        let (b, b_buf) = buffer();
        let (c, c_buf) = buffer();
        let broadcaster = StreamBroadcaster::with_destinations([
            Destination::Writer(a),
            Destination::Writer(b),
            Destination::Writer(c),
        ])
        .await;

        assert_eq!(broadcaster.write(b"hello ").await.unwrap(), 6);
        assert_eq!(broadcaster.write(b"world").await.unwrap(), 5);

        for buf in [a_buf, b_buf, c_buf] {
            assert_eq!(buf.lock().await.as_slice(), b"hello world");
        }
    }

    #[tokio::test]
    async fn late_destination_only_sees_later_writes() {
        let (a, a_buf) = buffer();
        let (b, b_buf) = buffer();
        let broadcaster = StreamBroadcaster::new();
        broadcaster.add(Destination::Writer(a)).await;
        let _ = broadcaster.write(b"early ").await.unwrap();
        broadcaster.add(Destination::Writer(b)).await;
        let _ = broadcaster.write(b"late").await.unwrap();

        assert_eq!(a_buf.lock().await.as_slice(), b"early late");
        assert_eq!(b_buf.lock().await.as_slice(), b"late");
    }

    #[tokio::test]
    async fn short_write_aborts_the_call() {
        let (before, before_buf) = buffer();
        let (after, after_buf) = buffer();
        let short = shared(ShortWriter {
            capacity: 3,
            written: Vec::new(),
        });
        let broadcaster = StreamBroadcaster::with_destinations([
            Destination::Writer(before),
            Destination::Writer(short),
            Destination::Writer(after),
        ])
        .await;

        let err = broadcaster.write(b"abcdef").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(before_buf.lock().await.as_slice(), b"abcdef");
        assert!(after_buf.lock().await.is_empty());
    }

    #[tokio::test]
    async fn nested_broadcaster_is_flattened() {
        let (a, a_buf) = buffer();
        let (b, b_buf) = buffer();
        let inner =
            StreamBroadcaster::with_destinations([Destination::Writer(a), Destination::Writer(b)])
                .await;
        let outer = StreamBroadcaster::new();
        outer.add(Destination::Broadcaster(inner.clone())).await;
        assert_eq!(outer.len().await, 2);

        let (late, late_buf) = buffer();
        inner.add(Destination::Writer(late)).await;

        let _ = outer.write(b"x").await.unwrap();
        assert_eq!(a_buf.lock().await.as_slice(), b"x");
        assert_eq!(b_buf.lock().await.as_slice(), b"x");
        assert!(late_buf.lock().await.is_empty());
    }

    #[tokio::test]
    async fn adding_a_broadcaster_to_itself_does_not_deadlock() {
        let (a, a_buf) = buffer();
        let broadcaster = StreamBroadcaster::new();
        broadcaster.add(Destination::Writer(a)).await;
        broadcaster
            .add(Destination::Broadcaster(broadcaster.clone()))
            .await;
        assert_eq!(broadcaster.len().await, 2);
        let _ = broadcaster.write(b"y").await.unwrap();
        assert_eq!(a_buf.lock().await.as_slice(), b"yy");
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave_within_a_write() {
        let (a, a_buf) = buffer();
        let (b, b_buf) = buffer();
        let broadcaster =
            StreamBroadcaster::with_destinations([Destination::Writer(a), Destination::Writer(b)])
                .await;

        let mut tasks = Vec::new();
        for byte in [b'1', b'2', b'3', b'4'] {
            let broadcaster = broadcaster.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let _ = broadcaster.write(&[byte; 16]).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let a = a_buf.lock().await.clone();
        let b = b_buf.lock().await.clone();
        assert_eq!(a.len(), 4 * 50 * 16);
        assert_eq!(a, b);
        assert!(a.chunks(16).all(|chunk| chunk.iter().all(|&c| c == chunk[0])));
    }

    #[tokio::test]
    async fn pump_tees_and_broadcasts_until_eof() {
        let (a, a_buf) = buffer();
        let (tee, tee_buf) = buffer();
        let broadcaster = StreamBroadcaster::with_destinations([Destination::Writer(a)]).await;

        let copied = pump(&b"process output"[..], broadcaster, Some(tee))
            .await
            .unwrap();

        assert_eq!(copied, 14);
        assert_eq!(a_buf.lock().await.as_slice(), b"process output");
        assert_eq!(tee_buf.lock().await.as_slice(), b"process output");
    }

    #[tokio::test]
    async fn failing_tee_is_dropped_and_clients_keep_receiving() {
        let (a, a_buf) = buffer();
        let broadcaster = StreamBroadcaster::with_destinations([Destination::Writer(a)]).await;
        let full = shared(ShortWriter {
            capacity: 2,
            written: Vec::new(),
        });

        let (mut process, output) = tokio::io::duplex(64);
        let task = tokio::spawn(pump(output, broadcaster, Some(full)));
        process.write_all(b"first").await.unwrap();
        process.write_all(b"second").await.unwrap();
        drop(process);

        assert_eq!(task.await.unwrap().unwrap(), 11);
        assert_eq!(a_buf.lock().await.as_slice(), b"firstsecond");
    }
}
