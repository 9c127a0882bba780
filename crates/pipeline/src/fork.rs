use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Writes everything to an authoritative primary writer while mirroring it,
/// best-effort, to a secondary one.
///
/// The secondary is driven by its own task, so a slow consumer never holds
/// back the primary. Once the secondary fails it is dropped and the sink
/// carries on with the primary alone; primary errors are surfaced as usual.
pub struct ForkingSink<P> {
    primary: P,
    queue: Option<mpsc::UnboundedSender<Vec<u8>>>,
    worker: Option<JoinHandle<()>>,
    collapsed: Arc<AtomicBool>,
}

impl<P: AsyncWrite + Unpin> ForkingSink<P> {
    /// Must be called within a tokio runtime.
    pub fn new<S>(primary: P, secondary: S) -> Self
    where
        S: AsyncWrite + Send + Unpin + 'static,
    {
        let (queue, chunks) = mpsc::unbounded_channel();
        let collapsed = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(pump(chunks, secondary, Arc::clone(&collapsed)));
        Self { primary, queue: Some(queue), worker: Some(worker), collapsed }
    }

    /// Whether the secondary has failed and been abandoned.
    pub fn is_collapsed(&self) -> bool {
        self.collapsed.load(Ordering::Acquire)
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn into_primary(self) -> P {
        self.primary
    }

    fn mirror(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if self.is_collapsed() {
            self.queue = None;
            return;
        }
        if let Some(queue) = &self.queue
            && queue.send(chunk.to_vec()).is_err()
        {
            self.queue = None;
        }
    }
}

impl<P: AsyncWrite + Unpin> AsyncWrite for ForkingSink<P> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.primary).poll_write(cx, buf))?;
        this.mirror(&buf[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().primary).poll_flush(cx)
    }

    /// Closes the primary, then lets the secondary drain what it was sent
    /// and close in turn. Secondary failures are not reported.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.queue.is_some() {
            ready!(Pin::new(&mut this.primary).poll_shutdown(cx))?;
            // Dropping the sender ends the worker's queue.
            this.queue = None;
        }
        if let Some(worker) = this.worker.as_mut() {
            if let Err(err) = ready!(Pin::new(worker).poll(cx)) {
                tracing::debug!(error = %err, "Secondary sink worker ended abnormally");
                this.collapsed.store(true, Ordering::Release);
            }
            this.worker = None;
        }
        Poll::Ready(Ok(()))
    }
}

async fn pump<S>(mut chunks: mpsc::UnboundedReceiver<Vec<u8>>, mut secondary: S, collapsed: Arc<AtomicBool>)
where
    S: AsyncWrite + Unpin,
{
    while let Some(chunk) = chunks.recv().await {
        if let Err(err) = secondary.write_all(&chunk).await {
            return collapse(&collapsed, &err);
        }
    }
    if let Err(err) = secondary.flush().await {
        return collapse(&collapsed, &err);
    }
    if let Err(err) = secondary.shutdown().await {
        collapse(&collapsed, &err);
    }
}

fn collapse(collapsed: &AtomicBool, err: &io::Error) {
    collapsed.store(true, Ordering::Release);
    tracing::debug!(error = %err, "Secondary sink failed; continuing with primary only");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Secondary that accepts writes until the `fail_on`-th call.
    #[derive(Clone)]
    struct Flaky {
        received: Arc<Mutex<Vec<u8>>>,
        writes: Arc<Mutex<usize>>,
        fail_on: Option<usize>,
        delay: Option<Duration>,
        closed: Arc<AtomicBool>,
    }
    impl Flaky {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                received: Arc::default(),
                writes: Arc::default(),
                fail_on,
                delay: None,
                closed: Arc::default(),
            }
        }
        fn received(&self) -> Vec<u8> {
            self.received.lock().unwrap().clone()
        }
    }
    impl AsyncWrite for Flaky {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let mut writes = self.writes.lock().unwrap();
            *writes += 1;
            if self.fail_on == Some(*writes) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away")));
            }
            self.received.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.closed.store(true, Ordering::Release);
            Poll::Ready(Ok(()))
        }
    }

    fn chunk(index: u8) -> Vec<u8> {
        vec![index; 1024]
    }

    #[tokio::test]
    async fn test_both_receive_everything() {
        let secondary = Flaky::new(None);
        let mut sink = ForkingSink::new(Vec::new(), secondary.clone());
        for index in 0..10 {
            sink.write_all(&chunk(index)).await.unwrap();
        }
        sink.shutdown().await.unwrap();
        let expected: Vec<u8> = (0..10).flat_map(chunk).collect();
        assert!(!sink.is_collapsed());
        assert_eq!(sink.primary(), &expected);
        assert_eq!(secondary.received(), expected);
        assert!(secondary.closed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_secondary_failure_does_not_affect_primary() {
        let secondary = Flaky::new(Some(3));
        let mut sink = ForkingSink::new(Vec::new(), secondary.clone());
        for index in 0..10 {
            sink.write_all(&chunk(index)).await.unwrap();
            tokio::task::yield_now().await;
        }
        sink.shutdown().await.unwrap();
        assert!(sink.is_collapsed());
        let expected: Vec<u8> = (0..10).flat_map(chunk).collect();
        assert_eq!(sink.into_primary(), expected);
        assert_eq!(secondary.received(), [chunk(0), chunk(1)].concat());
        assert!(!secondary.closed.load(Ordering::Acquire));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_secondary_does_not_block_primary() {
        let mut secondary = Flaky::new(None);
        secondary.delay = Some(Duration::from_millis(50));
        let mut sink = ForkingSink::new(Vec::new(), secondary.clone());
        let started = std::time::Instant::now();
        for index in 0..10 {
            sink.write_all(&chunk(index)).await.unwrap();
        }
        // Ten writes to the primary finish well before the secondary's
        // half-second of simulated latency.
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(sink.primary().len(), 10 * 1024);
        sink.shutdown().await.unwrap();
        assert_eq!(secondary.received().len(), 10 * 1024);
    }
}
