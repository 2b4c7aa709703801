use crate::distributor::{Distributor, SubscriberId, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::error::Error;
use crate::frame::{self, DEFAULT_MAX_LINE_BYTES};
use crate::upstream::{Upstream, UpstreamTarget};
use futures::StreamExt;
use log::*;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fixed delay between upstream attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Where the current upstream session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Failed,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Wait after any failed or ended session before reconnecting.
    pub retry_delay: Duration,
    /// Queue depth of each subscriber.
    pub subscriber_capacity: usize,
    /// Longest upstream line accepted before the session is abandoned.
    pub max_line_bytes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Point-in-time view of the relay, served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub state: SessionState,
    pub started: bool,
    pub stopped: bool,
    pub subscribers: usize,
    pub connect_attempts: u64,
    pub events: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    task: Option<JoinHandle<()>>,
}

/// Owns the single upstream session and feeds it into the [`Distributor`].
///
/// Constructed once at startup and shared as `Arc<StreamController>`. The
/// upstream loop is started lazily by the first [`StreamController::ensure_started`]
/// call and runs until [`StreamController::stop`]: connect, stream, and on any
/// failure or end of stream wait the fixed retry delay and connect again.
pub struct StreamController {
    upstream: Arc<dyn Upstream>,
    distributor: Distributor,
    config: ControllerConfig,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<SessionState>,
    connect_attempts: AtomicU64,
    events: AtomicU64,
}

impl StreamController {
    pub fn new(upstream: Arc<dyn Upstream>, config: ControllerConfig) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            upstream,
            distributor: Distributor::new(config.subscriber_capacity),
            config,
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            state,
            connect_attempts: AtomicU64::new(0),
            events: AtomicU64::new(0),
        })
    }

    /// Starts the upstream loop unless it is already running.
    ///
    /// Returns `true` only for the call that actually started it. Concurrent
    /// callers race on the lifecycle lock; exactly one wins. Once stopped the
    /// controller never starts again.
    pub fn ensure_started(self: &Arc<Self>, target: UpstreamTarget) -> bool {
        let mut lifecycle = self.lock();
        if lifecycle.stopped {
            warn!("Stream controller already stopped, not starting upstream loop");
            return false;
        }
        if lifecycle.started {
            return false;
        }

        info!("Ensuring upstream streaming is started for {}", target.url);
        lifecycle.started = true;
        let controller = Arc::clone(self);
        lifecycle.task = Some(tokio::spawn(controller.run(target)));
        true
    }

    /// Cancels the upstream loop and closes every subscriber queue.
    /// Only the first call has any effect.
    pub fn stop(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.stopped {
            return;
        }
        lifecycle.stopped = true;
        drop(lifecycle);

        info!("Stopping stream controller");
        self.cancel.cancel();
        self.distributor.close_all();
    }

    /// Stops the controller and waits for the upstream loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.lock().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Upstream stream loop ended abnormally: {e}");
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.distributor.subscribe()
    }

    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.distributor.unsubscribe(id)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver of state changes. Only the latest state is kept, so a
    /// session that connects and ends between two polls may never be seen
    /// as `Streaming`.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StreamStats {
        let (started, stopped) = {
            let lifecycle = self.lock();
            (lifecycle.started, lifecycle.stopped)
        };

        StreamStats {
            state: self.state(),
            started,
            stopped,
            subscribers: self.distributor.subscriber_count(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            delivered: self.distributor.delivered_total(),
            dropped: self.distributor.dropped_total(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Upstream session {previous:?} -> {state:?}");
        }
    }

    async fn run(self: Arc<Self>, target: UpstreamTarget) {
        loop {
            match self.run_session(&target).await {
                Ok(()) => info!("Upstream stream ended, will reconnect"),
                Err(Error::Cancelled) => break,
                Err(e) => warn!("Upstream session failed: {e}"),
            }

            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(SessionState::Failed);
            if !self.backoff().await {
                break;
            }
        }

        self.set_state(SessionState::Closing);
        self.distributor.close_all();
        self.set_state(SessionState::Idle);
        info!("Context cancelled, upstream stream loop stopped");
    }

    /// One connect-and-read cycle. `Ok` means the upstream closed cleanly.
    async fn run_session(&self, target: &UpstreamTarget) -> Result<(), Error> {
        self.set_state(SessionState::Connecting);
        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;

        let bytes = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            opened = self.upstream.open(target, &self.cancel) => opened?,
        };

        self.set_state(SessionState::Streaming);
        info!("Connected to upstream stream (attempt {attempt})");

        // Fresh parser per session: partial frames never survive a reconnect.
        let events = frame::events(bytes, self.config.max_line_bytes);
        tokio::pin!(events);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let report = self.distributor.broadcast(event.to_frame());
                    self.events.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        "Relayed '{}' event to {} subscriber(s), {} dropped",
                        event.event_type(),
                        report.delivered,
                        report.dropped
                    );
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    /// Sleeps the retry delay. Returns `false` if cancelled first.
    async fn backoff(&self) -> bool {
        let delay = self.config.retry_delay;
        info!("Reconnecting to upstream in {delay:?}");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{ByteStream, Credentials};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    #[derive(Clone)]
    enum Step {
        Status(u16),
        Body(Vec<&'static str>),
        Hang,
    }

    struct ScriptedUpstream {
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        opens: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn new(script: Vec<Step>, fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                opens: AtomicUsize::new(0),
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn open(
            &self,
            _target: &UpstreamTarget,
            _cancel: &CancellationToken,
        ) -> Result<ByteStream, Error> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());

            match step {
                Step::Status(code) => Err(Error::UpstreamStatus { code }),
                Step::Body(chunks) => Ok(stream::iter(
                    chunks
                        .into_iter()
                        .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes()))),
                )
                .boxed()),
                Step::Hang => Ok(stream::pending::<Result<Bytes, Error>>().boxed()),
            }
        }
    }

    fn target() -> UpstreamTarget {
        UpstreamTarget::new("http://upstream.test/vehicles", Credentials::api_key("k"))
    }

    fn controller(upstream: Arc<ScriptedUpstream>, config: ControllerConfig) -> Arc<StreamController> {
        StreamController::new(upstream, config)
    }

    async fn wait_for(controller: &StreamController, wanted: SessionState) {
        let mut state = controller.watch_state();
        timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn relays_reframed_events_to_subscribers() {
        let upstream = ScriptedUpstream::new(
            vec![Step::Body(vec!["event: reset\ndata: {\"a\":1}\ndata: tail\n\n"])],
            Step::Hang,
        );
        let controller = controller(upstream, ControllerConfig::default());
        let mut sub = controller.subscribe();

        assert!(controller.ensure_started(target()));

        let payload = timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
        assert_eq!(
            payload,
            Some(Bytes::from_static(
                b"event: reset\ndata: {\"a\":1}\ndata: tail\n\n"
            ))
        );
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_ensure_started_opens_one_session() {
        let upstream = ScriptedUpstream::new(vec![], Step::Hang);
        let controller = controller(upstream.clone(), ControllerConfig::default());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move { controller.ensure_started(target()) }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        wait_for(&controller, SessionState::Streaming).await;
        assert_eq!(upstream.opens(), 1);
        assert!(!controller.ensure_started(target()));
        assert_eq!(upstream.opens(), 1);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_errors_back_off_instead_of_spinning() {
        let upstream = ScriptedUpstream::new(vec![], Step::Status(503));
        let controller = controller(upstream.clone(), ControllerConfig::default());

        controller.ensure_started(target());
        tokio::time::sleep(Duration::from_secs(12)).await;

        // Attempts at t=0s, 5s and 10s.
        let opens = upstream.opens();
        assert!((2..=3).contains(&opens), "unexpected attempt count {opens}");
        assert_eq!(controller.state(), SessionState::Failed);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clean_end_of_stream_reconnects_after_delay() {
        let upstream = ScriptedUpstream::new(vec![Step::Body(vec!["data: 1\n\n"])], Step::Hang);
        let controller = controller(upstream.clone(), ControllerConfig::default());
        let mut sub = controller.subscribe();

        controller.ensure_started(target());
        assert_eq!(sub.recv().await, Some(Bytes::from_static(b"event: \ndata: 1\n\n")));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(upstream.opens(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(upstream.opens(), 2);
        assert_eq!(controller.state(), SessionState::Streaming);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn partial_frames_do_not_cross_reconnects() {
        let upstream = ScriptedUpstream::new(
            vec![
                Step::Body(vec!["event: stale\ndata: partial"]),
                Step::Body(vec!["\n\ndata: fresh\n\n"]),
            ],
            Step::Hang,
        );
        let controller = controller(upstream, ControllerConfig::default());
        let mut sub = controller.subscribe();

        controller.ensure_started(target());

        let payload = timeout(Duration::from_secs(30), sub.recv()).await.unwrap();
        assert_eq!(payload, Some(Bytes::from_static(b"event: \ndata: fresh\n\n")));
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn parse_error_ends_only_the_session() {
        let upstream = ScriptedUpstream::new(
            vec![Step::Body(vec!["data: this line is far too long\n\n"])],
            Step::Body(vec!["data: ok\n\n"]),
        );
        let config = ControllerConfig {
            max_line_bytes: 16,
            ..ControllerConfig::default()
        };
        let controller = controller(upstream.clone(), config);
        let mut sub = controller.subscribe();

        controller.ensure_started(target());

        let payload = timeout(Duration::from_secs(30), sub.recv()).await.unwrap();
        assert_eq!(payload, Some(Bytes::from_static(b"event: \ndata: ok\n\n")));
        assert!(upstream.opens() >= 2);
        assert_eq!(controller.stats().subscribers, 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn stop_during_blocked_read_closes_subscribers() {
        let upstream = ScriptedUpstream::new(vec![], Step::Hang);
        let controller = controller(upstream, ControllerConfig::default());
        let mut a = controller.subscribe();
        let mut b = controller.subscribe();

        controller.ensure_started(target());
        wait_for(&controller, SessionState::Streaming).await;

        controller.stop();

        assert_eq!(timeout(Duration::from_secs(1), a.recv()).await.unwrap(), None);
        assert_eq!(timeout(Duration::from_secs(1), b.recv()).await.unwrap(), None);
        timeout(Duration::from_secs(1), controller.shutdown())
            .await
            .unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_backoff() {
        let upstream = ScriptedUpstream::new(vec![], Step::Status(500));
        let controller = controller(upstream.clone(), ControllerConfig::default());

        controller.ensure_started(target());
        wait_for(&controller, SessionState::Failed).await;

        timeout(Duration::from_millis(100), controller.shutdown())
            .await
            .unwrap();
        assert_eq!(upstream.opens(), 1);
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let upstream = ScriptedUpstream::new(vec![], Step::Hang);
        let controller = controller(upstream.clone(), ControllerConfig::default());

        controller.stop();
        controller.stop();
        controller.shutdown().await;

        assert!(!controller.ensure_started(target()));
        let mut late = controller.subscribe();
        assert_eq!(late.recv().await, None);
        assert_eq!(upstream.opens(), 0);

        let stats = controller.stats();
        assert!(stats.stopped);
        assert!(!stats.started);
    }

    #[tokio::test]
    async fn stats_track_events_and_drops() {
        let upstream = ScriptedUpstream::new(
            vec![Step::Body(vec!["data: 1\n\ndata: 2\n\n"])],
            Step::Hang,
        );
        let config = ControllerConfig {
            subscriber_capacity: 1,
            ..ControllerConfig::default()
        };
        let controller = controller(upstream, config);
        let _unread = controller.subscribe();

        controller.ensure_started(target());
        timeout(Duration::from_secs(5), async {
            while controller.stats().events < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let stats = controller.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.subscribers, 1);
        controller.shutdown().await;
    }
}
