use crate::metrics::mock::{run_mock_event_producer, MockSnapshotSource};
use crate::metrics::now_unix_ms;
use crate::metrics::session::MetricsSession;
use crate::metrics::snapshot::{HttpSnapshotSource, SnapshotBackend};
use crate::metrics::stream::{
    connect_event_stream, decode_frame, AppendOutcome, FrameOutcome, SharedEventLog,
};
use crate::metrics::types::{ReconcilerConfig, ReconcilerStatusSnapshot, StreamConnectionState};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const STATUS_HEARTBEAT_MS: u64 = 1_000;
const STATUS_ERROR_THROTTLE_MS: u64 = 500;

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<StreamConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

struct StreamRuntimeContext<'a> {
    stream_url: &'a str,
    session: &'a MetricsSession,
    log: &'a SharedEventLog,
    status_store: &'a Arc<RwLock<ReconcilerStatusSnapshot>>,
    status_throttle: &'a Mutex<StatusPublishThrottle>,
    cancel_token: &'a CancellationToken,
}

enum StreamDirective {
    Continue,
    ImmediateReconnect,
}

/// Per-connection bookkeeping for the websocket reader.
#[derive(Debug, Default)]
struct ConnectionProgress {
    degraded: bool,
    delivered: bool,
}

/// Folds the unseen tail of `log` into `session`, then compacts the log once
/// it is both long and fully consumed.
pub fn fold_pending(
    session: &MetricsSession,
    log: &SharedEventLog,
    compact_threshold: usize,
) -> BTreeSet<String> {
    let mut writable = log.write();
    let changed = session.fold_events(writable.epoch(), writable.messages());

    let len = writable.len();
    if len >= compact_threshold && session.processed_count() == len {
        writable.compact_consumed(len);
        tracing::debug!(consumed = len, epoch = writable.epoch(), "compacted event log");
    }

    changed
}

/// Folds whatever the previous connection left unconsumed, then opens a new
/// epoch. Both happen under one write lock so the consumer cannot miss the tail.
fn fold_and_restart(session: &MetricsSession, log: &SharedEventLog) {
    let mut writable = log.write();
    let changed = session.fold_events(writable.epoch(), writable.messages());
    if !changed.is_empty() {
        tracing::debug!(?changed, "folded tail of previous connection");
    }
    writable.restart();
}

fn build_snapshot_backend(config: &ReconcilerConfig) -> SnapshotBackend {
    match (&config.snapshot_url, config.mock_mode) {
        (Some(url), false) => SnapshotBackend::Http(HttpSnapshotSource::new(Client::new(), url)),
        _ => SnapshotBackend::Mock(MockSnapshotSource::default()),
    }
}

pub async fn run_reconciler(
    config: ReconcilerConfig,
    session: Arc<MetricsSession>,
    status_store: Arc<RwLock<ReconcilerStatusSnapshot>>,
    cancel_token: CancellationToken,
) {
    let log = SharedEventLog::default();
    let status_throttle = Mutex::new(StatusPublishThrottle::default());

    publish_status(
        &status_store,
        &session,
        StreamConnectionState::Connecting,
        Some("starting reconciler".to_string()),
    )
    .await;

    session.start(
        build_snapshot_backend(&config),
        Duration::from_millis(config.poll_interval_ms),
    )
    .await;

    let consumer_cancel = cancel_token.clone();
    let consumer_session = Arc::clone(&session);
    let consumer_log = log.clone();
    let consumer_interval_ms = config.ingest_interval_ms;
    let consumer_compact_threshold = config.log_compact_threshold;
    let consumer_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(consumer_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = consumer_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let changed = fold_pending(
                        &consumer_session,
                        &consumer_log,
                        consumer_compact_threshold,
                    );
                    if !changed.is_empty() {
                        tracing::trace!(?changed, "folded stream updates");
                    }
                }
            }
        }

        // Pick up anything appended between the last tick and cancellation.
        let _ = fold_pending(&consumer_session, &consumer_log, consumer_compact_threshold);
    });

    let heartbeat_cancel = cancel_token.clone();
    let heartbeat_session = Arc::clone(&session);
    let heartbeat_status_store = Arc::clone(&status_store);
    let heartbeat_perf_enabled = config.perf_telemetry;
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (current_state, current_reason) = {
                        let readable = heartbeat_status_store.read().await;
                        (readable.state, readable.reason.clone())
                    };
                    publish_status(
                        &heartbeat_status_store,
                        &heartbeat_session,
                        current_state,
                        current_reason,
                    ).await;

                    if heartbeat_perf_enabled {
                        let perf = heartbeat_session.perf_snapshot();
                        tracing::info!(
                            fold_p50_us = ?perf.fold_p50_us,
                            fold_p95_us = ?perf.fold_p95_us,
                            fold_p99_us = ?perf.fold_p99_us,
                            fetch_p50_ms = ?perf.fetch_p50_ms,
                            fetch_p95_ms = ?perf.fetch_p95_ms,
                            fetch_p99_ms = ?perf.fetch_p99_ms,
                            fold_count = perf.fold_count,
                            fetch_count = perf.fetch_count,
                            "reconciler perf"
                        );
                    }
                }
            }
        }
    });

    match (&config.stream_url, config.mock_mode) {
        (Some(stream_url), false) => {
            let context = StreamRuntimeContext {
                stream_url,
                session: &session,
                log: &log,
                status_store: &status_store,
                status_throttle: &status_throttle,
                cancel_token: &cancel_token,
            };
            run_websocket_source(&context).await;
        }
        _ => {
            publish_status(
                &status_store,
                &session,
                StreamConnectionState::Live,
                Some("mock mode active".to_string()),
            )
            .await;
            run_mock_event_producer(&log, &cancel_token).await;
        }
    }

    cancel_token.cancel();
    let _ = consumer_handle.await;
    let _ = heartbeat_handle.await;
    session.stop().await;

    publish_status(
        &status_store,
        &session,
        StreamConnectionState::Stopped,
        Some("reconciler stopped".to_string()),
    )
    .await;
}

async fn run_websocket_source(context: &StreamRuntimeContext<'_>) {
    let mut reconnect_attempt = 0_u32;
    let mut skipped_backoff = false;

    while !context.cancel_token.is_cancelled() {
        let phase = if reconnect_attempt == 0 {
            StreamConnectionState::Connecting
        } else {
            StreamConnectionState::Reconnecting
        };
        let reason = if reconnect_attempt == 0 {
            Some("opening event stream".to_string())
        } else {
            Some(format!("reconnect attempt {reconnect_attempt}"))
        };
        publish_status(context.status_store, context.session, phase, reason).await;

        match connect_event_stream(context.stream_url).await {
            Ok(mut websocket_stream) => {
                // A new connection replays from its own start, so the old list is void.
                fold_and_restart(context.session, context.log);
                publish_status(
                    context.status_store,
                    context.session,
                    StreamConnectionState::Live,
                    Some("event stream connected".to_string()),
                )
                .await;

                let mut progress = ConnectionProgress::default();
                let mut immediate_reconnect = false;
                let mut frame_error = false;
                loop {
                    let frame = tokio::select! {
                        _ = context.cancel_token.cancelled() => break,
                        next_message = websocket_stream.next() => next_message,
                    };

                    let Some(frame_result) = frame else {
                        break;
                    };

                    match frame_result {
                        Ok(message) => match handle_frame(message, context, &mut progress).await {
                            StreamDirective::Continue => {}
                            StreamDirective::ImmediateReconnect => {
                                immediate_reconnect = true;
                                break;
                            }
                        },
                        Err(error) => {
                            publish_status_throttled(
                                context,
                                StreamConnectionState::Reconnecting,
                                Some(format!("event stream frame error: {error}")),
                            )
                            .await;
                            frame_error = true;
                            break;
                        }
                    }
                }

                if context.cancel_token.is_cancelled() {
                    break;
                }

                // Only a connection that carried events counts as healthy; one
                // that closes straight away keeps climbing the backoff.
                if progress.delivered {
                    reconnect_attempt = 0;
                }
                if immediate_reconnect && progress.delivered && !skipped_backoff {
                    skipped_backoff = true;
                    tracing::debug!("event stream closed by server, reconnecting now");
                    continue;
                }
                if !frame_error {
                    publish_status(
                        context.status_store,
                        context.session,
                        StreamConnectionState::Reconnecting,
                        Some("event stream closed by server".to_string()),
                    )
                    .await;
                }
            }
            Err(error) => {
                publish_status_throttled(
                    context,
                    StreamConnectionState::Reconnecting,
                    Some(format!("event stream connect error: {error}")),
                )
                .await;
            }
        }

        skipped_backoff = false;
        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = context.cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn handle_frame(
    message: Message,
    context: &StreamRuntimeContext<'_>,
    progress: &mut ConnectionProgress,
) -> StreamDirective {
    match decode_frame(message) {
        FrameOutcome::Event(event) => {
            let outcome = context.log.write().append(event);
            match outcome {
                AppendOutcome::Appended { gap } => {
                    progress.delivered = true;
                    if let Some((expected, found)) = gap {
                        tracing::debug!(expected, found, "sequence gap in event stream");
                    }
                    if progress.degraded {
                        progress.degraded = false;
                        publish_status(
                            context.status_store,
                            context.session,
                            StreamConnectionState::Live,
                            Some("event stream recovered".to_string()),
                        )
                        .await;
                    }
                }
                AppendOutcome::Stale { current, last } => {
                    tracing::debug!(current, last, "dropping stale stream message");
                }
            }
            StreamDirective::Continue
        }
        FrameOutcome::Malformed(error) => {
            progress.degraded = true;
            publish_status_throttled(
                context,
                StreamConnectionState::Error,
                Some(format!("failed to decode stream message: {error}")),
            )
            .await;
            StreamDirective::Continue
        }
        FrameOutcome::Closed => StreamDirective::ImmediateReconnect,
        FrameOutcome::Ignored => StreamDirective::Continue,
    }
}

async fn publish_status(
    status_store: &Arc<RwLock<ReconcilerStatusSnapshot>>,
    session: &MetricsSession,
    state: StreamConnectionState,
    reason: Option<String>,
) {
    let telemetry = session.telemetry();
    let snapshot = ReconcilerStatusSnapshot {
        state,
        poller_state: session.poller_state(),
        processed_count: telemetry.processed_count,
        last_sequence: telemetry.last_sequence,
        tracked_metrics: telemetry.tracked_metrics,
        last_snapshot_at_ms: telemetry.last_snapshot_at_ms,
        snapshot_failures: telemetry.snapshot_failures,
        reason,
    };

    let previous_state = {
        let mut writable = status_store.write().await;
        let previous_state = writable.state;
        *writable = snapshot.clone();
        previous_state
    };

    if previous_state != state {
        tracing::info!(?state, reason = ?snapshot.reason, "reconciler status changed");
    } else {
        tracing::debug!(?state, processed = snapshot.processed_count, "reconciler status");
    }
}

fn allow_status_publish(
    throttle: &Mutex<StatusPublishThrottle>,
    state: StreamConnectionState,
    reason: &Option<String>,
) -> bool {
    let mut writable = throttle.lock();
    let now = Instant::now();
    let should_throttle = matches!(
        state,
        StreamConnectionState::Error | StreamConnectionState::Reconnecting
    );

    if should_throttle
        && writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

async fn publish_status_throttled(
    context: &StreamRuntimeContext<'_>,
    state: StreamConnectionState,
    reason: Option<String>,
) {
    if !allow_status_publish(context.status_throttle, state, &reason) {
        return;
    }

    if let Some(detail) = reason.as_deref() {
        tracing::warn!(?state, "{detail}");
    }
    publish_status(context.status_store, context.session, state, reason).await;
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = now_unix_ms().unsigned_abs() % 250;
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::types::{EventMessage, MetricSource, StartReconcilerArgs};
    use futures_util::SinkExt;
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;
    use tokio_tungstenite::WebSocketStream;

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Loopback websocket server; `script` runs once per accepted connection
    /// and receives its zero-based index.
    async fn spawn_stream_server<F, Fut>(script: F) -> (String, Arc<AtomicUsize>)
    where
        F: Fn(usize, ServerSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("loopback listener should bind");
        let address = listener.local_addr().expect("listener should have an address");
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let script = Arc::new(script);

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    if let Ok(socket) = tokio_tungstenite::accept_async(tcp).await {
                        script(index, socket).await;
                    }
                });
            }
        });

        (format!("ws://{address}"), accepted)
    }

    async fn send_text(socket: &mut ServerSocket, payload: &str) {
        socket
            .send(Message::Text(payload.to_string()))
            .await
            .expect("server send should succeed");
    }

    async fn drain(mut socket: ServerSocket) {
        while let Some(Ok(_)) = socket.next().await {}
    }

    async fn wait_for<C: Fn() -> bool>(deadline: Duration, condition: C) -> bool {
        let started_at = Instant::now();
        loop {
            if condition() {
                return true;
            }
            if started_at.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    struct StreamFixture {
        session: MetricsSession,
        log: SharedEventLog,
        status_store: Arc<RwLock<ReconcilerStatusSnapshot>>,
        status_throttle: Mutex<StatusPublishThrottle>,
        cancel_token: CancellationToken,
    }

    impl StreamFixture {
        fn new() -> Self {
            Self {
                session: MetricsSession::new(Duration::from_millis(500)),
                log: SharedEventLog::default(),
                status_store: Arc::new(RwLock::new(ReconcilerStatusSnapshot::stopped(None))),
                status_throttle: Mutex::new(StatusPublishThrottle::default()),
                cancel_token: CancellationToken::new(),
            }
        }

        fn context<'a>(&'a self, stream_url: &'a str) -> StreamRuntimeContext<'a> {
            StreamRuntimeContext {
                stream_url,
                session: &self.session,
                log: &self.log,
                status_store: &self.status_store,
                status_throttle: &self.status_throttle,
                cancel_token: &self.cancel_token,
            }
        }

        fn status_is(&self, state: StreamConnectionState, reason: Option<&str>) -> bool {
            self.status_store
                .try_read()
                .map(|status| {
                    status.state == state
                        && reason.map_or(true, |expected| status.reason.as_deref() == Some(expected))
                })
                .unwrap_or(false)
        }

        /// Drives the websocket source until `condition` holds or `deadline`
        /// passes, then cancels it.
        async fn run_until<C: Fn(&Self) -> bool>(
            &self,
            stream_url: &str,
            deadline: Duration,
            condition: C,
        ) -> bool {
            let context = self.context(stream_url);
            let watcher = async {
                let reached = wait_for(deadline, || condition(self)).await;
                self.cancel_token.cancel();
                reached
            };
            let ((), reached) = tokio::join!(run_websocket_source(&context), watcher);
            reached
        }
    }

    fn message(sequence: u64, name: &str, value: f64) -> EventMessage {
        EventMessage {
            sequence,
            fields: BTreeMap::from([(name.to_string(), value)]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fold_pending_compacts_consumed_log() {
        let session = MetricsSession::new(Duration::from_millis(500));
        let log = SharedEventLog::default();
        for sequence in 1..=4 {
            let _ = log.write().append(message(sequence, "success_rate", sequence as f64));
        }

        let changed = fold_pending(&session, &log, 4);
        assert_eq!(changed.len(), 1);
        assert!(log.read().is_empty());
        assert_eq!(log.read().epoch(), 1);

        let _ = log.write().append(message(5, "success_rate", 5.0));
        let _ = fold_pending(&session, &log, 4);
        assert_eq!(session.merged_values().get("success_rate"), Some(&5.0));
        assert_eq!(session.telemetry().processed_count, 5);
        assert_eq!(session.telemetry().cursor_resets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fold_pending_keeps_short_log() {
        let session = MetricsSession::new(Duration::from_millis(500));
        let log = SharedEventLog::default();
        let _ = log.write().append(message(1, "success_rate", 97.0));

        let _ = fold_pending(&session, &log, 64);
        let _ = fold_pending(&session, &log, 64);
        assert_eq!(log.read().len(), 1);
        assert_eq!(session.processed_count(), 1);
    }

    #[test]
    fn throttles_repeated_error_statuses() {
        let throttle = Mutex::new(StatusPublishThrottle::default());
        let reason = Some("event stream connect error".to_string());

        assert!(allow_status_publish(
            &throttle,
            StreamConnectionState::Reconnecting,
            &reason
        ));
        assert!(!allow_status_publish(
            &throttle,
            StreamConnectionState::Reconnecting,
            &reason
        ));
        assert!(allow_status_publish(
            &throttle,
            StreamConnectionState::Live,
            &reason
        ));
        assert!(allow_status_publish(
            &throttle,
            StreamConnectionState::Live,
            &reason
        ));
    }

    #[test]
    fn reconnect_delay_is_capped() {
        assert!(reconnect_delay(1) >= Duration::from_millis(400));
        assert!(reconnect_delay(1) < Duration::from_millis(650));
        assert_eq!(reconnect_delay(30), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_reconciler_merges_both_sources() {
        let config = StartReconcilerArgs {
            mock_mode: Some(true),
            ..Default::default()
        }
        .normalize()
        .expect("mock config should be valid");
        let session = Arc::new(MetricsSession::new(Duration::from_millis(
            config.freshness_window_ms,
        )));
        let status_store = Arc::new(RwLock::new(ReconcilerStatusSnapshot::stopped(None)));
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(run_reconciler(
            config,
            Arc::clone(&session),
            Arc::clone(&status_store),
            cancel_token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(3_100)).await;

        let total = session
            .metric("total_verifications")
            .expect("snapshot should bootstrap total_verifications");
        assert_eq!(total.source, MetricSource::Snapshot);
        assert_eq!(total.value, 1_000.0);
        assert_eq!(
            session.metric("success_rate").map(|entry| entry.source),
            Some(MetricSource::Stream)
        );
        assert_eq!(status_store.read().await.state, StreamConnectionState::Live);
        assert!(status_store.read().await.processed_count >= 4);

        cancel_token.cancel();
        handle.await.expect("reconciler task should finish");

        let status = status_store.read().await.clone();
        assert_eq!(status.state, StreamConnectionState::Stopped);
        assert!(!session.is_polling());
    }

    #[tokio::test]
    async fn reconnect_folds_messages_left_by_closed_connection() {
        let (url, accepted) = spawn_stream_server(|index, mut socket| async move {
            if index == 0 {
                send_text(&mut socket, r#"{"sequence":1,"data":{"success_rate":97}}"#).await;
                let _ = socket.close(None).await;
            }
            drain(socket).await;
        })
        .await;

        let fixture = StreamFixture::new();
        let reached = fixture
            .run_until(&url, Duration::from_secs(5), |fixture| {
                fixture.log.read().epoch() >= 2
            })
            .await;

        assert!(reached, "second connection never opened");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.session.merged_values().get("success_rate"), Some(&97.0));
        assert_eq!(
            fixture.session.metric("success_rate").map(|entry| entry.source),
            Some(MetricSource::Stream)
        );
        assert!(fixture.log.read().is_empty());
    }

    #[tokio::test]
    async fn server_close_without_events_backs_off() {
        let (url, accepted) = spawn_stream_server(|_, mut socket| async move {
            let _ = socket.close(None).await;
            drain(socket).await;
        })
        .await;

        let fixture = StreamFixture::new();
        let reached = fixture
            .run_until(&url, Duration::from_millis(1_000), |_| false)
            .await;

        assert!(!reached);
        let connections = accepted.load(Ordering::SeqCst);
        assert!(connections >= 1);
        assert!(connections <= 3, "reconnected {connections} times in one second");
        assert!(fixture.status_is(StreamConnectionState::Reconnecting, None));
    }

    #[tokio::test]
    async fn malformed_frame_degrades_until_next_event() {
        let resume = Arc::new(Notify::new());
        let server_resume = Arc::clone(&resume);
        let (url, _) = spawn_stream_server(move |_, mut socket| {
            let resume = Arc::clone(&server_resume);
            async move {
                send_text(&mut socket, r#"{"sequence":1,"data":{"success_rate":97}}"#).await;
                send_text(&mut socket, "not json").await;
                resume.notified().await;
                send_text(&mut socket, r#"{"sequence":1,"data":{"success_rate":10}}"#).await;
                send_text(&mut socket, r#"{"sequence":2,"data":{"success_rate":98}}"#).await;
                drain(socket).await;
            }
        })
        .await;

        let fixture = StreamFixture::new();
        let context = fixture.context(&url);
        let script = async {
            let errored = wait_for(Duration::from_secs(5), || {
                fixture.status_is(StreamConnectionState::Error, None)
            })
            .await;
            resume.notify_one();
            let recovered = wait_for(Duration::from_secs(5), || {
                fixture.status_is(StreamConnectionState::Live, Some("event stream recovered"))
            })
            .await;
            fixture.cancel_token.cancel();
            (errored, recovered)
        };
        let ((), (errored, recovered)) = tokio::join!(run_websocket_source(&context), script);

        assert!(errored, "malformed frame never surfaced as an error status");
        assert!(recovered, "stream never recovered to live");
        let sequences: Vec<u64> = fixture
            .log
            .read()
            .messages()
            .iter()
            .map(|message| message.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(
            fixture.log.read().messages()[1].fields.get("success_rate"),
            Some(&98.0)
        );
    }
}
