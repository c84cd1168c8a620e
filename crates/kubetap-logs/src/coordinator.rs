use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use kubetap_k8s::{ClusterSource, Resolver, SelectionPattern};
use kubetap_types::{
    ColorToken, EndpointIdentity, EndpointKind, Error, LineKind, LineRecord, PodInfo, PodStatus,
    StopHandle, namespace_scope,
};

use crate::filter::LineFilter;
use crate::stream::{LogRequest, LogSource, LogStream};

/// Shortest pod listing period; a zero interval would spin
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Settings shared by every stream a coordinator opens
#[derive(Clone, Debug)]
pub struct FanOutConfig {
    /// Containers to follow in each pod (None = all)
    pub container: Option<Regex>,
    pub since: Option<Duration>,
    pub tail: Option<i64>,
    pub filter: Arc<LineFilter>,

    /// Keep polling for new pods instead of stopping when all streams end
    pub follow_new: bool,
    /// Raised to `MIN_POLL_INTERVAL` if shorter
    pub poll_interval: Duration,

    /// How long draining waits for streams to report closure
    pub grace_period: Duration,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            container: None,
            since: None,
            tail: None,
            filter: Arc::new(LineFilter::default()),
            follow_new: false,
            poll_interval: Duration::from_secs(3),
            grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Resolving,
    Streaming,
    Draining,
    Stopped,
}

/// Counters reported when a coordinator finishes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOutSummary {
    /// Distinct streams started (reopens not counted)
    pub streams_opened: usize,
    /// Streams aborted because they outlived the grace period
    pub abandoned: usize,
}

/// One pod container followed by one task
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StreamKey {
    identity: EndpointIdentity,
    container: Option<String>,
}

#[derive(Debug)]
enum UnitExit {
    Closed,
    Failed(Error),
}

#[derive(Debug)]
struct ExitReport {
    key: StreamKey,
    exit: UnitExit,
    /// Timestamp of the last line forwarded
    last_seen: Option<DateTime<Utc>>,
}

struct ActiveStream {
    stop: StopHandle,
    task: JoinHandle<()>,
    request: LogRequest,
    color: ColorToken,
    reopened: bool,
    /// Container restart count when the stream was opened
    restarts: i32,
    /// Pod vanished and the stream was asked to stop
    closing: bool,
}

/// A stream that ended on its own
#[derive(Clone, Copy, Debug)]
struct Finished {
    restarts: i32,
    color: ColorToken,
}

/// Bookkeeping owned by the control loop
#[derive(Default)]
struct Fleet {
    active: HashMap<StreamKey, ActiveStream>,
    /// Not reopened until the container restarts or the pod leaves the listing
    finished: HashMap<StreamKey, Finished>,
    created: usize,
    summary: FanOutSummary,
}

type Snapshot = Result<Vec<PodInfo>, Error>;

/// Opens one log stream per matching pod container and merges their lines
pub struct Coordinator<C, L> {
    resolver: Arc<Resolver<C>>,
    source: Arc<L>,
    pattern: SelectionPattern,
    config: FanOutConfig,
    stop: StopHandle,
    state: watch::Sender<CoordinatorState>,
}

impl<C: ClusterSource, L: LogSource> Coordinator<C, L> {
    pub fn new(
        resolver: Resolver<C>,
        source: L,
        pattern: SelectionPattern,
        mut config: FanOutConfig,
    ) -> Self {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        let (state, _) = watch::channel(CoordinatorState::Idle);
        Self {
            resolver: Arc::new(resolver),
            source: Arc::new(source),
            pattern,
            config,
            stop: StopHandle::new(),
            state,
        }
    }

    /// Handle that drains and stops the coordinator
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Run until stopped or, in one-shot mode, until every stream has closed
    ///
    /// Lines from all streams are sent to `sink` as they arrive.
    pub async fn run(
        self,
        sink: mpsc::UnboundedSender<LineRecord>,
    ) -> Result<FanOutSummary, Error> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ExitReport>();
        let mut fleet = Fleet::default();

        self.set_state(CoordinatorState::Resolving);

        let (mut snapshots, poller) = if self.config.follow_new {
            let (tx, rx) = mpsc::channel(1);
            let poller = tokio::spawn(poll_cluster(
                Arc::clone(&self.resolver),
                self.pattern.clone(),
                self.config.poll_interval,
                self.stop.clone(),
                tx,
            ));
            (Some(rx), Some(poller))
        } else {
            (None, None)
        };

        if !self.config.follow_new {
            let resolved = tokio::select! {
                _ = self.stop.stopped() => Ok(Vec::new()),
                result = self.resolver.resolve_pods(&self.pattern) => result,
            };
            let pods = match resolved {
                Ok(pods) if pods.is_empty() && !self.stop.is_stopped() => {
                    self.set_state(CoordinatorState::Stopped);
                    return Err(self.no_match());
                }
                Ok(pods) => pods,
                Err(e) => {
                    self.set_state(CoordinatorState::Stopped);
                    return Err(e);
                }
            };
            self.reconcile(&mut fleet, pods, &sink, &exit_tx);

            if fleet.active.is_empty() && !self.stop.is_stopped() {
                self.set_state(CoordinatorState::Stopped);
                return Err(Error::NothingToStream {
                    pattern: self.pattern.as_str().to_string(),
                    scope: namespace_scope(self.pattern.namespace()),
                });
            }
        }

        let mut first_snapshot = true;
        let mut outcome = Ok(());

        loop {
            if !self.config.follow_new && fleet.active.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.stop.stopped() => break,

                Some(report) = exit_rx.recv() => {
                    self.handle_exit(&mut fleet, report, &sink, &exit_tx);
                }

                snapshot = next_snapshot(&mut snapshots) => match snapshot {
                    Some(Ok(pods)) => {
                        if first_snapshot && pods.is_empty() && !self.pattern.is_regex() {
                            outcome = Err(self.no_match());
                            break;
                        }
                        first_snapshot = false;
                        self.reconcile(&mut fleet, pods, &sink, &exit_tx);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(pattern = self.pattern.as_str(), error = %e, "Pod listing failed, retrying");
                    }
                    // Only the poller closes this channel
                    None => {
                        if !self.stop.is_stopped() {
                            outcome = Err(Error::Resolution {
                                kind: EndpointKind::Pod,
                                scope: namespace_scope(self.pattern.namespace()),
                                message: "pod poller ended unexpectedly".to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        }

        if let Some(poller) = poller {
            poller.abort();
        }
        self.drain(&mut fleet, &mut exit_rx, &sink).await;

        outcome.map(|()| fleet.summary)
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.send_replace(state);
        tracing::debug!(?state, "Coordinator state changed");
    }

    fn no_match(&self) -> Error {
        Error::NoMatch {
            kind: EndpointKind::Pod,
            pattern: self.pattern.as_str().to_string(),
            scope: namespace_scope(self.pattern.namespace()),
        }
    }

    /// Pod containers in a listing that should be streamed, with restart counts
    fn wanted(&self, pods: &[PodInfo]) -> Vec<(StreamKey, i32)> {
        let mut keys = Vec::new();
        for pod in pods {
            // No log endpoint until the containers start
            if pod.status == PodStatus::Pending {
                continue;
            }

            let identity = pod.identity();
            if pod.containers.is_empty() {
                if self.config.container.is_none() {
                    keys.push((
                        StreamKey {
                            identity,
                            container: None,
                        },
                        0,
                    ));
                }
                continue;
            }

            for container in &pod.containers {
                if let Some(re) = &self.config.container {
                    if !re.is_match(&container.name) {
                        continue;
                    }
                }
                keys.push((
                    StreamKey {
                        identity: identity.clone(),
                        container: Some(container.name.clone()),
                    },
                    container.restart_count,
                ));
            }
        }
        keys
    }

    /// Open streams for new pod containers and close those whose pod is gone
    fn reconcile(
        &self,
        fleet: &mut Fleet,
        pods: Vec<PodInfo>,
        sink: &mpsc::UnboundedSender<LineRecord>,
        exit_tx: &mpsc::UnboundedSender<ExitReport>,
    ) {
        let wanted = self.wanted(&pods);

        if self.config.follow_new {
            let listed: HashSet<&StreamKey> = wanted.iter().map(|(key, _)| key).collect();
            fleet.finished.retain(|key, _| listed.contains(key));

            for (key, active) in fleet.active.iter_mut() {
                if !active.closing && !listed.contains(key) {
                    tracing::debug!(pod = %key.identity, "Pod gone, closing stream");
                    active.closing = true;
                    active.stop.stop();
                }
            }
        }

        for (key, restarts) in wanted {
            if fleet.active.contains_key(&key) {
                continue;
            }

            let color = match fleet.finished.get(&key) {
                Some(done) if restarts <= done.restarts => continue,
                Some(done) => {
                    tracing::debug!(pod = %key.identity, container = ?key.container, restarts, "Container restarted, following again");
                    let color = done.color;
                    fleet.finished.remove(&key);
                    color
                }
                None => {
                    let color = ColorToken::for_stream(fleet.created);
                    fleet.created += 1;
                    fleet.summary.streams_opened += 1;
                    color
                }
            };

            let _ = sink.send(control(&key, color, "+ stream opened"));
            let request = self.request_for(&key);
            let active = ActiveStream {
                restarts,
                ..self.spawn_unit(key.clone(), request, color, sink, exit_tx)
            };
            fleet.active.insert(key, active);
        }

        if !fleet.active.is_empty() && *self.state.borrow() == CoordinatorState::Resolving {
            self.set_state(CoordinatorState::Streaming);
        }
    }

    fn handle_exit(
        &self,
        fleet: &mut Fleet,
        report: ExitReport,
        sink: &mpsc::UnboundedSender<LineRecord>,
        exit_tx: &mpsc::UnboundedSender<ExitReport>,
    ) {
        let ExitReport {
            key,
            exit,
            last_seen,
        } = report;
        let Some(active) = fleet.active.remove(&key) else {
            return;
        };

        match exit {
            UnitExit::Closed => {
                tracing::debug!(pod = %key.identity, container = ?key.container, "Stream closed");
                let _ = sink.send(control(&key, active.color, "- stream closed"));
                if !active.closing {
                    fleet.finished.insert(key, active.finished());
                }
            }
            UnitExit::Failed(err) => {
                let _ = sink.send(LineRecord::new(
                    key.identity.clone(),
                    key.container.clone(),
                    LineKind::Stderr,
                    active.color,
                    err.to_string(),
                ));

                let retry = err.is_recoverable()
                    && !active.reopened
                    && !active.closing
                    && !self.stop.is_stopped();
                if retry {
                    tracing::info!(pod = %key.identity, error = %err, "Reopening log stream");
                    // Continue after the last line shown rather than replaying
                    let request = match last_seen {
                        Some(last) => active.request.resumed(last),
                        None => active.request.clone(),
                    };
                    let reopened = ActiveStream {
                        reopened: true,
                        restarts: active.restarts,
                        ..self.spawn_unit(key.clone(), request, active.color, sink, exit_tx)
                    };
                    fleet.active.insert(key, reopened);
                } else {
                    tracing::warn!(pod = %key.identity, error = %err, "Dropping log stream");
                    if !active.closing {
                        fleet.finished.insert(key, active.finished());
                    }
                }
            }
        }
    }

    fn request_for(&self, key: &StreamKey) -> LogRequest {
        LogRequest {
            container: key.container.clone(),
            since: self.config.since,
            tail: self.config.tail,
            resume_after: None,
        }
    }

    fn spawn_unit(
        &self,
        key: StreamKey,
        request: LogRequest,
        color: ColorToken,
        sink: &mpsc::UnboundedSender<LineRecord>,
        exit_tx: &mpsc::UnboundedSender<ExitReport>,
    ) -> ActiveStream {
        let stop = self.stop.child();
        let mut lines = LogStream::new(
            key.identity.clone(),
            request.clone(),
            Arc::clone(&self.config.filter),
            color,
        )
        .open(Arc::clone(&self.source));

        let unit_stop = stop.clone();
        let sink = sink.clone();
        let exit_tx = exit_tx.clone();

        let task = tokio::spawn(async move {
            let mut last_seen = None;
            let exit = loop {
                tokio::select! {
                    biased;

                    _ = unit_stop.stopped() => break UnitExit::Closed,

                    next = lines.next() => match next {
                        Some(Ok(record)) => {
                            last_seen = Some(record.timestamp);
                            if sink.send(record).is_err() {
                                break UnitExit::Closed;
                            }
                        }
                        Some(Err(e)) => break UnitExit::Failed(e),
                        None => break UnitExit::Closed,
                    }
                }
            };
            let _ = exit_tx.send(ExitReport {
                key,
                exit,
                last_seen,
            });
        });

        ActiveStream {
            stop,
            task,
            request,
            color,
            reopened: false,
            restarts: 0,
            closing: false,
        }
    }

    /// Stop every stream and wait for their closure reports
    async fn drain(
        &self,
        fleet: &mut Fleet,
        exit_rx: &mut mpsc::UnboundedReceiver<ExitReport>,
        sink: &mpsc::UnboundedSender<LineRecord>,
    ) {
        self.set_state(CoordinatorState::Draining);
        for active in fleet.active.values() {
            active.stop.stop();
        }

        let deadline = Instant::now() + self.config.grace_period;
        while !fleet.active.is_empty() {
            match tokio::time::timeout_at(deadline, exit_rx.recv()).await {
                Ok(Some(report)) => {
                    if let Some(active) = fleet.active.remove(&report.key) {
                        let _ = sink.send(control(&report.key, active.color, "- stream closed"));
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        for (key, active) in fleet.active.drain() {
            tracing::warn!(pod = %key.identity, container = ?key.container, "Stream did not close in time, aborting");
            active.task.abort();
            fleet.summary.abandoned += 1;
        }

        self.set_state(CoordinatorState::Stopped);
    }
}

impl ActiveStream {
    fn finished(&self) -> Finished {
        Finished {
            restarts: self.restarts,
            color: self.color,
        }
    }
}

fn control(key: &StreamKey, color: ColorToken, text: &str) -> LineRecord {
    LineRecord::new(
        key.identity.clone(),
        key.container.clone(),
        LineKind::Control,
        color,
        text,
    )
}

async fn next_snapshot(snapshots: &mut Option<mpsc::Receiver<Snapshot>>) -> Option<Snapshot> {
    match snapshots {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Re-list matching pods every `interval` until stopped
async fn poll_cluster<C: ClusterSource>(
    resolver: Arc<Resolver<C>>,
    pattern: SelectionPattern,
    interval: Duration,
    stop: StopHandle,
    tx: mpsc::Sender<Snapshot>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = tokio::select! {
            _ = stop.stopped() => break,
            result = resolver.resolve_pods(&pattern) => result,
        };

        if tx.send(snapshot).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tests::{FakeLog, FakeLogs};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use kubetap_types::ContainerInfo;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCluster {
        pods: Mutex<Vec<PodInfo>>,
        fail: Mutex<bool>,
        crash: Mutex<bool>,
    }

    impl FakeCluster {
        fn with(pods: Vec<PodInfo>) -> Arc<Self> {
            let cluster = Self::default();
            *cluster.pods.lock().unwrap() = pods;
            Arc::new(cluster)
        }
    }

    impl ClusterSource for FakeCluster {
        fn list_pods<'a>(
            &'a self,
            namespace: Option<&'a str>,
            _labels: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Vec<PodInfo>, Error>> {
            async move {
                if *self.crash.lock().unwrap() {
                    panic!("cluster listing crashed");
                }
                if *self.fail.lock().unwrap() {
                    return Err(Error::Resolution {
                        kind: EndpointKind::Pod,
                        scope: namespace_scope(namespace),
                        message: "unauthorized".to_string(),
                    });
                }
                Ok(self
                    .pods
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|p| namespace.is_none_or(|ns| ns == p.namespace))
                    .cloned()
                    .collect())
            }
            .boxed()
        }

        fn list_services<'a>(
            &'a self,
            _namespace: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Vec<EndpointIdentity>, Error>> {
            async move { Ok(Vec::new()) }.boxed()
        }
    }

    fn pod(name: &str, containers: &[&str]) -> PodInfo {
        let mut pod = PodInfo::new(name.to_string(), "ops".to_string());
        pod.status = PodStatus::Running;
        pod.containers = containers
            .iter()
            .map(|c| ContainerInfo::new(c.to_string()))
            .collect();
        pod
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn continuous() -> FanOutConfig {
        FanOutConfig {
            follow_new: true,
            poll_interval: Duration::from_millis(20),
            grace_period: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn drain_records(rx: &mut mpsc::UnboundedReceiver<LineRecord>) -> Vec<LineRecord> {
        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        records
    }

    /// Wait for the first record matching `pred`
    async fn expect_record(
        rx: &mut mpsc::UnboundedReceiver<LineRecord>,
        pred: impl Fn(&LineRecord) -> bool,
    ) -> LineRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = rx.recv().await.expect("sink closed");
                if pred(&record) {
                    return record;
                }
            }
        })
        .await
        .expect("record not seen in time")
    }

    #[tokio::test]
    async fn test_one_stream_per_matching_pod_with_distinct_colors() {
        let cluster = FakeCluster::with(vec![
            pod("worker-1", &["app"]),
            pod("api-1", &["app"]),
            pod("worker-2", &["app"]),
        ]);
        let logs = FakeLogs::with(&[
            ("worker-1", FakeLog::Finite(lines(&["one", "two"]))),
            ("worker-2", FakeLog::Finite(lines(&["three"]))),
            ("api-1", FakeLog::Finite(lines(&["nope"]))),
        ]);
        let pattern = SelectionPattern::parse(Some("ops"), "worker-.*").unwrap();
        let coordinator = Coordinator::new(
            Resolver::new(cluster),
            logs,
            pattern,
            FanOutConfig::default(),
        );
        let state = coordinator.state();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = coordinator.run(tx).await.unwrap();
        assert_eq!(summary.streams_opened, 2);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(*state.borrow(), CoordinatorState::Stopped);

        let records = drain_records(&mut rx);
        let stdout: Vec<_> = records
            .iter()
            .filter(|r| r.kind == LineKind::Stdout)
            .collect();
        assert_eq!(stdout.len(), 3);
        assert!(stdout.iter().all(|r| r.source.name.starts_with("worker-")));

        let colors: HashSet<_> = stdout.iter().map(|r| (r.source.name.clone(), r.color)).collect();
        let distinct: HashSet<_> = colors.iter().map(|(_, c)| *c).collect();
        assert_eq!(colors.len(), 2);
        assert_eq!(distinct.len(), 2);

        let worker_1: Vec<_> = stdout
            .iter()
            .filter(|r| r.source.name == "worker-1")
            .map(|r| r.text.as_str())
            .collect();
        assert_eq!(worker_1, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_container_regex_and_pending_pods() {
        let mut waiting = pod("worker-2", &["app"]);
        waiting.status = PodStatus::Pending;
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app", "istio-proxy"]), waiting]);
        let logs = Arc::new(FakeLogs::with(&[(
            "worker-1",
            FakeLog::Finite(lines(&["x"])),
        )]));
        let config = FanOutConfig {
            container: Some(Regex::new("^app$").unwrap()),
            ..Default::default()
        };
        let pattern = SelectionPattern::parse(Some("ops"), "worker-.*").unwrap();
        let coordinator = Coordinator::new(Resolver::new(cluster), Arc::clone(&logs), pattern, config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = coordinator.run(tx).await.unwrap();
        assert_eq!(summary.streams_opened, 1);
        assert_eq!(logs.open_count("worker-2"), 0);

        let record = drain_records(&mut rx)
            .into_iter()
            .find(|r| r.kind == LineKind::Stdout)
            .unwrap();
        assert_eq!(record.container.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn test_literal_without_match_is_no_match() {
        for follow_new in [false, true] {
            let cluster = FakeCluster::with(vec![pod("worker-1", &["app"])]);
            let pattern = SelectionPattern::parse(Some("ops"), "missing").unwrap();
            let config = FanOutConfig {
                follow_new,
                ..continuous()
            };
            let coordinator =
                Coordinator::new(Resolver::new(cluster), FakeLogs::default(), pattern, config);
            let state = coordinator.state();

            let (tx, _rx) = mpsc::unbounded_channel();
            let err = coordinator.run(tx).await.unwrap_err();
            assert!(matches!(err, Error::NoMatch { .. }), "follow_new={}", follow_new);
            assert_eq!(*state.borrow(), CoordinatorState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_one_shot_resolution_failure_is_fatal() {
        let cluster = FakeCluster::with(Vec::new());
        *cluster.fail.lock().unwrap() = true;
        let pattern = SelectionPattern::parse(None, "worker-.*").unwrap();
        let coordinator = Coordinator::new(
            Resolver::new(cluster),
            FakeLogs::default(),
            pattern,
            FanOutConfig::default(),
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = coordinator.run(tx).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_reopens_once() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"])]);
        let logs = Arc::new(FakeLogs::with(&[("worker-1", FakeLog::Broken)]));
        let pattern = SelectionPattern::parse(Some("ops"), "worker-1").unwrap();
        let coordinator = Coordinator::new(
            Resolver::new(cluster),
            Arc::clone(&logs),
            pattern,
            FanOutConfig::default(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = coordinator.run(tx).await.unwrap();
        assert_eq!(summary.streams_opened, 1);
        assert_eq!(logs.open_count("worker-1"), 2);

        let records = drain_records(&mut rx);
        let errors: Vec<_> = records
            .iter()
            .filter(|r| r.kind == LineKind::Stderr)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].text.contains("connection reset"));
        assert_eq!(errors[0].color, errors[1].color);
    }

    #[tokio::test]
    async fn test_pod_appearing_later_gets_a_stream() {
        let cluster = FakeCluster::with(Vec::new());
        let logs = FakeLogs::with(&[("worker-9", FakeLog::Follow(lines(&["hello"])))]);
        let pattern = SelectionPattern::parse(Some("ops"), "worker-.*").unwrap();
        let coordinator =
            Coordinator::new(Resolver::new(Arc::clone(&cluster)), logs, pattern, continuous());
        let stop = coordinator.stop_handle();
        let mut state = coordinator.state();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(coordinator.run(tx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*state.borrow(), CoordinatorState::Resolving);

        cluster.pods.lock().unwrap().push(pod("worker-9", &["app"]));
        let record = expect_record(&mut rx, |r| r.kind == LineKind::Stdout).await;
        assert_eq!(record.text, "hello");
        assert_eq!(record.source, EndpointIdentity::pod("ops", "worker-9"));
        state
            .wait_for(|s| *s == CoordinatorState::Streaming)
            .await
            .unwrap();

        stop.stop();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.streams_opened, 1);
        assert_eq!(summary.abandoned, 0);
    }

    #[tokio::test]
    async fn test_stop_drains_every_stream() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"]), pod("worker-2", &["app"])]);
        let logs = FakeLogs::with(&[
            ("worker-1", FakeLog::Follow(lines(&["a"]))),
            ("worker-2", FakeLog::Follow(lines(&["b"]))),
        ]);
        let pattern = SelectionPattern::parse(Some("ops"), "worker-.*").unwrap();
        let coordinator = Coordinator::new(Resolver::new(cluster), logs, pattern, continuous());
        let stop = coordinator.stop_handle();
        let mut state = coordinator.state();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(coordinator.run(tx));
        state
            .wait_for(|s| *s == CoordinatorState::Streaming)
            .await
            .unwrap();

        stop.stop();
        stop.stop();
        let summary = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("coordinator did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(summary.streams_opened, 2);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(*state.borrow(), CoordinatorState::Stopped);

        let closed = drain_records(&mut rx)
            .into_iter()
            .filter(|r| r.kind == LineKind::Control && r.text.contains("closed"))
            .count();
        assert_eq!(closed, 2);
    }

    #[tokio::test]
    async fn test_vanished_pod_stream_is_closed() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"]), pod("worker-2", &["app"])]);
        let logs = FakeLogs::with(&[
            ("worker-1", FakeLog::Follow(Vec::new())),
            ("worker-2", FakeLog::Follow(Vec::new())),
        ]);
        let pattern = SelectionPattern::parse(Some("ops"), "worker-.*").unwrap();
        let coordinator =
            Coordinator::new(Resolver::new(Arc::clone(&cluster)), logs, pattern, continuous());
        let stop = coordinator.stop_handle();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(coordinator.run(tx));

        expect_record(&mut rx, |r| r.text.contains("opened") && r.source.name == "worker-2").await;
        cluster.pods.lock().unwrap().retain(|p| p.name != "worker-2");

        let closed = expect_record(&mut rx, |r| r.text.contains("closed")).await;
        assert_eq!(closed.source.name, "worker-2");

        stop.stop();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.abandoned, 0);
    }

    #[tokio::test]
    async fn test_finished_stream_is_not_reopened_while_listed() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"])]);
        let logs = Arc::new(FakeLogs::with(&[(
            "worker-1",
            FakeLog::Finite(lines(&["done"])),
        )]));
        let pattern = SelectionPattern::parse(Some("ops"), "worker-1").unwrap();
        let coordinator = Coordinator::new(
            Resolver::new(cluster),
            Arc::clone(&logs),
            pattern,
            continuous(),
        );
        let stop = coordinator.stop_handle();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(coordinator.run(tx));

        expect_record(&mut rx, |r| r.text.contains("closed")).await;
        // Several poll intervals with the pod still listed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(logs.open_count("worker-1"), 1);

        stop.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_one_shot_with_only_pending_pods_is_an_error() {
        let mut waiting = pod("worker-1", &["app"]);
        waiting.status = PodStatus::Pending;
        let cluster = FakeCluster::with(vec![waiting]);
        let logs = Arc::new(FakeLogs::default());
        let pattern = SelectionPattern::parse(Some("ops"), "worker-1").unwrap();
        let coordinator = Coordinator::new(
            Resolver::new(cluster),
            Arc::clone(&logs),
            pattern,
            FanOutConfig::default(),
        );
        let state = coordinator.state();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = coordinator.run(tx).await.unwrap_err();
        assert!(matches!(err, Error::NothingToStream { .. }));
        assert_eq!(*state.borrow(), CoordinatorState::Stopped);
        assert_eq!(logs.open_count("worker-1"), 0);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_is_raised_to_minimum() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"])]);
        let logs = FakeLogs::with(&[("worker-1", FakeLog::Follow(lines(&["hi"])))]);
        let pattern = SelectionPattern::parse(Some("ops"), "worker-1").unwrap();
        let config = FanOutConfig {
            poll_interval: Duration::ZERO,
            ..continuous()
        };
        let coordinator = Coordinator::new(Resolver::new(cluster), logs, pattern, config);
        assert_eq!(coordinator.config.poll_interval, MIN_POLL_INTERVAL);
        let stop = coordinator.stop_handle();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(coordinator.run(tx));

        let record = expect_record(&mut rx, |r| r.kind == LineKind::Stdout).await;
        assert_eq!(record.text, "hi");

        stop.stop();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.streams_opened, 1);
    }

    #[tokio::test]
    async fn test_poller_dying_fails_the_run() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"])]);
        let logs = FakeLogs::with(&[("worker-1", FakeLog::Follow(lines(&["hi"])))]);
        let pattern = SelectionPattern::parse(Some("ops"), "worker-1").unwrap();
        let coordinator =
            Coordinator::new(Resolver::new(Arc::clone(&cluster)), logs, pattern, continuous());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(coordinator.run(tx));

        expect_record(&mut rx, |r| r.kind == LineKind::Stdout).await;
        *cluster.crash.lock().unwrap() = true;

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("coordinator did not stop")
            .unwrap();
        assert!(matches!(result, Err(Error::Resolution { .. })));
    }

    #[tokio::test]
    async fn test_restarted_container_is_followed_again() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"])]);
        let logs = Arc::new(FakeLogs::with(&[(
            "worker-1",
            FakeLog::Finite(lines(&["boot"])),
        )]));
        let pattern = SelectionPattern::parse(Some("ops"), "worker-1").unwrap();
        let coordinator = Coordinator::new(
            Resolver::new(Arc::clone(&cluster)),
            Arc::clone(&logs),
            pattern,
            continuous(),
        );
        let stop = coordinator.stop_handle();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(coordinator.run(tx));

        let first = expect_record(&mut rx, |r| r.text.contains("closed")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(logs.open_count("worker-1"), 1);

        cluster.pods.lock().unwrap()[0].containers[0].restart_count = 1;
        let reopened = expect_record(&mut rx, |r| r.text.contains("opened")).await;
        assert_eq!(reopened.color, first.color);
        expect_record(&mut rx, |r| r.text.contains("closed")).await;
        assert_eq!(logs.open_count("worker-1"), 2);

        // Same restart count again does not reopen
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(logs.open_count("worker-1"), 2);

        stop.stop();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.streams_opened, 1);
    }

    #[tokio::test]
    async fn test_reopen_resumes_after_last_line() {
        let cluster = FakeCluster::with(vec![pod("worker-1", &["app"])]);
        let logs = Arc::new(FakeLogs::with(&[(
            "worker-1",
            FakeLog::LinesThenBroken(lines(&[
                "2024-01-15T10:30:00Z one",
                "2024-01-15T10:30:01Z two",
            ])),
        )]));
        let pattern = SelectionPattern::parse(Some("ops"), "worker-1").unwrap();
        let config = FanOutConfig {
            tail: Some(10),
            ..Default::default()
        };
        let coordinator =
            Coordinator::new(Resolver::new(cluster), Arc::clone(&logs), pattern, config);

        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.run(tx).await.unwrap();

        let requests = logs.requests("worker-1");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tail, Some(10));
        assert_eq!(requests[0].resume_after, None);
        assert_eq!(requests[1].tail, None);
        assert!(requests[1].since.is_some());
        assert_eq!(
            requests[1].resume_after.map(|ts| ts.to_rfc3339()).as_deref(),
            Some("2024-01-15T10:30:01+00:00")
        );

        // The replayed lines are not shown twice
        let stdout: Vec<_> = drain_records(&mut rx)
            .into_iter()
            .filter(|r| r.kind == LineKind::Stdout)
            .map(|r| r.text)
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
    }
}
