use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use chrono::{DateTime, Utc};
use futures::{AsyncBufRead, AsyncBufReadExt, FutureExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use tokio::sync::mpsc;
use tracing::debug;

use kubetap_types::{ColorToken, EndpointIdentity, Error, LineKind, LineRecord};

use crate::filter::LineFilter;
use crate::parser::LogParser;

/// Lines buffered between a log reader task and its consumer
const LINE_BUFFER: usize = 256;

/// Raw lines read from one container's log
pub type LineStream = BoxStream<'static, Result<String, Error>>;

/// Where a log read starts
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogRequest {
    pub container: Option<String>,
    /// Only lines newer than this (None = no age bound)
    pub since: Option<Duration>,
    /// Replay at most this many existing lines (None = all)
    pub tail: Option<i64>,
    /// Drop lines stamped at or before this instant
    pub resume_after: Option<DateTime<Utc>>,
}

impl LogRequest {
    /// Request that continues a log after the last line seen at `last`
    ///
    /// The server only takes whole seconds, so the window is rounded up and
    /// lines already seen are dropped by timestamp instead.
    pub fn resumed(&self, last: DateTime<Utc>) -> Self {
        let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
        Self {
            container: self.container.clone(),
            since: Some(Duration::from_secs(elapsed.as_secs() + 1)),
            tail: None,
            resume_after: Some(last),
        }
    }
}

/// A followable log source for pods
pub trait LogSource: Send + Sync + 'static {
    /// Start following the log of `target`
    fn open<'a>(
        &'a self,
        target: &'a EndpointIdentity,
        request: &'a LogRequest,
    ) -> BoxFuture<'a, Result<LineStream, Error>>;
}

impl<T: LogSource> LogSource for Arc<T> {
    fn open<'a>(
        &'a self,
        target: &'a EndpointIdentity,
        request: &'a LogRequest,
    ) -> BoxFuture<'a, Result<LineStream, Error>> {
        (**self).open(target, request)
    }
}

/// Log source backed by the pod log API
#[derive(Clone)]
pub struct KubeLogSource {
    client: kube::Client,
}

impl KubeLogSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl LogSource for KubeLogSource {
    fn open<'a>(
        &'a self,
        target: &'a EndpointIdentity,
        request: &'a LogRequest,
    ) -> BoxFuture<'a, Result<LineStream, Error>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let pod = target.name.clone();
        let params = LogParams {
            follow: true,
            container: request.container.clone(),
            since_seconds: request
                .since
                .map(|since| i64::try_from(since.as_secs().max(1)).unwrap_or(i64::MAX)),
            tail_lines: request.tail,
            timestamps: true,
            ..Default::default()
        };
        let source = match &request.container {
            Some(container) => format!("{} {}", target, container),
            None => target.to_string(),
        };

        let (tx, rx) = mpsc::channel(LINE_BUFFER);

        // Reader task; ends when the consumer drops the stream
        tokio::spawn(async move {
            let transport = |message: String| Error::Transport {
                target: source.clone(),
                message,
            };

            let reader = match api.log_stream(&pod, &params).await {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = tx.send(Err(transport(e.to_string()))).await;
                    return;
                }
            };
            debug!(source = %source, "Log stream opened");

            let mut reader = reader;
            let mut buf = Vec::new();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,

                    next = read_line(&mut reader, &mut buf) => match next {
                        Ok(Some(line)) => {
                            if tx.send(Ok(line)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(transport(e.to_string()))).await;
                            break;
                        }
                    }
                }
            }
        });

        futures::future::ready(Ok(receiver_stream(rx))).boxed()
    }
}

/// Read one line, replacing invalid UTF-8 instead of failing
///
/// Returns `None` at end of input. A final line without a newline is still
/// returned.
pub(crate) async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Adapt a channel receiver into a line stream
fn receiver_stream(rx: mpsc::Receiver<Result<String, Error>>) -> LineStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// One pod container's filtered, rendered log
#[derive(Debug)]
pub struct LogStream {
    identity: EndpointIdentity,
    request: LogRequest,
    filter: Arc<LineFilter>,
    color: ColorToken,
}

impl LogStream {
    pub fn new(
        identity: EndpointIdentity,
        request: LogRequest,
        filter: Arc<LineFilter>,
        color: ColorToken,
    ) -> Self {
        Self {
            identity,
            request,
            filter,
            color,
        }
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    pub fn container(&self) -> Option<&str> {
        self.request.container.as_deref()
    }

    pub fn color(&self) -> ColorToken {
        self.color
    }

    /// Turn one raw line into a tagged record, or `None` if filtered out
    pub fn render(&self, raw: &str) -> Option<LineRecord> {
        let (timestamp, text) = LogParser::split_timestamp(raw);
        if let (Some(after), Some(ts)) = (self.request.resume_after, timestamp) {
            if ts <= after {
                return None;
            }
        }
        if !self.filter.matches(text) {
            return None;
        }

        let record = LineRecord::new(
            self.identity.clone(),
            self.request.container.clone(),
            LineKind::Stdout,
            self.color,
            text,
        );
        Some(match timestamp {
            Some(ts) => record.with_timestamp(ts),
            None => record,
        })
    }

    /// Follow the source, yielding rendered records until it closes
    ///
    /// Nothing is read until the returned stream is polled. A failed read
    /// yields one `Transport` error.
    pub fn open<S: LogSource>(self, source: Arc<S>) -> BoxStream<'static, Result<LineRecord, Error>> {
        let stream = Arc::new(self);
        let opener = Arc::clone(&stream);

        futures::stream::once(async move {
            source.open(&opener.identity, &opener.request).await
        })
        .try_flatten()
        .try_filter_map(move |raw| futures::future::ready(Ok(stream.render(&raw))))
        .boxed()
    }
}
