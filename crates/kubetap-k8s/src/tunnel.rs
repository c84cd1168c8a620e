//! Port-forward tunnels to a single pod or service
//!
//! A session runs as two tasks sharing one stop signal: the forward loop
//! (handshake, local listeners, per-connection relays) and a supervisor
//! that waits for readiness, relays informational output and turns remote
//! error payloads into an implicit stop.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::ListParams;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use kubetap_types::{
    EndpointIdentity, EndpointKind, Error, PodInfo, PodStatus, PortPair, Readiness, StopHandle,
};

use crate::resolver::pod_to_info;

/// Byte stream to one remote port
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// One upgraded connection to a remote port
pub struct ForwardConnection {
    pub stream: Box<dyn ForwardStream>,
    /// Resolves with the remote side's error payload once the connection ends
    pub remote_error: BoxFuture<'static, Option<String>>,
}

/// The pod a session's connections are actually sent to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub namespace: String,
    pub pod: String,
    /// Pod ports, in port pair order
    pub ports: Vec<u16>,
}

/// Protocol-upgrade transport used by tunnel sessions
pub trait ForwardTransport: Send + Sync + 'static {
    /// Validate the target and perform the upgrade handshake for `remote_ports`
    fn handshake<'a>(
        &'a self,
        target: &'a EndpointIdentity,
        remote_ports: &'a [u16],
    ) -> BoxFuture<'a, Result<Upstream, Error>>;

    /// Open one upgraded stream to `port` on the upstream pod
    fn connect<'a>(
        &'a self,
        upstream: &'a Upstream,
        port: u16,
    ) -> BoxFuture<'a, Result<ForwardConnection, Error>>;
}

/// Port-forward transport over the Kubernetes API
#[derive(Clone)]
pub struct KubeForwarder {
    client: kube::Client,
}

impl KubeForwarder {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn pod_upstream(
        &self,
        target: &EndpointIdentity,
        remote_ports: &[u16],
    ) -> Result<Upstream, String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let pod = pods
            .get(&target.name)
            .await
            .map_err(|e| describe_api_error(e, "pods", &target.name))?;

        let info = pod_to_info(pod);
        ensure_running(&info)?;

        Ok(Upstream {
            namespace: info.namespace,
            pod: info.name,
            ports: remote_ports.to_vec(),
        })
    }

    async fn service_upstream(
        &self,
        target: &EndpointIdentity,
        remote_ports: &[u16],
    ) -> Result<Upstream, String> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &target.namespace);
        let service = services
            .get(&target.name)
            .await
            .map_err(|e| describe_api_error(e, "services", &target.name))?;

        let spec = service.spec.unwrap_or_default();
        let selector = spec
            .selector
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("service {} has no pod selector", target.name))?;

        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let list = pods
            .list(&ListParams::default().labels(&label_selector))
            .await
            .map_err(|e| e.to_string())?;

        let pod = list
            .items
            .into_iter()
            .map(pod_to_info)
            .find(|p| p.status == PodStatus::Running)
            .ok_or_else(|| format!("no running pods found for service {}", target.name))?;

        let service_ports = spec.ports.unwrap_or_default();
        let ports = remote_ports
            .iter()
            .map(|&port| target_port(&service_ports, &pod, port))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(service = %target, pod = %pod.name, ?ports, "Service mapped to pod");

        Ok(Upstream {
            namespace: pod.namespace,
            pod: pod.name,
            ports,
        })
    }
}

impl ForwardTransport for KubeForwarder {
    fn handshake<'a>(
        &'a self,
        target: &'a EndpointIdentity,
        remote_ports: &'a [u16],
    ) -> BoxFuture<'a, Result<Upstream, Error>> {
        async move {
            let handshake_error = |message: String| Error::Handshake {
                target: target.to_string(),
                message,
            };

            let upstream = match target.kind {
                EndpointKind::Pod => self.pod_upstream(target, remote_ports).await,
                EndpointKind::Service => self.service_upstream(target, remote_ports).await,
            }
            .map_err(handshake_error)?;

            // Probe the upgrade once so a refused handshake fails the session
            // before any listener is bound.
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &upstream.namespace);
            let probe = pods
                .portforward(&upstream.pod, &upstream.ports)
                .await
                .map_err(|e| handshake_error(e.to_string()))?;
            probe.abort();

            Ok(upstream)
        }
        .boxed()
    }

    fn connect<'a>(
        &'a self,
        upstream: &'a Upstream,
        port: u16,
    ) -> BoxFuture<'a, Result<ForwardConnection, Error>> {
        async move {
            let transport_error = |message: String| Error::Transport {
                target: format!("{}/{}:{}", upstream.namespace, upstream.pod, port),
                message,
            };

            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &upstream.namespace);
            let mut forwarder = pods
                .portforward(&upstream.pod, &[port])
                .await
                .map_err(|e| transport_error(e.to_string()))?;

            let stream = forwarder
                .take_stream(port)
                .ok_or_else(|| transport_error("port not found in forwarder".to_string()))?;
            let remote_error = match forwarder.take_error(port) {
                Some(error) => error.boxed(),
                None => futures::future::ready(None).boxed(),
            };

            let pod = upstream.pod.clone();
            tokio::spawn(async move {
                if let Err(e) = forwarder.join().await {
                    debug!(pod = %pod, port, error = %e, "Forwarder ended with error");
                }
            });

            Ok(ForwardConnection {
                stream: Box::new(stream),
                remote_error,
            })
        }
        .boxed()
    }
}

fn describe_api_error(error: kube::Error, resource: &str, name: &str) -> String {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            format!("{} \"{}\" not found", resource, name)
        }
        other => other.to_string(),
    }
}

fn ensure_running(pod: &PodInfo) -> Result<(), String> {
    if pod.status != PodStatus::Running {
        return Err(format!(
            "unable to forward port because pod is not running. Current status={}",
            pod.status
        ));
    }
    Ok(())
}

/// Map a service port to the pod port it targets
fn target_port(service_ports: &[ServicePort], pod: &PodInfo, port: u16) -> Result<u16, String> {
    let service_port = service_ports
        .iter()
        .find(|p| p.port == i32::from(port))
        .ok_or_else(|| format!("service does not expose port {}", port))?;

    match &service_port.target_port {
        None => Ok(port),
        Some(IntOrString::Int(target)) => {
            u16::try_from(*target).map_err(|_| format!("invalid target port {}", target))
        }
        Some(IntOrString::String(name)) => pod
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .find(|(port_name, _)| port_name.as_deref() == Some(name.as_str()))
            .map(|(_, number)| *number)
            .ok_or_else(|| format!("pod {} has no container port named {}", pod.name, name)),
    }
}

/// Messages from the forward loop to the supervisor
enum SessionEvent {
    Info(String),
    RemoteError(String),
}

/// A running port-forward session
pub struct TunnelSession {
    identity: EndpointIdentity,
    stop: StopHandle,
    readiness: watch::Receiver<Readiness>,
    output: Option<mpsc::UnboundedReceiver<String>>,
    errors: Option<mpsc::UnboundedReceiver<String>>,
    forward_task: JoinHandle<Result<(), Error>>,
    supervisor_task: JoinHandle<Option<String>>,
}

impl TunnelSession {
    /// Start forwarding `pairs` to `identity` in the background
    ///
    /// Returns immediately. The session runs until `stop` is triggered or a
    /// fatal error occurs; fatal errors trigger `stop` themselves.
    pub fn start<T: ForwardTransport>(
        transport: Arc<T>,
        identity: EndpointIdentity,
        pairs: Vec<PortPair>,
        stop: StopHandle,
    ) -> Self {
        let (readiness_tx, readiness_rx) = watch::channel(Readiness::Pending);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        info!(endpoint = %identity, ports = ?pairs, "Starting port-forward");

        let forward_task = tokio::spawn(forward_loop(
            transport,
            identity.clone(),
            pairs.clone(),
            stop.clone(),
            readiness_tx,
            event_tx,
        ));

        let supervisor_task = tokio::spawn(supervise(
            pairs,
            readiness_rx.clone(),
            event_rx,
            output_tx,
            errors_tx,
            stop.clone(),
        ));

        Self {
            identity,
            stop,
            readiness: readiness_rx,
            output: Some(output_rx),
            errors: Some(errors_rx),
            forward_task,
            supervisor_task,
        }
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    /// Handle that stops this session; safe to call repeatedly
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Informational output, such as the bound addresses
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output.take()
    }

    /// Error payloads; a non-empty payload has stopped the session
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.errors.take()
    }

    /// Current readiness without waiting
    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Wait until the local listeners are bound, returning their addresses
    pub async fn ready(&self) -> Result<Vec<SocketAddr>, Error> {
        let mut readiness = self.readiness.clone();
        match settled(&mut readiness).await {
            Readiness::Ready(addrs) => Ok(addrs),
            Readiness::Failed(message) => Err(Error::Handshake {
                target: self.identity.to_string(),
                message,
            }),
            Readiness::Pending => Err(Error::Handshake {
                target: self.identity.to_string(),
                message: "session ended before becoming ready".to_string(),
            }),
        }
    }

    /// Run to completion: wait until the session has stopped
    pub async fn wait(self) -> Result<(), Error> {
        let target = self.identity.to_string();

        let forwarded = self.forward_task.await.unwrap_or_else(|e| {
            Err(Error::Transport {
                target: target.clone(),
                message: e.to_string(),
            })
        });
        let fatal = self.supervisor_task.await.ok().flatten();

        forwarded?;
        match fatal {
            Some(message) => Err(Error::Transport { target, message }),
            None => Ok(()),
        }
    }
}

/// Wait for readiness to leave `Pending`
async fn settled(readiness: &mut watch::Receiver<Readiness>) -> Readiness {
    loop {
        let current = readiness.borrow_and_update().clone();
        if current != Readiness::Pending {
            return current;
        }
        if readiness.changed().await.is_err() {
            return Readiness::Failed("session ended before becoming ready".to_string());
        }
    }
}

async fn forward_loop<T: ForwardTransport>(
    transport: Arc<T>,
    identity: EndpointIdentity,
    pairs: Vec<PortPair>,
    stop: StopHandle,
    readiness: watch::Sender<Readiness>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), Error> {
    let fail = |error: Error| {
        let message = match &error {
            Error::Handshake { message, .. } => message.clone(),
            other => other.to_string(),
        };
        readiness.send_replace(Readiness::Failed(message.clone()));
        let _ = events.send(SessionEvent::RemoteError(message));
        error
    };

    let remote_ports: Vec<u16> = pairs.iter().map(|p| p.remote).collect();

    let upstream = tokio::select! {
        _ = stop.stopped() => {
            readiness.send_replace(Readiness::Failed("stopped before ready".to_string()));
            return Ok(());
        }
        result = transport.handshake(&identity, &remote_ports) => result.map_err(fail)?,
    };

    let mut listeners = Vec::with_capacity(pairs.len());
    for pair in &pairs {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, pair.local))
            .await
            .map_err(|e| {
                fail(Error::Handshake {
                    target: identity.to_string(),
                    message: format!("unable to listen on port {}: {}", pair.local, e),
                })
            })?;
        listeners.push(listener);
    }

    let addrs = listeners
        .iter()
        .map(|l| l.local_addr())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            fail(Error::Handshake {
                target: identity.to_string(),
                message: e.to_string(),
            })
        })?;

    readiness.send_replace(Readiness::Ready(addrs));
    info!(endpoint = %identity, pod = %upstream.pod, "Port-forward ready");

    let upstream = Arc::new(upstream);
    let mut accept_loops = JoinSet::new();
    for ((listener, pair), port) in listeners.into_iter().zip(&pairs).zip(&upstream.ports) {
        accept_loops.spawn(accept_loop(
            Arc::clone(&transport),
            Arc::clone(&upstream),
            listener,
            pair.remote,
            *port,
            stop.clone(),
            events.clone(),
        ));
    }

    let mut result = Ok(());
    while let Some(joined) = accept_loops.join_next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(Error::Transport {
                target: identity.to_string(),
                message: e.to_string(),
            })
        });
        if let Err(e) = outcome {
            if result.is_ok() {
                let _ = events.send(SessionEvent::RemoteError(e.to_string()));
                stop.stop();
                result = Err(e);
            }
        }
    }

    info!(endpoint = %identity, "Port-forward stopped");
    result
}

async fn accept_loop<T: ForwardTransport>(
    transport: Arc<T>,
    upstream: Arc<Upstream>,
    listener: TcpListener,
    remote: u16,
    pod_port: u16,
    stop: StopHandle,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), Error> {
    let mut relays = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.stopped() => break,

            accepted = listener.accept() => {
                let (conn, peer) = accepted.map_err(|e| Error::Transport {
                    target: format!("{}/{}", upstream.namespace, upstream.pod),
                    message: format!("accept on port {} failed: {}", remote, e),
                })?;

                debug!(%peer, port = remote, "Accepted connection");
                let _ = events.send(SessionEvent::Info(format!(
                    "Handling connection for {}",
                    remote
                )));

                relays.spawn(relay(
                    Arc::clone(&transport),
                    Arc::clone(&upstream),
                    pod_port,
                    conn,
                    stop.clone(),
                    events.clone(),
                ));
            }

            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    }

    relays.shutdown().await;
    Ok(())
}

async fn relay<T: ForwardTransport>(
    transport: Arc<T>,
    upstream: Arc<Upstream>,
    port: u16,
    mut local: TcpStream,
    stop: StopHandle,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let connection = tokio::select! {
        _ = stop.stopped() => return,
        connection = transport.connect(&upstream, port) => connection,
    };

    let ForwardConnection {
        mut stream,
        remote_error,
    } = match connection {
        Ok(connection) => connection,
        Err(e) => {
            let _ = events.send(SessionEvent::RemoteError(e.to_string()));
            return;
        }
    };

    {
        let stop = stop.clone();
        let events = events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.stopped() => {}
                Some(message) = remote_error => {
                    let _ = events.send(SessionEvent::RemoteError(message));
                }
            }
        });
    }

    tokio::select! {
        _ = stop.stopped() => {}
        copied = tokio::io::copy_bidirectional(&mut local, &mut stream) => match copied {
            Ok((sent, received)) => debug!(port, sent, received, "Connection closed"),
            Err(e) => debug!(port, error = %e, "Connection ended with error"),
        },
    }
}

async fn supervise(
    pairs: Vec<PortPair>,
    mut readiness: watch::Receiver<Readiness>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    output: mpsc::UnboundedSender<String>,
    errors: mpsc::UnboundedSender<String>,
    stop: StopHandle,
) -> Option<String> {
    let outcome = tokio::select! {
        _ = stop.stopped() => None,
        outcome = settled(&mut readiness) => Some(outcome),
    };

    if let Some(Readiness::Ready(addrs)) = outcome {
        for (addr, pair) in addrs.iter().zip(&pairs) {
            let _ = output.send(format!("Forwarding from {} -> {}", addr, pair.remote));
        }
    }

    let mut fatal = None;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Info(message) => {
                let _ = output.send(message);
            }
            SessionEvent::RemoteError(message) => {
                if message.trim().is_empty() {
                    continue;
                }
                warn!(error = %message, "Port-forward error");
                let _ = errors.send(message.clone());
                stop.stop();
                fatal.get_or_insert(message);
            }
        }
    }

    fatal
}
