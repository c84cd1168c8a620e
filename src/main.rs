use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::tty::IsTty;
use regex::Regex;
use tokio::sync::mpsc;

use kubetap_k8s::{
    EndpointKind, KubeClient, KubeForwarder, KubeSource, PortPair, Resolver, SelectionPattern,
    StopHandle, TunnelSession,
};
use kubetap_logs::{Coordinator, FanOutConfig, KubeLogSource, LineFilter};
use kubetap_types::ColorMode;

mod config;
mod sink;

use config::FileConfig;
use sink::{OutputFormat, OutputSink};

/// Kubetap - port-forward tunnels and multi-pod log tailing for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kubetap")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/kubetap/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the kubeconfig file
    #[arg(long, global = true, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes context (default: current context)
    #[arg(long, global = true)]
    context: Option<String>,

    /// Namespace (default: the context's namespace, then "default")
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Search every namespace
    #[arg(short = 'A', long, global = true, conflicts_with = "namespace")]
    all_namespaces: bool,

    /// Print debug diagnostics to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream logs of every pod matching a name or regex
    #[command(visible_alias = "log")]
    Logs(LogsArgs),

    /// Forward local ports to a pod or service
    #[command(name = "port-forward", visible_alias = "pf")]
    PortForward(PortForwardArgs),
}

#[derive(clap::Args, Debug)]
struct LogsArgs {
    /// Pod name or regex (".*" matches every pod)
    #[arg(default_value = ".*")]
    pattern: String,

    /// Container regex (default: every container)
    #[arg(short, long)]
    container: Option<String>,

    /// Label selector restricting the pods listed
    #[arg(short = 'l', long = "label")]
    selector: Option<String>,

    /// Only lines newer than this, e.g. 30s, 10m, 2h
    #[arg(short, long, value_parser = humantime::parse_duration)]
    since: Option<Duration>,

    /// Lines of existing log to replay per container
    #[arg(short, long)]
    tail: Option<i64>,

    /// Only show lines containing one of these strings
    #[arg(short, long)]
    include: Vec<String>,

    /// Hide lines containing any of these strings
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Colorize output: auto, always or never
    #[arg(long)]
    color: Option<ColorMode>,

    /// Print the timestamp reported with each line
    #[arg(long)]
    timestamps: bool,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Stop once current streams end instead of watching for new pods
    #[arg(long)]
    no_follow: bool,
}

#[derive(clap::Args, Debug)]
struct PortForwardArgs {
    /// Pod (or with --service, service) name or regex
    target: String,

    /// Port pairs: LOCAL:REMOTE, :REMOTE or PORT
    #[arg(required = true, value_name = "PORTS")]
    ports: Vec<PortPair>,

    /// Forward to a service instead of a pod
    #[arg(long)]
    service: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let file = FileConfig::load(args.config.as_deref())?;

    let kubeconfig = args.kubeconfig.clone().or_else(|| file.kubeconfig.clone());
    let kube = KubeClient::new(kubeconfig.as_deref())?;
    let context = args.context.clone().or_else(|| file.context.clone());
    let client = kube.client(context.as_deref()).await?;

    let namespace = if args.all_namespaces {
        None
    } else {
        let from_context = context
            .as_deref()
            .or(kube.current_context())
            .and_then(|name| kube.context_namespace(name));
        Some(
            args.namespace
                .clone()
                .or_else(|| file.namespace.clone())
                .or(from_context)
                .unwrap_or_else(|| "default".to_string()),
        )
    };

    let stop = StopHandle::new();
    let on_interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping");
            on_interrupt.stop();
        }
    });

    match args.command {
        Command::Logs(logs) => run_logs(client, namespace, logs, &file, stop).await,
        Command::PortForward(pf) => run_port_forward(client, namespace, pf, stop).await,
    }
}

async fn run_logs(
    client: kube::Client,
    namespace: Option<String>,
    args: LogsArgs,
    file: &FileConfig,
    stop: StopHandle,
) -> Result<()> {
    let mut pattern = SelectionPattern::parse(namespace.as_deref(), &args.pattern)?;
    if let Some(selector) = &args.selector {
        pattern = pattern.with_labels(selector);
    }

    let container = args
        .container
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid container regex")?;

    let filter = Arc::new(LineFilter::new(args.include, args.exclude)?);
    let defaults = FanOutConfig::default();
    let config = FanOutConfig {
        container,
        since: args.since,
        tail: args.tail,
        filter: Arc::clone(&filter),
        follow_new: !args.no_follow,
        poll_interval: file.poll_interval().unwrap_or(defaults.poll_interval),
        grace_period: file.grace_period().unwrap_or(defaults.grace_period),
    };

    let color = args
        .color
        .or(file.color)
        .unwrap_or_default()
        .enabled(std::io::stdout().is_tty());
    let format = args.output.or(file.output).unwrap_or_default();
    let timestamps = args.timestamps || file.timestamps.unwrap_or(false);

    let coordinator = Coordinator::new(
        Resolver::new(KubeSource::new(client.clone())),
        KubeLogSource::new(client),
        pattern,
        config,
    );

    // Ctrl-C drains the coordinator
    let coordinator_stop = coordinator.stop_handle();
    tokio::spawn(async move {
        stop.stopped().await;
        coordinator_stop.stop();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let output_stop = coordinator.stop_handle();
    let printer = tokio::spawn(async move {
        let mut sink =
            OutputSink::new(std::io::stdout(), format, color, filter).with_timestamps(timestamps);
        while let Some(record) = rx.recv().await {
            if let Err(e) = sink.write(&record) {
                // Closed pipe, e.g. piping into `head`
                tracing::debug!(error = %e, "Output closed");
                output_stop.stop();
                break;
            }
        }
    });

    let summary = coordinator.run(tx).await?;
    printer.await.context("Output task failed")?;

    if summary.abandoned > 0 {
        tracing::warn!(abandoned = summary.abandoned, "Some streams were aborted");
    }
    Ok(())
}

async fn run_port_forward(
    client: kube::Client,
    namespace: Option<String>,
    args: PortForwardArgs,
    stop: StopHandle,
) -> Result<()> {
    let kind = if args.service {
        EndpointKind::Service
    } else {
        EndpointKind::Pod
    };

    let pattern = SelectionPattern::parse(namespace.as_deref(), &args.target)?;
    let resolver = Resolver::new(KubeSource::new(client.clone()));
    let targets = resolver.resolve_one_or_more(&pattern, kind).await?;
    if targets.len() > 1 {
        tracing::warn!(
            matched = targets.len(),
            "Several {}s match, forwarding to the first",
            kind
        );
    }
    let Some(identity) = targets.into_iter().next() else {
        anyhow::bail!("No {} matching '{}'", kind, args.target);
    };

    let mut session = TunnelSession::start(
        Arc::new(KubeForwarder::new(client)),
        identity,
        args.ports,
        stop,
    );

    let mut output = session.take_output();
    let mut errors = session.take_errors();
    let printer = tokio::spawn(async move {
        if let Some(output) = output.as_mut() {
            while let Some(line) = output.recv().await {
                println!("{}", line);
            }
        }
    });
    let reporter = tokio::spawn(async move {
        if let Some(errors) = errors.as_mut() {
            while let Some(line) = errors.recv().await {
                eprintln!("{}", line);
            }
        }
    });

    let result = session.wait().await;
    let _ = printer.await;
    let _ = reporter.await;
    Ok(result?)
}
