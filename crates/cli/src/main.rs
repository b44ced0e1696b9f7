use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use rollway_apply::{ApplyOptions, ApplyOutcome, Applier};
use rollway_kubehub::Connection;
use rollway_manifest::{split_documents, ManifestSource};
use rollway_wait::{wait_for_deployment, CancellationToken, PollConfig};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rollwayctl", version, about = "Server-side apply manifests and wait for rollouts")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig path (default: KUBECONFIG, ~/.kube/config or in-cluster)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes namespace; overrides metadata.namespace on apply
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Server-side apply every document from one or more sources (file, URL or "-")
    Apply {
        #[arg(required = true)]
        sources: Vec<String>,
        /// Validate on the server without persisting
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Take ownership of fields managed by others
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Wait until a Deployment has at least one ready replica
    Wait {
        deployment: String,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Apply a source, then wait for a Deployment from it
    Up {
        source: String,
        /// Deployment to wait for once applied
        #[arg(long = "deployment")]
        deployment: String,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Label every non control-plane node as a worker
    LabelWorkers,
    /// Discover served resources (incl. CRDs)
    Discover,
}

#[derive(clap::Args, Debug)]
struct PollArgs {
    /// Overall wait budget in seconds (default: ROLLWAY_WAIT_TIMEOUT_SECS or 300)
    #[arg(long = "timeout")]
    timeout_secs: Option<u64>,
    /// Seconds between checks (default: ROLLWAY_WAIT_INTERVAL_SECS or 5)
    #[arg(long = "interval")]
    interval_secs: Option<u64>,
}

impl PollArgs {
    fn config(&self) -> PollConfig {
        let env = PollConfig::from_env();
        PollConfig::new(
            self.interval_secs.map(Duration::from_secs).unwrap_or(env.interval),
            self.timeout_secs.map(Duration::from_secs).unwrap_or(env.timeout),
        )
    }
}

fn init_tracing() {
    let filter = std::env::var("ROLLWAY_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics when `ROLLWAY_METRICS_ADDR` names a socket address.
fn init_metrics() {
    let Ok(raw) = std::env::var("ROLLWAY_METRICS_ADDR") else { return };
    let addr: SocketAddr = match raw.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(value = %raw, error = %e, "ignoring ROLLWAY_METRICS_ADDR");
            return;
        }
    };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "serving metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not started"),
    }
}

/// Token cancelled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            trigger.cancel();
        }
    });
    token
}

async fn apply_sources(applier: &Applier, sources: &[String], opts: &ApplyOptions) -> Result<Vec<ApplyOutcome>> {
    let mut out = Vec::new();
    for arg in sources {
        let source = ManifestSource::parse(arg);
        let raw = source.load().await.with_context(|| format!("loading {}", source))?;
        let docs = split_documents(&raw).with_context(|| format!("splitting {}", source))?;
        info!(source = %source, documents = docs.len(), "applying");
        for (i, doc) in docs.iter().enumerate() {
            let outcome = applier
                .apply_with(doc, opts)
                .await
                .with_context(|| format!("{} (document {})", source, i + 1))?;
            out.push(outcome);
        }
    }
    Ok(out)
}

fn print_outcomes(output: Output, outcomes: &[ApplyOutcome]) -> Result<()> {
    match output {
        Output::Human => {
            for o in outcomes {
                let suffix = if o.dry_run { " (dry run)" } else { "" };
                println!("{} applied{}", o.target, suffix);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(outcomes)?),
    }
    Ok(())
}

/// `--ns` wins; otherwise wait where the named Deployment was just applied.
fn wait_namespace(flag: Option<&str>, applied: &[ApplyOutcome], deployment: &str, fallback: &str) -> String {
    flag.map(str::to_string)
        .or_else(|| {
            applied
                .iter()
                .rev()
                .find(|o| o.kind == "Deployment" && o.name == deployment)
                .and_then(|o| o.namespace.clone())
        })
        .unwrap_or_else(|| fallback.to_string())
}

async fn wait_deployment(conn: &Connection, ns: &str, name: &str, cfg: PollConfig) -> Result<()> {
    let cancel = ctrl_c_token();
    wait_for_deployment(conn.client(), ns, name, cfg, &cancel)
        .await
        .with_context(|| format!("waiting for deployment {}/{}", ns, name))?;
    println!("deployment {}/{} is ready", ns, name);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let conn = Connection::connect(cli.kubeconfig.as_deref()).await?;
    let default_ns = conn.client().default_namespace().to_string();

    match cli.command {
        Commands::Apply { sources, dry_run, force } => {
            let opts = ApplyOptions { namespace_override: cli.namespace.clone(), dry_run, force };
            let applier = Applier::new(&conn);
            match apply_sources(&applier, &sources, &opts).await {
                Ok(outcomes) => print_outcomes(cli.output, &outcomes)?,
                Err(e) => {
                    error!(error = ?e, "apply failed");
                    return Err(e);
                }
            }
        }
        Commands::Wait { deployment, poll } => {
            let ns = cli.namespace.clone().unwrap_or(default_ns);
            wait_deployment(&conn, &ns, &deployment, poll.config()).await?;
        }
        Commands::Up { source, deployment, poll } => {
            let opts = ApplyOptions { namespace_override: cli.namespace.clone(), ..Default::default() };
            let outcomes = apply_sources(&Applier::new(&conn), std::slice::from_ref(&source), &opts).await?;
            print_outcomes(cli.output, &outcomes)?;
            let ns = wait_namespace(cli.namespace.as_deref(), &outcomes, &deployment, &default_ns);
            wait_deployment(&conn, &ns, &deployment, poll.config()).await?;
        }
        Commands::LabelWorkers => {
            let n = rollway_kubehub::label_workers(conn.client()).await.context("labeling worker nodes")?;
            info!(labeled = n, "label-workers done");
            println!("labeled {} node(s)", n);
        }
        Commands::Discover => {
            let resources = rollway_kubehub::discover(conn.client()).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.scope.is_namespaced() { "namespaced" } else { "cluster" };
                        println!("{} • {} • {} • {}", r.api_version(), r.kind, r.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_accepts_many_sources_and_flags() {
        let cli = Cli::parse_from(["rollwayctl", "--ns", "ops", "apply", "a.yaml", "https://x/b.yaml", "--dry-run"]);
        assert_eq!(cli.namespace.as_deref(), Some("ops"));
        match cli.command {
            Commands::Apply { sources, dry_run, force } => {
                assert_eq!(sources, vec!["a.yaml", "https://x/b.yaml"]);
                assert!(dry_run);
                assert!(!force);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn poll_flags_override_defaults() {
        let cli = Cli::parse_from(["rollwayctl", "wait", "web", "--timeout", "30", "--interval", "2"]);
        match cli.command {
            Commands::Wait { deployment, poll } => {
                assert_eq!(deployment, "web");
                let cfg = poll.config();
                assert_eq!(cfg.timeout, Duration::from_secs(30));
                assert_eq!(cfg.interval, Duration::from_secs(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn applied(kind: &str, name: &str, ns: Option<&str>) -> ApplyOutcome {
        ApplyOutcome { kind: kind.into(), name: name.into(), namespace: ns.map(str::to_string), ..Default::default() }
    }

    #[test]
    fn up_waits_where_the_deployment_was_applied() {
        let outcomes = vec![
            applied("Namespace", "web", None),
            applied("Service", "web", Some("svc-ns")),
            applied("Deployment", "web", Some("ops")),
            applied("Deployment", "api", Some("other")),
        ];
        assert_eq!(wait_namespace(None, &outcomes, "web", "default"), "ops");
        assert_eq!(wait_namespace(Some("staging"), &outcomes, "web", "default"), "staging");
        assert_eq!(wait_namespace(None, &outcomes, "missing", "default"), "default");
        assert_eq!(wait_namespace(None, &[applied("Deployment", "web", None)], "web", "kube-ns"), "kube-ns");
    }

    #[test]
    fn up_requires_deployment() {
        assert!(Cli::try_parse_from(["rollwayctl", "up", "app.yaml"]).is_err());
        assert!(Cli::try_parse_from(["rollwayctl", "up", "app.yaml", "--deployment", "web"]).is_ok());
    }
}
