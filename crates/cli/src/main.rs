use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use pipedk8s_api::{DeploymentPlugin, KubernetesPlugin};
use pipedk8s_core::logpersister::LogSeverity;
use pipedk8s_core::{
    BufferLogPersister, DeployTarget, Deployment, DeploymentSource, KubernetesDeployTargetConfig, LocalToolRegistry,
    StageConfig, StageStatus, Tools,
};
use pipedk8s_deploy::StageRequest;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pipedk8s", version, about = "Drive the Kubernetes deployment plugin locally")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Args, Debug, Clone)]
struct SourceArgs {
    /// Application directory holding the app config and manifests
    #[arg(long = "app-dir")]
    app_dir: PathBuf,
    /// Commit the directory is checked out at
    #[arg(long = "commit", default_value = "HEAD")]
    commit: String,
    /// Application config file name inside the directory
    #[arg(long = "config", default_value = "app.pipecd.yaml")]
    config: String,
}

impl SourceArgs {
    fn load(&self) -> Result<DeploymentSource> {
        DeploymentSource::load(&self.app_dir, &self.commit, &self.config)
            .with_context(|| format!("failed to load application config in {}", self.app_dir.display()))
    }
}

#[derive(Args, Debug, Clone)]
struct RunningArgs {
    /// Directory of the currently deployed commit; omitted means first deployment
    #[arg(long = "running-dir")]
    running_dir: Option<PathBuf>,
    #[arg(long = "running-commit", default_value = "")]
    running_commit: String,
}

impl RunningArgs {
    fn load(&self, config: &str) -> Result<DeploymentSource> {
        match &self.running_dir {
            Some(dir) => DeploymentSource::load(dir, &self.running_commit, config)
                .with_context(|| format!("failed to load running application config in {}", dir.display())),
            None => Ok(DeploymentSource::default()),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Deploy target name
    #[arg(long = "target", default_value = "default")]
    target: String,
    /// Kubeconfig for the target cluster; empty uses the ambient one
    #[arg(long = "kubeconfig", env = "KUBECONFIG", default_value = "")]
    kubeconfig: String,
    #[arg(long = "kubectl-version", default_value = "")]
    kubectl_version: String,
}

impl TargetArgs {
    fn deploy_target(&self) -> DeployTarget {
        DeployTarget {
            name: self.target.clone(),
            config: KubernetesDeployTargetConfig {
                kubeconfig_path: self.kubeconfig.clone(),
                kubectl_version: self.kubectl_version.clone(),
                ..Default::default()
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the manifests of an application for a deploy target
    Render {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Decide between quick sync and the pipeline
    Strategy {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        running: RunningArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show what applying the target commit would change
    PlanPreview {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        running: RunningArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Execute one stage against the deploy target
    Execute {
        /// Stage name, e.g. K8S_SYNC
        stage: String,
        /// Stage options as JSON; defaults to the matching pipeline stage's `with`
        #[arg(long = "stage-config")]
        stage_config: Option<String>,
        #[arg(long = "app-id", default_value = "local")]
        app_id: String,
        #[arg(long = "piped-id", default_value = "local")]
        piped_id: String,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        running: RunningArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Report live resources and drift from Git
    Livestate {
        #[arg(long = "app-id", default_value = "local")]
        app_id: String,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List the stages a deployment of the application runs
    Stages {
        /// Print every stage the plugin supports instead
        #[arg(long = "defined", action = ArgAction::SetTrue)]
        defined: bool,
        #[arg(long = "app-dir")]
        app_dir: Option<PathBuf>,
        #[arg(long = "config", default_value = "app.pipecd.yaml")]
        config: String,
    },
}

fn init_tracing() {
    let env = std::env::var("PIPED_K8S_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PIPED_K8S_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PIPED_K8S_METRICS_ADDR; expected host:port");
        }
    }
}

fn app_name(source: &DeploymentSource, args: &SourceArgs) -> String {
    let name = &source.application_config.spec.name;
    if !name.is_empty() {
        return name.clone();
    }
    args.app_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn pipeline_stage_configs(source: &DeploymentSource) -> Vec<StageConfig> {
    source
        .application_config
        .spec
        .pipeline
        .as_ref()
        .map(|p| {
            p.stages
                .iter()
                .enumerate()
                .map(|(index, s)| StageConfig { index, name: s.name.clone(), config: s.with.clone() })
                .collect()
        })
        .unwrap_or_default()
}

fn severity_mark(s: LogSeverity) -> &'static str {
    match s {
        LogSeverity::Info => " ",
        LogSeverity::Success => "✓",
        LogSeverity::Error => "✗",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let plugin = KubernetesPlugin::new(Tools::new(Arc::new(LocalToolRegistry::from_env())));

    match cli.command {
        Commands::Render { source, target } => {
            let src = source.load()?;
            let name = app_name(&src, &source);
            let t0 = Instant::now();
            let manifests = plugin.deployer().load_manifests(&src, &name, &target.deploy_target()).await?;
            info!(app = %name, count = manifests.len(), took_ms = %t0.elapsed().as_millis(), "render ok");
            match cli.output {
                Output::Human => {
                    for m in &manifests {
                        println!("---\n{}", m.to_yaml()?.trim_end());
                    }
                }
                Output::Json => {
                    let bodies: Vec<_> = manifests.iter().map(|m| m.body()).collect();
                    println!("{}", serde_json::to_string_pretty(&bodies)?);
                }
            }
        }
        Commands::Strategy { source, running, target } => {
            let src = source.load()?;
            let run = running.load(&source.config)?;
            let name = app_name(&src, &source);
            let targets = [target.deploy_target()];
            let decision = plugin.determine_strategy(&name, &run, &src, &targets).await?;
            let versions = plugin.determine_versions(&name, &src, &targets).await?;
            match cli.output {
                Output::Human => {
                    println!("{}: {}", decision.strategy, decision.summary);
                    for v in versions {
                        println!("  {} {}", v.name, v.version);
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({ "decision": decision, "versions": versions });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::PlanPreview { source, running, target } => {
            let src = source.load()?;
            let run = running.load(&source.config)?;
            let name = app_name(&src, &source);
            let results = plugin.plan_preview(&name, &run, &src, &[target.deploy_target()]).await?;
            match cli.output {
                Output::Human => {
                    for r in results {
                        println!("[{}] {}", r.deploy_target, r.summary);
                        if !r.no_change {
                            println!("{}", r.details);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&results)?),
            }
        }
        Commands::Execute { stage, stage_config, app_id, piped_id, source, running, target } => {
            let src = source.load()?;
            let run = running.load(&source.config)?;
            let name = app_name(&src, &source);
            let config = match stage_config {
                Some(json) => json.into_bytes(),
                None => pipeline_stage_configs(&src)
                    .into_iter()
                    .find(|s| s.name == stage && !s.config.is_null())
                    .map(|s| serde_json::to_vec(&s.config))
                    .transpose()?
                    .unwrap_or_default(),
            };
            let req = StageRequest {
                stage_name: stage.clone(),
                stage_config: config,
                running: run,
                target: src,
                deployment: Deployment {
                    id: format!("local-{}", chrono::Utc::now().timestamp()),
                    application_id: app_id,
                    application_name: name,
                    piped_id,
                },
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received; cancelling stage");
                    on_signal.cancel();
                }
            });

            let lp = BufferLogPersister::new();
            let status = plugin.execute_stage(&req, &[target.deploy_target()], &lp, &cancel).await?;
            match cli.output {
                Output::Human => {
                    for line in lp.lines() {
                        println!("{} {}", severity_mark(line.severity), line.text);
                    }
                    println!("{}: {}", stage, status);
                }
                Output::Json => {
                    let out = serde_json::json!({ "stage": stage, "status": status, "log": lp.lines() });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            if status != StageStatus::Success {
                bail!("stage {} finished with status {}", stage, status);
            }
        }
        Commands::Livestate { app_id, source, target } => {
            let src = source.load()?;
            let name = app_name(&src, &source);
            let report = plugin.get_livestate(&app_id, &name, &src, &[target.deploy_target()]).await?;
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   KIND                 NAME                           HEALTH");
                    for r in &report.resources {
                        let ns = r.resource_metadata.get("Namespace").map(String::as_str).unwrap_or("-");
                        println!("{:<11} {:<20} {:<30} {:?}", ns, r.resource_type, r.name, r.health_status);
                    }
                    println!();
                    println!("{:?} {}", report.sync_state.status, report.sync_state.short_reason);
                    if !report.sync_state.reason.is_empty() {
                        println!("{}", report.sync_state.reason);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Stages { defined, app_dir, config } => {
            if defined {
                let stages = plugin.fetch_defined_stages();
                match cli.output {
                    Output::Human => stages.iter().for_each(|s| println!("{}", s)),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&stages)?),
                }
                return Ok(());
            }
            let Some(dir) = app_dir else {
                bail!("--app-dir is required unless --defined is given");
            };
            let src = DeploymentSource::load(&dir, "", &config)
                .with_context(|| format!("failed to load application config in {}", dir.display()))?;
            let auto_rollback = src.application_config.spec.auto_rollback;
            let stages = pipeline_stage_configs(&src);
            if stages.is_empty() {
                let out = plugin.build_quick_sync_stages(auto_rollback);
                match cli.output {
                    Output::Human => out.iter().for_each(|s| println!("{:<20} {}", s.name, s.description)),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
                }
            } else {
                let out = plugin.build_pipeline_sync_stages(&stages, auto_rollback);
                match cli.output {
                    Output::Human => out.iter().for_each(|s| {
                        let mark = if s.rollback { " (rollback)" } else { "" };
                        println!("{:>2} {}{}", s.index, s.name, mark)
                    }),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
                }
            }
        }
    }
    plugin.shutdown().await;
    Ok(())
}
