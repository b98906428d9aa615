use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use korral_api::{builtin_catalog, ActionRegistry, ActionSpec, Safety, Settings};
use korral_core::{DeploymentSnapshot, LogBundle, PodSnapshot, ResultEnvelope, DEFAULT_NAMESPACE};
use korral_kubehub::KubeCluster;
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "korralctl", version, about = "Inspect and remediate Kubernetes deployments")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true, env = "KORRAL_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Path to a kubeconfig file (default: in-cluster, then ~/.kube/config)
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true, env = "KORRAL_CONTEXT")]
    context: Option<String>,

    /// Refuse mutating actions
    #[arg(long = "read-only", global = true, action = ArgAction::SetTrue)]
    read_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List pods in the namespace
    Pods,
    /// List deployments in the namespace
    Deployments,
    /// Show one deployment's status
    Status { name: String },
    /// Rollout-restart a deployment
    Restart { name: String },
    /// Set a deployment's replica count
    Scale {
        name: String,
        #[arg(long, allow_negative_numbers = true)]
        replicas: i64,
    },
    /// Fetch recent logs from every pod of a deployment
    Logs {
        name: String,
        /// How far back to read, in hours
        #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
        hours: f64,
        /// Only the last N lines per pod
        #[arg(long = "tail", allow_negative_numbers = true)]
        tail: Option<i64>,
    },
    /// Print the action catalog with input schemas
    Actions,
    /// Invoke any catalog action with raw JSON arguments
    Call {
        action: String,
        /// JSON object of arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KORRAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KORRAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KORRAL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Map a subcommand onto a registry action and its JSON arguments.
fn request(cli: &Cli) -> Result<(String, Value)> {
    let ns = cli.namespace.as_str();
    Ok(match &cli.command {
        Commands::Pods => ("list_pods".into(), json!({ "namespace": ns })),
        Commands::Deployments => ("list_deployments".into(), json!({ "namespace": ns })),
        Commands::Status { name } => ("get_deployment".into(), json!({ "deployment_name": name, "namespace": ns })),
        Commands::Restart { name } => ("restart_deployment".into(), json!({ "deployment_name": name, "namespace": ns })),
        Commands::Scale { name, replicas } => {
            ("scale_deployment".into(), json!({ "deployment_name": name, "replicas": replicas, "namespace": ns }))
        }
        Commands::Logs { name, hours, tail } => {
            // JSON has no NaN or infinity; serde_json would write null and the default window would apply.
            if !hours.is_finite() {
                anyhow::bail!("--hours must be a finite number of hours, got {}", hours);
            }
            ("get_deployment_logs".into(), json!({ "deployment_name": name, "namespace": ns, "hours": hours, "tail_lines": tail }))
        }
        Commands::Call { action, args } => {
            let mut parsed: Value = serde_json::from_str(args).context("--args must be a JSON object")?;
            // --ns fills in a namespace the JSON leaves out, for actions that take one.
            let takes_ns = builtin_catalog().iter().any(|s| s.name == action.as_str() && s.param("namespace").is_some());
            if let (true, Some(obj)) = (takes_ns, parsed.as_object_mut()) {
                obj.entry("namespace").or_insert_with(|| json!(ns));
            }
            (action.clone(), parsed)
        }
        Commands::Actions => anyhow::bail!("the catalog is not an action"),
    })
}

fn print_catalog(output: Output, specs: &[ActionSpec]) -> Result<()> {
    match output {
        Output::Human => {
            for s in specs {
                let safety = match s.safety {
                    Safety::ReadOnly => "read-only",
                    Safety::Mutating => "MUTATING",
                };
                println!("{} [{}] - {}", s.name, safety, s.description);
                for p in &s.params {
                    let req = if p.required { "required".to_string() } else { format!("default {}", p.default.clone().unwrap_or(Value::Null)) };
                    println!("    {}: {} ({}) {}", p.name, p.ty.json_type(), req, p.description);
                }
            }
        }
        Output::Json | Output::Yaml => {
            let doc: Vec<Value> = specs
                .iter()
                .map(|s| json!({ "name": s.name, "description": s.description, "safety": s.safety, "input_schema": s.input_schema() }))
                .collect();
            if output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print!("{}", serde_yaml::to_string(&doc)?);
            }
        }
    }
    Ok(())
}

fn human_age(secs: f64) -> String {
    let s = secs.max(0.0) as u64;
    match s {
        0..=119 => format!("{}s", s),
        120..=7_199 => format!("{}m", s / 60),
        7_200..=172_799 => format!("{}h", s / 3600),
        _ => format!("{}d", s / 86_400),
    }
}

fn print_human(action: &str, env: &ResultEnvelope<Value>) -> Result<()> {
    if !env.success() {
        let kind = env.error().map(|k| k.as_str()).unwrap_or("error");
        eprintln!("Failed [{}]: {}", kind, env.message());
        return Ok(());
    }
    let data = env.data().cloned().unwrap_or(Value::Null);
    match action {
        "list_pods" => {
            let pods: Vec<PodSnapshot> = serde_json::from_value(data)?;
            println!("{}", env.message());
            println!("{:<48} {:<10} {}", "NAME", "PHASE", "IP");
            for p in pods {
                println!("{:<48} {:<10} {}", p.name, format!("{:?}", p.phase), p.ip.as_deref().unwrap_or("-"));
            }
        }
        "list_deployments" => {
            let deps: Vec<DeploymentSnapshot> = serde_json::from_value(data)?;
            println!("{}", env.message());
            println!("{:<40} {:<7} {:<10} {:<10} {:<6} {:<9} {}", "NAME", "READY", "AVAILABLE", "UP-TO-DATE", "AGE", "HEALTH", "IMAGES");
            for d in deps {
                let health = if d.healthy { "HEALTHY" } else { "UNHEALTHY" };
                println!(
                    "{:<40} {:<7} {:<10} {:<10} {:<6} {:<9} {}",
                    d.name,
                    format!("{}/{}", d.ready_replicas, d.desired_replicas),
                    d.available_replicas,
                    d.updated_replicas,
                    human_age(d.age_seconds),
                    health,
                    d.images.join(", ")
                );
            }
        }
        "get_deployment" => {
            let d: DeploymentSnapshot = serde_json::from_value(data)?;
            println!("{}", env.message());
            println!("  ready:      {}/{}", d.ready_replicas, d.desired_replicas);
            println!("  available:  {}", d.available_replicas);
            println!("  up-to-date: {}", d.updated_replicas);
            println!("  age:        {}", human_age(d.age_seconds));
            println!("  selector:   {}", d.selector.render());
            println!("  images:     {}", d.images.join(", "));
        }
        "get_deployment_logs" => {
            let bundle: LogBundle = serde_json::from_value(data)?;
            for (pod, log) in &bundle.per_pod {
                match &log.error {
                    Some(err) => println!("=== Logs for {} (error) ===\n{}", pod, err),
                    None => {
                        let note = if log.truncated { " (truncated)" } else { "" };
                        println!("=== Logs for {}{} ===", pod, note);
                        print!("{}", log.text);
                        if !log.text.ends_with('\n') {
                            println!();
                        }
                    }
                }
            }
            eprintln!("{}", env.message());
        }
        _ => {
            println!("Success: {}", env.message());
            if !data.is_null() && !matches!(action, "restart_deployment" | "scale_deployment") {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
        }
    }
    Ok(())
}

fn render(output: Output, action: &str, env: &ResultEnvelope<Value>) -> Result<()> {
    match output {
        Output::Human => print_human(action, env)?,
        Output::Json => println!("{}", serde_json::to_string_pretty(env)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(env)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Actions) {
        print_catalog(cli.output, &builtin_catalog())?;
        return Ok(ExitCode::SUCCESS);
    }

    let (action, args) = request(&cli)?;
    let mut settings = Settings::from_env();
    if cli.read_only {
        settings.allow_mutations = false;
    }
    let opts = settings.connect_options(cli.kubeconfig.clone(), cli.context.clone());
    let cluster = KubeCluster::connect(&opts).await.context("connecting to cluster")?;
    let registry = ActionRegistry::new(Arc::new(cluster), settings);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            on_interrupt.cancel();
        }
    });

    info!(action = %action, ns = %cli.namespace, "korralctl: invoking");
    let env = registry.invoke(&action, args, &cancel).await;
    render(cli.output, &action, &env)?;
    Ok(if env.success() { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("korralctl").chain(args.iter().copied())).expect("valid args")
    }

    #[test]
    fn subcommands_map_to_actions() {
        let (action, args) = request(&parse(&["--ns", "shop", "scale", "web", "--replicas", "4"])).expect("request");
        assert_eq!(action, "scale_deployment");
        assert_eq!(args, json!({"deployment_name": "web", "replicas": 4, "namespace": "shop"}));

        let (action, args) = request(&parse(&["logs", "web", "--hours", "0.5", "--tail", "20"])).expect("request");
        assert_eq!(action, "get_deployment_logs");
        assert_eq!(args["hours"], 0.5);
        assert_eq!(args["tail_lines"], 20);
    }

    #[test]
    fn negative_values_reach_the_registry() {
        let (_, args) = request(&parse(&["logs", "web", "--hours", "-1"])).expect("request");
        assert_eq!(args["hours"], -1.0);
    }

    #[test]
    fn non_finite_hours_are_rejected() {
        for h in ["NaN", "inf"] {
            let err = request(&parse(&["logs", "web", "--hours", h])).expect_err("non-finite window");
            assert!(err.to_string().contains("--hours must be a finite number"), "{}", err);
        }
    }

    #[test]
    fn call_fills_in_namespace() {
        let (action, args) = request(&parse(&["--ns", "prod", "call", "list_pods"])).expect("request");
        assert_eq!(action, "list_pods");
        assert_eq!(args, json!({"namespace": "prod"}));

        let (_, args) = request(&parse(&["call", "get_deployment", "--args", r#"{"deployment_name":"x","namespace":"a"}"#])).expect("request");
        assert_eq!(args["namespace"], "a");

        assert!(request(&parse(&["call", "list_pods", "--args", "{not json"])).is_err());
    }

    #[test]
    fn ages_are_compact() {
        assert_eq!(human_age(42.0), "42s");
        assert_eq!(human_age(600.0), "10m");
        assert_eq!(human_age(3.0 * 3600.0), "3h");
        assert_eq!(human_age(5.0 * 86_400.0), "5d");
    }
}
