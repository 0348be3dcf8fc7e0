//! sandvisor host CLI
//!
//! ```text
//! sandvisor provision                 download/verify the hypervisor runtime
//! sandvisor run [--work-dir D] PROMPT launch a session VM and run one turn
//! sandvisor args                      print the hypervisor invocation (dry run)
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandvisor::config::SandvisorConfig;
use sandvisor::protocol::{PermissionRequest, PermissionResponse};
use sandvisor::runtime::{Provisioner, TransportKind};
use sandvisor::session::{
    LocalHostTools, PermissionHandler, SessionDriver, SessionRecord,
};
use sandvisor::vm::{
    build_hypervisor_args, select_transport, session_mounts, LaunchOptions, SessionSpec,
    SessionVm, TransportWiring,
};

#[derive(Debug, Parser)]
#[command(name = "sandvisor", version, about = "Run an agent turn inside a local sandbox VM")]
struct Cli {
    /// TOML config file (defaults to $SANDVISOR_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Make sure the hypervisor runtime is installed and verified
    Provision,

    /// Launch a session VM and run one prompt
    Run {
        prompt: String,

        /// Host directory the agent works in
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Read-only skills directory to mount
        #[arg(long)]
        skills_dir: Option<PathBuf>,

        /// Continue a saved session
        #[arg(long)]
        resume: Option<String>,

        /// Force the transport instead of using the probed one
        #[arg(long)]
        transport: Option<TransportKind>,

        /// Approve every confirmation without asking
        #[arg(long)]
        yes: bool,
    },

    /// Print the hypervisor command line a session would use
    Args {
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        #[arg(long)]
        transport: Option<TransportKind>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = SandvisorConfig::load(cli.config.as_deref())?;

    sandvisor::tracing::init_tracing(
        "sandvisor",
        config.telemetry.otlp_endpoint.as_deref(),
        cli.json_logs,
    )
    .map_err(|e| e as Box<dyn std::error::Error>)?;

    let result = match cli.command {
        Command::Provision => provision(&config).await,
        Command::Run {
            prompt,
            work_dir,
            skills_dir,
            resume,
            transport,
            yes,
        } => {
            let mut config = config.clone();
            if transport.is_some() {
                config.vm.transport = transport;
            }
            run(&config, prompt, work_dir, skills_dir, resume, yes).await
        }
        Command::Args {
            work_dir,
            transport,
        } => print_args(&config, work_dir, transport).await,
    };

    if cli.print_metrics {
        eprintln!("{}", sandvisor::metrics::gather_text());
    }
    sandvisor::tracing::shutdown_tracing();
    result
}

async fn provision(config: &SandvisorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let provisioner = Provisioner::new(config.runtime.clone());
    let mut progress = provisioner.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            match event.total {
                Some(total) if total > 0 => eprint!(
                    "\r{}: {:>3}%",
                    event.artifact,
                    event.received.saturating_mul(100) / total
                ),
                _ => eprint!("\r{}: {} bytes", event.artifact, event.received),
            }
        }
    });

    let runtime = provisioner.ensure_ready().await;
    reporter.abort();
    eprintln!();
    let runtime = runtime?;
    println!("{}", serde_json::to_string_pretty(&runtime)?);
    Ok(())
}

async fn print_args(
    config: &SandvisorConfig,
    work_dir: PathBuf,
    transport: Option<TransportKind>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Provisioner::new(config.runtime.clone()).ensure_ready().await?;
    let kind = select_transport(&runtime, transport.or(config.vm.transport));
    let spec = SessionSpec::new(std::path::absolute(&work_dir)?);
    let session_dir = config.sessions_dir().join(&spec.session_id);

    let mounts = session_mounts(kind, &session_dir.join("ipc"), &spec.work_dir, None);
    let mut options = LaunchOptions::new(&spec.session_id, &session_dir);
    options.memory_mib = config.vm.memory_mib;
    options.cpus = config.vm.cpus;
    options.accel = config.vm.accel;
    options.transport = match kind {
        TransportKind::SharedFs => TransportWiring::SharedDirs,
        // Placeholder; the real port is picked when the bridge listens
        TransportKind::Socket => TransportWiring::Socket { port: 0 },
    };

    let args = build_hypervisor_args(&runtime, &mounts, &options);
    println!("{} {}", runtime.hypervisor_binary.display(), args.join(" "));
    Ok(())
}

async fn run(
    config: &SandvisorConfig,
    prompt: String,
    work_dir: PathBuf,
    skills_dir: Option<PathBuf>,
    resume: Option<String>,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let host_tools = Arc::new(LocalHostTools::open(&config.runtime.base_dir)?);
    let mut record = match &resume {
        Some(id) => host_tools.sessions().load(id)?,
        None => SessionRecord::new(title_for(&prompt)),
    };

    let provisioner = Provisioner::new(config.runtime.clone());
    let spec = SessionSpec::new(std::path::absolute(&work_dir)?).with_skills_dir(skills_dir);
    let mut vm = SessionVm::start(&provisioner, config, spec).await?;

    let outcome = async {
        vm.wait_until_ready(config.bridge.ready_timeout()).await?;
        vm.push_workspace().await?;

        let mut request = vm.new_request(prompt.clone());
        request.session_id = record.engine_session_id.clone();

        let driver = SessionDriver::new(
            vm.bridge(),
            Arc::new(TerminalPermissions::new(yes)),
            host_tools.clone(),
        )
        .with_config(&config.bridge);

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; aborting turn");
                on_interrupt.cancel();
            }
        });

        let mut stdout = std::io::stdout();
        let outcome = driver
            .run_turn(&request, &cancel, |event| {
                let _ = writeln!(stdout, "{event}");
            })
            .await?;
        Ok::<_, Box<dyn std::error::Error>>(outcome)
    }
    .await;

    vm.stop().await;
    let outcome = outcome?;

    record.add_entry("user", prompt);
    if let Some(result) = &outcome.result {
        let text = result
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default();
        record.add_entry("assistant", text);
    }
    if outcome.engine_session_id.is_some() {
        record.engine_session_id = outcome.engine_session_id.clone();
    }
    host_tools.sessions().save(&record)?;
    info!(
        session = %record.id,
        events = outcome.events,
        cancelled = outcome.cancelled,
        error = outcome.is_error(),
        "turn complete"
    );
    eprintln!("session: {}", record.id);
    Ok(())
}

fn title_for(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or_default().trim();
    line.chars().take(60).collect()
}

/// Answers permission requests on the terminal
struct TerminalPermissions {
    auto_approve: bool,
    stdin: Mutex<Lines<BufReader<Stdin>>>,
}

impl TerminalPermissions {
    fn new(auto_approve: bool) -> Self {
        Self {
            auto_approve,
            stdin: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn read_line(&self) -> Option<String> {
        self.stdin.lock().await.next_line().await.ok().flatten()
    }
}

#[async_trait]
impl PermissionHandler for TerminalPermissions {
    async fn decide(&self, request: &PermissionRequest) -> PermissionResponse {
        let questions = request
            .tool_input
            .get("questions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if questions.is_empty() {
            if self.auto_approve {
                return PermissionResponse::allow(None);
            }
            eprintln!("allow `{}` with {}? [y/N]", request.tool_name, request.tool_input);
            return match self.read_line().await.as_deref().map(str::trim) {
                Some("y") | Some("Y") | Some("yes") => PermissionResponse::allow(None),
                _ => PermissionResponse::deny("User denied the request"),
            };
        }

        let mut answers = serde_json::Map::new();
        for question in &questions {
            let text = question.get("question").and_then(Value::as_str).unwrap_or("?");
            let labels: Vec<&str> = question
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| opts.iter().filter_map(|o| o.get("label")?.as_str()).collect())
                .unwrap_or_default();

            let choice = if self.auto_approve {
                labels.first().map(|s| s.to_string())
            } else {
                eprintln!("{text}");
                for (i, label) in labels.iter().enumerate() {
                    eprintln!("  {}) {label}", i + 1);
                }
                self.read_line().await.map(|line| {
                    let line = line.trim().to_string();
                    line.parse::<usize>()
                        .ok()
                        .and_then(|n| labels.get(n.wrapping_sub(1)))
                        .map(|s| s.to_string())
                        .unwrap_or(line)
                })
            };

            match choice {
                Some(choice) if !choice.is_empty() => {
                    answers.insert(text.to_string(), Value::String(choice));
                }
                _ => return PermissionResponse::deny("User did not answer"),
            }
        }

        let mut updated = request.tool_input.clone();
        if let Some(obj) = updated.as_object_mut() {
            obj.insert("answers".into(), Value::Object(answers));
        } else {
            updated = json!({ "answers": answers });
        }
        PermissionResponse::allow(Some(updated))
    }
}
