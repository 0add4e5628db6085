use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use mcpswitch_core::{
    paths::home_dir, EnvPrompt, EnvResolver, HostAdapter, HostStatus, ManifestWatcher,
    NotificationSink, OperationReport, SwitchEngine, SwitchError, SwitchPaths, SwitchSettings,
    SwitchSettingsStore, TracingSink,
};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mcpswitch")]
#[command(about = "Enable and disable MCP servers across desktop hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Servers in the catalog and whether they are enabled
    List {
        #[arg(long)]
        json: bool,
    },
    /// Discovered servers that can be installed
    Available {
        #[arg(long)]
        json: bool,
    },
    Enable {
        name: String,
        #[arg(long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        /// Accept stored or default values without prompting
        #[arg(long)]
        yes: bool,
    },
    Disable {
        name: String,
    },
    Install {
        name: String,
    },
    Delete {
        name: String,
    },
    Sync,
    Watch,
    Doctor,
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        server: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcpswitch=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let paths = SwitchPaths::detect();
    let settings = SwitchSettingsStore::new(paths.clone()).load_settings();
    let home = home_dir().context("cannot determine home directory")?;
    let sink: Arc<dyn NotificationSink> = Arc::new(TracingSink);
    let mut engine = SwitchEngine::from_settings(paths.clone(), &settings, &home, sink);
    engine.initialize();

    match cli.command {
        Commands::List { json } => {
            let catalog = engine.catalog();
            if json {
                println!("{}", serde_json::to_string_pretty(&catalog)?);
            } else {
                for entry in catalog {
                    println!(
                        "{}\t{}\t{}\t{} {}",
                        entry.name,
                        if entry.enabled { "enabled" } else { "disabled" },
                        if entry.installed { "installed" } else { "host" },
                        entry.definition.command,
                        entry.definition.args.join(" ")
                    );
                }
            }
        }
        Commands::Available { json } => {
            let available = engine.available();
            if json {
                println!("{}", serde_json::to_string_pretty(&available)?);
            } else {
                for item in available {
                    println!(
                        "{}\t{}\t{}",
                        item.definition.name,
                        if item.deleted { "deleted" } else { "new" },
                        item.definition.source_path.display()
                    );
                }
            }
        }
        Commands::Enable { name, env, yes } => {
            let mut resolver = StdinResolver {
                overrides: env.into_iter().collect(),
                assume_yes: yes,
            };
            match engine.enable(&name, &mut resolver) {
                Ok(report) => print_report(&report)?,
                Err(SwitchError::Cancelled(_)) => println!("enable {name} cancelled"),
                Err(error) => return Err(error).context(format!("failed to enable {name}")),
            }
        }
        Commands::Disable { name } => {
            require_known(&engine, &name)?;
            print_report(&engine.disable(&name))?;
        }
        Commands::Install { name } => {
            let report = engine
                .install_available(&name)
                .with_context(|| format!("no manifest declares {name}"))?;
            print_report(&report)?;
        }
        Commands::Delete { name } => {
            require_known(&engine, &name)?;
            print_report(&engine.delete(&name))?;
        }
        Commands::Sync => {
            let report = engine.sync();
            for change in &report.changes {
                println!(
                    "{}\t{}\t{}",
                    change.host_id,
                    change.server,
                    format!("{:?}", change.kind).to_lowercase()
                );
            }
            for failure in &report.failures {
                eprintln!("{}: {}", failure.display_name, describe(&failure.status));
            }
            println!(
                "sync writes={} failures={}",
                report.write_count(),
                report.failures.len()
            );
        }
        Commands::Watch => run_watch(&mut engine, &settings)?,
        Commands::Doctor => doctor(&engine, &paths, &settings),
        Commands::History { limit, server } => {
            for event in engine.audit().list_events(Some(limit), server.as_deref()) {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    event.occurred_at,
                    event.action,
                    format!("{:?}", event.status).to_lowercase(),
                    event.server.as_deref().unwrap_or("-"),
                    event.summary
                );
            }
        }
    }

    Ok(())
}

/// Prompts on stdin for each declared variable. An empty line keeps the
/// pre-filled value and end of input cancels.
struct StdinResolver {
    overrides: BTreeMap<String, String>,
    assume_yes: bool,
}

impl EnvResolver for StdinResolver {
    fn resolve(&mut self, prompt: &EnvPrompt) -> Option<BTreeMap<String, String>> {
        let mut answers = BTreeMap::new();
        let stdin = io::stdin();
        let mut input = stdin.lock();

        for variable in &prompt.variables {
            if let Some(value) = self.overrides.get(&variable.key) {
                answers.insert(variable.key.clone(), value.clone());
                continue;
            }
            if self.assume_yes {
                continue;
            }

            print!("{} {} [{}]: ", prompt.server, variable.key, variable.prefilled());
            let _ = io::stdout().flush();
            let mut line = String::new();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                answers.insert(variable.key.clone(), line.to_string());
            }
        }
        Some(answers)
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {raw}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn require_known(engine: &SwitchEngine, name: &str) -> Result<()> {
    if engine.servers().contains_key(name) || engine.installed().contains(name) {
        return Ok(());
    }
    Err(anyhow!("unknown server: {name}"))
}

fn describe(status: &HostStatus) -> String {
    match status {
        HostStatus::Written => String::from("written"),
        HostStatus::Unchanged => String::from("unchanged"),
        HostStatus::Conflict => String::from("changed on disk, retry"),
        HostStatus::Failed { message } => format!("failed: {message}"),
    }
}

fn print_report(report: &OperationReport) -> Result<()> {
    for outcome in &report.outcomes {
        println!("{}\t{}", outcome.display_name, describe(&outcome.status));
    }
    for note in &report.notes {
        eprintln!("{note}");
    }
    let restart = report.restart_hosts();
    if !restart.is_empty() {
        println!("restart {} to apply", restart.join(", "));
    }
    if report.is_total_failure() {
        bail!(
            "{} {} failed on every host",
            report.action.as_str(),
            report.server
        );
    }
    Ok(())
}

fn run_watch(engine: &mut SwitchEngine, settings: &SwitchSettings) -> Result<()> {
    let _ = engine.sync();
    let manifests: Vec<PathBuf> = engine.watch_paths().to_vec();
    println!("watching {} manifests", manifests.len());
    let mut watcher = ManifestWatcher::new(&manifests, Duration::from_millis(settings.debounce_ms))
        .context("failed to initialize filesystem watcher")?;

    loop {
        let Some(report) = watcher
            .pump(engine, Duration::from_secs(2))
            .context("manifest watch stopped")?
        else {
            continue;
        };
        for path in &report.rejected {
            eprintln!("rejected {}", path.display());
        }
        if !report.updated.is_empty() {
            println!("reloaded {}", report.updated.join(", "));
        }
        if !report.removed.is_empty() {
            println!("dropped {}", report.removed.join(", "));
        }
        let restart = report.restart_hosts();
        if !restart.is_empty() {
            println!("restart {} to apply", restart.join(", "));
        }
    }
}

fn doctor(engine: &SwitchEngine, paths: &SwitchPaths, settings: &SwitchSettings) {
    println!("state={}", paths.runtime_directory.display());
    println!("servers_root={}", engine.scanner().root().display());
    println!("manifest={}", engine.scanner().manifest_file_name());
    println!("debounce_ms={}", settings.debounce_ms);
    println!(
        "collision_policy={}",
        serde_json::to_string(&settings.collision_policy).unwrap_or_default()
    );
    println!("manifests={}", engine.watch_paths().len());
    println!("catalog={}", engine.servers().len());
    println!("installed={}", engine.installed().len());
    println!("deleted={}", engine.deleted().len());

    for config in engine.host_configs() {
        let mut adapter = HostAdapter::new(config.clone());
        let status = if config.file_path.exists() {
            format!("{} entries", adapter.read_entries().len())
        } else {
            String::from("missing")
        };
        println!(
            "host {}\t{}\t{}",
            config.host_id,
            config.file_path.display(),
            status
        );
    }
}
