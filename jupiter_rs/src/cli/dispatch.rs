//! Dispatch parsed CLI commands to the engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{
    AnalyzeArgs, Cli, Command, MeetingCommand, PluginsCommand, RunArgs, ScanArgs,
    SimulateCommand, SnapshotsCommand,
};
use crate::analysis;
use crate::api::{ApiCounters, ApiState};
use crate::config::{JupiterConfig, Role};
use crate::error::{JupiterError, Result};
use crate::events::EventBus;
use crate::graph::{self, GraphOptions};
use crate::history;
use crate::jobs::{JobManager, JobManagerConfig};
use crate::license::{LicenseAdapter, LicenseStatus};
use crate::plugins::permissions::{canonical_digest, trust_level, AuditLog, TrustedKeys};
use crate::plugins::{self, BridgeServices, PluginBridge};
use crate::project::ProjectManager;
use crate::runner::{NoopTracer, RunRequest, Runner};
use crate::scanner;
use crate::simulate::{self, RemoveTarget};
use crate::types::{CancelToken, ScanOptions};

/// Run one parsed invocation, mapping errors to exit codes.
pub fn dispatch(cli: Cli) -> i32 {
    match execute(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[jupiter] error: {err}");
            err.exit_code()
        }
    }
}

fn execute(cli: Cli) -> Result<i32> {
    let root = cli
        .root
        .canonicalize()
        .map_err(|e| JupiterError::Validation(format!("bad root {}: {e}", cli.root.display())))?;
    let config = JupiterConfig::load(&root)?;
    let flags = cli_flags(&cli);
    let json = cli.json;

    match cli.command {
        Command::Scan(args) => cmd_scan(&root, &config, &flags, args),
        Command::Analyze(args) => cmd_analyze(&root, &config, &flags, args),
        Command::Ci => cmd_ci(&root, &config, &flags),
        Command::Snapshots { command } => cmd_snapshots(&root, json, command),
        Command::Simulate { command } => cmd_simulate(&root, &config, &flags, command),
        Command::Watch => cmd_watch(&root, &config, &flags),
        Command::Run(args) => cmd_run(&root, &config, json, args),
        Command::Server => cmd_server(&root, config, false),
        Command::Gui => cmd_server(&root, config, true),
        Command::Meeting { command } => cmd_meeting(&config, json, command),
        Command::Plugins { command } => cmd_plugins(&root, config, json, command),
        Command::Update => cmd_update(json),
        Command::Autodiag => cmd_autodiag(&root, &config, json),
        Command::External(parts) => cmd_external(&root, config, parts),
    }
}

struct GlobalFlags {
    json: bool,
    no_cache: bool,
    incremental: bool,
}

fn cli_flags(cli: &Cli) -> GlobalFlags {
    GlobalFlags {
        json: cli.json,
        no_cache: cli.no_cache,
        incremental: cli.incremental || !cli.no_cache,
    }
}

fn scan_options(flags: &GlobalFlags, show_hidden: bool, ignore_globs: &[String]) -> ScanOptions {
    ScanOptions {
        include_hidden: show_hidden,
        ignore_globs: ignore_globs.to_vec(),
        incremental: flags.incremental,
        no_cache: flags.no_cache,
        ..ScanOptions::default()
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| JupiterError::Internal(format!("tokio runtime: {e}")))
}

fn cmd_scan(
    root: &Path,
    config: &JupiterConfig,
    flags: &GlobalFlags,
    args: ScanArgs,
) -> Result<i32> {
    let mut options = scan_options(flags, args.show_hidden, &args.ignore_globs);
    options.capture_snapshot = args.snapshot;
    options.snapshot_label = args.label;
    let outcome = scanner::scan(root, &options, config, &CancelToken::new())?;
    for warning in &outcome.warnings {
        warn!("{warning}");
    }
    if flags.json {
        print_json(&outcome.report)?;
    } else {
        println!(
            "Scanned {} files ({} parsed, {} symbols) under {}",
            outcome.report.files.len(),
            outcome.parsed_files,
            outcome.report.symbol_count(),
            outcome.report.project_root,
        );
        for (language, summary) in &outcome.report.language_summary {
            println!("  {language}: {} files, {} symbols", summary.file_count, summary.symbol_count);
        }
        if let Some(snapshot) = &outcome.snapshot {
            println!("Snapshot captured: {}", snapshot.id);
        }
    }
    Ok(0)
}

fn cmd_analyze(
    root: &Path,
    config: &JupiterConfig,
    flags: &GlobalFlags,
    args: AnalyzeArgs,
) -> Result<i32> {
    let options = scan_options(flags, args.show_hidden, &args.ignore_globs);
    let outcome = scanner::scan(root, &options, config, &CancelToken::new())?;
    let summary = analysis::analyze(&outcome.report, args.top);
    if flags.json {
        print_json(&summary)?;
    } else {
        println!(
            "{} files, {} symbols, {} bytes",
            summary.file_count, summary.symbol_count, summary.total_bytes
        );
        if !summary.complexity_hotspots.is_empty() {
            println!("Complexity hotspots:");
            for hotspot in &summary.complexity_hotspots {
                println!("  {:>3}  {}", hotspot.complexity, hotspot.symbol_id);
            }
        }
        if !summary.duplication_clusters.is_empty() {
            println!("Duplication clusters: {}", summary.duplication_clusters.len());
        }
        println!("Usage: {:?}", summary.usage_summary);
    }
    Ok(0)
}

fn cmd_ci(root: &Path, config: &JupiterConfig, flags: &GlobalFlags) -> Result<i32> {
    let options = scan_options(flags, false, &[]);
    let outcome = scanner::scan(root, &options, config, &CancelToken::new())?;
    let summary = analysis::analyze(&outcome.report, 10);
    let verdict = analysis::evaluate_ci(summary, &config.ci);
    // CI mode always prints machine-readable JSON.
    print_json(&verdict)?;
    Ok(if verdict.pass { 0 } else { 1 })
}

fn cmd_snapshots(root: &Path, json: bool, command: SnapshotsCommand) -> Result<i32> {
    match command {
        SnapshotsCommand::List => {
            let snapshots = history::list_snapshots(root)?;
            if json {
                print_json(&snapshots)?;
            } else if snapshots.is_empty() {
                println!("No snapshots.");
            } else {
                for meta in snapshots {
                    println!(
                        "{}  {}  {} files  {}",
                        meta.id,
                        meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                        meta.file_count,
                        meta.label.unwrap_or_default(),
                    );
                }
            }
        }
        SnapshotsCommand::Show { id } => {
            let (metadata, report) = history::load_snapshot(root, &id)?;
            if json {
                print_json(&serde_json::json!({ "metadata": metadata, "report": report }))?;
            } else {
                println!(
                    "{}  {}  {} files, {} symbols",
                    metadata.id,
                    metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
                    metadata.file_count,
                    metadata.symbol_count,
                );
            }
        }
        SnapshotsCommand::Diff { id_a, id_b } => {
            let diff = history::diff(root, &id_a, &id_b)?;
            if json {
                print_json(&diff)?;
            } else {
                println!(
                    "files: +{} -{} ~{}",
                    diff.files_added.len(),
                    diff.files_removed.len(),
                    diff.files_modified.len()
                );
                println!(
                    "functions: +{} -{}",
                    diff.functions_added.len(),
                    diff.functions_removed.len()
                );
            }
        }
    }
    Ok(0)
}

fn cmd_simulate(
    root: &Path,
    config: &JupiterConfig,
    flags: &GlobalFlags,
    command: SimulateCommand,
) -> Result<i32> {
    let SimulateCommand::Remove { target, function } = command;
    let options = scan_options(flags, false, &[]);
    let outcome = scanner::scan(root, &options, config, &CancelToken::new())?;
    let built = graph::build(&outcome.report, &GraphOptions::default());
    let remove_target = match function {
        Some(function_name) => RemoveTarget::Symbol {
            path: target,
            function_name,
        },
        None => RemoveTarget::File { path: target },
    };
    let report = simulate::simulate_remove(&built, &remove_target)?;
    if flags.json {
        print_json(&report)?;
    } else {
        println!("Removing {} -> risk {:?}", report.target, report.risk_score);
        for impact in &report.impacts {
            println!("  {:?}  {}", impact.impact_type, impact.target);
        }
    }
    Ok(0)
}

fn cmd_watch(root: &Path, config: &JupiterConfig, flags: &GlobalFlags) -> Result<i32> {
    let options = scan_options(flags, false, &[]);
    eprintln!("[watch] Watching {} (Ctrl+C to exit)", root.display());
    crate::watch::watch_and_rescan(
        root,
        &options,
        config,
        &crate::watch::WatchConfig::default(),
        &CancelToken::new(),
        |outcome| {
            let timestamp = chrono::Local::now().format("%H:%M:%S");
            eprintln!(
                "[{timestamp}] {} files, {} parsed",
                outcome.report.files.len(),
                outcome.parsed_files
            );
        },
    )?;
    Ok(0)
}

fn cmd_run(root: &Path, config: &JupiterConfig, json: bool, args: RunArgs) -> Result<i32> {
    let command: Vec<String> = args
        .command
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if command.is_empty() {
        return Err(JupiterError::Validation("empty command".to_string()));
    }
    let request = RunRequest {
        command,
        with_dynamic: args.with_dynamic,
        env_overrides: Default::default(),
    };

    let rt = runtime()?;
    rt.block_on(async {
        let license = LicenseAdapter::new(config.license.clone());
        if !config.license.base_url.trim().is_empty() {
            license.refresh().await;
        }
        // The local CLI operator holds the admin role by definition.
        let audit = AuditLog::new(root);
        let target = request.command.join(" ");
        if let Err(err) = Runner::check_policy(
            &config.security,
            &request,
            Role::Admin,
            license.permits_privileged(),
        ) {
            let _ = audit.append(Some(Role::Admin), None, "run", &target, err.code());
            return Err(err);
        }
        let _ = audit.append(Some(Role::Admin), None, "run", &target, "ok");

        let bus = Arc::new(EventBus::default());
        let runner = Runner::new(bus, Arc::new(NoopTracer));
        let timeout = Duration::from_secs(config.performance.timeouts.run_seconds.max(1));
        let result = runner.run(&request, timeout, &CancelToken::new()).await?;
        if json {
            print_json(&result)?;
        } else {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if let Some(trace) = &result.dynamic_analysis {
                eprintln!("[dynamic] {} symbols traced", trace.calls.len());
            }
        }
        Ok(if result.returncode == 0 { 0 } else { 1 })
    })
}

/// Assemble the full server state and serve; `gui` additionally prints
/// the address to open.
fn cmd_server(root: &Path, config: JupiterConfig, gui: bool) -> Result<i32> {
    let rt = runtime()?;
    rt.block_on(async {
        let bus = Arc::new(EventBus::default());
        let jobs = JobManager::new(JobManagerConfig::default(), Arc::clone(&bus));
        let license = LicenseAdapter::new(config.license.clone());
        license.spawn_poller(Duration::from_secs(300));

        let bridge = PluginBridge::new(
            root.join("plugins"),
            BridgeServices {
                bus: Arc::clone(&bus),
                jobs: Arc::clone(&jobs),
                license: Arc::clone(&license),
                project_root: root.to_path_buf(),
                config: config.clone(),
            },
        );
        bridge.startup();

        let projects = Arc::new(ProjectManager::load_default());
        let _ = projects.ensure_local(root);

        if gui {
            println!(
                "Jupiter UI: http://{}:{}/ (token required)",
                config.server.host, config.server.port
            );
        }
        let state = Arc::new(ApiState {
            root: tokio::sync::RwLock::new(root.to_path_buf()),
            config: tokio::sync::RwLock::new(config),
            bus,
            jobs,
            license,
            bridge,
            projects,
            audit: AuditLog::new(root),
            latest_graph: tokio::sync::RwLock::new(None),
            counters: ApiCounters::default(),
        });
        crate::api::serve(state).await?;
        Ok(0)
    })
}

fn cmd_meeting(config: &JupiterConfig, json: bool, command: MeetingCommand) -> Result<i32> {
    let MeetingCommand::CheckLicense = command;
    let rt = runtime()?;
    rt.block_on(async {
        let adapter = LicenseAdapter::new(config.license.clone());
        let state = adapter.refresh().await;
        if json {
            print_json(&state)?;
        } else {
            println!("license: {:?} ({})", state.status, state.detail);
        }
        Ok(match state.status {
            LicenseStatus::Valid | LicenseStatus::Grace => 0,
            LicenseStatus::NetworkError => 3,
            _ => 1,
        })
    })
}

fn cmd_plugins(
    root: &Path,
    config: JupiterConfig,
    json: bool,
    command: PluginsCommand,
) -> Result<i32> {
    match command {
        PluginsCommand::Enable { id } => {
            let mut config = config;
            if !config.plugins.enabled_ids.contains(&id) {
                config.plugins.enabled_ids.push(id.clone());
                config.save(root)?;
            }
            println!("enabled {id}");
            Ok(0)
        }
        PluginsCommand::Disable { id } => {
            let mut config = config;
            config.plugins.enabled_ids.retain(|e| e != &id);
            config.save(root)?;
            println!("disabled {id} (takes effect next server start)");
            Ok(0)
        }
        PluginsCommand::Scaffold { id } => {
            let dir = plugins::scaffold(&root.join("plugins"), &id)?;
            println!("scaffolded {}", dir.display());
            Ok(0)
        }
        PluginsCommand::Sign { id, key } => {
            let dir = root.join("plugins").join(&id);
            let digest = canonical_digest(&dir)?;
            let manifest_path = dir.join("plugin.json");
            let text = std::fs::read_to_string(&manifest_path)
                .map_err(|e| JupiterError::NotFound(format!("{}: {e}", manifest_path.display())))?;
            let mut manifest: serde_json::Value = serde_json::from_str(&text)?;
            manifest["signature"] = serde_json::json!({ "key_id": key, "digest": digest });
            std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
                .map_err(|e| JupiterError::Internal(e.to_string()))?;
            println!("signed {id} with key {key}");
            Ok(0)
        }
        PluginsCommand::Verify { id } => {
            let dir = root.join("plugins").join(&id);
            let manifest = crate::plugins::manifest::PluginManifest::load(&dir)?;
            let trust = trust_level(manifest.signature.as_ref(), &dir, &TrustedKeys::builtin());
            if json {
                print_json(&serde_json::json!({ "id": id, "trust": trust }))?;
            } else {
                println!("{id}: trust {trust:?}");
            }
            Ok(0)
        }
        PluginsCommand::Reload { id } => {
            // Reload targets the running server.
            let token = config
                .security
                .tokens
                .iter()
                .find(|t| t.role == Role::Admin)
                .map(|t| t.token.clone())
                .ok_or_else(|| {
                    JupiterError::Auth("no admin token configured for server calls".to_string())
                })?;
            let url = format!(
                "http://{}:{}/plugins/{}/reload",
                config.server.host, config.server.port, id
            );
            let rt = runtime()?;
            rt.block_on(async {
                let client = reqwest::Client::new();
                let response = client
                    .post(&url)
                    .bearer_auth(&token)
                    .send()
                    .await
                    .map_err(|e| JupiterError::Connector(format!("server unreachable: {e}")))?;
                if response.status().is_success() {
                    println!("reloaded {id}");
                    Ok(0)
                } else {
                    Err(JupiterError::Connector(format!(
                        "server returned {}",
                        response.status()
                    )))
                }
            })
        }
        PluginsCommand::CheckUpdates | PluginsCommand::Update => {
            println!("no plugin update registry configured");
            Ok(0)
        }
        command => {
            // Bridge-backed operations share one setup.
            let rt = runtime()?;
            rt.block_on(async {
                let bus = Arc::new(EventBus::default());
                let bridge = PluginBridge::new(
                    root.join("plugins"),
                    BridgeServices {
                        jobs: JobManager::new(JobManagerConfig::default(), Arc::clone(&bus)),
                        license: LicenseAdapter::new(config.license.clone()),
                        project_root: root.to_path_buf(),
                        config: config.clone(),
                        bus,
                    },
                );
                bridge.startup();
                match command {
                    PluginsCommand::List => {
                        let registrations = bridge.list();
                        if json {
                            print_json(&registrations)?;
                        } else if registrations.is_empty() {
                            println!("No plugins.");
                        } else {
                            for registration in registrations {
                                println!(
                                    "{}  {:?}  {:?}{}",
                                    registration.manifest.id,
                                    registration.status,
                                    registration.trust,
                                    registration
                                        .error
                                        .map(|e| format!("  ({e})"))
                                        .unwrap_or_default(),
                                );
                            }
                        }
                        Ok(0)
                    }
                    PluginsCommand::Info { id } => {
                        let registration = bridge
                            .get(&id)
                            .ok_or_else(|| JupiterError::NotFound(format!("plugin {id}")))?;
                        print_json(&registration)?;
                        Ok(0)
                    }
                    PluginsCommand::Install { path } => {
                        let registration = bridge.install_from_path(&path)?;
                        println!(
                            "installed {} ({:?})",
                            registration.manifest.id, registration.status
                        );
                        Ok(0)
                    }
                    PluginsCommand::Uninstall { id } => {
                        bridge.uninstall(&id)?;
                        println!("uninstalled {id}");
                        Ok(0)
                    }
                    _ => unreachable!("handled above"),
                }
            })
        }
    }
}

fn cmd_update(json: bool) -> Result<i32> {
    if json {
        print_json(&serde_json::json!({
            "current": crate::types::JUPITER_VERSION,
            "update_available": false,
        }))?;
    } else {
        println!(
            "jupiter {} - no update channel configured",
            crate::types::JUPITER_VERSION
        );
    }
    Ok(0)
}

fn cmd_autodiag(root: &Path, config: &JupiterConfig, json: bool) -> Result<i32> {
    let cache_dir = crate::cache::cache_dir(root);
    let snapshots = history::list_snapshots(root).unwrap_or_default();
    let plugin_dirs = std::fs::read_dir(root.join("plugins"))
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0);
    let diagnosis = serde_json::json!({
        "version": crate::types::JUPITER_VERSION,
        "root": root.display().to_string(),
        "config_file": JupiterConfig::project_config_path(root)
            .exists(),
        "global_config_file": JupiterConfig::global_config_path().exists(),
        "cache_present": cache_dir.exists(),
        "snapshot_count": snapshots.len(),
        "plugin_dir_count": plugin_dirs,
        "developer_mode": config.developer_mode,
        "allow_run": config.security.allow_run,
        "license_configured": !config.license.base_url.trim().is_empty(),
    });
    if json {
        print_json(&diagnosis)?;
    } else {
        println!("jupiter {}", crate::types::JUPITER_VERSION);
        println!("root: {}", root.display());
        println!("cache: {}", if cache_dir.exists() { "present" } else { "absent" });
        println!("snapshots: {}", snapshots.len());
        println!("plugin dirs: {plugin_dirs}");
        println!("developer_mode: {}", config.developer_mode);
        println!("allow_run: {}", config.security.allow_run);
    }
    Ok(0)
}

/// `p:<plugin_id>:<verb> [args...]` external subcommands.
fn cmd_external(root: &Path, config: JupiterConfig, parts: Vec<String>) -> Result<i32> {
    let Some(first) = parts.first() else {
        return Err(JupiterError::Validation("empty command".to_string()));
    };
    let mut pieces = first.splitn(3, ':');
    let (prefix, plugin_id, verb) = (pieces.next(), pieces.next(), pieces.next());
    let (Some("p"), Some(plugin_id), Some(verb)) = (prefix, plugin_id, verb) else {
        return Err(JupiterError::Validation(format!(
            "unknown command {first:?}; plugin verbs use p:<plugin_id>:<verb>"
        )));
    };

    let rt = runtime()?;
    let plugin_id = plugin_id.to_string();
    let verb = verb.to_string();
    let args: Vec<String> = parts[1..].to_vec();
    rt.block_on(async {
        let bus = Arc::new(EventBus::default());
        let bridge = PluginBridge::new(
            root.join("plugins"),
            BridgeServices {
                jobs: JobManager::new(JobManagerConfig::default(), Arc::clone(&bus)),
                license: LicenseAdapter::new(config.license.clone()),
                project_root: root.to_path_buf(),
                config: config.clone(),
                bus,
            },
        );
        bridge.startup();
        match bridge.cli_owner(&verb) {
            Some(owner) if owner == plugin_id => {
                let output = bridge.dispatch_cli(&verb, &args)?;
                println!("{output}");
                Ok(0)
            }
            Some(owner) => Err(JupiterError::Validation(format!(
                "verb {verb} belongs to plugin {owner}, not {plugin_id}"
            ))),
            None => Err(JupiterError::NotFound(format!(
                "no plugin contributes verb {verb}"
            ))),
        }
    })
}
