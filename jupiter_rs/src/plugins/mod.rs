//! Plugin bridge: discovery, lifecycle, registries and the service
//! locator.
//!
//! Five strictly ordered phases: discover -> initialize -> register ->
//! ready -> shutdown. Dependency cycles are detected with Tarjan's SCC
//! and every member is marked `error(cycle)`. Hot reload is admitted
//! only in developer mode and refused while the plugin holds a
//! non-terminal job. Plugins without a manifest but exposing the bare
//! `on_scan`/`on_analyze` hooks are wrapped by the legacy adapter.

pub mod manifest;
pub mod permissions;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::JupiterConfig;
use crate::error::{JupiterError, Result};
use crate::events::{Event, EventBus, SubscriptionHandle, Topic};
use crate::jobs::{JobHandler, JobManager};
use crate::license::LicenseAdapter;
use manifest::{PluginManifest, PluginType, UiPanel, MANIFEST_FILE};
use permissions::{
    install_decision, trust_level, AuditLog, InstallDecision, InstallMode, Permission, TrustLevel,
    TrustedKeys,
};

/// In-process plugin surface. `init` runs once per activation with the
/// locator; hook delivery arrives through `on_event` for the topics the
/// manifest subscribes.
pub trait Plugin: Send + Sync {
    fn init(&mut self, services: &ServiceLocator) -> std::result::Result<(), String>;
    fn shutdown(&mut self) {}
    fn health(&self) -> serde_json::Value {
        serde_json::json!({ "ok": true })
    }
    fn metrics(&self) -> serde_json::Value {
        serde_json::json!({})
    }
    fn on_event(&self, _event: &Event) {}
    /// Contributed CLI verb handler; the default declines.
    fn handle_cli(&self, verb: &str, _args: &[String]) -> std::result::Result<String, String> {
        Err(format!("verb {verb} has no handler"))
    }
}

/// Bare hook surface of pre-manifest plugins.
pub trait LegacyHooks: Send + Sync {
    fn on_scan(&self, _report: &serde_json::Value) {}
    fn on_analyze(&self, _summary: &serde_json::Value) {}
}

/// Wraps a [`LegacyHooks`] implementation behind the regular plugin
/// surface with a synthesized manifest.
struct LegacyAdapter {
    hooks: Arc<dyn LegacyHooks>,
}

impl Plugin for LegacyAdapter {
    fn init(&mut self, _services: &ServiceLocator) -> std::result::Result<(), String> {
        Ok(())
    }

    fn on_event(&self, event: &Event) {
        if event.topic != Topic::ScanFinished {
            return;
        }
        // Scan completions carry a `report` payload; analysis
        // completions carry a `summary` payload.
        if let Some(summary) = event.payload.get("summary") {
            self.hooks.on_analyze(summary);
        } else if let Some(report) = event.payload.get("report") {
            self.hooks.on_scan(report);
        }
    }
}

/// Plugins discovered without registered code still get a lifecycle;
/// their value is the manifest's declarative contributions.
struct DeclarativePlugin;

impl Plugin for DeclarativePlugin {
    fn init(&mut self, _services: &ServiceLocator) -> std::result::Result<(), String> {
        Ok(())
    }
}

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Discovered,
    Loading,
    Ready,
    Error,
    Disabled,
}

/// Runtime shadow of a manifest; owned by the bridge, destroyed on
/// unload.
#[derive(Clone, Debug, Serialize)]
pub struct PluginRegistration {
    pub manifest: PluginManifest,
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub legacy: bool,
    pub trust: TrustLevel,
    pub subscribed_topics: Vec<String>,
    pub cli_verbs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_prefix: Option<String>,
    pub ui_panels: Vec<UiPanel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health: Option<serde_json::Value>,
    #[serde(skip)]
    pub dir: PathBuf,
}

impl PluginRegistration {
    fn new(manifest: PluginManifest, trust: TrustLevel, dir: PathBuf) -> Self {
        Self {
            status: PluginStatus::Discovered,
            error: None,
            legacy: false,
            trust,
            subscribed_topics: manifest.subscriptions.clone(),
            cli_verbs: manifest.cli.iter().map(|c| c.verb.clone()).collect(),
            api_prefix: manifest.api_prefix.clone(),
            ui_panels: manifest.ui_panels.clone(),
            last_health: None,
            manifest,
            dir,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.status = PluginStatus::Error;
        self.error = Some(reason.into());
    }
}

/// Core services the bridge exposes to plugins through locators.
pub struct BridgeServices {
    pub bus: Arc<EventBus>,
    pub jobs: Arc<JobManager>,
    pub license: Arc<LicenseAdapter>,
    pub project_root: PathBuf,
    pub config: JupiterConfig,
}

/// The only sanctioned way for plugins to reach core services; every
/// call path checks `plugin_has(permission)`.
pub struct ServiceLocator {
    plugin_id: String,
    permissions: HashSet<Permission>,
    bus: Arc<EventBus>,
    jobs: Arc<JobManager>,
    license: Arc<LicenseAdapter>,
    project_root: PathBuf,
    config_slice: serde_json::Value,
}

impl ServiceLocator {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    fn require(&self, permission: Permission) -> Result<()> {
        if self.plugin_has(permission) {
            Ok(())
        } else {
            Err(JupiterError::PolicyDenied(format!(
                "plugin {} lacks permission {:?}",
                self.plugin_id, permission
            )))
        }
    }

    /// Structured logger routed through the host's tracing stack.
    pub fn log(&self, message: &str) {
        info!(plugin = %self.plugin_id, "{message}");
    }

    pub fn active_root(&self) -> &Path {
        &self.project_root
    }

    pub fn emit_event(&self, topic: Topic, payload: serde_json::Value) -> Result<()> {
        self.require(Permission::EmitEvents)?;
        self.bus.emit(topic, payload);
        Ok(())
    }

    pub fn config_slice(&self) -> Result<serde_json::Value> {
        self.require(Permission::ConfigAccess)?;
        Ok(self.config_slice.clone())
    }

    pub fn license_status(&self) -> Result<crate::license::LicenseState> {
        self.require(Permission::AccessLicense)?;
        Ok(self.license.status())
    }

    pub fn submit_job(
        &self,
        params: serde_json::Value,
        timeout: std::time::Duration,
        handler: JobHandler,
    ) -> Result<String> {
        self.jobs.submit(&self.plugin_id, params, timeout, handler)
    }

    pub fn read_project_file(&self, rel_path: &str) -> Result<Vec<u8>> {
        self.require(Permission::FsRead)?;
        let path = self.safe_join(rel_path)?;
        std::fs::read(&path)
            .map_err(|e| JupiterError::NotFound(format!("{}: {e}", path.display())))
    }

    pub fn write_project_file(&self, rel_path: &str, contents: &[u8]) -> Result<()> {
        self.require(Permission::FsWrite)?;
        let path = self.safe_join(rel_path)?;
        crate::cache::write_atomic(&path, contents)?;
        Ok(())
    }

    pub fn list_snapshots(&self) -> Result<Vec<crate::history::SnapshotMetadata>> {
        self.require(Permission::FsRead)?;
        crate::history::list_snapshots(&self.project_root)
    }

    pub fn load_snapshot(
        &self,
        id: &str,
    ) -> Result<(crate::history::SnapshotMetadata, crate::types::ScanReport)> {
        self.require(Permission::FsRead)?;
        crate::history::load_snapshot(&self.project_root, id)
    }

    pub fn build_graph(
        &self,
        report: &crate::types::ScanReport,
        options: &crate::graph::GraphOptions,
    ) -> crate::graph::DependencyGraph {
        crate::graph::build(report, options)
    }

    fn safe_join(&self, rel_path: &str) -> Result<PathBuf> {
        let rel = Path::new(rel_path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(JupiterError::Validation(format!(
                "path escapes project root: {rel_path}"
            )));
        }
        Ok(self.project_root.join(rel))
    }
}

struct Instance {
    plugin: Arc<Mutex<Box<dyn Plugin>>>,
    subscription: Option<SubscriptionHandle>,
}

pub struct PluginBridge {
    plugins_dir: PathBuf,
    services: BridgeServices,
    keys: TrustedKeys,
    install_mode: InstallMode,
    registrations: RwLock<BTreeMap<String, PluginRegistration>>,
    instances: Mutex<HashMap<String, Instance>>,
    factories: RwLock<HashMap<String, PluginFactory>>,
    legacy_hooks: RwLock<HashMap<String, Arc<dyn LegacyHooks>>>,
    /// verb -> plugin id; first registration wins.
    cli_registry: RwLock<BTreeMap<String, String>>,
    /// route prefix -> plugin id; first registration wins.
    api_registry: RwLock<BTreeMap<String, String>>,
    topo_order: Mutex<Vec<String>>,
    audit: AuditLog,
}

impl PluginBridge {
    pub fn new(plugins_dir: PathBuf, services: BridgeServices) -> Arc<Self> {
        let audit = AuditLog::new(&services.project_root);
        let install_mode = if services.config.developer_mode {
            InstallMode::Dev
        } else {
            InstallMode::Permissive
        };
        Arc::new(Self {
            plugins_dir,
            services,
            keys: TrustedKeys::builtin(),
            install_mode,
            registrations: RwLock::new(BTreeMap::new()),
            instances: Mutex::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            legacy_hooks: RwLock::new(HashMap::new()),
            cli_registry: RwLock::new(BTreeMap::new()),
            api_registry: RwLock::new(BTreeMap::new()),
            topo_order: Mutex::new(Vec::new()),
            audit,
        })
    }

    /// Register native code for a manifest id, replacing the default
    /// declarative implementation.
    pub fn register_factory(&self, id: &str, factory: PluginFactory) {
        self.factories
            .write()
            .expect("factories poisoned")
            .insert(id.to_string(), factory);
    }

    /// Admit a pre-manifest plugin: synthesize a `tool` manifest with
    /// minimal permissions and subscribe it to the scan hooks.
    pub fn register_legacy(&self, id: &str, hooks: Arc<dyn LegacyHooks>) {
        let manifest = PluginManifest {
            id: id.to_string(),
            version: "0.0.0".to_string(),
            plugin_type: PluginType::Tool,
            compatibility: "*".to_string(),
            entrypoints: BTreeMap::new(),
            permissions: Vec::new(),
            subscriptions: vec![Topic::ScanFinished.as_str().to_string()],
            config_schema: None,
            config_schema_version: None,
            dependencies: Vec::new(),
            declared_trust: None,
            signature: None,
            cli: Vec::new(),
            api_prefix: None,
            ui_panels: Vec::new(),
        };
        let mut registration =
            PluginRegistration::new(manifest, TrustLevel::Community, self.plugins_dir.clone());
        registration.legacy = true;
        self.legacy_hooks
            .write()
            .expect("legacy hooks poisoned")
            .insert(id.to_string(), hooks);
        self.registrations
            .write()
            .expect("registrations poisoned")
            .insert(id.to_string(), registration);
    }

    /// Phase 1: enumerate manifest directories, validate, resolve trust
    /// and dependencies, detect cycles.
    pub fn discover(&self) {
        let mut found: BTreeMap<String, PluginRegistration> = BTreeMap::new();

        if let Ok(entries) = std::fs::read_dir(&self.plugins_dir) {
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir() && p.join(MANIFEST_FILE).is_file())
                .collect();
            dirs.sort();
            for dir in dirs {
                match PluginManifest::load(&dir) {
                    Ok(manifest) => {
                        let id = manifest.id.clone();
                        if found.contains_key(&id) {
                            let mut dup = PluginRegistration::new(
                                manifest,
                                TrustLevel::Community,
                                dir.clone(),
                            );
                            dup.fail(format!("duplicate plugin id {id}"));
                            found.insert(format!("{id}@{}", dir.display()), dup);
                            continue;
                        }
                        let trust =
                            trust_level(manifest.signature.as_ref(), &dir, &self.keys);
                        let unsigned_local = manifest.signature.is_none();
                        let decision = install_decision(
                            self.install_mode,
                            trust,
                            unsigned_local,
                            self.services.config.allow_unsigned_local_plugins
                                || self.services.config.developer_mode,
                        );
                        let mut registration = PluginRegistration::new(manifest, trust, dir);
                        match decision {
                            InstallDecision::Refuse => {
                                registration.fail("refused by installation policy")
                            }
                            InstallDecision::AllowWithWarning => {
                                warn!(plugin = %id, "loading community plugin");
                            }
                            InstallDecision::Allow => {}
                        }
                        let enabled = &self.services.config.plugins.enabled_ids;
                        if !enabled.is_empty() && !enabled.contains(&id) {
                            registration.status = PluginStatus::Disabled;
                        }
                        found.insert(id, registration);
                    }
                    Err(err) => {
                        // Keep the rejected directory visible under its
                        // directory name.
                        let id = dir
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        let manifest = PluginManifest {
                            id: id.clone(),
                            version: "0.0.0".to_string(),
                            plugin_type: PluginType::Tool,
                            compatibility: "*".to_string(),
                            entrypoints: BTreeMap::new(),
                            permissions: Vec::new(),
                            subscriptions: Vec::new(),
                            config_schema: None,
                            config_schema_version: None,
                            dependencies: Vec::new(),
                            declared_trust: None,
                            signature: None,
                            cli: Vec::new(),
                            api_prefix: None,
                            ui_panels: Vec::new(),
                        };
                        let mut registration =
                            PluginRegistration::new(manifest, TrustLevel::Community, dir);
                        registration.fail(err.to_string());
                        found.insert(id, registration);
                    }
                }
            }
        }

        // Preserve plugins that are already live (re-discovery after an
        // install must not re-initialize running peers), and merge
        // previously registered legacy plugins.
        {
            let existing = self.registrations.read().expect("registrations poisoned");
            let instances = self.instances.lock().expect("instances poisoned");
            for (id, registration) in existing.iter() {
                if registration.legacy || instances.contains_key(id) {
                    found.insert(id.clone(), registration.clone());
                }
            }
        }

        resolve_dependencies(&mut found);
        let order = topological_order(&found);
        *self.topo_order.lock().expect("topo poisoned") = order;
        *self.registrations.write().expect("registrations poisoned") = found;
        info!(
            count = self.registrations.read().expect("registrations poisoned").len(),
            "plugin discovery finished"
        );
    }

    /// Phases 2-4: initialize in topological order, register
    /// contributions, broadcast readiness.
    pub fn initialize(&self) {
        let order = self.topo_order.lock().expect("topo poisoned").clone();
        for id in &order {
            if !self.plugin_is_startable(id) {
                continue;
            }
            if let Err(reason) = self.activate(id) {
                error!(plugin = %id, %reason, "plugin init failed");
                self.with_registration(id, |r| r.fail(reason.to_string()));
                self.fail_dependents(id);
            }
        }
        self.register_contributions();
        self.broadcast_ready();
    }

    /// discover + initialize in one call.
    pub fn startup(&self) {
        self.discover();
        self.initialize();
    }

    fn plugin_is_startable(&self, id: &str) -> bool {
        self.registrations
            .read()
            .expect("registrations poisoned")
            .get(id)
            .map(|r| matches!(r.status, PluginStatus::Discovered))
            .unwrap_or(false)
    }

    /// Load code, run init, subscribe hooks.
    fn activate(&self, id: &str) -> Result<()> {
        self.with_registration(id, |r| r.status = PluginStatus::Loading);
        let registration = self
            .get(id)
            .ok_or_else(|| JupiterError::NotFound(format!("plugin {id}")))?;

        let mut plugin: Box<dyn Plugin> = if registration.legacy {
            let hooks = self
                .legacy_hooks
                .read()
                .expect("legacy hooks poisoned")
                .get(id)
                .cloned()
                .ok_or_else(|| JupiterError::Internal(format!("legacy hooks missing for {id}")))?;
            Box::new(LegacyAdapter { hooks })
        } else if let Some(factory) = self
            .factories
            .read()
            .expect("factories poisoned")
            .get(id)
            .cloned()
        {
            factory()
        } else {
            Box::new(DeclarativePlugin)
        };

        let locator = self.locator_for(&registration);
        plugin
            .init(&locator)
            .map_err(|reason| JupiterError::Internal(format!("init: {reason}")))?;
        let plugin = Arc::new(Mutex::new(plugin));

        let topics: Vec<Topic> = registration
            .subscribed_topics
            .iter()
            .filter_map(|name| Topic::ALL.iter().find(|t| t.as_str() == name).copied())
            .collect();
        let subscription = if topics.is_empty() {
            None
        } else {
            let subscriber = Arc::clone(&plugin);
            Some(self.services.bus.subscribe(
                &topics,
                Arc::new(move |event| {
                    subscriber.lock().expect("plugin poisoned").on_event(&event)
                }),
                true,
            ))
        };

        self.instances.lock().expect("instances poisoned").insert(
            id.to_string(),
            Instance {
                plugin,
                subscription,
            },
        );
        self.with_registration(id, |r| {
            r.status = PluginStatus::Ready;
            r.error = None;
        });
        debug!(plugin = %id, "plugin ready");
        Ok(())
    }

    /// Mark plugins that hard-depend on a failed plugin as errored.
    fn fail_dependents(&self, failed_id: &str) {
        let dependents: Vec<String> = {
            let registrations = self.registrations.read().expect("registrations poisoned");
            registrations
                .values()
                .filter(|r| {
                    r.status == PluginStatus::Discovered
                        && r.manifest
                            .dependencies
                            .iter()
                            .any(|d| d.id == failed_id && !d.optional)
                })
                .map(|r| r.manifest.id.clone())
                .collect()
        };
        for id in dependents {
            self.with_registration(&id, |r| {
                r.fail(format!("dependency failed: {failed_id}"))
            });
            self.fail_dependents(&id);
        }
    }

    /// Phase 3: mount CLI verbs and API prefixes. Duplicates across
    /// plugins are refused: first wins, later logged as error.
    fn register_contributions(&self) {
        let order = self.topo_order.lock().expect("topo poisoned").clone();
        for id in &order {
            let Some(registration) = self.get(id) else {
                continue;
            };
            if registration.status != PluginStatus::Ready {
                continue;
            }
            {
                let mut cli = self.cli_registry.write().expect("cli registry poisoned");
                for verb in &registration.cli_verbs {
                    match cli.get(verb) {
                        Some(owner) if owner != id => {
                            error!(
                                plugin = %id,
                                verb,
                                owner = %owner,
                                "duplicate CLI verb refused"
                            );
                        }
                        _ => {
                            cli.insert(verb.clone(), id.clone());
                        }
                    }
                }
            }
            if let Some(prefix) = &registration.api_prefix {
                let mut api = self.api_registry.write().expect("api registry poisoned");
                match api.get(prefix) {
                    Some(owner) if owner != id => {
                        error!(plugin = %id, prefix, owner = %owner, "duplicate API prefix refused");
                    }
                    _ => {
                        api.insert(prefix.clone(), id.clone());
                    }
                }
            }
        }
    }

    /// Phase 4: broadcast the final registry.
    fn broadcast_ready(&self) {
        let ready: Vec<String> = self
            .list()
            .into_iter()
            .filter(|r| r.status == PluginStatus::Ready)
            .map(|r| r.manifest.id)
            .collect();
        self.services.bus.emit(
            Topic::PluginToggled,
            serde_json::json!({ "ready": ready, "phase": "startup" }),
        );
    }

    /// Phase 5: reverse topological shutdown.
    pub fn shutdown_all(&self) {
        let mut order = self.topo_order.lock().expect("topo poisoned").clone();
        order.reverse();
        for id in order {
            self.deactivate(&id);
        }
    }

    fn deactivate(&self, id: &str) {
        let instance = self
            .instances
            .lock()
            .expect("instances poisoned")
            .remove(id);
        if let Some(instance) = instance {
            if let Some(subscription) = instance.subscription {
                self.services.bus.unsubscribe(subscription);
            }
            instance.plugin.lock().expect("plugin poisoned").shutdown();
        }
        let mut cli = self.cli_registry.write().expect("cli registry poisoned");
        cli.retain(|_, owner| owner != id);
        drop(cli);
        let mut api = self.api_registry.write().expect("api registry poisoned");
        api.retain(|_, owner| owner != id);
    }

    /// Enable or disable a plugin at runtime.
    pub fn toggle(&self, id: &str, enabled: bool) -> Result<bool> {
        let registration = self
            .get(id)
            .ok_or_else(|| JupiterError::NotFound(format!("plugin {id}")))?;
        if enabled {
            if registration.status == PluginStatus::Ready {
                return Ok(true);
            }
            self.with_registration(id, |r| r.status = PluginStatus::Discovered);
            self.activate(id)
                .map_err(|e| JupiterError::Internal(format!("enable {id}: {e}")))?;
            self.register_contributions();
        } else {
            self.deactivate(id);
            self.with_registration(id, |r| r.status = PluginStatus::Disabled);
        }
        self.services.bus.emit(
            Topic::PluginToggled,
            serde_json::json!({ "plugin_id": id, "enabled": enabled }),
        );
        let _ = self
            .audit
            .append(None, None, "plugin_toggle", id, if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Hot reload one plugin. Developer mode only; refused while the
    /// plugin holds a non-terminal job (pending included).
    pub fn reload(&self, id: &str) -> Result<()> {
        if !self.services.config.developer_mode {
            return Err(JupiterError::PolicyDenied(
                "hot reload requires developer_mode".to_string(),
            ));
        }
        let registration = self
            .get(id)
            .ok_or_else(|| JupiterError::NotFound(format!("plugin {id}")))?;
        if let Some(job_id) = self.services.jobs.non_terminal_job(id) {
            return Err(JupiterError::PolicyDenied(format!(
                "plugin {id} holds non-terminal job {job_id}; cancel or wait first"
            )));
        }

        // Unregister contributions, release the module handle, re-run the
        // single-plugin lifecycle.
        self.deactivate(id);
        if !registration.legacy {
            match PluginManifest::load(&registration.dir) {
                Ok(manifest) => {
                    let trust = trust_level(manifest.signature.as_ref(), &registration.dir, &self.keys);
                    let mut fresh =
                        PluginRegistration::new(manifest, trust, registration.dir.clone());
                    fresh.status = PluginStatus::Discovered;
                    self.registrations
                        .write()
                        .expect("registrations poisoned")
                        .insert(id.to_string(), fresh);
                }
                Err(err) => {
                    self.with_registration(id, |r| r.fail(err.to_string()));
                    return Err(err);
                }
            }
        } else {
            self.with_registration(id, |r| r.status = PluginStatus::Discovered);
        }
        self.activate(id)?;
        self.register_contributions();
        self.services
            .bus
            .emit(Topic::PluginReloaded, serde_json::json!({ "plugin_id": id }));
        let _ = self.audit.append(None, None, "plugin_reload", id, "ok");
        Ok(())
    }

    /// Install a plugin from a local directory: copy under `plugins/`
    /// and discover it. Remote sources are out of contract here.
    pub fn install_from_path(&self, source: &Path) -> Result<PluginRegistration> {
        if !source.join(MANIFEST_FILE).is_file() {
            return Err(JupiterError::Validation(format!(
                "{} has no {MANIFEST_FILE}",
                source.display()
            )));
        }
        let manifest = PluginManifest::load(source)?;
        let destination = self.plugins_dir.join(&manifest.id);
        if destination.exists() {
            return Err(JupiterError::Validation(format!(
                "plugin {} already installed",
                manifest.id
            )));
        }
        copy_dir(source, &destination)?;
        let _ = self
            .audit
            .append(None, None, "plugin_install", &manifest.id, "ok");
        self.discover();
        self.initialize();
        self.get(&manifest.id)
            .ok_or_else(|| JupiterError::Internal("install lost the plugin".to_string()))
    }

    pub fn uninstall(&self, id: &str) -> Result<()> {
        let registration = self
            .get(id)
            .ok_or_else(|| JupiterError::NotFound(format!("plugin {id}")))?;
        self.deactivate(id);
        self.registrations
            .write()
            .expect("registrations poisoned")
            .remove(id);
        if registration.dir.starts_with(&self.plugins_dir) {
            let _ = std::fs::remove_dir_all(&registration.dir);
        }
        let _ = self.audit.append(None, None, "plugin_uninstall", id, "ok");
        Ok(())
    }

    pub fn list(&self) -> Vec<PluginRegistration> {
        self.registrations
            .read()
            .expect("registrations poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<PluginRegistration> {
        self.registrations
            .read()
            .expect("registrations poisoned")
            .get(id)
            .cloned()
    }

    /// Owner of a contributed CLI verb.
    pub fn cli_owner(&self, verb: &str) -> Option<String> {
        self.cli_registry
            .read()
            .expect("cli registry poisoned")
            .get(verb)
            .cloned()
    }

    pub fn api_owner(&self, prefix: &str) -> Option<String> {
        self.api_registry
            .read()
            .expect("api registry poisoned")
            .get(prefix)
            .cloned()
    }

    /// Route a contributed CLI verb to its owning plugin.
    pub fn dispatch_cli(&self, verb: &str, args: &[String]) -> Result<String> {
        let owner = self
            .cli_owner(verb)
            .ok_or_else(|| JupiterError::NotFound(format!("CLI verb {verb}")))?;
        let instances = self.instances.lock().expect("instances poisoned");
        let instance = instances
            .get(&owner)
            .ok_or_else(|| JupiterError::NotFound(format!("plugin {owner} not active")))?;
        let result = instance
            .plugin
            .lock()
            .expect("plugin poisoned")
            .handle_cli(verb, args);
        result.map_err(|message| JupiterError::Internal(format!("plugin {owner}: {message}")))
    }

    /// Poll every ready instance's health into its registration.
    pub fn refresh_health(&self) {
        let snapshot: Vec<(String, serde_json::Value)> = {
            let instances = self.instances.lock().expect("instances poisoned");
            instances
                .iter()
                .map(|(id, instance)| {
                    let health = instance.plugin.lock().expect("plugin poisoned").health();
                    (id.clone(), health)
                })
                .collect()
        };
        for (id, health) in snapshot {
            self.with_registration(&id, |r| r.last_health = Some(health.clone()));
        }
    }

    fn locator_for(&self, registration: &PluginRegistration) -> ServiceLocator {
        ServiceLocator {
            plugin_id: registration.manifest.id.clone(),
            permissions: registration.manifest.permissions.iter().copied().collect(),
            bus: Arc::clone(&self.services.bus),
            jobs: Arc::clone(&self.services.jobs),
            license: Arc::clone(&self.services.license),
            project_root: self.services.project_root.clone(),
            config_slice: self.services.config.plugin_slice(&registration.manifest.id),
        }
    }

    fn with_registration(&self, id: &str, apply: impl FnOnce(&mut PluginRegistration)) {
        let mut registrations = self.registrations.write().expect("registrations poisoned");
        if let Some(registration) = registrations.get_mut(id) {
            apply(registration);
        }
    }
}

/// Check declared dependencies: unknown or version-mismatched hard
/// dependencies error the dependent; cycles error every member.
fn resolve_dependencies(found: &mut BTreeMap<String, PluginRegistration>) {
    let versions: HashMap<String, String> = found
        .values()
        .map(|r| (r.manifest.id.clone(), r.manifest.version.clone()))
        .collect();

    let mut failures: Vec<(String, String)> = Vec::new();
    for registration in found.values() {
        if registration.status == PluginStatus::Error {
            continue;
        }
        for dependency in &registration.manifest.dependencies {
            match versions.get(&dependency.id) {
                None if dependency.optional => {}
                None => failures.push((
                    registration.manifest.id.clone(),
                    format!("missing dependency {}", dependency.id),
                )),
                Some(version) => {
                    if !manifest::version_in_range(version, &dependency.version) {
                        failures.push((
                            registration.manifest.id.clone(),
                            format!(
                                "dependency {} version {} does not satisfy {}",
                                dependency.id, version, dependency.version
                            ),
                        ));
                    }
                }
            }
        }
    }
    for (id, reason) in failures {
        if let Some(registration) = found.get_mut(&id) {
            registration.fail(reason);
        }
    }

    for cycle_member in cycle_members(found) {
        if let Some(registration) = found.get_mut(&cycle_member) {
            registration.fail("cycle");
        }
    }
}

/// Tarjan's strongly connected components over the dependency graph;
/// any SCC larger than one node (or a self-dependency) is a cycle.
fn cycle_members(found: &BTreeMap<String, PluginRegistration>) -> Vec<String> {
    struct Tarjan<'a> {
        graph: &'a HashMap<String, Vec<String>>,
        index: HashMap<String, usize>,
        lowlink: HashMap<String, usize>,
        on_stack: HashSet<String>,
        stack: Vec<String>,
        counter: usize,
        cycles: Vec<String>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, node: &str) {
            self.index.insert(node.to_string(), self.counter);
            self.lowlink.insert(node.to_string(), self.counter);
            self.counter += 1;
            self.stack.push(node.to_string());
            self.on_stack.insert(node.to_string());

            for next in self.graph.get(node).cloned().unwrap_or_default() {
                if !self.index.contains_key(&next) {
                    self.visit(&next);
                    let low = self.lowlink[&next].min(self.lowlink[node]);
                    self.lowlink.insert(node.to_string(), low);
                } else if self.on_stack.contains(&next) {
                    let low = self.index[&next].min(self.lowlink[node]);
                    self.lowlink.insert(node.to_string(), low);
                }
            }

            if self.lowlink[node] == self.index[node] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(&member);
                    let done = member == node;
                    component.push(member);
                    if done {
                        break;
                    }
                }
                let self_loop = component.len() == 1
                    && self
                        .graph
                        .get(&component[0])
                        .map(|deps| deps.contains(&component[0]))
                        .unwrap_or(false);
                if component.len() > 1 || self_loop {
                    self.cycles.extend(component);
                }
            }
        }
    }

    let graph: HashMap<String, Vec<String>> = found
        .values()
        .map(|r| {
            (
                r.manifest.id.clone(),
                r.manifest
                    .dependencies
                    .iter()
                    .filter(|d| found.contains_key(&d.id))
                    .map(|d| d.id.clone())
                    .collect(),
            )
        })
        .collect();

    let mut tarjan = Tarjan {
        graph: &graph,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        counter: 0,
        cycles: Vec::new(),
    };
    let mut ids: Vec<&String> = graph.keys().collect();
    ids.sort();
    for id in ids {
        if !tarjan.index.contains_key(id.as_str()) {
            tarjan.visit(id);
        }
    }
    tarjan.cycles
}

/// Kahn topological order over startable plugins (dependencies first).
fn topological_order(found: &BTreeMap<String, PluginRegistration>) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for registration in found.values() {
        in_degree.entry(registration.manifest.id.as_str()).or_insert(0);
        for dependency in &registration.manifest.dependencies {
            if found.contains_key(&dependency.id) {
                *in_degree
                    .entry(registration.manifest.id.as_str())
                    .or_insert(0) += 1;
                dependents
                    .entry(dependency.id.as_str())
                    .or_default()
                    .push(registration.manifest.id.as_str());
            }
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    queue.sort();
    queue.reverse(); // pop smallest id first
    let mut order = Vec::new();
    while let Some(id) = queue.pop() {
        order.push(id.to_string());
        for dependent in dependents.get(id).cloned().unwrap_or_default() {
            let degree = in_degree.get_mut(dependent).expect("degree exists");
            *degree -= 1;
            if *degree == 0 {
                queue.push(dependent);
            }
        }
        queue.sort();
        queue.reverse(); // pop smallest id first
    }
    // Cycle members never reach degree zero; append them so shutdown and
    // listings still cover them.
    for id in found.keys() {
        if !order.contains(id) {
            order.push(id.clone());
        }
    }
    order
}

fn copy_dir(source: &Path, destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Write a minimal valid plugin skeleton; used by `plugins scaffold`.
pub fn scaffold(plugins_dir: &Path, id: &str) -> Result<PathBuf> {
    let dir = plugins_dir.join(id);
    if dir.exists() {
        return Err(JupiterError::Validation(format!(
            "plugin directory already exists: {}",
            dir.display()
        )));
    }
    std::fs::create_dir_all(&dir)?;
    let manifest = serde_json::json!({
        "id": id,
        "version": "0.1.0",
        "type": "tool",
        "compatibility": "*",
        "permissions": ["emit_events"],
        "subscriptions": ["SCAN_FINISHED"],
    });
    crate::cache::write_atomic(
        &dir.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)?.as_bytes(),
    )?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JupiterConfig;
    use crate::jobs::JobManagerConfig;
    use crate::license::LicenseAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write_plugin(plugins_dir: &Path, id: &str, body: serde_json::Value) {
        let dir = plugins_dir.join(id);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&body).expect("manifest json"),
        )
        .expect("write manifest");
    }

    fn manifest_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "version": "1.0.0",
            "type": "tool",
            "compatibility": "*",
        })
    }

    fn bridge_in(tmp: &TempDir, config: JupiterConfig) -> Arc<PluginBridge> {
        let bus = Arc::new(EventBus::default());
        let services = BridgeServices {
            jobs: JobManager::new(JobManagerConfig::default(), Arc::clone(&bus)),
            license: LicenseAdapter::new(config.license.clone()),
            project_root: tmp.path().to_path_buf(),
            config,
            bus,
        };
        PluginBridge::new(tmp.path().join("plugins"), services)
    }

    fn dev_config() -> JupiterConfig {
        JupiterConfig {
            developer_mode: true,
            allow_unsigned_local_plugins: true,
            ..JupiterConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_reaches_ready() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        write_plugin(&tmp.path().join("plugins"), "alpha", manifest_json("alpha"));

        bridge.startup();
        let registration = bridge.get("alpha").expect("registered");
        assert_eq!(registration.status, PluginStatus::Ready);
        assert!(!registration.legacy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependency_cycle_errors_both_without_contributions() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        let mut p = manifest_json("p");
        p["dependencies"] = serde_json::json!([{ "id": "q" }]);
        p["cli"] = serde_json::json!([{ "verb": "pv" }]);
        let mut q = manifest_json("q");
        q["dependencies"] = serde_json::json!([{ "id": "p" }]);
        write_plugin(&plugins, "p", p);
        write_plugin(&plugins, "q", q);

        bridge.startup();
        for id in ["p", "q"] {
            let registration = bridge.get(id).expect("registered");
            assert_eq!(registration.status, PluginStatus::Error, "{id}");
            assert_eq!(registration.error.as_deref(), Some("cycle"), "{id}");
            assert!(!registration.legacy);
        }
        assert_eq!(bridge.cli_owner("pv"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_failure_is_isolated_but_fails_hard_dependents() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        write_plugin(&plugins, "broken", manifest_json("broken"));
        write_plugin(&plugins, "independent", manifest_json("independent"));
        let mut dependent = manifest_json("dependent");
        dependent["dependencies"] = serde_json::json!([{ "id": "broken" }]);
        write_plugin(&plugins, "dependent", dependent);

        struct FailingPlugin;
        impl Plugin for FailingPlugin {
            fn init(&mut self, _services: &ServiceLocator) -> std::result::Result<(), String> {
                Err("nope".to_string())
            }
        }
        bridge.register_factory("broken", Arc::new(|| Box::new(FailingPlugin) as Box<dyn Plugin>));

        bridge.startup();
        assert_eq!(bridge.get("broken").expect("broken").status, PluginStatus::Error);
        assert_eq!(
            bridge.get("independent").expect("independent").status,
            PluginStatus::Ready
        );
        let dependent = bridge.get("dependent").expect("dependent");
        assert_eq!(dependent.status, PluginStatus::Error);
        assert!(dependent.error.as_deref().unwrap_or("").contains("broken"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_cli_verb_first_wins() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        let mut a = manifest_json("aaa");
        a["cli"] = serde_json::json!([{ "verb": "report" }]);
        let mut b = manifest_json("bbb");
        b["cli"] = serde_json::json!([{ "verb": "report" }]);
        write_plugin(&plugins, "aaa", a);
        write_plugin(&plugins, "bbb", b);

        bridge.startup();
        // Topological order is id-sorted for independent plugins.
        assert_eq!(bridge.cli_owner("report").as_deref(), Some("aaa"));
        // Both plugins are still ready; only the contribution is refused.
        assert_eq!(bridge.get("bbb").expect("bbb").status, PluginStatus::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn legacy_plugin_receives_scan_and_analyze_hooks() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());

        struct CountingHooks {
            scans: AtomicUsize,
            analyses: AtomicUsize,
        }
        impl LegacyHooks for CountingHooks {
            fn on_scan(&self, _report: &serde_json::Value) {
                self.scans.fetch_add(1, Ordering::Relaxed);
            }
            fn on_analyze(&self, _summary: &serde_json::Value) {
                self.analyses.fetch_add(1, Ordering::Relaxed);
            }
        }
        let hooks = Arc::new(CountingHooks {
            scans: AtomicUsize::new(0),
            analyses: AtomicUsize::new(0),
        });
        bridge.register_legacy("oldtimer", Arc::clone(&hooks) as Arc<dyn LegacyHooks>);
        bridge.startup();

        let registration = bridge.get("oldtimer").expect("legacy registered");
        assert!(registration.legacy);
        assert_eq!(registration.status, PluginStatus::Ready);
        assert_eq!(registration.manifest.plugin_type, PluginType::Tool);
        assert!(registration.manifest.permissions.is_empty());

        bridge
            .services
            .bus
            .emit(Topic::ScanFinished, serde_json::json!({ "report": { "files": [] } }));
        bridge
            .services
            .bus
            .emit(Topic::ScanFinished, serde_json::json!({ "summary": { "file_count": 0 } }));
        for _ in 0..100 {
            if hooks.scans.load(Ordering::Relaxed) == 1
                && hooks.analyses.load(Ordering::Relaxed) == 1
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(hooks.scans.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.analyses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reload_requires_developer_mode() {
        let tmp = TempDir::new().expect("tmp dir");
        let config = JupiterConfig {
            developer_mode: false,
            allow_unsigned_local_plugins: true,
            ..JupiterConfig::default()
        };
        let bridge = bridge_in(&tmp, config);
        write_plugin(&tmp.path().join("plugins"), "alpha", manifest_json("alpha"));
        bridge.startup();

        let err = bridge.reload("alpha").expect_err("not in dev mode");
        assert_eq!(err.code(), "policy_denied");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reload_picks_up_manifest_changes() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        write_plugin(&plugins, "alpha", manifest_json("alpha"));
        bridge.startup();
        assert!(bridge.get("alpha").expect("alpha").cli_verbs.is_empty());

        let mut updated = manifest_json("alpha");
        updated["cli"] = serde_json::json!([{ "verb": "fresh" }]);
        write_plugin(&plugins, "alpha", updated);
        bridge.reload("alpha").expect("reload");

        assert_eq!(bridge.get("alpha").expect("alpha").cli_verbs, vec!["fresh"]);
        assert_eq!(bridge.cli_owner("fresh").as_deref(), Some("alpha"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reload_refused_while_job_in_flight() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        write_plugin(&tmp.path().join("plugins"), "alpha", manifest_json("alpha"));
        bridge.startup();

        let job_id = bridge
            .services
            .jobs
            .submit(
                "alpha",
                serde_json::json!({}),
                std::time::Duration::from_secs(10),
                Box::new(|ctx| {
                    while !ctx.cancel_requested() {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                    }
                    Ok(serde_json::Value::Null)
                }),
            )
            .expect("submit");
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let err = bridge.reload("alpha").expect_err("job in flight");
        assert!(err.to_string().contains(&job_id));

        bridge.services.jobs.cancel(&job_id).expect("cancel");
        bridge
            .services
            .jobs
            .wait_terminal(&job_id, std::time::Duration::from_secs(2))
            .await;
        bridge.reload("alpha").expect("reload after job settled");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn toggle_disables_and_reenables() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        let mut a = manifest_json("alpha");
        a["cli"] = serde_json::json!([{ "verb": "hello" }]);
        write_plugin(&plugins, "alpha", a);
        bridge.startup();
        assert_eq!(bridge.cli_owner("hello").as_deref(), Some("alpha"));

        bridge.toggle("alpha", false).expect("disable");
        assert_eq!(bridge.get("alpha").expect("alpha").status, PluginStatus::Disabled);
        assert_eq!(bridge.cli_owner("hello"), None);

        bridge.toggle("alpha", true).expect("enable");
        assert_eq!(bridge.get("alpha").expect("alpha").status, PluginStatus::Ready);
        assert_eq!(bridge.cli_owner("hello").as_deref(), Some("alpha"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn locator_enforces_permissions() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        let mut manifest = manifest_json("scoped");
        manifest["permissions"] = serde_json::json!(["emit_events"]);
        write_plugin(&plugins, "scoped", manifest);
        bridge.startup();

        let registration = bridge.get("scoped").expect("scoped");
        let locator = bridge.locator_for(&registration);
        locator
            .emit_event(Topic::PluginNotification, serde_json::json!({}))
            .expect("emit allowed");
        let err = locator
            .read_project_file("whatever.txt")
            .expect_err("fs_read missing");
        assert_eq!(err.code(), "policy_denied");
        let err = locator.config_slice().expect_err("config_access missing");
        assert_eq!(err.code(), "policy_denied");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn locator_rejects_path_escape() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        let mut manifest = manifest_json("fsy");
        manifest["permissions"] = serde_json::json!(["fs_read"]);
        write_plugin(&plugins, "fsy", manifest);
        bridge.startup();

        let registration = bridge.get("fsy").expect("fsy");
        let locator = bridge.locator_for(&registration);
        let err = locator
            .read_project_file("../outside.txt")
            .expect_err("escape");
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scaffold_produces_a_loadable_plugin() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        scaffold(&tmp.path().join("plugins"), "fresh-plugin").expect("scaffold");
        bridge.startup();
        assert_eq!(
            bridge.get("fresh-plugin").expect("scaffolded").status,
            PluginStatus::Ready
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_dependency_errors_dependent() {
        let tmp = TempDir::new().expect("tmp dir");
        let bridge = bridge_in(&tmp, dev_config());
        let plugins = tmp.path().join("plugins");
        let mut a = manifest_json("needy");
        a["dependencies"] = serde_json::json!([{ "id": "ghost" }]);
        write_plugin(&plugins, "needy", a);
        let mut b = manifest_json("easy");
        b["dependencies"] = serde_json::json!([{ "id": "ghost", "optional": true }]);
        write_plugin(&plugins, "easy", b);

        bridge.startup();
        let needy = bridge.get("needy").expect("needy");
        assert_eq!(needy.status, PluginStatus::Error);
        assert!(needy.error.as_deref().unwrap_or("").contains("ghost"));
        assert_eq!(bridge.get("easy").expect("easy").status, PluginStatus::Ready);
    }
}
