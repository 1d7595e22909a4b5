//! Typed plugin/event dispatch.
//!
//! Plugins observe or preempt protocol events without blocking the
//! session hot path: every hook is async and a session only waits on the
//! (usually empty) set of plugins that declared interest in that
//! particular event, via [`FsdPlugin::interests`]. The historic
//! implementation instead raised a `PreventEvent` exception carrying a
//! result dict to preempt; here preemption is a plain return value
//! (`HookOutcome::Preempt`) rather than thrown control flow, so the
//! common non-preempting path allocates nothing and never touches a
//! panic/unwind path.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{error, warn};

/// Protocol API level plugins must declare to be loaded. Bumped whenever
/// a breaking change is made to the hook signatures below.
pub const API_LEVEL: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    BeforeStart,
    BeforeStop,
    NewConnectionEstablished,
    NewClientCreated,
    LineReceivedFromClient,
    AuditLineFromClient,
    ClientDisconnected,
}

/// Carried by a plugin that preempts `line_received_from_client`: its own
/// verdict on the line, standing in for whatever the engine's own packet
/// handler would otherwise have produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreemptResult {
    pub success: bool,
    pub packet_ok: bool,
}

/// Outcome of one plugin's `line_received_from_client` hook.
pub enum HookOutcome {
    /// Let the next plugin (then the engine's own handler) run.
    Continue,
    /// Stop here; the line is considered handled by this plugin.
    Preempt(PreemptResult),
}

/// Fed to `audit_line_from_client` once per inbound line, recording
/// whichever of plugin-handled or engine-handled actually happened.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditResult {
    pub handled_by_plugin: bool,
    pub success: bool,
    pub packet_ok: bool,
    pub has_result: bool,
}

impl AuditResult {
    pub fn from_preempt(result: PreemptResult) -> Self {
        Self {
            handled_by_plugin: true,
            success: result.success,
            packet_ok: result.packet_ok,
            has_result: true,
        }
    }

    pub fn from_engine(success: bool, packet_ok: bool) -> Self {
        Self {
            handled_by_plugin: false,
            success,
            packet_ok,
            has_result: true,
        }
    }
}

/// A plugin extending the session engine. Every hook has a no-op default
/// body; a plugin overrides only what it cares about and reports that
/// subset via [`Self::interests`] so the manager never calls hooks that
/// would just return immediately.
#[async_trait]
pub trait FsdPlugin: Send + Sync {
    fn plugin_name(&self) -> &'static str;

    fn api(&self) -> i64 {
        API_LEVEL
    }

    fn version(&self) -> &'static str {
        "0.0.0"
    }

    /// Events this plugin actually overrides. An empty slice means the
    /// plugin is loaded (and its api/version still checked) but never
    /// invoked.
    fn interests(&self) -> &'static [Event] {
        &[]
    }

    /// Optional config keys this plugin expects under `plugin.<name>.*`;
    /// `None` means no verification is performed against supplied config.
    fn expected_config(&self) -> Option<&'static [&'static str]> {
        None
    }

    async fn before_start(&self) -> Result<()> {
        Ok(())
    }

    async fn before_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn new_connection_established(&self, _peer: &str) -> Result<()> {
        Ok(())
    }

    async fn new_client_created(&self, _callsign: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn line_received_from_client(&self, _callsign: &[u8], _line: &[u8]) -> Result<HookOutcome> {
        Ok(HookOutcome::Continue)
    }

    async fn audit_line_from_client(&self, _callsign: &[u8], _line: &[u8], _result: &AuditResult) -> Result<()> {
        Ok(())
    }

    async fn client_disconnected(&self, _callsign: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Holds every registered plugin in registration order and routes events
/// to them, logging and swallowing hook errors so one misbehaving plugin
/// never takes the rest of the event chain down with it.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn FsdPlugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Register a plugin, rejecting one declaring an incompatible api level.
    pub fn register(&mut self, plugin: Arc<dyn FsdPlugin>) -> Result<()> {
        if plugin.api() != API_LEVEL {
            bail!(
                "plugin {} declares api level {}, server expects {}",
                plugin.plugin_name(),
                plugin.api(),
                API_LEVEL
            );
        }
        self.plugins.push(plugin);
        Ok(())
    }

    fn interested(&self, event: Event) -> impl Iterator<Item = &Arc<dyn FsdPlugin>> {
        self.plugins.iter().filter(move |p| p.interests().contains(&event))
    }

    pub async fn fire_before_start(&self) {
        for plugin in self.interested(Event::BeforeStart) {
            if let Err(err) = plugin.before_start().await {
                error!("plugin {} before_start failed: {:#}", plugin.plugin_name(), err);
            }
        }
    }

    pub async fn fire_before_stop(&self) {
        for plugin in self.interested(Event::BeforeStop) {
            if let Err(err) = plugin.before_stop().await {
                error!("plugin {} before_stop failed: {:#}", plugin.plugin_name(), err);
            }
        }
    }

    pub async fn fire_new_connection_established(&self, peer: &str) {
        for plugin in self.interested(Event::NewConnectionEstablished) {
            if let Err(err) = plugin.new_connection_established(peer).await {
                error!(
                    "plugin {} new_connection_established failed: {:#}",
                    plugin.plugin_name(),
                    err
                );
            }
        }
    }

    pub async fn fire_new_client_created(&self, callsign: &[u8]) {
        for plugin in self.interested(Event::NewClientCreated) {
            if let Err(err) = plugin.new_client_created(callsign).await {
                error!("plugin {} new_client_created failed: {:#}", plugin.plugin_name(), err);
            }
        }
    }

    pub async fn fire_client_disconnected(&self, callsign: &[u8]) {
        for plugin in self.interested(Event::ClientDisconnected) {
            if let Err(err) = plugin.client_disconnected(callsign).await {
                error!("plugin {} client_disconnected failed: {:#}", plugin.plugin_name(), err);
            }
        }
    }

    /// Fire the preemptable pre-event. Plugins run in registration order;
    /// the first to preempt stops the chain and its verdict is returned.
    /// A plugin that errors is logged and skipped, same as any other
    /// event - only an explicit `Preempt` return short-circuits.
    pub async fn fire_line_received(&self, callsign: &[u8], line: &[u8]) -> Option<PreemptResult> {
        for plugin in self.interested(Event::LineReceivedFromClient) {
            match plugin.line_received_from_client(callsign, line).await {
                Ok(HookOutcome::Continue) => continue,
                Ok(HookOutcome::Preempt(result)) => return Some(result),
                Err(err) => {
                    error!(
                        "plugin {} line_received_from_client failed: {:#}",
                        plugin.plugin_name(),
                        err
                    );
                }
            }
        }
        None
    }

    /// Always fires exactly once per inbound line, after preemption (if
    /// any) or the engine's own handler has run.
    pub async fn fire_audit(&self, callsign: &[u8], line: &[u8], result: &AuditResult) {
        for plugin in self.interested(Event::AuditLineFromClient) {
            if let Err(err) = plugin.audit_line_from_client(callsign, line, result).await {
                error!("plugin {} audit_line_from_client failed: {:#}", plugin.plugin_name(), err);
            }
        }
    }

    /// Warn (rather than fail) about a plugin's `expected_config` keys
    /// missing from the supplied per-plugin config subtree - matching the
    /// historic manager's "best-effort verification, not a hard gate".
    pub fn verify_config(&self, plugin: &dyn FsdPlugin, supplied_keys: &[&str]) {
        if let Some(expected) = plugin.expected_config() {
            for key in expected {
                if !supplied_keys.contains(key) {
                    warn!(
                        "plugin {} expects config key '{}' which was not supplied",
                        plugin.plugin_name(),
                        key
                    );
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin {
        calls: AtomicUsize,
        preempt_on: Option<PreemptResult>,
    }

    #[async_trait]
    impl FsdPlugin for CountingPlugin {
        fn plugin_name(&self) -> &'static str {
            "counting"
        }

        fn interests(&self) -> &'static [Event] {
            &[Event::LineReceivedFromClient, Event::AuditLineFromClient]
        }

        async fn line_received_from_client(&self, _callsign: &[u8], _line: &[u8]) -> Result<HookOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.preempt_on {
                Some(result) => Ok(HookOutcome::Preempt(result)),
                None => Ok(HookOutcome::Continue),
            }
        }

        async fn audit_line_from_client(&self, _callsign: &[u8], _line: &[u8], _result: &AuditResult) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingApiPlugin;

    #[async_trait]
    impl FsdPlugin for FailingApiPlugin {
        fn plugin_name(&self) -> &'static str {
            "bad-api"
        }

        fn api(&self) -> i64 {
            API_LEVEL + 1
        }
    }

    #[test]
    fn registration_rejects_mismatched_api_level() {
        let mut manager = PluginManager::new();
        let result = manager.register(Arc::new(FailingApiPlugin));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn only_interested_plugins_are_invoked() {
        let mut manager = PluginManager::new();
        manager
            .register(Arc::new(CountingPlugin {
                calls: AtomicUsize::new(0),
                preempt_on: None,
            }))
            .unwrap();
        // before_start isn't in this plugin's interests, so it must be a no-op.
        manager.fire_before_start().await;
        let preempted = manager.fire_line_received(b"N1AB", b"line").await;
        assert!(preempted.is_none());
    }

    #[tokio::test]
    async fn preempting_plugin_stops_the_chain() {
        let mut manager = PluginManager::new();
        let first_calls = Arc::new(AtomicUsize::new(0));
        manager
            .register(Arc::new(CountingPlugin {
                calls: AtomicUsize::new(0),
                preempt_on: Some(PreemptResult {
                    success: true,
                    packet_ok: true,
                }),
            }))
            .unwrap();
        let second = Arc::new(CountingPlugin {
            calls: AtomicUsize::new(0),
            preempt_on: None,
        });
        manager.register(second.clone()).unwrap();

        let result = manager.fire_line_received(b"N1AB", b"line").await;
        assert!(result.is_some());
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        let _ = first_calls;
    }

    #[tokio::test]
    async fn audit_fires_regardless_of_preemption() {
        let manager_plugin = Arc::new(CountingPlugin {
            calls: AtomicUsize::new(0),
            preempt_on: None,
        });
        let mut manager = PluginManager::new();
        manager.register(manager_plugin.clone()).unwrap();

        let audit = AuditResult::from_engine(true, true);
        manager.fire_audit(b"N1AB", b"line", &audit).await;
        assert_eq!(manager_plugin.calls.load(Ordering::SeqCst), 1);
    }
}
