//! Persistent descriptors (§3) and the one-shot loader for the two JSON documents (§6, C10).
//!
//! Writes are not this module's job — edits flow through the external config-store
//! collaborator (§6); the gateway only ever reads these documents at start and on
//! an explicit `reload()`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Local,
    Event,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub transport: TransportKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, alias = "arguments")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per §4.1 / §9: retry `url + "/mcp/sse"` as a legacy fallback candidate.
    /// Off by default — the canonical revision gets a single attempt.
    #[serde(default, alias = "legacyDualEndpoint")]
    pub legacy_dual_endpoint: bool,

    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(alias = "backendName")]
    pub backend_name: String,
    pub endpoint: String,
    pub transport: TransportKind,
    #[serde(default, alias = "exposedTools")]
    pub exposed_tools: Vec<String>,
    #[serde(default, alias = "instructionsOverride", skip_serializing_if = "Option::is_none")]
    pub instructions_override: Option<String>,
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,
}

impl ProxyConfig {
    pub fn exposes(&self, tool_name: &str) -> bool {
        self.exposed_tools.is_empty() || self.exposed_tools.iter().any(|t| t == tool_name)
    }
}

#[derive(Debug, Default)]
pub struct GatewayConfigDoc {
    pub backends: HashMap<String, BackendConfig>,
    pub proxies: HashMap<String, ProxyConfig>,
}

pub struct ConfigLoader {
    backends_path: PathBuf,
    proxies_path: PathBuf,
}

impl ConfigLoader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            backends_path: dir.join("backends.json"),
            proxies_path: dir.join("proxies.json"),
        }
    }

    /// One-shot read at start, or on an explicit reload request.
    pub fn load(&self) -> Result<GatewayConfigDoc> {
        let backends = read_map::<BackendConfig>(&self.backends_path)?;
        let proxies = read_map::<ProxyConfig>(&self.proxies_path)?;

        for (name, cfg) in &backends {
            if name != &cfg.name {
                return Err(GatewayError::Config(format!(
                    "backend key '{name}' does not match config name '{}'",
                    cfg.name
                )));
            }
        }
        for (name, cfg) in &proxies {
            if name != &cfg.name {
                return Err(GatewayError::Config(format!(
                    "proxy key '{name}' does not match config name '{}'",
                    cfg.name
                )));
            }
            if !backends.contains_key(&cfg.backend_name) {
                return Err(GatewayError::Config(format!(
                    "proxy '{name}' references unknown backend '{}'",
                    cfg.backend_name
                )));
            }
        }

        info!(
            backends = backends.len(),
            proxies = proxies.len(),
            "loaded gateway configuration"
        );

        Ok(GatewayConfigDoc { backends, proxies })
    }
}

fn read_map<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<HashMap<String, T>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)?;
    let value: HashMap<String, T> = serde_json::from_slice(&bytes)?;
    Ok(value)
}

/// Topologically sort backend names by `dependsOn`. Returns an error naming a
/// participant of the cycle if one exists (§4.9 step 2 / §7 ConfigError).
pub fn topo_sort_backends(backends: &HashMap<String, BackendConfig>) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = backends
        .keys()
        .map(|k| (k.as_str(), Mark::Unvisited))
        .collect();
    let mut order = Vec::with_capacity(backends.len());

    fn visit<'a>(
        name: &'a str,
        backends: &'a HashMap<String, BackendConfig>,
        marks: &mut HashMap<&'a str, Mark>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name).copied() {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                return Err(GatewayError::DependencyCycle(name.to_string()));
            }
            _ => {}
        }
        marks.insert(name, Mark::InProgress);
        if let Some(cfg) = backends.get(name) {
            for dep in &cfg.depends_on {
                if !backends.contains_key(dep) {
                    return Err(GatewayError::Config(format!(
                        "backend '{name}' depends on unknown backend '{dep}'"
                    )));
                }
                visit(dep, backends, marks, order)?;
            }
        }
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    let mut names: Vec<&str> = backends.keys().map(|s| s.as_str()).collect();
    names.sort_unstable();
    for name in names {
        visit(name, backends, &mut marks, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, deps: &[&str]) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            transport: TransportKind::Local,
            command: Some("true".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            legacy_dual_endpoint: false,
            auto_start: true,
            instructions: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn topo_sort_orders_dependencies_first() {
        let mut backends = HashMap::new();
        backends.insert("a".to_string(), backend("a", &[]));
        backends.insert("b".to_string(), backend("b", &["a"]));
        backends.insert("c".to_string(), backend("c", &["b"]));

        let order = topo_sort_backends(&backends).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn topo_sort_detects_cycles() {
        let mut backends = HashMap::new();
        backends.insert("a".to_string(), backend("a", &["b"]));
        backends.insert("b".to_string(), backend("b", &["a"]));

        let err = topo_sort_backends(&backends).unwrap_err();
        assert!(matches!(err, GatewayError::DependencyCycle(_)));
    }

    #[test]
    fn legacy_casing_aliases_normalize_on_load() {
        let json = r#"{"command":{"name":"command","transport":"LOCAL","command":"node","autoStart":true,"dependsOn":["other"]}}"#;
        let map: HashMap<String, BackendConfig> = serde_json::from_str(json).unwrap();
        let cfg = &map["command"];
        assert!(cfg.auto_start);
        assert!(cfg.depends_on.contains("other"));
    }
}
