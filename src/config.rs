//! Layered Configuration
//!
//! Dotted-key configuration assembled with the `config` crate from
//! registered per-driver defaults, YAML documents, the environment and
//! explicit overrides. Keys are matched case-insensitively
//! (`efs.accessKey` == `efs.accesskey`).
//!
//! Lookup order for a key:
//! 1. values set explicitly via [`Config::set`]
//! 2. environment (`efs.accessKey` -> `EFS_ACCESSKEY`)
//! 3. the loaded YAML documents, later documents first
//! 4. registered defaults
//!
//! A scoped view (see [`Config::scoped`]) tries `<scope>.<key>` before
//! falling back to the unscoped key.

use crate::error::{Error, Result};
use ::config::{Config as Layered, Environment, File, FileFormat, Value, ValueKind};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Registrations
// =============================================================================

/// A single registered key with its default value
#[derive(Debug, Clone)]
pub struct ConfigKey {
    pub key: String,
    pub default: Value,
    pub description: String,
}

/// Set of default keys contributed by one component
#[derive(Debug, Clone)]
pub struct ConfigRegistration {
    pub name: String,
    pub keys: Vec<ConfigKey>,
}

impl ConfigRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
        }
    }

    /// Register a key with a default value
    pub fn key(
        mut self,
        key: impl Into<String>,
        default: impl Into<Value>,
        description: impl Into<String>,
    ) -> Self {
        self.keys.push(ConfigKey {
            key: key.into(),
            default: default.into(),
            description: description.into(),
        });
        self
    }
}

// =============================================================================
// Layers
// =============================================================================

/// Inputs of the layered configuration and the merged result built from them
#[derive(Debug)]
struct Layers {
    defaults: BTreeMap<String, Value>,
    documents: Vec<String>,
    overrides: BTreeMap<String, Value>,
    read_env: bool,
    merged: Layered,
}

impl Layers {
    fn new(read_env: bool) -> Self {
        let mut layers = Self {
            defaults: BTreeMap::new(),
            documents: Vec::new(),
            overrides: BTreeMap::new(),
            read_env,
            merged: Layered::default(),
        };
        layers.refresh();
        layers
    }

    fn build(&self) -> Result<Layered> {
        let mut builder = Layered::builder();
        for (key, value) in &self.defaults {
            builder = builder.set_default(key.as_str(), value.clone())?;
        }
        for document in &self.documents {
            builder = builder.add_source(File::from_str(document, FileFormat::Yaml));
        }
        if self.read_env {
            builder = builder.add_source(Environment::default().separator("_"));
        }
        for (key, value) in &self.overrides {
            builder = builder.set_override(key.as_str(), value.clone())?;
        }
        Ok(builder.build()?)
    }

    /// Rebuild the merged view; on failure the previous view stays in place
    fn refresh(&mut self) {
        match self.build() {
            Ok(merged) => self.merged = merged,
            Err(e) => warn!(error = %e, "Configuration layers rejected, keeping previous values"),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Shared, cheaply cloneable configuration handle
#[derive(Debug, Clone)]
pub struct Config {
    layers: Arc<RwLock<Layers>>,
    scope: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Create an empty configuration that honours environment overrides
    pub fn new() -> Self {
        Self::with_env(true)
    }

    /// Create an empty configuration that ignores the environment
    pub fn isolated() -> Self {
        Self::with_env(false)
    }

    fn with_env(read_env: bool) -> Self {
        Self {
            layers: Arc::new(RwLock::new(Layers::new(read_env))),
            scope: None,
        }
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config = Self::new();
        config.load_yaml_str(yaml)?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Add a YAML document above those already loaded
    ///
    /// The document must be a mapping; a rejected document leaves the
    /// configuration unchanged.
    pub fn load_yaml_str(&self, yaml: &str) -> Result<()> {
        let mut layers = self.layers.write();
        layers.documents.push(yaml.to_string());
        match layers.build() {
            Ok(merged) => {
                layers.merged = merged;
                Ok(())
            }
            Err(e) => {
                layers.documents.pop();
                Err(e)
            }
        }
    }

    /// Merge registered defaults
    pub fn register(&self, registration: &ConfigRegistration) {
        let mut layers = self.layers.write();
        for key in &registration.keys {
            layers
                .defaults
                .insert(normalize(&key.key), key.default.clone());
        }
        layers.refresh();
    }

    /// Set a value explicitly (highest precedence, unscoped)
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let mut layers = self.layers.write();
        layers.overrides.insert(normalize(key), value.into());
        layers.refresh();
    }

    /// A view whose lookups prefer `<prefix>.<key>`
    pub fn scoped(&self, prefix: &str) -> Self {
        let scope = match &self.scope {
            Some(existing) => format!("{}.{}", existing, normalize(prefix)),
            None => normalize(prefix),
        };
        Self {
            layers: self.layers.clone(),
            scope: Some(scope),
        }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Names of the direct children of `prefix`, sorted
    pub fn child_names(&self, prefix: &str) -> Vec<String> {
        let layers = self.layers.read();
        let mut names: Vec<String> = match layers.merged.get_table(&normalize(prefix)) {
            Ok(table) => table.into_iter().map(|(name, _)| name).collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Check whether a key resolves to anything
    pub fn is_set(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// String value; empty when unset
    pub fn get_string(&self, key: &str) -> String {
        match self.lookup(key) {
            Some(value) if is_scalar(&value) => value.into_string().unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Integer value; strings with a leading `0` or `0o` are read as octal
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let value = self.lookup(key)?;
        if let ValueKind::String(s) = &value.kind {
            return parse_int(s);
        }
        if is_scalar(&value) {
            value.into_int().ok()
        } else {
            None
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.lookup(key) {
            Some(value) if is_scalar(&value) => value.into_bool().unwrap_or(false),
            _ => false,
        }
    }

    /// List value from a YAML sequence or a comma-separated string
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        let Some(value) = self.lookup(key) else {
            return Vec::new();
        };
        match value.kind {
            ValueKind::Array(items) => items
                .into_iter()
                .filter(is_scalar)
                .filter_map(|v| v.into_string().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            ValueKind::String(s) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let key = normalize(key);
        let layers = self.layers.read();
        if let Some(scope) = &self.scope {
            if let Some(v) = resolve(&layers.merged, &format!("{}.{}", scope, key)) {
                return Some(v);
            }
        }
        resolve(&layers.merged, &key)
    }
}

/// Log-safe rendering of a secret value
pub fn mask_secret(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "******"
    }
}

fn resolve(merged: &Layered, key: &str) -> Option<Value> {
    match merged.get::<Value>(key) {
        Ok(value) if !matches!(value.kind, ValueKind::Nil) => Some(value),
        _ => None,
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(
        value.kind,
        ValueKind::Nil | ValueKind::Table(_) | ValueKind::Array(_)
    )
}

fn normalize(key: &str) -> String {
    key.trim().to_lowercase()
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(oct) = s.strip_prefix("0o") {
        return i64::from_str_radix(oct, 8).ok();
    }
    if s.len() > 1 && s.starts_with('0') && s.chars().all(|c| c.is_ascii_digit()) {
        return i64::from_str_radix(&s[1..], 8).ok();
    }
    s.parse().ok()
}
