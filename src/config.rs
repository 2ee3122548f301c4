//! Configuration collaborator (spec §6.3, §1 "out of scope" list, expanded in
//! SPEC_FULL.md §6.5). Discovery of which agent is active, which project root
//! applies, and environment wiring stay outside this crate; `Config` is just
//! the data those collaborators hand the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a project's storage root lives. See spec §3 "Project Root" and
/// §9 "Two storage modes".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// `<project>/.agent/rewind/`
    Project,
    /// `<home>/.rewind/storage/<basename>_<sha256(abs_path)[:12]>/`
    Global,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Project
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 50,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreConfig {
    /// Whether `.gitignore` (and friends) found while walking are honored.
    pub honor_gitignore: bool,
    /// Built-in patterns always applied (e.g. the storage root itself).
    #[serde(default)]
    pub patterns: Vec<String>,
    /// User-supplied additional ignore globs.
    #[serde(default)]
    pub additional: Vec<String>,
    /// Globs that override an ignore decision and force inclusion.
    #[serde(default)]
    pub force_include: Vec<String>,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            honor_gitignore: true,
            patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "target".to_string(),
            ],
            additional: Vec::new(),
            force_include: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierRuntime {
    pub anti_spam_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_change_size: Option<u64>,
}

impl Default for TierRuntime {
    fn default() -> Self {
        Self {
            anti_spam_seconds: 30,
            min_change_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSchema {
    /// JSON keys tried in order to find an event's identifier.
    pub event_id_field: Vec<String>,
    /// Reserved; not consumed by the core. See spec §4.2.
    #[serde(default)]
    pub parent_id_field: Option<String>,
    /// Whether the first session-start line's `title` field may be
    /// rewritten with a short prefix on fork. Disabled by default.
    #[serde(default)]
    pub title_prefix_policy: bool,
}

impl Default for AgentSchema {
    fn default() -> Self {
        Self {
            event_id_field: vec!["uuid".to_string(), "id".to_string()],
            parent_id_field: None,
            title_prefix_policy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub ignore: IgnoreConfig,
    #[serde(default)]
    pub tier_runtime: TierRuntime,
    #[serde(default)]
    pub agent_schemas: HashMap<String, AgentSchema>,
}

impl Default for Config {
    fn default() -> Self {
        let mut agent_schemas = HashMap::new();
        agent_schemas.insert(
            "claude-code".to_string(),
            AgentSchema {
                event_id_field: vec!["uuid".to_string()],
                parent_id_field: Some("parentUuid".to_string()),
                title_prefix_policy: false,
            },
        );
        agent_schemas.insert(
            "factory-droid".to_string(),
            AgentSchema {
                event_id_field: vec!["id".to_string()],
                parent_id_field: Some("parent_id".to_string()),
                title_prefix_policy: true,
            },
        );
        Self {
            storage_mode: StorageMode::default(),
            retention: RetentionPolicy::default(),
            ignore: IgnoreConfig::default(),
            tier_runtime: TierRuntime::default(),
            agent_schemas,
        }
    }
}

impl Config {
    /// Load from `<storage_root>/config.json`, falling back to defaults if
    /// absent. A present-but-corrupt file is an error, same as any other
    /// manifest read in this crate.
    pub fn load(storage_root: &Path) -> anyhow::Result<Self> {
        let path = storage_root.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {:?}: {}", path, e))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {:?}: {}", path, e))?;
        Ok(config)
    }

    pub fn save(&self, storage_root: &Path) -> anyhow::Result<()> {
        let path = storage_root.join("config.json");
        crate::atomic::write_json(&path, self)
    }

    pub fn schema_for(&self, agent_kind: &str) -> AgentSchema {
        self.agent_schemas
            .get(agent_kind)
            .cloned()
            .unwrap_or_default()
    }
}
