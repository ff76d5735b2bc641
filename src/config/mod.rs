//! # Configuration
//!
//! One bridge process serves any number of mesh deployments. Configuration
//! comes from a JSON file (`config.json`, the default) or a TOML file (picked
//! by the `.toml` extension); keys are camelCase in both.
//!
//! ```json
//! {
//!   "environment": "production",
//!   "storePath": "./data/store",
//!   "meshViewBaseUrl": "https://meshview.example.org",
//!   "nodeInfoUpdates": true,
//!   "logging": { "level": "info" },
//!   "meshes": [{
//!     "id": "bay",
//!     "mqtt": { "brokerUrl": "mqtt://broker:1883", "topics": ["msh/US/bayarea/#"] },
//!     "discord": { "token": "${BAY_TOKEN}", "clientId": "1", "guildId": "2" },
//!     "routing": { "channelRegex": [{ "pattern": "LongFast", "discordChannelId": "3" }] }
//!   }]
//! }
//! ```
//!
//! Loading order:
//!
//! 1. read the file named by `CONFIG_PATH` (or the CLI), falling back to the
//!    legacy single-deployment environment variables when it does not exist
//! 2. expand `${NAME}` placeholders in every string value
//! 3. deserialize into [`BridgeConfig`] and check it; errors name the
//!    offending field
//! 4. overlay discord tokens from `SECRETS_PATH` / `./secrets.json`
//! 5. require a discord token for every deployment
//!
//! Environment access goes through an injected lookup so the whole pipeline
//! is testable without touching the process environment.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::meshtastic::crypto::{ChannelKey, KeyError, Keyring};
use crate::meshtastic::topic::TopicPattern;
use crate::routing::{ChannelRouter, RouteError};

pub const DEFAULT_CONFIG_PATH: &str = "./config.json";
pub const DEFAULT_SECRETS_PATH: &str = "./secrets.json";
pub const DEFAULT_STORE_PATH: &str = "./data/store";

/// Environment lookup. `std::env::var(..).ok()` in production.
pub type EnvLookup<'a> = &'a (dyn Fn(&str) -> Option<String> + Sync);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid or missing {0}")]
    Missing(String),

    #[error("Invalid {0}")]
    Invalid(String),

    #[error("Invalid {document}: {reason}")]
    Schema { document: &'static str, reason: String },

    #[error("Invalid {field}: {reason}")]
    Topic { field: String, reason: String },

    #[error("Invalid {field}: {source}")]
    Key {
        field: String,
        #[source]
        source: KeyError,
    },

    #[error("meshes[{mesh}]: {source}")]
    Route {
        mesh: usize,
        #[source]
        source: RouteError,
    },

    #[error("Malformed MQTT_TOPICS environment variable: {0}")]
    MalformedTopics(String),

    #[error("No Discord channel mappings found in environment")]
    NoChannelMappings,
}

/// Routing rule as written in the document. Empty strings stand for missing
/// fields until [`validate`] has run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelRegexRule {
    pub pattern: String,
    pub discord_channel_id: String,
    pub flags: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    pub channel_regex: Vec<ChannelRegexRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MqttConfig {
    pub broker_url: String,
    pub topics: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscordConfig {
    pub token: Option<String>,
    pub client_id: String,
    pub guild_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    pub id: String,
    pub name: Option<String>,
    pub mesh_view_base_url: Option<String>,
    pub node_info_updates: Option<bool>,
    pub mqtt: MqttConfig,
    pub discord: DiscordConfig,
    pub routing: RoutingConfig,
    /// Other deployments whose relays are merged with this one's.
    pub cross_mesh_peers: Vec<String>,
}

impl MeshConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn cross_mesh_enabled(&self) -> bool {
        !self.cross_mesh_peers.is_empty()
    }

    pub fn topic_patterns(&self) -> Vec<TopicPattern> {
        self.mqtt
            .topics
            .iter()
            .filter_map(|t| TopicPattern::compile(t).ok())
            .collect()
    }

    pub fn router(&self) -> Result<ChannelRouter, RouteError> {
        ChannelRouter::compile(&self.routing.channel_regex)
    }

    fn check(&mut self, index: usize) -> Result<(), ConfigError> {
        let field = |name: &str| format!("meshes[{}].{}", index, name);

        require(&self.id, field("id"))?;
        require(&self.mqtt.broker_url, field("mqtt.brokerUrl"))?;
        if self.mqtt.topics.is_empty() {
            return Err(ConfigError::Missing(field("mqtt.topics")));
        }
        for (i, topic) in self.mqtt.topics.iter().enumerate() {
            let topic_field = format!("{}[{}]", field("mqtt.topics"), i);
            if topic.trim().is_empty() {
                return Err(ConfigError::Invalid(topic_field));
            }
            TopicPattern::compile(topic).map_err(|e| ConfigError::Topic {
                field: topic_field,
                reason: e.to_string(),
            })?;
        }

        require(&self.discord.client_id, field("discord.clientId"))?;
        require(&self.discord.guild_id, field("discord.guildId"))?;

        if self.routing.channel_regex.is_empty() {
            return Err(ConfigError::Missing(field("routing.channelRegex")));
        }
        for (i, rule) in self.routing.channel_regex.iter().enumerate() {
            let rule_field = format!("{}[{}]", field("routing.channelRegex"), i);
            require(&rule.pattern, format!("{}.pattern", rule_field))?;
            require(&rule.discord_channel_id, format!("{}.discordChannelId", rule_field))?;
        }

        if let Some(i) = self.cross_mesh_peers.iter().position(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("{}[{}]", field("crossMeshPeers"), i)));
        }
        self.mesh_view_base_url = non_empty(self.mesh_view_base_url.take());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub environment: Option<String>,
    pub store_path: PathBuf,
    pub mesh_view_base_url: Option<String>,
    pub node_info_updates: bool,
    /// Base64 channel keys; empty means the well-known defaults.
    pub decryption_keys: Vec<String>,
    pub logging: LoggingConfig,
    pub meshes: Vec<MeshConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            environment: None,
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            mesh_view_base_url: None,
            node_info_updates: false,
            decryption_keys: Vec::new(),
            logging: LoggingConfig::default(),
            meshes: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn is_production(&self) -> bool {
        self.environment.as_deref() == Some("production")
    }

    pub fn mesh(&self, id: &str) -> Option<&MeshConfig> {
        self.meshes.iter().find(|m| m.id == id)
    }

    /// Per-deployment link base, falling back to the global one.
    pub fn mesh_view_base_url(&self, mesh: &MeshConfig) -> String {
        mesh.mesh_view_base_url
            .clone()
            .or_else(|| self.mesh_view_base_url.clone())
            .unwrap_or_default()
    }

    pub fn node_info_updates(&self, mesh: &MeshConfig) -> bool {
        mesh.node_info_updates.unwrap_or(self.node_info_updates)
    }

    pub fn keyring(&self) -> Result<Keyring, ConfigError> {
        if self.decryption_keys.is_empty() {
            return Ok(Keyring::default());
        }
        Keyring::from_base64(&self.decryption_keys).map_err(|(i, source)| ConfigError::Key {
            field: format!("decryptionKeys[{}]", i),
            source,
        })
    }

    /// Field checks serde cannot express. Blank optional strings read as
    /// absent and blank defaults fall back to [`BridgeConfig::default`].
    fn check(&mut self) -> Result<(), ConfigError> {
        if self.meshes.is_empty() {
            return Err(ConfigError::Missing("meshes".to_string()));
        }
        for (i, mesh) in self.meshes.iter_mut().enumerate() {
            mesh.check(i)?;
        }
        for (i, key) in self.decryption_keys.iter().enumerate() {
            ChannelKey::from_base64(key).map_err(|source| ConfigError::Key {
                field: format!("decryptionKeys[{}]", i),
                source,
            })?;
        }

        let defaults = Self::default();
        if self.store_path.as_os_str().is_empty() {
            self.store_path = defaults.store_path;
        }
        if self.logging.level.trim().is_empty() {
            self.logging.level = defaults.logging.level;
        }
        self.logging.file = non_empty(self.logging.file.take());
        self.environment = non_empty(self.environment.take());
        self.mesh_view_base_url = non_empty(self.mesh_view_base_url.take());
        Ok(())
    }

    /// Compile every deployment's routing rules.
    pub fn routers(&self) -> Result<Vec<ChannelRouter>, ConfigError> {
        self.meshes
            .iter()
            .enumerate()
            .map(|(mesh, m)| m.router().map_err(|source| ConfigError::Route { mesh, source }))
            .collect()
    }
}

/// Process environment lookup.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Load using the process environment.
pub async fn load(path: Option<&Path>) -> Result<BridgeConfig, ConfigError> {
    load_with(path, &process_env).await
}

pub async fn load_with(path: Option<&Path>, env: EnvLookup<'_>) -> Result<BridgeConfig, ConfigError> {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(|| env("CONFIG_PATH").filter(|p| !p.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = if exists(&config_path).await {
        let mut value = read_document(&config_path).await?;
        expand_placeholders(&mut value, env);
        validate(&value)?
    } else {
        legacy_config(env)?
    };
    if config.mesh_view_base_url.is_none() {
        config.mesh_view_base_url = env("MESHVIEW_BASE_URL").filter(|u| !u.is_empty());
    }

    let secrets_path = env("SECRETS_PATH")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRETS_PATH));
    if exists(&secrets_path).await {
        let mut value = read_document(&secrets_path).await?;
        expand_placeholders(&mut value, env);
        apply_secrets(&mut config, &validate_secrets(&value)?);
    }

    ensure_tokens(&config)?;
    Ok(config)
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn read_document(path: &Path) -> Result<Value, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_document(path, &raw)
}

/// Parse JSON, or TOML when the path ends in `.toml`.
pub fn parse_document(path: &Path, raw: &str) -> Result<Value, ConfigError> {
    let parse_err = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };
    if path.extension().is_some_and(|ext| ext == "toml") {
        let doc: toml::Value = toml::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
        serde_json::to_value(doc).map_err(|e| parse_err(e.to_string()))
    } else {
        serde_json::from_str(raw).map_err(|e| parse_err(e.to_string()))
    }
}

/// Replace `${NAME}` in every string, recursively. Unknown names become "".
pub fn expand_placeholders(value: &mut Value, env: EnvLookup<'_>) {
    let Ok(placeholder) = Regex::new(r"\$\{([A-Z0-9_]+)\}") else {
        return;
    };
    expand_with(&placeholder, value, env);
}

fn expand_with(placeholder: &Regex, value: &mut Value, env: EnvLookup<'_>) {
    match value {
        Value::String(s) => {
            if placeholder.is_match(s) {
                *s = placeholder
                    .replace_all(s, |caps: &regex::Captures<'_>| env(&caps[1]).unwrap_or_default())
                    .into_owned();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| expand_with(placeholder, v, env)),
        Value::Object(map) => map.values_mut().for_each(|v| expand_with(placeholder, v, env)),
        _ => {}
    }
}

fn require(value: &str, field: String) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(field));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Deserialize an expanded configuration document and check it.
pub fn validate(value: &Value) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::deserialize(value).map_err(|e| ConfigError::Schema {
        document: "config file",
        reason: e.to_string(),
    })?;
    config.check()?;
    Ok(config)
}

/// Per-deployment secrets, keyed by mesh id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecretEntry {
    pub id: String,
    pub discord_token: Option<String>,
}

#[derive(Deserialize)]
struct SecretsDocument {
    meshes: Option<Vec<SecretEntry>>,
}

pub fn validate_secrets(value: &Value) -> Result<Vec<SecretEntry>, ConfigError> {
    let document = SecretsDocument::deserialize(value).map_err(|e| ConfigError::Schema {
        document: "secrets file",
        reason: e.to_string(),
    })?;
    let entries = document
        .meshes
        .ok_or_else(|| ConfigError::Missing("secrets.meshes".to_string()))?;
    for (i, entry) in entries.iter().enumerate() {
        require(&entry.id, format!("secrets.meshes[{}].id", i))?;
    }
    Ok(entries)
}

pub fn apply_secrets(config: &mut BridgeConfig, secrets: &[SecretEntry]) {
    for mesh in &mut config.meshes {
        let token = secrets
            .iter()
            .rev()
            .find(|s| s.id == mesh.id)
            .and_then(|s| s.discord_token.clone());
        if token.is_some() {
            mesh.discord.token = token;
        }
    }
}

fn ensure_tokens(config: &BridgeConfig) -> Result<(), ConfigError> {
    for (i, mesh) in config.meshes.iter().enumerate() {
        if mesh.discord.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(ConfigError::Missing(format!("meshes[{}].discord.token", i)));
        }
    }
    Ok(())
}

/// Single-deployment configuration from the pre-multi-mesh environment
/// variables.
pub fn legacy_config(env: EnvLookup<'_>) -> Result<BridgeConfig, ConfigError> {
    let topics: Vec<String> = match env("MQTT_TOPICS").filter(|t| !t.is_empty()) {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::MalformedTopics(e.to_string()))?,
        None => Vec::new(),
    };
    let mesh_id = env("MESH_ID").filter(|m| !m.is_empty()).unwrap_or_else(|| "default".to_string());

    let channel_regex: Vec<ChannelRegexRule> = [
        ("LongFast", "DISCORD_CHANNEL_LF"),
        ("MediumFast", "DISCORD_CHANNEL_MF"),
        ("MediumSlow", "DISCORD_CHANNEL_MS"),
        ("^Test$", "DISCORD_CHANNEL_MF_TEST"),
        ("HAB", "DISCORD_CHANNEL_HAB"),
    ]
    .iter()
    .filter_map(|(pattern, var)| {
        env(var).filter(|c| !c.is_empty()).map(|channel| ChannelRegexRule {
            pattern: pattern.to_string(),
            discord_channel_id: channel,
            flags: None,
        })
    })
    .collect();
    if channel_regex.is_empty() {
        return Err(ConfigError::NoChannelMappings);
    }

    let mut config = BridgeConfig {
        environment: env("ENVIRONMENT"),
        mesh_view_base_url: env("MESHVIEW_BASE_URL"),
        node_info_updates: env("NODE_INFO_UPDATES").as_deref() == Some("1"),
        meshes: vec![MeshConfig {
            id: mesh_id.clone(),
            name: Some(mesh_id),
            mqtt: MqttConfig {
                broker_url: env("MQTT_BROKER_URL").unwrap_or_default(),
                topics,
                username: env("MQTT_USERNAME"),
                password: env("MQTT_PASSWORD"),
            },
            discord: DiscordConfig {
                token: env("DISCORD_TOKEN"),
                client_id: env("DISCORD_CLIENT_ID").unwrap_or_default(),
                guild_id: env("DISCORD_GUILD").unwrap_or_default(),
            },
            routing: RoutingConfig { channel_regex },
            ..MeshConfig::default()
        }],
        ..BridgeConfig::default()
    };
    config.check()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + Sync {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn sample() -> Value {
        json!({
            "meshes": [{
                "id": "bay",
                "mqtt": { "brokerUrl": "mqtt://broker", "topics": ["msh/US/bayarea/#"] },
                "discord": { "token": "t", "clientId": "1", "guildId": "2" },
                "routing": { "channelRegex": [{ "pattern": "LongFast", "discordChannelId": "3" }] }
            }]
        })
    }

    #[test]
    fn validates_minimal_document_with_defaults() {
        let config = validate(&sample()).unwrap();
        assert_eq!(config.store_path, PathBuf::from(DEFAULT_STORE_PATH));
        assert_eq!(config.logging.level, "info");
        assert!(!config.is_production());
        assert_eq!(config.meshes[0].display_name(), "bay");
        assert!(!config.meshes[0].cross_mesh_enabled());
        assert_eq!(config.keyring().unwrap().len(), 10);
        assert_eq!(config.routers().unwrap()[0].resolve("LongFast"), Some("3"));
    }

    #[test]
    fn missing_pattern_names_the_field() {
        let mut doc = sample();
        doc["meshes"][0]["routing"]["channelRegex"][0]
            .as_object_mut()
            .unwrap()
            .remove("pattern");
        let err = validate(&doc).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid or missing meshes[0].routing.channelRegex[0].pattern"
        );
    }

    #[test]
    fn empty_pattern_is_missing() {
        let mut doc = sample();
        doc["meshes"][0]["routing"]["channelRegex"][0]["pattern"] = json!("");
        assert_eq!(
            validate(&doc).unwrap_err().to_string(),
            "Invalid or missing meshes[0].routing.channelRegex[0].pattern"
        );
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let mut doc = sample();
        doc["storePath"] = json!("");
        doc["environment"] = json!("");
        doc["meshViewBaseUrl"] = json!(" ");
        doc["logging"] = json!({ "level": "", "file": "" });
        let config = validate(&doc).unwrap();
        assert_eq!(config.store_path, PathBuf::from(DEFAULT_STORE_PATH));
        assert_eq!(config.environment, None);
        assert_eq!(config.mesh_view_base_url, None);
        assert_eq!(config.logging, LoggingConfig::default());

        doc["logging"] = json!({ "level": "debug" });
        assert_eq!(validate(&doc).unwrap().logging.level, "debug");
    }

    #[test]
    fn field_qualified_errors() {
        let mut doc = sample();
        doc["meshes"][0]["mqtt"]["brokerUrl"] = json!("  ");
        assert_eq!(
            validate(&doc).unwrap_err().to_string(),
            "Invalid or missing meshes[0].mqtt.brokerUrl"
        );

        let mut doc = sample();
        doc["meshes"][0]["mqtt"]["topics"] = json!(["msh/#", ""]);
        assert_eq!(
            validate(&doc).unwrap_err().to_string(),
            "Invalid meshes[0].mqtt.topics[1]"
        );

        let mut doc = sample();
        doc["meshes"][0]["routing"]["channelRegex"][0]["flags"] = json!(3);
        match validate(&doc).unwrap_err() {
            ConfigError::Schema { document, reason } => {
                assert_eq!(document, "config file");
                assert!(reason.contains("expected a string"), "{reason}");
            }
            other => panic!("unexpected error {other}"),
        }

        assert_eq!(
            validate(&json!({ "meshes": [] })).unwrap_err().to_string(),
            "Invalid or missing meshes"
        );
    }

    #[test]
    fn hash_must_be_final_topic_level() {
        let mut doc = sample();
        doc["meshes"][0]["mqtt"]["topics"] = json!(["msh/#/x"]);
        match validate(&doc).unwrap_err() {
            ConfigError::Topic { field, .. } => assert_eq!(field, "meshes[0].mqtt.topics[0]"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn bad_decryption_key_is_rejected() {
        let mut doc = sample();
        doc["decryptionKeys"] = json!(["AQ=="]);
        match validate(&doc).unwrap_err() {
            ConfigError::Key { field, .. } => assert_eq!(field, "decryptionKeys[0]"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn invalid_regex_is_reported_at_compile() {
        let mut doc = sample();
        doc["meshes"][0]["routing"]["channelRegex"][0]["pattern"] = json!("(");
        let config = validate(&doc).unwrap();
        let err = config.routers().unwrap_err();
        assert!(err.to_string().starts_with("meshes[0]: Invalid routing.channelRegex[0] pattern '('"));
    }

    #[test]
    fn placeholders_expand_recursively() {
        let env = env_of(&[("TOKEN", "abc"), ("HOST", "broker")]);
        let mut doc = json!({
            "a": "${TOKEN}",
            "b": ["mqtt://${HOST}:1883", { "c": "${MISSING}x" }],
            "d": 5,
            "e": "${lower}"
        });
        expand_placeholders(&mut doc, &env);
        assert_eq!(doc["a"], "abc");
        assert_eq!(doc["b"][0], "mqtt://broker:1883");
        assert_eq!(doc["b"][1]["c"], "x");
        assert_eq!(doc["d"], 5);
        assert_eq!(doc["e"], "${lower}");
    }

    #[test]
    fn mesh_level_settings_override_globals() {
        let mut doc = sample();
        doc["meshViewBaseUrl"] = json!("https://global");
        doc["nodeInfoUpdates"] = json!(true);
        let config = validate(&doc).unwrap();
        assert_eq!(config.mesh_view_base_url(&config.meshes[0]), "https://global");
        assert!(config.node_info_updates(&config.meshes[0]));

        doc["meshes"][0]["meshViewBaseUrl"] = json!("https://local");
        doc["meshes"][0]["nodeInfoUpdates"] = json!(false);
        let config = validate(&doc).unwrap();
        assert_eq!(config.mesh_view_base_url(&config.meshes[0]), "https://local");
        assert!(!config.node_info_updates(&config.meshes[0]));
    }

    #[test]
    fn secrets_override_matching_mesh_only() {
        let mut config = validate(&sample()).unwrap();
        let secrets = validate_secrets(&json!({
            "meshes": [{ "id": "bay", "discordToken": "secret" }, { "id": "other", "discordToken": "x" }]
        }))
        .unwrap();
        apply_secrets(&mut config, &secrets);
        assert_eq!(config.meshes[0].discord.token.as_deref(), Some("secret"));

        let err = validate_secrets(&json!({ "meshes": [{ "discordToken": "x" }] })).unwrap_err();
        assert_eq!(err.to_string(), "Invalid or missing secrets.meshes[0].id");
    }

    #[test]
    fn toml_documents_parse() {
        let raw = r#"
            environment = "production"

            [[meshes]]
            id = "bay"
            [meshes.mqtt]
            brokerUrl = "mqtt://broker"
            topics = ["msh/US/#"]
            [meshes.discord]
            token = "t"
            clientId = "1"
            guildId = "2"
            [[meshes.routing.channelRegex]]
            pattern = "LongFast"
            discordChannelId = "3"
            flags = "i"
        "#;
        let doc = parse_document(Path::new("bridge.toml"), raw).unwrap();
        let config = validate(&doc).unwrap();
        assert!(config.is_production());
        assert_eq!(config.meshes[0].routing.channel_regex[0].flags.as_deref(), Some("i"));
    }

    #[test]
    fn legacy_environment_config() {
        let env = env_of(&[
            ("MQTT_BROKER_URL", "mqtt://legacy"),
            ("MQTT_TOPICS", r#"["msh/US/bayarea/#"]"#),
            ("DISCORD_TOKEN", "tok"),
            ("DISCORD_CLIENT_ID", "1"),
            ("DISCORD_GUILD", "2"),
            ("DISCORD_CHANNEL_LF", "10"),
            ("DISCORD_CHANNEL_HAB", "11"),
            ("NODE_INFO_UPDATES", "1"),
        ]);
        let config = legacy_config(&env).unwrap();
        let mesh = &config.meshes[0];
        assert_eq!(mesh.id, "default");
        assert!(config.node_info_updates);
        let patterns: Vec<&str> = mesh.routing.channel_regex.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["LongFast", "HAB"]);
    }

    #[test]
    fn legacy_environment_errors() {
        let env = env_of(&[("MQTT_TOPICS", "[not json")]);
        assert!(matches!(legacy_config(&env), Err(ConfigError::MalformedTopics(_))));

        let env = env_of(&[("MQTT_BROKER_URL", "mqtt://legacy")]);
        assert!(matches!(legacy_config(&env), Err(ConfigError::NoChannelMappings)));
    }
}
