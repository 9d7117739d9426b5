//! Switchboard configuration: deserialization, validation and resolution
//! of backend entries into transport descriptors.

use crate::error::SwitchboardError;
use crate::namespace::SEPARATOR;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Expand a single value: `${VAR}` resolves from the process environment
/// (unset resolves to the empty string), anything else is taken literally.
pub fn resolve_value(value: &str) -> String {
    match parse_env_ref(value) {
        Some(var_name) => std::env::var(var_name).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Resolve a map of env values, expanding `${VAR}` references.
pub fn resolve_env_vars(env: &HashMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), resolve_value(v)))
        .collect()
}

/// Top-level Switchboard configuration, parsed from TOML.
///
/// ```toml
/// [servers.files]
/// transport = "stdio"
/// command = "mcp-files"
///
/// [servers.search]
/// transport = "sse"
/// url = "https://search.internal/sse"
/// bearer_token = "${SEARCH_TOKEN}"
///
/// [tools."files--read_file"]
/// name = "read"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchboardConfig {
    /// Backends keyed by their logical name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Tool overrides keyed by qualified name (`backend--tool`).
    #[serde(default)]
    pub tools: HashMap<String, ToolOverride>,
}

/// Configuration for a single backend, as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// `stdio`, `sse`, or `streamable-http` (alias `http`). Inferred from
    /// `command` / `url` when omitted.
    pub transport: Option<String>,
    #[serde(default)]
    pub active: ActiveFlag,
    // STDIO fields
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    // SSE / Streamable HTTP fields
    pub url: Option<String>,
    pub bearer_token: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

/// The `active` switch accepts a boolean or a string; only `false` and
/// `"false"` turn a backend off.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ActiveFlag {
    Bool(bool),
    Text(String),
}

impl Default for ActiveFlag {
    fn default() -> Self {
        ActiveFlag::Bool(true)
    }
}

impl ActiveFlag {
    pub fn is_active(&self) -> bool {
        match self {
            ActiveFlag::Bool(active) => *active,
            ActiveFlag::Text(text) => text != "false",
        }
    }
}

/// Per-tool exposure policy, keyed by qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolOverride {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Name clients see instead of the qualified name.
    pub name: Option<String>,
    /// Description clients see instead of the backend's description.
    pub description: Option<String>,
}

impl Default for ToolOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
            description: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

/// Credentials attached to a remote backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    ApiKey(String),
}

impl Credentials {
    /// The value sent as `Authorization: Bearer <token>`.
    pub fn token(&self) -> &str {
        match self {
            Credentials::Bearer(token) | Credentials::ApiKey(token) => token,
        }
    }

    /// Environment variable a subprocess backend receives the credential in.
    pub fn env_var(&self) -> &'static str {
        match self {
            Credentials::Bearer(_) => "BEARER_TOKEN",
            Credentials::ApiKey(_) => "API_KEY",
        }
    }
}

/// How to reach a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    },
    Sse {
        url: String,
        credentials: Option<Credentials>,
    },
    StreamableHttp {
        url: String,
        credentials: Option<Credentials>,
    },
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio { .. } => "stdio",
            TransportKind::Sse { .. } => "sse",
            TransportKind::StreamableHttp { .. } => "streamable-http",
        }
    }
}

/// A backend entry resolved from configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    pub name: String,
    pub active: bool,
    pub kind: TransportKind,
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }

    fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = &self.bearer_token {
            return Some(Credentials::Bearer(resolve_value(token)));
        }
        self.api_key
            .as_ref()
            .map(|key| Credentials::ApiKey(resolve_value(key)))
    }

    /// Resolve this entry into a descriptor for the backend named `name`.
    ///
    /// Environment references are expanded here, so two resolutions of an
    /// unchanged entry compare equal.
    pub fn resolve(&self, name: &str) -> crate::Result<TransportDescriptor> {
        let transport = match (&self.transport, &self.command, &self.url) {
            (Some(kind), _, _) => kind.to_ascii_lowercase(),
            (None, Some(_), _) => "stdio".to_string(),
            (None, None, Some(_)) => "streamable-http".to_string(),
            (None, None, None) => {
                return Err(SwitchboardError::InvalidConfig(
                    name.to_string(),
                    "either 'command' or 'url' is required".to_string(),
                ));
            }
        };

        let require_url = || {
            self.url.clone().ok_or_else(|| {
                SwitchboardError::InvalidConfig(
                    name.to_string(),
                    format!("{} transport requires 'url' field", transport),
                )
            })
        };

        let kind = match transport.as_str() {
            "stdio" => {
                let command = self.command.clone().ok_or_else(|| {
                    SwitchboardError::InvalidConfig(
                        name.to_string(),
                        "stdio transport requires 'command' field".to_string(),
                    )
                })?;
                let mut env = resolve_env_vars(&self.env);
                if let Some(credentials) = self.credentials() {
                    env.insert(
                        credentials.env_var().to_string(),
                        credentials.token().to_string(),
                    );
                }
                TransportKind::Stdio {
                    command,
                    args: self.args.clone(),
                    env,
                    cwd: self.cwd.clone(),
                }
            }
            "sse" => TransportKind::Sse {
                url: require_url()?,
                credentials: self.credentials(),
            },
            "streamable-http" | "streamable_http" | "http" => TransportKind::StreamableHttp {
                url: require_url()?,
                credentials: self.credentials(),
            },
            other => {
                return Err(SwitchboardError::UnsupportedTransport(
                    name.to_string(),
                    other.to_string(),
                ));
            }
        };

        Ok(TransportDescriptor {
            name: name.to_string(),
            active: self.is_active(),
            kind,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        })
    }
}

/// Check that a backend name can prefix qualified tool names unambiguously.
pub fn validate_backend_name(name: &str) -> crate::Result<()> {
    if name.is_empty() || name.contains(SEPARATOR) {
        return Err(SwitchboardError::InvalidConfig(
            name.to_string(),
            format!("backend name must be non-empty and must not contain '{SEPARATOR}'"),
        ));
    }
    Ok(())
}

impl SwitchboardConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| SwitchboardError::InvalidConfig("config".into(), e.to_string()))
    }

    /// Validate names that shape the merged namespace.
    ///
    /// Per-backend transport problems are not checked here: those only take
    /// the offending backend out of the namespace at reconcile time.
    pub fn validate(&self) -> crate::Result<()> {
        for name in self.servers.keys() {
            validate_backend_name(name)?;
        }
        for (qualified, tool) in &self.tools {
            if !qualified.contains(SEPARATOR) {
                return Err(SwitchboardError::InvalidConfig(
                    qualified.clone(),
                    format!("tool override keys must be qualified as 'backend{SEPARATOR}tool'"),
                ));
            }
            if let Some(name) = &tool.name {
                if name.is_empty() {
                    return Err(SwitchboardError::InvalidConfig(
                        qualified.clone(),
                        "override name must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(toml_str: &str) -> SwitchboardConfig {
        SwitchboardConfig::from_toml(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_parse_env_ref() {
        assert_eq!(parse_env_ref("${FOO}"), Some("FOO"));
        assert_eq!(parse_env_ref("$FOO"), None);
        assert_eq!(parse_env_ref("literal"), None);
        assert_eq!(parse_env_ref("${"), None);
    }

    #[test]
    fn test_resolve_value() {
        // SAFETY: test-only, no concurrent threads depend on this env var.
        unsafe { std::env::set_var("SWITCHBOARD_TEST_VAR", "resolved_value") };
        assert_eq!(resolve_value("${SWITCHBOARD_TEST_VAR}"), "resolved_value");
        assert_eq!(resolve_value("plain"), "plain");
        assert_eq!(resolve_value("${SWITCHBOARD_TEST_UNSET_VAR}"), "");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("SWITCHBOARD_TEST_VAR") };
    }

    #[test]
    fn test_stdio_descriptor() {
        let config = parse_toml(
            r#"
            [servers.files]
            command = "mcp-files"
            args = ["--root", "/srv"]
            env = { MODE = "ro" }
            "#,
        );
        let descriptor = config.servers["files"].resolve("files").unwrap();
        assert_eq!(descriptor.name, "files");
        assert!(descriptor.active);
        assert_eq!(descriptor.handshake_timeout, Duration::from_secs(30));
        match descriptor.kind {
            TransportKind::Stdio {
                command, args, env, ..
            } => {
                assert_eq!(command, "mcp-files");
                assert_eq!(args, vec!["--root", "/srv"]);
                assert_eq!(env.get("MODE").map(String::as_str), Some("ro"));
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn test_stdio_credentials_merge_into_env() {
        let config = parse_toml(
            r#"
            [servers.files]
            command = "mcp-files"
            api_key = "k-123"
            "#,
        );
        let descriptor = config.servers["files"].resolve("files").unwrap();
        let TransportKind::Stdio { env, .. } = descriptor.kind else {
            panic!("expected stdio");
        };
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("k-123"));
    }

    #[test]
    fn test_sse_descriptor_with_bearer() {
        let config = parse_toml(
            r#"
            [servers.search]
            transport = "sse"
            url = "https://search.example.com/sse"
            bearer_token = "t0k"
            "#,
        );
        let descriptor = config.servers["search"].resolve("search").unwrap();
        assert_eq!(
            descriptor.kind,
            TransportKind::Sse {
                url: "https://search.example.com/sse".into(),
                credentials: Some(Credentials::Bearer("t0k".into())),
            }
        );
    }

    #[test]
    fn test_url_without_transport_defaults_to_streamable_http() {
        let config = parse_toml(
            r#"
            [servers.api]
            url = "https://api.example.com/mcp"
            "#,
        );
        let descriptor = config.servers["api"].resolve("api").unwrap();
        assert_eq!(descriptor.kind.label(), "streamable-http");
    }

    #[test]
    fn test_unknown_transport_is_unsupported() {
        let config = parse_toml(
            r#"
            [servers.ws]
            transport = "websocket"
            url = "wss://example.com"
            "#,
        );
        let result = config.servers["ws"].resolve("ws");
        assert!(
            matches!(result, Err(SwitchboardError::UnsupportedTransport(name, kind)) if name == "ws" && kind == "websocket")
        );
    }

    #[test]
    fn test_sse_missing_url() {
        let config = parse_toml(
            r#"
            [servers.search]
            transport = "sse"
            "#,
        );
        let result = config.servers["search"].resolve("search");
        assert!(
            matches!(result, Err(SwitchboardError::InvalidConfig(name, msg)) if name == "search" && msg.contains("url"))
        );
    }

    #[test]
    fn test_active_flag_variants() {
        let config = parse_toml(
            r#"
            [servers.a]
            command = "a"
            [servers.b]
            command = "b"
            active = false
            [servers.c]
            command = "c"
            active = "false"
            [servers.d]
            command = "d"
            active = "true"
            "#,
        );
        assert!(config.servers["a"].is_active());
        assert!(!config.servers["b"].is_active());
        assert!(!config.servers["c"].is_active());
        assert!(config.servers["d"].is_active());
    }

    #[test]
    fn test_tool_override_defaults_to_enabled() {
        let config = parse_toml(
            r#"
            [tools."files--read_file"]
            name = "read"
            "#,
        );
        let tool = &config.tools["files--read_file"];
        assert!(tool.enabled);
        assert_eq!(tool.name.as_deref(), Some("read"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_name_with_separator_rejected() {
        let config = parse_toml(
            r#"
            [servers."a--b"]
            command = "x"
            "#,
        );
        let result = config.validate();
        assert!(matches!(result, Err(SwitchboardError::InvalidConfig(name, _)) if name == "a--b"));
    }

    #[test]
    fn test_unqualified_override_key_rejected() {
        let config = parse_toml(
            r#"
            [tools.ping]
            enabled = false
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_invalid_config() {
        let result = SwitchboardConfig::from_toml("this is not valid toml {{{{");
        assert!(matches!(result, Err(SwitchboardError::InvalidConfig(..))));
    }
}
