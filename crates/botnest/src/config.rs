use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

use botnest_protocol::PairingMethod;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Base directory for all runtime state (credentials, ledger).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    /// Substrings that must never appear in any user-visible error report.
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Base directory for runtime state, defaulting to `.botnest` next to
    /// the config file.
    pub fn data_dir(&self, config_path: &Path) -> PathBuf {
        match &self.data_dir {
            Some(dir) => resolve_path(config_path, dir),
            None => resolve_path(config_path, Path::new(DEFAULT_DATA_DIR)),
        }
    }

    pub fn sessions_dir(&self, config_path: &Path) -> PathBuf {
        self.data_dir(config_path).join(DEFAULT_SESSIONS_DIR)
    }

    pub fn backups_dir(&self, config_path: &Path) -> PathBuf {
        self.data_dir(config_path).join(DEFAULT_BACKUPS_DIR)
    }

    pub fn ledger_path(&self, config_path: &Path) -> PathBuf {
        match &self.ledger.path {
            Some(p) => resolve_path(config_path, p),
            None => self.data_dir(config_path).join(DEFAULT_LEDGER_FILE),
        }
    }
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is; relative paths are joined with the
/// config file's parent directory so behavior does not depend on the
/// current working directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default state directory (relative to config file).
pub const DEFAULT_DATA_DIR: &str = ".botnest";
/// Default session credential directory (relative to data dir).
pub const DEFAULT_SESSIONS_DIR: &str = "sessions";
/// Default credential backup tree (relative to data dir).
pub const DEFAULT_BACKUPS_DIR: &str = "backups";
/// Default ledger document file (relative to data dir).
pub const DEFAULT_LEDGER_FILE: &str = "ledger.json";

// ============================================================================
// SessionConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Browser identity string presented to the platform on connect.
    #[serde(default = "default_browser_label")]
    pub browser_label: String,
    /// How new sessions authenticate: scan a QR payload or enter a
    /// numeric code.
    #[serde(default = "default_pairing_method")]
    pub pairing_method: PairingMethod,
    /// Seconds a pairing artifact stays valid before it must be reissued.
    #[serde(default = "default_pairing_expiry")]
    pub pairing_expiry_seconds: u64,
    /// Base delay for reconnect backoff; the n-th attempt waits
    /// `base * 2^n`.
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,
    /// Consecutive failed reconnects a sub session may accumulate before
    /// its supervisor gives up. The primary session is never bounded.
    #[serde(default = "default_max_sub_attempts")]
    pub max_sub_attempts: u32,
    /// Failed activations a sub session directory may accumulate across
    /// reconcile sweeps before it is purged from disk.
    #[serde(default = "default_max_activation_attempts")]
    pub max_activation_attempts: u32,
    /// Seconds between registry reconcile sweeps.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            browser_label: default_browser_label(),
            pairing_method: default_pairing_method(),
            pairing_expiry_seconds: default_pairing_expiry(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            max_sub_attempts: default_max_sub_attempts(),
            max_activation_attempts: default_max_activation_attempts(),
            reconcile_interval_seconds: default_reconcile_interval(),
        }
    }
}

impl SessionConfig {
    pub fn pairing_expiry(&self) -> Duration {
        Duration::from_secs(self.pairing_expiry_seconds)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }
}

// ============================================================================
// DispatchConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Command prefix. Omitted or empty means any text is eligible; a
    /// single character is a literal; a longer string is a character
    /// class; a list is matched as alternatives.
    #[serde(default)]
    pub prefix: Option<PrefixSpec>,
    /// Minimum milliseconds between two commands from the same sender.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Only react to messages from the session's own account.
    #[serde(default)]
    pub self_mode: bool,
    /// Only dispatch messages arriving in group chats.
    #[serde(default)]
    pub group_only: bool,
    /// Only dispatch messages arriving in private chats.
    #[serde(default)]
    pub private_only: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            cooldown_ms: default_cooldown_ms(),
            self_mode: false,
            group_only: false,
            private_only: false,
        }
    }
}

impl DispatchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// A prefix as written in config: one string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PrefixSpec {
    One(String),
    Many(Vec<String>),
}

// ============================================================================
// LedgerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Seconds between periodic flushes of the ledger document to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval_seconds: default_flush_interval(),
        }
    }
}

impl LedgerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }
}

// ============================================================================
// RolesConfig
// ============================================================================

/// Sender identities with elevated standing, by canonical sender id.
#[derive(Debug, Default, Deserialize)]
pub struct RolesConfig {
    /// Accounts allowed to run deployment-level commands. In practice the
    /// account the primary session is paired with.
    #[serde(default)]
    pub restricted_owners: Vec<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub moderators: Vec<String>,
    /// Permanently premium accounts, independent of ledger expiry.
    #[serde(default)]
    pub premium: Vec<String>,
}

// ============================================================================
// ConnectorConfig
// ============================================================================

/// External protocol client process. The runtime spawns it per session and
/// exchanges JSON lines over stdio.
#[derive(Debug, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_connector_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            command: default_connector_command(),
            args: Vec::new(),
        }
    }
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_browser_label() -> String {
    "botnest".to_string()
}

fn default_pairing_method() -> PairingMethod {
    PairingMethod::Qr
}

fn default_pairing_expiry() -> u64 {
    45
}

fn default_reconnect_base_delay() -> u64 {
    2000
}

fn default_max_sub_attempts() -> u32 {
    5
}

fn default_max_activation_attempts() -> u32 {
    5
}

fn default_reconcile_interval() -> u64 {
    1800
}

fn default_cooldown_ms() -> u64 {
    3000
}

fn default_flush_interval() -> u64 {
    30
}

fn default_connector_command() -> String {
    "botnest-connector".to_string()
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` references in a config file.
///
/// `$$` escapes a literal `$`; a plain `$` not followed by `{` is kept
/// as-is. Nested references are not supported, and an unclosed `${` is an
/// error.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(stripped) = rest.strip_prefix('$') {
            out.push('$');
            rest = stripped;
        } else if let Some(body) = rest.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or(ConfigError::UnclosedVarReference)?;
            out.push_str(&lookup_var(&body[..end])?);
            rest = &body[end + 1..];
        } else {
            out.push('$');
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn lookup_var(reference: &str) -> Result<String, ConfigError> {
    let (name, default) = match reference.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (reference, None),
    };

    match std::env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => match default {
            Some(d) => Ok(d.to_string()),
            None => Err(ConfigError::MissingEnvVar(name.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let config = Config::load("/nonexistent/botnest.yaml").await.unwrap();
        assert_eq!(config.session.pairing_expiry_seconds, 45);
        assert_eq!(config.session.max_sub_attempts, 5);
        assert_eq!(config.session.reconcile_interval_seconds, 1800);
        assert_eq!(config.dispatch.cooldown_ms, 3000);
        assert_eq!(config.ledger.flush_interval_seconds, 30);
        assert!(config.roles.owners.is_empty());
    }

    #[tokio::test]
    async fn load_yaml_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            concat!(
                "session:\n",
                "  pairing_method: numeric_code\n",
                "  max_sub_attempts: 3\n",
                "dispatch:\n",
                "  prefix: \"!\"\n",
                "  cooldown_ms: 1000\n",
                "roles:\n",
                "  owners: [\"111\", \"222\"]\n",
            )
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.session.pairing_method, PairingMethod::NumericCode);
        assert_eq!(config.session.max_sub_attempts, 3);
        assert_eq!(config.dispatch.cooldown_ms, 1000);
        assert_eq!(config.roles.owners, vec!["111", "222"]);
        match config.dispatch.prefix {
            Some(PrefixSpec::One(ref p)) => assert_eq!(p, "!"),
            _ => panic!("expected single prefix"),
        }
    }

    #[tokio::test]
    async fn prefix_list_parses() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "dispatch:\n  prefix: [\"!\", \".\", \"#\"]").unwrap();

        let config = Config::load(file.path()).await.unwrap();
        match config.dispatch.prefix {
            Some(PrefixSpec::Many(ref list)) => assert_eq!(list.len(), 3),
            _ => panic!("expected prefix list"),
        }
    }

    #[test]
    fn expand_required_var() {
        std::env::set_var("BOTNEST_TEST_VAR", "hello");
        assert_eq!(
            expand_env_vars("value: ${BOTNEST_TEST_VAR}").unwrap(),
            "value: hello"
        );
    }

    #[test]
    fn expand_missing_var_is_error() {
        let err = expand_env_vars("value: ${BOTNEST_DEFINITELY_UNSET}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn expand_default_value() {
        assert_eq!(
            expand_env_vars("value: ${BOTNEST_DEFINITELY_UNSET:-fallback}").unwrap(),
            "value: fallback"
        );
        assert_eq!(
            expand_env_vars("value: ${BOTNEST_DEFINITELY_UNSET:-}").unwrap(),
            "value: "
        );
    }

    #[test]
    fn expand_escapes_and_literals() {
        assert_eq!(expand_env_vars("price: $$100").unwrap(), "price: $100");
        assert_eq!(expand_env_vars("price: $100").unwrap(), "price: $100");
    }

    #[test]
    fn expand_unclosed_reference_is_error() {
        let err = expand_env_vars("value: ${OOPS").unwrap_err();
        assert!(matches!(err, ConfigError::UnclosedVarReference));
    }

    #[test]
    fn resolve_path_relative_to_config() {
        let resolved = resolve_path(Path::new("/etc/botnest/botnest.yaml"), Path::new("state"));
        assert_eq!(resolved, PathBuf::from("/etc/botnest/state"));

        let absolute = resolve_path(Path::new("/etc/botnest/botnest.yaml"), Path::new("/var/s"));
        assert_eq!(absolute, PathBuf::from("/var/s"));
    }

    #[test]
    fn derived_paths_use_data_dir() {
        let config = Config::default();
        let base = Path::new("/srv/bot/botnest.yaml");
        assert_eq!(
            config.sessions_dir(base),
            PathBuf::from("/srv/bot/.botnest/sessions")
        );
        assert_eq!(
            config.ledger_path(base),
            PathBuf::from("/srv/bot/.botnest/ledger.json")
        );
    }
}
