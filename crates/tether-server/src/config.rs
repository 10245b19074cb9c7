//! Server configuration: TOML file + CLI overrides.

use crate::session::{ResumeScanner, SessionPolicy};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{TetherError, TetherResult};
use tracing::info;

/// Largest output history per session. A full replay must fit in a
/// connection's outbound backlog.
pub const MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket upgrade path.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// Defaults to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,
    /// Defaults to the home directory.
    #[serde(default)]
    pub default_cwd: Option<String>,
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
    #[serde(default = "default_idle_notify_ms")]
    pub idle_notify_ms: u64,
    #[serde(default = "default_detached_timeout_secs")]
    pub detached_timeout_secs: u64,
    #[serde(default = "default_exited_timeout_secs")]
    pub exited_timeout_secs: u64,
    #[serde(default = "default_resume_pattern")]
    pub resume_pattern: String,
    #[serde(default = "default_resume_scan_bytes")]
    pub resume_scan_bytes: usize,
    #[serde(default = "default_strip_env")]
    pub strip_env: Vec<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            resume_flag: default_resume_flag(),
            shell: None,
            default_cwd: None,
            buffer_bytes: default_buffer_bytes(),
            idle_notify_ms: default_idle_notify_ms(),
            detached_timeout_secs: default_detached_timeout_secs(),
            exited_timeout_secs: default_exited_timeout_secs(),
            resume_pattern: default_resume_pattern(),
            resume_scan_bytes: default_resume_scan_bytes(),
            strip_env: default_strip_env(),
        }
    }
}

/// `[shutdown]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            poll_ms: default_poll_ms(),
            state_file: default_state_file(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    3001
}
fn default_path() -> String {
    "/ws/terminal".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_program() -> String {
    "claude".to_string()
}
fn default_resume_flag() -> String {
    "--resume".to_string()
}
fn default_buffer_bytes() -> usize {
    512 * 1024
}
fn default_idle_notify_ms() -> u64 {
    5000
}
fn default_detached_timeout_secs() -> u64 {
    4 * 60 * 60
}
fn default_exited_timeout_secs() -> u64 {
    30
}
fn default_resume_pattern() -> String {
    crate::session::resume::DEFAULT_RESUME_PATTERN.to_string()
}
fn default_resume_scan_bytes() -> usize {
    16 * 1024
}
fn default_strip_env() -> Vec<String> {
    vec!["SSH_AUTH_SOCK".to_string(), "SSH_AGENT_PID".to_string()]
}
fn default_grace_ms() -> u64 {
    5000
}
fn default_poll_ms() -> u64 {
    100
}
fn default_state_file() -> String {
    "~/.tether/resumable.json".to_string()
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub program: Option<String>,
    pub state_file: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub path: String,
    pub session: SessionPolicy,
    pub resume_pattern: String,
    pub resume_scan_bytes: usize,
    pub shutdown_grace: Duration,
    pub shutdown_poll: Duration,
    pub state_file: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> TetherResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Apply CLI overrides and defaults that depend on the environment, then validate.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> TetherResult<Self> {
        let ConfigFile {
            server,
            session,
            shutdown,
        } = file;

        let shell = session
            .shell
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string());
        let default_cwd = match session.default_cwd {
            Some(dir) => expand_tilde_str(&dir),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
        };
        let state_file = cli.state_file.clone().unwrap_or(shutdown.state_file);

        let config = Self {
            bind: cli.bind.unwrap_or(server.bind),
            port: cli.port.unwrap_or(server.port),
            path: server.path,
            session: SessionPolicy {
                program: cli.program.clone().unwrap_or(session.program),
                args: session.args,
                resume_flag: session.resume_flag,
                shell,
                default_cwd,
                strip_env: session.strip_env,
                buffer_bytes: session.buffer_bytes,
                idle_notify: Duration::from_millis(session.idle_notify_ms),
                detached_timeout: Duration::from_secs(session.detached_timeout_secs),
                exited_timeout: Duration::from_secs(session.exited_timeout_secs),
                max_sessions: cli.max_sessions.unwrap_or(server.max_sessions),
            },
            resume_pattern: session.resume_pattern,
            resume_scan_bytes: session.resume_scan_bytes,
            shutdown_grace: Duration::from_millis(shutdown.grace_ms),
            shutdown_poll: Duration::from_millis(shutdown.poll_ms),
            state_file: expand_tilde_str(&state_file),
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the resume scanner described by this config.
    pub fn resume_scanner(&self) -> TetherResult<ResumeScanner> {
        ResumeScanner::new(&self.resume_pattern, self.resume_scan_bytes)
    }

    fn validate(&self) -> TetherResult<()> {
        let s = &self.session;
        if s.exited_timeout >= s.detached_timeout {
            return Err(TetherError::Config(format!(
                "exited_timeout_secs ({}) must be shorter than detached_timeout_secs ({})",
                s.exited_timeout.as_secs(),
                s.detached_timeout.as_secs()
            )));
        }
        if s.buffer_bytes == 0 || s.buffer_bytes > MAX_BUFFER_BYTES {
            return Err(TetherError::Config(format!(
                "buffer_bytes must be between 1 and {MAX_BUFFER_BYTES}"
            )));
        }
        if s.max_sessions == 0 {
            return Err(TetherError::Config("max_sessions must be nonzero".into()));
        }
        if s.program.is_empty() {
            return Err(TetherError::Config("program must not be empty".into()));
        }
        if self.shutdown_poll.is_zero() || self.shutdown_poll > self.shutdown_grace {
            return Err(TetherError::Config(
                "poll_ms must be nonzero and no longer than grace_ms".into(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(TetherError::Config(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        self.resume_scanner()?;
        Ok(())
    }
}

fn parse(content: &str) -> TetherResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TetherError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(toml: &str) -> TetherResult<ServerConfig> {
        ServerConfig::resolve(parse(toml)?, &CliOverrides::default())
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = resolve("").unwrap();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.path, "/ws/terminal");
        assert_eq!(cfg.session.program, "claude");
        assert_eq!(cfg.session.buffer_bytes, 512 * 1024);
        assert_eq!(cfg.session.idle_notify, Duration::from_secs(5));
        assert_eq!(cfg.session.detached_timeout, Duration::from_secs(4 * 3600));
        assert_eq!(cfg.session.exited_timeout, Duration::from_secs(30));
        assert_eq!(cfg.session.max_sessions, 32);
        assert_eq!(cfg.session.strip_env, vec!["SSH_AUTH_SOCK", "SSH_AGENT_PID"]);
        assert_eq!(cfg.shutdown_grace, Duration::from_millis(5000));
        assert_eq!(cfg.shutdown_poll, Duration::from_millis(100));
        assert!(cfg.state_file.ends_with(".tether/resumable.json"));
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = resolve(
            r#"
            [server]
            bind = "127.0.0.1"
            port = 9000
            path = "/term"

            [session]
            program = "bash"
            args = ["-l"]
            shell = "/bin/zsh"
            default_cwd = "/srv"
            idle_notify_ms = 250
            exited_timeout_secs = 5
            resume_pattern = 'resume=(\w+)'

            [shutdown]
            grace_ms = 1000
            poll_ms = 50
            state_file = "/var/lib/tether/state.json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bind, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.path, "/term");
        assert_eq!(cfg.session.program, "bash");
        assert_eq!(cfg.session.args, vec!["-l"]);
        assert_eq!(cfg.session.shell, "/bin/zsh");
        assert_eq!(cfg.session.default_cwd, PathBuf::from("/srv"));
        assert_eq!(cfg.session.idle_notify, Duration::from_millis(250));
        assert_eq!(cfg.shutdown_poll, Duration::from_millis(50));
        assert_eq!(cfg.state_file, PathBuf::from("/var/lib/tether/state.json"));
        let scanner = cfg.resume_scanner().unwrap();
        assert_eq!(scanner.extract(b"resume=abc").as_deref(), Some("abc"));
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse("[server]\nport = 9000\nmax_sessions = 8\n").unwrap();
        let cli = CliOverrides {
            port: Some(7000),
            max_sessions: Some(2),
            program: Some("codex".into()),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(file, &cli).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.session.max_sessions, 2);
        assert_eq!(cfg.session.program, "codex");
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let err = resolve("[session]\ndetached_timeout_secs = 10\nexited_timeout_secs = 10\n")
            .unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(resolve("[session]\nbuffer_bytes = 0\n").is_err());
        assert!(resolve("[session]\nbuffer_bytes = 8388608\n").is_err());
        assert!(resolve("[shutdown]\ngrace_ms = 100\npoll_ms = 500\n").is_err());
        assert!(resolve("[session]\nresume_pattern = '--resume \\S+'\n").is_err());
        assert!(resolve("[server]\npath = \"ws\"\n").is_err());
        assert!(resolve("[server]\nport = \"high\"\n").is_err());
        assert!(resolve("[unknown]\nkey = 1\n").is_err());
    }

    #[test]
    fn load_reads_file_and_tolerates_missing_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 4100\n").unwrap();

        let cfg = ServerConfig::load(Some(&path), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 4100);

        let missing = dir.path().join("absent.toml");
        let cfg = ServerConfig::load(Some(&missing), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 3001);
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y"), home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}
