use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 49813;
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Outbound messages to the client are spaced at least this far apart.
pub const DEFAULT_RATE_LIMIT_MS: u64 = 1200;
/// Soft deadline for flushing buffered output during execution.
pub const DEFAULT_FLUSH_DEADLINE_MS: u64 = 500;
/// Discord-imposed chunk size cap on DIRECT payloads.
pub const DIRECT_CHUNK_LIMIT: usize = 2000;
/// Upload file size cap, enforced by the (out-of-scope) FUSE driver via this crate's path helper.
pub const UPLOAD_MAX_BYTES: usize = 8 << 20;
pub const SNAPSHOT_COLS: u16 = 80;
pub const SNAPSHOT_ROWS: u16 = 24;
/// `idname` must match this shape: 1 to 30 ASCII alphanumerics.
pub const IDNAME_MAX_LEN: usize = 30;

/// Top-level config (shellbridge.toml + SHELLBRIDGE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sandbox: SandboxConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// Paths and binaries the session lifecycle manager forks or mounts.
///
/// All of these name *external collaborators* (the launcher script, the
/// custom shell, the network helper); the engine itself only shells out to
/// them through exec/fork, never links against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Root directory holding one subdirectory per identity, e.g. `<runroot>/<idname>/{upper,work,root}`.
    #[serde(default = "default_runroot")]
    pub runroot: String,
    /// Read-only base image used as the overlay's lower layer.
    #[serde(default = "default_base_image")]
    pub base_image: String,
    /// On-host shell binary copied into the sealed memfd at session start.
    #[serde(default = "default_shell_binary")]
    pub shell_binary: String,
    /// Launcher script exec'd in the forked PTY child (namespaces, mounts, seccomp).
    #[serde(default = "default_launcher_script")]
    pub launcher_script: String,
    /// User-space network helper binary (slirp4netns-compatible).
    #[serde(default = "default_slirp_binary")]
    pub slirp_binary: String,
    /// Mount point of the FUSE-backed upload filesystem.
    #[serde(default = "default_upload_mount")]
    pub upload_mount: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runroot: default_runroot(),
            base_image: default_base_image(),
            shell_binary: default_shell_binary(),
            launcher_script: default_launcher_script(),
            slirp_binary: default_slirp_binary(),
            upload_mount: default_upload_mount(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_flush_deadline_ms")]
    pub flush_deadline_ms: u64,
    /// Deadline for the initial `INIT` handshake line.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: default_rate_limit_ms(),
            flush_deadline_ms: default_flush_deadline_ms(),
            init_timeout_ms: default_init_timeout_ms(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_runroot() -> String {
    "/run/container-run".to_string()
}
fn default_base_image() -> String {
    "/jailroot".to_string()
}
fn default_shell_binary() -> String {
    "/home/user/bash".to_string()
}
fn default_launcher_script() -> String {
    "/home/user/jail.sh".to_string()
}
fn default_slirp_binary() -> String {
    "slirp4netns".to_string()
}
fn default_upload_mount() -> String {
    "/run/discord-upload-fuse".to_string()
}
fn default_rate_limit_ms() -> u64 {
    DEFAULT_RATE_LIMIT_MS
}
fn default_flush_deadline_ms() -> u64 {
    DEFAULT_FLUSH_DEADLINE_MS
}
fn default_init_timeout_ms() -> u64 {
    1_000
}

impl BridgeConfig {
    /// Load config from a TOML file with SHELLBRIDGE_* env var overrides.
    ///
    /// Checks, in order: the explicit path argument, then `SHELLBRIDGE_CONFIG`,
    /// then `./shellbridge.toml`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: BridgeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SHELLBRIDGE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    std::env::var("SHELLBRIDGE_CONFIG").unwrap_or_else(|_| "./shellbridge.toml".to_string())
}
