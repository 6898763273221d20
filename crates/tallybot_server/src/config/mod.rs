#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tallybot_domain::DEFAULT_MAX_INCREMENT_AMOUNT;
use tallybot_platform::SecretString;
use tracing::{debug, info, warn};

const DEFAULT_CACHE_NAMESPACE: &str = "tallybot";
const DEFAULT_CACHE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Default config path: `~/.tallybot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tallybot").join("config.toml"))
}

/// Load the config from TOML (missing file = defaults) and apply `TALLYBOT_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<Config> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = Config::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.finalize();
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct Config {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
	pub cache: CacheSettings,
	pub commands: CommandSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// JSON file seeding the in-memory stores.
	pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	/// Needed for token refresh.
	pub client_secret: Option<SecretString>,

	/// Login of the shared bot account.
	pub bot_username: Option<String>,

	pub eventsub_ws_url: Option<String>,
	pub helix_base_url: Option<String>,
	pub token_url: Option<String>,

	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,

	/// Tokens expiring within this window are refreshed before use.
	pub refresh_buffer: Duration,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: None,
			client_secret: None,
			bot_username: None,
			eventsub_ws_url: None,
			helix_base_url: None,
			token_url: None,
			reconnect_min_delay: None,
			reconnect_max_delay: None,
			refresh_buffer: DEFAULT_REFRESH_BUFFER,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
	/// Cache disabled; every lookup is a miss.
	#[default]
	None,
	Memory,
	Redis,
}

impl CacheBackendKind {
	fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"none" | "off" | "disabled" => Some(Self::None),
			"memory" | "local" => Some(Self::Memory),
			"redis" => Some(Self::Redis),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
	pub backend: CacheBackendKind,
	/// Redis `host:port` or URL. Setting it without a backend selects Redis.
	pub host: Option<String>,
	pub namespace: String,
	pub connect_timeout: Duration,
	backend_explicit: bool,
}

impl Default for CacheSettings {
	fn default() -> Self {
		Self {
			backend: CacheBackendKind::None,
			host: None,
			namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
			connect_timeout: DEFAULT_CACHE_CONNECT_TIMEOUT,
			backend_explicit: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct CommandSettings {
	/// Upper bound for explicit amounts (`!death+ 5`).
	pub max_increment_amount: u32,
}

impl Default for CommandSettings {
	fn default() -> Self {
		Self {
			max_increment_amount: DEFAULT_MAX_INCREMENT_AMOUNT,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	cache: FileCacheSettings,

	#[serde(default)]
	commands: FileCommandSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	state_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	bot_username: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	token_url: Option<String>,

	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	refresh_buffer_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCacheSettings {
	backend: Option<String>,
	host: Option<String>,
	namespace: Option<String>,
	connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCommandSettings {
	max_increment_amount: Option<u32>,
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
	fn from_file(file: FileConfig) -> Self {
		let twitch = TwitchSettings {
			client_id: non_blank(file.twitch.client_id),
			client_secret: non_blank(file.twitch.client_secret).map(SecretString::new),
			bot_username: non_blank(file.twitch.bot_username),
			eventsub_ws_url: non_blank(file.twitch.eventsub_ws_url),
			helix_base_url: non_blank(file.twitch.helix_base_url),
			token_url: non_blank(file.twitch.token_url),
			reconnect_min_delay: file.twitch.reconnect_min_delay_ms.map(Duration::from_millis),
			reconnect_max_delay: file.twitch.reconnect_max_delay_ms.map(Duration::from_millis),
			refresh_buffer: file
				.twitch
				.refresh_buffer_secs
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_REFRESH_BUFFER),
		};

		let backend = non_blank(file.cache.backend);
		let cache = CacheSettings {
			backend: backend
				.as_deref()
				.and_then(CacheBackendKind::parse)
				.unwrap_or_default(),
			backend_explicit: backend.is_some(),
			host: non_blank(file.cache.host),
			namespace: non_blank(file.cache.namespace).unwrap_or_else(|| DEFAULT_CACHE_NAMESPACE.to_string()),
			connect_timeout: file
				.cache
				.connect_timeout_ms
				.filter(|ms| *ms > 0)
				.map(Duration::from_millis)
				.unwrap_or(DEFAULT_CACHE_CONNECT_TIMEOUT),
		};

		Self {
			server: ServerSettings {
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				state_path: non_blank(file.server.state_path).map(PathBuf::from),
			},
			twitch,
			cache,
			commands: CommandSettings {
				max_increment_amount: file
					.commands
					.max_increment_amount
					.filter(|n| *n > 0)
					.unwrap_or(DEFAULT_MAX_INCREMENT_AMOUNT),
			},
		}
	}

	/// Cross-field fixups applied after env overrides.
	fn finalize(&mut self) {
		if !self.cache.backend_explicit && self.cache.host.is_some() {
			self.cache.backend = CacheBackendKind::Redis;
		}
		if self.cache.backend == CacheBackendKind::Redis && self.cache.host.is_none() {
			warn!("cache config: redis backend selected without host; eligibility cache disabled");
			self.cache.backend = CacheBackendKind::None;
		}

		if self.twitch.client_id.is_some() {
			info!("twitch config: client_id provided");
		} else {
			warn!("twitch config: no client_id configured; helix calls will fail");
		}
		if self.twitch.bot_username.is_none() {
			warn!("twitch config: no bot_username configured; replies use broadcaster tokens");
		}

		if let (Some(min), Some(max)) = (self.twitch.reconnect_min_delay, self.twitch.reconnect_max_delay)
			&& min > max
		{
			warn!(
				min_ms = min.as_millis(),
				max_ms = max.as_millis(),
				"twitch config: reconnect_min_delay > reconnect_max_delay; swapping"
			);
			self.twitch.reconnect_min_delay = Some(max);
			self.twitch.reconnect_max_delay = Some(min);
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut Config) {
	apply_overrides(cfg, &|key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, var: &dyn Fn(&str) -> Option<String>) {
	let text = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("TALLYBOT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("TALLYBOT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("TALLYBOT_STATE_PATH") {
		cfg.server.state_path = Some(PathBuf::from(v));
		info!("server config: state_path overridden by env");
	}

	if let Some(v) = text("TALLYBOT_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = text("TALLYBOT_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = text("TALLYBOT_TWITCH_BOT_USERNAME") {
		cfg.twitch.bot_username = Some(v);
		info!("twitch config: bot_username overridden by env");
	}

	if let Some(v) = text("TALLYBOT_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = text("TALLYBOT_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(ms) = text("TALLYBOT_TWITCH_RECONNECT_MIN_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
		cfg.twitch.reconnect_min_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_min_delay overridden by env");
	}

	if let Some(ms) = text("TALLYBOT_TWITCH_RECONNECT_MAX_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
		cfg.twitch.reconnect_max_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_max_delay overridden by env");
	}

	if let Some(secs) = text("TALLYBOT_TWITCH_REFRESH_BUFFER_SECS").and_then(|v| v.parse::<u64>().ok()) {
		cfg.twitch.refresh_buffer = Duration::from_secs(secs);
		debug!(secs, "twitch config: refresh_buffer overridden by env");
	}

	if let Some(v) = text("TALLYBOT_CACHE_BACKEND") {
		match CacheBackendKind::parse(&v) {
			Some(kind) => {
				cfg.cache.backend = kind;
				cfg.cache.backend_explicit = true;
				info!(backend = ?kind, "cache config: backend overridden by env");
			}
			None => warn!(value = %v, "cache config: unknown TALLYBOT_CACHE_BACKEND ignored"),
		}
	}

	if let Some(enabled) = var("TALLYBOT_CACHE_ENABLED").as_deref().and_then(parse_env_bool)
		&& !enabled
	{
		cfg.cache.backend = CacheBackendKind::None;
		cfg.cache.backend_explicit = true;
		info!("cache config: disabled by env");
	}

	if let Some(v) = text("TALLYBOT_CACHE_HOST") {
		cfg.cache.host = Some(v);
		info!("cache config: host overridden by env");
	}

	if let Some(v) = text("TALLYBOT_CACHE_NAMESPACE") {
		cfg.cache.namespace = v;
		info!("cache config: namespace overridden by env");
	}

	if let Some(n) = text("TALLYBOT_MAX_INCREMENT_AMOUNT")
		.and_then(|v| v.parse::<u32>().ok())
		.filter(|n| *n > 0)
	{
		cfg.commands.max_increment_amount = n;
		info!(n, "commands config: max_increment_amount overridden by env");
	}
}
