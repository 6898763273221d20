#![forbid(unsafe_code)]

mod config;
mod engine;
mod server;
mod stores;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tallybot_platform::twitch::{
	EVENTSUB_WS_URL, EventSubTransportConfig, HELIX_BASE_URL, HelixClient, TOKEN_URL, TwitchEventSubTransport,
	TwitchTokenRefresher,
};
use tallybot_platform::webhook::WebhookClient;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::{CacheBackendKind, Config};
use crate::engine::cache_backend::{CacheBackend, MemoryCacheBackend, RedisCacheBackend};
use crate::engine::commands::{CommandProcessor, CommandProcessorConfig};
use crate::engine::connections::{ConnectionManager, ConnectionManagerConfig};
use crate::engine::eligibility::EligibilityResolver;
use crate::engine::eligibility_cache::EligibilityCache;
use crate::engine::milestones::MilestoneNotifier;
use crate::engine::monitoring::MonitoringRegistry;
use crate::engine::subscriptions::{EventSubscriptionService, SubscriptionServiceConfig, SubscriptionServiceDeps};
use crate::server::chat::HelixChatSender;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::notifier::WebhookNotifier;
use crate::server::overlay::LoggingOverlayPublisher;
use crate::stores::MemoryStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tallybot [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.tallybot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tallybot_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tallybot_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn parse_url(configured: Option<&str>, default: &str, what: &str) -> anyhow::Result<Url> {
	let raw = configured.unwrap_or(default);
	Url::parse(raw).with_context(|| format!("invalid {what} url: {raw}"))
}

fn build_cache(cfg: &Config) -> anyhow::Result<EligibilityCache> {
	let backend: Option<Arc<dyn CacheBackend>> = match cfg.cache.backend {
		CacheBackendKind::None => None,
		CacheBackendKind::Memory => Some(Arc::new(MemoryCacheBackend::new())),
		CacheBackendKind::Redis => {
			let host = cfg.cache.host.as_deref().unwrap_or_default();
			Some(Arc::new(RedisCacheBackend::new(host, cfg.cache.connect_timeout)?))
		}
	};
	info!(backend = ?cfg.cache.backend, namespace = %cfg.cache.namespace, "eligibility cache configured");
	Ok(EligibilityCache::new(backend, cfg.cache.namespace.clone()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let store = Arc::new(match cfg.server.state_path.as_deref() {
		Some(path) => MemoryStore::load(path)?,
		None => MemoryStore::new(),
	});

	let client_id = cfg.twitch.client_id.clone().unwrap_or_default();
	let helix = HelixClient::new(
		parse_url(cfg.twitch.helix_base_url.as_deref(), HELIX_BASE_URL, "helix")?,
		client_id.clone(),
	)?;
	let refresher = Arc::new(TwitchTokenRefresher::new(
		parse_url(cfg.twitch.token_url.as_deref(), TOKEN_URL, "token")?,
		client_id,
		cfg.twitch.client_secret.clone().unwrap_or_default(),
	)?);

	let registry = Arc::new(MonitoringRegistry::new());
	let resolver = Arc::new(EligibilityResolver::new(
		Arc::new(helix.clone()),
		build_cache(&cfg)?,
		Arc::clone(&registry),
		cfg.twitch.bot_username.clone(),
	));

	let overlay = Arc::new(LoggingOverlayPublisher::new());
	let external = Arc::new(WebhookNotifier::new(WebhookClient::new()?));
	let milestones = Arc::new(MilestoneNotifier::new(external.clone(), overlay.clone()));
	let commands = Arc::new(CommandProcessor::new(
		CommandProcessorConfig {
			max_increment_amount: cfg.commands.max_increment_amount,
		},
		milestones,
		overlay.clone(),
	));

	let chat = Arc::new(HelixChatSender::new(helix.clone(), store.clone(), store.clone()));
	let connections = Arc::new(ConnectionManager::new(
		ConnectionManagerConfig {
			refresh_buffer: cfg.twitch.refresh_buffer,
		},
		store.clone(),
		store.clone(),
		refresher,
		resolver,
		Arc::clone(&registry),
		chat,
	));

	let mut transport_cfg =
		EventSubTransportConfig::new(parse_url(cfg.twitch.eventsub_ws_url.as_deref(), EVENTSUB_WS_URL, "eventsub")?);
	if let Some(min) = cfg.twitch.reconnect_min_delay {
		transport_cfg.reconnect_min_delay = min;
	}
	if let Some(max) = cfg.twitch.reconnect_max_delay {
		transport_cfg.reconnect_max_delay = max;
	}

	let service = EventSubscriptionService::new(
		SubscriptionServiceDeps {
			transport: Arc::new(TwitchEventSubTransport::new(transport_cfg)),
			subscriptions: Arc::new(helix),
			users: store.clone(),
			counters: store.clone(),
			configs: store.clone(),
			connections,
			commands,
			registry,
			external,
			overlay,
		},
		SubscriptionServiceConfig {
			bot_username: cfg.twitch.bot_username.clone(),
		},
	);

	let health_state = HealthState::new();
	health_state.track_session(service.watch_state());
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	service.start().await?;
	info!("tallybot running; press ctrl-c to stop");

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");
	service.stop().await;

	Ok(())
}
