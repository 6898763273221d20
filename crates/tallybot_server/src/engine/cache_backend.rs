#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimal string key/value store with per-entry expiry.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync + 'static {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
	async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
}

/// Process-local backend; entries expire lazily on read.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
	entries: DashMap<String, (String, Instant)>,
}

impl MemoryCacheBackend {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCacheBackend {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		let now = Instant::now();
		let hit = match self.entries.get(key) {
			Some(entry) if entry.1 > now => Some(entry.0.clone()),
			Some(_) => None,
			None => return Ok(None),
		};
		if hit.is_none() {
			self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
		}
		Ok(hit)
	}

	async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
		self.entries
			.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
		Ok(())
	}
}

/// Redis-backed cache with a lazily (re)established multiplexed connection.
pub struct RedisCacheBackend {
	client: redis::Client,
	connect_timeout: Duration,
	conn: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisCacheBackend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisCacheBackend")
			.field("connect_timeout", &self.connect_timeout)
			.finish_non_exhaustive()
	}
}

/// Accept `host:port` as well as full `redis://` URLs.
pub fn redis_url(host: &str) -> String {
	let host = host.trim();
	if host.contains("://") {
		host.to_string()
	} else {
		format!("redis://{host}")
	}
}

impl RedisCacheBackend {
	/// Does not connect; the first `get`/`set` does.
	pub fn new(host: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
		let client = redis::Client::open(redis_url(host)).context("parse redis url")?;
		Ok(Self {
			client,
			connect_timeout,
			conn: Mutex::new(None),
		})
	}

	async fn connection(&self) -> anyhow::Result<MultiplexedConnection> {
		let mut guard = self.conn.lock().await;
		if let Some(conn) = guard.as_ref() {
			return Ok(conn.clone());
		}

		let conn = tokio::time::timeout(self.connect_timeout, self.client.get_multiplexed_async_connection())
			.await
			.context("redis connect timed out")?
			.context("redis connect")?;
		*guard = Some(conn.clone());
		Ok(conn)
	}

	async fn reset(&self) {
		*self.conn.lock().await = None;
	}
}

#[async_trait::async_trait]
impl CacheBackend for RedisCacheBackend {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		let mut conn = self.connection().await?;
		match redis::cmd("GET").arg(key).query_async::<Option<String>>(&mut conn).await {
			Ok(v) => Ok(v),
			Err(e) => {
				self.reset().await;
				Err(e).context("redis GET")
			}
		}
	}

	async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
		let mut conn = self.connection().await?;
		let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
		match redis::cmd("SET")
			.arg(key)
			.arg(value)
			.arg("PX")
			.arg(ttl_ms)
			.query_async::<()>(&mut conn)
			.await
		{
			Ok(()) => Ok(()),
			Err(e) => {
				self.reset().await;
				Err(e).context("redis SET")
			}
		}
	}
}
