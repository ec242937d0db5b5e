//! Redis-backed counter store shared by every limiter instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo, RedisError};
use tracing::{debug, info, instrument, warn};

use super::{CounterStore, SharedConnect, StoreError, WindowState};
use crate::config::RateLimiterConfig;
use crate::error::{Result, WindowgateError};
use crate::ratelimit::ResourceKey;

/// Increments the counter and returns `{count, pttl}`.
///
/// A key without an expiry (fresh, or left behind by an older writer) gets
/// one in the same script run, so no counter can outlive its window.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return { count, ttl }
"#;

/// Map a Redis command failure onto the store taxonomy.
fn command_error(err: RedisError) -> StoreError {
    if err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Connection(err.to_string())
    } else if err.is_io_error() && !err.is_timeout() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

/// A counter store backed by a shared Redis server.
///
/// The connection is established once, on the first call to
/// [`CounterStore::connect`] or the first counter operation, and multiplexed
/// for all later calls.
pub struct RedisCounterStore {
    /// Server address, without credentials, for logging.
    addr: String,
    /// Prefix prepended to every resource key.
    key_prefix: String,
    script: redis::Script,
    connection: SharedConnect<ConnectionManager>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("addr", &self.addr)
            .field("key_prefix", &self.key_prefix)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store for the configured address and credential.
    ///
    /// No connection is made here; an unparseable address is reported as a
    /// configuration error.
    pub fn new(config: &RateLimiterConfig) -> Result<Self> {
        let mut connection_info = config
            .store_address()
            .into_connection_info()
            .map_err(|e| WindowgateError::Config(format!("Invalid store address: {}", e)))?;
        connection_info.redis.password = Some(config.store_credential().to_string());

        let addr = format!("{:?}", connection_info.addr);
        let client = redis::Client::open(connection_info)
            .map_err(|e| WindowgateError::Config(format!("Invalid store address: {}", e)))?;

        let connect_addr = addr.clone();
        let connection = SharedConnect::new(move || {
            let client = client.clone();
            let addr = connect_addr.clone();
            async move {
                info!(addr = %addr, "Connecting to Redis counter store");
                match ConnectionManager::new(client).await {
                    Ok(manager) => {
                        info!(addr = %addr, "Connected to Redis counter store");
                        Ok(manager)
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "Failed to connect to Redis counter store");
                        Err(StoreError::Connection(e.to_string()))
                    }
                }
            }
        });

        Ok(Self {
            addr,
            key_prefix: config.key_prefix().to_string(),
            script: redis::Script::new(INCREMENT_SCRIPT),
            connection,
            closed: AtomicBool::new(false),
        })
    }

    /// The Redis key holding the window for `key`.
    pub fn redis_key(&self, key: &ResourceKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> std::result::Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let outcome = self.connection.get().await;

        // close() may have run while the attempt was in flight
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        outcome
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn connect(&self) -> std::result::Result<(), StoreError> {
        self.connection().await.map(|_| ())
    }

    #[instrument(skip(self, key, window), fields(key = %key))]
    async fn increment_and_get_window(
        &self,
        key: &ResourceKey,
        window: Duration,
    ) -> std::result::Result<WindowState, StoreError> {
        let mut conn = self.connection().await?;
        let redis_key = self.redis_key(key);
        let window_ms = window.as_millis().max(1) as u64;

        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(&redis_key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "Counter increment failed");
                command_error(e)
            })?;

        Ok(WindowState {
            count: count.max(0) as u64,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn current(
        &self,
        key: &ResourceKey,
    ) -> std::result::Result<Option<WindowState>, StoreError> {
        let mut conn = self.connection().await?;
        let redis_key = self.redis_key(key);

        let mut pipe = redis::pipe();
        pipe.atomic().get(&redis_key).pttl(&redis_key);
        let (count, ttl_ms): (Option<i64>, i64) =
            pipe.query_async(&mut conn).await.map_err(command_error)?;

        Ok(count.map(|count| WindowState {
            count: count.max(0) as u64,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        }))
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn reset(&self, key: &ResourceKey) -> std::result::Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let redis_key = self.redis_key(key);

        let removed: i64 = conn.del(&redis_key).await.map_err(command_error)?;
        debug!(removed = removed, "Counter window reset");
        Ok(())
    }

    async fn reconnect(&self) -> std::result::Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        info!(addr = %self.addr, "Reconnecting to Redis counter store");
        self.connection.reset();
        self.connection().await.map(|_| ())
    }

    async fn close(&self) -> std::result::Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(addr = %self.addr, "Redis counter store already closed");
            return Ok(());
        }

        // Wait out an attempt in flight so its session is released too
        let mut conn = match self.connection.take().await {
            Some(Ok(conn)) => conn,
            Some(Err(_)) | None => {
                info!(addr = %self.addr, "Redis counter store closed before connecting");
                return Ok(());
            }
        };

        let quit: redis::RedisResult<()> = redis::cmd("QUIT").query_async(&mut conn).await;
        match quit {
            Ok(()) => {
                info!(addr = %self.addr, "Redis counter store closed");
                Ok(())
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "Error while closing Redis counter store");
                Err(command_error(e))
            }
        }
    }
}

// The `test_live_*` tests need a real server:
//   REDIS_URL=redis://127.0.0.1:6379 REDIS_PASSWORD=secret cargo test -- --ignored
// Everything else runs against an unreachable address or the scripted
// server below.
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A RESP server that records every command it receives.
    ///
    /// `AUTH` is answered after `auth_delay`, `EVALSHA` with `{1, 1000}`, and
    /// anything else with `+OK`.
    struct ScriptedServer {
        addr: SocketAddr,
        commands: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedServer {
        async fn start(auth_delay: Duration) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let commands = Arc::new(Mutex::new(Vec::new()));

            let recorded = commands.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(socket, auth_delay, recorded.clone()));
                }
            });

            Self { addr, commands }
        }

        fn config(&self) -> RateLimiterConfig {
            RateLimiterConfig::new(1000, 3, format!("redis://{}", self.addr), "secret").unwrap()
        }

        fn received(&self, name: &str) -> Vec<Vec<String>> {
            self.commands
                .lock()
                .iter()
                .filter(|command| command[0].eq_ignore_ascii_case(name))
                .cloned()
                .collect()
        }
    }

    async fn serve(
        mut socket: tokio::net::TcpStream,
        auth_delay: Duration,
        recorded: Arc<Mutex<Vec<Vec<String>>>>,
    ) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);

            while let Some((command, used)) = parse_command(&buf) {
                buf.drain(..used);
                let name = command[0].to_ascii_uppercase();
                let reply: &[u8] = match name.as_str() {
                    "AUTH" => {
                        tokio::time::sleep(auth_delay).await;
                        b"+OK\r\n"
                    }
                    "EVALSHA" => b"*2\r\n:1\r\n:1000\r\n",
                    _ => b"+OK\r\n",
                };
                recorded.lock().push(command);
                if socket.write_all(reply).await.is_err() || name == "QUIT" {
                    return;
                }
            }
        }
    }

    /// Parse one RESP array of bulk strings, returning it and the bytes used.
    fn parse_command(buf: &[u8]) -> Option<(Vec<String>, usize)> {
        let mut pos = 0;
        let count: usize = read_line(buf, &mut pos)?.strip_prefix('*')?.parse().ok()?;
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let len: usize = read_line(buf, &mut pos)?.strip_prefix('$')?.parse().ok()?;
            if buf.len() < pos + len + 2 {
                return None;
            }
            parts.push(String::from_utf8_lossy(&buf[pos..pos + len]).into_owned());
            pos += len + 2;
        }
        Some((parts, pos))
    }

    fn read_line(buf: &[u8], pos: &mut usize) -> Option<String> {
        let rest = &buf[*pos..];
        let end = rest.windows(2).position(|pair| pair == b"\r\n")?;
        *pos += end + 2;
        Some(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    fn unreachable_config() -> RateLimiterConfig {
        // Port 1 is reserved and refuses connections.
        RateLimiterConfig::new(1000, 3, "redis://127.0.0.1:1", "secret").unwrap()
    }

    fn key(id: &str) -> ResourceKey {
        ResourceKey::new("webhook", id).unwrap()
    }

    #[test]
    fn test_construction_does_not_connect() {
        let store = RedisCounterStore::new(&unreachable_config()).unwrap();
        assert!(store.connection.outcome().is_none());
    }

    #[test]
    fn test_invalid_address_is_config_error() {
        let config = RateLimiterConfig::new(1000, 3, "not a url", "secret").unwrap();
        let result = RedisCounterStore::new(&config);
        assert!(matches!(result, Err(WindowgateError::Config(_))));
    }

    #[test]
    fn test_redis_key_uses_prefix() {
        let store = RedisCounterStore::new(&unreachable_config()).unwrap();
        assert_eq!(store.redis_key(&key("abc")), "rate_limit:webhook:abc");
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails() {
        let store = RedisCounterStore::new(&unreachable_config()).unwrap();

        let result = store.connect().await;
        assert!(matches!(result, Err(StoreError::Connection(_))));

        // Checks keep failing with the same outcome until a reconnect
        let result = store
            .increment_and_get_window(&key("abc"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_outcome() {
        let store = RedisCounterStore::new(&unreachable_config()).unwrap();

        let results = futures::future::join_all((0..8).map(|_| store.connect())).await;
        let first = results[0].clone();
        assert!(first.is_err());
        for result in results {
            assert_eq!(result, first);
        }
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let store = RedisCounterStore::new(&unreachable_config()).unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();

        assert_eq!(store.connect().await, Err(StoreError::Closed));
        assert_eq!(store.reconnect().await, Err(StoreError::Closed));
    }

    #[test]
    fn test_increment_script_hash() {
        let script = redis::Script::new(INCREMENT_SCRIPT);
        let hash = script.get_hash();

        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(INCREMENT_SCRIPT.contains("INCR"));
        assert!(INCREMENT_SCRIPT.contains("PEXPIRE"));
    }

    #[tokio::test]
    async fn test_increment_invokes_script_with_key_and_window() {
        let server = ScriptedServer::start(Duration::ZERO).await;
        let store = RedisCounterStore::new(&server.config()).unwrap();

        let state = store
            .increment_and_get_window(&key("abc"), Duration::from_millis(1000))
            .await
            .unwrap();
        assert_eq!(
            state,
            WindowState {
                count: 1,
                ttl: Duration::from_millis(1000),
            }
        );

        assert_eq!(server.received("AUTH"), vec![vec!["AUTH".to_string(), "secret".to_string()]]);
        let calls = server.received("EVALSHA");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][1], redis::Script::new(INCREMENT_SCRIPT).get_hash());
        assert_eq!(calls[0][2..], ["1", "rate_limit:webhook:abc", "1000"]);

        store.close().await.unwrap();
        assert_eq!(server.received("QUIT").len(), 1);
    }

    #[tokio::test]
    async fn test_close_during_connect_releases_session() {
        let server = ScriptedServer::start(Duration::from_millis(200)).await;
        let store = Arc::new(RedisCounterStore::new(&server.config()).unwrap());

        let connecting = tokio::spawn({
            let store = store.clone();
            async move { store.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Waits for the in-flight attempt and quits its session
        store.close().await.unwrap();
        assert_eq!(server.received("QUIT").len(), 1);

        assert_eq!(connecting.await.unwrap(), Err(StoreError::Closed));
        assert_eq!(store.connect().await, Err(StoreError::Closed));
        assert_eq!(
            store
                .increment_and_get_window(&key("abc"), Duration::from_secs(1))
                .await,
            Err(StoreError::Closed)
        );
        assert!(server.received("EVALSHA").is_empty());
    }

    fn live_config() -> Option<RateLimiterConfig> {
        let url = std::env::var("REDIS_URL").ok()?;
        let password = std::env::var("REDIS_PASSWORD").unwrap_or_default();
        let password = if password.is_empty() { "unused".to_string() } else { password };
        RateLimiterConfig::new(1000, 3, url, password)
            .map(|config| config.with_key_prefix(format!("windowgate_test:{}:", std::process::id())))
            .ok()
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_live_increment_and_expire() {
        let config = live_config().expect("REDIS_URL must be set");
        let store = RedisCounterStore::new(&config).unwrap();
        store.connect().await.unwrap();

        let k = key("live");
        store.reset(&k).await.unwrap();

        let first = store
            .increment_and_get_window(&k, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(first.count, 1);
        assert!(first.ttl <= Duration::from_millis(500));

        let second = store
            .increment_and_get_window(&k, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(second.count, 2);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.current(&k).await.unwrap(), None);

        store.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_live_concurrent_increments() {
        let config = live_config().expect("REDIS_URL must be set");
        let store = Arc::new(RedisCounterStore::new(&config).unwrap());
        let k = key("concurrent");
        store.reset(&k).await.unwrap();

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    store
                        .increment_and_get_window(&k, Duration::from_secs(10))
                        .await
                        .unwrap()
                        .count
                })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
        assert_eq!(store.current(&k).await.unwrap().map(|s| s.count), Some(50));

        store.reset(&k).await.unwrap();
        store.close().await.unwrap();
    }
}
