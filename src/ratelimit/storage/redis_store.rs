//! Redis-backed client state storage.
//!
//! Lets several issuer instances share one view of every client. Each client
//! is a hash with three string fields:
//!
//! | field          | encoding                                 |
//! |----------------|------------------------------------------|
//! | `num-requests` | decimal integer                          |
//! | `timeout`      | humantime duration (`0s`, `5m`, `1day`)  |
//! | `last-request` | RFC 3339 UTC timestamp, nanosecond precision |
//!
//! Updates use optimistic locking: `WATCH` the key, read it, apply the
//! transaction locally and write the result back together with a fresh TTL
//! in a `MULTI`/`EXEC` block. A concurrent write to the key aborts the
//! `EXEC`, in which case the whole read-apply-write cycle is retried.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tracing::{debug, info, trace, warn};

use super::{ClientTransaction, RateLimiterStorage};
use crate::error::{LimiterError, Result};
use crate::ratelimit::state::{ClientState, Decision};

const NUM_REQUESTS_FIELD: &str = "num-requests";
const TIMEOUT_FIELD: &str = "timeout";
const LAST_REQUEST_FIELD: &str = "last-request";

/// Where to find the Redis server holding client state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisTarget {
    /// A single, directly addressed server.
    Direct {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        db: i64,
    },
    /// The current master of a Sentinel-managed group.
    Sentinel {
        sentinel_host: String,
        sentinel_port: u16,
        sentinel_username: Option<String>,
        sentinel_password: Option<String>,
        master_name: String,
        password: Option<String>,
        db: i64,
    },
}

impl RedisTarget {
    /// A direct target without authentication on database 0.
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        RedisTarget::Direct {
            host: host.into(),
            port,
            username: None,
            password: None,
            db: 0,
        }
    }
}

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStorageConfig {
    /// Prefix prepended to every client key
    pub key_prefix: String,
    /// Expiry refreshed on every write (default: 48 hours)
    pub ttl: Duration,
    /// Attempts before a contended transaction gives up
    pub max_retries: u32,
    /// Upper bound on establishing a connection
    pub dial_timeout: Duration,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: "sms-issuer:rate-limiter:".to_string(),
            ttl: Duration::from_secs(48 * 60 * 60),
            max_retries: 5,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Client state storage shared through Redis.
pub struct RedisStorage {
    target: RedisTarget,
    config: RedisStorageConfig,
    /// Client for the server that currently accepts writes
    master: RwLock<Option<Client>>,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis and verify the server answers.
    pub async fn connect(target: RedisTarget, config: RedisStorageConfig) -> Result<Self> {
        if config.max_retries == 0 {
            return Err(LimiterError::Config(
                "Redis transactions need at least one attempt".into(),
            ));
        }

        info!(
            server = %describe(&target),
            key_prefix = %config.key_prefix,
            ttl = ?config.ttl,
            "Connecting to Redis storage"
        );

        let storage = Self {
            target,
            config,
            master: RwLock::new(None),
        };
        storage.ping().await?;

        info!("Redis storage ready");
        Ok(storage)
    }

    /// The configuration this storage was created with.
    pub fn config(&self) -> &RedisStorageConfig {
        &self.config
    }

    fn key(&self, client_key: &str) -> String {
        format!("{}{}", self.config.key_prefix, client_key)
    }

    /// Client for the write master, resolving it through Sentinel if needed.
    async fn master_client(&self) -> Result<Client> {
        let cached = self.master.read().clone();
        if let Some(client) = cached {
            return Ok(client);
        }

        let client = match &self.target {
            RedisTarget::Direct {
                host,
                port,
                username,
                password,
                db,
            } => Client::open(connection_info(host, *port, username, password, *db))?,
            RedisTarget::Sentinel {
                sentinel_host,
                sentinel_port,
                sentinel_username,
                sentinel_password,
                master_name,
                password,
                db,
            } => {
                let sentinel = Client::open(connection_info(
                    sentinel_host,
                    *sentinel_port,
                    sentinel_username,
                    sentinel_password,
                    0,
                ))?;
                let mut conn = self.dial(&sentinel).await?;
                let master: Option<(String, u16)> = redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(master_name)
                    .query_async(&mut conn)
                    .await?;
                let (host, port) = master.ok_or_else(|| {
                    LimiterError::Config(format!("Sentinel does not know master '{}'", master_name))
                })?;

                info!(
                    master_name = %master_name,
                    host = %host,
                    port = port,
                    "Resolved Redis master through Sentinel"
                );
                Client::open(connection_info(&host, port, &None, password, *db))?
            }
        };

        *self.master.write() = Some(client.clone());
        Ok(client)
    }

    async fn dial(&self, client: &Client) -> Result<MultiplexedConnection> {
        match tokio::time::timeout(
            self.config.dial_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(LimiterError::Timeout(self.config.dial_timeout)),
        }
    }

    /// Open a connection to the master. `WATCH` state belongs to a
    /// connection, so every transaction gets its own.
    async fn connect_master(&self) -> Result<MultiplexedConnection> {
        let client = self.master_client().await?;
        match self.dial(&client).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                // The master may have moved; resolve again next time.
                self.master.write().take();
                Err(e)
            }
        }
    }

    async fn run_transaction(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        transaction: &dyn ClientTransaction,
    ) -> Result<Decision> {
        let ttl_secs = self.config.ttl.as_secs().max(1);

        for attempt in 1..=self.config.max_retries {
            redis::cmd("WATCH").arg(key).query_async::<_, ()>(conn).await?;

            let fields: HashMap<String, String> = conn.hgetall(key).await?;
            let mut state = decode_state(key, &fields)?;
            let decision = transaction.apply(&mut state);
            let encoded = encode_state(&state);

            let committed: Option<()> = redis::pipe()
                .atomic()
                .hset_multiple(key, encoded.as_slice())
                .ignore()
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .ignore()
                .query_async(conn)
                .await?;

            if committed.is_some() {
                trace!(
                    key = %key,
                    attempt = attempt,
                    num_requests = state.num_requests,
                    allowed = decision.allowed,
                    "Committed Redis transaction"
                );
                return Ok(decision);
            }

            warn!(
                key = %key,
                attempt = attempt,
                max_retries = self.config.max_retries,
                "Concurrent update to client state, retrying transaction"
            );
            let backoff_ms = rand::thread_rng().gen_range(1..=10u64) * u64::from(attempt);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }

        Err(LimiterError::TransactionConflict {
            key: key.to_string(),
            attempts: self.config.max_retries,
        })
    }
}

#[async_trait]
impl RateLimiterStorage for RedisStorage {
    async fn perform_transaction(
        &self,
        client_key: &str,
        transaction: &dyn ClientTransaction,
    ) -> Result<Decision> {
        let key = self.key(client_key);
        let mut conn = self.connect_master().await?;

        self.run_transaction(&mut conn, &key, transaction)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Redis transaction failed");
                if matches!(e, LimiterError::Redis(_)) {
                    self.master.write().take();
                }
                e
            })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connect_master().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %reply, "Redis health check");
        Ok(())
    }
}

fn connection_info(
    host: &str,
    port: u16,
    username: &Option<String>,
    password: &Option<String>,
    db: i64,
) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            db,
            username: username.clone(),
            password: password.clone(),
        },
    }
}

/// Loggable description of a target, without credentials.
fn describe(target: &RedisTarget) -> String {
    match target {
        RedisTarget::Direct { host, port, db, .. } => format!("redis://{}:{}/{}", host, port, db),
        RedisTarget::Sentinel {
            sentinel_host,
            sentinel_port,
            master_name,
            ..
        } => format!("sentinel://{}:{}/{}", sentinel_host, sentinel_port, master_name),
    }
}

fn encode_state(state: &ClientState) -> Vec<(&'static str, String)> {
    vec![
        (NUM_REQUESTS_FIELD, state.num_requests.to_string()),
        (
            TIMEOUT_FIELD,
            humantime::format_duration(state.timeout).to_string(),
        ),
        (
            LAST_REQUEST_FIELD,
            state.last_request.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ),
    ]
}

/// Decode a client hash. A missing hash is the zero state.
fn decode_state(key: &str, fields: &HashMap<String, String>) -> Result<ClientState> {
    if fields.is_empty() {
        return Ok(ClientState::default());
    }

    let corrupt = |reason: String| LimiterError::CorruptState {
        key: key.to_string(),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
    };

    let num_requests = field(NUM_REQUESTS_FIELD)?
        .parse::<u64>()
        .map_err(|e| corrupt(format!("{}: {}", NUM_REQUESTS_FIELD, e)))?;
    let timeout = humantime::parse_duration(field(TIMEOUT_FIELD)?)
        .map_err(|e| corrupt(format!("{}: {}", TIMEOUT_FIELD, e)))?;
    let last_request = DateTime::parse_from_rfc3339(field(LAST_REQUEST_FIELD)?)
        .map_err(|e| corrupt(format!("{}: {}", LAST_REQUEST_FIELD, e)))?
        .with_timezone(&Utc);

    Ok(ClientState {
        num_requests,
        timeout,
        last_request,
    })
}
