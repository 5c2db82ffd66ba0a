//! Redis Backend
//!
//! One endpoint connects through a `ConnectionManager` (auto-reconnecting);
//! several endpoints are treated as a Redis Cluster.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, ConnectionInfo, FromRedisValue, IntoConnectionInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::distributed::{BackendStats, DistributedBackend};
use crate::config::DistributedConfig;
use crate::error::{Error, Result};

/// Keys requested per SCAN round trip
const SCAN_BATCH: usize = 100;

#[derive(Clone)]
enum Connection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Redis / Redis Cluster backend
pub struct RedisBackend {
    conn: Connection,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
}

/// Parse an endpoint and apply the shared credential
pub fn connection_info(endpoint: &str, credential: Option<&str>) -> Result<ConnectionInfo> {
    let mut info = endpoint.into_connection_info()?;
    if let Some(password) = credential {
        info.redis.password = Some(password.to_string());
    }
    Ok(info)
}

impl RedisBackend {
    /// Connect to the configured endpoints
    pub async fn connect(config: &DistributedConfig) -> Result<Self> {
        let credential = config.credential.as_deref();
        let conn = match config.endpoints.as_slice() {
            [] => {
                return Err(Error::Config(
                    "distributed.endpoints is empty".into(),
                ))
            }
            [endpoint] => {
                let client = redis::Client::open(connection_info(endpoint, credential)?)?;
                let manager = client.get_connection_manager().await?;
                info!(endpoint = %endpoint, "Connected to Redis");
                Connection::Single(manager)
            }
            endpoints => {
                let nodes = endpoints
                    .iter()
                    .map(|e| connection_info(e, credential))
                    .collect::<Result<Vec<_>>>()?;
                let mut builder = ClusterClientBuilder::new(nodes)
                    .connection_timeout(config.request_timeout())
                    .response_timeout(config.request_timeout());
                if let Some(password) = credential {
                    builder = builder.password(password.to_string());
                }
                let conn = builder.build()?.get_async_connection().await?;
                info!(nodes = endpoints.len(), "Connected to Redis Cluster");
                Connection::Cluster(conn)
            }
        };

        Ok(Self {
            conn,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let value = match &self.conn {
            Connection::Single(manager) => {
                let mut conn = manager.clone();
                cmd.query_async(&mut conn).await?
            }
            Connection::Cluster(cluster) => {
                let mut conn = cluster.clone();
                cmd.query_async(&mut conn).await?
            }
        };
        Ok(value)
    }
}

/// Whole seconds for SETEX, rounded up and never zero
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl DistributedBackend for RedisBackend {
    fn name(&self) -> &'static str {
        match self.conn {
            Connection::Single(_) => "redis",
            Connection::Cluster(_) => "redis-cluster",
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let value: Option<Vec<u8>> = self.query(redis::cmd("GET").arg(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn setex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let _: () = self
            .query(
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl_secs(ttl))
                    .arg(value.as_ref()),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let removed: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    // TODO: fan SCAN out to every primary when connected to a cluster; a
    // cluster SCAN only walks the node the command is routed to.
    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        self.scans.fetch_add(1, Ordering::Relaxed);

        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;

            // Keys may hash to different slots, so delete one at a time
            for key in &keys {
                let n: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
                removed += n.max(0) as u64;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern, removed, "Redis pattern invalidation");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_ttl_rounding() {
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_connection_info_applies_credential() {
        let info = connection_info("redis://10.0.0.5:6380", Some("s3cret")).unwrap();
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));

        let info = connection_info("redis://10.0.0.5:6380", None).unwrap();
        assert!(info.redis.password.is_none());
    }

    #[test]
    fn test_connection_info_rejects_garbage() {
        assert_matches!(
            connection_info("not a url", None),
            Err(Error::Redis(_))
        );
    }

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        let config = DistributedConfig::default();
        assert_matches!(
            RedisBackend::connect(&config).await.err(),
            Some(Error::Config(_))
        );
    }
}
