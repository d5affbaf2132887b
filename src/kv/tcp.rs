//! Redis-protocol store over a raw TCP connection.
//!
//! Uses a multiplexed [`ConnectionManager`], which reconnects on its own after
//! a dropped socket. Commands are issued verbatim so the `SET ... NX EX`
//! reply (`"OK"` or nil) maps straight onto the store contract.

use super::{expire_secs, prefix_pattern, SetOptions};
use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const SCAN_BATCH: usize = 200;

#[derive(Clone)]
pub struct TcpStore {
    conn: ConnectionManager,
}

impl TcpStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(TcpStore { conn })
    }

    pub async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if opts.only_if_absent {
            cmd.arg("NX");
        }
        if let Some(ttl) = opts.ttl {
            cmd.arg("EX").arg(expire_secs(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    /// Cursor through `SCAN MATCH prefix*` and delete each batch.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = prefix_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await?;
                deleted += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }
}
