//! Managed key-value store reached over HTTPS request/response.
//!
//! Each command is POSTed to the endpoint as a JSON array of strings, e.g.
//! `["SET", "lock:stats_sync", "<token>", "NX", "EX", "900"]`, with a bearer
//! token. The reply is a JSON envelope: `{"result": ...}` on success,
//! `{"error": "..."}` on failure.
//!
//! The bearer token is taken from the explicit `KV_REST_TOKEN` setting, or
//! from the password component of the URL (`https://:token@host`), which is
//! stripped from the request URL either way.

use super::{expire_secs, prefix_pattern, SetOptions};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_BATCH: &str = "200";

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl RestStore {
    pub fn new(url: &Url, token: Option<&str>) -> Result<Self> {
        let url_token = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut endpoint = url.clone();
        endpoint
            .set_password(None)
            .map_err(|_| anyhow!("KV_URL cannot carry credentials"))?;
        endpoint
            .set_username("")
            .map_err(|_| anyhow!("KV_URL cannot carry credentials"))?;

        let token = token
            .map(str::to_string)
            .filter(|t| !t.is_empty())
            .or(url_token);
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(RestStore {
            client,
            endpoint,
            token,
        })
    }

    async fn command(&self, args: &[&str]) -> Result<Value> {
        let mut req = self.client.post(self.endpoint.clone()).json(args);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req
            .send()
            .await
            .with_context(|| format!("kv rest: {} request failed", args[0]))?;
        let status = response.status();
        let body = response.text().await?;
        let reply: Reply = serde_json::from_str(&body).with_context(|| {
            format!(
                "kv rest: undecodable {} reply (HTTP {}): {}",
                args[0],
                status,
                crate::truncate_chars(&body, 200)
            )
        })?;
        if let Some(err) = reply.error {
            bail!("kv rest: {} failed: {}", args[0], err);
        }
        if !status.is_success() {
            bail!("kv rest: {} returned HTTP {}", args[0], status);
        }
        Ok(reply.result)
    }

    pub async fn set(&self, key: &str, value: &str, opts: SetOptions) -> Result<bool> {
        let ttl;
        let mut args = vec!["SET", key, value];
        if opts.only_if_absent {
            args.push("NX");
        }
        if let Some(d) = opts.ttl {
            ttl = expire_secs(d).to_string();
            args.push("EX");
            args.push(ttl.as_str());
        }
        let result = self.command(&args).await?;
        Ok(result.as_str() == Some("OK"))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }

    /// Cursor through `SCAN MATCH prefix*` and delete each batch.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = prefix_pattern(prefix);
        let mut cursor = "0".to_string();
        let mut deleted = 0u64;
        loop {
            let reply = self
                .command(&[
                    "SCAN",
                    cursor.as_str(),
                    "MATCH",
                    pattern.as_str(),
                    "COUNT",
                    SCAN_BATCH,
                ])
                .await?;
            let (next, keys) = parse_scan_reply(&reply)?;
            if !keys.is_empty() {
                let mut args = Vec::with_capacity(keys.len() + 1);
                args.push("DEL");
                args.extend(keys.iter().map(String::as_str));
                let removed = self.command(&args).await?;
                deleted += removed.as_u64().unwrap_or(keys.len() as u64);
            }
            if next == "0" {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }
}

/// `SCAN` replies are `[cursor, [key, ...]]`; the cursor may come back as a
/// string or a number depending on the provider.
fn parse_scan_reply(reply: &Value) -> Result<(String, Vec<String>)> {
    let parts = reply
        .as_array()
        .filter(|p| p.len() == 2)
        .ok_or_else(|| anyhow!("kv rest: malformed SCAN reply: {}", reply))?;
    let cursor = match &parts[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => bail!("kv rest: malformed SCAN cursor: {}", other),
    };
    let keys = parts[1]
        .as_array()
        .ok_or_else(|| anyhow!("kv rest: malformed SCAN keys: {}", parts[1]))?
        .iter()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect();
    Ok((cursor, keys))
}
