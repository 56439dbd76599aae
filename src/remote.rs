//! Request/response side channel to the server.
//!
//! Per-device preferences survive on the server even when the local device
//! is wiped; the same channel reads and moves the playlist position and
//! the mixer volume. Everything here is a round-trip and must be bounded
//! with [`bounded`] by callers on the recovery path.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, trace};

use crate::{Error, Result};

/// User-initiated transport control forwarded to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Play,
    Pause,
    Seek(Duration),
    /// Relative playlist move; `+1` next, `-1` previous.
    Skip(i32),
}

/// Server side channel, keyed by player id.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_preference(&self, player: &str, key: &str) -> Result<Option<String>>;

    async fn set_preference(&self, player: &str, key: &str, value: &str) -> Result<()>;

    /// Index of the current track in the server playlist.
    async fn playlist_index(&self, player: &str) -> Result<u32>;

    /// Move the server to `index` at `offset`, landing paused if asked.
    async fn playlist_jump(
        &self,
        player: &str,
        index: u32,
        offset: Duration,
        paused: bool,
    ) -> Result<()>;

    /// Mixer volume, 0-100.
    async fn volume(&self, player: &str) -> Result<u8>;

    async fn set_volume(&self, player: &str, volume: u8) -> Result<()>;

    /// Server's view of the elapsed time in the current track.
    async fn current_time(&self, player: &str) -> Result<Duration>;

    async fn control(&self, player: &str, control: Control) -> Result<()>;
}

/// Run `fut` with a deadline, mapping expiry to [`Error::RemoteStoreTimeout`].
pub async fn bounded<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::RemoteStoreTimeout)?
}

// ============================================================================
// JSON-RPC client
// ============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Client for the server's `slim.request` JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct JsonRpcStore {
    client: Client,
    url: String,
}

impl JsonRpcStore {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("slimlink/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn request(&self, player: &str, args: Vec<Value>) -> Result<Value> {
        let body = json!({
            "id": 1,
            "method": "slim.request",
            "params": [player, args],
        });
        trace!(%body, "TX: RPC");
        let resp: RpcResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = resp.error {
            return Err(Error::Protocol(format!("RPC error: {err}")));
        }
        let result = resp.result.unwrap_or(Value::Null);
        trace!(%result, "RX: RPC");
        Ok(result)
    }
}

#[async_trait]
impl RemoteStore for JsonRpcStore {
    #[instrument(skip_all, fields(key = %key))]
    async fn get_preference(&self, player: &str, key: &str) -> Result<Option<String>> {
        let result = self
            .request(player, vec!["playerpref".into(), key.into(), "?".into()])
            .await?;
        Ok(field_str(&result, "_p2").filter(|v| !v.is_empty()))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set_preference(&self, player: &str, key: &str, value: &str) -> Result<()> {
        self.request(player, vec!["playerpref".into(), key.into(), value.into()])
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn playlist_index(&self, player: &str) -> Result<u32> {
        let result = self
            .request(player, vec!["playlist".into(), "index".into(), "?".into()])
            .await?;
        field_f64(&result, "_index")
            .filter(|i| *i >= 0.0)
            .map(|i| i as u32)
            .ok_or_else(|| Error::Protocol("playlist index missing".into()))
    }

    #[instrument(skip_all, fields(index = index, paused = paused))]
    async fn playlist_jump(
        &self,
        player: &str,
        index: u32,
        offset: Duration,
        paused: bool,
    ) -> Result<()> {
        let mut args: Vec<Value> = vec!["playlist".into(), "jump".into(), index.into()];
        args.push("0".into());
        args.push(if paused { "1" } else { "0" }.into());
        args.push(json!({ "timeOffset": offset.as_secs_f64() }));
        debug!(offset_ms = offset.as_millis() as u64, "Playlist jump");
        self.request(player, args).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn volume(&self, player: &str) -> Result<u8> {
        let result = self
            .request(player, vec!["mixer".into(), "volume".into(), "?".into()])
            .await?;
        field_f64(&result, "_volume")
            .map(|v| v.abs().clamp(0.0, 100.0) as u8)
            .ok_or_else(|| Error::Protocol("volume missing".into()))
    }

    #[instrument(skip_all, fields(volume = volume))]
    async fn set_volume(&self, player: &str, volume: u8) -> Result<()> {
        self.request(
            player,
            vec!["mixer".into(), "volume".into(), volume.min(100).to_string().into()],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn current_time(&self, player: &str) -> Result<Duration> {
        let result = self
            .request(player, vec!["time".into(), "?".into()])
            .await?;
        field_f64(&result, "_time")
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| Error::Protocol("time missing".into()))
    }

    #[instrument(skip_all, fields(control = ?control))]
    async fn control(&self, player: &str, control: Control) -> Result<()> {
        let args: Vec<Value> = match control {
            Control::Play => vec!["play".into()],
            Control::Pause => vec!["pause".into(), "1".into()],
            Control::Seek(to) => vec!["time".into(), format!("{:.3}", to.as_secs_f64()).into()],
            Control::Skip(n) => vec![
                "playlist".into(),
                "index".into(),
                format!("{n:+}").into(),
            ],
        };
        self.request(player, args).await?;
        Ok(())
    }
}

/// Read a result field that the server may send as a string or a number.
fn field_f64(result: &Value, key: &str) -> Option<f64> {
    match result.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_str(result: &Value, key: &str) -> Option<String> {
    match result.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_accept_strings_and_numbers() {
        let v = json!({"_index": "3", "_time": 12.5, "_volume": "-40", "_p2": 7});
        assert_eq!(field_f64(&v, "_index"), Some(3.0));
        assert_eq!(field_f64(&v, "_time"), Some(12.5));
        assert_eq!(field_f64(&v, "_volume"), Some(-40.0));
        assert_eq!(field_str(&v, "_p2").as_deref(), Some("7"));
        assert_eq!(field_f64(&v, "_missing"), None);
        assert_eq!(field_f64(&Value::Null, "_index"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_maps_expiry_to_timeout_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        };
        let err = bounded(Duration::from_secs(10), slow).await.unwrap_err();
        assert!(matches!(err, Error::RemoteStoreTimeout));

        let fast = async { Ok(2) };
        assert_eq!(bounded(Duration::from_secs(10), fast).await.unwrap(), 2);
    }
}
