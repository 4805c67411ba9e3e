use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::coords::CoordinateMap;
use crate::error::PlayerError;

/// One bulletin-board entry; `value1` carries the stream URL.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEntry {
    pub value1: String,
    #[serde(default)]
    pub value2: Option<Value>,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
struct AnnouncePayload<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    email: &'a str,
    #[serde(rename = "friendlyName")]
    friendly_name: &'a str,
}

/// The cloud bulletin-board collaborator, behind a trait so the controller
/// and its tests never depend on a live endpoint.
pub trait BulletinBoard: Send + Sync {
    /// Newest entry for the device key; `None` when no stream is configured
    /// yet.
    fn fetch_latest_stream(&self, key: &str) -> BoxFuture<'_, Result<Option<StreamEntry>, PlayerError>>;
    /// Cloud coordinate calibration; `None` means fall back to local config.
    fn fetch_coordinate_map(&self) -> BoxFuture<'_, Result<Option<CoordinateMap>, PlayerError>>;
    /// Register or refresh this device's record.
    fn announce(
        &self,
        device_id: &str,
        email: &str,
        friendly_name: &str,
    ) -> BoxFuture<'_, Result<(), PlayerError>>;
}

/// HTTP client for the bulletin-board service.
pub struct CloudClient {
    client: Arc<reqwest::Client>,
    base_url: String,
}

impl CloudClient {
    pub fn new(client: Arc<reqwest::Client>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        CloudClient { client, base_url }
    }
}

impl BulletinBoard for CloudClient {
    fn fetch_latest_stream(
        &self,
        key: &str,
    ) -> BoxFuture<'_, Result<Option<StreamEntry>, PlayerError>> {
        let url = format!("{}/entries/{}", self.base_url, key);
        async move {
            debug!(%url, "Fetching bulletin entries");
            let response = self.client.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(PlayerError::InvalidResponse(format!(
                    "entries fetch returned {}",
                    response.status()
                )));
            }
            // newest-first; the head of the array is the current assignment
            let entries = response.json::<Vec<StreamEntry>>().await?;
            match entries.into_iter().next() {
                Some(entry) if !entry.value1.is_empty() => {
                    info!(timestamp = entry.timestamp, "Stream entry fetched");
                    Ok(Some(entry))
                }
                Some(_) => {
                    debug!("Newest entry carries an empty stream URL");
                    Ok(None)
                }
                None => {
                    debug!("No stream configured yet for this device");
                    Ok(None)
                }
            }
        }
        .boxed()
    }

    fn fetch_coordinate_map(&self) -> BoxFuture<'_, Result<Option<CoordinateMap>, PlayerError>> {
        let url = format!("{}/config/coordinates", self.base_url);
        async move {
            debug!(%url, "Fetching cloud coordinate map");
            let response = self.client.get(&url).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                debug!("No cloud coordinate map published");
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(PlayerError::InvalidResponse(format!(
                    "coordinate fetch returned {}",
                    response.status()
                )));
            }
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(None);
            }
            let map: CoordinateMap = serde_json::from_str(&body)?;
            if map.is_empty() {
                Ok(None)
            } else {
                info!("Cloud coordinate map fetched");
                Ok(Some(map))
            }
        }
        .boxed()
    }

    fn announce(
        &self,
        device_id: &str,
        email: &str,
        friendly_name: &str,
    ) -> BoxFuture<'_, Result<(), PlayerError>> {
        let url = format!("{}/devices/announce", self.base_url);
        let payload = serde_json::to_value(AnnouncePayload {
            device_id,
            email,
            friendly_name,
        });
        async move {
            let payload = payload?;
            let response = self.client.post(&url).json(&payload).send().await?;
            if response.status().is_success() {
                info!("Device announced to cloud");
                Ok(())
            } else {
                warn!(status = %response.status(), "Device announce rejected");
                Err(PlayerError::InvalidResponse(format!(
                    "announce returned {}",
                    response.status()
                )))
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_entries_decode_newest_first() {
        let raw = r#"[
            {"value1": "https://cdn.example.com/live.m3u8", "value2": null, "timestamp": 200},
            {"value1": "https://cdn.example.com/old.m3u8", "timestamp": 100}
        ]"#;
        let entries: Vec<StreamEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries[0].value1, "https://cdn.example.com/live.m3u8");
        assert_eq!(entries[0].timestamp, 200);
    }

    #[test]
    fn announce_payload_uses_wire_names() {
        let payload = serde_json::to_value(AnnouncePayload {
            device_id: "dev-1",
            email: "ops@example.com",
            friendly_name: "Lobby screen",
        })
        .unwrap();
        assert_eq!(payload["deviceId"], "dev-1");
        assert_eq!(payload["friendlyName"], "Lobby screen");
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = CloudClient::new(
            Arc::new(reqwest::Client::new()),
            "https://board.example.com/",
        );
        assert_eq!(client.base_url, "https://board.example.com");
    }
}
