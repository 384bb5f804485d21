//! HTTP client for the zone server
//!
//! [`RemoteZones`] is the seam the sync engine talks to; [`HttpSyncClient`]
//! implements it over reqwest. Push, pull and delete retry up to three
//! times with a linearly growing delay. A 400 response is a validation
//! failure and is never retried.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use super::error::RemoteError;
use super::payload::{format_instant, parse_instant, PushResponse, TimeResponse, WireZone};
use crate::config::SyncSettings;
use crate::models::Zone;

pub const MAX_ATTEMPTS: u32 = 3;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAck {
    /// Whether the server took our copy
    pub accepted: bool,
    /// The server's timestamp for the zone after the upsert
    pub canonical_last_updated: Option<i64>,
}

/// Zones returned by a pull
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulledZones {
    pub zones: Vec<Zone>,
    /// Uuids of entries the server listed but that could not be decoded
    pub unreadable: Vec<String>,
}

/// Operations the sync engine needs from the remote service
pub trait RemoteZones: Send + Sync {
    /// Whether the server answers its health probe
    fn health(&self) -> impl Future<Output = bool> + Send;

    /// Current server time in epoch milliseconds
    fn server_time(&self) -> impl Future<Output = Result<i64, RemoteError>> + Send;

    /// Upsert a zone keyed by its uuid
    fn push(&self, zone: &Zone, group: &str)
        -> impl Future<Output = Result<PushAck, RemoteError>> + Send;

    /// Non-deleted zones of a group, optionally only those newer than `updated_after`
    fn pull(
        &self,
        group: &str,
        updated_after: Option<i64>,
    ) -> impl Future<Output = Result<PulledZones, RemoteError>> + Send;

    /// Soft-delete a zone on the server
    fn delete(&self, uuid: &str, group: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// reqwest-backed [`RemoteZones`]
#[derive(Debug, Clone)]
pub struct HttpSyncClient {
    http: Client,
    base_url: String,
    retry_base: Duration,
}

impl HttpSyncClient {
    pub fn new(base_url: &str, retry_base: Duration) -> Result<Self, RemoteError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RemoteError::NotConfigured);
        }
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            retry_base,
        })
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self, RemoteError> {
        let url = settings.server_url.as_deref().ok_or(RemoteError::NotConfigured)?;
        Self::new(url, settings.retry_base)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send with the retry policy; returns the first 2xx response
    async fn send_with_retry<F>(&self, operation: &str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = RemoteError::Status { status: 0 };
        for attempt in 1..=MAX_ATTEMPTS {
            match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::BAD_REQUEST => {
                    let body = response.text().await.unwrap_or_default();
                    warn!("{} rejected by server: {}", operation, body);
                    return Err(RemoteError::Validation { body });
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    warn!(
                        "{} failed with HTTP {} (attempt {}/{})",
                        operation, status, attempt, MAX_ATTEMPTS
                    );
                    last_error = RemoteError::Status { status };
                }
                Err(e) => {
                    warn!(
                        "{} failed: {} (attempt {}/{})",
                        operation, e, attempt, MAX_ATTEMPTS
                    );
                    last_error = RemoteError::Transport(e);
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.retry_base * attempt).await;
            }
        }
        Err(last_error)
    }
}

impl RemoteZones for HttpSyncClient {
    async fn health(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        }
    }

    async fn server_time(&self) -> Result<i64, RemoteError> {
        let response = self.http.get(self.url("/time")).send().await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
            });
        }
        let body: TimeResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        body.millis()
            .ok_or_else(|| RemoteError::InvalidResponse("time response has no usable instant".into()))
    }

    async fn push(&self, zone: &Zone, group: &str) -> Result<PushAck, RemoteError> {
        let uuid = zone.uuid().ok_or_else(|| RemoteError::Validation {
            body: format!("zone {} has no uuid", zone.id),
        })?;
        let body = WireZone::from_zone(zone, uuid, group);
        let url = self.url("/zones");

        let response = self
            .send_with_retry("Push", || self.http.post(&url).json(&body))
            .await?;
        let ack: PushResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        let accepted = ack.server_last_updated.is_none();
        let canonical = ack.last_updated.as_deref().and_then(parse_instant);
        debug!(
            "Pushed zone {} ({}): accepted={} canonical={:?}",
            zone.id, uuid, accepted, canonical
        );
        Ok(PushAck {
            accepted,
            canonical_last_updated: canonical,
        })
    }

    async fn pull(&self, group: &str, updated_after: Option<i64>) -> Result<PulledZones, RemoteError> {
        let url = self.url("/zones");
        let mut query = vec![("zone_sync", group.to_string())];
        if let Some(after) = updated_after {
            query.push(("updated_after", format_instant(after)));
        }

        let response = self
            .send_with_retry("Pull", || self.http.get(&url).query(&query))
            .await?;
        let entries: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        let total = entries.len();
        let mut pulled = PulledZones::default();
        for entry in entries {
            let uuid = entry
                .get("uuid")
                .and_then(serde_json::Value::as_str)
                .filter(|uuid| !uuid.trim().is_empty())
                .map(str::to_string);
            let zone = match serde_json::from_value::<WireZone>(entry) {
                Ok(wire) => wire.into_zone(),
                Err(e) => {
                    debug!("Undecodable remote zone {:?}: {}", uuid, e);
                    None
                }
            };
            match (zone, uuid) {
                (Some(zone), _) => pulled.zones.push(zone),
                (None, Some(uuid)) => {
                    warn!("Skipping malformed remote zone {}", uuid);
                    pulled.unreadable.push(uuid);
                }
                (None, None) => warn!("Dropping remote zone without uuid"),
            }
        }
        debug!(
            "Pulled {} of {} remote zones for {}",
            pulled.zones.len(),
            total,
            group
        );
        Ok(pulled)
    }

    async fn delete(&self, uuid: &str, group: &str) -> Result<(), RemoteError> {
        let url = self.url(&format!("/zones/{}", uuid));
        let response = self
            .send_with_retry("Delete", || {
                self.http.delete(&url).query(&[("zone_sync", group)])
            })
            .await?;
        if response.status() != StatusCode::OK {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
            });
        }
        debug!("Deleted remote zone {} in {}", uuid, group);
        Ok(())
    }
}
