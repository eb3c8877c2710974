//! WSD discovery: resolve a discovery URL into websocket URLs and event ids.

use reqwest::Client;
use serde::Deserialize;

use crate::config::DuctConfig;
use crate::error::DuctError;
use crate::event::EventTable;

/// Discovery descriptor returned by the WSD endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Wsd {
    pub websocket_url: String,
    #[serde(default)]
    pub websocket_url_reconnect: Option<String>,
    #[serde(rename = "EVENT")]
    pub event: EventTable,
}

impl Wsd {
    /// URL used by `reconnect`; falls back to the primary URL when the
    /// descriptor has none.
    #[must_use]
    pub fn reconnect_url(&self) -> &str {
        self.websocket_url_reconnect.as_deref().unwrap_or(&self.websocket_url)
    }
}

/// Query parameters for the discovery request.
#[derive(Debug, Clone, Default)]
pub struct OpenParams {
    /// Session id sent as `uuid`; a random v4 UUID when unset.
    pub session_id: Option<String>,
    /// Extra `key=value` pairs appended in order.
    pub extra: Vec<(String, String)>,
}

impl OpenParams {
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    fn query(&self) -> Vec<(String, String)> {
        let session_id = self
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        std::iter::once(("uuid".to_owned(), session_id))
            .chain(self.extra.iter().cloned())
            .collect()
    }
}

/// Build the HTTP client used for discovery.
///
/// # Errors
///
/// Returns [`DuctError::Discovery`] if the TLS backend cannot be initialized.
pub fn http_client(config: &DuctConfig) -> Result<Client, DuctError> {
    Ok(Client::builder()
        .timeout(config.discovery_timeout())
        .user_agent(config.user_agent.as_str())
        .build()?)
}

/// Fetch the discovery descriptor from `wsd_url`.
///
/// # Errors
///
/// Returns a transport error when the request fails, the status is not 2xx,
/// or the body is not a descriptor.
pub async fn discover(client: &Client, wsd_url: &str, params: &OpenParams) -> Result<Wsd, DuctError> {
    let response = client.get(wsd_url).query(&params.query()).send().await?;
    let status = response.status();
    if !status.is_success() {
        tracing::warn!(url = wsd_url, status = status.as_u16(), "ducts: discovery rejected");
        return Err(DuctError::DiscoveryStatus { status: status.as_u16() });
    }
    let wsd = response.json::<Wsd>().await?;
    tracing::info!(
        url = wsd_url,
        websocket_url = %wsd.websocket_url,
        events = wsd.event.len(),
        "ducts: discovery resolved"
    );
    Ok(wsd)
}

#[cfg(test)]
#[path = "discovery_test.rs"]
mod tests;
