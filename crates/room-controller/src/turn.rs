//! Relay (TURN) credential fetch.
//!
//! Credentials come from an external REST API when one is configured,
//! bounded by a timeout; any failure falls back to the static backup
//! list. The fetch is best effort: the join flow proceeds either way,
//! at worst with no relay servers.

use crate::config::Config;
use common::secret::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error};

/// One relay server entry handed to clients in `roomReady`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Response shape of the credential API.
#[derive(Debug, Deserialize)]
struct CredentialResponse {
    uris: Vec<String>,
    username: String,
    password: String,
}

/// Fetches relay credentials for joining peers.
pub struct TurnFetcher {
    client: Option<reqwest::Client>,
    api_url: Option<String>,
    api_key: Option<String>,
    backup_servers: Vec<TurnServer>,
}

impl TurnFetcher {
    /// Build a fetcher from the service config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let client = config.turn_api_url.as_ref().and_then(|_| {
            reqwest::Client::builder()
                .timeout(Duration::from_millis(config.turn_api_timeout_ms))
                .build()
                .ok()
        });
        Self {
            client,
            api_url: config.turn_api_url.clone(),
            api_key: config
                .turn_api_key
                .as_ref()
                .map(|key| key.expose_secret().to_string()),
            backup_servers: config.backup_turn_servers.clone(),
        }
    }

    /// Fetch credentials for one peer, falling back to the static list.
    pub async fn fetch(&self, client_ip: Option<IpAddr>) -> Option<Vec<TurnServer>> {
        let (Some(client), Some(api_url)) = (&self.client, &self.api_url) else {
            return self.backup();
        };

        let mut request = client.get(api_url);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }
        if let Some(ip) = client_ip {
            request = request.query(&[("ip", ip.to_string())]);
        }

        match Self::fetch_once(request).await {
            Ok(servers) => Some(servers),
            Err(error) => {
                error!(target: "room.turn", %error, "credential fetch failed, using backup");
                self.backup()
            }
        }
    }

    async fn fetch_once(request: reqwest::RequestBuilder) -> Result<Vec<TurnServer>, reqwest::Error> {
        let response: CredentialResponse =
            request.send().await?.error_for_status()?.json().await?;
        debug!(target: "room.turn", uris = response.uris.len(), "fetched relay credentials");
        Ok(vec![TurnServer {
            urls: response.uris,
            username: Some(response.username),
            credential: Some(response.password),
        }])
    }

    fn backup(&self) -> Option<Vec<TurnServer>> {
        if self.backup_servers.is_empty() {
            None
        } else {
            Some(self.backup_servers.clone())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_vars(&vars).unwrap()
    }

    #[tokio::test]
    async fn test_no_api_and_no_backup_yields_none() {
        let fetcher = TurnFetcher::from_config(&config_with(&[]));
        assert_eq!(fetcher.fetch(None).await, None);
    }

    #[tokio::test]
    async fn test_no_api_falls_back_to_backup_list() {
        let fetcher = TurnFetcher::from_config(&config_with(&[(
            "ROOM_BACKUP_TURN_SERVERS",
            r#"[{"urls": ["turn:relay.example.com:3478"], "username": "u", "credential": "c"}]"#,
        )]));

        let servers = fetcher.fetch(None).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:relay.example.com:3478"]);
    }

    #[tokio::test]
    async fn test_unreachable_api_falls_back_to_backup_list() {
        let fetcher = TurnFetcher::from_config(&config_with(&[
            // Reserved TEST-NET address; the request fails fast.
            ("ROOM_TURN_API_URL", "http://192.0.2.1:1/turn"),
            ("ROOM_TURN_API_TIMEOUT_MS", "50"),
            (
                "ROOM_BACKUP_TURN_SERVERS",
                r#"[{"urls": ["turns:relay.example.com:5349"]}]"#,
            ),
        ]));

        let servers = fetcher.fetch(None).await.unwrap();
        assert_eq!(servers[0].urls, vec!["turns:relay.example.com:5349"]);
    }

    #[test]
    fn test_turn_server_wire_shape() {
        let server = TurnServer {
            urls: vec!["turn:relay.example.com:3478".to_string()],
            username: None,
            credential: None,
        };
        let wire = serde_json::to_value(&server).unwrap();
        assert!(wire.get("username").is_none());
        assert_eq!(wire["urls"][0], "turn:relay.example.com:3478");
    }
}
