//! Pooled HTTPS transports (spec §4.A). Each adapter owns one client,
//! registered here under the provider id so the lifecycle manager can
//! close every adapter's transport in one step on shutdown or on provider
//! removal. Default posture is skip-TLS-verify (hypervisor APIs are
//! reached with self-signed certificates); client-certificate auth prefers
//! inline PEM content over on-disk paths.

use std::time::Duration;

use dashmap::DashMap;
use fleet_utils::ProviderId;

use crate::db::models::Provider;
use crate::error::TransportError;

pub struct HttpsTransports {
    clients: DashMap<ProviderId, reqwest::Client>,
}

impl Default for HttpsTransports {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpsTransports {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, provider: &Provider) -> Result<reqwest::Client, TransportError> {
        if let Some(client) = self.clients.get(&provider.id) {
            return Ok(client.clone());
        }
        let client = build_client(provider)?;
        self.clients.insert(provider.id, client.clone());
        Ok(client)
    }

    /// Drops the cached client for one provider, e.g. after credentials are
    /// rotated or the provider is deleted.
    pub fn remove(&self, id: ProviderId) {
        self.clients.remove(&id);
    }

    pub async fn close_all(&self) {
        self.clients.clear();
    }
}

fn build_client(provider: &Provider) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(30));

    if let Some(identity) = load_identity(provider)? {
        builder = builder.identity(identity);
    }

    builder.build().map_err(|e| TransportError::Https(e.to_string()))
}

fn load_identity(provider: &Provider) -> Result<Option<reqwest::Identity>, TransportError> {
    if let (Some(cert), Some(key)) = (&provider.cert_content, &provider.key_content) {
        return Ok(Some(build_identity(cert.as_bytes(), key.as_bytes())?));
    }
    if let (Some(cert_path), Some(key_path)) = (&provider.cert_path, &provider.key_path) {
        let cert = std::fs::read(cert_path).map_err(|e| TransportError::Https(e.to_string()))?;
        let key = std::fs::read(key_path).map_err(|e| TransportError::Https(e.to_string()))?;
        return Ok(Some(build_identity(&cert, &key)?));
    }
    Ok(None)
}

fn build_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<reqwest::Identity, TransportError> {
    let mut combined = Vec::with_capacity(cert_pem.len() + key_pem.len());
    combined.extend_from_slice(cert_pem);
    combined.extend_from_slice(key_pem);
    reqwest::Identity::from_pem(&combined).map_err(|e| TransportError::Https(e.to_string()))
}

/// `Authorization: PVEAPIToken=<user>@<realm>!<tokenid>=<secret>`, with
/// whitespace and CR/LF stripped from both halves (spec §6).
pub fn proxmox_auth_header(api_token_id: &str, api_token: &str) -> String {
    let id: String = api_token_id.chars().filter(|c| !c.is_whitespace()).collect();
    let secret: String = api_token.chars().filter(|c| !c.is_whitespace()).collect();
    format!("PVEAPIToken={id}={secret}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxmox_header_strips_whitespace() {
        let header = proxmox_auth_header("root@pam!fleetd\r\n", " abc123\n");
        assert_eq!(header, "PVEAPIToken=root@pam!fleetd=abc123");
    }
}
