//! Health checker subsystem (spec §4.B): an ordered subset of `{ssh, api,
//! service, hostname}` sub-checks composed into a 4-valued aggregate.
//!
//! The SSH sub-check reuses the transport pool keyed the same way the
//! owning adapter keys it, so a "shared" health check naturally reuses the
//! adapter's pooled connection without a second dial — there is no need for
//! a distinct self-owned/shared code path, the pool key identity already
//! gives us that (spec §9 "Pool key identity").

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::db::models::{Provider, ProviderType};
use crate::transport::ssh::SshCredentials;
use crate::transport::{HttpsTransports, SshPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Partial,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: &'static str,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_cores: u32,
    pub memory_total_mb: u64,
    pub swap_total_mb: u64,
    pub disk_total_mb: u64,
    pub disk_free_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub probes: Vec<ProbeResult>,
    pub hostname: Option<String>,
    pub resources: Option<ResourceSnapshot>,
}

impl HealthReport {
    fn aggregate(probes: &[ProbeResult]) -> HealthStatus {
        if probes.is_empty() {
            return HealthStatus::Unknown;
        }
        let succeeded = probes.iter().filter(|p| p.success).count();
        if succeeded == probes.len() {
            HealthStatus::Healthy
        } else if succeeded == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnabledProbes {
    pub ssh: bool,
    pub api: bool,
    pub service: bool,
    pub hostname: bool,
}

impl EnabledProbes {
    /// API probe is disabled by default for Docker (spec §4.B table).
    pub fn for_provider_type(kind: ProviderType) -> Self {
        Self {
            ssh: true,
            api: !matches!(kind, ProviderType::Docker),
            service: true,
            hostname: true,
        }
    }
}

pub struct HealthChecker {
    ssh_pool: Arc<SshPool>,
    https: Arc<HttpsTransports>,
}

impl HealthChecker {
    pub fn new(ssh_pool: Arc<SshPool>, https: Arc<HttpsTransports>) -> Self {
        Self { ssh_pool, https }
    }

    pub async fn check(&self, provider: &Provider, enabled: EnabledProbes) -> HealthReport {
        let mut probes = Vec::new();
        let mut hostname = None;

        if enabled.ssh {
            probes.push(self.probe_ssh(provider).await);
        }
        if enabled.api {
            probes.push(self.probe_api(provider).await);
        }
        if enabled.service {
            probes.push(self.probe_service(provider).await);
        }
        if enabled.hostname {
            let (probe, discovered) = self.probe_hostname(provider).await;
            probes.push(probe);
            hostname = discovered;
        }

        let resources = self.snapshot_resources(provider).await;
        let status = HealthReport::aggregate(&probes);
        HealthReport {
            status,
            probes,
            hostname,
            resources,
        }
    }

    fn credentials(provider: &Provider) -> SshCredentials<'_> {
        SshCredentials {
            host: provider.endpoint.split(':').next().unwrap_or(&provider.endpoint),
            port: provider.ssh_port,
            username: &provider.username,
            password: provider.password.as_deref(),
            private_key: provider.ssh_private_key.as_deref(),
        }
    }

    async fn probe_ssh(&self, provider: &Provider) -> ProbeResult {
        let start = Instant::now();
        let result = self.ssh_pool.acquire(Self::credentials(provider)).await;
        ProbeResult {
            name: "ssh",
            success: result.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: result.err().map(|e| e.to_string()),
        }
    }

    async fn probe_api(&self, provider: &Provider) -> ProbeResult {
        let start = Instant::now();
        let outcome = self.do_probe_api(provider).await;
        ProbeResult {
            name: "api",
            success: outcome.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: outcome.err(),
        }
    }

    async fn do_probe_api(&self, provider: &Provider) -> Result<(), String> {
        let client = self.https.get_or_create(provider).map_err(|e| e.to_string())?;
        let (path, port) = match provider.provider_type {
            ProviderType::Lxd | ProviderType::Incus => ("/1.0/instances", 8443),
            ProviderType::Proxmox => ("/api2/json/nodes", 8006),
            ProviderType::Docker => ("/version", 2375),
        };
        let host = provider.endpoint.split(':').next().unwrap_or(&provider.endpoint);
        let scheme = if matches!(provider.provider_type, ProviderType::Docker) { "http" } else { "https" };
        let url = format!("{scheme}://{host}:{port}{path}");

        let mut request = client.get(&url);
        if let (ProviderType::Proxmox, Some(id), Some(secret)) =
            (provider.provider_type, &provider.api_token_id, &provider.api_token)
        {
            request = request.header(
                "Authorization",
                crate::transport::https::proxmox_auth_header(id, secret),
            );
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        match response.status().as_u16() {
            200 => Ok(()),
            401 | 403 => Err("auth".to_string()),
            other => Err(format!("unexpected status {other}")),
        }
    }

    async fn probe_service(&self, provider: &Provider) -> ProbeResult {
        let start = Instant::now();
        let outcome = self.do_probe_service(provider).await;
        ProbeResult {
            name: "service",
            success: outcome.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: outcome.err(),
        }
    }

    async fn do_probe_service(&self, provider: &Provider) -> Result<(), String> {
        let session = self
            .ssh_pool
            .acquire(Self::credentials(provider))
            .await
            .map_err(|e| e.to_string())?;

        match provider.provider_type {
            ProviderType::Lxd => {
                let version = session.exec("lxd --version").await.map_err(|e| e.to_string())?;
                if version.stdout.trim().is_empty() {
                    return Err("lxd --version returned nothing".into());
                }
                let list = session.exec("lxc list").await.map_err(|e| e.to_string())?;
                if !list.success() {
                    return Err("lxc list failed".into());
                }
            }
            ProviderType::Incus => {
                let version = session.exec("incus --version").await.map_err(|e| e.to_string())?;
                if version.stdout.trim().is_empty() {
                    return Err("incus --version returned nothing".into());
                }
                let list = session.exec("incus list").await.map_err(|e| e.to_string())?;
                if !list.success() {
                    return Err("incus list failed".into());
                }
            }
            ProviderType::Proxmox => {
                let version = session.exec("pveversion").await.map_err(|e| e.to_string())?;
                if !version.stdout.contains("proxmox-ve") {
                    return Err("pveversion did not report proxmox-ve".into());
                }
                for unit in ["pvedaemon", "pveproxy", "pvestatd"] {
                    let check = session
                        .exec(&format!("systemctl is-active {unit}"))
                        .await
                        .map_err(|e| e.to_string())?;
                    if check.stdout.trim() != "active" {
                        return Err(format!("{unit} is not active"));
                    }
                }
            }
            ProviderType::Docker => {
                let version = session.exec("docker version").await.map_err(|e| e.to_string())?;
                if !version.stdout.contains("Server:") {
                    return Err("docker version did not report a server section".into());
                }
            }
        }
        Ok(())
    }

    /// Discovered hostname, used to pin the node identity (spec §4.B);
    /// callers compare this against the previously pinned value and flip
    /// the provider offline on mismatch (node-swap guard, spec §8 S6).
    async fn probe_hostname(&self, provider: &Provider) -> (ProbeResult, Option<String>) {
        let start = Instant::now();
        let outcome = self.ssh_pool.acquire(Self::credentials(provider)).await;
        let session = match outcome {
            Ok(s) => s,
            Err(e) => {
                return (
                    ProbeResult {
                        name: "hostname",
                        success: false,
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: Some(e.to_string()),
                    },
                    None,
                )
            }
        };
        match session.exec("hostname").await {
            Ok(out) if out.success() => {
                let discovered = out.stdout.trim().to_string();
                (
                    ProbeResult {
                        name: "hostname",
                        success: true,
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: None,
                    },
                    Some(discovered),
                )
            }
            Ok(out) => (
                ProbeResult {
                    name: "hostname",
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(out.stderr),
                },
                None,
            ),
            Err(e) => (
                ProbeResult {
                    name: "hostname",
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                },
                None,
            ),
        }
    }

    async fn snapshot_resources(&self, provider: &Provider) -> Option<ResourceSnapshot> {
        let session = self.ssh_pool.acquire(Self::credentials(provider)).await.ok()?;

        let nproc = session.exec("nproc").await.ok()?;
        let cpu_cores = nproc.stdout.trim().parse().unwrap_or(0);

        let meminfo = session.exec("cat /proc/meminfo").await.ok()?;
        let memory_total_mb = parse_meminfo_field(&meminfo.stdout, "MemTotal").unwrap_or(0);
        let swap_total_mb = parse_meminfo_field(&meminfo.stdout, "SwapTotal").unwrap_or(0);

        let df = session.exec("df -h /").await.ok()?;
        let (disk_total_mb, disk_free_mb) = parse_df_output(&df.stdout).unwrap_or((0, 0));

        Some(ResourceSnapshot {
            cpu_cores,
            memory_total_mb,
            swap_total_mb,
            disk_total_mb,
            disk_free_mb,
        })
    }
}

/// `/proc/meminfo` reports kibibytes; convert to MB.
fn parse_meminfo_field(meminfo: &str, field: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.trim_start_matches(':').trim();
        let kb_str = rest.split_whitespace().next()?;
        let kb: u64 = kb_str.parse().ok()?;
        Some(kb / 1024)
    })
}

/// `df -h /` second data line, columns: Filesystem Size Used Avail Use% Mounted.
fn parse_df_output(output: &str) -> Option<(u64, u64)> {
    let data_line = output.lines().nth(1)?;
    let cols: Vec<&str> = data_line.split_whitespace().collect();
    let total = parse_size_suffix(*cols.get(1)?)?;
    let avail = parse_size_suffix(*cols.get(3)?)?;
    Some((total, avail))
}

/// Accepts decimal (`25G`, `1.5T`) and binary (`10Gi`) suffixes; a bare
/// number is assumed to be kilobytes (spec §4.B).
fn parse_size_suffix(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number_part, unit) = value.find(|c: char| c.is_alphabetic()).map_or((value, ""), |idx| {
        value.split_at(idx)
    });
    let number: f64 = number_part.parse().ok()?;
    let multiplier_mb = match unit {
        "" => 1.0 / 1024.0,
        "K" | "k" => 1.0 / 1024.0,
        "Ki" => 1.0 / 1024.0,
        "M" | "m" => 1.0,
        "Mi" => 1.0,
        "G" | "g" => 1024.0,
        "Gi" => 1024.0,
        "T" | "t" => 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier_mb) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_binary_suffixes() {
        assert_eq!(parse_size_suffix("25G"), Some(25 * 1024));
        assert_eq!(parse_size_suffix("10Gi"), Some(10 * 1024));
        assert_eq!(parse_size_suffix("1.5T"), Some((1.5 * 1024.0 * 1024.0) as u64));
    }

    #[test]
    fn aggregate_status_rules() {
        let healthy = vec![ProbeResult { name: "a", success: true, duration_ms: 0, error: None }];
        assert_eq!(HealthReport::aggregate(&healthy), HealthStatus::Healthy);

        let mixed = vec![
            ProbeResult { name: "a", success: true, duration_ms: 0, error: None },
            ProbeResult { name: "b", success: false, duration_ms: 0, error: None },
        ];
        assert_eq!(HealthReport::aggregate(&mixed), HealthStatus::Partial);

        let all_failed = vec![ProbeResult { name: "a", success: false, duration_ms: 0, error: None }];
        assert_eq!(HealthReport::aggregate(&all_failed), HealthStatus::Unhealthy);

        assert_eq!(HealthReport::aggregate(&[]), HealthStatus::Unknown);
    }
}
