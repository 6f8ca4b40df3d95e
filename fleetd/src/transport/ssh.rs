//! Pooled SSH connections (spec §4.A). Keyed by `(host, port, username,
//! sha256(auth material))` so that rotating a provider's credentials can
//! never silently reuse an old session (spec §9, "Pool key identity").
//! Dialing is serialized per key by locking the slot itself, which also
//! avoids the dial-storm the global map would otherwise invite (spec §5).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use russh::client::{self, Handle};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;

const MAX_DIAL_ATTEMPTS: u8 = 3;
const PROFILE_PATH_SUFFIX: &str = "/usr/local/bin:/snap/bin:/usr/sbin:/sbin";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_sig: String,
}

impl SshKey {
    fn new(host: &str, port: u16, username: &str, private_key: Option<&str>, password: Option<&str>) -> Self {
        let material = private_key.or(password).unwrap_or_default();
        SshKey {
            host: host.to_string(),
            port,
            username: username.to_string(),
            auth_sig: fleet_utils::fingerprint::sha256_hex(material.as_bytes()),
        }
    }
}

pub struct SshCredentials<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: Option<&'a str>,
    pub private_key: Option<&'a str>,
}

pub struct RemoteCommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl RemoteCommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    /// Host-key pinning is out of scope here: node identity is established
    /// by the DNS-match check in `dial` plus the health checker's hostname
    /// pin (spec §4.A/§4.B), not by SSH known_hosts.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct PooledConnection {
    handle: Handle<ClientHandler>,
    last_used: Instant,
}

pub struct SshPool {
    entries: DashMap<SshKey, Arc<Mutex<Option<PooledConnection>>>>,
    idle_ttl: Duration,
    connect_timeout: Duration,
}

impl SshPool {
    pub fn new(idle_ttl: Duration, connect_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_ttl,
            connect_timeout,
        }
    }

    /// Returns a handle usable for one or more `exec` calls. Reconnects if
    /// there is no cached connection or the cached one fails a no-op
    /// liveness probe.
    pub async fn acquire(&self, creds: SshCredentials<'_>) -> Result<SshSession, TransportError> {
        let key = SshKey::new(creds.host, creds.port, creds.username, creds.private_key, creds.password);
        let slot = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut guard = slot.lock().await;
        let alive = match guard.as_ref() {
            Some(conn) => Self::probe(conn).await,
            None => false,
        };
        if !alive {
            let mut last_err = None;
            let mut conn = None;
            for attempt in 1..=MAX_DIAL_ATTEMPTS {
                match Self::dial(&key, &creds, self.connect_timeout).await {
                    Ok(c) => {
                        conn = Some(c);
                        break;
                    }
                    Err(e) => {
                        warn!(host = %creds.host, attempt, error = %e, "ssh dial attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            match conn {
                Some(c) => *guard = Some(c),
                None => return Err(last_err.unwrap_or(TransportError::SshDial("exhausted retries".into()))),
            }
        } else if let Some(conn) = guard.as_mut() {
            conn.last_used = Instant::now();
        }
        drop(guard);

        Ok(SshSession { slot })
    }

    async fn probe(conn: &PooledConnection) -> bool {
        match conn.handle.channel_open_session().await {
            Ok(channel) => {
                let _ = channel.close().await;
                true
            }
            Err(_) => false,
        }
    }

    async fn dial(
        key: &SshKey,
        creds: &SshCredentials<'_>,
        connect_timeout: Duration,
    ) -> Result<PooledConnection, TransportError> {
        let addr_str = format!("{}:{}", creds.host, creds.port);
        let expected: Vec<SocketAddr> = lookup_host(&addr_str)
            .await
            .map_err(|e| TransportError::SshDial(e.to_string()))?
            .collect();
        if expected.is_empty() {
            return Err(TransportError::SshDial(format!("could not resolve {}", creds.host)));
        }

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr_str))
            .await
            .map_err(|_| TransportError::SshDial("connect timed out".into()))?
            .map_err(|e| TransportError::SshDial(e.to_string()))?;

        let peer = stream
            .peer_addr()
            .map_err(|e| TransportError::SshDial(e.to_string()))?;
        if !expected.iter().any(|a| a.ip() == peer.ip()) {
            return Err(TransportError::AddressMismatch {
                host: creds.host.to_string(),
                expected: expected.iter().map(|a| a.ip().to_string()).collect(),
                actual: peer.ip().to_string(),
            });
        }

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, ClientHandler)
            .await
            .map_err(|e| TransportError::SshSession(e.to_string()))?;

        if !Self::authenticate(&mut handle, creds).await? {
            return Err(TransportError::Auth("ssh authentication rejected".into()));
        }

        debug!(key = ?key, "ssh connection established");
        Ok(PooledConnection {
            handle,
            last_used: Instant::now(),
        })
    }

    /// public-key-if-parseable, then password-if-present; an empty method
    /// set is a fatal configuration error (spec §4.A).
    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        creds: &SshCredentials<'_>,
    ) -> Result<bool, TransportError> {
        if let Some(pk) = creds.private_key {
            if let Ok(key_pair) = russh_keys::decode_secret_key(pk, None) {
                let ok = handle
                    .authenticate_publickey(creds.username, Arc::new(key_pair))
                    .await
                    .map_err(|e| TransportError::SshSession(e.to_string()))?;
                if ok {
                    return Ok(true);
                }
            }
        }
        if let Some(pw) = creds.password {
            return handle
                .authenticate_password(creds.username, pw)
                .await
                .map_err(|e| TransportError::SshSession(e.to_string()));
        }
        Err(TransportError::NoAuthMethod)
    }

    pub async fn sweep_idle(&self) {
        let now = Instant::now();
        for entry in self.entries.iter() {
            let mut guard = entry.value().lock().await;
            let should_close = matches!(guard.as_ref(), Some(conn) if now.duration_since(conn.last_used) >= self.idle_ttl);
            if should_close {
                *guard = None;
            }
        }
    }

    pub fn spawn_idle_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.sweep_idle().await,
                }
            }
        });
    }

    /// Closes every pooled connection. Called by the lifecycle manager
    /// during the fixed shutdown sequence (spec §4.I).
    pub async fn close_all(&self) {
        for entry in self.entries.iter() {
            let mut guard = entry.value().lock().await;
            if let Some(conn) = guard.take() {
                let _ = conn
                    .handle
                    .disconnect(russh::Disconnect::ByApplication, "", "")
                    .await;
            }
        }
        self.entries.clear();
    }
}

/// A borrow of one pooled connection, valid for the duration of one or more
/// `exec` calls against it.
pub struct SshSession {
    slot: Arc<Mutex<Option<PooledConnection>>>,
}

impl SshSession {
    /// Runs `command` under a PTY with echo off, sourcing the login
    /// profile and extending `PATH` first, so tools like `lxc`/`incus`/
    /// `pveversion` resolve regardless of the login shell (spec §4.A).
    pub async fn exec(&self, command: &str) -> Result<RemoteCommandOutput, TransportError> {
        let mut guard = self.slot.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| TransportError::SshSession("connection pool entry missing".into()))?;
        conn.last_used = Instant::now();

        let mut channel = conn
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::SshSession(e.to_string()))?;
        channel
            .request_pty(false, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| TransportError::SshSession(e.to_string()))?;
        channel
            .exec(true, wrap_command(command))
            .await
            .map_err(|e| TransportError::SshSession(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                russh::ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                russh::ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(RemoteCommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status: exit_status.unwrap_or(255),
        })
    }
}

fn wrap_command(command: &str) -> String {
    format!(
        "export PATH=\"$PATH:{PROFILE_PATH_SUFFIX}\"; \
         [ -f /etc/profile ] && . /etc/profile >/dev/null 2>&1; \
         [ -f ~/.bashrc ] && . ~/.bashrc >/dev/null 2>&1; \
         [ -f ~/.bash_profile ] && . ~/.bash_profile >/dev/null 2>&1; \
         {command}"
    )
}
