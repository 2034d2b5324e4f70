//! Transport construction for MCP sessions.
//!
//! Pure factory: given a server's transport config, build the rmcp client
//! service. Stdio servers are spawned as child processes with the parent
//! environment plus per-server overrides (values are expanded by the
//! config loader, not here). Remote servers get a dedicated reqwest client
//! when bearer auth, a TLS-verification override, or a timeout is
//! configured, so shared client state is never mutated.

use rmcp::model::{ClientInfo, Implementation};
use rmcp::service::{RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::sse_client::{SseClientConfig, SseClientTransport};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::serve_client;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::TransportConfig;
use super::McpError;

fn client_info() -> ClientInfo {
    ClientInfo {
        meta: None,
        protocol_version: Default::default(),
        capabilities: Default::default(),
        client_info: Implementation {
            name: "triage-runtime".into(),
            title: Some("Triage Incident Agent".into()),
            version: env!("CARGO_PKG_VERSION").into(),
            icons: None,
            website_url: None,
        },
    }
}

fn connect_error(server: &str, error: impl std::fmt::Display) -> McpError {
    McpError::Connect {
        server: server.to_string(),
        message: error.to_string(),
    }
}

/// Connect to a tool server and return the running client service.
pub(crate) async fn connect(
    server_id: &str,
    transport: &TransportConfig,
) -> Result<RunningService<RoleClient, ClientInfo>, McpError> {
    match transport {
        TransportConfig::Stdio { command, args, env } => {
            tracing::debug!(server_id = %server_id, command = %command, "spawning stdio MCP server");
            let mut cmd = Command::new(command);
            cmd.args(args);
            for (key, value) in env {
                cmd.env(key, value);
            }
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null());

            let transport = TokioChildProcess::new(cmd)?;
            serve_client(client_info(), transport)
                .await
                .map_err(|e| connect_error(server_id, e))
        }
        TransportConfig::Http { url, bearer_token, tls_verify, timeout_secs } => {
            tracing::debug!(server_id = %server_id, url = %url, "connecting to MCP server over streamable HTTP");
            let mut config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
            if let Some(token) = bearer_token {
                config = config.auth_header(token.clone());
            }

            let timeout = timeout_secs.map(Duration::from_secs);
            let transport = if !tls_verify || timeout.is_some() {
                let client = build_http_client(None, *tls_verify, timeout)
                    .map_err(|e| connect_error(server_id, e))?;
                StreamableHttpClientTransport::with_client(client, config)
            } else {
                StreamableHttpClientTransport::from_config(config)
            };
            serve_client(client_info(), transport)
                .await
                .map_err(|e| connect_error(server_id, e))
        }
        TransportConfig::Sse { url, bearer_token, tls_verify, timeout_secs } => {
            tracing::debug!(server_id = %server_id, url = %url, "connecting to MCP server over SSE");
            let timeout = timeout_secs.map(Duration::from_secs);
            let transport = if bearer_token.is_some() || !tls_verify || timeout.is_some() {
                let client = build_http_client(bearer_token.as_deref(), *tls_verify, timeout)
                    .map_err(|e| connect_error(server_id, e))?;
                let config = SseClientConfig {
                    sse_endpoint: url.as_str().into(),
                    ..Default::default()
                };
                SseClientTransport::start_with_client(client, config)
                    .await
                    .map_err(|e| connect_error(server_id, e))?
            } else {
                SseClientTransport::start(url.as_str())
                    .await
                    .map_err(|e| connect_error(server_id, e))?
            };
            serve_client(client_info(), transport)
                .await
                .map_err(|e| connect_error(server_id, e))
        }
    }
}

/// Build a dedicated reqwest client for a remote transport.
///
/// Disabling certificate verification still pins the minimum protocol
/// version to TLS 1.2 so a misconfigured server cannot negotiate a
/// downgraded connection.
fn build_http_client(
    bearer_token: Option<&str>,
    tls_verify: bool,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, anyhow::Error> {
    let mut builder = reqwest::Client::builder();

    if let Some(token) = bearer_token {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut value =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))?;
        value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }

    if !tls_verify {
        builder = builder
            .danger_accept_invalid_certs(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_2);
    }

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    Ok(builder.build()?)
}
