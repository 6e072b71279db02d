use std::path::PathBuf;

use clap::Parser;
use serde_json::{json, Value};
use tracing::{info, warn};

use dockgate_proxy::{
    as_json_request, logging, FilterFailure, Listener, LogLevel, Proxy, ProxyError, Request,
    Response,
};

#[derive(Debug, Parser)]
#[command(name = "dockgate", about = "Filtering proxy for the Docker API socket")]
struct Cli {
    /// Unix socket to listen on
    #[arg(long, default_value = "/var/run/docker.filtered.sock")]
    unix: PathBuf,

    /// TCP address to listen on, e.g. 127.0.0.1:2375
    #[arg(long)]
    tcp: Option<String>,

    /// Docker daemon socket to forward to
    #[arg(long, default_value = "/var/run/docker.sock")]
    target: PathBuf,

    /// Log level: debug, info, warn, error, none
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    let cli = Cli::parse();
    logging::init(cli.log_level);

    let proxy = Proxy::new(Proxy::unix_dialer(cli.target.clone()));

    let mut bound = false;
    match Listener::bind_unix(&cli.unix) {
        Ok(listener) => {
            proxy.add_listener("unix", listener);
            bound = true;
        }
        Err(err) => warn!("failed to bind the Unix socket: {err}"),
    }
    if let Some(tcp) = &cli.tcp {
        match Listener::bind_tcp(tcp).await {
            Ok(listener) => {
                proxy.add_listener("tcp", listener);
                bound = true;
            }
            Err(err) => warn!("failed to bind the TCP socket: {err}"),
        }
    }
    if !bound {
        return Err(ProxyError::Config("no listener could be bound".to_string()));
    }

    // Tag containers created through this proxy.
    proxy.handle(
        "/containers/create",
        as_json_request(|mut body: Value| {
            let labels = body
                .as_object_mut()
                .ok_or_else(|| FilterFailure::critical("JSON", "payload is not an object"))?
                .entry("Labels")
                .or_insert_with(|| json!({}));
            labels
                .as_object_mut()
                .ok_or_else(|| FilterFailure::critical("JSON", "Labels is not an object"))?
                .insert("com.dockgate.filtered".to_string(), json!("1"));
            Ok(body)
        }),
    )?;

    let password = regex::Regex::new(r#""password":".+?""#)
        .map_err(|err| ProxyError::Config(err.to_string()))?;
    proxy.handle("/.*", move |request: &Request, body: &[u8]| {
        let mut payload = String::from_utf8_lossy(body).into_owned();
        if request.line.target.ends_with("/auth") {
            payload = password
                .replace_all(&payload, r#""password":"***""#)
                .into_owned();
        }
        info!(
            method = %request.line.method,
            target = %request.line.target,
            body = %payload,
            "request"
        );
        Ok(None)
    })?;

    proxy.filter_responses("/.*", |response: &Response, body: &[u8]| {
        info!(
            status = response.line.status_code,
            size = body.len(),
            "response"
        );
        Ok(None)
    })?;

    proxy.process().await
}
