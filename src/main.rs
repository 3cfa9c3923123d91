#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use bcs_webhook_server::{randhostport, Admission, Registry};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;

#[derive(Parser)]
#[clap(name = "bcs-webhook-server", version)]
struct Args {
    /// The tracing filter used for logs
    #[clap(long, env = "BCS_WEBHOOK_LOG", default_value = "info")]
    log_level: kubert::LogFilter,

    /// The logging format
    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    /// Enables the random hostport plugin with the given JSON config
    #[clap(long)]
    randhostport_config: Option<PathBuf>,

    /// How long to wait for plugin informers to sync before giving up
    #[clap(long, default_value = "60s", parse(try_from_str = humantime::parse_duration))]
    informer_sync_timeout: Duration,

    /// Periodically logs host port usage
    #[clap(long, parse(try_from_str = humantime::parse_duration))]
    dump_ports_every: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        server,
        randhostport_config,
        informer_sync_timeout,
        dump_ports_every,
    } = Args::parse();

    let mut rt = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .with_server(server)
        .build()
        .await?;

    let mut registry = Registry::default();
    let mut injector = None;
    if let Some(path) = randhostport_config {
        let config = randhostport::Config::load(&path)?;
        let hostports = Arc::new(
            randhostport::HostPortInjector::init(&config, &mut rt, informer_sync_timeout).await?,
        );
        if let Some(every) = dump_ports_every {
            hostports.dump_ports(every);
        }
        registry.register(hostports.clone());
        injector = Some(hostports);
    }
    if registry.is_empty() {
        tracing::warn!("no webhook plugins are enabled; all objects will be admitted unchanged");
    }

    let rt = rt.spawn_server(Admission::new(Arc::new(registry)));

    // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks
    // to complete before exiting.
    if rt.run().await.is_err() {
        bail!("aborted");
    }

    if let Some(injector) = injector {
        injector.close().await;
    }

    Ok(())
}
