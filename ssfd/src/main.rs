//! `ssfd` accepts authenticated links, relays circuit hops and hosts the
//! per-session microservices.

use std::sync::Arc;

use clap::Parser;
use network::circuit::{self, Circuit};
use network::endpoint::EndpointStack;
use network::{link, tls, version};
use services::{service_id, RunningService, ServiceRegistry};

#[derive(Parser, Debug, Clone)]
#[command(name = "ssfd", about = "Secure Socket Funneling server")]
struct Args {
    /// Listening address
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Listening port
    #[arg(short, long, default_value_t = 8011)]
    port: u16,

    /// CA certificate file (PEM)
    #[arg(long, default_value = "./certs/trusted/ca.crt")]
    ca_cert_path: std::path::PathBuf,

    /// Certificate file (PEM)
    #[arg(long, default_value = "./certs/certificate.crt")]
    cert_path: std::path::PathBuf,

    /// Private key file (PEM)
    #[arg(long, default_value = "./certs/private.key")]
    key_path: std::path::PathBuf,

    /// Cipher suite list, colon separated
    #[arg(long)]
    cipher_suites: Option<String>,

    /// Relay-only mode: bridge circuits, never terminate them
    #[arg(short = 'R', long)]
    relay_only: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn tls_layer(&self) -> network::endpoint::LayerParameters {
        tls::layer_from_files(
            &self.ca_cert_path,
            &self.cert_path,
            &self.key_path,
            self.cipher_suites.as_deref(),
        )
    }
}

fn main() {
    let args = Args::parse();
    common::log::init_tracing(args.verbose);

    let runtime = tokio::runtime::Runtime::new().expect("cannot start runtime");
    let code = match runtime.block_on(run(&args)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{:#}", e);
            e.downcast_ref::<common::Error>()
                .map(|err| err.code() as i32)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let endpoint = EndpointStack::tcp(&args.host, args.port).with_layer(args.tls_layer());
    let listener = link::bind(&endpoint).await?;

    let registry = Arc::new(ServiceRegistry::new());
    registry
        .register(service_id::COPY_SERVER, |demux, _parameters| {
            // bind before acking so the client can connect right away
            let server = copy::server::CopyServer::bind(demux)?;
            let task = tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::warn!("copy server ended: {:#}", e);
                }
            });
            Ok(RunningService::new(service_id::COPY_SERVER, task))
        })
        .expect("empty registry");

    // relays complete next-hop endpoints from the daemon's own material
    let defaults = EndpointStack::new(vec![Default::default(), args.tls_layer()]);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let link = match accepted {
                    Ok(link) => link,
                    Err(e) => {
                        tracing::warn!("link rejected: {:#}", e);
                        continue;
                    }
                };
                let registry = registry.clone();
                let defaults = defaults.clone();
                let relay_only = args.relay_only;
                tokio::spawn(async move {
                    if let Err(e) = handle_link(link, defaults, registry, relay_only).await {
                        tracing::debug!("session ended: {:#}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_link(
    link: link::Link,
    defaults: EndpointStack,
    registry: Arc<ServiceRegistry>,
    relay_only: bool,
) -> anyhow::Result<()> {
    let peer = link.peer().to_string();
    match circuit::accept_circuit(link, &defaults).await? {
        Circuit::Relayed => Ok(()),
        Circuit::Terminus(mut link) => {
            if relay_only {
                tracing::warn!("terminus request from {} refused in relay-only mode", peer);
                link.close().await;
                return Ok(());
            }
            version::transport_handshake_accept(&mut link).await?;
            tracing::info!("session with {} established", peer);
            let demux = network::fiber::Demux::new(link);
            services::run_admin_server(demux.clone(), registry).await?;
            let reason = demux.closed().await;
            tracing::info!("session with {} closed ({})", peer, reason);
            Ok(())
        }
    }
}
