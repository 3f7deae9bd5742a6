//! `ssfc` connects to a server (optionally through relays), starts remote
//! microservices over the admin channel and keeps the session alive.

use clap::Parser;
use network::circuit;
use network::endpoint::EndpointStack;
use network::{tls, version};
use services::{service_id, AdminClient, Parameters};

#[derive(Parser, Debug)]
#[command(name = "ssfc", about = "Secure Socket Funneling client")]
struct Args {
    /// Server host
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8011)]
    port: u16,

    /// Relay chain file, one host:port per line
    #[arg(short = 'b', long)]
    bounce_file: Option<std::path::PathBuf>,

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

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
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

/// Builds the (relays, server) endpoints of the session from the CLI.
async fn session_endpoints(args: &Args) -> anyhow::Result<(Vec<EndpointStack>, EndpointStack)> {
    let tls_layer = tls::layer_from_files(
        &args.ca_cert_path,
        &args.cert_path,
        &args.key_path,
        args.cipher_suites.as_deref(),
    );
    let server = EndpointStack::tcp(&args.host, args.port).with_layer(tls_layer.clone());
    let mut relays = match &args.bounce_file {
        Some(path) => circuit::read_bounce_file(path).await?,
        None => Vec::new(),
    };
    // the first hop is dialed locally and needs the client's TLS material
    if let Some(first) = relays.first_mut() {
        first.fill_defaults(&EndpointStack::new(vec![Default::default(), tls_layer]));
    }
    Ok((relays, server))
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let (relays, server) = session_endpoints(args).await?;
    tracing::info!(
        "connecting to <{}:{}> through {} relay(s)",
        args.host,
        args.port,
        relays.len()
    );
    let mut link = circuit::connect_chain(&relays, &server).await?;
    version::transport_handshake_initiate(&mut link).await?;
    let demux = network::fiber::Demux::new(link);

    let mut admin = AdminClient::connect(&demux).await?;
    let copy_id = admin
        .create_service(service_id::COPY_SERVER, Parameters::new())
        .await?;
    tracing::info!("session up, copy service running as #{}", copy_id);
    tracing::info!("running (Ctrl + C to stop)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            let _ = admin.stop_service(copy_id).await;
            demux.close();
            Ok(())
        }
        reason = demux.closed() => {
            tracing::error!("session lost ({})", reason);
            Err(reason.into())
        }
    }
}
