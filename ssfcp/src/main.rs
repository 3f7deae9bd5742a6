//! `ssfcp` copies files over an SSF session: `ssfcp in/*.bin host@out/`
//! pushes to the server, `ssfcp host@in/file.bin out/` fetches from it.

use clap::Parser;
use copy::{client, CopyRequest, ErrorCode};
use network::circuit;
use network::endpoint::EndpointStack;
use network::{tls, version};
use services::{service_id, AdminClient, Parameters};

#[derive(Parser, Debug)]
#[command(
    name = "ssfcp",
    about = "Secure Socket Funneling file copy",
    after_help = "Exactly one of SOURCE and DEST names the remote side as host@path."
)]
struct Args {
    /// Source pattern, remote as host@path
    source: String,

    /// Destination path, remote as host@path
    dest: String,

    /// Server port
    #[arg(short, long, default_value_t = 8011)]
    port: u16,

    /// Read data from stdin instead of files
    #[arg(short = 't', long)]
    stdin: bool,

    /// Resume partially copied files
    #[arg(long)]
    resume: bool,

    /// Descend into subdirectories
    #[arg(short = 'r', long)]
    recursive: bool,

    /// Verify a SHA-1 digest after each transfer
    #[arg(long)]
    check_integrity: bool,

    /// Maximum concurrent file transfers
    #[arg(short = 'm', long, default_value_t = 1)]
    max_parallel: u32,

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

/// The copy query implied by the CLI: the remote host plus the request.
struct Query {
    host: String,
    req: CopyRequest,
}

/// Splits `host@path`; a path without `@` (or with an empty host) is local.
fn split_remote(spec: &str) -> Option<(&str, &str)> {
    let (host, path) = spec.split_once('@')?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some((host, path))
}

fn parse_query(args: &Args) -> anyhow::Result<Query> {
    let remote_source = split_remote(&args.source);
    let remote_dest = split_remote(&args.dest);
    let (host, get_from_server, input_pattern, output_pattern) =
        match (remote_source, remote_dest) {
            (Some((host, path)), None) => (host, true, path.to_string(), args.dest.clone()),
            (None, Some((host, path))) => (host, false, args.source.clone(), path.to_string()),
            (Some(_), Some(_)) => {
                anyhow::bail!("only one side of the copy may be remote")
            }
            (None, None) => {
                tracing::error!("no remote host provided");
                return Err(common::Error::DestinationAddressRequired.into());
            }
        };
    if args.stdin && get_from_server {
        anyhow::bail!("stdin input only copies to the server");
    }
    Ok(Query {
        host: host.to_string(),
        req: CopyRequest {
            is_from_stdin: args.stdin,
            is_resume: args.resume,
            is_recursive: args.recursive,
            check_integrity: args.check_integrity,
            max_parallel: args.max_parallel,
            get_from_server,
            input_pattern,
            output_pattern,
        },
    })
}

fn main() {
    let args = Args::parse();
    common::log::init_tracing(args.verbose);

    let runtime = tokio::runtime::Runtime::new().expect("cannot start runtime");
    let code = match runtime.block_on(run(&args)) {
        Ok(code) => {
            if code.is_success() {
                tracing::info!("[ssfcp] exit 0 (success)");
            } else {
                tracing::warn!("[ssfcp] exit {} ({})", u32::from(code), code);
            }
            u32::from(code) as i32
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            e.downcast_ref::<common::Error>()
                .map(|err| err.code() as i32)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(args: &Args) -> anyhow::Result<ErrorCode> {
    let query = parse_query(args)?;

    let tls_layer = tls::layer_from_files(
        &args.ca_cert_path,
        &args.cert_path,
        &args.key_path,
        args.cipher_suites.as_deref(),
    );
    let server = EndpointStack::tcp(&query.host, args.port).with_layer(tls_layer.clone());
    let mut relays = match &args.bounce_file {
        Some(path) => circuit::read_bounce_file(path).await?,
        None => Vec::new(),
    };
    if let Some(first) = relays.first_mut() {
        first.fill_defaults(&EndpointStack::new(vec![Default::default(), tls_layer]));
    }

    tracing::info!("connecting to <{}:{}>", query.host, args.port);
    let mut link = circuit::connect_chain(&relays, &server).await?;
    version::transport_handshake_initiate(&mut link).await?;
    let demux = network::fiber::Demux::new(link);

    // the remote copy server starts on demand over the admin channel
    let mut admin = AdminClient::connect(&demux).await?;
    admin
        .create_service(service_id::COPY_SERVER, Parameters::new())
        .await?;

    let summary = tokio::select! {
        result = async {
            if query.req.get_from_server {
                client::copy_from_server(&demux, query.req.clone()).await
            } else {
                client::copy_to_server(&demux, query.req.clone()).await
            }
        } => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            demux.close();
            return Ok(ErrorCode::Interrupted);
        }
        reason = demux.closed() => {
            tracing::error!("session lost ({})", reason);
            return Ok(ErrorCode::NetworkError);
        }
    };

    tracing::info!("copy finished: {}", summary);
    demux.close();
    Ok(summary.error_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_remote() {
        assert_eq!(
            split_remote("server@/data/in.bin"),
            Some(("server", "/data/in.bin"))
        );
        assert_eq!(split_remote("plain/path.bin"), None);
        assert_eq!(split_remote("@/no/host"), None);
        // '@' later in a path component is not a host marker
        assert_eq!(split_remote("dir/user@file"), None);
    }

    #[test]
    fn test_parse_query_directions() {
        let args = Args::parse_from(["ssfcp", "in/*.bin", "server@out/"]);
        let query = parse_query(&args).unwrap();
        assert_eq!(query.host, "server");
        assert!(!query.req.get_from_server);
        assert_eq!(query.req.input_pattern, "in/*.bin");
        assert_eq!(query.req.output_pattern, "out/");

        let args = Args::parse_from(["ssfcp", "server@in/file.bin", "out/"]);
        let query = parse_query(&args).unwrap();
        assert!(query.req.get_from_server);
        assert_eq!(query.req.input_pattern, "in/file.bin");

        let args = Args::parse_from(["ssfcp", "a@x", "b@y"]);
        assert!(parse_query(&args).is_err());

        let args = Args::parse_from(["ssfcp", "x", "y"]);
        assert!(parse_query(&args).is_err());
    }
}
