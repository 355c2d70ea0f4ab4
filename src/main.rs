//! tlsrelay - TLS-terminating relay for length-prefixed frame protocols.

use clap::Parser;
use tlsrelay::{
    run_server, write_self_signed_cert, BuildInfo, Cli, Command, Error, GenCertArgs, ProxyConfig,
};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!("failed to install default crypto provider (may already be installed): {:?}", e);
    }

    let result = match cli.command {
        Command::Serve(args) => {
            tracing::debug!(?args, "Serve arguments");
            ProxyConfig::from_args(&args).and_then(serve)
        }
        Command::GenCert(args) => gen_cert(&args),
        Command::Version => {
            println!("{}", BuildInfo::get().format());
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "tlsrelay failed");
        std::process::exit(e.exit_code().into());
    }
}

fn serve(config: ProxyConfig) -> Result<(), Error> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_server(config))
}

fn gen_cert(args: &GenCertArgs) -> Result<(), Error> {
    let identity = write_self_signed_cert(&args.cert, &args.key, &args.hosts, args.force)?;
    eprintln!("Certificate written to {}", args.cert.display());
    eprintln!("Private key written to {}", args.key.display());
    println!("{}", identity.fingerprint);
    Ok(())
}
