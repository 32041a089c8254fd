//! TFTP Suite - Main executable
//!
//! One binary for the three roles: TFTP server, TFTP client (read/write), and
//! the error simulator relay placed between them.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use errsim::{Alteration, ErrorSimulator, SimulatorConfig};
use tftp::{ClientConfig, TftpClient, TftpServer, TftpServerConfig, TransferConfig, TransferMode};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER_BIND: &str = "0.0.0.0:6900"; // unprivileged; run as root with 0.0.0.0:69 for the standard port
const DEFAULT_ERRSIM_BIND: &str = "0.0.0.0:2300";
const DEFAULT_ERRSIM_PORT: u16 = 2300;
const DEFAULT_ROOT: &str = "./server_files";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP Suite - RFC 1350 server, client and error simulator",
    example = "Serve ./server_files on port 6900:\n  {command_name} server --root ./server_files",
    example = "Download a file:\n  {command_name} read boot.img ./boot.img --server 127.0.0.1:6900",
    example = "Upload a text file through the error simulator:\n  {command_name} write ./notes.txt notes.txt --mode netascii --via-errsim",
    example = "Drop the client's ACK #2 and duplicate DATA #3:\n  {command_name} errsim -a c2s:2:drop -a s2c:3:duplicate=100"
)]
struct Cli {
    #[argh(switch, short = 'v', description = "log every packet (debug level)")]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Server(ServerArgs),
    Read(ReadArgs),
    Write(WriteArgs),
    Errsim(ErrsimArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "server", description = "run the TFTP server")]
struct ServerArgs {
    #[argh(
        option,
        short = 'b',
        description = "server bind address",
        default = "DEFAULT_SERVER_BIND.to_string()"
    )]
    bind: String,

    #[argh(
        option,
        short = 'r',
        description = "directory files are served from and written to",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(option, description = "local IP address for transfer sockets")]
    local_ip: Option<IpAddr>,

    #[argh(option, description = "retransmission timeout in milliseconds", default = "1500")]
    timeout_ms: u64,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "read", description = "download a file (RRQ)")]
struct ReadArgs {
    #[argh(positional, description = "file name on the server")]
    remote: String,

    #[argh(positional, description = "local destination (defaults to the remote name)")]
    local: Option<PathBuf>,

    #[argh(option, short = 's', description = "server address", default = "default_server()")]
    server: SocketAddr,

    #[argh(option, short = 'm', description = "transfer mode: octet or netascii", default = "TransferMode::Octet")]
    mode: TransferMode,

    #[argh(switch, description = "send the request to the error simulator port instead")]
    via_errsim: bool,

    #[argh(option, description = "retransmission timeout in milliseconds", default = "1500")]
    timeout_ms: u64,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "write", description = "upload a file (WRQ)")]
struct WriteArgs {
    #[argh(positional, description = "local file to upload")]
    local: PathBuf,

    #[argh(positional, description = "file name on the server (defaults to the local file name)")]
    remote: Option<String>,

    #[argh(option, short = 's', description = "server address", default = "default_server()")]
    server: SocketAddr,

    #[argh(option, short = 'm', description = "transfer mode: octet or netascii", default = "TransferMode::Octet")]
    mode: TransferMode,

    #[argh(switch, description = "send the request to the error simulator port instead")]
    via_errsim: bool,

    #[argh(option, description = "retransmission timeout in milliseconds", default = "1500")]
    timeout_ms: u64,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "errsim", description = "run the error simulator relay")]
struct ErrsimArgs {
    #[argh(
        option,
        short = 'l',
        description = "address clients send requests to",
        default = "DEFAULT_ERRSIM_BIND.to_string()"
    )]
    listen: String,

    #[argh(option, short = 's', description = "server request address", default = "default_server()")]
    server: SocketAddr,

    #[argh(
        option,
        short = 'a',
        description = "alteration as <c2s|s2c>:<req|block>:<op>[,<op>...]; ops: drop, delay=MS, duplicate=MS, byte=I/V, block=N, opcode=N, mode=S, filename=S, size=N, tid=PORT, addr=IP"
    )]
    alter: Vec<Alteration>,
}

fn default_server() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6900))
}

fn transfer_config(timeout_ms: u64, local_bind: Option<IpAddr>) -> TransferConfig {
    TransferConfig {
        timeout: Duration::from_millis(timeout_ms),
        local_bind,
        ..Default::default()
    }
}

fn client_config(server: SocketAddr, via_errsim: bool, mode: TransferMode, timeout_ms: u64) -> ClientConfig {
    let server = if via_errsim {
        SocketAddr::new(server.ip(), DEFAULT_ERRSIM_PORT)
    } else {
        server
    };
    ClientConfig {
        server,
        mode,
        transfer_config: transfer_config(timeout_ms, None),
    }
}

/// Run `service` until it ends on its own or Ctrl-C requests a graceful stop
async fn run_until_ctrl_c<F>(name: &str, service: F, shutdown: watch::Sender<bool>) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(service);
    tokio::select! {
        res = &mut service => res,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Stopping {}", name);
            let _ = shutdown.send(true);
            service.await
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    tokio::fs::create_dir_all(&args.root)
        .await
        .with_context(|| format!("Failed to create root directory {}", args.root.display()))?;

    let mut server = TftpServer::new(TftpServerConfig {
        bind_address: args.bind,
        root_directory: args.root,
        transfer_config: transfer_config(args.timeout_ms, args.local_ip),
    });
    let (shutdown, receiver) = watch::channel(false);
    run_until_ctrl_c("TFTP server", server.run_until(receiver), shutdown).await
}

async fn run_read(args: ReadArgs) -> Result<()> {
    let client = TftpClient::new(client_config(args.server, args.via_errsim, args.mode, args.timeout_ms));
    let local = args.local.unwrap_or_else(|| PathBuf::from(&args.remote));

    let summary = client.read_file(&args.remote, &local).await?;
    tracing::info!(
        "Transfer complete: {} bytes in {} blocks",
        summary.bytes,
        summary.blocks
    );
    Ok(())
}

async fn run_write(args: WriteArgs) -> Result<()> {
    let remote = match args.remote {
        Some(remote) => remote,
        None => args
            .local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("Cannot derive a remote name from {}", args.local.display()))?,
    };
    let client = TftpClient::new(client_config(args.server, args.via_errsim, args.mode, args.timeout_ms));

    let summary = client.write_file(&args.local, &remote).await?;
    tracing::info!(
        "Transfer complete: {} bytes in {} blocks",
        summary.bytes,
        summary.blocks
    );
    Ok(())
}

async fn run_errsim(args: ErrsimArgs) -> Result<()> {
    for alteration in &args.alter {
        tracing::info!("Scheduled alteration {}", alteration);
    }

    let mut simulator = ErrorSimulator::new(
        SimulatorConfig {
            listen_address: args.listen,
            server_address: args.server,
            ..Default::default()
        },
        args.alter.into_iter().collect(),
    );
    let (shutdown, receiver) = watch::channel(false);
    run_until_ctrl_c("error simulator", simulator.run_until(receiver), shutdown).await
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Read(args) => run_read(args).await,
        Command::Write(args) => run_write(args).await,
        Command::Errsim(args) => run_errsim(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_defaults() {
        let cli = Cli::from_args(&["tftp-suite"], &["server"]).unwrap();
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.bind, DEFAULT_SERVER_BIND);
        assert_eq!(args.root, PathBuf::from(DEFAULT_ROOT));
        assert_eq!(args.timeout_ms, 1500);
    }

    #[test]
    fn test_parse_read_with_mode() {
        let cli = Cli::from_args(&["tftp-suite"], &["-v", "read", "notes.txt", "--mode", "NETASCII", "--via-errsim"])
            .unwrap();
        assert!(cli.verbose);
        let Command::Read(args) = cli.command else {
            panic!("expected read subcommand");
        };
        assert_eq!(args.remote, "notes.txt");
        assert!(args.local.is_none());
        assert_eq!(args.mode, TransferMode::NetAscii);

        let config = client_config(args.server, args.via_errsim, args.mode, args.timeout_ms);
        assert_eq!(config.server, SocketAddr::from(([127, 0, 0, 1], DEFAULT_ERRSIM_PORT)));
    }

    #[test]
    fn test_parse_errsim_alterations() {
        let cli = Cli::from_args(&["tftp-suite"], &["errsim", "-a", "c2s:2:drop", "-a", "s2c:req:mode=x"]).unwrap();
        let Command::Errsim(args) = cli.command else {
            panic!("expected errsim subcommand");
        };
        assert_eq!(args.alter.len(), 2);
        assert!(args.alter[0].drop);
        assert_eq!(args.server.to_string(), "127.0.0.1:6900");
    }

    #[test]
    fn test_bad_alteration_is_rejected() {
        assert!(Cli::from_args(&["tftp-suite"], &["errsim", "-a", "sideways:2:drop"]).is_err());
    }
}
