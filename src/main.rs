use anyhow::Result;
use clap::{Parser, Subcommand};
use rift_cli::client::{Client, ClientOptions};
use rift_cli::server::Server;
use rift_cli::shared::{SessionLimits, ShutdownHandle};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the public relay server.
    Server {
        /// Listen address for control connections, like 1.2.3.4:7835.
        #[clap(short, long, default_value = "0.0.0.0:7835")]
        listen: String,

        /// Optional password for authentication.
        #[clap(short, long, env = "RIFT_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Only allow this port and password, like "1000 password". Overrides --password.
        #[clap(short = 'P', long = "port-password", value_name = "PORT PASSWORD")]
        port_passwords: Vec<String>,
    },

    /// Exposes a local service through a remote server.
    Client {
        /// Address of the relay server, like 1.2.3.4:7835.
        #[clap(short, long, env = "RIFT_SERVER")]
        server: String,

        /// Optional password for authentication.
        #[clap(short, long, env = "RIFT_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Public port to bind on the server; 0 lets the server choose.
        #[clap(short = 'P', long, default_value_t = 0)]
        server_port: u16,

        /// Subdomain to bind, on servers that route domains.
        #[clap(short = 'D', long, conflicts_with = "server_port")]
        server_domain: Option<String>,

        /// Address of the service to expose, like 127.0.0.1:8080.
        #[clap(short = 'c', long, value_name = "ADDR")]
        client_server: String,

        /// Idle timeout of relayed TCP connections, in seconds; 0 disables it.
        #[clap(long, default_value_t = 60)]
        tcp_timeout: u64,

        /// Maximum lifetime of relayed TCP connections, in seconds; 0 means unbounded.
        #[clap(long, default_value_t = 0)]
        tcp_deadline: u64,

        /// Idle lifetime of relayed UDP flows, in seconds.
        #[clap(long, default_value_t = 60)]
        udp_deadline: u64,
    },
}

#[tokio::main]
async fn run(command: Command) -> Result<()> {
    match command {
        Command::Server {
            listen,
            password,
            port_passwords,
        } => {
            let server = Server::new(&listen, password.as_deref(), &port_passwords)?;
            shutdown_on_signal(server.shutdown_handle());
            server.listen().await?;
        }
        Command::Client {
            server,
            password,
            server_port,
            server_domain,
            client_server,
            tcp_timeout,
            tcp_deadline,
            udp_deadline,
        } => {
            let client = Client::new(ClientOptions {
                server,
                password,
                server_port,
                server_domain,
                client_server,
                limits: SessionLimits::from_secs(tcp_timeout, tcp_deadline, udp_deadline),
            })
            .await?;
            shutdown_on_signal(client.shutdown_handle());
            client.listen().await?;
        }
    }

    Ok(())
}

fn shutdown_on_signal(handle: ShutdownHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run(Args::parse().command)
}
