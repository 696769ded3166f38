use std::path::PathBuf;

use clap::Parser;
use modbus_sim::{
    config::{Config, ServerConfig},
    Error, Result, Server, TracingLog,
};
use tokio::sync::broadcast;
use tracing::info;
use url::Url;

#[derive(Parser, Debug)]
#[clap(
    name = "modbus-sim",
    version,
    author,
    about = "A simulated Modbus/TCP server with switchable slaves"
)]
struct Cli {
    #[clap(
        env = "MODBUS_URL",
        default_value = "tcp://127.0.0.1:5020",
        value_hint = clap::ValueHint::Url
    )]
    url: Url,

    /// JSON file (or directory holding config.json) describing servers and slaves. Replaces `url`.
    #[clap(short, long, env = "MODBUS_SIM_CONFIG", value_hint = clap::ValueHint::AnyPath)]
    config: Option<PathBuf>,

    /// Unit id to bring online at startup, on every server. May be repeated.
    #[clap(short = 'u', long = "connect", value_name = "UNIT")]
    connect: Vec<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let servers = match args.config {
        Some(path) => Config::load(path)?.servers,
        None => vec![ServerConfig {
            url: args.url,
            write_timeout: None,
            slaves: vec![],
        }],
    };
    if servers.is_empty() {
        return Err("no servers configured".into());
    }

    let (notify_shutdown, _) = broadcast::channel::<()>(1);
    let mut running = Vec::with_capacity(servers.len());

    for config in servers {
        let server = Server::new(&config.url)?
            .with_log(TracingLog)
            .with_write_timeout(config.write_timeout);

        let registry = server.registry();
        for slave in &config.slaves {
            info!(
                url = %config.url,
                unit = slave.address,
                kind = slave.kind.as_deref().unwrap_or("unknown"),
                online = slave.online,
                "slave configured"
            );
            if slave.online {
                registry.connect(slave.address);
            }
        }
        for unit in &args.connect {
            registry.connect(*unit);
        }

        let listener = server.bind().await?;
        let mut shutdown = notify_shutdown.subscribe();
        running.push(tokio::spawn(listener.run(async move {
            let _ = shutdown.recv().await;
        })));
    }

    tokio::signal::ctrl_c().await?;
    let _ = notify_shutdown.send(());

    for handle in running {
        handle.await.map_err(|err| Error::from(err.to_string()))??;
    }

    Ok(())
}
