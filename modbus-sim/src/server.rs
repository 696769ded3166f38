use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::TcpListener,
    select,
    sync::{broadcast, mpsc},
};
use tracing::{error, info};
use url::Url;

use crate::{
    log::{LogSink, TracingLog},
    modbus::{
        connection::{Connection, Context},
        dispatch::Dispatcher,
        registry::SlaveRegistry,
        source::RandomSource,
    },
    shutdown::Shutdown,
    Error,
};

const DEFAULT_PORT: u16 = 502;

/// Pause after a failed accept, so a persistent error (e.g. out of file descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A simulated Modbus/TCP server, not yet bound.
///
/// By default every read is answered with random values and events go to `tracing`.
pub struct Server {
    addr: String,
    registry: SlaveRegistry,
    dispatcher: Dispatcher,
    log: Arc<dyn LogSink>,
    write_timeout: Option<Duration>,
}

/// Turns `tcp://host:port` into a `host:port` bind address.
pub fn bind_address(url: &Url) -> crate::Result<String> {
    if url.scheme() != "tcp" {
        return Err(Error::UnsupportedScheme(url.scheme().to_owned()));
    }
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::MissingHost(url.clone()))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);
    Ok(format!("{host}:{port}"))
}

impl Server {
    pub fn new(url: &Url) -> crate::Result<Self> {
        Ok(Self {
            addr: bind_address(url)?,
            registry: SlaveRegistry::new(),
            dispatcher: Dispatcher::with_source(Arc::new(RandomSource)),
            log: Arc::new(TracingLog),
            write_timeout: None,
        })
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_log<L: LogSink + 'static>(mut self, log: L) -> Self {
        self.log = Arc::new(log);
        self
    }

    /// Gives up on a client whose writes do not complete within `timeout`. Off by default.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// The handle an operator front end uses to switch slaves on and off.
    pub fn registry(&self) -> SlaveRegistry {
        self.registry.clone()
    }

    pub async fn bind(self) -> crate::Result<Listener> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");
        self.log.append(&format!("listening on {local_addr}"));

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        Ok(Listener {
            listener,
            context: Context {
                registry: self.registry,
                dispatcher: Arc::new(self.dispatcher),
                log: self.log,
                write_timeout: self.write_timeout,
            },
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        })
    }
}

/// A bound server, ready to accept clients.
pub struct Listener {
    listener: TcpListener,
    context: Context,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl Listener {
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients until `shutdown` completes, then waits for every connection to finish.
    pub async fn run(mut self, shutdown: impl Future) -> crate::Result<()> {
        select! {
            _ = self.accept() => {}
            _ = shutdown => {
                info!("shutting down");
            }
        }

        let Listener {
            notify_shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
            context,
            ..
        } = self;

        drop(notify_shutdown);
        drop(shutdown_complete_tx);

        // Every connection holds a sender; `None` means all of them are gone.
        let _ = shutdown_complete_rx.recv().await;
        context.log.append("server stopped");
        Ok(())
    }

    async fn accept(&mut self) {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(cause = %err, "failed to accept client connection");
                    self.context
                        .log
                        .append(&format!("failed to accept client connection: {err}"));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            info!(%peer, "client connected");
            self.context.log.append(&format!("client {peer} connected"));

            let shutdown = Shutdown::with_guard(
                self.notify_shutdown.subscribe(),
                self.shutdown_complete_tx.clone(),
            );
            let connection =
                Connection::new(socket, peer.to_string(), self.context.clone(), shutdown);

            tokio::spawn(async move {
                if let Err(err) = connection.run().await {
                    error!(cause = %err, %peer, "connection error");
                }
            });
        }
    }
}
