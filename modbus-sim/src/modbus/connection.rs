use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
};
use tracing::{debug, info, warn};

use super::{
    dispatch::{Dispatcher, Request},
    frame::{self, Frame, FrameError},
    registry::SlaveRegistry,
    TransactionId,
};
use crate::{
    log::{hex, LogSink},
    shutdown::Shutdown,
};

/// Everything a connection shares with the rest of the server.
#[derive(Clone)]
pub(crate) struct Context {
    pub registry: SlaveRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub log: Arc<dyn LogSink>,
    pub write_timeout: Option<Duration>,
}

/// Serves one accepted client until it goes away or the server shuts down.
///
/// Requests are answered strictly in the order they arrive.
pub(crate) struct Connection<S> {
    stream: S,
    peer: String,
    context: Context,
    shutdown: Shutdown,
    last_transaction_id: TransactionId,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, peer: String, context: Context, shutdown: Shutdown) -> Self {
        Self {
            stream,
            peer,
            context,
            shutdown,
            last_transaction_id: 0,
        }
    }

    #[tracing::instrument(
        level = "debug",
        name = "connection",
        skip(self),
        fields(peer = %self.peer)
    )]
    pub(crate) async fn run(mut self) -> crate::Result<()> {
        while !self.shutdown.is_shutdown() {
            let decoded = select! {
                decoded = frame::decode(&mut self.stream) => decoded,
                _ = self.shutdown.recv() => break,
            };

            let frame = match decoded {
                Ok(frame) => frame,
                Err(FrameError::ShortRead) => {
                    info!(peer = %self.peer, "client disconnected");
                    self.log(format!("client {} disconnected", self.peer));
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    warn!(%err, "read failed");
                    self.log(format!("client {}: {err}", self.peer));
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(%err, "dropping malformed frame");
                    self.log(format!("client {}: {err}", self.peer));
                    continue;
                }
            };

            if let Some(response) = self.respond(frame) {
                if let Err(err) = self.write(response).await {
                    warn!(%err, "write failed");
                    self.log(format!("client {}: write failed: {err}", self.peer));
                    return Err(err);
                }
            }
        }

        debug!("connection shut down");
        Ok(())
    }

    /// Produces the bytes to send back for `frame`, if any.
    fn respond(&mut self, frame: Frame) -> Option<Bytes> {
        let Frame {
            transaction_id,
            unit_id,
            function_code,
            payload,
            ..
        } = frame;

        self.log(format!(
            "req: slave id: {unit_id} fc: {function_code:02X} payload: {}",
            hex(&payload)
        ));
        self.last_transaction_id = transaction_id;

        if !self.context.registry.is_online(unit_id) {
            debug!(unit_id, "slave offline, dropping request");
            self.log(format!("req: slave id: {unit_id} is offline"));
            return None;
        }

        let request = Request {
            unit_id,
            function_code,
            payload: &payload,
        };
        match self.context.dispatcher.dispatch(&request) {
            Ok(Some(response)) => {
                self.log(format!(
                    "res: slave id: {unit_id} fc: {function_code:02X} payload: {}",
                    hex(&response)
                ));
                Some(frame::encode(self.last_transaction_id, unit_id, function_code, &response))
            }
            Ok(None) => {
                debug!(unit_id, function_code, "no response");
                None
            }
            Err(err) => {
                warn!(unit_id, function_code, %err, "dispatch failed");
                self.log(format!("req: slave id: {unit_id} fc: {function_code:02X}: {err}"));
                None
            }
        }
    }

    /// Sends `bytes` to the client.
    ///
    /// A client that stops reading blocks this call, so it gives way to the shutdown signal. The
    /// bytes are abandoned in that case and `run` sees `is_shutdown()` on its next check.
    async fn write(&mut self, bytes: Bytes) -> crate::Result<()> {
        let write_timeout = self.context.write_timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(&bytes).await?;
            stream.flush().await
        };
        let write = async move {
            match write_timeout {
                Some(limit) => tokio::time::timeout(limit, write)
                    .await
                    .map_err(|_| crate::Error::WriteTimeout(limit))??,
                None => write.await?,
            }
            Ok::<_, crate::Error>(())
        };

        select! {
            written = write => written,
            _ = self.shutdown.recv() => {
                debug!("shutdown during write, dropping response");
                Ok(())
            }
        }
    }

    fn log(&self, text: String) {
        self.context.log.append(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        log::LogBuffer,
        modbus::{
            dispatch::READ_DISCRETE_INPUTS,
            source::{BitTable, MemoryMap},
        },
    };
    use pretty_assertions::assert_eq;
    use std::{
        io,
        pin::Pin,
        task::{Context as TaskContext, Poll},
    };
    use tokio::{
        io::{duplex, DuplexStream, ReadBuf},
        sync::{broadcast, mpsc},
        task::JoinHandle,
        time::{sleep, timeout},
    };

    const READ_ONE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

    struct Harness {
        client: DuplexStream,
        registry: SlaveRegistry,
        log: LogBuffer,
        notify: broadcast::Sender<()>,
        task: JoinHandle<crate::Result<()>>,
    }

    fn start(buffer: usize, write_timeout: Option<Duration>) -> Harness {
        let (client, server) = duplex(buffer);
        let registry = SlaveRegistry::new();
        let log = LogBuffer::new(64);

        let map = Arc::new(MemoryMap::new());
        map.put_bit(BitTable::DiscreteInputs, 0, true);

        let context = Context {
            registry: registry.clone(),
            dispatcher: Arc::new(Dispatcher::with_source(map)),
            log: Arc::new(log.clone()),
            write_timeout,
        };
        let (notify, _) = broadcast::channel(1);
        let (guard, _) = mpsc::channel(1);
        let shutdown = Shutdown::with_guard(notify.subscribe(), guard);
        let task = tokio::spawn(Connection::new(server, "test".into(), context, shutdown).run());

        Harness {
            client,
            registry,
            log,
            notify,
            task,
        }
    }

    /// A client whose connection was reset: reads fail, writes vanish.
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut TaskContext<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn read_response(client: &mut DuplexStream) -> Frame {
        frame::decode(client).await.unwrap()
    }

    #[tokio::test]
    async fn answers_online_slaves() {
        let mut h = start(1024, None);
        h.registry.connect(101);

        h.client
            .write_all(&frame::encode(42, 101, READ_DISCRETE_INPUTS, &READ_ONE))
            .await
            .unwrap();
        let response = read_response(&mut h.client).await;

        assert_eq!(response.transaction_id, 42);
        assert_eq!(response.unit_id, 101);
        assert_eq!(response.function_code, READ_DISCRETE_INPUTS);
        assert_eq!(&response.payload[..], &[0x01, 0x01]);
        assert!(h.log.contains("res: slave id: 101 fc: 02 payload: 01 01"));
    }

    #[tokio::test]
    async fn ignores_offline_slaves() {
        let mut h = start(1024, None);
        h.registry.connect(7);

        h.client
            .write_all(&frame::encode(1, 101, READ_DISCRETE_INPUTS, &READ_ONE))
            .await
            .unwrap();
        h.client
            .write_all(&frame::encode(2, 7, READ_DISCRETE_INPUTS, &READ_ONE))
            .await
            .unwrap();

        // The first bytes back belong to the second request.
        let response = read_response(&mut h.client).await;
        assert_eq!(response.transaction_id, 2);
        assert_eq!(response.unit_id, 7);
        assert!(h.log.contains("slave id: 101 is offline"));
    }

    #[tokio::test]
    async fn survives_malformed_frames() {
        let mut h = start(1024, None);
        h.registry.connect(101);

        h.client
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 101])
            .await
            .unwrap();
        h.client
            .write_all(&[0x00, 0x02, 0x12, 0x34, 0x00, 0x06, 101, 0x02, 0, 0, 0, 1])
            .await
            .unwrap();
        h.client
            .write_all(&frame::encode(3, 101, READ_DISCRETE_INPUTS, &READ_ONE))
            .await
            .unwrap();

        let response = read_response(&mut h.client).await;
        assert_eq!(response.transaction_id, 3);
        assert!(h.log.contains("protocol error"));
        assert!(h.log.contains("unknown protocol identifier 0x1234"));
    }

    #[tokio::test]
    async fn drops_unknown_function_codes_and_bad_requests() {
        let mut h = start(1024, None);
        h.registry.connect(101);

        h.client
            .write_all(&frame::encode(1, 101, 0x99, &READ_ONE))
            .await
            .unwrap();
        h.client
            .write_all(&frame::encode(2, 101, READ_DISCRETE_INPUTS, &[0x00]))
            .await
            .unwrap();
        h.client
            .write_all(&frame::encode(3, 101, READ_DISCRETE_INPUTS, &READ_ONE))
            .await
            .unwrap();

        let response = read_response(&mut h.client).await;
        assert_eq!(response.transaction_id, 3);
        assert!(h.log.contains("req: slave id: 101 fc: 99"));
        assert!(h.log.contains("malformed request"));
    }

    #[tokio::test]
    async fn ends_when_the_client_goes_away() {
        let h = start(1024, None);
        drop(h.client);
        h.task.await.unwrap().unwrap();
        assert!(h.log.contains("client test disconnected"));
    }

    #[tokio::test]
    async fn ends_on_shutdown() {
        let h = start(1024, None);
        h.notify.send(()).unwrap();
        h.task.await.unwrap().unwrap();
        drop(h.client);
    }

    #[tokio::test]
    async fn stalled_clients_hit_the_write_timeout() {
        // Too small for a response, and the client never reads.
        let mut h = start(8, Some(Duration::from_millis(50)));
        h.registry.connect(101);

        h.client
            .write_all(&frame::encode(1, 101, READ_DISCRETE_INPUTS, &READ_ONE))
            .await
            .unwrap();

        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, crate::Error::WriteTimeout(_)), "{err:?}");
        assert!(h.log.contains("write failed"));
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_blocked_write() {
        // Too small for a response, the client never reads and nothing times the write out.
        let mut h = start(8, None);
        h.registry.connect(101);

        h.client
            .write_all(&frame::encode(1, 101, READ_DISCRETE_INPUTS, &READ_ONE))
            .await
            .unwrap();
        while !h.log.contains("res: slave id: 101") {
            sleep(Duration::from_millis(5)).await;
        }

        h.notify.send(()).unwrap();
        timeout(Duration::from_secs(1), h.task)
            .await
            .expect("connection kept waiting on the client")
            .unwrap()
            .unwrap();
        assert!(!h.log.contains("write failed"));
    }

    #[tokio::test]
    async fn transport_errors_end_the_connection_with_an_error() {
        let log = LogBuffer::new(8);
        let context = Context {
            registry: SlaveRegistry::new(),
            dispatcher: Arc::new(Dispatcher::empty()),
            log: Arc::new(log.clone()),
            write_timeout: None,
        };
        let (notify, _) = broadcast::channel(1);
        let (guard, _) = mpsc::channel(1);
        let shutdown = Shutdown::with_guard(notify.subscribe(), guard);

        let err = Connection::new(ResetStream, "test".into(), context, shutdown)
            .run()
            .await
            .unwrap_err();
        let err = match err {
            crate::Error::Frame(err) => err,
            other => panic!("expected a frame error, got {other:?}"),
        };
        assert!(matches!(err, FrameError::Transport(_)), "{err:?}");
        assert!(err.is_fatal());
        assert!(log.contains("client test: "));
        assert!(!log.contains("disconnected"));
    }
}
