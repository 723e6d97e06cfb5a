use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::core::Result;
use crate::protocol::dispatch::Dispatcher;
use crate::protocol::parse::RequestHead;
use crate::protocol::response::{Ack, ReturnCode};
use crate::sync::SyncScheduler;

/// End-of-transmission byte terminating every document on the wire.
pub const EOT: u8 = 0x04;

/// Default limit of one request document, EOT excluded.
pub const DEFAULT_MAX_FRAME: usize = 1 << 20;

/// Persistent-connection server for hotel system notifications.
pub struct ProtocolServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    scheduler: Option<SyncScheduler>,
    connections: Arc<AtomicU64>,
    max_frame: usize,
}

impl ProtocolServer {
    pub async fn bind(addr: &str, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher,
            scheduler: None,
            connections: Arc::new(AtomicU64::new(0)),
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    /// Requests longer than `bytes` are answered with [`ReturnCode::RequestTooLarge`] and
    /// skipped up to their EOT.
    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes.max(1);
        self
    }

    /// Requests a sync pass after every answered request.
    pub fn with_scheduler(mut self, scheduler: SyncScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes. Open connections are served to the
    /// end of their current request.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(addr = %self.local_addr()?, "protocol server listening");
        tokio::pin!(shutdown);
        loop {
            let (socket, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted?,
            };
            let count = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(%peer, count, "connection accepted");

            let dispatcher = Arc::clone(&self.dispatcher);
            let scheduler = self.scheduler.clone();
            let max_frame = self.max_frame;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(socket, dispatcher, scheduler, max_frame).await {
                    error!(%peer, error = %e, "connection error");
                }
            });
        }
        info!("protocol server stopped");
        Ok(())
    }
}

async fn serve_connection(
    socket: TcpStream,
    dispatcher: Arc<Dispatcher>,
    scheduler: Option<SyncScheduler>,
    max_frame: usize,
) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();
    loop {
        frame.clear();
        // one byte more than the limit leaves room for the EOT
        let limit = max_frame as u64 + 1;
        if (&mut reader).take(limit).read_until(EOT, &mut frame).await? == 0 {
            debug!("connection closed by peer");
            return Ok(());
        }
        if frame.last() != Some(&EOT) && frame.len() > max_frame {
            warn!(max_frame, "request exceeds the frame limit; discarding it");
            let head = RequestHead::parse(&String::from_utf8_lossy(&frame));
            let ack = Ack::for_request(&head)
                .with_code(ReturnCode::RequestTooLarge)
                .with_message(format!("request exceeds {} bytes", max_frame));
            let mut out = ack.to_xml().into_bytes();
            out.push(EOT);
            writer.write_all(&out).await?;
            writer.flush().await?;
            if !skip_past_eot(&mut reader).await? {
                debug!("connection closed by peer");
                return Ok(());
            }
            continue;
        }
        if frame.last() == Some(&EOT) {
            frame.pop();
        } else {
            warn!("request not terminated by EOT; answering it anyway");
        }
        let doc = String::from_utf8_lossy(&frame);
        if doc.trim().is_empty() {
            continue;
        }

        let ack = dispatcher.dispatch(&doc).await;
        let mut out = ack.to_xml().into_bytes();
        out.push(EOT);
        writer.write_all(&out).await?;
        writer.flush().await?;

        if let Some(scheduler) = &scheduler
            && !scheduler.request_pass(Duration::ZERO)
        {
            debug!("sync pass already pending");
        }
    }
}

/// Consumes input up to and including the next EOT. Returns false at end of stream.
async fn skip_past_eot<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<bool> {
    loop {
        let (consumed, found) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(false);
            }
            match buf.iter().position(|b| *b == EOT) {
                Some(pos) => (pos + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(consumed);
        if found {
            return Ok(true);
        }
    }
}
