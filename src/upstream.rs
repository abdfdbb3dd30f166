use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use russh::{
    ChannelId, ChannelStream,
    server::{Handle, Msg},
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::{
    containers::SyncSet,
    error::ServerError,
    proxy_protocol::proxy_protocol_header,
    registry::TunnelHandler,
    stream::ForwardedStream,
};

pub(crate) type UpstreamStream = ForwardedStream<ChannelStream<Msg>>;

// The routable endpoint behind one binding: the operator's SSH
// connection plus the advertised domain and target port. Owns the set of
// forwarded streams dialed through it.
pub(crate) struct Upstream {
    connection: usize,
    domain: String,
    target_port: u32,
    proxy_protocol: AtomicBool,
    closed: AtomicBool,
    handle: Handle,
    cancellation_token: CancellationToken,
    streams: Arc<SyncSet<ChannelId>>,
}

impl Upstream {
    pub(crate) fn new(
        connection: usize,
        domain: String,
        target_port: u32,
        handle: Handle,
        cancellation_token: CancellationToken,
    ) -> Self {
        Upstream {
            connection,
            domain,
            target_port,
            proxy_protocol: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handle,
            cancellation_token,
            streams: Arc::new(SyncSet::new()),
        }
    }

    pub(crate) fn domain(&self) -> &str {
        &self.domain
    }

    pub(crate) fn proxy_protocol(&self) -> bool {
        self.proxy_protocol.load(Ordering::Acquire)
    }

    // Number of live forwarded streams.
    pub(crate) fn connections(&self) -> usize {
        self.streams.len()
    }

    // Opens a new forwarded-tcpip channel back through the operator's
    // SSH connection, optionally prefixed with a PROXY protocol header
    // describing the real client. `peer` is the Minecraft client's
    // address; `local_addr` is the frontend socket's own address.
    pub(crate) async fn dial(
        self: &Arc<Self>,
        peer: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<UpstreamStream, ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::UpstreamClosed);
        }
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                self.domain.clone(),
                self.target_port,
                peer.ip().to_string(),
                peer.port().into(),
            )
            .await?;
        let id = channel.id();
        self.streams.insert(id);
        // Channel-scope requests from the operator are discarded by the
        // stream adapter.
        let mut transport = channel.into_stream();
        if self.proxy_protocol() {
            let header = proxy_protocol_header(peer, local_addr);
            if let Err(error) = transport.write_all(header.as_bytes()).await {
                self.streams.remove(&id);
                return Err(error.into());
            }
        }
        // The stream only holds a weak reference back here, so closing
        // in either direction never deadlocks on ownership.
        let streams = Arc::downgrade(&self.streams);
        Ok(ForwardedStream::new(
            transport,
            local_addr,
            Some(Box::new(move || {
                if let Some(streams) = streams.upgrade() {
                    streams.remove(&id);
                }
            })),
        ))
    }
}

impl TunnelHandler for Upstream {
    fn connection_id(&self) -> usize {
        self.connection
    }

    // Idempotent. The first call closes the owning SSH connection, which
    // cascades through every channel, and sweeps the tracked streams as
    // a best effort in case some channel survives the cascade.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancellation_token.cancel();
        let handle = self.handle.clone();
        let mut ids = Vec::with_capacity(self.streams.len());
        let _: Result<(), ()> = self.streams.each(|id| {
            ids.push(*id);
            Ok(())
        });
        tokio::spawn(async move {
            for id in ids {
                let _ = handle.close(id).await;
            }
        });
    }

    fn set_proxy_protocol(&self, enabled: bool) {
        self.proxy_protocol.store(enabled, Ordering::Release);
    }
}
