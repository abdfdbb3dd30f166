use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::TcpStream,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    MineholeServer,
    containers::SyncMap,
    forwarder::pump,
    matcher::Matcher,
    protocol::{Handshake, NEXT_STEP_LOGIN, Packet, disconnect_packet},
};

pub(crate) const BAN_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const KICK_MESSAGE: &str = "Server is not available";
// Give the TCP stack a moment to flush the kick before the socket drops.
const KICK_FLUSH_DELAY: Duration = Duration::from_millis(10);

// Source IP -> ban expiry for clients caught requesting literal IP
// addresses. Swept periodically so the map stays bounded.
pub(crate) struct BanCache {
    entries: SyncMap<IpAddr, Instant>,
}

impl BanCache {
    pub(crate) fn new() -> Self {
        BanCache {
            entries: SyncMap::new(),
        }
    }

    pub(crate) fn ban(&self, ip: IpAddr, duration: Duration) {
        self.entries.insert(ip, Instant::now() + duration);
    }

    pub(crate) fn is_banned(&self, ip: &IpAddr) -> bool {
        self.entries.get(ip).is_some_and(|until| until > Instant::now())
    }

    // Drops entries whose expiry is not in the future.
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        self.entries.filter(|_, until| *until > now);
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// Domain allow/deny policy applied before resolving. An explicit
// whitelist match overrides a blacklist match.
pub(crate) fn host_allowed(
    whitelist: Option<&Matcher<()>>,
    blacklist: Option<&Matcher<()>>,
    host: &str,
) -> bool {
    let whitelisted = whitelist.is_some_and(|list| list.match_domain(host).is_some());
    if blacklist.is_some_and(|list| list.match_domain(host).is_some()) && !whitelisted {
        return false;
    }
    match whitelist {
        Some(_) => whitelisted,
        None => true,
    }
}

async fn reject(stream: &mut TcpStream, next_step: i32) {
    if next_step == NEXT_STEP_LOGIN {
        let _ = disconnect_packet(KICK_MESSAGE).write(stream).await;
        sleep(KICK_FLUSH_DELAY).await;
    }
}

// Handles one inbound Minecraft connection: inspect the handshake,
// resolve the requested hostname to an upstream, then pipe bytes.
pub(crate) async fn handle_minecraft(
    server: Arc<MineholeServer>,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    if server.ban_cache.is_banned(&peer.ip()) {
        if server.log_rejected {
            info!(%peer, "Rejecting banned client.");
        }
        return;
    }
    let Ok(packet) = Packet::read(&mut stream).await else {
        return;
    };
    let handshake = match Handshake::decode(&packet) {
        Ok(handshake) => handshake,
        Err(error) => {
            debug!(%peer, %error, "Invalid handshake.");
            return;
        }
    };
    let host = handshake.server_address.clone();
    if server.ban_ip && host.parse::<IpAddr>().is_ok() {
        warn!(%peer, %host, "Client requested a literal IP address; banning.");
        server.ban_cache.ban(peer.ip(), server.ban_duration);
        return;
    }
    if !host_allowed(server.whitelist.as_ref(), server.blacklist.as_ref(), &host) {
        if server.log_rejected {
            info!(%peer, %host, "Rejecting handshake for denied hostname.");
        }
        reject(&mut stream, handshake.next_step).await;
        return;
    }
    let Some(upstream) = server.registry.resolve(&host) else {
        if server.log_rejected {
            info!(
                %peer, %host,
                port = handshake.server_port,
                protocol = handshake.protocol_version,
                login = handshake.next_step == NEXT_STEP_LOGIN,
                "Failed handshake for unknown hostname."
            );
        }
        reject(&mut stream, handshake.next_step).await;
        return;
    };
    let local_addr = stream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut upstream_stream = match upstream.dial(peer, local_addr).await {
        Ok(upstream_stream) => upstream_stream,
        Err(error) => {
            warn!(%peer, domain = %upstream.domain(), %error, "Failed to dial upstream.");
            reject(&mut stream, handshake.next_step).await;
            return;
        }
    };
    // Replay the handshake verbatim so the origin server sees what the
    // client actually sent.
    if handshake.encode().write(&mut upstream_stream).await.is_err() {
        return;
    }
    pump(stream, upstream_stream).await;
}
