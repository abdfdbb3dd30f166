use std::net::SocketAddr;

// PROXY protocol v1 (the HAProxy text preamble): one ASCII line sent
// before any application bytes, so the origin server learns the real
// client endpoint instead of the router's.
pub(crate) fn proxy_protocol_header(client: SocketAddr, proxy: SocketAddr) -> String {
    match (client, proxy) {
        (SocketAddr::V4(client), SocketAddr::V4(proxy)) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            client.ip(),
            proxy.ip(),
            client.port(),
            proxy.port()
        ),
        (SocketAddr::V6(client), SocketAddr::V6(proxy)) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            client.ip(),
            proxy.ip(),
            client.port(),
            proxy.port()
        ),
        // Mixed families cannot be described; the protocol provides an
        // explicit opt-out for this case.
        _ => "PROXY UNKNOWN\r\n".into(),
    }
}
