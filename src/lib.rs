use std::{sync::atomic::AtomicUsize, time::Duration};

mod auth;
mod config;
mod containers;
mod entrypoint;
mod error;
mod forwarder;
mod matcher;
mod minecraft;
mod protocol;
mod proxy_protocol;
mod registry;
mod ssh;
mod stream;
mod upstream;

pub use config::ApplicationConfig;
pub use entrypoint::entrypoint;

use crate::{
    auth::UserStore, matcher::Matcher, minecraft::BanCache, registry::BindingRegistry,
    upstream::Upstream,
};

// State shared by the control and data planes. Passed explicitly to
// every task so tests can run isolated instances side by side.
pub(crate) struct MineholeServer {
    // Allocator for per-connection ids.
    pub(crate) session_id: AtomicUsize,
    pub(crate) registry: BindingRegistry<Upstream>,
    pub(crate) ban_cache: BanCache,
    pub(crate) users: UserStore,
    // Ban clients whose handshake requests a literal IP address.
    pub(crate) ban_ip: bool,
    pub(crate) ban_duration: Duration,
    // Log rejected data-plane connections.
    pub(crate) log_rejected: bool,
    // Optional domain allow/deny lists, applied before resolving.
    pub(crate) whitelist: Option<Matcher<()>>,
    pub(crate) blacklist: Option<Matcher<()>>,
}
