use std::{
    borrow::Cow,
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, atomic::Ordering},
};

pub(crate) mod session;

use russh::{
    Channel, ChannelId, MethodKind, MethodSet, Pty, Sig,
    keys::PublicKey,
    server::{Auth, Handler, Msg, Response, Session},
};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, info, warn};

use crate::{
    MineholeServer,
    auth::{UserRecord, verify_password, verify_public_key},
    ssh::session::{CommandSession, PtyGeometry},
    upstream::Upstream,
};

// Signals are best-effort; a slow or exited consumer drops them.
const SIGNAL_BUFFER: usize = 4;

const DEFAULT_MINECRAFT_PORT: u32 = 25565;

// Per-session-channel state for the small pty/shell/exec machine.
#[derive(Default)]
struct SessionChannel {
    pty: Option<Arc<Mutex<PtyGeometry>>>,
    started: bool,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    signals: Option<mpsc::Sender<String>>,
    _command_loop: Option<AbortOnDropHandle<()>>,
}

pub(crate) trait Server {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler;
}

impl Server for Arc<MineholeServer> {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler {
        let id = self.session_id.fetch_add(1, Ordering::AcqRel);
        info!(peer = %peer_address, "SSH client connected.");
        ServerHandler {
            id,
            peer: peer_address,
            user: None,
            allowed_bindings: None,
            registered: false,
            prompted_for_username: false,
            cancellation_token,
            server: Arc::clone(self),
            channels: HashMap::new(),
        }
    }
}

// State for one SSH control connection.
pub(crate) struct ServerHandler {
    // The unique id of this connection.
    id: usize,
    peer: SocketAddr,
    user: Option<String>,
    // Patterns this user may bind, taken from the user record at
    // authentication time.
    allowed_bindings: Option<Vec<String>>,
    // Whether the connection has been registered with the registry.
    registered: bool,
    // Whether keyboard-interactive auth asked for a username.
    prompted_for_username: bool,
    cancellation_token: CancellationToken,
    server: Arc<MineholeServer>,
    channels: HashMap<ChannelId, SessionChannel>,
}

impl ServerHandler {
    fn accept(&mut self, user: &str, record: UserRecord) -> Auth {
        self.user = Some(user.into());
        self.allowed_bindings = Some(record.allowed_bindings);
        Auth::Accept
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [
                    MethodKind::PublicKey,
                    MethodKind::Password,
                    MethodKind::KeyboardInteractive,
                ]
                .as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.server.users.load(user).await {
            Ok(record) if verify_password(&record, password) => Ok(self.accept(user, record)),
            Ok(_) => {
                warn!(peer = %self.peer, %user, "Failed password authentication.");
                Ok(reject())
            }
            Err(error) => {
                debug!(peer = %self.peer, %user, %error, "No usable user record.");
                Ok(reject())
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self.server.users.load(user).await {
            Ok(record) if verify_public_key(&record, public_key) => Ok(self.accept(user, record)),
            Ok(_) => {
                warn!(peer = %self.peer, %user, "No matching authorized key.");
                Ok(reject())
            }
            Err(error) => {
                debug!(peer = %self.peer, %user, %error, "No usable user record.");
                Ok(reject())
            }
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        let Some(response) = response else {
            let mut prompts: Vec<(Cow<'static, str>, bool)> = Vec::new();
            if user.is_empty() {
                self.prompted_for_username = true;
                prompts.push((Cow::Borrowed("Username: "), true));
            }
            prompts.push((Cow::Borrowed("Password: "), false));
            return Ok(Auth::Partial {
                name: Cow::Borrowed(""),
                instructions: Cow::Borrowed(""),
                prompts: Cow::Owned(prompts),
            });
        };
        let answers: Vec<String> = response
            .map(|answer| String::from_utf8_lossy(&answer).into_owned())
            .collect();
        let (username, password) = if self.prompted_for_username {
            match answers.as_slice() {
                [username, password] => (username.clone(), password.clone()),
                _ => return Ok(reject()),
            }
        } else {
            match answers.as_slice() {
                [password] => (user.to_string(), password.clone()),
                _ => return Ok(reject()),
            }
        };
        match self.server.users.load(&username).await {
            Ok(record) if verify_password(&record, &password) => {
                Ok(self.accept(&username, record))
            }
            _ => {
                warn!(peer = %self.peer, user = %username, "Failed interactive authentication.");
                Ok(reject())
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        let allowed = self.allowed_bindings.clone().unwrap_or_default();
        if let Err(error) = self.server.registry.add_connection(self.id, &allowed) {
            warn!(peer = %self.peer, %error, "Could not register connection.");
            return Err(russh::Error::Disconnect);
        }
        self.registered = true;
        let user = self.user.as_deref().unwrap_or("unknown");
        info!(peer = %self.peer, %user, "SSH client authenticated.");
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), SessionChannel::default());
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    // At most one pty per session channel.
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return session.channel_failure(channel);
        };
        if entry.pty.is_some() {
            return session.channel_failure(channel);
        }
        entry.pty = Some(Arc::new(Mutex::new(PtyGeometry {
            columns: col_width,
            rows: row_height,
        })));
        session.channel_success(channel)
    }

    // Only valid once a pty has been requested.
    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(pty) = self
            .channels
            .get(&channel)
            .and_then(|entry| entry.pty.as_ref())
        else {
            return session.channel_failure(channel);
        };
        *pty.lock().expect("not poisoned") = PtyGeometry {
            columns: col_width,
            rows: row_height,
        };
        session.channel_success(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.registered {
            return Err(russh::Error::Disconnect);
        }
        let Some(entry) = self.channels.get_mut(&channel) else {
            return session.channel_failure(channel);
        };
        if entry.started {
            return session.channel_failure(channel);
        }
        entry.started = true;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        entry.input = Some(input_tx);
        entry.signals = Some(signal_tx);
        let command_session = CommandSession::new(
            Arc::clone(&self.server),
            self.id,
            session.handle(),
            channel,
            entry.pty.clone(),
        );
        entry._command_loop = Some(AbortOnDropHandle::new(tokio::spawn(
            command_session.run(input_rx, signal_rx),
        )));
        session.channel_success(channel)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.registered {
            return Err(russh::Error::Disconnect);
        }
        let Some(entry) = self.channels.get_mut(&channel) else {
            return session.channel_failure(channel);
        };
        if entry.started {
            return session.channel_failure(channel);
        }
        entry.started = true;
        let command = String::from_utf8_lossy(data).into_owned();
        debug!(peer = %self.peer, %command, "Received exec request.");
        let command_session = CommandSession::new(
            Arc::clone(&self.server),
            self.id,
            session.handle(),
            channel,
            entry.pty.clone(),
        );
        entry._command_loop = Some(AbortOnDropHandle::new(tokio::spawn(
            command_session.run_exec(command),
        )));
        session.channel_success(channel)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(input) = self
            .channels
            .get(&channel)
            .and_then(|entry| entry.input.as_ref())
        {
            let _ = input.send(data.to_vec());
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(signals) = self
            .channels
            .get(&channel)
            .and_then(|entry| entry.signals.as_ref())
        {
            // Dropped if the consumer is gone or the buffer is full.
            let _ = signals.try_send(format!("{signal:?}"));
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.registered {
            return Err(russh::Error::Disconnect);
        }
        if *port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        if *port == 0 {
            *port = DEFAULT_MINECRAFT_PORT;
        }
        let address = address.trim();
        let upstream = Arc::new(Upstream::new(
            self.id,
            address.into(),
            *port,
            session.handle(),
            self.cancellation_token.clone(),
        ));
        match self.server.registry.add_binding(self.id, address, upstream) {
            Ok(()) => {
                info!(peer = %self.peer, %address, port = *port, "Bound hostname pattern.");
                Ok(true)
            }
            Err(error) => {
                info!(peer = %self.peer, %address, %error, "Rejected tcpip-forward request.");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.registered {
            return Err(russh::Error::Disconnect);
        }
        let address = address.trim();
        let mut owned = false;
        let _: Result<(), ()> = self.server.registry.each_binding(self.id, |pattern, _| {
            if pattern == address {
                owned = true;
            }
            Ok(())
        });
        if !owned {
            return Ok(false);
        }
        info!(peer = %self.peer, %address, "Removed binding.");
        Ok(self.server.registry.remove_binding(address))
    }
}

// Deregistration on disconnect: closes every upstream this connection
// owns, which in turn closes their forwarded streams.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        info!(peer = %self.peer, %user, "SSH client disconnected.");
        if self.registered {
            self.server.registry.remove_connection(self.id);
        }
    }
}
