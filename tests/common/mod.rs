#![allow(dead_code)]

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use minehole::{ApplicationConfig, entrypoint};
use russh::{
    Channel, ChannelMsg,
    client::{self, Msg},
    keys::PublicKey,
};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};

pub const KICK_MESSAGE: &str = "Server is not available";

pub struct TestUser {
    pub name: &'static str,
    pub password: &'static str,
    pub allowed_bindings: &'static [&'static str],
}

pub struct TestServerOptions {
    pub name: &'static str,
    pub ssh_port: u16,
    pub minecraft_port: u16,
    pub ban_ip: bool,
    pub ban_duration_hours: u64,
    pub users: &'static [TestUser],
}

pub struct TestServer {
    pub ssh_addr: SocketAddr,
    pub minecraft_addr: SocketAddr,
}

// Writes the user records, starts a full in-process instance, and waits
// until the SSH listener accepts connections.
pub async fn start_server(options: TestServerOptions) -> TestServer {
    let dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(options.name);
    let _ = std::fs::remove_dir_all(&dir);
    let users_dir = dir.join("users");
    std::fs::create_dir_all(&users_dir).unwrap();
    for user in options.users {
        let mut record = format!("password: \"{}\"\n", user.password);
        if !user.allowed_bindings.is_empty() {
            record.push_str("allowed_bindings:\n");
            for binding in user.allowed_bindings {
                record.push_str(&format!("  - \"{binding}\"\n"));
            }
        }
        std::fs::write(users_dir.join(format!("{}.yaml", user.name)), record).unwrap();
    }
    let ssh_addr: SocketAddr = ([127, 0, 0, 1], options.ssh_port).into();
    let minecraft_addr: SocketAddr = ([127, 0, 0, 1], options.minecraft_port).into();
    let config = ApplicationConfig {
        ssh_listen: ssh_addr,
        minecraft_listen: minecraft_addr,
        private_key_file: dir.join("ssh_key"),
        auth_directory: users_dir,
        ban_ip: options.ban_ip,
        ban_duration_hours: options.ban_duration_hours,
        log_rejected: true,
        whitelist: None,
        blacklist: None,
        shutdown_grace_period: Duration::from_secs(1),
    };
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(ssh_addr).await.is_err() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for minehole to start.");
    }
    TestServer {
        ssh_addr,
        minecraft_addr,
    }
}

// A forwarded-tcpip channel delivered to the operator's SSH client.
pub struct ForwardedChannel {
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
    pub channel: Channel<Msg>,
}

// SSH client that trusts the server key and captures forwarded channels.
pub struct OperatorClient {
    pub forwarded: mpsc::UnboundedSender<ForwardedChannel>,
}

impl client::Handler for OperatorClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.forwarded.send(ForwardedChannel {
            connected_address: connected_address.into(),
            connected_port,
            originator_address: originator_address.into(),
            originator_port,
            channel,
        });
        Ok(())
    }
}

// Connects and authenticates an operator with a password.
pub async fn connect_operator(
    ssh_addr: SocketAddr,
    user: &str,
    password: &str,
) -> (
    client::Handle<OperatorClient>,
    mpsc::UnboundedReceiver<ForwardedChannel>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = client::connect(
        Default::default(),
        ssh_addr,
        OperatorClient { forwarded: tx },
    )
    .await
    .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_password(user, password)
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    (session, rx)
}

pub fn write_varint(out: &mut Vec<u8>, mut value: i32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value = ((value as u32) >> 7) as i32;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

pub fn read_varint(buffer: &[u8], position: &mut usize) -> i32 {
    let mut value = 0i32;
    let mut shift = 0u32;
    loop {
        let byte = buffer[*position];
        *position += 1;
        value |= i32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

// Builds the framed handshake packet a Java edition client would send.
pub fn handshake_packet(protocol_version: i32, host: &str, port: u16, next_step: i32) -> Vec<u8> {
    let mut body = Vec::new();
    write_varint(&mut body, 0);
    write_varint(&mut body, protocol_version);
    write_varint(&mut body, host.len() as i32);
    body.extend_from_slice(host.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut body, next_step);
    let mut packet = Vec::new();
    write_varint(&mut packet, body.len() as i32);
    packet.extend_from_slice(&body);
    packet
}

// Reads one framed packet, or None on a clean close before any byte.
pub async fn read_framed_packet(stream: &mut TcpStream) -> Option<(i32, Vec<u8>)> {
    let mut length = 0i32;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        length |= i32::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await.ok()?;
    let mut position = 0;
    let id = read_varint(&payload, &mut position);
    Some((id, payload[position..].to_vec()))
}

// Collects channel data until at least `length` bytes have arrived.
pub async fn read_channel_data(channel: &mut Channel<Msg>, length: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < length {
        match timeout(Duration::from_secs(5), channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => out.extend_from_slice(&data),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => panic!("Timed out waiting for channel data."),
        }
    }
    out
}
