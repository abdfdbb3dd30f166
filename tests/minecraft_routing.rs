use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

mod common;
use common::{
    TestServerOptions, TestUser, connect_operator, handshake_packet, read_channel_data,
    start_server,
};

#[tokio::test(flavor = "multi_thread")]
async fn routes_handshake_through_operator_tunnel() {
    let server = start_server(TestServerOptions {
        name: "minecraft_routing",
        ssh_port: 18022,
        minecraft_port: 18122,
        ban_ip: false,
        ban_duration_hours: 48,
        users: &[TestUser {
            name: "alice",
            password: "hunter2",
            allowed_bindings: &["foo.example.com"],
        }],
    })
    .await;

    let (mut session, mut forwarded) =
        connect_operator(server.ssh_addr, "alice", "hunter2").await;
    session
        .tcpip_forward("foo.example.com", 0)
        .await
        .expect("tcpip_forward failed");
    sleep(Duration::from_millis(100)).await;

    let mut minecraft = TcpStream::connect(server.minecraft_addr)
        .await
        .expect("Minecraft connection failed");
    let client_addr = minecraft.local_addr().unwrap();
    let handshake = handshake_packet(765, "foo.example.com", 25565, 2);
    minecraft.write_all(&handshake).await.unwrap();

    let mut tunnel = timeout(Duration::from_secs(5), forwarded.recv())
        .await
        .expect("timed out waiting for a forwarded channel")
        .expect("expected a forwarded channel");
    // The forwarded-tcpip payload names the binding, the target port
    // (substituted for the requested 0), and the real client endpoint.
    assert_eq!(tunnel.connected_address, "foo.example.com");
    assert_eq!(tunnel.connected_port, 25565);
    assert_eq!(tunnel.originator_address, "127.0.0.1");
    assert_eq!(tunnel.originator_port, u32::from(client_addr.port()));

    // The captured handshake is replayed verbatim.
    let replayed = read_channel_data(&mut tunnel.channel, handshake.len()).await;
    assert_eq!(replayed, handshake);

    // Bytes flow back to the Minecraft client afterwards.
    tunnel.channel.data(&b"\x03\x00\x01\x02"[..]).await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), minecraft.read_exact(&mut buf))
        .await
        .expect("timed out reading the upstream response")
        .unwrap();
    assert_eq!(&buf, b"\x03\x00\x01\x02");
}
