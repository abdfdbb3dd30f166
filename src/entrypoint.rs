use std::{
    io,
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use color_eyre::eyre::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{
    decode_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};
use tokio::{
    fs,
    net::TcpListener,
    time::{sleep, timeout},
};
use tokio_util::{
    sync::CancellationToken,
    task::{AbortOnDropHandle, TaskTracker},
};
use tracing::{debug, error, info, warn};

use crate::{
    MineholeServer,
    auth::UserStore,
    config::ApplicationConfig,
    matcher::Matcher,
    minecraft::{BAN_SWEEP_INTERVAL, BanCache, handle_minecraft},
    registry::BindingRegistry,
    ssh::Server,
};

fn pattern_list(patterns: Option<Vec<String>>) -> Option<Matcher<()>> {
    patterns.map(|patterns| {
        let matcher = Matcher::new();
        for pattern in patterns {
            let _ = matcher.insert(&pattern, ());
        }
        matcher
    })
}

// Main entrypoint of the application.
#[doc(hidden)]
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting minehole...");
    // Find the host key or create a new one.
    let key = match fs::read_to_string(config.private_key_file.as_path()).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding host key")?,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            info!("Host key not found. Creating...");
            let key = russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            if let Some(parent) = config.private_key_file.as_path().parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| "Error creating host key directory")?;
            }
            let key_string = key.to_openssh(LineEnding::LF)?;
            let key = decode_secret_key(&key_string, None)
                .with_context(|| "Error decoding host key")?;
            fs::write(config.private_key_file.as_path(), key_string)
                .await
                .with_context(|| "Error saving host key to filesystem")?;
            key
        }
        Err(error) => return Err(error).with_context(|| "Error reading host key"),
    };

    let server = Arc::new(MineholeServer {
        session_id: AtomicUsize::new(0),
        registry: BindingRegistry::new(),
        ban_cache: BanCache::new(),
        users: UserStore::new(config.auth_directory.clone()),
        ban_ip: config.ban_ip,
        ban_duration: Duration::from_secs(config.ban_duration_hours * 60 * 60),
        log_rejected: config.log_rejected,
        whitelist: pattern_list(config.whitelist),
        blacklist: pattern_list(config.blacklist),
    });

    let ssh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(2),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: Some(Duration::from_secs(3_600)),
        // A dead operator link must be detected within two ticks, since
        // every binding of that connection dangles until it is.
        keepalive_interval: Some(Duration::from_secs(5)),
        keepalive_max: 1,
        keys: vec![key],
        ..Default::default()
    });

    let ssh_listener = TcpListener::bind(config.ssh_listen)
        .await
        .with_context(|| "Error listening on the SSH address")?;
    info!("Listening for SSH connections on {}.", config.ssh_listen);
    let minecraft_listener = TcpListener::bind(config.minecraft_listen)
        .await
        .with_context(|| "Error listening on the Minecraft address")?;
    info!(
        "Listening for Minecraft connections on {}.",
        config.minecraft_listen
    );

    // Every connection task is tracked so shutdown can drain them.
    let tracker = TaskTracker::new();

    // Minecraft data plane.
    let minecraft_server = Arc::clone(&server);
    let minecraft_tracker = tracker.clone();
    let minecraft_loop = AbortOnDropHandle::new(tokio::spawn(async move {
        loop {
            let (stream, address) = match minecraft_listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "Unable to accept Minecraft connection.");
                    break;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%error, %address, "Error setting nodelay.");
            }
            minecraft_tracker.spawn(handle_minecraft(
                Arc::clone(&minecraft_server),
                stream,
                address,
            ));
        }
    }));

    // Periodic ban cache sweep.
    let sweep_server = Arc::clone(&server);
    let _ban_sweeper = AbortOnDropHandle::new(tokio::spawn(async move {
        loop {
            sleep(BAN_SWEEP_INTERVAL).await;
            sweep_server.ban_cache.sweep();
        }
    }));

    info!("minehole is now running.");
    let mut server = server;
    let signal_handler = wait_for_signal();
    tokio::pin!(signal_handler);
    loop {
        tokio::select! {
            conn = ssh_listener.accept() => {
                let (stream, address) = match conn {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        error!(%error, "Unable to accept SSH connection.");
                        break;
                    },
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, %address, "Error setting nodelay.");
                }
                let cancellation_token = CancellationToken::new();
                let handler = server.new_client(address, cancellation_token.clone());
                let ssh_config = Arc::clone(&ssh_config);
                tracker.spawn(async move {
                    let mut session =
                        match russh::server::run_stream(ssh_config, stream, handler).await {
                            Ok(session) => session,
                            Err(error) => {
                                warn!(%error, %address, "Connection setup failed.");
                                return;
                            }
                        };
                    tokio::select! {
                        result = &mut session => {
                            if let Err(error) = result {
                                debug!(%error, %address, "Connection closed.");
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            info!(%address, "Disconnecting client...");
                            let _ = session
                                .handle()
                                .disconnect(
                                    russh::Disconnect::ByApplication,
                                    "".into(),
                                    "English".into(),
                                )
                                .await;
                        },
                    }
                });
            }
            _ = &mut signal_handler => {
                break;
            }
        }
    }
    // Graceful shutdown: stop accepting, then drain what is left for a
    // bounded grace period.
    info!("minehole is shutting down.");
    drop(minecraft_loop);
    drop(ssh_listener);
    tracker.close();
    if timeout(config.shutdown_grace_period, tracker.wait())
        .await
        .is_err()
    {
        warn!("Some connections did not drain before the grace period ended.");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
