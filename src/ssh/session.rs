use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use russh::{ChannelId, CryptoVec, server::Handle};
use tokio::{sync::mpsc, time::sleep};

use crate::MineholeServer;

// Terminal geometry from pty-req, kept current by window-change.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct PtyGeometry {
    pub(crate) columns: u32,
    pub(crate) rows: u32,
}

#[derive(Parser)]
#[command(name = "proxy", about = "Configure the PROXY protocol for bindings")]
struct ProxyCommand {
    /// Bindings to enable the PROXY protocol for
    #[arg(short = 'E', long = "enable", value_name = "BINDING")]
    enable: Vec<String>,
    /// Bindings to disable the PROXY protocol for
    #[arg(short = 'D', long = "disable", value_name = "BINDING")]
    disable: Vec<String>,
}

#[derive(Parser)]
#[command(name = "list", about = "List bindings")]
struct ListCommand {
    /// Print all details
    #[arg(short, long)]
    all: bool,
}

// One interactive (or exec) command session on a session channel.
pub(crate) struct CommandSession {
    server: Arc<MineholeServer>,
    connection: usize,
    handle: Handle,
    channel: ChannelId,
    pty: Option<Arc<Mutex<PtyGeometry>>>,
    stop: bool,
}

impl CommandSession {
    pub(crate) fn new(
        server: Arc<MineholeServer>,
        connection: usize,
        handle: Handle,
        channel: ChannelId,
        pty: Option<Arc<Mutex<PtyGeometry>>>,
    ) -> Self {
        CommandSession {
            server,
            connection,
            handle,
            channel,
            pty,
            stop: false,
        }
    }

    async fn write_raw(&self, text: &str) {
        let _ = self
            .handle
            .data(self.channel, CryptoVec::from_slice(text.as_bytes()))
            .await;
    }

    async fn writeln_out(&self, text: &str) {
        let ending = if self.pty.is_some() { "\r\n" } else { "\n" };
        self.write_raw(&format!("{text}{ending}")).await;
    }

    // Errors go to the terminal in pty mode, to stderr otherwise.
    async fn writeln_err(&self, text: &str) {
        if self.pty.is_some() {
            self.writeln_out(text).await;
        } else {
            let _ = self
                .handle
                .extended_data(
                    self.channel,
                    1,
                    CryptoVec::from_slice(format!("{text}\n").as_bytes()),
                )
                .await;
        }
    }

    async fn echo(&self, data: &[u8]) {
        let mut rendered = Vec::with_capacity(data.len());
        for byte in data {
            if *byte == b'\r' {
                rendered.extend_from_slice(b"\r\n");
            } else {
                rendered.push(*byte);
            }
        }
        let _ = self
            .handle
            .data(self.channel, CryptoVec::from_slice(&rendered))
            .await;
    }

    // Runs one command line, returning its exit code.
    async fn execute(&mut self, line: &str) -> u32 {
        let Some(args) = shlex::split(line) else {
            self.writeln_err("invalid command line").await;
            return 1;
        };
        let Some(command) = args.first().map(String::as_str) else {
            return 0;
        };
        match command {
            "proxy" | "p" => self.proxy_command(&args).await,
            "list" | "ls" => self.list_command(&args).await,
            "help" | "h" | "?" => {
                self.help_command().await;
                0
            }
            "exit" | "quit" | "q" => {
                self.stop = true;
                0
            }
            "clear" | "cls" => {
                if self.pty.is_some() {
                    self.write_raw("\x1b[H\x1b[2J").await;
                    0
                } else {
                    self.writeln_err(&format!("unknown command: {command}")).await;
                    1
                }
            }
            _ => {
                self.writeln_err(&format!("unknown command: {command}")).await;
                1
            }
        }
    }

    // A printed help request is not a failure; anything else is.
    async fn parse_error(&self, error: clap::Error) -> u32 {
        if error.kind() == clap::error::ErrorKind::DisplayHelp {
            self.writeln_out(&error.to_string()).await;
            0
        } else {
            self.writeln_err(&error.to_string()).await;
            1
        }
    }

    async fn proxy_command(&mut self, args: &[String]) -> u32 {
        let options = match ProxyCommand::try_parse_from(args) {
            Ok(options) => options,
            Err(error) => return self.parse_error(error).await,
        };
        if options.enable.is_empty() && options.disable.is_empty() {
            self.writeln_out("No bindings specified").await;
            return 0;
        }
        for binding in &options.enable {
            if let Err(error) =
                self.server
                    .registry
                    .set_proxy_protocol(self.connection, binding, true)
            {
                self.writeln_err(&error.to_string()).await;
                return 1;
            }
            self.writeln_out(&format!("Enabled proxy protocol for {binding}"))
                .await;
        }
        for binding in &options.disable {
            if let Err(error) =
                self.server
                    .registry
                    .set_proxy_protocol(self.connection, binding, false)
            {
                self.writeln_err(&error.to_string()).await;
                return 1;
            }
            self.writeln_out(&format!("Disabled proxy protocol for {binding}"))
                .await;
        }
        0
    }

    async fn list_command(&mut self, args: &[String]) -> u32 {
        let options = match ListCommand::try_parse_from(args) {
            Ok(options) => options,
            Err(error) => return self.parse_error(error).await,
        };
        let mut rows = Vec::new();
        let _: Result<(), ()> = self.server.registry.each_binding(self.connection, |_, upstream| {
            rows.push((
                upstream.domain().to_string(),
                upstream.connections(),
                upstream.proxy_protocol(),
            ));
            Ok(())
        });
        if options.all {
            for line in format_bindings_table(&rows).lines() {
                self.writeln_out(line).await;
            }
        } else {
            let mut domains: Vec<String> = rows.into_iter().map(|row| row.0).collect();
            domains.sort();
            self.writeln_out(&domains.join(" ")).await;
        }
        0
    }

    async fn help_command(&self) {
        self.writeln_out("Commands:").await;
        self.writeln_out("  proxy - Configure the PROXY protocol for bindings")
            .await;
        self.writeln_out("  list - List bindings").await;
        self.writeln_out("  help - Show this help").await;
        self.writeln_out("  clear - Clear the screen").await;
        self.writeln_out("  exit - Exit").await;
    }

    // The interactive loop behind a `shell` request.
    pub(crate) async fn run(
        mut self,
        mut input: mpsc::UnboundedReceiver<Vec<u8>>,
        mut signals: mpsc::Receiver<String>,
    ) {
        let mut pending = Vec::new();
        'session: loop {
            if self.pty.is_some() {
                self.write_raw("> ").await;
            }
            let line = loop {
                if let Some(line) = take_line(&mut pending) {
                    break line;
                }
                tokio::select! {
                    data = input.recv() => {
                        let Some(data) = data else { break 'session };
                        if self.pty.is_some() {
                            self.echo(&data).await;
                        }
                        pending.extend_from_slice(&data);
                    }
                    signal = signals.recv() => {
                        let Some(signal) = signal else { break 'session };
                        if matches!(signal.as_str(), "INT" | "TERM" | "KILL") {
                            self.write_raw("^C\r\n").await;
                            break 'session;
                        }
                    }
                }
            };
            if line.is_empty() {
                continue;
            }
            let code = self.execute(&line).await;
            let _ = self.handle.exit_status_request(self.channel, code).await;
            // Keep the next prompt ordered after the command's output.
            sleep(Duration::from_millis(5)).await;
            if self.stop {
                break;
            }
        }
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }

    // A one-shot `exec` request: run the command, report its status,
    // close the channel.
    pub(crate) async fn run_exec(mut self, command: String) {
        let code = self.execute(&command).await;
        let _ = self.handle.exit_status_request(self.channel, code).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let position = pending.iter().position(|byte| matches!(byte, b'\n' | b'\r'))?;
    let mut line: Vec<u8> = pending.drain(..=position).collect();
    line.pop();
    Some(String::from_utf8_lossy(&line).into_owned())
}

// DOMAIN / CONNECTIONS / PROXY PROTOCOL, padded with a two-space gutter.
pub(crate) fn format_bindings_table(rows: &[(String, usize, bool)]) -> String {
    let mut table = vec![(
        "DOMAIN".to_string(),
        "CONNECTIONS".to_string(),
        "PROXY PROTOCOL".to_string(),
    )];
    for (domain, connections, proxy_protocol) in rows {
        table.push((
            domain.clone(),
            connections.to_string(),
            proxy_protocol.to_string(),
        ));
    }
    let domain_width = table.iter().map(|row| row.0.len()).max().unwrap_or(0);
    let connections_width = table.iter().map(|row| row.1.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (domain, connections, proxy_protocol) in table {
        out.push_str(&format!(
            "{domain:<domain_width$}  {connections:<connections_width$}  {proxy_protocol}\n"
        ));
    }
    out
}
