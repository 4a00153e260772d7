use std::env;

use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use ppplinkd::lcp::AuthProto;
use ppplinkd::mppe::KeyStrength;
use ppplinkd::secret::{FileSecrets, SecretStore};
use ppplinkd::{Client, ClientConfig, Error, LinkEvent, Result};
use serde::Deserialize;

const CONFIG_PATH: &str = "/data/ppplinkd.conf";

#[derive(Clone, Debug, Default, Deserialize)]
struct Config {
    username: String,
    password: String,
    #[serde(default)]
    peer_auth: Option<String>,
    #[serde(default)]
    secrets_file: Option<String>,
    #[serde(default)]
    ipv6: bool,
    #[serde(default)]
    compression: bool,
    #[serde(default)]
    encryption: bool,
    #[serde(default)]
    key_bits: Option<u16>,
    #[serde(default)]
    stateless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("[info] startup");

    let config_path = env::args().nth(1).unwrap_or_else(|| CONFIG_PATH.into());
    let config: Config = serde_json::from_str(&tokio::fs::read_to_string(&config_path).await?)?;

    let secrets = match &config.secrets_file {
        Some(path) => {
            Some(Box::new(FileSecrets::load(path).await?) as Box<dyn SecretStore + Send>)
        }
        None => None,
    };

    let peer_auth = match config.peer_auth.as_deref() {
        None => None,
        Some("pap") => Some(AuthProto::Pap),
        Some("chap") => Some(AuthProto::ChapMd5),
        Some("eap") => Some(AuthProto::Eap),
        Some(other) => {
            println!(
                "[warn] unknown auth protocol {}, letting peers in unauthenticated",
                other
            );
            None
        }
    };

    let strength = match config.key_bits {
        Some(40) => KeyStrength::Bits40,
        _ => KeyStrength::Bits128,
    };

    // Frames travel over stdio with a 2 byte protocol number and a
    // 2 byte length in front of each packet; the process on the other
    // end owns the actual line.
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let client = Client::new(
        ClientConfig {
            username: config.username,
            password: config.password,
            peer_auth,
            secrets,
            ipv4_addr: None,
            peer_ipv4: None,
            ipv6: config.ipv6,
            compression: config.compression,
            encryption: config.encryption,
            strength,
            stateless: config.stateless,
            ..ClientConfig::default()
        },
        out_tx,
        event_tx,
    );

    let mut join_handle = tokio::spawn(client.run(in_rx));

    tokio::spawn(async move {
        let mut stdin = io::stdin();
        loop {
            let mut header = [0; 4];
            if stdin.read_exact(&mut header).await.is_err() {
                return;
            }

            let protocol = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[2], header[3]]) as usize;

            let mut data = vec![0; length];
            if stdin.read_exact(&mut data).await.is_err() {
                return;
            }

            if in_tx.send((protocol, data)).is_err() {
                return;
            }
        }
    });

    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let (protocol, data) = frame.ok_or(Error::TransportClosed)?;

                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&protocol.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buf.extend_from_slice(&data);

                stdout.write_all(&buf).await?;
                stdout.flush().await?;
            }
            event = event_rx.recv() => {
                match event.ok_or(Error::EventChannelClosed)? {
                    LinkEvent::Authenticated => println!("[info] <> authenticated"),
                    LinkEvent::Encrypted(strength) => println!("[info] <> encrypted, {:?}", strength),
                    LinkEvent::Up(info) => {
                        println!("[info] <> up: {}", serde_json::to_string(&info)?)
                    }
                    LinkEvent::Down(reason) => println!("[info] <> down: {:?}", reason),
                }
            }
            result = &mut join_handle => {
                result??;

                println!("[info] <> exiting");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[info] <> exiting on signal");
                return Ok(());
            }
        }
    }
}
