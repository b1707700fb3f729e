//! Minimal demonstration binary for `lib_dht` (spec.md §1 Non-goals: no
//! CLI argument-parsing surface is part of the spec itself, so this
//! exists only to exercise the library end-to-end from a terminal).

use clap::{Parser, Subcommand};
use lib_dht::crypto::{Certificate, DefaultCryptoProvider, Identity};
use lib_dht::{CryptoProvider, IdHash, ListenEvent, RunnerConfig, Transport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dhtnode", author, version, about = "Kademlia-inspired DHT node", long_about = None)]
struct Cli {
    /// Local UDP bind address.
    #[arg(long, default_value = "0.0.0.0:4222")]
    bind: SocketAddr,

    /// Bootstrap peer addresses, may be repeated.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<SocketAddr>,

    /// Path to load/save routing table and storage state.
    #[arg(long)]
    persist: Option<PathBuf>,

    /// Run anonymously (skip generating a signing identity).
    #[arg(long)]
    anonymous: bool,

    #[command(subcommand)]
    command: DhtCommand,
}

#[derive(Subcommand, Debug)]
enum DhtCommand {
    /// Bring the node up and idle, servicing queries until interrupted.
    Run,
    /// Bring the node up, store a value, print the outcome, then shut down.
    Put {
        key: String,
        value: String,
        #[arg(long)]
        signed: bool,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Bring the node up, fetch a value, print it, then shut down.
    Get { key: String },
    /// Bring the node up and print values as they arrive under `key`
    /// until interrupted.
    Listen { key: String },
}

fn identity(anonymous: bool) -> Identity {
    if anonymous {
        return Identity::anonymous();
    }
    let provider = DefaultCryptoProvider;
    let (private_key, public_key) = provider.generate_identity();
    let id = public_key.fingerprint();
    Identity {
        private_key: Some(private_key),
        certificate: Some(Certificate { id, public_key, der: Vec::new(), issuer: None }),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let identity = identity(cli.anonymous);
    let own_id = identity.node_id().unwrap_or_else(IdHash::random);

    let config = RunnerConfig {
        transport: Transport::Udp { bind_v4: cli.bind, bind_v6: None },
        bootstrap: cli.bootstrap,
        persist_path: cli.persist,
        ..RunnerConfig::default()
    };

    let runner = lib_dht::Runner::run(own_id, identity, config)?;
    let handle = runner.handle();

    match cli.command {
        DhtCommand::Run => {
            tracing::info!(%own_id, "node running, press ctrl-c to stop");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        DhtCommand::Put { key, value, signed, ttl_secs } => {
            let key = IdHash::hash(key.as_bytes());
            let ttl = ttl_secs.map(Duration::from_secs);
            let result = if signed {
                handle.put_signed(key, value.into_bytes(), "text", ttl)
            } else {
                handle.put_unsigned(key, value.into_bytes(), "text", ttl)
            };
            match result {
                Ok(id) => println!("stored under {key} as value {id}"),
                Err(e) => eprintln!("put failed: {e}"),
            }
            handle.shutdown();
        }
        DhtCommand::Get { key } => {
            let key = IdHash::hash(key.as_bytes());
            match handle.get(key) {
                Ok(values) => {
                    for v in values {
                        println!("{}", String::from_utf8_lossy(&v.data));
                    }
                }
                Err(e) => eprintln!("get failed: {e}"),
            }
            handle.shutdown();
        }
        DhtCommand::Listen { key } => {
            let key = IdHash::hash(key.as_bytes());
            match handle.listen(key) {
                Ok((_listen_handle, mut rx)) => {
                    tracing::info!(%key, "listening, press ctrl-c to stop");
                    while let Some(event) = rx.blocking_recv() {
                        match event {
                            ListenEvent::New(v) => println!("{}", String::from_utf8_lossy(&v.data)),
                            ListenEvent::Expired(id) => println!("(expired value {id})"),
                        }
                    }
                }
                Err(e) => eprintln!("listen failed: {e}"),
            }
        }
    }

    Ok(())
}
