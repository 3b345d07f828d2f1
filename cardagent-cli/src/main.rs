// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cardagent_assuan::Responder;
use cardagent_scd::{
    Config, DigestAlgo, LearnResult, MemoryPinCache, ProcessLauncher, Registry, Session,
    SignRequest,
};
use clap::{Parser, Subcommand};
use log::{debug, error};
use tokio::io::BufReader;

use crate::error::{IoContext, Result};
use crate::prompt::TtyPrompt;

mod error;
mod prompt;

/// Run smart card operations through the card daemon.
#[derive(Parser)]
#[command(name = "cardagent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the serial number of the inserted card
    Serialno {
        /// Require the card with this serial number
        demand: Option<String>,
    },

    /// List everything the daemon reports about the card
    Learn,

    /// List keys on the cards, or only the key with KEYGRIP
    Keyinfo { keygrip: Option<String> },

    /// List the serial numbers of all cards
    Cardlist,

    /// Print a card attribute
    Getattr { name: String },

    /// Write a certificate to stdout
    Readcert { id: String },

    /// Write a public key to stdout as canonical S-expression
    Readkey { id: String },

    /// Sign hex encoded data
    Sign {
        /// Use the authentication key
        #[arg(long)]
        auth: bool,

        /// Digest algorithm the data was hashed with
        #[arg(long, value_name = "ALGO")]
        hash: Option<DigestAlgo>,

        /// Text shown with the PIN prompt
        #[arg(long)]
        desc: Option<String>,

        keyid: String,
        hexdata: String,
    },

    /// Decrypt hex encoded data
    Decrypt {
        #[arg(long)]
        desc: Option<String>,

        keyid: String,
        hexdata: String,
    },

    /// Store the key in FILE on the card
    Writekey {
        /// Overwrite an existing key
        #[arg(long)]
        force: bool,

        keyref: String,
        file: PathBuf,
    },

    /// Send a raw command; stdin and stdout carry the exchange
    Scd {
        #[arg(trailing_var_arg = true, required = true)]
        cmdline: Vec<String>,
    },

    /// Ask the daemon to terminate
    Kill,

    /// Print the daemon state
    State,
}

fn write_stdout(data: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(data)
        .and_then(|()| stdout.flush())
        .io_context(|| "Failed to write to stdout".to_string())
}

async fn run(registry: &Registry, session: &Session, command: Command) -> Result<()> {
    let prompt = TtyPrompt;
    match command {
        Command::Serialno { demand } => {
            println!("{}", session.serialno(demand.as_deref()).await?);
        }
        Command::Learn => {
            let mut learned = LearnResult::default();
            session.learn(&mut learned).await?;
            for (keyword, args) in &learned.info {
                println!("{keyword} {args}");
            }
            for keypair in &learned.keypairs {
                println!("KEYPAIRINFO {keypair}");
            }
            for cert in &learned.certs {
                println!("CERTINFO {cert}");
            }
        }
        Command::Keyinfo { keygrip } => {
            for key in session.keyinfo(keygrip.as_deref()).await? {
                println!("{} {} {}", key.keygrip, key.serialno, key.idstr);
            }
        }
        Command::Cardlist => {
            for serialno in session.cardlist().await? {
                println!("{serialno}");
            }
        }
        Command::Getattr { name } => {
            println!("{}", session.getattr(&name).await?);
        }
        Command::Readcert { id } => write_stdout(&session.readcert(&id).await?)?,
        Command::Readkey { id } => write_stdout(&session.readkey(&id).await?)?,
        Command::Sign {
            auth,
            hash,
            desc,
            keyid,
            hexdata,
        } => {
            let data = hex::decode(hexdata)?;
            let request = SignRequest {
                digest: hash,
                auth,
                desc: desc.as_deref(),
                ..SignRequest::new(&keyid, &data)
            };
            println!("{}", hex::encode_upper(session.pksign(request, &prompt).await?));
        }
        Command::Decrypt {
            desc,
            keyid,
            hexdata,
        } => {
            let ciphertext = hex::decode(hexdata)?;
            let output = session
                .pkdecrypt(&keyid, &ciphertext, desc.as_deref(), &prompt)
                .await?;
            println!("{}", hex::encode_upper(output.plaintext.as_slice()));
            if output.padding >= 0 {
                println!("padding {}", output.padding);
            }
        }
        Command::Writekey {
            force,
            keyref,
            file,
        } => {
            let keydata = zeroize::Zeroizing::new(
                tokio::fs::read(&file)
                    .await
                    .io_context(|| format!("Failed to read key file {}", file.display()))?,
            );
            session.writekey(&keyref, force, &keydata, &prompt).await?;
        }
        Command::Scd { cmdline } => {
            let line = cmdline.join(" ");
            let mut upstream =
                Responder::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
            match session.scd(&line, &prompt, &mut upstream).await {
                Ok(()) => upstream.write_ok(None).await?,
                Err(e) => {
                    upstream.write_err(e.code(), &e.to_string()).await?;
                    return Err(e.into());
                }
            }
        }
        Command::Kill => registry.kill_daemon().await,
        Command::State => {
            registry.dump_state().await;
            let snapshot = registry.snapshot().await;
            match snapshot.primary_pid {
                Some(pid) => println!("daemon pid {pid}"),
                None => println!("no daemon running"),
            }
            if let Some(socket) = &snapshot.socket_name {
                println!("socket {}", socket.display());
            }
            println!("reusable {}", snapshot.primary_reusable);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cardagent: {e}");
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG takes precedence over the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();
    debug!("using daemon program {}", config.scdaemon_program.display());

    let registry = Registry::new(
        config,
        Box::new(ProcessLauncher),
        Arc::new(MemoryPinCache::default()),
    );
    let session = registry.session();
    let result = run(&registry, &session, cli.command).await;
    session.reset().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
