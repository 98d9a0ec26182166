//! pico-crypto-key - command line client for the serial crypto key.

use std::path::PathBuf;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pico_crypto_key as app;

use app::config::{AppConfig, ConfigLoadResult};
use app::token::{Digest, Pin, PublicKey, Session, SerialTransport, Signature, VerifyStatus};

/// Drive a pico crypto key over its serial port.
#[derive(Parser)]
#[command(name = "pico-crypto-key", version)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial device, overriding the config file
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// SHA-256 a file on the device
    Hash { file: PathBuf },
    /// Hash and sign a file with the device key
    Sign { file: PathBuf },
    /// Check a signature over a digest
    Verify {
        /// Digest as hex
        #[arg(long)]
        digest: String,
        /// DER signature as hex
        #[arg(long)]
        signature: String,
        /// SEC1 public key as hex (defaults to the device key)
        #[arg(long)]
        pubkey: Option<String>,
    },
    /// Print the device public key
    Pubkey,
    /// Encrypt a file with the device key
    Encrypt {
        file: PathBuf,
        /// Write raw output here instead of printing hex
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decrypt a file with the device key
    Decrypt {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Firmware version and clock skew
    Info,
    /// Print the key for a relying party and user
    Register { relying_party: String, user: String },
    /// Answer a challenge for a relying party and user
    Auth {
        relying_party: String,
        user: String,
        challenge: String,
        /// Register first and check the response against the host clock
        #[arg(long)]
        check: bool,
    },
    /// Change the device pin
    SetPin,
    /// Print the device clock
    Time,
    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    tracing::debug!("Config path: {:?}", config_path);

    let mut config = match AppConfig::try_load(&config_path) {
        ConfigLoadResult::Loaded(config) => config,
        ConfigLoadResult::Missing => {
            tracing::debug!("No config file, using defaults");
            AppConfig::default()
        }
        ConfigLoadResult::Invalid(e) => {
            return Err(e).with_context(|| format!("invalid config {}", config_path.display()));
        }
    };
    if let Some(device) = cli.device {
        config.device.path = device;
    }
    config.validate().context("invalid configuration")?;

    if let Command::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", config_path.display());
        }
        config.save(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let mut session = Session::open(&config, read_pin(&config)?)
        .with_context(|| format!("failed to open crypto key at {}", config.device.path))?;
    run(&mut session, &config, cli.command)?;
    session.close()?;
    Ok(())
}

fn run(session: &mut Session<SerialTransport>, config: &AppConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Hash { file } => {
            let digest = session.hash_file(&file)?;
            println!("{digest}");
        }
        Command::Sign { file } => {
            let (digest, signature) = session.sign_file(&file)?;
            println!("digest:    {digest}");
            println!("signature: {}", hex::encode(signature.as_bytes()));
        }
        Command::Verify {
            digest,
            signature,
            pubkey,
        } => {
            let digest = parse_digest(&digest)?;
            let signature = Signature(hex::decode(&signature).context("signature is not hex")?);
            let public_key = match pubkey {
                Some(key) => PublicKey::from_bytes(&hex::decode(&key).context("public key is not hex")?)?,
                None => session.pubkey()?,
            };
            let status = session.verify(&digest, &signature, &public_key)?;
            println!("{status}");
            if let VerifyStatus::DeviceError(code) = status {
                bail!("device rejected the verify request (status {code:#010x})");
            }
        }
        Command::Pubkey => println!("{}", session.pubkey()?),
        Command::Encrypt { file, output } => {
            let data = std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            emit(&session.encrypt(&data)?, output)?;
        }
        Command::Decrypt { file, output } => {
            let data = std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            emit(&session.decrypt(&data)?, output)?;
        }
        Command::Info => {
            let info = session.info()?;
            let skew = info.skew_from(Utc::now());
            println!("version:     {}", info.version);
            println!("device time: {}", info.device_time.to_rfc3339());
            println!("skew:        {} ms", skew.num_milliseconds());
        }
        Command::Register { relying_party, user } => {
            println!("{}", session.register(&relying_party, &user)?);
        }
        Command::Auth {
            relying_party,
            user,
            challenge,
            check,
        } => {
            let public_key = if check {
                Some(session.register(&relying_party, &user)?)
            } else {
                None
            };
            let signature = session.auth(&relying_party, &user, challenge.as_bytes())?;
            println!("{}", hex::encode(signature.as_bytes()));
            if let Some(public_key) = public_key {
                match config
                    .auth_policy()?
                    .verify(&public_key, challenge.as_bytes(), &signature, Utc::now())?
                {
                    Some(window) => println!("verified for window {window}"),
                    None => bail!("response does not verify against the host clock"),
                }
            }
        }
        Command::SetPin => {
            let new_pin = rpassword::prompt_password("New PIN: ")?;
            let confirm = rpassword::prompt_password("Repeat new PIN: ")?;
            if new_pin != confirm {
                bail!("pins do not match");
            }
            session.set_pin(Pin::new(new_pin))?;
            println!("PIN changed");
        }
        Command::Time => println!("{}", session.device_time()?.to_rfc3339()),
        Command::InitConfig { .. } => unreachable!("handled before the session opens"),
    }
    Ok(())
}

fn read_pin(config: &AppConfig) -> anyhow::Result<Pin> {
    if let Ok(pin) = std::env::var(&config.device.pin_env) {
        tracing::debug!("Using pin from {}", config.device.pin_env);
        return Ok(Pin::new(pin));
    }
    let pin = rpassword::prompt_password("PIN: ").context("failed to read pin")?;
    Ok(Pin::new(pin))
}

fn parse_digest(text: &str) -> anyhow::Result<Digest> {
    let bytes = hex::decode(text).context("digest is not hex")?;
    let array = <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("digest must be 32 bytes, got {}", bytes.len()))?;
    Ok(Digest(array))
}

fn emit(data: &[u8], output: Option<PathBuf>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None => println!("{}", hex::encode(data)),
    }
    Ok(())
}
