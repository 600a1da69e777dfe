//! Tessera CLI - key generation and an in-process conversation demo

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Args, Parser, Subcommand};

use tessera_app::{Directory, KeyManagementService, KeyManagerConfig, MemoryDirectory};
use tessera_core::crypto::keys::{IdentityKeyPair, KeyBundle, OneTimePreKey, SignedPreKey};
use tessera_core::protocol::EncryptedMessage;

/// Tessera - asynchronous end-to-end encryption
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Key manager settings; unset values keep their defaults
#[derive(Args)]
struct ConfigArgs {
    /// One-time prekeys to generate and to refill up to
    #[arg(long, global = true, env = "TESSERA_ONE_TIME_PREKEYS")]
    one_time_prekeys: Option<u32>,

    /// Refill the one-time prekey pool below this many keys
    #[arg(long, global = true, env = "TESSERA_PREKEY_REFILL_THRESHOLD")]
    prekey_refill_threshold: Option<u32>,

    /// Evict sessions idle for longer than this many seconds
    #[arg(long, global = true, env = "TESSERA_SESSION_MAX_IDLE_SECS")]
    session_max_idle_secs: Option<u64>,

    /// Timeout for each directory request, in seconds
    #[arg(long, global = true, env = "TESSERA_DIRECTORY_TIMEOUT_SECS")]
    directory_timeout_secs: Option<u64>,

    /// Rotate the signed prekey after this many seconds
    #[arg(long, global = true, env = "TESSERA_SIGNED_PREKEY_MAX_AGE_SECS")]
    signed_prekey_max_age_secs: Option<u64>,
}

impl ConfigArgs {
    fn into_config(self) -> KeyManagerConfig {
        let mut config = KeyManagerConfig::default();
        if let Some(count) = self.one_time_prekeys {
            config.one_time_prekey_count = count;
        }
        if let Some(threshold) = self.prekey_refill_threshold {
            config.prekey_refill_threshold = threshold;
        }
        if let Some(secs) = self.session_max_idle_secs {
            config.session_max_idle = Duration::from_secs(secs);
        }
        if let Some(secs) = self.directory_timeout_secs {
            config.directory_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.signed_prekey_max_age_secs {
            config.signed_prekey_max_age = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a fresh identity and print its key bundle
    Keygen,

    /// Check a base64 key bundle and show its fingerprint
    Inspect {
        /// Key bundle as printed by `keygen`
        bundle: String,
    },

    /// Run an Alice/Bob conversation against an in-memory directory
    Demo {
        /// Number of message round trips
        #[arg(short, long, default_value = "3")]
        rounds: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.into_config();

    match cli.command {
        Commands::Keygen => cmd_keygen(&config)?,
        Commands::Inspect { bundle } => cmd_inspect(&bundle)?,
        Commands::Demo { rounds } => cmd_demo(config, rounds).await?,
    }

    Ok(())
}

fn cmd_keygen(config: &KeyManagerConfig) -> Result<()> {
    let identity = IdentityKeyPair::generate();
    let signed_prekey = SignedPreKey::generate(1, &identity);
    let one_time_prekeys = OneTimePreKey::generate_batch(1, config.one_time_prekey_count);

    let bundle = KeyBundle::new(&identity, &signed_prekey, &one_time_prekeys);

    let bundle_bytes = bundle.to_bytes().context("Failed to encode key bundle")?;
    let bundle_base64 = base64::engine::general_purpose::STANDARD.encode(&bundle_bytes);

    println!("Fingerprint: {}", bundle.identity.fingerprint());
    println!("Signed Pre-Key ID: {}", bundle.signed_prekey.id);
    println!("One-Time Pre-Keys: {}", bundle.one_time_prekeys.len());
    println!("\nKey Bundle (base64):");
    println!("{}", bundle_base64);

    Ok(())
}

fn cmd_inspect(encoded: &str) -> Result<()> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("Key bundle is not valid base64")?;
    let bundle = KeyBundle::from_bytes(&bytes).context("Key bundle is malformed")?;
    bundle
        .verify()
        .context("Signed pre-key signature does not match the identity")?;

    println!("✓ Signature valid");
    println!("Fingerprint: {}", bundle.identity.fingerprint());
    println!("Signed Pre-Key ID: {}", bundle.signed_prekey.id);
    println!("One-Time Pre-Keys: {}", bundle.one_time_prekeys.len());

    Ok(())
}

async fn cmd_demo(config: KeyManagerConfig, rounds: u32) -> Result<()> {
    let directory: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
    let alice = KeyManagementService::new("alice", directory.clone(), config.clone());
    let bob = KeyManagementService::new("bob", directory, config);

    println!("alice: {}", alice.initialize().await?);
    println!("bob:   {}", bob.initialize().await?);

    let start = alice
        .start_conversation("bob")
        .await
        .context("Alice could not start a conversation")?;
    // The initial message travels as opaque bytes, like everything else
    let initial_bytes = start.initial_message.to_bytes()?;
    let initial = tessera_core::crypto::X3dhInitialMessage::from_bytes(&initial_bytes)?;
    let bob_id = bob
        .accept_conversation("alice", &initial)
        .await
        .context("Bob could not accept the conversation")?;
    println!(
        "\nConversation established ({} one-time prekey)",
        if initial.one_time_prekey_id.is_some() { "with" } else { "without" }
    );

    for round in 1..=rounds {
        let text = format!("hello #{round}");
        let wire = alice
            .encrypt_message(start.conversation_id, text.as_bytes())
            .await?
            .to_bytes();
        let plaintext = bob
            .decrypt_message(bob_id, &EncryptedMessage::from_bytes(&wire)?)
            .await?;
        println!("alice -> bob   {} bytes  {}", wire.len(), String::from_utf8_lossy(&plaintext));

        let text = format!("hi #{round}");
        let wire = bob.encrypt_message(bob_id, text.as_bytes()).await?.to_bytes();
        let plaintext = alice
            .decrypt_message(start.conversation_id, &EncryptedMessage::from_bytes(&wire)?)
            .await?;
        println!("bob   -> alice {} bytes  {}", wire.len(), String::from_utf8_lossy(&plaintext));
    }

    let alice_root = alice.export_session(start.conversation_id).await?.ratchet_state.root_key;
    let bob_root = bob.export_session(bob_id).await?.ratchet_state.root_key;
    if rounds > 0 {
        anyhow::ensure!(alice_root == bob_root, "Root keys diverged");
        println!("\n✓ Root keys agree after {} round trips", rounds);
    }

    Ok(())
}
