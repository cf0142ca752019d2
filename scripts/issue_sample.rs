//! Sample issuer for local testing of an entry station
//!
//! Generates an Ed25519 key pair, prints the ATLAS_QR_KEYS value the station
//! needs, and prints a signed compact QR code valid from now for `--hours`.
//! With `--seed-operator`, also creates an admin/admin operator in the data dir.
//! Run: cargo run --bin issue_sample -- --auth-id 42 --name "Ana Souza"

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use clap::Parser;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde_json::json;

use atlas_entry::auth::hash_password;
use atlas_entry::models::Operator;
use atlas_entry::storage::Storage;

#[derive(Parser)]
#[command(name = "issue_sample")]
struct Args {
    #[arg(long, default_value = "k1")]
    kid: String,
    #[arg(long, default_value_t = 1)]
    auth_id: i64,
    #[arg(long, default_value_t = 1)]
    org_id: i64,
    #[arg(long, default_value = "A-101")]
    unit: String,
    #[arg(long, default_value = "Sample Visitor")]
    name: String,
    #[arg(long, default_value = "VISIT")]
    service: String,
    #[arg(long)]
    plate: Option<String>,
    #[arg(long, default_value_t = 4)]
    hours: i64,
    /// Hex-encoded 32-byte seed; a random key is generated when absent
    #[arg(long)]
    seed: Option<String>,
    #[arg(long)]
    seed_operator: Option<String>,
}

fn signing_key(seed: Option<&str>) -> Result<SigningKey, Box<dyn std::error::Error>> {
    let Some(seed) = seed else {
        return Ok(SigningKey::generate(&mut OsRng));
    };
    let bytes: [u8; 32] = hex::decode(seed)?
        .try_into()
        .map_err(|_| "seed must be 32 bytes (64 hex characters)")?;
    Ok(SigningKey::from_bytes(&bytes))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let key = signing_key(args.seed.as_deref())?;

    let now = Utc::now().timestamp();
    let mut payload = json!({
        "a": args.auth_id,
        "o": args.org_id,
        "u": args.unit,
        "n": args.name,
        "s": args.service,
        "f": now,
        "t": now + args.hours * 3600,
        "k": args.kid,
    });
    if let Some(plate) = &args.plate {
        payload["p"] = json!(plate);
    }

    let segment = URL_SAFE_NO_PAD.encode(payload.to_string());
    let signature = key.sign(segment.as_bytes());
    let code = format!("{}.{}", segment, URL_SAFE_NO_PAD.encode(signature.to_bytes()));

    println!(
        "ATLAS_QR_KEYS={}={}",
        args.kid,
        URL_SAFE_NO_PAD.encode(key.verifying_key().to_bytes())
    );
    println!("{code}");

    if let Some(data_dir) = &args.seed_operator {
        let storage = Storage::open(data_dir)?;
        let operator = Operator {
            username: "admin".to_string(),
            password_hash: hash_password("admin")?,
        };
        match storage.create_operator(operator) {
            Ok(()) => println!("✅ Seeded operator admin/admin in {data_dir}"),
            Err(e) => println!("Operator not seeded: {e}"),
        }
        storage.flush().await?;
    }

    Ok(())
}
