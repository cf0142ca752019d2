use std::collections::HashSet;
use std::fs;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;

use atlas_entry::config::Config;
use atlas_entry::qr;
use atlas_entry::verify::{classify, ValidationContext};

const TOKEN_FILE: &str = ".atlas_token";

#[derive(Parser)]
#[command(name = "atlas-entry-cli")]
#[command(about = "CLI for the Atlas entry station", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, env = "ATLAS_STATION_URL", default_value = "http://localhost:11111")]
    url: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Entry,
    Exit,
}

impl Action {
    fn wire(self) -> &'static str {
        match self {
            Action::Entry => "ENTRY",
            Action::Exit => "EXIT",
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Status {
    Pending,
    Synced,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a code locally and print its payload
    Decode {
        qr: String,
    },
    /// Classify a code locally with the keys from ATLAS_QR_KEYS
    Verify {
        qr: String,
        #[arg(short, long, value_delimiter = ',')]
        revoked: Vec<i64>,
    },
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    Scan {
        qr: String,
        #[arg(short, long, value_enum, default_value = "entry")]
        action: Action,
    },
    Events {
        #[arg(short, long, value_enum)]
        status: Option<Status>,
    },
    Sync,
    /// Replace the station's cached revocation list
    Revoke {
        #[arg(value_delimiter = ',')]
        auth_ids: Vec<i64>,
    },
    RefreshRevocations,
    Logout,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

fn authorized(request: RequestBuilder) -> RequestBuilder {
    let token = fs::read_to_string(TOKEN_FILE).unwrap_or_default();
    request.header("Authorization", format!("Bearer {}", token.trim()))
}

async fn print_response(request: RequestBuilder) -> Result<(), Box<dyn std::error::Error>> {
    let res = request.send().await?;
    println!("{} {}", res.status(), res.text().await?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Decode { qr } => match qr::parse(&qr) {
            Ok(parsed) => {
                println!("{}", serde_json::to_string_pretty(&parsed.payload)?);
                println!("signature: {} bytes", parsed.signature_bytes.len());
            }
            Err(e) => {
                println!("FORMAT_ERROR: {e}");
                std::process::exit(2);
            }
        },
        Commands::Verify { qr, revoked } => {
            let config = Config::from_env()?;
            let keys = config.key_ring()?;
            let revoked: HashSet<i64> = revoked.into_iter().collect();
            let parsed = qr::parse(&qr).ok();
            let ctx = ValidationContext::new(Utc::now(), config.max_clock_skew_minutes, &revoked, &keys);
            let result = classify(parsed.as_ref(), &ctx);
            println!("{result}");
            if !result.grants_access() {
                std::process::exit(1);
            }
        }
        Commands::Register { username, password } => {
            print_response(
                client
                    .post(format!("{}/register", cli.url))
                    .json(&json!({ "username": username, "password": password })),
            )
            .await?;
        }
        Commands::Login { username, password } => {
            let res = client
                .post(format!("{}/login", cli.url))
                .json(&json!({ "username": username, "password": password }))
                .send()
                .await?;
            if res.status().is_success() {
                let body: LoginResponse = res.json().await?;
                fs::write(TOKEN_FILE, body.token)?;
                println!("Logged in. Token saved to {TOKEN_FILE}");
            } else {
                println!("Login failed: {}", res.text().await?);
            }
        }
        Commands::Scan { qr, action } => {
            print_response(authorized(
                client
                    .post(format!("{}/scans", cli.url))
                    .json(&json!({ "qr": qr, "action": action.wire() })),
            ))
            .await?;
        }
        Commands::Events { status } => {
            let mut request = client.get(format!("{}/events", cli.url));
            if let Some(status) = status {
                let status = match status {
                    Status::Pending => "PENDING",
                    Status::Synced => "SYNCED",
                };
                request = request.query(&[("status", status)]);
            }
            print_response(authorized(request)).await?;
        }
        Commands::Sync => {
            print_response(authorized(client.post(format!("{}/sync", cli.url)))).await?;
        }
        Commands::Revoke { auth_ids } => {
            print_response(authorized(
                client
                    .put(format!("{}/revocations", cli.url))
                    .json(&json!({ "authIds": auth_ids })),
            ))
            .await?;
        }
        Commands::RefreshRevocations => {
            print_response(authorized(
                client.post(format!("{}/revocations/refresh", cli.url)),
            ))
            .await?;
        }
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Logged out (token removed).");
        }
    }

    Ok(())
}
