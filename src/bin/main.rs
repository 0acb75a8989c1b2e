// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use wallet_engine_rs::{
    AssetType, Engine, EngineConfig, EngineError, MemoryStore, PurchaseRequest, RefundOptions,
    Sku, TransactionId, UserId,
};

/// Wallet Engine - Apply wallet command CSV files
///
/// Reads wallet commands from a CSV file and outputs wallet states to stdout.
/// Supports credits, deductions, coin top-ups, purchases, and refunds.
#[derive(Parser, Debug)]
#[command(name = "wallet-engine-rs")]
#[command(about = "An idempotent wallet engine that applies command CSVs", long_about = None)]
struct Args {
    /// Path to CSV file with commands
    ///
    /// Expected format: op,user,key,sku,character,amount,tx,reason,force
    /// Example: cargo run -- commands.csv > wallets.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

fn main() {
    let args = Args::parse();

    // Logs go to stderr so stdout stays clean CSV.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone(), EngineConfig::from_env());
        run_commands(&engine, BufReader::new(file)).await?;
        write_wallets(&engine, &store.user_ids(), std::io::stdout()).await
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
}

/// Raw CSV record matching the input format.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    user: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    key: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    sku: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    character: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    tx: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    reason: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    force: Option<bool>,
}

impl CsvRecord {
    async fn apply(self, engine: &Engine) -> Result<(), EngineError> {
        let user = UserId::new(self.user);
        let key = self.key.filter(|k| !k.trim().is_empty());
        let reason = self.reason.unwrap_or_else(|| "csv import".to_string());

        match self.op.to_lowercase().as_str() {
            "credit" => {
                let amount = self.amount.ok_or(EngineError::MissingParameter("amount"))?;
                engine.credit(&user, amount, &reason, key.as_deref()).await?;
            }
            "deduct" => {
                let amount = self.amount.ok_or(EngineError::MissingParameter("amount"))?;
                engine.deduct(&user, amount, &reason, key.as_deref()).await?;
            }
            "topup" => {
                let sku = self.sku.ok_or(EngineError::MissingParameter("sku"))?;
                let key = key.ok_or(EngineError::MissingParameter("key"))?;
                engine.top_up(&user, &Sku::new(sku), &key).await?;
            }
            "purchase" => {
                let sku = self.sku.ok_or(EngineError::MissingParameter("sku"))?;
                let key = key.ok_or(EngineError::MissingParameter("key"))?;
                let mut request = PurchaseRequest::new(sku);
                if let Some(character) = self.character {
                    request = request.for_character(character);
                }
                engine.purchase(&user, &request, &key).await?;
            }
            "refund" => {
                let tx = self.tx.ok_or(EngineError::MissingParameter("tx"))?;
                let options = RefundOptions {
                    force: self.force.unwrap_or(false),
                    idempotency_key: key,
                    ..RefundOptions::default()
                };
                engine
                    .refund(&user, TransactionId(tx), &reason, &options)
                    .await?;
            }
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "unknown operation '{other}'"
                )));
            }
        }
        Ok(())
    }
}

/// Applies commands from a CSV reader, one at a time, in file order.
///
/// Malformed rows and rejected commands are logged and skipped.
///
/// # CSV Format
///
/// Expected columns: `op, user, key, sku, character, amount, tx, reason, force`
/// - `op`: credit, deduct, topup, purchase, refund
/// - `key`: idempotency key (required for topup and purchase)
/// - `tx`: ledger entry id to refund
///
/// # Example
///
/// ```csv
/// op,user,key,sku,character,amount,tx,reason,force
/// credit,alice,,,,500,,welcome,
/// purchase,alice,order-1,video-unlock-5,,,,,
/// refund,alice,,,,,2,changed mind,
/// ```
/// Applies every command with the idempotency sweep running, so the local
/// cache stays within its capacity on long inputs.
async fn run_commands<R: Read>(engine: &Engine, reader: R) -> Result<(), csv::Error> {
    engine.start();
    let processed = process_commands(engine, reader).await;
    engine.stop();
    processed
}

async fn process_commands<R: Read>(engine: &Engine, reader: R) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line + 1, error = %e, "skipping malformed row");
                continue;
            }
        };
        let op = record.op.clone();
        match record.apply(engine).await {
            Ok(()) => debug!(line = line + 1, op = %op, "command applied"),
            Err(e) => warn!(line = line + 1, op = %op, code = e.code(), error = %e, "skipping rejected command"),
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct WalletRow {
    user: String,
    balance: u64,
    character_unlock_cards: u64,
    photo_unlock_cards: u64,
    video_unlock_cards: u64,
    voice_unlock_cards: u64,
    create_cards: u64,
}

/// Writes one row per user, in user id order.
///
/// # CSV Format
///
/// Columns: `user, balance, character_unlock_cards, photo_unlock_cards,
/// video_unlock_cards, voice_unlock_cards, create_cards`
async fn write_wallets<W: Write>(
    engine: &Engine,
    users: &[UserId],
    writer: W,
) -> Result<(), CliError> {
    let mut wtr = Writer::from_writer(writer);
    for user in users {
        let account = engine.ledger().account(user).await?;
        let inventory = account.inventory();
        wtr.serialize(WalletRow {
            user: user.to_string(),
            balance: account.balance(),
            character_unlock_cards: inventory.quantity(AssetType::CharacterUnlockCard),
            photo_unlock_cards: inventory.quantity(AssetType::PhotoUnlockCard),
            video_unlock_cards: inventory.quantity(AssetType::VideoUnlockCard),
            voice_unlock_cards: inventory.quantity(AssetType::VoiceUnlockCard),
            create_cards: inventory.quantity(AssetType::CreateCard),
        })?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}
