//! Transfer load tool
//!
//! Fires concurrent transfers in both directions between two fresh accounts,
//! then checks that money was conserved.
//!
//! Run with: cargo run --bin transfer_load --release -- --transfers 1000 --concurrency 20

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};

use simple_bank::ledger::TransferTxParams;
use simple_bank::store::{CreateAccountParams, CreateUserParams, PgStore, Store};
use simple_bank::worker::{random_string, BrokerTaskDistributor, PgBroker};
use simple_bank::{db, Config, Ledger, OperationContext};

const INITIAL_BALANCE: i64 = 1_000_000;

fn arg(args: &[String], name: &str, default: usize) -> usize {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let transfer_count = arg(&args, "--transfers", 1000);
    let concurrency = arg(&args, "--concurrency", 20);

    let config = Config::from_env()?;

    println!(
        "Transfer Load - {} transfers, concurrency {}",
        transfer_count, concurrency
    );
    println!("Connecting to database...");

    let pool = db::connect(&config).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let distributor = Arc::new(BrokerTaskDistributor::new(Arc::new(PgBroker::new(pool.clone()))));
    let ledger = Ledger::new(store.clone(), distributor);
    let ctx = OperationContext::new();

    let mut account_ids = Vec::new();
    let mut conn = store.connect(&ctx).await?;
    for _ in 0..2 {
        let username = format!("load_{}", random_string(10).to_lowercase());
        conn.create_user(
            &ctx,
            &CreateUserParams {
                username: username.clone(),
                hashed_password: "unused".to_string(),
                full_name: "Load Test".to_string(),
                email: format!("{}@example.com", username),
            },
        )
        .await?;
        let account = conn
            .create_account(
                &ctx,
                &CreateAccountParams {
                    owner: username,
                    balance: INITIAL_BALANCE,
                    currency: "USD".to_string(),
                },
            )
            .await?;
        account_ids.push(account.id);
    }
    drop(conn);

    let (a, b) = (account_ids[0], account_ids[1]);
    let start = Instant::now();

    let results: Vec<bool> = stream::iter(0..transfer_count)
        .map(|i| {
            let ledger = ledger.clone();
            let ctx = ctx.clone();
            let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
            async move {
                ledger
                    .transfer_tx(
                        &ctx,
                        TransferTxParams {
                            from_account_id: from,
                            to_account_id: to,
                            amount: 1 + (i % 10) as i64,
                        },
                    )
                    .await
                    .map_err(|e| eprintln!("transfer {} failed: {}", i, e))
                    .is_ok()
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let elapsed = start.elapsed();
    let success_count = results.iter().filter(|ok| **ok).count();

    let account_a = ledger.get_account(&ctx, a).await?;
    let account_b = ledger.get_account(&ctx, b).await?;
    let total = account_a.balance + account_b.balance;

    let entry_sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM entries WHERE account_id = ANY($1)",
    )
    .bind(&account_ids)
    .fetch_one(&pool)
    .await?;

    println!("\n=== Transfer Load Results ===");
    println!("Total transfers: {}", transfer_count);
    println!("Successful: {}", success_count);
    println!("Time: {:.2}s", elapsed.as_secs_f64());
    println!(
        "Rate: {:.0} transfers/sec",
        success_count as f64 / elapsed.as_secs_f64()
    );
    println!("Balances: {} = {}, {} = {}", a, account_a.balance, b, account_b.balance);

    pool.close().await;

    if total != 2 * INITIAL_BALANCE || entry_sum != 0 {
        anyhow::bail!(
            "consistency check failed: total balance {}, entry sum {}",
            total,
            entry_sum
        );
    }
    println!("Consistency check passed");

    Ok(())
}
