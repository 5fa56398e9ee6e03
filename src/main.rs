use picotinho::config::Config;
use picotinho::pipeline::{Pipeline, ProcessOptions, ProcessOutcome};
use tracing::{info, warn};

const CONFIG_PATH: &str = ".config/picotinho.toml";

const USAGE: &str = "usage:
  picotinho submit <user> <document-ref>
  picotinho process <receipt-id> [--force]
  picotinho confirm <receipt-id> yes|no
  picotinho retry <receipt-id>
  picotinho consolidate <user>
  picotinho recover
  picotinho inventory <user>
  picotinho consume <user> <product-id> <quantity>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = match Config::load(CONFIG_PATH) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("using default configuration ({CONFIG_PATH}: {e})");
            Config::default()
        }
    };

    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(cfg.log_filter.as_str())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let pipeline = Pipeline::from_config(&cfg)?;

    match args.as_slice() {
        ["submit", user, document_ref] => {
            let id = pipeline.submit_receipt(user, document_ref)?;
            println!("{id}");
        }
        ["process", id, rest @ ..] => {
            let force = rest.contains(&"--force");
            let outcome = pipeline
                .process_receipt(id.parse()?, ProcessOptions { force })
                .await?;
            report_outcome(&outcome);
        }
        ["confirm", id, answer @ ("yes" | "no")] => {
            let outcome = pipeline
                .confirm_ambiguous_receipt(id.parse()?, *answer == "yes")
                .await?;
            report_outcome(&outcome);
        }
        ["retry", id] => {
            pipeline.retry_receipt(id.parse()?)?;
            info!(receipt_id = %id, "Receipt back in pending");
        }
        ["consolidate", user] => {
            let report = pipeline.consolidate_inventory_duplicates(user)?;
            println!(
                "groups consolidated: {}, rows removed: {}, empty rows purged: {}",
                report.groups_consolidated, report.rows_removed, report.empty_rows_purged
            );
        }
        ["recover"] => {
            let report = pipeline.recover_stuck_receipts()?;
            println!("requeued: {:?}, failed: {:?}", report.requeued, report.failed);
        }
        ["inventory", user] => {
            for entry in pipeline.inventory(user)? {
                let product = entry
                    .product_id
                    .map_or_else(|| "-".to_string(), |id| id.to_string());
                let price = entry
                    .unit_price
                    .map_or_else(|| "-".to_string(), |p| format!("{p:.2}"));
                println!("{product:>6}  {:<40} {:>10.3}  {price:>8}", entry.product_name, entry.quantity);
            }
        }
        ["consume", user, product_id, quantity] => {
            let remaining = pipeline.consume_stock(user, product_id.parse()?, quantity.parse()?)?;
            println!("{remaining}");
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    // Print statistics
    let counts = pipeline.store().receipt_counts()?;
    info!(
        products = pipeline.store().product_count()?,
        receipts = ?counts,
        "Store summary"
    );

    Ok(())
}

fn report_outcome(outcome: &ProcessOutcome) {
    match outcome {
        ProcessOutcome::Merged(report) => {
            println!("merged: {} applied, {} failed", report.items_applied, report.items_failed);
            for failure in &report.failures {
                println!("  line {}: {} ({})", failure.line_index, failure.description, failure.reason);
            }
        }
        ProcessOutcome::PartialMerge(report) => {
            if let Some(e) = outcome.blocking_error() {
                warn!(error = %e, "Receipt kept normalized for retry");
            }
            println!("partial: {} applied, {} failed", report.items_applied, report.items_failed);
            for failure in &report.failures {
                println!("  line {}: {} ({})", failure.line_index, failure.description, failure.reason);
            }
        }
        ProcessOutcome::AlreadyMerged => println!("already merged"),
        ProcessOutcome::AwaitingConfirmation => println!("awaiting confirmation"),
        ProcessOutcome::Retryable(e) => println!("retryable: {e}"),
        ProcessOutcome::Failed(e) => println!("failed: {e}"),
        ProcessOutcome::Rejected { reason } => println!("rejected: {reason}"),
    }
}
