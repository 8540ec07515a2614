//! `chainrange limits`: show the derived limitations of a chain's endpoints.

use anyhow::{Context, Result};

use chainrange_rpc::{FindingsFile, LimitationRegistry, MinDelay, RpcLimitations, RpcMethod, SafetyMargins};

pub async fn run(findings: &FindingsFile, margins: &SafetyMargins, chain: &str, url: Option<&str>, as_json: bool) -> Result<()> {
    let registry = LimitationRegistry::load(findings, margins).await?;

    let urls = match url {
        Some(url) => vec![url.to_string()],
        None => registry.urls_for_chain(chain).with_context(|| {
            let known: Vec<&str> = registry.chains().collect();
            format!("known chains: {}", known.join(", "))
        })?,
    };

    for url in urls {
        let limits = registry.get_limitations(chain, &url);
        if as_json {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "url": url, "limitations": limits }))?);
        } else {
            print_limits(chain, &url, &limits);
        }
    }
    Ok(())
}

fn print_limits(chain: &str, url: &str, limits: &RpcLimitations) {
    println!("{chain} {url}");
    println!("  archive node:       {}", if limits.is_archive_node { "yes" } else { "no" });
    match limits.min_delay_between_calls {
        MinDelay::NoLimit => println!("  min delay:          none"),
        MinDelay::Millis(ms) => println!("  min delay:          {ms}ms"),
    }
    println!("  getLogs block span: {}", limits.max_get_logs_block_span);
    if let Some(ms) = limits.internal_timeout_ms {
        println!("  internal timeout:   {ms}ms");
    }
    for method in RpcMethod::ALL {
        match limits.batch_size(method) {
            Some(size) => println!("  {:<26}  batches of {size}", method.as_str()),
            None => println!("  {:<26}  no batching", method.as_str()),
        }
    }
}
