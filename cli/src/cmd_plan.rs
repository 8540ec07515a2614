//! `chainrange plan`: plan the query batches for a set of entity states.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use chainrange_core::{plan_queries, plan_summary, EntityState, PlannerOptions, QueryBatch, RangeValue};

pub fn run<T>(input: &Path, options: &PlannerOptions, as_json: bool) -> Result<()>
where
    T: RangeValue + Serialize + DeserializeOwned,
{
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("read states file '{}'", input.display()))?;
    let mut states: Vec<EntityState<T>> =
        serde_json::from_str(&text).with_context(|| format!("parse states file '{}'", input.display()))?;
    for state in &mut states {
        state.progress.normalize();
    }

    let plan = plan_queries(&states, options)?;
    let summary = plan_summary(&plan);
    info!(entities = states.len(), total_queries = summary.total_queries(), "plan ready");

    if as_json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Entities: {}", states.len());
    println!("Plan:     {summary}");
    for (i, batch) in plan.iter().enumerate() {
        print_batch(i + 1, batch);
    }
    Ok(())
}

fn print_batch<T: RangeValue>(index: usize, batch: &QueryBatch<T>) {
    match batch {
        QueryBatch::JsonRpc { queries } => {
            println!("\n#{index} json-rpc batch, {} queries", queries.len());
            for q in queries {
                println!("    {}  {}", q.entity_key, q.range);
            }
        }
        QueryBatch::Address { queries } => {
            println!("\n#{index} address batch, {} queries", queries.len());
            for q in queries {
                println!("    [{}]  {}", q.entity_keys.join(", "), q.range);
                for filter in &q.post_filters {
                    let ranges: Vec<String> = filter.ranges.iter().map(ToString::to_string).collect();
                    println!("      keep {}: {}", filter.entity_key, ranges.join(" "));
                }
            }
        }
    }
}
