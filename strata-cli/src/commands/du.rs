//! Disk usage command.

use crate::client::StrataClient;
use crate::commands::format_size;
use anyhow::Result;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

pub async fn du() -> Result<()> {
    let mut client = StrataClient::connect().await?;
    let records = client.disk_usage().await?;

    if records.is_empty() {
        println!("Cache is empty.");
        println!();
        println!("Run a build with: {}", "strata build plan.json".cyan());
        return Ok(());
    }

    #[derive(Tabled)]
    struct UsageRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "TYPE")]
        kind: String,
        #[tabled(rename = "IN USE")]
        in_use: String,
        #[tabled(rename = "SIZE")]
        size: String,
    }

    let total: i64 = records.iter().map(|r| r.size).sum();
    let rows: Vec<UsageRow> = records
        .iter()
        .map(|r| UsageRow {
            id: r.id.chars().take(16).collect(),
            kind: if r.mutable { "mutable" } else { "committed" }.to_string(),
            in_use: if r.in_use { "yes" } else { "no" }.to_string(),
            size: format_size(r.size),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::blank());
    println!("{}", table);
    println!();
    println!("Total: {}", format_size(total).bold());
    Ok(())
}
