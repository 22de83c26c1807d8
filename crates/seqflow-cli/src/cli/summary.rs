//! Run summary output.

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use seqflow_core::runner::{RunReport, StageOutcome};

/// Print what each stage did and which files the run produced.
pub fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "stages": report.stages,
            "records": report.records,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::White),
            Cell::new("Stage").fg(Color::White),
            Cell::new("Status").fg(Color::White),
            Cell::new("Items").fg(Color::White),
            Cell::new("Workers").fg(Color::White),
            Cell::new("Results").fg(Color::White),
            Cell::new("Time").fg(Color::White),
        ]);
    for outcome in &report.stages {
        table.add_row(stage_row(outcome));
    }

    println!();
    println!("{table}");

    println!();
    println!("  {}", style("── Outputs ──").dim());
    for record in &report.records {
        let region = record
            .region
            .as_ref()
            .map(|r| format!(" @ {r}"))
            .unwrap_or_default();
        println!("  {}{}", style(&record.name).bold(), style(region).dim());
        for (role, path) in &record.files {
            println!("    {:<12} {}", role, style(path.display()).dim());
        }
    }
    println!();
    Ok(())
}

fn stage_row(outcome: &StageOutcome) -> Vec<Cell> {
    let status = if outcome.restored {
        Cell::new("restored").fg(Color::DarkGrey)
    } else {
        Cell::new("ran").fg(Color::Green)
    };
    let workers = match &outcome.allocation {
        Some(alloc) => match alloc.memory_per_worker {
            Some(mem) => format!("{} x {}c/{mem}", alloc.workers, alloc.cores_per_worker),
            None => format!("{} x {}c", alloc.workers, alloc.cores_per_worker),
        },
        None => "-".to_string(),
    };
    vec![
        Cell::new(outcome.sequence),
        Cell::new(&outcome.stage),
        status,
        Cell::new(outcome.items),
        Cell::new(workers),
        Cell::new(outcome.results),
        Cell::new(format_elapsed(outcome.elapsed)),
    ]
}

fn format_elapsed(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
