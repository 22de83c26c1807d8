//! `seqflow checkpoints`: list the stage markers recorded in a work dir.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use seqflow_core::checkpoint::CheckpointStore;
use seqflow_infra::checkpoint::FileCheckpointStore;
use seqflow_infra::config::load_system_config;
use seqflow_types::config::BackendKind;

pub async fn list_checkpoints(config: &Path, backend: Option<BackendKind>, json: bool) -> Result<()> {
    let config = load_system_config(config)
        .await
        .with_context(|| format!("loading system config {}", config.display()))?;
    let kind = backend.unwrap_or(config.backend.kind);
    let store = FileCheckpointStore::new(&config.work_dir, kind);
    let keys = store.list().await?;

    let mut rows = Vec::with_capacity(keys.len());
    for key in &keys {
        let marker = store.dir().join(key.file_name());
        // Markers written by older runs may be empty; only presence matters.
        let written = tokio::fs::read_to_string(&marker)
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        rows.push((key, written));
    }

    if json {
        let entries: Vec<_> = rows
            .iter()
            .map(|(key, written)| {
                serde_json::json!({
                    "sequence": key.sequence,
                    "stage": key.stage,
                    "written": written,
                })
            })
            .collect();
        let out = serde_json::json!({
            "backend": kind.as_str(),
            "dir": store.dir().display().to_string(),
            "checkpoints": entries,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!();
        println!(
            "  No checkpoints in {}",
            style(store.dir().display()).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::White),
            Cell::new("Stage").fg(Color::White),
            Cell::new("Written").fg(Color::White),
        ]);
    for (key, written) in &rows {
        table.add_row(vec![
            Cell::new(key.sequence),
            Cell::new(&key.stage),
            Cell::new(written),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {} checkpoint(s) for the {} backend in {}",
        style(rows.len()).bold(),
        style(kind).cyan(),
        style(store.dir().display()).dim()
    );
    println!();
    Ok(())
}
