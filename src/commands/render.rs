use anyhow::Result;
use clap::Args;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::sync::config::load_config;
use crate::sync::record::CanonicalFields;
use crate::sync::schema::Schema;
use crate::sync::source::read_rows;
use crate::sync::util::write_atomic;

#[derive(Debug, Args)]
pub struct RenderArgs {
    /// Tab-delimited input, one record per row
    #[arg(long)]
    pub input: PathBuf,

    /// JSON file receiving one rendered entry per row
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Debug, Serialize)]
struct Rendered {
    local_id: String,
    fields: CanonicalFields,
    #[serde(rename = "metadataBlocks", skip_serializing_if = "Option::is_none")]
    metadata_blocks: Option<Map<String, Value>>,
    unconsumed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn run(args: &RenderArgs) -> Result<CommandReport> {
    let config = load_config()?;
    let mut report = CommandReport::new("render");
    let schema = Schema::dataverse(&config.server.distributor);
    let id_column = config.identity.local_id_column.as_str();

    let rows = read_rows(&args.input)?;
    let mut rendered = Vec::with_capacity(rows.len());
    for row in &rows {
        let local_id = row.get(id_column).cloned().unwrap_or_default();
        let mut builder = match config.layout.build(row) {
            Ok(builder) => builder,
            Err(err) => {
                report.issue(format!("{local_id}: {err}"));
                continue;
            }
        };
        let fields = builder.output().clone();
        let unconsumed: Vec<String> = row
            .keys()
            .filter(|column| column.as_str() != id_column)
            .filter(|column| builder.has(row, column) && !builder.consumed().contains(*column))
            .cloned()
            .collect();
        if !unconsumed.is_empty() {
            report.detail(format!("{local_id}: unconsumed {}", unconsumed.join(", ")));
        }

        let (metadata_blocks, error) = match schema.metadata_blocks(&fields) {
            Ok(blocks) => (Some(blocks), None),
            Err(err) => {
                report.issue(format!("{local_id}: {err}"));
                (None, Some(err.to_string()))
            }
        };
        rendered.push(Rendered {
            local_id,
            fields,
            metadata_blocks,
            unconsumed,
            error,
        });
    }

    write_atomic(&args.out, &serde_json::to_vec_pretty(&rendered)?)?;
    report.detail(format!("rows={} out={}", rendered.len(), args.out.display()));
    Ok(report)
}
