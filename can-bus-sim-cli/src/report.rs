//! Report generation
//!
//! Plain-text summary table for the terminal and JSON export of the full
//! simulation report, including every node's TEC history.

use anyhow::{Context, Result};
use can_bus_sim::SimulationReport;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Render the per-node summary table
pub fn format_summary(report: &SimulationReport) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{:<12} {:>6} {:>4} {:>4}  {:<14} {:>8} {:>9} {:>8} {:>8} {:>8}",
        "Node", "Period", "TEC", "REC", "Status", "Attempts", "Completed", "BitErr", "StuffErr", "ArbLost"
    );
    let _ = writeln!(out, "{}", "─".repeat(92));
    for node in &report.nodes {
        let _ = writeln!(
            out,
            "{:<12} {:>6} {:>4} {:>4}  {:<14} {:>8} {:>9} {:>8} {:>8} {:>8}",
            node.name,
            node.period,
            node.tec,
            node.rec,
            node.status.to_string(),
            node.stats.attempts,
            node.stats.completed,
            node.stats.bit_errors,
            node.stats.stuff_errors,
            node.stats.arbitration_losses
        );
    }

    let _ = writeln!(out);
    for node in &report.nodes {
        let _ = writeln!(out, "  {:<12} {}", node.name, node.frame);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Bus frames:      {}", report.frame_count);
    let _ = writeln!(out, "Bus ticks:       {}", report.bus_ticks);
    let elapsed = report.finished_at - report.started_at;
    let _ = writeln!(
        out,
        "Duration:        {}.{:03} s",
        elapsed.num_seconds(),
        elapsed.num_milliseconds() % 1000
    );
    if let Some(period) = report.inferred_period {
        let _ = writeln!(out, "Inferred period: {}", period);
    }
    if let Some(reason) = &report.stop_reason {
        let _ = writeln!(out, "Stopped:         {}", reason);
    }

    out
}

/// Write the full report as pretty-printed JSON
pub fn write_json(report: &SimulationReport, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create report file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .with_context(|| format!("Failed to write report file: {:?}", path))?;
    writer
        .flush()
        .with_context(|| format!("Failed to write report file: {:?}", path))?;
    Ok(())
}
