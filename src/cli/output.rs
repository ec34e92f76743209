//! Output formatting utilities for the CLI.

use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};
use console::{style, StyledObject};
use serde::Serialize;

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate a string to at most `max_len` characters, appending "..." if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Create a standard list table with the given headers.
///
/// Uses the NOTHING preset (no borders) for a clean CLI aesthetic.
pub fn list_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h.to_uppercase()).set_alignment(CellAlignment::Left)),
        );
    table
}

/// Render the table with a count header.
pub fn render_list(entity_name: &str, table: &Table, total: usize) -> String {
    if total == 0 {
        return format!("No {entity_name}s found.");
    }
    let noun = if total == 1 {
        entity_name.to_string()
    } else {
        format!("{entity_name}s")
    };
    format!("{} {noun}:\n{table}", style(total).bold())
}

/// Colour a task or execution status.
///
/// - Green: done, succeeded
/// - Yellow: in_progress, running
/// - Blue: pending
/// - Cyan: blocked
/// - Red: failed, escalated
/// - Dim: cancelled, rolled_back
pub fn colorize_status(status: &str) -> StyledObject<&str> {
    match status {
        "done" | "succeeded" => style(status).green().bold(),
        "in_progress" | "running" => style(status).yellow(),
        "pending" => style(status).blue(),
        "blocked" => style(status).cyan(),
        "failed" | "escalated" => style(status).red().bold(),
        "cancelled" | "rolled_back" => style(status).dim(),
        _ => style(status).white(),
    }
}

/// Short form of a commit sha.
pub fn short_ref(reference: &str) -> &str {
    let is_sha = reference.len() >= 12 && reference.chars().all(|c| c.is_ascii_hexdigit());
    if is_sha {
        &reference[..12]
    } else {
        reference
    }
}
