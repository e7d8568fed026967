//! Plain-text rendering of query results for chat clients.

use crate::executor::QueryResult;
use itertools::Itertools;

const MAX_CELL_WIDTH: usize = 40;

/// Renders the SQL and its rows as a fenced, column-aligned table.
pub fn render_result(sql: &str, result: &QueryResult) -> String {
    let mut out = format!("SQL Query: `{}`\n\nResults:\n", sql);
    if result.rows.is_empty() {
        out.push_str("No rows returned.");
        return out;
    }

    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(|v| clip(&v.to_string())).collect())
        .collect();
    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .filter_map(|row| row.get(i))
                .map(|c| c.chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .join(" | ")
            .trim_end()
            .to_string()
    };

    out.push_str("```\n");
    out.push_str(&line(&result.columns));
    out.push('\n');
    out.push_str(&widths.iter().map(|w| "-".repeat(*w)).join("-+-"));
    out.push('\n');
    out.push_str(&cells.iter().map(|row| line(row)).join("\n"));
    out.push_str("\n```");

    if result.truncated {
        out.push_str(&format!(
            "\n(showing the first {} rows; narrow the question to see the rest)",
            result.row_count
        ));
    }
    out
}

fn clip(value: &str) -> String {
    let flat = value.replace(['\n', '\r'], " ");
    if flat.chars().count() <= MAX_CELL_WIDTH {
        flat
    } else {
        let head: String = flat.chars().take(MAX_CELL_WIDTH - 1).collect();
        format!("{}…", head)
    }
}
