//! Text rendering of tabular (SQL result set) evidence, bounded by row and
//! column caps with deterministic sampling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::SamplingStrategy;

/// Metadata describing how a result set was sampled into text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlExtractionMeta {
    pub total_rows: usize,
    pub total_cols: usize,
    pub sampled_rows: usize,
    pub sampled_cols: usize,
    pub sampling_strategy: String,
    pub sampling_note: String,
    pub cols_truncated: bool,
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// Render a result set as bounded text. Rows keep their original indices in
/// the rendering so a sampled row is still attributable to its position in
/// the full set.
pub fn extract_sql_result_text(
    rows: &[Vec<Value>],
    columns: &[String],
    max_rows: usize,
    max_cols: usize,
    sampling_strategy: SamplingStrategy,
) -> (String, SqlExtractionMeta) {
    let total_rows = rows.len();
    let total_cols = columns.len();

    let sampled_cols = total_cols.min(max_cols);
    let cols_truncated = sampled_cols < total_cols;

    // Pick (original_index, row) pairs per strategy.
    let (picked, sampling_note): (Vec<(usize, &Vec<Value>)>, String) = if total_rows <= max_rows {
        (
            rows.iter().enumerate().collect(),
            "All rows included".to_string(),
        )
    } else {
        match sampling_strategy {
            SamplingStrategy::FirstOnly => (
                rows.iter().enumerate().take(max_rows).collect(),
                format!("First {max_rows} rows of {total_rows}"),
            ),
            SamplingStrategy::FirstLast => {
                let head = max_rows / 2;
                let tail = max_rows - head;
                let mut picked: Vec<(usize, &Vec<Value>)> =
                    rows.iter().enumerate().take(head).collect();
                picked.extend(rows.iter().enumerate().skip(total_rows - tail));
                (
                    picked,
                    format!("First {head} and last {tail} rows of {total_rows}"),
                )
            }
            SamplingStrategy::Stride => {
                let stride = total_rows.div_ceil(max_rows);
                let picked: Vec<(usize, &Vec<Value>)> = rows
                    .iter()
                    .enumerate()
                    .step_by(stride)
                    .take(max_rows)
                    .collect();
                (
                    picked,
                    format!("Every {stride}th row of {total_rows} (stride sampling)"),
                )
            }
        }
    };

    let sampled_rows = picked.len();

    let mut lines = Vec::new();
    if cols_truncated {
        lines.push(format!("Showing {sampled_cols} of {total_cols} columns"));
    }
    lines.push(format!("Columns: {}", columns[..sampled_cols].join(" | ")));
    lines.push(format!("({total_rows} rows total, {sampled_rows} shown)"));

    for (index, row) in &picked {
        let cells: Vec<String> = row.iter().take(sampled_cols).map(render_value).collect();
        lines.push(format!("Row {index}: {}", cells.join(" | ")));
    }

    let meta = SqlExtractionMeta {
        total_rows,
        total_cols,
        sampled_rows,
        sampled_cols,
        sampling_strategy: sampling_strategy.as_str().to_string(),
        sampling_note,
        cols_truncated,
    };

    (lines.join("\n"), meta)
}
