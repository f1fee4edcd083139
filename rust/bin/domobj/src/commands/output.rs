//! Table and JSON rendering for command results.

use anyhow::Result;
use serde::Serialize;

/// Pretty-printed JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Left-aligned columns sized to their widest cell.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let line = |cells: Vec<&str>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(headers.to_vec());
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_pads_columns() {
        let rows = vec![
            vec!["Order|1|System.Int32".to_string(), "1".to_string()],
            vec!["Order|3|System.Int32".to_string(), "3".to_string()],
        ];
        let out = render_table(&["id", "OrderNumber"], &rows);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "id                    OrderNumber");
        assert_eq!(lines[1], "Order|1|System.Int32  1");
        assert_eq!(lines.len(), 3);
    }
}
