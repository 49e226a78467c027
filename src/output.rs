//! Rendering sheet rows as Markdown or CSV.

use clap::ValueEnum;
use std::io::Write;

use sheetline_core::TableRow;

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Markdown,
    Csv,
}

pub fn write_rows<W: Write>(w: &mut W, format: OutputFormat, columns: &[String], rows: &[TableRow]) -> std::io::Result<()> {
    match format {
        OutputFormat::Markdown => write_markdown(w, columns, rows),
        OutputFormat::Csv => write_csv(w, columns, rows),
    }
}

fn cell(row: &TableRow, column: &str) -> String {
    row.values.get(column).map(|v| v.to_string()).unwrap_or_default()
}

fn write_markdown<W: Write>(w: &mut W, columns: &[String], rows: &[TableRow]) -> std::io::Result<()> {
    if rows.is_empty() {
        writeln!(w, "*No rows*")?;
        return Ok(());
    }

    write!(w, "| id |")?;
    for column in columns {
        write!(w, " {} |", escape_markdown(column))?;
    }
    writeln!(w)?;

    write!(w, "|---|")?;
    for _ in columns {
        write!(w, "---|")?;
    }
    writeln!(w)?;

    for row in rows {
        write!(w, "| {} |", row.id)?;
        for column in columns {
            write!(w, " {} |", escape_markdown(&cell(row, column)))?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn escape_markdown(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ").replace('\r', "")
}

fn write_csv<W: Write>(w: &mut W, columns: &[String], rows: &[TableRow]) -> std::io::Result<()> {
    let header: Vec<String> = std::iter::once("id".to_string())
        .chain(columns.iter().map(|c| escape_csv_field(c)))
        .collect();
    writeln!(w, "{}", header.join(","))?;
    for row in rows {
        let line: Vec<String> = std::iter::once(row.id.to_string())
            .chain(columns.iter().map(|c| escape_csv_field(&cell(row, c))))
            .collect();
        writeln!(w, "{}", line.join(","))?;
    }
    Ok(())
}

fn escape_csv_field(field: &str) -> String {
    // Guard against CSV formula injection in spreadsheet apps.
    let first_non_space = field.trim_start_matches([' ', '\t']).chars().next();
    let safe_field = if matches!(first_non_space, Some('=' | '+' | '@')) {
        format!("'{}", field)
    } else {
        field.to_string()
    };

    if safe_field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", safe_field.replace('"', "\"\""))
    } else {
        safe_field
    }
}
