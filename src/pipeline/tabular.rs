//! Direct converters for files that need no layout analysis.
//!
//! All functions are blocking and are called from `spawn_blocking`.
//!
//! | Kind | Units | Rendering |
//! |------|-------|-----------|
//! | `.txt` | 1 | file content as-is |
//! | `.csv` | 1 | GFM table, first row is the header |
//! | `.xlsx` `.xls` `.ods` | one per non-empty sheet | `# Sheet: {name}` + GFM table |
//! | `.docx` | 1 | paragraphs separated by blank lines, tables as GFM |

use crate::error::UnitError;
use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;
use tracing::{debug, warn};

/// Read a UTF-8 text file.
pub fn text_to_markdown(path: &Path) -> Result<String, UnitError> {
    std::fs::read_to_string(path)
        .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))
}

/// Render a CSV file as one table.
pub fn csv_to_markdown(path: &Path) -> Result<String, UnitError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    debug!(path = %path.display(), rows = rows.len(), "parsed CSV");
    Ok(markdown_table(&rows))
}

/// A sheet name with its Markdown, or the reason the sheet could not be read.
pub type SheetMarkdown = (String, Result<String, UnitError>);

/// Render every non-empty sheet of a workbook.
///
/// Only a workbook that cannot be opened fails as a whole; a sheet that
/// cannot be read is returned as an `Err` entry in its position.
pub fn spreadsheet_to_markdown(path: &Path) -> Result<Vec<SheetMarkdown>, UnitError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names().to_vec() {
        let rows: Result<Vec<Vec<String>>, String> = workbook
            .worksheet_range(&name)
            .map(|range| {
                range
                    .rows()
                    .map(|row| row.iter().map(cell_text).collect())
                    .collect()
            })
            .map_err(|e| e.to_string());
        sheets.push((name, rows));
    }
    Ok(render_sheets(sheets))
}

fn render_sheets<I>(sheets: I) -> Vec<SheetMarkdown>
where
    I: IntoIterator<Item = (String, Result<Vec<Vec<String>>, String>)>,
{
    let mut out = Vec::new();
    for (name, rows) in sheets {
        let rows: Vec<Vec<String>> = match rows {
            Ok(rows) => rows
                .into_iter()
                .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
                .collect(),
            Err(detail) => {
                warn!(sheet = %name, "cannot read sheet: {detail}");
                let err = UnitError::extraction(format!("sheet '{name}': {detail}"));
                out.push((name, Err(err)));
                continue;
            }
        };
        if rows.is_empty() {
            debug!(sheet = %name, "skipping empty sheet");
            continue;
        }
        let markdown = format!("# Sheet: {name}\n\n{}", markdown_table(&rows));
        out.push((name, Ok(markdown)));
    }
    out
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

/// Extract the body of a Word document.
pub fn docx_to_markdown(path: &Path) -> Result<String, UnitError> {
    let bytes =
        std::fs::read(path).map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))?;
    let docx = docx_rs::read_docx(&bytes)
        .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))?;

    let mut blocks = Vec::new();
    for child in &docx.document.children {
        match child {
            docx_rs::DocumentChild::Paragraph(para) => {
                let text = paragraph_text(para);
                if !text.trim().is_empty() {
                    blocks.push(text);
                }
            }
            docx_rs::DocumentChild::Table(table) => {
                let rows: Vec<Vec<String>> = table
                    .rows
                    .iter()
                    .map(|row| {
                        let docx_rs::TableChild::TableRow(tr) = row;
                        tr.cells
                            .iter()
                            .map(|cell| {
                                let docx_rs::TableRowChild::TableCell(tc) = cell;
                                tc.children
                                    .iter()
                                    .filter_map(|c| match c {
                                        docx_rs::TableCellContent::Paragraph(p) => {
                                            Some(paragraph_text(p))
                                        }
                                        _ => None,
                                    })
                                    .filter(|t| !t.trim().is_empty())
                                    .collect::<Vec<_>>()
                                    .join(" ")
                            })
                            .collect()
                    })
                    .collect();
                if !rows.is_empty() {
                    blocks.push(markdown_table(&rows).trim_end().to_string());
                }
            }
            _ => {}
        }
    }
    Ok(blocks.join("\n\n"))
}

fn paragraph_text(para: &docx_rs::Paragraph) -> String {
    let mut out = String::new();
    for child in &para.children {
        match child {
            docx_rs::ParagraphChild::Run(run) => push_run_text(run, &mut out),
            docx_rs::ParagraphChild::Hyperlink(link) => {
                for inner in &link.children {
                    if let docx_rs::ParagraphChild::Run(run) = inner {
                        push_run_text(run, &mut out);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn push_run_text(run: &docx_rs::Run, out: &mut String) {
    for child in &run.children {
        match child {
            docx_rs::RunChild::Text(text) => out.push_str(&text.text),
            docx_rs::RunChild::Tab(_) => out.push('\t'),
            docx_rs::RunChild::Break(_) => out.push('\n'),
            _ => {}
        }
    }
}

/// GFM pipe table with the first row as header.
///
/// Short rows are padded to the widest row; `|` and newlines inside cells are
/// escaped so each row stays on one line.
pub fn markdown_table(rows: &[Vec<String>]) -> String {
    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let render = |row: &[String]| -> String {
        let mut line = String::from("|");
        for i in 0..width {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            let cell = cell.trim().replace('|', "\\|").replace(['\r', '\n'], " ");
            line.push(' ');
            line.push_str(&cell);
            line.push_str(" |");
        }
        line.push('\n');
        line
    };

    let mut out = render(header);
    out.push('|');
    out.push_str(&" --- |".repeat(width));
    out.push('\n');
    for row in body {
        out.push_str(&render(row));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn table_pads_ragged_rows() {
        let md = markdown_table(&rows(&[&["a", "b", "c"], &["1"]]));
        assert_eq!(md, "| a | b | c |\n| --- | --- | --- |\n| 1 |  |  |\n");
    }

    #[test]
    fn table_escapes_pipes_and_newlines() {
        let md = markdown_table(&rows(&[&["h"], &["x|y\nz"]]));
        assert!(md.contains("| x\\|y z |"), "{md}");
    }

    #[test]
    fn empty_table_is_empty() {
        assert_eq!(markdown_table(&[]), "");
    }

    #[test]
    fn csv_first_row_is_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "name,qty\nbolt,4\nnut\n").unwrap();
        let md = csv_to_markdown(&path).unwrap();
        assert_eq!(md, "| name | qty |\n| --- | --- |\n| bolt | 4 |\n| nut |  |\n");
    }

    #[test]
    fn text_is_read_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.txt");
        std::fs::write(&path, "line 1\nline 2\n").unwrap();
        assert_eq!(text_to_markdown(&path).unwrap(), "line 1\nline 2\n");
    }

    #[test]
    fn missing_workbook_is_extraction_failure() {
        let err = spreadsheet_to_markdown(Path::new("/nonexistent/book.xlsx")).unwrap_err();
        assert!(matches!(err, UnitError::ExtractionFailure { .. }));
    }

    #[test]
    fn unreadable_sheet_fails_alone() {
        let sheets = render_sheets(vec![
            ("Q1".to_string(), Ok(rows(&[&["item", "qty"], &["bolt", "4"]]))),
            ("Broken".to_string(), Err("bad XML".to_string())),
            ("Blank".to_string(), Ok(rows(&[&["", " "]]))),
            ("Q2".to_string(), Ok(rows(&[&["item"], &["nut"]]))),
        ]);

        let names: Vec<&str> = sheets.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["Q1", "Broken", "Q2"]);
        assert!(sheets[0].1.as_ref().unwrap().starts_with("# Sheet: Q1\n\n| item | qty |"));
        assert!(matches!(
            &sheets[1].1,
            Err(UnitError::ExtractionFailure { detail }) if detail.contains("sheet 'Broken'")
        ));
        assert!(sheets[2].1.is_ok());
    }

    #[test]
    fn docx_paragraphs_are_separated_by_blank_lines() {
        use docx_rs::{Docx, Paragraph, Run};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.docx");
        let file = std::fs::File::create(&path).unwrap();
        Docx::new()
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text("First")))
            .add_paragraph(Paragraph::new())
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text("Second")))
            .build()
            .pack(file)
            .unwrap();

        assert_eq!(docx_to_markdown(&path).unwrap(), "First\n\nSecond");
    }
}
