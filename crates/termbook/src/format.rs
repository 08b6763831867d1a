//! Notebook file persistence.
//!
//! On disk a notebook is Jupyter's `.ipynb` v4 JSON; in memory it is the
//! cell list of [`crate::notebook::NotebookState`]. Conversion goes through
//! the `nbformat` crate for the envelope, with outputs carried as JSON
//! values in nbformat wire shape. Legacy notebooks are upgraded on load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kernel_driver::StreamName;
use log::debug;
use serde_json::{json, Value};

use crate::cell::{Cell, CellKind, ExecutionLabel, OutputEntry};
use crate::notebook::NotebookState;

pub fn empty_metadata() -> nbformat::v4::Metadata {
    nbformat::v4::Metadata {
        kernelspec: None,
        language_info: None,
        authors: None,
        additional: HashMap::new(),
    }
}

fn empty_cell_metadata() -> nbformat::v4::CellMetadata {
    nbformat::v4::CellMetadata {
        id: None,
        collapsed: None,
        scrolled: None,
        deletable: None,
        editable: None,
        format: None,
        name: None,
        tags: None,
        jupyter: None,
        execution: None,
        additional: HashMap::new(),
    }
}

/// Convert a source string to nbformat's newline-inclusive line list.
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

/// nbformat text fields may be a plain string or a list of lines.
fn text_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn output_from_value(value: &Value) -> Option<OutputEntry> {
    let output_type = value.get("output_type")?.as_str()?;
    match output_type {
        "stream" => Some(OutputEntry::Stream {
            name: match value.get("name").and_then(Value::as_str) {
                Some("stderr") => StreamName::Stderr,
                _ => StreamName::Stdout,
            },
            text: value.get("text").map(text_field).unwrap_or_default(),
        }),
        "error" => Some(OutputEntry::Error {
            ename: value
                .get("ename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            evalue: value
                .get("evalue")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            traceback: value
                .get("traceback")
                .and_then(Value::as_array)
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }),
        "execute_result" | "display_data" => {
            let text = value.get("data")?.get("text/plain").map(text_field)?;
            let label = value
                .get("execution_count")
                .and_then(Value::as_i64)
                .map(|n| n.max(0) as u32);
            Some(OutputEntry::Value { text, label })
        }
        other => {
            debug!("skipping unsupported output type {}", other);
            None
        }
    }
}

fn output_to_value(entry: &OutputEntry) -> Value {
    match entry {
        OutputEntry::Stream { name, text } => json!({
            "output_type": "stream",
            "name": name.as_str(),
            "text": text,
        }),
        OutputEntry::Error {
            ename,
            evalue,
            traceback,
        } => json!({
            "output_type": "error",
            "ename": ename,
            "evalue": evalue,
            "traceback": traceback,
        }),
        OutputEntry::Value {
            text,
            label: Some(n),
        } => json!({
            "output_type": "execute_result",
            "data": { "text/plain": text },
            "metadata": {},
            "execution_count": n,
        }),
        OutputEntry::Value { text, label: None } => json!({
            "output_type": "display_data",
            "data": { "text/plain": text },
            "metadata": {},
        }),
    }
}

fn cell_from_nbformat(cell: &nbformat::v4::Cell) -> Cell {
    match cell {
        nbformat::v4::Cell::Code {
            source,
            execution_count,
            outputs,
            ..
        } => {
            let mut converted = Cell::with_source(CellKind::Code, source.join(""));
            for output in outputs {
                if let Ok(value) = serde_json::to_value(output) {
                    if let Some(entry) = output_from_value(&value) {
                        converted.push_output(entry);
                    }
                }
            }
            if let Some(n) = execution_count {
                converted.set_label(ExecutionLabel::Completed((*n).max(0) as u32));
            }
            converted
        }
        // Raw cells are display-only here, same as markdown.
        nbformat::v4::Cell::Markdown { source, .. } | nbformat::v4::Cell::Raw { source, .. } => {
            Cell::with_source(CellKind::Markdown, source.join(""))
        }
    }
}

fn cell_to_nbformat(cell: &Cell) -> nbformat::v4::Cell {
    let id = nbformat::v4::CellId::from(cell.id().as_uuid());
    match cell.kind() {
        CellKind::Code => nbformat::v4::Cell::Code {
            id,
            metadata: empty_cell_metadata(),
            execution_count: match cell.label() {
                ExecutionLabel::Completed(n) => Some(n as i32),
                _ => None,
            },
            source: source_to_lines(cell.source()),
            outputs: cell
                .outputs()
                .iter()
                .filter_map(|entry| serde_json::from_value(output_to_value(entry)).ok())
                .collect(),
        },
        CellKind::Markdown => nbformat::v4::Cell::Markdown {
            id,
            metadata: empty_cell_metadata(),
            source: source_to_lines(cell.source()),
            attachments: None,
        },
    }
}

pub struct LoadedNotebook {
    pub cells: Vec<Cell>,
    pub metadata: nbformat::v4::Metadata,
}

pub fn load_notebook(path: &Path) -> Result<LoadedNotebook> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading notebook {}", path.display()))?;
    let parsed = nbformat::parse_notebook(&content).map_err(|e| anyhow!("{}", e))?;
    let notebook = match parsed {
        nbformat::Notebook::V4(notebook) => notebook,
        nbformat::Notebook::Legacy(legacy) => nbformat::upgrade_legacy_notebook(legacy)
            .map_err(|e| anyhow!("upgrading legacy notebook: {}", e))?,
        nbformat::Notebook::V3(v3) => nbformat::upgrade_v3_notebook(v3)
            .map_err(|e| anyhow!("upgrading v3 notebook: {}", e))?,
    };

    let mut cells: Vec<Cell> = notebook.cells.iter().map(cell_from_nbformat).collect();
    if cells.is_empty() {
        cells.push(Cell::new(CellKind::Code));
    }
    Ok(LoadedNotebook {
        cells,
        metadata: notebook.metadata,
    })
}

pub fn save_notebook(path: &Path, state: &NotebookState) -> Result<()> {
    let notebook = nbformat::v4::Notebook {
        metadata: state.metadata().clone(),
        nbformat: 4,
        nbformat_minor: 5,
        cells: state.cells().iter().map(cell_to_nbformat).collect(),
    };
    let content = nbformat::serialize_notebook(&nbformat::Notebook::V4(notebook))
        .map_err(|e| anyhow!("{}", e))?;
    std::fs::write(path, &content)
        .with_context(|| format!("writing notebook {}", path.display()))?;
    Ok(())
}

/// First free `<prefix>.ipynb`, `<prefix>1.ipynb`, ... in `directory`.
pub fn find_available_name(directory: &Path, prefix: &str) -> PathBuf {
    let mut candidate = directory.join(format!("{}.ipynb", prefix));
    let mut i = 0;
    while candidate.exists() {
        i += 1;
        candidate = directory.join(format!("{}{}.ipynb", prefix, i));
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_to_lines_roundtrip() {
        for original in &["line1\nline2", "line1\nline2\n", "single", "single\n", ""] {
            let lines = source_to_lines(original);
            let rejoined: String = lines.join("");
            assert_eq!(&rejoined, original, "roundtrip failed for {:?}", original);
        }
    }

    #[test]
    fn test_text_field_accepts_string_and_array() {
        assert_eq!(text_field(&json!("abc")), "abc");
        assert_eq!(text_field(&json!(["a\n", "b"])), "a\nb");
        assert_eq!(text_field(&json!(7)), "");
    }

    #[test]
    fn test_stream_output_roundtrip() {
        let entry = OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "hello\n".into(),
        };
        let value = output_to_value(&entry);
        assert_eq!(output_from_value(&value), Some(entry));
    }

    #[test]
    fn test_error_output_roundtrip() {
        let entry = OutputEntry::Error {
            ename: "NameError".into(),
            evalue: "name 'x' is not defined".into(),
            traceback: vec!["Traceback".into(), "NameError: ...".into()],
        };
        let value = output_to_value(&entry);
        assert_eq!(output_from_value(&value), Some(entry));
    }

    #[test]
    fn test_result_output_roundtrip() {
        let entry = OutputEntry::Value {
            text: "4".into(),
            label: Some(2),
        };
        let value = output_to_value(&entry);
        assert_eq!(value["output_type"], "execute_result");
        assert_eq!(output_from_value(&value), Some(entry));

        let display = OutputEntry::Value {
            text: "<Figure>".into(),
            label: None,
        };
        let value = output_to_value(&display);
        assert_eq!(value["output_type"], "display_data");
        assert_eq!(output_from_value(&value), Some(display));
    }

    #[test]
    fn test_unknown_output_type_is_skipped() {
        let value = json!({"output_type": "application/custom", "data": {}});
        assert_eq!(output_from_value(&value), None);
    }

    #[test]
    fn test_multiline_stream_text_from_disk() {
        let value = json!({
            "output_type": "stream",
            "name": "stdout",
            "text": ["one\n", "two\n"],
        });
        assert_eq!(
            output_from_value(&value),
            Some(OutputEntry::Stream {
                name: StreamName::Stdout,
                text: "one\ntwo\n".into()
            })
        );
    }

    #[test]
    fn test_find_available_name_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let first = find_available_name(dir.path(), "Untitled");
        assert_eq!(first, dir.path().join("Untitled.ipynb"));

        std::fs::write(&first, "{}").unwrap();
        let second = find_available_name(dir.path(), "Untitled");
        assert_eq!(second, dir.path().join("Untitled1.ipynb"));
    }
}
