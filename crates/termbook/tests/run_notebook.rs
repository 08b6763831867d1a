//! Headless execution scenarios against a scripted kernel.

mod common;

use common::{arithmetic, FakeKernel};
use kernel_driver::{EventPayload, StreamName};
use termbook::{CellKind, ExecutionLabel, Notebook, OutputEntry, RenderContext};
use tokio::sync::mpsc;

fn notebook_with(sources: &[&str]) -> Notebook {
    let mut notebook = Notebook::new(RenderContext::plain());
    notebook.begin_edit();
    notebook.end_edit(Some(sources[0]));
    for source in &sources[1..] {
        notebook.insert(true);
        notebook.begin_edit();
        notebook.end_edit(Some(source));
    }
    notebook.focus(0);
    notebook
}

async fn attach(notebook: &Notebook, respond: fn(&str) -> Vec<EventPayload>) {
    let (tx, rx) = mpsc::channel(64);
    notebook
        .attach_kernel(Box::new(FakeKernel::new(tx, respond)), rx)
        .await;
}

#[tokio::test]
async fn test_run_all_assigns_labels_in_cell_order() {
    let mut notebook = notebook_with(&["1+1", "2+2", "3+3"]);
    attach(&notebook, arithmetic).await;

    notebook.run_all().await.unwrap();

    let cells = notebook.cells();
    for (i, expected) in ["2", "4", "6"].iter().enumerate() {
        let seq = i as u32 + 1;
        assert_eq!(cells[i].label(), ExecutionLabel::Completed(seq));
        assert_eq!(cells[i].outputs().len(), 1);
        match &cells[i].outputs()[0] {
            OutputEntry::Value { text, label } => {
                assert_eq!(text, expected);
                assert_eq!(*label, Some(seq));
            }
            other => panic!("unexpected output {:?}", other),
        }
    }
    assert!(notebook.is_dirty());
}

#[tokio::test]
async fn test_run_all_skips_markdown_cells_without_burning_labels() {
    let mut notebook = notebook_with(&["1+1", "notes", "2+2"]);
    notebook.focus(1);
    notebook.set_focused_kind(CellKind::Markdown);
    attach(&notebook, arithmetic).await;

    notebook.run_all().await.unwrap();

    let cells = notebook.cells();
    assert_eq!(cells[0].label(), ExecutionLabel::Completed(1));
    assert_eq!(cells[1].label(), ExecutionLabel::None);
    assert!(cells[1].outputs().is_empty());
    assert_eq!(cells[2].label(), ExecutionLabel::Completed(2));
}

#[tokio::test]
async fn test_rerun_replaces_output_and_advances_label() {
    let mut notebook = notebook_with(&["1+2"]);
    attach(&notebook, arithmetic).await;

    notebook.run_cell(0).await.unwrap();
    notebook.run_cell(0).await.unwrap();

    let cells = notebook.cells();
    assert_eq!(cells[0].label(), ExecutionLabel::Completed(2));
    assert_eq!(cells[0].outputs().len(), 1);
}

#[tokio::test]
async fn test_consecutive_stream_events_merge_into_one_entry() {
    fn streams(_code: &str) -> Vec<EventPayload> {
        vec![
            EventPayload::Stream {
                name: StreamName::Stdout,
                text: "first\n".into(),
            },
            EventPayload::Stream {
                name: StreamName::Stdout,
                text: "second\n".into(),
            },
            EventPayload::Stream {
                name: StreamName::Stderr,
                text: "oops\n".into(),
            },
        ]
    }

    let mut notebook = notebook_with(&["print('x')"]);
    attach(&notebook, streams).await;

    notebook.run_cell(0).await.unwrap();

    let cells = notebook.cells();
    let outputs = cells[0].outputs();
    assert_eq!(outputs.len(), 2);
    assert_eq!(
        outputs[0],
        OutputEntry::Stream {
            name: StreamName::Stdout,
            text: "first\nsecond\n".into()
        }
    );
    assert_eq!(
        outputs[1],
        OutputEntry::Stream {
            name: StreamName::Stderr,
            text: "oops\n".into()
        }
    );
}

#[tokio::test]
async fn test_error_events_land_in_the_right_cell() {
    fn failing(code: &str) -> Vec<EventPayload> {
        if code.contains("boom") {
            vec![EventPayload::Error {
                ename: "RuntimeError".into(),
                evalue: "boom".into(),
                traceback: vec!["Traceback".into(), "RuntimeError: boom".into()],
            }]
        } else {
            arithmetic(code)
        }
    }

    let mut notebook = notebook_with(&["1+1", "raise boom", "2+2"]);
    attach(&notebook, failing).await;

    notebook.run_all().await.unwrap();

    let cells = notebook.cells();
    assert!(matches!(cells[0].outputs()[0], OutputEntry::Value { .. }));
    assert!(matches!(cells[1].outputs()[0], OutputEntry::Error { .. }));
    assert!(matches!(cells[2].outputs()[0], OutputEntry::Value { .. }));
}

#[tokio::test]
async fn test_run_all_without_kernel_leaves_everything_unexecuted() {
    let mut notebook = notebook_with(&["1+1", "2+2"]);

    notebook.run_all().await.unwrap();

    for cell in notebook.cells() {
        assert_eq!(cell.label(), ExecutionLabel::None);
        assert!(cell.outputs().is_empty());
    }
}
