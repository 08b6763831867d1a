//! Structural edits and file round-trips.

mod common;

use common::{arithmetic, FakeKernel};
use termbook::{CellKind, ExecutionLabel, Notebook, RenderContext};
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

fn sources(notebook: &Notebook) -> Vec<String> {
    notebook
        .cells()
        .iter()
        .map(|c| c.source().to_string())
        .collect()
}

#[tokio::test]
async fn test_save_then_load_preserves_cells_and_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nb.ipynb");

    let mut notebook = notebook_with(&["1+1", "## notes", "2+2"]);
    notebook.focus(1);
    notebook.set_focused_kind(CellKind::Markdown);
    let (tx, rx) = mpsc::channel(64);
    notebook
        .attach_kernel(Box::new(FakeKernel::new(tx, arithmetic)), rx)
        .await;
    notebook.run_all().await.unwrap();
    notebook.save(Some(path.clone())).unwrap();
    assert!(!notebook.is_dirty());

    let reloaded = Notebook::open(&path, RenderContext::plain()).unwrap();
    assert!(!reloaded.is_dirty());

    let original = notebook.cells();
    let loaded = reloaded.cells();
    assert_eq!(loaded.len(), original.len());
    for (a, b) in original.iter().zip(loaded.iter()) {
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.source(), b.source());
        assert_eq!(a.label(), b.label());
        assert_eq!(a.outputs(), b.outputs());
    }
    assert_eq!(loaded[0].label(), ExecutionLabel::Completed(1));
    assert_eq!(loaded[2].label(), ExecutionLabel::Completed(2));
}

#[test]
fn test_cut_then_paste_survives_a_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edited.ipynb");

    let mut notebook = notebook_with(&["a = 1", "b = 2", "c = 3"]);
    notebook.cut_at(0);
    notebook.paste_at(2);
    notebook.save(Some(path.clone())).unwrap();

    let reloaded = Notebook::open(&path, RenderContext::plain()).unwrap();
    assert_eq!(sources(&reloaded), vec!["b = 2", "c = 3", "a = 1"]);
}

#[test]
fn test_move_sequence_reorders_cells() {
    let mut notebook = notebook_with(&["a = 1", "b = 2", "c = 3"]);
    notebook.move_down();
    notebook.focus_down();
    notebook.move_up();
    assert_eq!(sources(&notebook), vec!["b = 2", "c = 3", "a = 1"]);
}

#[test]
fn test_open_missing_path_starts_blank_at_that_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("new.ipynb");

    let mut notebook = Notebook::open(&path, RenderContext::plain()).unwrap();
    assert_eq!(notebook.len(), 1);
    assert_eq!(notebook.cells()[0].kind(), CellKind::Code);

    let written = notebook.save(None).unwrap();
    assert_eq!(written, path);
    assert!(path.exists());
}

#[test]
fn test_untitled_notebook_needs_a_save_path() {
    let mut notebook = Notebook::new(RenderContext::plain());
    assert!(notebook.save(None).is_err());
}

#[test]
fn test_show_renders_labels_and_outputs() {
    let mut notebook = notebook_with(&["1+1"]);
    notebook.focus(0);
    let rendered = notebook.render_plain();
    assert!(rendered.contains("In [ ]: 1+1"));
}
