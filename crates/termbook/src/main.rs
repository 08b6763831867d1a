use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use termbook::format;
use termbook::{Notebook, RenderContext};

#[derive(Parser)]
#[command(
    name = "termbook",
    version,
    about = "Execute and inspect Jupyter notebooks from the terminal"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute every cell in order and save the result
    Run {
        notebook: PathBuf,
        /// Kernelspec to launch (defaults to the notebook's metadata, then python3)
        #[arg(long)]
        kernel: Option<String>,
        /// Where to write the executed notebook (defaults to <stem>_run.ipynb)
        #[arg(long)]
        save_path: Option<PathBuf>,
        /// Don't launch a kernel; code cells are left unexecuted
        #[arg(long)]
        no_kernel: bool,
    },
    /// Print a notebook's cells and outputs as plain text
    Show { notebook: PathBuf },
    /// List installed kernelspecs
    Kernels,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            notebook,
            kernel,
            save_path,
            no_kernel,
        } => run(&notebook, kernel.as_deref(), save_path, no_kernel).await,
        Command::Show { notebook } => show(&notebook),
        Command::Kernels => kernels().await,
    }
}

async fn run(
    path: &Path,
    kernel: Option<&str>,
    save_path: Option<PathBuf>,
    no_kernel: bool,
) -> Result<()> {
    let mut notebook = Notebook::open(path, RenderContext::plain())?;
    if !no_kernel {
        notebook.start_kernel(kernel).await?;
    }
    notebook.run_all().await?;

    let target = save_path.unwrap_or_else(|| derived_run_path(path));
    let written = notebook.save(Some(target))?;
    if !no_kernel {
        notebook.stop_kernel().await.ok();
    }
    println!("Executed notebook saved to {}", written.display());
    Ok(())
}

/// `nb.ipynb` runs into `nb_run.ipynb`, never clobbering an existing file.
fn derived_run_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("notebook");
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    format::find_available_name(&dir, &format!("{}_run", stem))
}

fn show(path: &Path) -> Result<()> {
    let notebook = Notebook::open(path, RenderContext::plain())?;
    print!("{}", notebook.render_plain());
    Ok(())
}

async fn kernels() -> Result<()> {
    let specs = kernel_driver::list_kernelspecs().await;
    if specs.is_empty() {
        println!("No kernelspecs found. Try: jupyter kernelspec list");
        return Ok(());
    }
    for spec in specs {
        println!("{}\t{}\t{}", spec.name, spec.display_name, spec.language);
    }
    Ok(())
}
