use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gradeflow::workflow::Course;

#[derive(Debug, Parser)]
#[command(name = "gradeflow", about = "Automated grading workflow for Canvas + JupyterHub + nbgrader courses")]
struct Cli {
    /// Course directory holding gradeflow.toml and the state files.
    #[arg(long, default_value = ".", global = true)]
    course_dir: PathBuf,

    /// Log every mutation instead of performing it; skip all state writes.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Advance every outstanding submission through the grading pipeline.
    RunWorkflow,
    /// Take any outstanding due-date snapshots and exit.
    Snapshot,
    /// Apply late-registration due-date extensions and exit.
    ApplyExtensions,
    /// Look up students by name or id.
    SearchStudent {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        canvas_id: Option<u64>,
        #[arg(long)]
        sis_id: Option<String>,
        #[arg(long, default_value_t = 5)]
        max_return: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut course = Course::init(&cli.course_dir, cli.dry_run).await?;

    match cli.command {
        Command::RunWorkflow => course.run_workflow().await?,
        Command::Snapshot => course.take_snapshots().await?,
        Command::ApplyExtensions => course.apply_latereg_extensions().await?,
        Command::SearchStudent {
            name,
            canvas_id,
            sis_id,
            max_return,
        } => {
            let found = course.search_students(
                name.as_deref(),
                canvas_id,
                sis_id.as_deref(),
                max_return,
            );
            if found.is_empty() {
                println!("No matching students.");
            }
            for s in found {
                println!(
                    "{}\t{}\t{}\t{}",
                    s.id,
                    s.sis_id.as_deref().unwrap_or("-"),
                    s.name,
                    s.sortable_name
                );
            }
        }
    }

    Ok(())
}
