//! Terminal output for results

use colored::*;
use simbatch_core::{BatchResult, SimResult, StreamEvent};

/// One line per finished job
pub fn print_result(result: &SimResult) {
    let marker = if result.success() {
        "✓".green()
    } else {
        "✗".red()
    };

    let timing = if result.from_cache() {
        "cached".cyan()
    } else {
        format!("{:.1}s", result.runtime().as_secs_f64()).as_str().dimmed()
    };

    println!("  {} {} ({})", marker, result.label().bold(), timing);

    if let Some(failure) = result.failure() {
        println!("    {}", failure.to_string().red());
    }
}

pub fn print_details(result: &SimResult) {
    print_result(result);
    println!("    Run dir:  {}", result.run_dir().display().to_string().dimmed());
    if let Some(key) = result.cache_key() {
        println!("    Key:      {}", key.short().dimmed());
    }
    if let Some(code) = result.exit_code() {
        println!("    Exit:     {}", code);
    }

    if result.output_files().is_empty() {
        println!("    {}", "No output files.".yellow());
    } else {
        println!("    Outputs:");
        for file in result.output_files() {
            println!("      {} {}", "▸".cyan(), file.display());
        }
    }

    if !result.success() && !result.stderr().trim().is_empty() {
        println!("{}", "─".repeat(80).dimmed());
        print!("{}", result.stderr());
        println!("{}", "─".repeat(80).dimmed());
    }
}

pub fn print_progress(event: &StreamEvent) {
    print!(
        "{} ",
        format!("[{}/{}]", event.completed, event.total).dimmed()
    );
    print_result(&event.result);
}

pub fn print_summary(batch: &BatchResult) {
    println!();
    let line = format!(
        "{} succeeded, {} failed in {:.1}s",
        batch.succeeded(),
        batch.failed(),
        batch.runtime().as_secs_f64()
    );

    if batch.all_succeeded() {
        println!("{}", line.green().bold());
    } else {
        println!("{}", line.red().bold());
    }
}
