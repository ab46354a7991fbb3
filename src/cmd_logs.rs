use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use warden::clienv;

const FOLLOW_POLL: Duration = Duration::from_millis(500);

pub(crate) async fn cmd_logs(component: Option<&str>, lines: usize, follow: bool) -> Result<()> {
    let Some(component) = component else {
        list_available_logs();
        return Ok(());
    };

    let mut files = Vec::new();
    for dir in [clienv::logs_dir(), clienv::manager_logs_dir()] {
        for suffix in ["log", "err"] {
            let path = dir.join(format!("{component}.{suffix}"));
            if path.exists() {
                files.push(path);
            }
        }
    }

    if files.is_empty() {
        println!("No log files found for component: {component}");
        return Ok(());
    }

    for path in &files {
        println!("\n=== {} ===", path.display());
        print_tail(path, lines)?;
    }

    if follow {
        // stream appended output from the primary log file
        println!("\nFollowing {} (Ctrl+C to stop)...", files[0].display());
        follow_file(&files[0]).await?;
    }

    Ok(())
}

fn list_available_logs() {
    println!("\nAvailable log files:");

    println!("\nComponent logs:");
    print_dir_logs(&clienv::logs_dir());

    println!("\nManager logs:");
    print_dir_logs(&clienv::manager_logs_dir());
}

fn print_dir_logs(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        println!("  (none)");
        return;
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".log"))
        .collect();
    names.sort();
    if names.is_empty() {
        println!("  (none)");
    }
    for name in names {
        println!("  - {name}");
    }
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("  {line}");
    }
    Ok(())
}

async fn follow_file(path: &PathBuf) -> Result<()> {
    let mut offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    loop {
        tokio::time::sleep(FOLLOW_POLL).await;
        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        if len < offset {
            // file truncated underneath us, start over
            offset = 0;
        }
        if len == offset {
            continue;
        }
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        offset = len;
        print!("{buf}");
    }
}
