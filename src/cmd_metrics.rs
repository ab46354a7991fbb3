use anyhow::{bail, Result};
use warden::clienv;
use warden::store::Store;

pub(crate) fn cmd_metrics(limit: usize) -> Result<()> {
    let db = clienv::db_path();
    if !db.exists() {
        bail!(
            "Store not initialized at {}. Run `warden init` first.",
            db.display()
        );
    }

    let store = Store::open(&db)?;
    let samples = store.recent_metrics(limit)?;

    if samples.is_empty() {
        println!("No metrics data available.");
        return Ok(());
    }

    let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_usage).collect();
    let mem: Vec<f64> = samples.iter().map(|s| s.mem_usage).collect();
    let temp: Vec<f64> = samples.iter().filter_map(|s| s.cpu_temp).collect();

    let last = &samples[0];
    println!("\nRecent System Metrics:\n");
    println!(" Last update : {}", last.created_at);
    println!(
        " CPU usage   : last {:.1}% | avg {:.1}%",
        last.cpu_usage,
        avg(&cpu)
    );
    println!(
        " Memory usage: last {:.1}% | avg {:.1}%",
        last.mem_usage,
        avg(&mem)
    );
    match last.cpu_temp {
        Some(t) if !temp.is_empty() => {
            println!(" CPU temp    : last {:.1}C | avg {:.1}C", t, avg(&temp));
        }
        _ => println!(" CPU temp    : N/A"),
    }

    Ok(())
}

fn avg(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
