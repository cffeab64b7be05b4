//! Inspect a .snap file

use snapshot_format::Snapshot;
use std::env;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: inspect <snapshot_file>");
        std::process::exit(1);
    }

    let path = &args[1];
    println!("Loading {}...", path);

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read file: {}", e);
            std::process::exit(1);
        }
    };
    let snapshot = match Snapshot::from_bytes(&bytes) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("Failed to parse snapshot: {}", e);
            std::process::exit(1);
        }
    };

    println!("\n=== Header ===");
    println!("Magic: {:?}", std::str::from_utf8(&snapshot.header.magic).unwrap_or("???"));
    println!("Version: {}", snapshot.header.version);
    println!("Kind: {:?}", snapshot.header.kind);
    println!("Rows: {}", snapshot.header.row_count);
    println!("Columns: {}", snapshot.header.column_count);
    println!("Created: {}", snapshot.header.created_at_us);

    println!("\n=== Metadata ===");
    println!("{:#?}", snapshot.metadata);

    println!("\n=== Columns ===");
    for name in snapshot.table.column_names() {
        let values = snapshot.table.values(name);
        if values.is_empty() {
            println!("{:<32} (empty)", name);
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        println!(
            "{:<32} n={:<6} mean={:>12.4} min={:>12.4} max={:>12.4}",
            name,
            values.len(),
            mean,
            min,
            max
        );
    }

    let entities: std::collections::BTreeSet<&str> = snapshot
        .table
        .keys()
        .iter()
        .map(|k| k.entity_id.as_str())
        .collect();
    println!("\n=== Entities ===");
    println!("{} entities: {:?}", entities.len(), entities);
}
