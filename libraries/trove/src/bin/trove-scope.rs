use std::fs;
use std::path::PathBuf;

use trove::{Store, StoreConfig};

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <path-to-document.json> [path-to-config.json]", args[0]);
        eprintln!("\nExample: {} ./users.json", args[0]);
        std::process::exit(1);
    }

    let file_path = PathBuf::from(&args[1]);

    if !file_path.exists() {
        eprintln!("Error: File '{}' does not exist", file_path.display());
        std::process::exit(1);
    }

    let config = match args.get(2) {
        Some(path) => match fs::read_to_string(path) {
            Ok(text) => match StoreConfig::from_json(&text) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error parsing config '{path}': {e}");
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Error reading config '{path}': {e}");
                std::process::exit(1);
            }
        },
        None => StoreConfig {
            validate_documents: true,
            ..Default::default()
        },
    };

    let text = match fs::read_to_string(&file_path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    let json: serde_json::Value = match serde_json::from_str(&text) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Error parsing '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    let store = Store::new(config);
    let primary = match store.push_json(&json) {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("Error merging '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    println!("TroveScope - Document Inspector");
    println!("===============================");
    println!("File: {}", file_path.display());
    println!("Size: {} bytes ({:.2} KB)", text.len(), text.len() as f64 / 1024.0);
    println!();

    println!("Identities:");
    println!("-----------");
    let identities = store.identities();
    if identities.is_empty() {
        println!("  No resources found");
    } else {
        println!("  Total identities: {}", identities.len());
        println!("  Primary resources: {}", primary.len());
        println!();

        let presence = store.presence();
        for (key, identifier) in &identities {
            let marker = if primary.contains(key) { " (primary)" } else { "" };
            match &identifier.id {
                Some(id) => println!("  {}:{id}{marker}", identifier.resource_type),
                None => println!("  {}:{}{marker}", identifier.resource_type, identifier.lid),
            }
            match store.peek(*key) {
                Some(resource) => {
                    println!("    Attributes: {}", resource.attributes.len());
                    println!("    Relationships: {}", resource.relationships.len());
                    for (name, payload) in &resource.relationships {
                        let members = payload
                            .data
                            .iter()
                            .flat_map(|data| data.iter())
                            .map(|linkage| linkage.identifiers().len())
                            .sum::<usize>();
                        println!("      {name}: {members} member(s)");
                    }
                }
                None => println!("    Not loaded (referenced only)"),
            }
            let referrers = presence.referrers(*key);
            if !referrers.is_empty() {
                println!("    Referenced by {} relationship(s)", referrers.len());
            }
        }
    }

    println!();
    println!("Data Quality:");
    println!("-------------");
    let reports = store.take_reports();
    if reports.is_empty() {
        println!("  No problems found");
    } else {
        for report in &reports {
            println!("  ⚠️  [{:?}] {}", report.severity, report.kind);
        }
    }
}
