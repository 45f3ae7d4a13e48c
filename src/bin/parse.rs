//! Parses an event-definition file (one `key=value,...` record per line,
//! spec.md §6) from stdin or a path given as the first argument, printing
//! each parsed record.

use std::io::Read;

use pcm_core::event_parser::{parse_event_file, DescriptorBuilder, FieldKey};

fn main() {
    tracing_subscriber::fmt::init();

    let text = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path).unwrap_or_else(|e| {
            eprintln!("failed to read {path}: {e}");
            std::process::exit(1);
        }),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).expect("failed to read stdin");
            buf
        }
    };

    match parse_event_file(&text, DescriptorBuilder::default) {
        Ok(descriptors) => {
            for d in &descriptors {
                let name = d
                    .get(&FieldKey::HName)
                    .map(|v| format!("{v:?}"))
                    .unwrap_or_else(|| "<unnamed>".to_string());
                println!("{name}: {} fields", d.fields.len());
            }
            println!("parsed {} records", descriptors.len());
        }
        Err(e) => {
            eprintln!("parse error: {e}");
            std::process::exit(1);
        }
    }
}
