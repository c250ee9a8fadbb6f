//! ha-watch
//!
//! Discovers a sentinel-managed deployment, prints its topology and either
//! runs one command against it or keeps following failovers.

use std::sync::Arc;

use clap::Parser;
use sockudo_ha::cli::Cli;
use sockudo_ha::logging::init_logging;
use sockudo_ha::protocol::RespValue;
use sockudo_ha::{SentinelEvent, SentinelManager};

fn render(value: &RespValue, indent: usize, out: &mut String) {
    let pad = " ".repeat(indent);
    match value {
        RespValue::SimpleString(s) => out.push_str(&format!("{}{}\n", pad, String::from_utf8_lossy(s))),
        RespValue::BulkString(s) => out.push_str(&format!("{}\"{}\"\n", pad, String::from_utf8_lossy(s))),
        RespValue::Error(e) => out.push_str(&format!("{}(error) {}\n", pad, String::from_utf8_lossy(e))),
        RespValue::Integer(n) => out.push_str(&format!("{}(integer) {}\n", pad, n)),
        RespValue::Null => out.push_str(&format!("{}(nil)\n", pad)),
        RespValue::Array(items) if items.is_empty() => out.push_str(&format!("{}(empty array)\n", pad)),
        RespValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                out.push_str(&format!("{}{})\n", pad, i + 1));
                render(item, indent + 3, out);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    init_logging(&settings)?;

    let manager = SentinelManager::new(settings);
    manager.initialize().await?;
    println!("{}", manager.snapshot());

    if let Some(args) = &cli.exec {
        let mut db = manager.get_db(cli.read_only, cli.db).await?;
        let reply = db.execute(args).await?;
        let mut out = String::new();
        render(&reply, 0, &mut out);
        println!("{} {}:", db.role(), db.endpoint());
        print!("{}", out);
    }

    if !cli.watch {
        manager.dispose();
        return Ok(());
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SentinelEvent>();
    manager.on_event(Arc::new(move |event: &SentinelEvent| {
        let _ = tx.send(event.clone());
    }));

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                println!("event: {:?}", event);
                println!("{}", manager.snapshot());
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    manager.dispose();
    Ok(())
}
