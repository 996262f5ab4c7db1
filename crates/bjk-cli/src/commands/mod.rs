//! Command handlers for the bjk CLI.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bjk_bus::{
    BusConfig, EventHandler, LocalIdempotencyStore, MemoryBroker, MessageBus,
};
use bjk_schemas::{ContractRegistry, Envelope};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Every .json file under `dir`, sorted by name.
fn event_files(dir: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read events dir: {dir}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no golden events found under {dir}");
    }
    Ok(files)
}

fn load_event(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("read event file {path:?}"))?;
    serde_json::from_str(&raw).with_context(|| format!("{path:?} is not valid JSON"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

pub fn validate(paths: &[String], events_dir: &str) -> Result<()> {
    let registry = ContractRegistry::v1();
    let files: Vec<PathBuf> = if paths.is_empty() {
        event_files(events_dir)?
    } else {
        paths.iter().map(PathBuf::from).collect()
    };

    let mut failures = 0usize;
    for path in &files {
        match load_event(path).and_then(|ev| Ok(registry.validate_wire(&ev)?)) {
            Ok(()) => println!("[ok]   {}", file_name(path)),
            Err(e) => {
                failures += 1;
                println!("[fail] {}: {e:#}", file_name(path));
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} events failed validation", files.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// golden
// ---------------------------------------------------------------------------

/// Dry-run publish: print each valid golden event as one compact JSON line,
/// skipping the deliberately-dirty fixtures.
pub fn golden(events_dir: &str) -> Result<()> {
    let registry = ContractRegistry::v1();
    for path in event_files(events_dir)? {
        let ev = load_event(&path)?;
        match registry.validate_wire(&ev) {
            Ok(()) => println!("{ev}"),
            Err(e) => eprintln!("[skip-invalid] {}: {e}", file_name(&path)),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// smoke
// ---------------------------------------------------------------------------

struct CountingHandler {
    handled: AtomicUsize,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Publish the golden corpus through an in-process broker, then drain every
/// touched stream with a dispatch worker and report what happened. Exercises
/// the full produce → validate → publish → poll → dedup → handle → ack path
/// without any external infrastructure.
pub async fn smoke(events_dir: &str) -> Result<()> {
    let config = BusConfig {
        block: Duration::from_millis(200),
        ..BusConfig::default()
    };
    let bus = Arc::new(MessageBus::new(Arc::new(MemoryBroker::new()), config));

    // Stream name == schema name; group events per stream.
    let mut per_stream: BTreeMap<String, usize> = BTreeMap::new();
    let mut skipped = 0usize;

    let registry = ContractRegistry::v1();
    let files = event_files(events_dir)?;
    let mut to_publish: Vec<(String, Envelope)> = Vec::new();
    for path in &files {
        let wire = load_event(path)?;
        if let Err(e) = registry.validate_wire(&wire) {
            skipped += 1;
            eprintln!("[skip-invalid] {}: {e}", file_name(path));
            continue;
        }
        let envelope =
            Envelope::from_wire(&wire).with_context(|| format!("decode {}", file_name(path)))?;
        to_publish.push((file_name(path), envelope));
    }

    // Bind groups before the first publish so nothing lands outside a cursor.
    for (_, envelope) in &to_publish {
        bus.ensure_group(&envelope.schema, "smoke").await?;
    }
    for (name, envelope) in &to_publish {
        let stream = envelope.schema.clone();
        bus.publish(&stream, envelope).await?;
        println!("publish {stream} <- {name}");
        *per_stream.entry(stream).or_insert(0) += 1;
    }

    let mut total_handled = 0usize;
    let mut total_deduped = 0usize;
    for (stream, published) in &per_stream {
        let handler = CountingHandler {
            handled: AtomicUsize::new(0),
        };
        let store = LocalIdempotencyStore::new();
        bus.run_worker(stream, "smoke", "smoke-1", &handler, &store, Some(*published))
            .await?;

        let handled = handler.handled.load(Ordering::SeqCst);
        let deduped = published - handled;
        total_handled += handled;
        total_deduped += deduped;
        println!("drained {stream}: published={published} handled={handled} deduped={deduped}");
    }

    println!(
        "smoke complete: {} events published, {total_handled} handled, {total_deduped} deduped, {skipped} skipped as invalid",
        to_publish.len()
    );
    Ok(())
}
