//! # Kernel Event Replay
//!
//! Drives the OpenTelemetry hook with a recorded or built-in stream of kernel
//! events and exports the result with the configured backend.
//!
//! Recorded streams are newline-delimited JSON, one record per line:
//!
//! ```text
//! {"event": "session:start", "data": {"session_id": "s1"}}
//! {"event": "tool:pre", "data": {"session_id": "s1", "tool_name": "bash"}}
//! ```
//!
//! ## Running
//!
//! ```bash
//! # Built-in scenario printed to the console
//! cargo run -p amplifier-otel-export --bin replay
//!
//! # Recorded events sent to a local collector
//! cargo run -p amplifier-otel-export --bin replay -- \
//!     --exporter otlp-http --file events.jsonl
//!
//! # Full configuration from a JSON file
//! cargo run -p amplifier-otel-export --bin replay -- --config otel.json
//! ```

use amplifier_otel::telemetry::BundleInfo;
use amplifier_otel::{logging, ExportMetrics, ExporterKind, HandoffMetrics, OtelConfig};
use amplifier_otel_export::mount;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    exporter: Option<String>,
    file: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut args = Self::default();
        let mut iter = std::env::args().skip(1);
        while let Some(flag) = iter.next() {
            let mut value = || iter.next().ok_or_else(|| format!("{flag} needs a value"));
            match flag.as_str() {
                "--config" => args.config = Some(PathBuf::from(value()?)),
                "--exporter" => args.exporter = Some(value()?),
                "--file" => args.file = Some(PathBuf::from(value()?)),
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(args)
    }
}

#[derive(Debug, Deserialize)]
struct Record {
    event: String,
    #[serde(default)]
    data: Value,
}

fn load_config(args: &Args) -> Result<OtelConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let raw: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            OtelConfig::from_value(&raw)?
        }
        None => OtelConfig::development(),
    };
    if let Some(kind) = &args.exporter {
        config.exporter = serde_json::from_value::<ExporterKind>(Value::String(kind.clone()))
            .map_err(|_| format!("unknown exporter {kind:?}; expected console, otlp-http, otlp-grpc or file"))?;
    }
    Ok(config)
}

fn load_records(path: &Path) -> Result<Vec<Record>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (line_number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(line)
            .map_err(|e| format!("{}:{}: {e}", path.display(), line_number + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// A parent session that forks a child during a tool call.
fn builtin_scenario() -> Vec<Record> {
    let parent = "replay-parent";
    let child = "replay-child";
    let events = [
        ("session:start", json!({"session_id": parent, "prompt": "refactor the parser"})),
        ("execution:start", json!({"session_id": parent})),
        ("prompt:submit", json!({"session_id": parent, "prompt": "refactor the parser"})),
        ("llm:request", json!({"session_id": parent, "provider": "anthropic", "model": "claude"})),
        (
            "llm:response",
            json!({"session_id": parent, "usage": {"input_tokens": 1200, "output_tokens": 310}}),
        ),
        ("tool:pre", json!({"session_id": parent, "tool_name": "task", "tool_input": {"agent": "explorer"}})),
        ("session:fork", json!({"session_id": child, "parent_id": parent})),
        ("execution:start", json!({"session_id": child})),
        ("tool:pre", json!({"session_id": child, "tool_name": "grep"})),
        ("tool:post", json!({"session_id": child, "tool_name": "grep", "result": "3 matches"})),
        ("context:compaction", json!({"session_id": child, "tokens_before": 9000, "tokens_after": 4000})),
        ("execution:end", json!({"session_id": child})),
        ("session:end", json!({"session_id": child, "status": "completed"})),
        ("tool:post", json!({"session_id": parent, "tool_name": "task"})),
        ("tool:pre", json!({"session_id": parent, "tool_name": "bash"})),
        (
            "tool:error",
            json!({"session_id": parent, "tool_name": "bash", "error": {"type": "timeout", "message": "timed out"}}),
        ),
        ("prompt:complete", json!({"session_id": parent})),
        ("execution:end", json!({"session_id": parent})),
        ("session:end", json!({"session_id": parent, "status": "completed"})),
    ];

    events
        .into_iter()
        .map(|(event, data)| Record {
            event: event.to_string(),
            data,
        })
        .collect()
}

fn print_counters(handoff: Option<Arc<HandoffMetrics>>, export: Option<Arc<ExportMetrics>>) {
    println!();
    println!("Counters");
    if let Some(handoff) = handoff {
        println!("   spans submitted:         {}", handoff.spans_submitted());
        println!("   spans dropped:           {}", handoff.spans_dropped());
        println!("   metric points submitted: {}", handoff.metric_points_submitted());
        println!("   metric points dropped:   {}", handoff.metric_points_dropped());
    }
    if let Some(export) = export {
        println!("   spans exported:          {}", export.spans_exported());
        println!("   metric points exported:  {}", export.metric_points_exported());
        println!("   batches exported:        {}", export.batches_exported());
        println!("   export errors:           {}", export.export_errors());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let args = Args::parse()?;
    let config = load_config(&args)?;
    let records = match &args.file {
        Some(path) => load_records(path)?,
        None => builtin_scenario(),
    };

    println!("Replaying {} events via {:?}", records.len(), config.exporter);
    let mounted = mount(&config)?;
    if !mounted.is_enabled() {
        println!("Telemetry is disabled (opt-out or nothing captured); events are ignored.");
    }

    let started = Instant::now();
    if args.file.is_none() {
        mounted
            .telemetry()
            .bundle_loaded(BundleInfo::new("foundation").with_version("1.0.0"), true);
    }
    for record in &records {
        mounted.hook().on_event(&record.event, &record.data);
    }
    let elapsed = started.elapsed();

    let handoff = mounted.handoff_metrics().cloned();
    let export = mounted.export_metrics().cloned();
    mounted.shutdown().await?;

    print_counters(handoff, export);
    println!(
        "Handled {} events in {:.2?} ({:.0} events/s)",
        records.len(),
        elapsed,
        records.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
