//! `conduit run` - execute a command through the orchestrator

use conduit_exec::{ExecuteOptions, ExecutionOrchestrator, LocalInvoker, Severity};
use conduit_foundation::event::{COMMAND_CANCELLED, COMMAND_COMPLETE, HEARTBEAT, PROGRESS};
use conduit_foundation::util::format_bytes;
use conduit_foundation::{CancellationToken, ConduitConfig, ConduitEvent, EventBus, EventListener};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RunRequest {
    pub command: String,
    pub arguments: Value,
    pub skip_cache: bool,
    pub timeout: Option<Duration>,
    pub show_events: bool,
    pub repeat: u32,
    pub show_stats: bool,
}

pub async fn run(config: &ConduitConfig, request: RunRequest) -> anyhow::Result<()> {
    let bus = Arc::new(EventBus::new());
    if request.show_events {
        bus.subscribe(Arc::new(EventPrinter));
    }

    let invoker = Arc::new(LocalInvoker::new(config.tool.clone(), config.parser.clone()));
    let orchestrator = ExecutionOrchestrator::new(invoker, config, bus);

    // Ctrl-C → cancellation
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, cancelling...");
                cancel.cancel();
            }
        })
    };

    let mut outcome = Ok(());
    for round in 1..=request.repeat {
        let mut options = ExecuteOptions::default().with_cancel(cancel.clone());
        if request.skip_cache {
            options = options.skip_cache();
        }
        if let Some(timeout) = request.timeout {
            options = options.with_timeout(timeout);
        }

        debug!(round, command = %request.command, "Executing");
        match orchestrator
            .execute(&request.command, &request.arguments, options)
            .await
        {
            Ok(result) => {
                if request.repeat > 1 {
                    println!("# run {} ({})", round, if result.cached { "cached" } else { "live" });
                }
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Err(e) => {
                eprintln!("Error [{}]: {}", e.kind(), e);
                outcome = Err(e.into());
                break;
            }
        }
    }

    if request.show_stats {
        print_stats(&orchestrator);
    }

    ctrl_c.abort();
    orchestrator.shutdown();
    outcome
}

fn print_stats(orchestrator: &ExecutionOrchestrator) {
    let cache = orchestrator.cache_stats();
    println!("\n📊 Statistics\n");
    println!("{}", orchestrator.monitor().summary_report());
    println!(
        "Cache: {} entries ({}), {} hits / {} misses ({:.0}% hit rate), {} evictions",
        cache.entries,
        format_bytes(cache.total_bytes as u64),
        cache.hits,
        cache.misses,
        cache.hit_rate * 100.0,
        cache.evictions
    );

    let stats = orchestrator.statistics();
    if !stats.by_command.is_empty() {
        println!(
            "\n{:<16} {:>6} {:>10} {:>10} {:>9}",
            "Command", "Runs", "Avg (ms)", "Max (ms)", "Success"
        );
        println!("{}", "-".repeat(55));
        for (name, command) in &stats.by_command {
            println!(
                "{:<16} {:>6} {:>10.0} {:>10} {:>8.0}%",
                name,
                command.count,
                command.avg_time_ms,
                command.max_time_ms,
                command.success_rate * 100.0
            );
        }
    }

    let recommendations = orchestrator.recommendations();
    if !recommendations.is_empty() {
        println!("\n💡 Recommendations\n");
        for rec in recommendations {
            let marker = match rec.priority {
                Severity::High => "!!",
                Severity::Medium => "! ",
                Severity::Low => "  ",
            };
            println!("{} {}", marker, rec.message);
        }
    }
}

/// Prints lifecycle events to stderr
struct EventPrinter;

impl EventListener for EventPrinter {
    fn name(&self) -> &str {
        "cli-printer"
    }

    fn on_event(&self, event: &ConduitEvent) {
        let data = &event.data;
        let command = data["commandName"].as_str().unwrap_or("?");
        match event.event_type.as_str() {
            PROGRESS => {
                let percent = data["progress"].as_f64().unwrap_or(0.0);
                let status = data["status"].as_str().unwrap_or("");
                let eta = data["estimatedTimeRemaining"]
                    .as_u64()
                    .map(|ms| format!(" eta {:.1}s", ms as f64 / 1000.0))
                    .unwrap_or_default();
                let message = data["message"]
                    .as_str()
                    .map(|m| format!(" - {}", m))
                    .unwrap_or_default();
                eprintln!("[{}] {:>5.1}% {}{}{}", command, percent, status, eta, message);
            }
            HEARTBEAT => {
                let running = data["runningTime"].as_u64().unwrap_or(0);
                eprintln!("[{}] still running ({:.0}s)", command, running as f64 / 1000.0);
            }
            COMMAND_COMPLETE => {
                let mark = if data["success"].as_bool() == Some(true) { "✓" } else { "✗" };
                let ms = data["executionTime"].as_u64().unwrap_or(0);
                eprintln!("[{}] {} {}ms", command, mark, ms);
            }
            COMMAND_CANCELLED => {
                let reason = data["reason"].as_str().unwrap_or("");
                warn!(command, reason, "Command cancelled");
            }
            _ => {}
        }
    }
}
