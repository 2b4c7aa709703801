use colored::*;
use std::time::Duration;

use crate::stream_client::{Connection, Event};

// Longer payloads (a full reset) are cut for display.
const PREVIEW_CHARS: usize = 120;

/// What one downstream client saw during a scenario.
#[derive(Debug, Clone)]
pub struct ClientReport {
    pub label: String,
    pub events: usize,
    pub first_event_latency: Option<Duration>,
}

impl From<&Connection> for ClientReport {
    fn from(connection: &Connection) -> Self {
        Self {
            label: connection.label.clone(),
            events: connection.events_received,
            first_event_latency: connection.first_event_latency(),
        }
    }
}

#[derive(Debug)]
pub struct TestResult {
    pub scenario: String,
    pub passed: bool,
    pub message: Option<String>,
    pub duration: Duration,
    pub clients: Vec<ClientReport>,
}

impl TestResult {
    /// Slowest time to first event across the clients that received one.
    pub fn slowest_first_event(&self) -> Option<Duration> {
        self.clients
            .iter()
            .filter_map(|client| client.first_event_latency)
            .max()
    }

    /// Clients that never received an event.
    pub fn silent_clients(&self) -> usize {
        self.clients.iter().filter(|client| client.events == 0).count()
    }
}

pub fn print_event(label: &str, event: &Event) {
    println!(
        "\n[{}] {} event received",
        label.bright_blue().bold(),
        event.event_type.yellow()
    );

    let preview: String = event.data.chars().take(PREVIEW_CHARS).collect();
    if preview.len() < event.data.len() {
        println!("   {}...", preview.dimmed());
    } else {
        println!("   {}", preview.dimmed());
    }
}

pub fn print_test_summary(results: &[TestResult]) {
    println!("\n{}", "=== STREAM SUMMARY ===".bright_white().bold());

    for result in results {
        let status = if result.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };

        let slowest = result
            .slowest_first_event()
            .map(|latency| format!("{:?}", latency))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "[{}] {} ({:?}): {} client(s), {} silent, slowest first event {}",
            status,
            result.scenario,
            result.duration,
            result.clients.len(),
            result.silent_clients(),
            slowest
        );

        for client in &result.clients {
            let latency = client
                .first_event_latency
                .map(|latency| format!("{:?}", latency))
                .unwrap_or_else(|| "no event".to_string());
            println!(
                "      {} {} event(s), first after {}",
                client.label.bright_blue(),
                client.events,
                latency
            );
        }

        if let Some(msg) = &result.message {
            println!("      {}", msg.dimmed());
        }
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    let events: usize = results
        .iter()
        .flat_map(|r| r.clients.iter())
        .map(|client| client.events)
        .sum();
    println!(
        "\n{}: {} events across {} scenario(s), {} failed",
        "Results".bold(),
        events.to_string().green(),
        results.len(),
        failed.to_string().red()
    );
}
