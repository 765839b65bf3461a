//! Load generator for a running relay
//!
//! Each simulated user creates its own stream, then sends its messages one
//! after another, retrying non-202 answers with exponential backoff.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::warn;

use super::errors::{CliError, CliResult};
use crate::auth::API_KEY_HEADER;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub url: String,
    pub api_key: String,
    pub users: usize,
    pub messages: usize,
    pub max_retries: u32,
}

/// Outcome of one benchmark run
#[derive(Debug, Clone, Default)]
pub struct BenchReport {
    pub elapsed: Duration,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub streams_failed: u64,
    /// Per-message latency including retries, sorted ascending
    pub latencies_ms: Vec<f64>,
}

impl BenchReport {
    pub fn successful_requests(&self) -> u64 {
        self.total_requests - self.failed_requests
    }

    pub fn requests_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.successful_requests() as f64 / seconds
    }

    /// Nearest-rank percentile over the sorted latencies
    pub fn percentile(&self, p: usize) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let index = (self.latencies_ms.len() * p / 100).min(self.latencies_ms.len() - 1);
        Some(self.latencies_ms[index])
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Benchmark completed in {:?}", self.elapsed)?;
        writeln!(f, "Total requests: {}", self.total_requests)?;
        writeln!(f, "Successful requests: {}", self.successful_requests())?;
        writeln!(f, "Failed requests: {}", self.failed_requests)?;
        if self.streams_failed > 0 {
            writeln!(f, "Streams that could not be created: {}", self.streams_failed)?;
        }
        writeln!(f, "Requests per second: {:.2}", self.requests_per_second())?;

        if !self.latencies_ms.is_empty() {
            writeln!(f, "Latency (ms):")?;
            for p in [50, 90, 95, 99] {
                if let Some(value) = self.percentile(p) {
                    writeln!(f, "  {}%: {:.2}", p, value)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct StartStreamBody {
    stream_id: String,
}

#[derive(Default)]
struct UserOutcome {
    stream_failed: bool,
    requests: u64,
    failures: u64,
    latencies_ms: Vec<f64>,
}

/// Run the benchmark to completion
pub async fn run(options: BenchOptions) -> CliResult<BenchReport> {
    if options.users == 0 {
        return Err(CliError::Bench("at least one user is required".to_string()));
    }

    let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let base_url = options.url.trim_end_matches('/').to_string();
    let started = Instant::now();

    let mut users = JoinSet::new();
    for user in 0..options.users {
        let client = client.clone();
        let base_url = base_url.clone();
        let options = options.clone();
        users.spawn(async move { run_user(&client, &base_url, &options, user).await });
    }

    let mut report = BenchReport::default();
    while let Some(joined) = users.join_next().await {
        let outcome = joined.map_err(|e| CliError::Bench(e.to_string()))?;
        report.streams_failed += u64::from(outcome.stream_failed);
        report.total_requests += outcome.requests;
        report.failed_requests += outcome.failures;
        report.latencies_ms.extend(outcome.latencies_ms);
    }

    report.elapsed = started.elapsed();
    report.latencies_ms.sort_by(f64::total_cmp);
    Ok(report)
}

async fn run_user(
    client: &reqwest::Client,
    base_url: &str,
    options: &BenchOptions,
    user: usize,
) -> UserOutcome {
    let mut outcome = UserOutcome::default();

    let stream_id = match create_stream(client, base_url, &options.api_key).await {
        Ok(id) => id,
        Err(e) => {
            warn!(user, error = %e, "Failed to create stream");
            outcome.stream_failed = true;
            return outcome;
        }
    };

    for message in 0..options.messages {
        let body = json!({ "data": format!("Message {} from user {}", message, user) });
        let started = Instant::now();
        let accepted = send_with_retry(client, base_url, options, &stream_id, &body).await;

        outcome.requests += 1;
        if !accepted {
            outcome.failures += 1;
        }
        outcome
            .latencies_ms
            .push(started.elapsed().as_secs_f64() * 1000.0);
    }

    outcome
}

async fn create_stream(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> CliResult<String> {
    let response = client
        .post(format!("{}/stream/start", base_url))
        .header(API_KEY_HEADER, api_key)
        .send()
        .await?
        .error_for_status()?;

    let body: StartStreamBody = response.json().await?;
    Ok(body.stream_id)
}

/// Returns whether the relay eventually answered 202
async fn send_with_retry(
    client: &reqwest::Client,
    base_url: &str,
    options: &BenchOptions,
    stream_id: &str,
    body: &serde_json::Value,
) -> bool {
    let url = format!("{}/stream/{}/send", base_url, stream_id);
    let attempts = options.max_retries.max(1);

    for attempt in 0..attempts {
        let result = client
            .post(&url)
            .header(API_KEY_HEADER, &options.api_key)
            .json(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status() == StatusCode::ACCEPTED => return true,
            Ok(response) => {
                warn!(stream_id, attempt, status = %response.status(), "Send rejected")
            }
            Err(e) => warn!(stream_id, attempt, error = %e, "Send failed"),
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(retry_delay(attempt)).await;
        }
    }
    false
}

/// 100ms, 200ms, 400ms, ... capped at 2^10 times the base
fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.pow(attempt.min(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(latencies: &[f64]) -> BenchReport {
        BenchReport {
            elapsed: Duration::from_secs(2),
            total_requests: 10,
            failed_requests: 2,
            streams_failed: 0,
            latencies_ms: latencies.to_vec(),
        }
    }

    #[test]
    fn test_percentiles_use_nearest_rank() {
        let latencies: Vec<f64> = (1..=100).map(f64::from).collect();
        let report = report(&latencies);

        assert_eq!(report.percentile(50), Some(51.0));
        assert_eq!(report.percentile(99), Some(100.0));
        assert_eq!(report.percentile(100), Some(100.0));
        assert_eq!(BenchReport::default().percentile(50), None);
    }

    #[test]
    fn test_throughput_counts_successes_only() {
        let report = report(&[]);
        assert_eq!(report.successful_requests(), 8);
        assert!((report.requests_per_second() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(0), Duration::from_millis(100));
        assert_eq!(retry_delay(1), Duration::from_millis(200));
        assert_eq!(retry_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_display_lists_percentiles() {
        let text = report(&[1.0, 2.0, 3.0]).to_string();
        assert!(text.contains("Failed requests: 2"));
        assert!(text.contains("  99%: 3.00"));
    }
}
