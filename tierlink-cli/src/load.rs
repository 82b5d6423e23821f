//! Load generation over a single persistent connection.

use clap::Args;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tierlink_client::{Client, ClientError};
use tierlink_protocol::message::Operation;
use tierlink_protocol::{Request, Response, StatusCode};

/// What each load request sends.
#[derive(Args, Debug, Clone)]
pub struct LoadTarget {
    /// Operation to call
    #[arg(short, long, default_value = "get_account_by_account_number")]
    pub operation: String,

    /// Account number sent with account lookups
    #[arg(short, long, default_value = "1234567890")]
    pub account_number: String,
}

impl LoadTarget {
    /// Builds the request template, checking the operation name.
    pub fn request(&self) -> Result<Request, String> {
        let op: Operation = self.operation.parse()?;
        let request = Request::for_operation(op);
        Ok(match op {
            Operation::GetAccountByAccountNumber => {
                request.with_param("account_number", self.account_number.as_str())
            }
            Operation::Ping => request,
        })
    }
}

/// Outcome counters and latencies of one run.
///
/// `failed` includes timeouts; `timeouts` counts them separately.
#[derive(Debug, Default, Clone)]
pub struct LoadStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
    latencies: Vec<Duration>,
    errors: BTreeMap<String, u64>,
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed call.
    pub fn record(&mut self, latency: Duration, result: &Result<Response, ClientError>) {
        self.total += 1;
        self.latencies.push(latency);

        let error = match result {
            Ok(resp) if resp.is_ok() => None,
            Ok(resp) => {
                if resp.status == StatusCode::TIMEOUT {
                    self.timeouts += 1;
                }
                Some(format!("{}: {}", resp.status, resp.err_info))
            }
            Err(e) => {
                if e.is_timeout() {
                    self.timeouts += 1;
                }
                Some(e.to_string())
            }
        };

        match error {
            None => self.successful += 1,
            Some(msg) => {
                self.failed += 1;
                *self.errors.entry(msg).or_default() += 1;
            }
        }
    }

    /// Folds another run's numbers into this one.
    pub fn merge(&mut self, other: LoadStats) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
        self.timeouts += other.timeouts;
        self.latencies.extend(other.latencies);
        for (msg, count) in other.errors {
            *self.errors.entry(msg).or_default() += count;
        }
    }

    /// Nearest-rank percentile of the recorded latencies.
    pub fn percentile(&self, p: f64) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }

    pub fn summary(&self, elapsed: Duration) -> Summary {
        let secs = elapsed.as_secs_f64();
        Summary {
            test_duration_ms: elapsed.as_millis() as u64,
            total_requests: self.total,
            successful_requests: self.successful,
            failed_requests: self.failed,
            timeout_requests: self.timeouts,
            average_rps: if secs > 0.0 {
                self.total as f64 / secs
            } else {
                0.0
            },
            p95_latency_ms: self.percentile(95.0).as_secs_f64() * 1000.0,
            p99_latency_ms: self.percentile(99.0).as_secs_f64() * 1000.0,
            errors: self.errors.clone(),
        }
    }
}

/// Printable result of a load run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub test_duration_ms: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub average_rps: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub errors: BTreeMap<String, u64>,
}

impl Summary {
    pub fn render(&self) -> String {
        let mut out = format!(
            "{}\n  Duration:    {} ms\n  Requests:    {}\n  Successful:  {}\n  Failed:      {}\n  Timeouts:    {}\n  Average RPS: {:.1}\n  p95 latency: {:.2} ms\n  p99 latency: {:.2} ms",
            "Load test summary".bold(),
            self.test_duration_ms,
            self.total_requests,
            self.successful_requests.to_string().green(),
            if self.failed_requests > 0 {
                self.failed_requests.to_string().red()
            } else {
                self.failed_requests.to_string().normal()
            },
            self.timeout_requests,
            self.average_rps,
            self.p95_latency_ms,
            self.p99_latency_ms,
        );
        if !self.errors.is_empty() {
            out.push_str(&format!("\n{}", "Errors".bold()));
            for (msg, count) in &self.errors {
                out.push_str(&format!("\n  {:>6}  {}", count, msg));
            }
        }
        out
    }
}

async fn timed_call(client: &Client, request: Request) -> (Duration, Result<Response, ClientError>) {
    let start = Instant::now();
    let result = client.send(request).await;
    (start.elapsed(), result)
}

/// Sends `requests` calls at once and waits for all of them.
pub async fn run_burst(client: &Client, template: &Request, requests: usize) -> (LoadStats, Duration) {
    let start = Instant::now();
    let calls = (0..requests).map(|_| timed_call(client, template.clone()));
    let results = futures::future::join_all(calls).await;
    let elapsed = start.elapsed();

    let mut stats = LoadStats::new();
    for (latency, result) in &results {
        stats.record(*latency, result);
    }
    (stats, elapsed)
}

/// Runs `concurrency` workers back to back until `duration` has passed.
pub async fn run_sustain(
    client: &Client,
    template: &Request,
    duration: Duration,
    concurrency: usize,
) -> (LoadStats, Duration) {
    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + duration;

    let workers: Vec<_> = (0..concurrency.max(1))
        .map(|_| {
            let client = client.clone();
            let template = template.clone();
            tokio::spawn(async move {
                let mut stats = LoadStats::new();
                while tokio::time::Instant::now() < deadline {
                    let (latency, result) = timed_call(&client, template.clone()).await;
                    stats.record(latency, &result);
                }
                stats
            })
        })
        .collect();

    let mut stats = LoadStats::new();
    for worker in futures::future::join_all(workers).await {
        match worker {
            Ok(worker_stats) => stats.merge(worker_stats),
            Err(e) => tracing::warn!("Load worker failed: {}", e),
        }
    }
    (stats, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierlink_protocol::Params;

    fn ok() -> Result<Response, ClientError> {
        Ok(Response::ok("1", Params::new()))
    }

    #[test]
    fn test_record_outcomes() {
        let mut stats = LoadStats::new();
        stats.record(Duration::from_millis(1), &ok());
        stats.record(
            Duration::from_millis(2),
            &Ok(Response::error("2", StatusCode::GENERIC_ERROR, "account not found")),
        );
        stats.record(
            Duration::from_millis(3),
            &Err(ClientError::RequestTimeout(Duration::from_secs(1))),
        );
        stats.record(
            Duration::from_millis(4),
            &Ok(Response::error("4", StatusCode::TIMEOUT, "downstream timed out")),
        );

        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.timeouts, 2);
        assert_eq!(stats.errors.get("999: account not found"), Some(&1));
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let mut stats = LoadStats::new();
        for ms in 1..=100 {
            stats.record(Duration::from_millis(ms), &ok());
        }
        assert_eq!(stats.percentile(95.0), Duration::from_millis(95));
        assert_eq!(stats.percentile(99.0), Duration::from_millis(99));
        assert_eq!(stats.percentile(100.0), Duration::from_millis(100));
        assert_eq!(LoadStats::new().percentile(99.0), Duration::ZERO);
    }

    #[test]
    fn test_merge_and_summary() {
        let mut a = LoadStats::new();
        a.record(Duration::from_millis(10), &ok());
        let mut b = LoadStats::new();
        b.record(
            Duration::from_millis(20),
            &Err(ClientError::ConnectionClosed),
        );
        a.merge(b);

        let summary = a.summary(Duration::from_secs(2));
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.failed_requests, 1);
        assert!((summary.average_rps - 1.0).abs() < f64::EPSILON);
        assert!(summary.render().contains("Average RPS: 1.0"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["successful_requests"], 1);
    }

    #[test]
    fn test_target_request() {
        let target = LoadTarget {
            operation: "get_account_by_account_number".into(),
            account_number: "42".into(),
        };
        let req = target.request().unwrap();
        assert_eq!(req.params["account_number"], "42");

        let ping = LoadTarget {
            operation: "ping".into(),
            account_number: "42".into(),
        };
        assert!(ping.request().unwrap().params.is_empty());

        let bad = LoadTarget {
            operation: "nope".into(),
            account_number: String::new(),
        };
        assert!(bad.request().is_err());
    }
}
