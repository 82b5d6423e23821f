//! Command execution.

use crate::load;
use crate::Commands;
use colored::Colorize;
use serde_json::Value;
use std::time::Duration;
use tierlink_client::Client;
use tierlink_protocol::{Params, Request};

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            let pong = client.ping().await?;
            Ok(format!(
                "{} from {} at {}",
                pong.message.to_uppercase().green(),
                pong.service.cyan(),
                pong.timestamp
            ))
        }

        Commands::Account { number } => {
            let lookup = client.get_account_by_account_number(&number).await?;
            Ok(format!(
                "{}\n{}",
                format!(
                    "Account {} ({})",
                    lookup.account.account_number.cyan(),
                    lookup.customer.full_name
                )
                .bold(),
                format_json(&serde_json::to_value(&lookup)?)
            ))
        }

        Commands::Send { operation, params } => {
            let params = match params {
                Some(arg) => parse_params_arg(&arg)?,
                None => Params::new(),
            };
            let request = Request::new("", operation).with_params(params);
            let response = client.send(request).await?;
            let rendered = format_json(&serde_json::to_value(&response)?);
            if response.is_ok() {
                Ok(rendered)
            } else {
                Ok(format!("{}\n{}", "Request failed".yellow(), rendered))
            }
        }

        Commands::Burst {
            requests,
            target,
            json,
        } => {
            let template = target.request()?;
            eprintln!(
                "{} {} x {}",
                "Burst".green(),
                requests,
                target.operation.cyan()
            );
            let (stats, elapsed) = load::run_burst(client, &template, requests).await;
            render_summary(stats.summary(elapsed), json)
        }

        Commands::Sustain {
            duration_secs,
            concurrency,
            target,
            json,
        } => {
            let template = target.request()?;
            eprintln!(
                "{} {} workers for {}s on {}",
                "Sustain".green(),
                concurrency,
                duration_secs,
                target.operation.cyan()
            );
            let (stats, elapsed) = load::run_sustain(
                client,
                &template,
                Duration::from_secs(duration_secs),
                concurrency,
            )
            .await;
            render_summary(stats.summary(elapsed), json)
        }
    }
}

fn render_summary(
    summary: load::Summary,
    json: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    if json {
        Ok(serde_json::to_string_pretty(&summary)?)
    } else {
        Ok(summary.render())
    }
}

/// Parses a params argument (either inline JSON or @file.json).
fn parse_params_arg(arg: &str) -> Result<Params, Box<dyn std::error::Error>> {
    let value: Value = if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        serde_json::from_str(arg)?
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err("params must be a JSON object".into()),
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_inline() {
        let params = parse_params_arg(r#"{"account_number": "1234567890"}"#).unwrap();
        assert_eq!(params["account_number"], "1234567890");
        assert!(parse_params_arg("[1, 2]").is_err());
        assert!(parse_params_arg("{oops").is_err());
    }

    #[test]
    fn test_parse_params_missing_file() {
        assert!(parse_params_arg("@/definitely/not/here.json").is_err());
    }
}
