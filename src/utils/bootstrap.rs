//! Bootstrap utilities for the worker binaries.

use std::future::Future;
use std::time::Duration;

use backon::Retryable;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the LOYALTY_LOG environment variable.
///
/// Defaults to "info" level if LOYALTY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Extract the value of `--config <path>` / `-c <path>` from process args.
pub fn parse_config_path<I>(args: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Run `connect` until it succeeds or the connection backoff is exhausted.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "redis", "kafka")
/// * `connect` - Async function that attempts to establish a connection
pub async fn connect_with_retry<T, E, F, Fut>(service_name: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let client = connect
        .retry(connection_backoff())
        .notify(|err: &E, dur: Duration| {
            warn!(service = %service_name, error = %err, delay = ?dur, "Connection failed, retrying");
        })
        .await?;
    tracing::info!(service = %service_name, "Connected");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_config_path() {
        assert_eq!(
            parse_config_path(args(&["reward-engine", "--config", "a.yaml"])),
            Some("a.yaml".to_string())
        );
        assert_eq!(
            parse_config_path(args(&["fraud-detector", "-c", "b.yaml"])),
            Some("b.yaml".to_string())
        );
        assert_eq!(
            parse_config_path(args(&["fraud-detector", "--config=c.yaml"])),
            Some("c.yaml".to_string())
        );
        assert_eq!(parse_config_path(args(&["fraud-detector"])), None);
        assert_eq!(parse_config_path(args(&["fraud-detector", "-c"])), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_recovers() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_retry("test", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {} refused", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }
}
