// Broker service main entry point.
mod observability;

use anyhow::{Context, Result};
use broker::{config, transport};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use trellis_broker::Broker;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("trellis-broker")?;

    let config = config::BrokerConfig::from_env_or_yaml()?;
    let broker = Arc::new(Broker::new(config.settings()));
    tracing::info!(
        dispatch_delay_ms = config.dispatch_delay_ms,
        max_missing_acks = config.limits.max_missing_acks,
        "broker started"
    );

    // Expose Prometheus metrics on the configured bind address.
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let listener = TcpListener::bind(config.bind)
        .await
        .context("bind TCP listener")?;
    tracing::info!(addr = %listener.local_addr()?, "tcp listener started");

    let accept_task = {
        let broker = Arc::clone(&broker);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = transport::serve(listener, broker, config).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    accept_task.abort();
    tracing::info!("broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_binds_and_stops() -> Result<()> {
        let _g1 = EnvGuard::set("TRELLIS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("TRELLIS_METRICS_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::unset("TRELLIS_BROKER_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_rejects_bad_config() {
        let _g1 = EnvGuard::set("TRELLIS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("TRELLIS_METRICS_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::set("TRELLIS_BROKER_CONFIG", "/nonexistent/trellis.yaml");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
