use courier_agent::{BackendMonitor, HealthGate};
use courier_core::Config;
use courier_providers::{create_brain_provider, create_cerebellum_provider};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let gate = Arc::new(HealthGate::new(&config.health));
    let monitor = BackendMonitor::new(
        gate.clone(),
        [
            create_brain_provider(&config)?,
            create_cerebellum_provider(&config)?,
        ],
        Duration::from_secs(config.health.probe_interval_secs.max(1)),
    );

    println!("Probing {} backend endpoint(s)...", monitor.endpoints().len());
    let all_ok = monitor.probe_once().await;

    let mut statuses: Vec<_> = gate.statuses().await.into_iter().collect();
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    for (endpoint, status) in statuses {
        if status.healthy {
            println!("  ✓ {}", endpoint);
        } else {
            println!(
                "  ✗ {}  {}",
                endpoint,
                status.last_error.as_deref().unwrap_or("unhealthy")
            );
        }
    }

    if !all_ok {
        anyhow::bail!("one or more backends are unavailable");
    }
    Ok(())
}
