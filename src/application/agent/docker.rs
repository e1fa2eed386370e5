//! Docker CLI plumbing on the agent.
//!
//! The agent is not a container runtime; it drives the host's docker
//! binary through the executor and returns the tool's own output.

use std::time::Duration;

use crate::domain::error::ExecError;
use crate::infrastructure::control::protocol::{SystemInfo, SystemMetrics};
use crate::services::Executor;

const OP_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn docker(exec: &Executor, args: &[&str]) -> Result<String, ExecError> {
    let args: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();
    let out = exec.run("docker", &args, OP_TIMEOUT).await?;
    Ok(out.stdout)
}

pub async fn list_containers(exec: &Executor) -> Result<String, ExecError> {
    docker(exec, &["ps", "-a", "--format", "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}"]).await
}

pub async fn restart_container(exec: &Executor, id: &str) -> Result<String, ExecError> {
    docker(exec, &["restart", id]).await
}

pub async fn stop_container(exec: &Executor, id: &str) -> Result<String, ExecError> {
    docker(exec, &["stop", id]).await
}

pub async fn start_container(exec: &Executor, id: &str) -> Result<String, ExecError> {
    docker(exec, &["start", id]).await
}

pub async fn remove_container(exec: &Executor, id: &str) -> Result<String, ExecError> {
    docker(exec, &["rm", "-f", id]).await
}

pub async fn docker_info(exec: &Executor) -> Result<String, ExecError> {
    docker(exec, &["info", "--format", "{{json .}}"]).await
}

pub async fn list_images(exec: &Executor) -> Result<String, ExecError> {
    docker(exec, &["images", "--format", "{{.ID}}\t{{.Repository}}\t{{.Tag}}\t{{.Size}}"]).await
}

pub async fn remove_image(exec: &Executor, id: &str) -> Result<String, ExecError> {
    docker(exec, &["rmi", id]).await
}

pub async fn prune_images(exec: &Executor) -> Result<String, ExecError> {
    docker(exec, &["image", "prune", "-f"]).await
}

pub async fn list_networks(exec: &Executor) -> Result<String, ExecError> {
    docker(exec, &["network", "ls", "--format", "{{.ID}}\t{{.Name}}\t{{.Driver}}"]).await
}

pub async fn create_network(exec: &Executor, name: &str) -> Result<String, ExecError> {
    docker(exec, &["network", "create", name]).await
}

pub async fn remove_network(exec: &Executor, name: &str) -> Result<String, ExecError> {
    docker(exec, &["network", "rm", name]).await
}

pub async fn list_volumes(exec: &Executor) -> Result<String, ExecError> {
    docker(exec, &["volume", "ls", "--format", "{{.Name}}\t{{.Driver}}"]).await
}

pub async fn create_volume(exec: &Executor, name: &str) -> Result<String, ExecError> {
    docker(exec, &["volume", "create", name]).await
}

pub async fn remove_volume(exec: &Executor, name: &str) -> Result<String, ExecError> {
    docker(exec, &["volume", "rm", name]).await
}

/// Host facts for `GetSystemInfo`.
pub async fn system_info(exec: &Executor) -> Result<SystemInfo, ExecError> {
    let hostname = exec
        .run("hostname", &[], OP_TIMEOUT)
        .await
        .map(|o| o.stdout.trim().to_string())
        .unwrap_or_default();
    let os = exec
        .run("uname", &["-s".to_string()], OP_TIMEOUT)
        .await
        .map(|o| o.stdout.trim().to_string())
        .unwrap_or_default();
    let kernel = exec
        .run("uname", &["-r".to_string()], OP_TIMEOUT)
        .await
        .map(|o| o.stdout.trim().to_string())
        .unwrap_or_default();
    let arch = exec
        .run("uname", &["-m".to_string()], OP_TIMEOUT)
        .await
        .map(|o| o.stdout.trim().to_string())
        .unwrap_or_default();
    Ok(SystemInfo { hostname, os, kernel, arch })
}

/// Point-in-time host metrics for `GetSystemMetrics`.
pub async fn system_metrics() -> SystemMetrics {
    let load_1m = tokio::fs::read_to_string("/proc/loadavg")
        .await
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0);

    let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.unwrap_or_default();
    let mem_field = |name: &str| -> u64 {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    let mem_total_kb = mem_field("MemTotal:");
    let mem_available_kb = mem_field("MemAvailable:");

    // Root filesystem usage, best effort.
    let disk_used_percent = Executor::new()
        .run("df", &["--output=pcent".to_string(), "/".to_string()], OP_TIMEOUT)
        .await
        .ok()
        .and_then(|o| {
            o.stdout
                .lines()
                .nth(1)
                .map(|l| l.trim().trim_end_matches('%').parse().unwrap_or(0.0))
        })
        .unwrap_or(0.0);

    SystemMetrics { load_1m, mem_total_kb, mem_available_kb, disk_used_percent }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_metrics_reads_proc() {
        let metrics = system_metrics().await;
        // On any Linux host these are populated; zero only on failure.
        assert!(metrics.mem_total_kb > 0);
        assert!(metrics.load_1m >= 0.0);
    }

    #[tokio::test]
    async fn test_system_info_reports_hostname() {
        let info = system_info(&Executor::new()).await.unwrap();
        assert!(!info.hostname.is_empty());
        assert_eq!(info.os, "Linux");
    }
}
