/// Size the tokio worker pool from the container's CPU limit rather than the
/// host CPU count, which over-provisions threads when a container is limited
/// to e.g. 4 cores on a 64-core machine.
///
/// Sources, in order: `RELAY_CPU_LIMIT` env var ("4" or "4000m"), cgroup v2
/// `cpu.max`, cgroup v1 cfs quota/period, then host parallelism.
pub fn get_container_cpu_limit() -> usize {
    let detected = env_cpu_limit()
        .or_else(cgroup_v2_cpu_limit)
        .or_else(cgroup_v1_cpu_limit);

    match detected {
        Some((cores, source)) => {
            let threads = cores.max(1);
            eprintln!("[runtime] worker threads from {}: {}", source, threads);
            threads
        }
        None => {
            let threads = std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1);
            eprintln!("[runtime] worker threads from host cpu count: {}", threads);
            threads
        }
    }
}

fn env_cpu_limit() -> Option<(usize, &'static str)> {
    let value = std::env::var("RELAY_CPU_LIMIT").ok()?;
    parse_cpu_value(&value).map(|c| (c, "RELAY_CPU_LIMIT"))
}

fn cgroup_v2_cpu_limit() -> Option<(usize, &'static str)> {
    let content = std::fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return None; // unlimited
    }
    quota_over_period(quota, parts.next()?).map(|c| (c, "cgroup v2"))
}

fn cgroup_v1_cpu_limit() -> Option<(usize, &'static str)> {
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
    quota_over_period(quota.trim(), period.trim()).map(|c| (c, "cgroup v1"))
}

/// Parse "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

fn quota_over_period(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
