//! Resource usage sampling
//! 资源使用采样
//!
//! Process-wide figures: CPU time of this process plus its reaped children, and the
//! resident set of this process. Concurrent invocations overlap in these numbers.
//! 进程级数据：本进程及已回收子进程的 CPU 时间，以及本进程的常驻内存。

use std::time::Instant;

use crate::dispatch::invocation::ExecutionMetrics;

/// Point-in-time resource reading / 某一时刻的资源读数
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    at: Instant,
    cpu_time_ms: u64,
    resident_bytes: u64,
}

impl ResourceSnapshot {
    pub fn take() -> Self {
        Self {
            at: Instant::now(),
            cpu_time_ms: cpu_time_ms(),
            resident_bytes: resident_bytes(),
        }
    }

    /// Metrics accumulated since this snapshot / 自该快照以来累积的指标
    pub fn metrics_since(&self) -> ExecutionMetrics {
        let now = Self::take();
        ExecutionMetrics {
            duration_ms: now.at.duration_since(self.at).as_millis() as u64,
            memory_used_bytes: now.resident_bytes.saturating_sub(self.resident_bytes),
            cpu_time_ms: now.cpu_time_ms.saturating_sub(self.cpu_time_ms),
        }
    }
}

#[cfg(unix)]
fn cpu_time_ms() -> u64 {
    fn timeval_ms(tv: libc::timeval) -> u64 {
        (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
    }

    let mut total = 0;
    for who in [libc::RUSAGE_SELF, libc::RUSAGE_CHILDREN] {
        // SAFETY: getrusage only writes into the zeroed struct we own
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(who, &mut usage) } == 0 {
            total += timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime);
        }
    }
    total
}

#[cfg(not(unix))]
fn cpu_time_ms() -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn resident_bytes() -> u64 {
    // statm: size resident shared text lib data dt (in pages)
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    pages * if page_size > 0 { page_size as u64 } else { 4096 }
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_measure_wall_clock() {
        let snapshot = ResourceSnapshot::take();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let metrics = snapshot.metrics_since();
        assert!(metrics.duration_ms >= 20);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_set_is_readable() {
        assert!(resident_bytes() > 0);
    }
}
