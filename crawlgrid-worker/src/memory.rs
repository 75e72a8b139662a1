/// Resident set size of this process in bytes, where the platform exposes it.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}

/// True when the process uses more than `threshold_mib`. A zero threshold
/// or an unknown resident size never reports short memory.
pub fn is_short_memory(threshold_mib: u64) -> bool {
    if threshold_mib == 0 {
        return false;
    }
    resident_memory_bytes().is_some_and(|rss| rss > threshold_mib * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_status() {
        let status = "Name:\tcrawlgrid-worker\nVmPeak:\t  20000 kB\nVmRSS:\t   12345 kB\nThreads:\t8\n";
        assert_eq!(parse_vm_rss(status), Some(12345 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[test]
    fn zero_threshold_is_disabled() {
        assert!(!is_short_memory(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn tiny_threshold_trips_on_linux() {
        assert!(is_short_memory(1));
    }
}
