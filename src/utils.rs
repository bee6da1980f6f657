use crate::core::gpu::GpuSnapshot;
use crate::core::resources::bytes_to_mb;
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

/// One line per GPU: id, free/total memory in MiB and utilization.
pub fn format_gpu_snapshot(gpus: &[GpuSnapshot]) -> String {
    if gpus.is_empty() {
        return "No GPUs detected".to_string();
    }
    let mut out = format!(
        "{:<4} {:>10} {:>10} {:>6} {:>6}\n",
        "GPU", "FREE_MIB", "TOTAL_MIB", "UTIL%", "MEM%"
    );
    for gpu in gpus {
        out.push_str(&format!(
            "{:<4} {:>10} {:>10} {:>6} {:>6}\n",
            gpu.id,
            bytes_to_mb(gpu.memory_free_bytes),
            bytes_to_mb(gpu.memory_total_bytes),
            gpu.util_gpu_pct,
            gpu.util_mem_pct
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gpu_snapshot() {
        let gpus = vec![GpuSnapshot {
            id: 0,
            memory_total_bytes: 8 * 1024 * 1024 * 1024,
            memory_free_bytes: 6 * 1024 * 1024 * 1024,
            memory_used_bytes: 2 * 1024 * 1024 * 1024,
            util_gpu_pct: 42,
            util_mem_pct: 7,
        }];
        let out = format_gpu_snapshot(&gpus);
        let line = out.lines().nth(1).unwrap();
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields, vec!["0", "6144", "8192", "42", "7"]);
    }

    #[test]
    fn test_format_empty_snapshot() {
        assert_eq!(format_gpu_snapshot(&[]), "No GPUs detected");
    }
}
