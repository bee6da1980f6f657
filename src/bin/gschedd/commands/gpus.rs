use anyhow::Result;
use gsched::core::gpu::{GpuTelemetry, NvmlTelemetry};
use gsched::utils::format_gpu_snapshot;

pub fn handle_gpus() -> Result<()> {
    let telemetry = NvmlTelemetry::init();
    if !telemetry.is_available() {
        anyhow::bail!("NVML is not available on this host");
    }
    println!("{}", format_gpu_snapshot(&telemetry.snapshot()).trim_end());
    Ok(())
}
