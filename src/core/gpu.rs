use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};

/// Point-in-time view of one physical GPU. Memory figures are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub id: u32,
    pub memory_total_bytes: u64,
    pub memory_free_bytes: u64,
    pub memory_used_bytes: u64,
    pub util_gpu_pct: u32,
    pub util_mem_pct: u32,
}

/// Source of live GPU state.
///
/// Implementations must return an empty list rather than fail when the
/// driver is unavailable.
#[cfg_attr(test, mockall::automock)]
pub trait GpuTelemetry: Send + Sync {
    fn snapshot(&self) -> Vec<GpuSnapshot>;
}

/// Telemetry backed by NVML
pub struct NvmlTelemetry {
    nvml: Option<Nvml>,
}

impl NvmlTelemetry {
    /// Initialize NVML, degrading to "no GPUs" when the driver is missing.
    pub fn init() -> Self {
        match Nvml::init() {
            Ok(nvml) => {
                let count = nvml.device_count().unwrap_or(0);
                tracing::info!("NVML initialized, {} GPU(s) detected", count);
                Self { nvml: Some(nvml) }
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to initialize NVML: {}. Running without GPU support.",
                    e
                );
                Self { nvml: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.nvml.is_some()
    }
}

impl GpuTelemetry for NvmlTelemetry {
    fn snapshot(&self) -> Vec<GpuSnapshot> {
        let Some(nvml) = &self.nvml else {
            return Vec::new();
        };

        let device_count = match nvml.device_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("NVML device_count failed: {}", e);
                return Vec::new();
            }
        };

        let mut gpus = Vec::with_capacity(device_count as usize);
        for i in 0..device_count {
            let device = match nvml.device_by_index(i) {
                Ok(device) => device,
                Err(e) => {
                    tracing::debug!("Skipping GPU {}: {}", i, e);
                    continue;
                }
            };
            let memory = match device.memory_info() {
                Ok(memory) => memory,
                Err(e) => {
                    tracing::debug!("Skipping GPU {}: memory query failed: {}", i, e);
                    continue;
                }
            };
            // Utilization is informational only
            let (util_gpu_pct, util_mem_pct) = device
                .utilization_rates()
                .map(|u| (u.gpu, u.memory))
                .unwrap_or((0, 0));

            gpus.push(GpuSnapshot {
                id: i,
                memory_total_bytes: memory.total,
                memory_free_bytes: memory.free,
                memory_used_bytes: memory.used,
                util_gpu_pct,
                util_mem_pct,
            });
        }
        gpus
    }
}
