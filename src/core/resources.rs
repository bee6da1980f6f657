//! GPU selection for a job's resource request.
//!
//! Everything here is pure over the snapshot it is handed; the scheduler is
//! responsible for querying telemetry and permissions.

use crate::core::gpu::GpuSnapshot;
use crate::core::job::Job;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Jobs state memory floors in megabytes, telemetry reports bytes.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// The single MB -> bytes conversion used wherever memory is compared.
#[inline]
pub const fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(BYTES_PER_MB)
}

#[inline]
pub const fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / BYTES_PER_MB
}

/// Parsed form of `Job::requested_gpus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRequest {
    /// `CPU` or `NONE`
    Cpu,
    /// `AUTO:<n>`, n >= 1
    Auto(usize),
    /// Literal comma-separated GPU ids
    Explicit(Vec<u32>),
}

impl FromStr for ResourceRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("CPU") || trimmed.eq_ignore_ascii_case("NONE") {
            return Ok(ResourceRequest::Cpu);
        }

        if let Some(count) = trimmed
            .get(..5)
            .filter(|p| p.eq_ignore_ascii_case("AUTO:"))
            .map(|_| &trimmed[5..])
        {
            let n = count
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid AUTO count in '{s}'"))?;
            if n == 0 {
                return Err(format!("AUTO needs at least one GPU in '{s}', use CPU instead"));
            }
            return Ok(ResourceRequest::Auto(n));
        }

        let mut ids = Vec::new();
        for token in trimmed.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let id = token
                .parse::<u32>()
                .map_err(|_| format!("invalid GPU id '{token}' in '{s}'"))?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Err(format!("empty GPU request '{s}'"));
        }
        Ok(ResourceRequest::Explicit(ids))
    }
}

/// Why an allocation attempt left a job pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    InvalidRequest(String),
    InsufficientGpus { requested: usize, eligible: usize },
    PermissionDenied(Vec<u32>),
    ResourcesUnavailable(Vec<u32>),
    ReservationBusy(Vec<u32>),
    /// The conditional PENDING -> RUNNING update matched no row
    StateChanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidRequest(msg) => write!(f, "invalid resource request: {msg}"),
            SkipReason::InsufficientGpus {
                requested,
                eligible,
            } => write!(f, "requested {requested} GPU(s), {eligible} eligible"),
            SkipReason::PermissionDenied(ids) => write!(f, "GPUs {ids:?} not visible to owner"),
            SkipReason::ResourcesUnavailable(ids) => {
                write!(f, "GPUs {ids:?} missing or below memory floor")
            }
            SkipReason::ReservationBusy(ids) => write!(f, "GPUs {ids:?} already reserved"),
            SkipReason::StateChanged => write!(f, "job is no longer pending"),
        }
    }
}

/// Pick GPUs for `job` from `snapshot`.
///
/// For explicit id lists this only parses; visibility is enforced by
/// [`check_visibility`].
pub fn select_gpus(
    job: &Job,
    snapshot: &[GpuSnapshot],
    is_admin: bool,
    visible: &BTreeSet<u32>,
) -> Result<Vec<u32>, SkipReason> {
    let request = job
        .requested_gpus
        .parse::<ResourceRequest>()
        .map_err(SkipReason::InvalidRequest)?;
    select_for_request(
        &request,
        job.gpu_memory_limit_mb,
        snapshot,
        is_admin,
        visible,
    )
}

pub fn select_for_request(
    request: &ResourceRequest,
    memory_floor_mb: Option<u64>,
    snapshot: &[GpuSnapshot],
    is_admin: bool,
    visible: &BTreeSet<u32>,
) -> Result<Vec<u32>, SkipReason> {
    match request {
        ResourceRequest::Cpu => Ok(Vec::new()),
        ResourceRequest::Explicit(ids) => Ok(ids.clone()),
        ResourceRequest::Auto(n) => {
            let floor = memory_floor_mb.map(mb_to_bytes).unwrap_or(0);
            let mut candidates: Vec<&GpuSnapshot> = snapshot
                .iter()
                .filter(|g| g.memory_free_bytes >= floor)
                .filter(|g| is_admin || visible.contains(&g.id))
                .collect();

            if candidates.len() < *n {
                return Err(SkipReason::InsufficientGpus {
                    requested: *n,
                    eligible: candidates.len(),
                });
            }

            candidates.sort_by(|a, b| {
                b.memory_free_bytes
                    .cmp(&a.memory_free_bytes)
                    .then(a.id.cmp(&b.id))
            });
            Ok(candidates.iter().take(*n).map(|g| g.id).collect())
        }
    }
}

/// Non-admins may only use GPUs from their visible set.
pub fn check_visibility(
    gpu_ids: &[u32],
    is_admin: bool,
    visible: &BTreeSet<u32>,
) -> Result<(), SkipReason> {
    if is_admin {
        return Ok(());
    }
    let denied: Vec<u32> = gpu_ids
        .iter()
        .copied()
        .filter(|id| !visible.contains(id))
        .collect();
    if denied.is_empty() {
        Ok(())
    } else {
        Err(SkipReason::PermissionDenied(denied))
    }
}

/// Every id must be present in a fresh snapshot with at least the floor free.
pub fn check_availability(
    gpu_ids: &[u32],
    memory_floor_mb: Option<u64>,
    snapshot: &[GpuSnapshot],
) -> Result<(), SkipReason> {
    let floor = memory_floor_mb.map(mb_to_bytes).unwrap_or(0);
    let unavailable: Vec<u32> = gpu_ids
        .iter()
        .copied()
        .filter(|id| {
            !snapshot
                .iter()
                .any(|g| g.id == *id && g.memory_free_bytes >= floor)
        })
        .collect();
    if unavailable.is_empty() {
        Ok(())
    } else {
        Err(SkipReason::ResourcesUnavailable(unavailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn gpus(frees: &[u64]) -> Vec<GpuSnapshot> {
        frees
            .iter()
            .enumerate()
            .map(|(i, &free)| GpuSnapshot {
                id: i as u32,
                memory_total_bytes: 16 * GIB,
                memory_free_bytes: free,
                memory_used_bytes: 16 * GIB - free.min(16 * GIB),
                ..Default::default()
            })
            .collect()
    }

    fn job(request: &str, floor_mb: Option<u64>) -> Job {
        Job::builder()
            .requested_gpus(request)
            .gpu_memory_limit_mb(floor_mb)
            .build()
    }

    fn visible(ids: &[u32]) -> BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!("CPU".parse::<ResourceRequest>(), Ok(ResourceRequest::Cpu));
        assert_eq!(" none ".parse::<ResourceRequest>(), Ok(ResourceRequest::Cpu));
        assert_eq!("AUTO:2".parse::<ResourceRequest>(), Ok(ResourceRequest::Auto(2)));
        assert_eq!("auto: 1".parse::<ResourceRequest>(), Ok(ResourceRequest::Auto(1)));
        assert_eq!("0,2".parse::<ResourceRequest>(), Ok(ResourceRequest::Explicit(vec![0, 2])));
        assert_eq!("1,,3,".parse::<ResourceRequest>(), Ok(ResourceRequest::Explicit(vec![1, 3])));
        assert_eq!("2,2".parse::<ResourceRequest>(), Ok(ResourceRequest::Explicit(vec![2])));
    }

    #[test]
    fn test_parse_invalid_requests() {
        assert!("AUTO:x".parse::<ResourceRequest>().is_err());
        assert!("AUTO:-1".parse::<ResourceRequest>().is_err());
        assert!("AUTO:0".parse::<ResourceRequest>().is_err());
        assert!("0,gpu1".parse::<ResourceRequest>().is_err());
        assert!("".parse::<ResourceRequest>().is_err());
        assert!(",".parse::<ResourceRequest>().is_err());
    }

    #[test]
    fn test_invalid_request_is_skip_not_panic() {
        let result = select_gpus(&job("lots", None), &gpus(&[GIB]), true, &visible(&[]));
        assert!(matches!(result, Err(SkipReason::InvalidRequest(_))));
    }

    #[test]
    fn test_cpu_ignores_telemetry() {
        assert_eq!(
            select_gpus(&job("CPU", Some(1_000_000)), &[], false, &visible(&[])),
            Ok(vec![])
        );
        assert_eq!(
            select_gpus(&job("NONE", None), &gpus(&[GIB]), false, &visible(&[])),
            Ok(vec![])
        );
    }

    #[test]
    fn test_auto_picks_most_free() {
        let snapshot = gpus(&[8 * GIB, 2 * GIB]);
        assert_eq!(
            select_gpus(&job("AUTO:1", None), &snapshot, true, &visible(&[])),
            Ok(vec![0])
        );
    }

    #[test]
    fn test_auto_ties_broken_by_id() {
        let snapshot = gpus(&[4 * GIB, 6 * GIB, 6 * GIB, 6 * GIB]);
        assert_eq!(
            select_gpus(&job("AUTO:2", None), &snapshot, true, &visible(&[])),
            Ok(vec![1, 2])
        );
    }

    #[test]
    fn test_auto_insufficient_after_floor() {
        // Only GPU 0 has >= 4000 MB free
        let snapshot = gpus(&[5 * GIB, GIB]);
        assert_eq!(
            select_gpus(&job("AUTO:2", Some(4000)), &snapshot, true, &visible(&[])),
            Err(SkipReason::InsufficientGpus {
                requested: 2,
                eligible: 1
            })
        );
    }

    #[test]
    fn test_auto_respects_visibility_for_non_admin() {
        let snapshot = gpus(&[2 * GIB, 8 * GIB, 4 * GIB]);
        assert_eq!(
            select_gpus(&job("AUTO:1", None), &snapshot, false, &visible(&[0, 2])),
            Ok(vec![2])
        );
        assert!(select_gpus(&job("AUTO:3", None), &snapshot, false, &visible(&[0, 2])).is_err());
    }

    #[test]
    fn test_explicit_selection_does_not_check_permissions() {
        assert_eq!(
            select_gpus(&job("1", None), &[], false, &visible(&[0])),
            Ok(vec![1])
        );
    }

    #[test]
    fn test_visibility_check() {
        assert_eq!(check_visibility(&[0], false, &visible(&[0])), Ok(()));
        assert_eq!(
            check_visibility(&[0, 1], false, &visible(&[0])),
            Err(SkipReason::PermissionDenied(vec![1]))
        );
        assert_eq!(check_visibility(&[5], true, &visible(&[])), Ok(()));
    }

    #[test]
    fn test_availability_unit_conversion() {
        // 4 GiB = 4096 MiB < 8000 MB
        let snapshot = gpus(&[4 * GIB, 2 * GIB]);
        assert_eq!(
            check_availability(&[0], Some(8000), &snapshot),
            Err(SkipReason::ResourcesUnavailable(vec![0]))
        );
        assert_eq!(check_availability(&[0], Some(4096), &snapshot), Ok(()));
    }

    #[test]
    fn test_availability_missing_device_fails_closed() {
        let snapshot = gpus(&[4 * GIB]);
        assert_eq!(
            check_availability(&[99], Some(100), &snapshot),
            Err(SkipReason::ResourcesUnavailable(vec![99]))
        );
        assert_eq!(
            check_availability(&[0], None, &[]),
            Err(SkipReason::ResourcesUnavailable(vec![0]))
        );
    }

    #[test]
    fn test_availability_empty_request_passes() {
        assert_eq!(check_availability(&[], Some(8000), &[]), Ok(()));
    }

    proptest! {
        #[test]
        fn prop_mb_bytes_round_trip(mb in 0u64..(u64::MAX / BYTES_PER_MB)) {
            prop_assert_eq!(bytes_to_mb(mb_to_bytes(mb)), mb);
            prop_assert_eq!(mb_to_bytes(mb) % BYTES_PER_MB, 0);
        }

        #[test]
        fn prop_auto_selection_is_deterministic_best_fit(
            frees in proptest::collection::vec(0u64..(32 * GIB), 1..12),
            n in 1usize..6,
        ) {
            let snapshot = gpus(&frees);
            let job = job(&format!("AUTO:{n}"), None);
            let first = select_gpus(&job, &snapshot, true, &BTreeSet::new());

            let mut reversed = snapshot.clone();
            reversed.reverse();
            let second = select_gpus(&job, &reversed, true, &BTreeSet::new());
            prop_assert_eq!(&first, &second);

            if let Ok(chosen) = first {
                prop_assert_eq!(chosen.len(), n);
                let min_chosen = chosen
                    .iter()
                    .map(|id| frees[*id as usize])
                    .min()
                    .unwrap();
                for (id, free) in frees.iter().enumerate() {
                    if !chosen.contains(&(id as u32)) {
                        prop_assert!(*free <= min_chosen);
                    }
                }
            } else {
                prop_assert!(frees.len() < n);
            }
        }
    }
}
