pub const CHIPS_PER_BOARD: f64 = 48.0;
pub const CORES_PER_CHIP: f64 = 15.0;

/// Another board is added when the last requested board would be filled above 90%.
const SCALE_UP_THRESHOLD: f64 = 0.1;

const MS_PER_SECOND: f64 = 1000.0;

/// Requested size of a job; a non-positive value means "not specified".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRequest {
    pub cores: i64,
    pub chips: i64,
    pub boards: i64,
}

impl SizeRequest {
    pub fn is_unspecified(&self) -> bool {
        self.cores <= 0 && self.chips <= 0 && self.boards <= 0
    }
}

/// Result of sizing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineRequest {
    pub boards: u32,
    /// Number of cores that the job is accounted for.
    pub core_quota: i64,
}

fn board_count(boards: i64) -> crate::Result<u32> {
    u32::try_from(boards)
        .map_err(|_| crate::Error::InvalidRequest(format!("Cannot request {boards} boards")))
}

pub fn size_request(request: SizeRequest, default_boards: u32) -> crate::Result<MachineRequest> {
    if request.is_unspecified() {
        if default_boards == 0 {
            return Err(crate::Error::InvalidRequest(
                "No size was requested and there is no default".into(),
            ));
        }
        return Ok(MachineRequest {
            boards: default_boards,
            core_quota: (default_boards as f64 * CORES_PER_CHIP * CHIPS_PER_BOARD) as i64,
        });
    }

    if request.boards > 0 {
        return Ok(MachineRequest {
            boards: board_count(request.boards)?,
            core_quota: (request.boards as f64 * CORES_PER_CHIP * CHIPS_PER_BOARD) as i64,
        });
    }

    let core_quota = if request.chips > 0 {
        (request.chips as f64 * CORES_PER_CHIP) as i64
    } else {
        request.cores
    };

    // Derived from chips only, a request for cores always fits a single board
    let mut boards_exact = request.chips as f64 / CHIPS_PER_BOARD;
    if boards_exact.ceil() - boards_exact < SCALE_UP_THRESHOLD {
        boards_exact += 1.0;
    }
    let boards = boards_exact.max(1.0).ceil();
    Ok(MachineRequest {
        boards: board_count(boards as i64)?,
        core_quota,
    })
}

/// Core-seconds consumed by `core_quota` cores in `run_time_ms`.
pub fn resource_usage(core_quota: i64, run_time_ms: f64) -> crate::Result<i64> {
    if !run_time_ms.is_finite() || run_time_ms < 0.0 {
        return Err(crate::Error::InvalidRequest(format!(
            "Invalid run time {run_time_ms}"
        )));
    }
    Ok(((run_time_ms / MS_PER_SECOND) * core_quota as f64) as i64)
}
