//! Manual termination of a running transfer or task: locate the record
//! owning the pid, signal the worker, and return the record to idle.

use anyhow::Result;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::types::{JobReport, StopJobPayload};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

pub const STOP_TASK: &str = "stopJob";

pub fn registrations() -> Vec<TaskRegistration> {
    vec![TaskRegistration::new(STOP_TASK, OwnerSpec::Untracked, stop_job)]
}

/// The record a running pid belongs to.
#[derive(Debug, PartialEq, Eq)]
enum JobInfo {
    CollectionSystemTransfer { id: String, name: String },
    CruiseDataTransfer { id: String, name: String },
    Task { id: String, name: String },
    Unknown,
}

fn find_job_info(ctx: &JobContext, pid: &str) -> Result<JobInfo> {
    for transfer in ctx.api.collection_system_transfers()? {
        if transfer.pid == pid && transfer.pid != "0" {
            return Ok(JobInfo::CollectionSystemTransfer {
                id: transfer.id,
                name: transfer.name,
            });
        }
    }

    let mut cdts = ctx.api.cruise_data_transfers()?;
    cdts.extend(ctx.api.required_cruise_data_transfers()?);
    for transfer in cdts {
        if transfer.pid == pid && transfer.pid != "0" {
            return Ok(JobInfo::CruiseDataTransfer {
                id: transfer.id,
                name: transfer.name,
            });
        }
    }

    for task in ctx.api.tasks()? {
        if task.pid == pid && task.pid != "0" {
            return Ok(JobInfo::Task {
                id: task.task_id,
                name: task.name,
            });
        }
    }

    Ok(JobInfo::Unknown)
}

fn stop_job(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();

    let payload: StopJobPayload = ctx.payload()?;
    let Some(pid) = payload.pid.filter(|pid| !pid.is_empty()) else {
        report.fail("Retrieve Job Info", "No pid in job payload");
        return Ok(report);
    };

    info!("killing pid: {pid}");
    let job_info = find_job_info(ctx, &pid)?;
    report.pass("Retrieve Job Info");

    if job_info == JobInfo::Unknown {
        let reason = format!("Unknown job with pid: {pid}");
        warn!("{reason}");
        report.fail("Verify Job", reason);
        return Ok(report);
    }
    report.pass("Verify Job");

    match pid.parse::<i32>() {
        Ok(raw_pid) => match kill(Pid::from_raw(raw_pid), Signal::SIGQUIT) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => {
                warn!("process does not exist: PID {pid}");
            }
            Err(err) => {
                let reason = format!("Error killing PID: {pid} --> {err}");
                warn!("{reason}");
                report.fail("Stopped Job", reason);
                return Ok(report);
            }
        },
        Err(_) => {
            warn!("unparseable pid: {pid}");
        }
    }

    // Return the record to idle and tell the operators.
    match &job_info {
        JobInfo::CollectionSystemTransfer { id, name } => {
            ctx.api.set_idle_collection_system_transfer(id)?;
            ctx.api.send_msg("Manual Stop of transfer", name)?;
        }
        JobInfo::CruiseDataTransfer { id, name } => {
            ctx.api.set_idle_cruise_data_transfer(id)?;
            ctx.api.send_msg("Manual Stop of transfer", name)?;
        }
        JobInfo::Task { id, name } => {
            ctx.api.set_idle_task(id)?;
            ctx.api.send_msg("Manual Stop of task", name)?;
        }
        JobInfo::Unknown => {}
    }

    report.pass("Stopped Job");
    Ok(report)
}
