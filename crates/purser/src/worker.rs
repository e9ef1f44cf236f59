//! Worker runtime: subscribes to task queues, resolves the owning record
//! for each job, enforces the running → idle/error state machine, and chains
//! configured follow-on jobs after a passing verdict.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::broker::{BrokerClient, Job, WorkerSession};
use crate::config::PurserConfig;
use crate::types::{
    CollectionSystemTransfer, CruiseDataTransfer, JobReport, PartResult, TaskRecord,
};

/// Cooperative stop/quit flags, flipped by the signal handlers.
///
/// SIGQUIT aborts the current job; SIGINT additionally unsubscribes and
/// exits the worker.
#[derive(Debug, Clone)]
pub struct Signals {
    pub stop: Arc<AtomicBool>,
    pub quit: Arc<AtomicBool>,
}

impl Signals {
    /// Wire the process signal handlers.
    pub fn install() -> Result<Self> {
        let signals = Self::manual();
        signal_hook::flag::register(signal_hook::consts::SIGQUIT, signals.stop.clone())
            .context("failed to register SIGQUIT handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, signals.stop.clone())
            .context("failed to register SIGINT handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, signals.quit.clone())
            .context("failed to register SIGINT handler")?;
        Ok(signals)
    }

    /// Unwired flags, for embedding and tests.
    pub fn manual() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            quit: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// How the runtime locates the record owning a job's status.
pub enum OwnerSpec {
    /// Synthetic (name, long name) table first, control-plane task second.
    Task(&'static [(&'static str, &'static str)]),
    /// Collection system transfer referenced by the payload.
    CstFromPayload { test: bool },
    /// Cruise data transfer referenced by the payload.
    CdtFromPayload { test: bool },
    /// Required cruise data transfer with a fixed name (ship-to-shore).
    CdtRequiredByName(&'static str),
    /// No owning record (stopJob).
    Untracked,
}

/// The resolved owner of a running job.
#[derive(Debug, Clone)]
pub enum Owner {
    SyntheticTask(TaskRecord),
    PersistentTask(TaskRecord),
    Cst {
        transfer: Box<CollectionSystemTransfer>,
        test: bool,
    },
    Cdt {
        transfer: Box<CruiseDataTransfer>,
        test: bool,
    },
    Untracked,
}

impl Owner {
    pub fn display_name(&self) -> &str {
        match self {
            Self::SyntheticTask(task) | Self::PersistentTask(task) => &task.long_name,
            Self::Cst { transfer, .. } => &transfer.name,
            Self::Cdt { transfer, .. } => &transfer.name,
            Self::Untracked => "untracked",
        }
    }
}

/// Merge payload-supplied field overrides into a record's JSON form.
pub fn merge_overrides<T: serde::Serialize + DeserializeOwned>(
    record: T,
    overrides: &serde_json::Map<String, Value>,
) -> Result<T> {
    let mut value = serde_json::to_value(record).context("failed to serialize record")?;
    if let Some(obj) = value.as_object_mut() {
        for (key, val) in overrides {
            obj.insert(key.clone(), val.clone());
        }
    }
    serde_json::from_value(value).context("failed to apply payload overrides")
}

/// Everything a handler needs while running one job.
pub struct JobContext<'a> {
    pub api: &'a ApiClient,
    pub config: &'a PurserConfig,
    pub cancel: &'a AtomicBool,
    pub job: &'a Job,
    pub owner: &'a Owner,
    session: &'a RefCell<&'a mut WorkerSession>,
}

impl JobContext<'_> {
    /// Decode the job payload into a typed value.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.job.payload).context("failed to parse job payload")
    }

    /// Report `numerator/denominator` progress to the broker.
    pub fn send_status(&self, numerator: u64, denominator: u64) {
        if let Err(err) = self
            .session
            .borrow_mut()
            .send_status(&self.job.handle, numerator, denominator)
        {
            warn!("failed to send job status: {err:#}");
        }
    }

    /// Map a step's 0..100 percent into the `lo..hi` slice of the job.
    pub fn send_percent_in_range(&self, lo: u64, hi: u64, percent: u8) {
        let scaled = lo + (hi - lo) * u64::from(percent.min(100)) / 100;
        self.send_status(scaled, 100);
    }

    /// Fresh submit-side connection to the broker.
    pub fn broker_client(&self) -> Result<BrokerClient> {
        BrokerClient::connect(&self.config.broker)
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cst(&self) -> Option<&CollectionSystemTransfer> {
        match self.owner {
            Owner::Cst { transfer, .. } => Some(transfer),
            _ => None,
        }
    }

    pub fn cdt(&self) -> Option<&CruiseDataTransfer> {
        match self.owner {
            Owner::Cdt { transfer, .. } => Some(transfer),
            _ => None,
        }
    }

    pub fn task(&self) -> Option<&TaskRecord> {
        match self.owner {
            Owner::SyntheticTask(task) | Owner::PersistentTask(task) => Some(task),
            _ => None,
        }
    }
}

type HandlerFn = Box<dyn Fn(&JobContext) -> Result<JobReport>>;
type HookPayloadFn = Box<dyn Fn(&JobContext, &JobReport) -> Option<Value>>;

/// One queue registration: handler, owner resolution, hook wiring.
pub struct TaskRegistration {
    pub name: &'static str,
    pub owner: OwnerSpec,
    pub handler: HandlerFn,
    /// Builds the payload for follow-on hook jobs after a Pass; `None`
    /// return suppresses the hooks for this job.
    pub hook_payload: Option<HookPayloadFn>,
}

impl TaskRegistration {
    pub fn new(
        name: &'static str,
        owner: OwnerSpec,
        handler: impl Fn(&JobContext) -> Result<JobReport> + 'static,
    ) -> Self {
        Self {
            name,
            owner,
            handler: Box::new(handler),
            hook_payload: None,
        }
    }

    pub fn with_hook_payload(
        mut self,
        build: impl Fn(&JobContext, &JobReport) -> Option<Value> + 'static,
    ) -> Self {
        self.hook_payload = Some(Box::new(build));
        self
    }
}

/// Default hook payload: current cruise and lowering ids.
pub fn default_hook_payload(ctx: &JobContext, _report: &JobReport) -> Option<Value> {
    let payload: crate::types::ScopeJobPayload = ctx.payload().unwrap_or_default();
    let cruise_id = payload
        .cruise_id
        .or_else(|| ctx.api.cruise_id().ok().flatten());
    let lowering_id = payload
        .lowering_id
        .or_else(|| ctx.api.lowering_id().ok().flatten());
    Some(json!({ "cruiseID": cruise_id, "loweringID": lowering_id }))
}

/// A worker process: one broker subscription plus its task registrations.
pub struct WorkerRuntime {
    config: PurserConfig,
    api: ApiClient,
    session: WorkerSession,
    signals: Signals,
    registrations: Vec<TaskRegistration>,
}

impl WorkerRuntime {
    pub fn new(config: PurserConfig, client_id: &str, signals: Signals) -> Result<Self> {
        let api = ApiClient::new(&config.site_root)?;
        let session = WorkerSession::connect(&config.broker, client_id)?;
        Ok(Self {
            config,
            api,
            session,
            signals,
            registrations: Vec::new(),
        })
    }

    pub fn register(&mut self, registration: TaskRegistration) -> Result<()> {
        info!("registering task: {}", registration.name);
        self.session.register(registration.name)?;
        self.registrations.push(registration);
        Ok(())
    }

    /// Main loop: pull jobs until the quit flag is raised.
    pub fn work(&mut self) -> Result<()> {
        info!("waiting for jobs...");
        loop {
            let Some(job) = self.session.next_job(&self.signals.quit)? else {
                info!("quitting worker...");
                return Ok(());
            };
            self.run_job(&job);
        }
    }

    fn resolve_owner(&self, spec: &OwnerSpec, job: &Job) -> Result<Owner, JobReport> {
        match spec {
            OwnerSpec::Task(synthetic) => {
                if let Some((_, long_name)) =
                    synthetic.iter().find(|(name, _)| *name == job.function)
                {
                    return Ok(Owner::SyntheticTask(TaskRecord::synthetic(
                        &job.function,
                        long_name,
                    )));
                }
                match self.api.task_by_name(&job.function) {
                    Ok(Some(task)) => Ok(Owner::PersistentTask(task)),
                    Ok(None) => Err(JobReport::failed("Retrieve task", "Task not found")),
                    Err(err) => Err(JobReport::failed("Retrieve task", format!("{err:#}"))),
                }
            }

            OwnerSpec::CstFromPayload { test } => {
                let payload: crate::types::CstJobPayload =
                    serde_json::from_str(&job.payload).unwrap_or_default();
                let Some(reference) = payload.collection_system_transfer else {
                    return Err(JobReport::failed(
                        "Retrieve collection system transfer",
                        "Payload names no collection system transfer",
                    ));
                };
                match self.api.collection_system_transfer(&reference.id) {
                    Ok(Some(transfer)) => {
                        let transfer = merge_overrides(transfer, &reference.overrides)
                            .map_err(|err| {
                                JobReport::failed(
                                    "Retrieve collection system transfer",
                                    format!("{err:#}"),
                                )
                            })?;
                        Ok(Owner::Cst {
                            transfer: Box::new(transfer),
                            test: *test,
                        })
                    }
                    Ok(None) => Err(JobReport::failed(
                        "Retrieve collection system transfer",
                        "Could not retrieve collection system transfer for transferring files",
                    )),
                    Err(err) => Err(JobReport::failed(
                        "Retrieve collection system transfer",
                        format!("{err:#}"),
                    )),
                }
            }

            OwnerSpec::CdtFromPayload { test } => {
                let payload: crate::types::CdtJobPayload =
                    serde_json::from_str(&job.payload).unwrap_or_default();
                let Some(reference) = payload.cruise_data_transfer else {
                    return Err(JobReport::failed(
                        "Retrieve cruise data transfer",
                        "Payload names no cruise data transfer",
                    ));
                };
                match self.api.cruise_data_transfer(&reference.id) {
                    Ok(Some(transfer)) => {
                        let transfer =
                            merge_overrides(transfer, &reference.overrides).map_err(|err| {
                                JobReport::failed(
                                    "Retrieve cruise data transfer",
                                    format!("{err:#}"),
                                )
                            })?;
                        Ok(Owner::Cdt {
                            transfer: Box::new(transfer),
                            test: *test,
                        })
                    }
                    Ok(None) => Err(JobReport::failed(
                        "Retrieve cruise data transfer",
                        "Could not retrieve data for cruise data transfer",
                    )),
                    Err(err) => Err(JobReport::failed(
                        "Retrieve cruise data transfer",
                        format!("{err:#}"),
                    )),
                }
            }

            OwnerSpec::CdtRequiredByName(name) => {
                let payload: crate::types::CdtJobPayload =
                    serde_json::from_str(&job.payload).unwrap_or_default();
                match self.api.required_cruise_data_transfer_by_name(name) {
                    Ok(Some(transfer)) => {
                        let overrides = payload
                            .cruise_data_transfer
                            .map(|r| r.overrides)
                            .unwrap_or_default();
                        let transfer = merge_overrides(transfer, &overrides).map_err(|err| {
                            JobReport::failed(
                                "Located Cruise Data Transfer Data",
                                format!("{err:#}"),
                            )
                        })?;
                        Ok(Owner::Cdt {
                            transfer: Box::new(transfer),
                            test: false,
                        })
                    }
                    Ok(None) => Err(JobReport::failed(
                        "Located Cruise Data Transfer Data",
                        "Could not find configuration data for cruise data transfer",
                    )),
                    Err(err) => Err(JobReport::failed(
                        "Located Cruise Data Transfer Data",
                        format!("{err:#}"),
                    )),
                }
            }

            OwnerSpec::Untracked => Ok(Owner::Untracked),
        }
    }

    /// Ignore-verdict guards evaluated before any state transition: a
    /// transfer already running, a disabled transfer, or a system switched
    /// off never reaches setRunning.
    fn pre_run_guard(&self, owner: &Owner, job: &Job) -> Option<JobReport> {
        let (status, enabled) = match owner {
            Owner::Cst { transfer, test: false } => (transfer.status(), transfer.enabled()),
            Owner::Cdt { transfer, test: false } => (transfer.status(), transfer.enabled()),
            _ => return None,
        };

        if status == Some(crate::types::RecordStatus::Running) {
            info!("transfer already in-progress");
            return Some(JobReport::ignored(
                "Transfer In-Progress",
                "Transfer is already in-progress",
            ));
        }

        let payload: crate::types::CstJobPayload =
            serde_json::from_str(&job.payload).unwrap_or_default();
        let system_status = payload
            .system_status
            .or_else(|| self.api.system_status().ok())
            .unwrap_or_default();

        if system_status == "Off" || !enabled {
            info!("transfer disabled");
            return Some(JobReport::ignored("Transfer Enabled", "Transfer is disabled"));
        }

        None
    }

    fn set_running(&self, owner: &Owner, job: &Job) -> Result<()> {
        let pid = std::process::id();
        match owner {
            Owner::PersistentTask(task) => self.api.set_running_task(&task.task_id, pid, &job.handle),
            Owner::SyntheticTask(task) => self.api.track_job(&task.long_name, pid, &job.handle),
            Owner::Cst { transfer, test: false } => {
                self.api
                    .set_running_collection_system_transfer(&transfer.id, pid, &job.handle)
            }
            Owner::Cst { transfer, test: true } => self
                .api
                .set_running_collection_system_transfer_test(&transfer.id, pid, &job.handle),
            Owner::Cdt { transfer, test: false } => {
                self.api
                    .set_running_cruise_data_transfer(&transfer.id, pid, &job.handle)
            }
            Owner::Cdt { transfer, test: true } => self
                .api
                .set_running_cruise_data_transfer_test(&transfer.id, pid, &job.handle),
            Owner::Untracked => Ok(()),
        }
    }

    /// Translate the final verdict into the owner's state transition.
    fn settle_owner(&self, owner: &Owner, report: &JobReport) {
        let verdict = report.final_verdict();
        let result = verdict.map(|p| p.result);
        let reason = verdict
            .and_then(|p| p.reason.clone())
            .unwrap_or_else(|| "undefined".to_string());

        let outcome = match (owner, result) {
            (_, None) | (Owner::Untracked, _) => Ok(()),

            (Owner::PersistentTask(task), Some(PartResult::Fail)) => {
                self.api.set_error_task(&task.task_id, &reason)
            }
            (Owner::PersistentTask(task), Some(PartResult::Pass)) => {
                self.api.set_idle_task(&task.task_id)
            }
            (Owner::SyntheticTask(task), Some(PartResult::Fail)) => self
                .api
                .send_msg(&format!("{} failed", task.long_name), &reason),

            (Owner::Cst { transfer, test: false }, Some(PartResult::Fail)) => {
                self.api.set_error_collection_system_transfer(&transfer.id, &reason)
            }
            (Owner::Cst { transfer, test: true }, Some(PartResult::Fail)) => self
                .api
                .set_error_collection_system_transfer_test(&transfer.id, &reason),
            (Owner::Cst { transfer, .. }, Some(PartResult::Pass)) => {
                self.api.set_idle_collection_system_transfer(&transfer.id)
            }

            (Owner::Cdt { transfer, test: false }, Some(PartResult::Fail)) => {
                self.api.set_error_cruise_data_transfer(&transfer.id, &reason)
            }
            (Owner::Cdt { transfer, test: true }, Some(PartResult::Fail)) => self
                .api
                .set_error_cruise_data_transfer_test(&transfer.id, &reason),
            (Owner::Cdt { transfer, .. }, Some(PartResult::Pass)) => {
                self.api.set_idle_cruise_data_transfer(&transfer.id)
            }

            // Ignore verdicts leave the record untouched.
            (_, Some(PartResult::Ignore)) => Ok(()),
            (Owner::SyntheticTask(_), Some(PartResult::Pass)) => Ok(()),
        };

        if let Err(err) = outcome {
            error!("failed to settle owner state: {err:#}");
        }
    }

    fn run_job(&mut self, job: &Job) {
        self.signals.stop.store(false, Ordering::SeqCst);

        debug!("payload: {}", job.payload);

        let Some(reg_idx) = self.registrations.iter().position(|r| r.name == job.function)
        else {
            warn!("received job for unregistered task {}", job.function);
            let _ = self.session.send_fail(&job.handle);
            return;
        };

        // Payload must at least be JSON.
        if serde_json::from_str::<Value>(&job.payload).is_err() {
            let report = JobReport::failed("Retrieve job data", "Failed to parse current job payload");
            let _ = self.session.send_complete(&job.handle, &report.to_json());
            return;
        }

        let owner = match self.resolve_owner(&self.registrations[reg_idx].owner, job) {
            Ok(owner) => owner,
            Err(report) => {
                let _ = self.session.send_complete(&job.handle, &report.to_json());
                return;
            }
        };

        let span = tracing::info_span!("job", task = %owner.display_name());
        let _guard = span.enter();
        info!("job started: {}", job.handle);

        if let Some(report) = self.pre_run_guard(&owner, job) {
            let _ = self.session.send_complete(&job.handle, &report.to_json());
            return;
        }

        if let Err(err) = self.set_running(&owner, job) {
            error!("failed to mark job running: {err:#}");
            let report = JobReport::failed("Set running", format!("{err:#}"));
            self.settle_owner(&owner, &report);
            let _ = self.session.send_complete(&job.handle, &report.to_json());
            return;
        }

        // Split borrows: the handler needs the session for progress while the
        // registration list stays immutable.
        let report = {
            let session_cell = RefCell::new(&mut self.session);
            let ctx = JobContext {
                api: &self.api,
                config: &self.config,
                cancel: &self.signals.stop,
                job,
                owner: &owner,
                session: &session_cell,
            };

            match (self.registrations[reg_idx].handler)(&ctx) {
                Ok(report) => report,
                Err(err) => {
                    // Crash path: report, set error, and complete the job so
                    // the broker does not redispatch it.
                    error!("job failed: {} ({err:#})", job.handle);
                    let report =
                        JobReport::failed("Worker crashed", format!("Worker crashed: {err:#}"));
                    let _ = ctx
                        .session
                        .borrow_mut()
                        .send_data(&job.handle, &report.to_json());
                    report
                }
            }
        };

        self.settle_owner(&owner, &report);

        // Hooks are submitted after the owner settles, with a snapshot of
        // this job's result.
        if report.final_verdict().map(|p| p.result) == Some(PartResult::Pass) {
            let hook_tasks = self.config.tasks_for_hook(job.function.as_str()).to_vec();
            if !hook_tasks.is_empty() {
                let session_cell = RefCell::new(&mut self.session);
                let ctx = JobContext {
                    api: &self.api,
                    config: &self.config,
                    cancel: &self.signals.stop,
                    job,
                    owner: &owner,
                    session: &session_cell,
                };
                let payload = match &self.registrations[reg_idx].hook_payload {
                    Some(build) => build(&ctx, &report),
                    None => default_hook_payload(&ctx, &report),
                };
                match payload {
                    Some(payload) => {
                        let payload = payload.to_string();
                        match BrokerClient::connect(&self.config.broker) {
                            Ok(mut client) => {
                                for task in &hook_tasks {
                                    info!("adding post task: {task}");
                                    if let Err(err) = client.submit_background(task, &payload) {
                                        error!("failed to submit post task {task}: {err:#}");
                                    }
                                }
                            }
                            Err(err) => error!("cannot submit post tasks: {err:#}"),
                        }
                    }
                    None => debug!("hook payload builder suppressed follow-on jobs"),
                }
            }
        }

        info!("job completed: {}", job.handle);
        if let Err(err) = self.session.send_complete(&job.handle, &report.to_json()) {
            error!("failed to report job completion: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_signals_start_clear() {
        let signals = Signals::manual();
        assert!(!signals.stop.load(Ordering::SeqCst));
        assert!(!signals.quit.load(Ordering::SeqCst));
    }

    #[test]
    fn merge_overrides_replaces_fields() {
        let cst = CollectionSystemTransfer {
            id: "3".into(),
            name: "SCS".into(),
            enable: "1".into(),
            ..CollectionSystemTransfer::default()
        };
        let mut overrides = serde_json::Map::new();
        overrides.insert("enable".to_string(), Value::String("0".to_string()));

        let merged = merge_overrides(cst, &overrides).unwrap();
        assert_eq!(merged.enable, "0");
        assert_eq!(merged.name, "SCS");
    }

    #[test]
    fn owner_display_names() {
        let task = TaskRecord::synthetic("updateMD5Summary", "Updating MD5 Summary");
        assert_eq!(Owner::SyntheticTask(task).display_name(), "Updating MD5 Summary");

        let cst = CollectionSystemTransfer {
            name: "EM124".into(),
            ..CollectionSystemTransfer::default()
        };
        let owner = Owner::Cst { transfer: Box::new(cst), test: false };
        assert_eq!(owner.display_name(), "EM124");
    }
}
