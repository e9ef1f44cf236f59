//! Domain types: transfer records, task records, job reports, payloads.
//!
//! The control-plane API speaks PHP-flavored JSON: identifiers and flags are
//! strings (`"1"`, `"0"`, `"On"`, `"Off"`), including numeric ids. The structs
//! here keep the wire shape verbatim and expose typed accessors; decoding a
//! flag in one place keeps the string-valued semantics from leaking into
//! handler logic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport used by a transfer record, decoded from the API's `"1".."4"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Directory reachable from the warehouse filesystem.
    Local,
    /// Rsync daemon (`rsync://`).
    Rsync,
    /// SMB/CIFS share, mounted for the duration of the job.
    Smb,
    /// SSH host, driven through `rsync -e ssh`.
    Ssh,
}

impl TransferKind {
    pub fn from_api(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Self::Local),
            "2" => Some(Self::Rsync),
            "3" => Some(Self::Smb),
            "4" => Some(Self::Ssh),
            _ => None,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Rsync => "rsync",
            Self::Smb => "smb",
            Self::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

/// Record status shared by transfers and tasks, decoded from `"1".."4"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Running,
    Idle,
    Error,
    Unused,
}

impl RecordStatus {
    pub fn from_api(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Self::Running),
            "2" => Some(Self::Idle),
            "3" => Some(Self::Error),
            "4" => Some(Self::Unused),
            _ => None,
        }
    }
}

fn flag(s: &str) -> bool {
    s == "1"
}

/// Inbound pipeline from one acquisition source into the cruise tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSystemTransfer {
    #[serde(rename = "collectionSystemTransferID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "longName")]
    pub long_name: String,
    pub status: String,
    pub enable: String,
    #[serde(rename = "transferType")]
    pub transfer_type: String,
    #[serde(rename = "sourceDir")]
    pub source_dir: String,
    #[serde(rename = "destDir")]
    pub dest_dir: String,
    #[serde(rename = "cruiseOrLowering")]
    pub cruise_or_lowering: String,
    #[serde(rename = "syncFromSource")]
    pub sync_from_source: String,
    pub staleness: String,
    #[serde(rename = "bandwidthLimit")]
    pub bandwidth_limit: String,
    #[serde(rename = "removeSourceFiles")]
    pub remove_source_files: String,
    #[serde(rename = "skipEmptyFiles")]
    pub skip_empty_files: String,
    #[serde(rename = "skipEmptyDirs")]
    pub skip_empty_dirs: String,
    #[serde(rename = "useStartDate")]
    pub use_start_date: String,
    #[serde(rename = "includeFilter")]
    pub include_filter: String,
    #[serde(rename = "excludeFilter")]
    pub exclude_filter: String,
    #[serde(rename = "ignoreFilter")]
    pub ignore_filter: String,
    #[serde(rename = "localDirIsMountPoint")]
    pub local_dir_is_mount_point: String,
    #[serde(rename = "smbServer")]
    pub smb_server: String,
    #[serde(rename = "smbUser")]
    pub smb_user: String,
    #[serde(rename = "smbPass")]
    pub smb_pass: String,
    #[serde(rename = "smbDomain")]
    pub smb_domain: String,
    #[serde(rename = "rsyncServer")]
    pub rsync_server: String,
    #[serde(rename = "rsyncUser")]
    pub rsync_user: String,
    #[serde(rename = "rsyncPass")]
    pub rsync_pass: String,
    #[serde(rename = "sshServer")]
    pub ssh_server: String,
    #[serde(rename = "sshUser")]
    pub ssh_user: String,
    #[serde(rename = "sshPass")]
    pub ssh_pass: String,
    #[serde(rename = "sshUseKey")]
    pub ssh_use_key: String,
    pub pid: String,
}

impl CollectionSystemTransfer {
    pub fn kind(&self) -> Option<TransferKind> {
        TransferKind::from_api(&self.transfer_type)
    }

    pub fn status(&self) -> Option<RecordStatus> {
        RecordStatus::from_api(&self.status)
    }

    pub fn enabled(&self) -> bool {
        flag(&self.enable)
    }

    pub fn lowering_scoped(&self) -> bool {
        flag(&self.cruise_or_lowering)
    }

    pub fn sync_from_source(&self) -> bool {
        flag(&self.sync_from_source)
    }

    pub fn remove_source_files(&self) -> bool {
        flag(&self.remove_source_files)
    }

    pub fn skip_empty_files(&self) -> bool {
        flag(&self.skip_empty_files)
    }

    pub fn skip_empty_dirs(&self) -> bool {
        flag(&self.skip_empty_dirs)
    }

    pub fn use_start_date(&self) -> bool {
        flag(&self.use_start_date)
    }

    pub fn local_dir_is_mount_point(&self) -> bool {
        flag(&self.local_dir_is_mount_point)
    }

    pub fn ssh_use_key(&self) -> bool {
        flag(&self.ssh_use_key)
    }

    /// Staleness window in seconds; `0` disables the re-check.
    pub fn staleness_secs(&self) -> u64 {
        self.staleness.parse().unwrap_or(0)
    }

    /// Bandwidth cap in kB/s; `0` means unlimited.
    pub fn bandwidth_limit_kbps(&self) -> u64 {
        self.bandwidth_limit.parse().unwrap_or(0)
    }
}

/// Outbound pipeline from the assembled cruise tree to an external
/// destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CruiseDataTransfer {
    #[serde(rename = "cruiseDataTransferID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "longName")]
    pub long_name: String,
    pub status: String,
    pub enable: String,
    pub required: String,
    #[serde(rename = "transferType")]
    pub transfer_type: String,
    #[serde(rename = "destDir")]
    pub dest_dir: String,
    #[serde(rename = "syncToDest")]
    pub sync_to_dest: String,
    #[serde(rename = "bandwidthLimit")]
    pub bandwidth_limit: String,
    #[serde(rename = "skipEmptyFiles")]
    pub skip_empty_files: String,
    #[serde(rename = "skipEmptyDirs")]
    pub skip_empty_dirs: String,
    #[serde(rename = "includeOVDMFiles")]
    pub include_ovdm_files: String,
    #[serde(rename = "excludedCollectionSystems")]
    pub excluded_collection_systems: String,
    #[serde(rename = "excludedExtraDirectories")]
    pub excluded_extra_directories: String,
    #[serde(rename = "localDirIsMountPoint")]
    pub local_dir_is_mount_point: String,
    #[serde(rename = "smbServer")]
    pub smb_server: String,
    #[serde(rename = "smbUser")]
    pub smb_user: String,
    #[serde(rename = "smbPass")]
    pub smb_pass: String,
    #[serde(rename = "smbDomain")]
    pub smb_domain: String,
    #[serde(rename = "rsyncServer")]
    pub rsync_server: String,
    #[serde(rename = "rsyncUser")]
    pub rsync_user: String,
    #[serde(rename = "rsyncPass")]
    pub rsync_pass: String,
    #[serde(rename = "sshServer")]
    pub ssh_server: String,
    #[serde(rename = "sshUser")]
    pub ssh_user: String,
    #[serde(rename = "sshPass")]
    pub ssh_pass: String,
    #[serde(rename = "sshUseKey")]
    pub ssh_use_key: String,
    pub pid: String,
}

impl CruiseDataTransfer {
    pub fn kind(&self) -> Option<TransferKind> {
        TransferKind::from_api(&self.transfer_type)
    }

    pub fn status(&self) -> Option<RecordStatus> {
        RecordStatus::from_api(&self.status)
    }

    pub fn enabled(&self) -> bool {
        flag(&self.enable)
    }

    pub fn sync_to_dest(&self) -> bool {
        flag(&self.sync_to_dest)
    }

    pub fn skip_empty_files(&self) -> bool {
        flag(&self.skip_empty_files)
    }

    pub fn skip_empty_dirs(&self) -> bool {
        flag(&self.skip_empty_dirs)
    }

    pub fn include_ovdm_files(&self) -> bool {
        flag(&self.include_ovdm_files)
    }

    pub fn local_dir_is_mount_point(&self) -> bool {
        flag(&self.local_dir_is_mount_point)
    }

    pub fn ssh_use_key(&self) -> bool {
        flag(&self.ssh_use_key)
    }

    pub fn bandwidth_limit_kbps(&self) -> u64 {
        self.bandwidth_limit.parse().unwrap_or(0)
    }
}

/// Prioritized include-filter bundle for the bandwidth-limited shore path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipToShoreTransfer {
    #[serde(rename = "shipToShoreTransferID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "longName")]
    pub long_name: String,
    pub priority: String,
    pub enable: String,
    #[serde(rename = "collectionSystem")]
    pub collection_system: String,
    #[serde(rename = "extraDirectory")]
    pub extra_directory: String,
    #[serde(rename = "includeFilter")]
    pub include_filter: String,
}

impl ShipToShoreTransfer {
    pub fn enabled(&self) -> bool {
        flag(&self.enable)
    }
}

/// Additional destination directory under the cruise root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraDirectory {
    #[serde(rename = "extraDirectoryID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "longName")]
    pub long_name: String,
    #[serde(rename = "destDir")]
    pub dest_dir: String,
    #[serde(rename = "cruiseOrLowering")]
    pub cruise_or_lowering: String,
    pub required: String,
    pub enable: String,
}

impl ExtraDirectory {
    pub fn lowering_scoped(&self) -> bool {
        flag(&self.cruise_or_lowering)
    }

    pub fn required(&self) -> bool {
        flag(&self.required)
    }
}

/// Persistent control-plane task record. Synthetic tasks use `task_id == "0"`
/// and never persist state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRecord {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub name: String,
    #[serde(rename = "longName")]
    pub long_name: String,
    pub status: String,
    pub enable: String,
    pub pid: String,
}

impl TaskRecord {
    /// A synthetic, non-persistent task entry.
    pub fn synthetic(name: &str, long_name: &str) -> Self {
        Self {
            task_id: "0".to_string(),
            name: name.to_string(),
            long_name: long_name.to_string(),
            ..Self::default()
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.task_id.parse::<i64>().map(|id| id <= 0).unwrap_or(true)
    }
}

/// Standard file names and paths of the shipboard warehouse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    #[serde(rename = "shipboardDataWarehouseBaseDir")]
    pub base_dir: String,
    #[serde(rename = "shipboardDataWarehouseUsername")]
    pub username: String,
    #[serde(rename = "shipboardDataWarehousePublicDataDir")]
    pub public_data_dir: String,
    #[serde(rename = "loweringDataBaseDir")]
    pub lowering_data_base_dir: String,
    #[serde(rename = "md5SummaryFn")]
    pub md5_summary_fn: String,
    #[serde(rename = "md5SummaryMd5Fn")]
    pub md5_summary_md5_fn: String,
    #[serde(rename = "cruiseConfigFn")]
    pub cruise_config_fn: String,
    #[serde(rename = "loweringConfigFn")]
    pub lowering_config_fn: String,
    #[serde(rename = "dataDashboardManifestFn")]
    pub data_dashboard_manifest_fn: String,
    #[serde(rename = "shipboardDataWarehouseBaseDirIsMountPoint")]
    pub base_dir_is_mount_point: String,
}

impl WarehouseConfig {
    pub fn base_dir_is_mount_point(&self) -> bool {
        flag(&self.base_dir_is_mount_point)
    }

    pub fn cruise_dir(&self, cruise_id: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.base_dir).join(cruise_id)
    }

    pub fn lowering_dir(&self, cruise_id: &str, lowering_id: &str) -> std::path::PathBuf {
        self.cruise_dir(cruise_id)
            .join(&self.lowering_data_base_dir)
            .join(lowering_id)
    }
}

/// Per-part verdict inside a job report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartResult {
    Pass,
    Fail,
    Ignore,
}

/// One named step of a handler's progress through a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPart {
    #[serde(rename = "partName")]
    pub part_name: String,
    pub result: PartResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// File sets produced by a transfer, relative to the expansion the producer
/// documents (handler-relative for transfers, cruise-relative for hooks).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileReport {
    pub new: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub exclude: Vec<String>,
}

impl FileReport {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.exclude.is_empty()
    }
}

/// Completion value of every job: the accumulated parts plus any file sets.
/// The last part is the final verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobReport {
    pub parts: Vec<JobPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<FileReport>,
}

impl JobReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass(&mut self, part_name: &str) -> &mut Self {
        self.parts.push(JobPart {
            part_name: part_name.to_string(),
            result: PartResult::Pass,
            reason: None,
        });
        self
    }

    pub fn fail(&mut self, part_name: &str, reason: impl Into<String>) -> &mut Self {
        self.parts.push(JobPart {
            part_name: part_name.to_string(),
            result: PartResult::Fail,
            reason: Some(reason.into()),
        });
        self
    }

    pub fn ignore(&mut self, part_name: &str, reason: impl Into<String>) -> &mut Self {
        self.parts.push(JobPart {
            part_name: part_name.to_string(),
            result: PartResult::Ignore,
            reason: Some(reason.into()),
        });
        self
    }

    /// Single-part failure report.
    pub fn failed(part_name: &str, reason: impl Into<String>) -> Self {
        let mut report = Self::new();
        report.fail(part_name, reason);
        report
    }

    /// Single-part ignore report.
    pub fn ignored(part_name: &str, reason: impl Into<String>) -> Self {
        let mut report = Self::new();
        report.ignore(part_name, reason);
        report
    }

    pub fn final_verdict(&self) -> Option<&JobPart> {
        self.parts.last()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"parts\":[]}".to_string())
    }
}

/// Reference form used when a payload names a transfer by id only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CstRef {
    #[serde(rename = "collectionSystemTransferID")]
    pub id: String,
    #[serde(flatten)]
    pub overrides: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdtRef {
    #[serde(rename = "cruiseDataTransferID")]
    pub id: String,
    #[serde(flatten)]
    pub overrides: serde_json::Map<String, serde_json::Value>,
}

/// Payload of `runCollectionSystemTransfer` / `testCollectionSystemTransfer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CstJobPayload {
    #[serde(rename = "collectionSystemTransfer")]
    pub collection_system_transfer: Option<CstRef>,
    #[serde(rename = "cruiseID")]
    pub cruise_id: Option<String>,
    #[serde(rename = "loweringID")]
    pub lowering_id: Option<String>,
    #[serde(rename = "systemStatus")]
    pub system_status: Option<String>,
    #[serde(rename = "cruiseStartDate")]
    pub cruise_start_date: Option<String>,
}

/// Payload of `runCruiseDataTransfer` / `runShipToShoreTransfer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdtJobPayload {
    #[serde(rename = "cruiseDataTransfer")]
    pub cruise_data_transfer: Option<CdtRef>,
    #[serde(rename = "cruiseID")]
    pub cruise_id: Option<String>,
    #[serde(rename = "systemStatus")]
    pub system_status: Option<String>,
    #[serde(rename = "bandwidthLimitStatus")]
    pub bandwidth_limit_status: Option<bool>,
}

/// Payload of the cruise/lowering lifecycle and index tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeJobPayload {
    #[serde(rename = "cruiseID")]
    pub cruise_id: Option<String>,
    #[serde(rename = "cruiseStartDate")]
    pub cruise_start_date: Option<String>,
    #[serde(rename = "loweringID")]
    pub lowering_id: Option<String>,
    #[serde(rename = "loweringStartDate")]
    pub lowering_start_date: Option<String>,
}

/// Payload carrying file sets between chained jobs
/// (`updateMD5Summary`, `updateDataDashboard`, post hooks).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesJobPayload {
    #[serde(rename = "cruiseID")]
    pub cruise_id: Option<String>,
    #[serde(rename = "loweringID")]
    pub lowering_id: Option<String>,
    #[serde(rename = "collectionSystemTransferID")]
    pub collection_system_transfer_id: Option<String>,
    pub files: FileReport,
}

/// Payload of `stopJob`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopJobPayload {
    pub pid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_kind_decodes_api_codes() {
        assert_eq!(TransferKind::from_api("1"), Some(TransferKind::Local));
        assert_eq!(TransferKind::from_api("2"), Some(TransferKind::Rsync));
        assert_eq!(TransferKind::from_api("3"), Some(TransferKind::Smb));
        assert_eq!(TransferKind::from_api("4"), Some(TransferKind::Ssh));
        assert_eq!(TransferKind::from_api("9"), None);
    }

    #[test]
    fn cst_decodes_sparse_api_row() {
        let row = r#"{
            "collectionSystemTransferID": "3",
            "name": "SCS",
            "longName": "Ship Computer System",
            "status": "2",
            "enable": "1",
            "transferType": "4",
            "sourceDir": "/data/scs",
            "destDir": "SCS",
            "cruiseOrLowering": "0",
            "staleness": "60",
            "bandwidthLimit": "0"
        }"#;
        let cst: CollectionSystemTransfer = serde_json::from_str(row).unwrap();
        assert_eq!(cst.kind(), Some(TransferKind::Ssh));
        assert_eq!(cst.status(), Some(RecordStatus::Idle));
        assert!(cst.enabled());
        assert!(!cst.lowering_scoped());
        assert_eq!(cst.staleness_secs(), 60);
        assert_eq!(cst.bandwidth_limit_kbps(), 0);
    }

    #[test]
    fn job_report_serializes_wire_shape() {
        let mut report = JobReport::new();
        report.pass("Source Test");
        report.fail("Destination Test", "no such directory");
        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["parts"][0]["partName"], "Source Test");
        assert_eq!(json["parts"][0]["result"], "Pass");
        assert!(json["parts"][0].get("reason").is_none());
        assert_eq!(json["parts"][1]["result"], "Fail");
        assert_eq!(json["parts"][1]["reason"], "no such directory");
        assert!(json.get("files").is_none());
    }

    #[test]
    fn final_verdict_is_last_part() {
        let mut report = JobReport::new();
        report.pass("a").pass("b").fail("c", "boom");
        assert_eq!(report.final_verdict().unwrap().result, PartResult::Fail);
    }

    #[test]
    fn files_payload_defaults_missing_sets() {
        let payload: FilesJobPayload =
            serde_json::from_str(r#"{"cruiseID":"FK250801","files":{"new":["a"]}}"#).unwrap();
        assert_eq!(payload.files.new, vec!["a"]);
        assert!(payload.files.updated.is_empty());
        assert!(payload.files.deleted.is_empty());
    }

    #[test]
    fn synthetic_task_detection() {
        assert!(TaskRecord::synthetic("updateMD5Summary", "Updating MD5 Summary").is_synthetic());
        let real = TaskRecord {
            task_id: "7".into(),
            ..TaskRecord::default()
        };
        assert!(!real.is_synthetic());
    }
}
