//! Typed client for the control-plane HTTP API.
//!
//! Every call is live (the UI and other workers mutate the same state, so
//! nothing is cached) and carries a short timeout. Transport failures are
//! surfaced to the caller, who decides whether to convert them into a Fail
//! part or retry on the next tick.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde_json::Value;

use crate::types::{
    CollectionSystemTransfer, CruiseDataTransfer, ExtraDirectory, ShipToShoreTransfer, TaskRecord,
    WarehouseConfig,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Status code of a record in the control plane, as posted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Running,
    Idle,
    Error,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    site_root: String,
    http: Client,
}

impl ApiClient {
    pub fn new(site_root: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("purser/{}", env!("CARGO_PKG_VERSION")))
            .timeout(TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            site_root: site_root.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.site_root, path)
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let resp = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("control-plane request failed: {url}"))?;
        if !resp.status().is_success() {
            bail!("unexpected status {} from {url}", resp.status());
        }
        resp.json()
            .with_context(|| format!("failed to parse JSON from {url}"))
    }

    fn get_text(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        let resp = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("control-plane request failed: {url}"))?;
        if !resp.status().is_success() {
            bail!("unexpected status {} from {url}", resp.status());
        }
        resp.text()
            .with_context(|| format!("failed to read body from {url}"))
    }

    fn get_ok(&self, path: &str) -> Result<()> {
        self.get_text(path).map(|_| ())
    }

    fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<()> {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .form(form)
            .send()
            .with_context(|| format!("control-plane request failed: {url}"))?;
        if !resp.status().is_success() {
            bail!("unexpected status {} from {url}", resp.status());
        }
        Ok(())
    }

    /// Extract a string field from a `{"field": ...}` response; empty strings
    /// and nulls become `None`.
    fn string_field(value: &Value, field: &str) -> Option<String> {
        match value.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    // --- warehouse ---

    pub fn warehouse_config(&self) -> Result<WarehouseConfig> {
        let value = self.get_json("api/warehouse/getShipboardDataWarehouseConfig")?;
        serde_json::from_value(value).context("failed to decode warehouse config")
    }

    pub fn cruise_id(&self) -> Result<Option<String>> {
        let value = self.get_json("api/warehouse/getCruiseID")?;
        Ok(Self::string_field(&value, "cruiseID"))
    }

    pub fn cruise_start_date(&self) -> Result<Option<String>> {
        let value = self.get_json("api/warehouse/getCruiseStartDate")?;
        Ok(Self::string_field(&value, "cruiseStartDate"))
    }

    pub fn cruise_end_date(&self) -> Result<Option<String>> {
        let value = self.get_json("api/warehouse/getCruiseEndDate")?;
        Ok(Self::string_field(&value, "cruiseEndDate"))
    }

    /// Current cruise configuration, stamped with `configCreatedOn`.
    pub fn cruise_config(&self) -> Result<Value> {
        let mut value = self.get_json("api/warehouse/getCruiseConfig")?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "configCreatedOn".to_string(),
                Value::String(chrono::Utc::now().format("%Y/%m/%dT%H:%M:%SZ").to_string()),
            );
        }
        Ok(value)
    }

    pub fn lowering_id(&self) -> Result<Option<String>> {
        let value = self.get_json("api/warehouse/getLoweringID")?;
        Ok(Self::string_field(&value, "loweringID"))
    }

    pub fn lowering_start_date(&self) -> Result<Option<String>> {
        let value = self.get_json("api/warehouse/getLoweringStartDate")?;
        Ok(Self::string_field(&value, "loweringStartDate"))
    }

    pub fn lowering_end_date(&self) -> Result<Option<String>> {
        let value = self.get_json("api/warehouse/getLoweringEndDate")?;
        Ok(Self::string_field(&value, "loweringEndDate"))
    }

    /// Current lowering configuration, stamped with `configCreatedOn`.
    pub fn lowering_config(&self) -> Result<Value> {
        let mut value = self.get_json("api/warehouse/getLoweringConfig")?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "configCreatedOn".to_string(),
                Value::String(chrono::Utc::now().format("%Y/%m/%dT%H:%M:%SZ").to_string()),
            );
        }
        Ok(value)
    }

    /// Lowering ids recorded for the current cruise.
    pub fn lowerings(&self) -> Result<Vec<String>> {
        let value = self.get_json("api/warehouse/getLowerings")?;
        serde_json::from_value(value).context("failed to decode lowering list")
    }

    pub fn system_status(&self) -> Result<String> {
        let value = self.get_json("api/warehouse/getSystemStatus")?;
        Ok(Self::string_field(&value, "systemStatus").unwrap_or_default())
    }

    pub fn show_lowering_components(&self) -> Result<bool> {
        Ok(self.get_text("api/warehouse/getShowLoweringComponents")? == "true")
    }

    pub fn ship_to_shore_bw_limit_enabled(&self) -> Result<bool> {
        let value = self.get_json("api/warehouse/getShipToShoreBWLimitStatus")?;
        Ok(Self::string_field(&value, "shipToShoreBWLimitStatus").as_deref() == Some("On"))
    }

    /// MD5 filesize limit in MB, as the API's string value.
    pub fn md5_filesize_limit(&self) -> Result<String> {
        let value = self.get_json("api/warehouse/getMD5FilesizeLimit")?;
        Ok(Self::string_field(&value, "md5FilesizeLimit").unwrap_or_else(|| "0".to_string()))
    }

    pub fn md5_filesize_limit_enabled(&self) -> Result<bool> {
        let value = self.get_json("api/warehouse/getMD5FilesizeLimitStatus")?;
        Ok(Self::string_field(&value, "md5FilesizeLimitStatus").as_deref() == Some("On"))
    }

    pub fn logfile_purge_timedelta(&self) -> Result<Option<String>> {
        let value = self.get_json("api/warehouse/getLogfilePurgeInterval")?;
        Ok(Self::string_field(&value, "logfilePurgeInterval"))
    }

    pub fn set_cruise_size(&self, size_in_bytes: &str) -> Result<()> {
        self.post_form("api/warehouse/setCruiseSize", &[("bytes", size_in_bytes)])
    }

    pub fn set_lowering_size(&self, size_in_bytes: &str) -> Result<()> {
        self.post_form("api/warehouse/setLoweringSize", &[("bytes", size_in_bytes)])
    }

    // --- collection system transfers ---

    pub fn collection_system_transfers(&self) -> Result<Vec<CollectionSystemTransfer>> {
        let value = self.get_json("api/collectionSystemTransfers/getCollectionSystemTransfers")?;
        serde_json::from_value(value).context("failed to decode collection system transfers")
    }

    /// Active transfers, optionally filtered to cruise- or lowering-scoped
    /// records.
    pub fn active_collection_system_transfers(
        &self,
        cruise: bool,
        lowering: bool,
    ) -> Result<Vec<CollectionSystemTransfer>> {
        let value =
            self.get_json("api/collectionSystemTransfers/getActiveCollectionSystemTransfers")?;
        let mut transfers: Vec<CollectionSystemTransfer> =
            serde_json::from_value(value).context("failed to decode collection system transfers")?;
        if !cruise {
            transfers.retain(|t| t.cruise_or_lowering != "0");
        }
        if !lowering {
            transfers.retain(|t| t.cruise_or_lowering != "1");
        }
        Ok(transfers)
    }

    pub fn collection_system_transfer(&self, id: &str) -> Result<Option<CollectionSystemTransfer>> {
        let value = self.get_json(&format!(
            "api/collectionSystemTransfers/getCollectionSystemTransfer/{id}"
        ))?;
        let mut rows: Vec<CollectionSystemTransfer> =
            serde_json::from_value(value).context("failed to decode collection system transfer")?;
        Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
    }

    pub fn collection_system_transfer_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CollectionSystemTransfer>> {
        Ok(self
            .collection_system_transfers()?
            .into_iter()
            .find(|t| t.name == name))
    }

    pub fn set_running_collection_system_transfer(
        &self,
        id: &str,
        pid: u32,
        job_handle: &str,
    ) -> Result<()> {
        let transfer = self
            .collection_system_transfer(id)?
            .with_context(|| format!("invalid collection system transfer id: {id}"))?;
        self.post_form(
            &format!("api/collectionSystemTransfers/setRunningCollectionSystemTransfer/{id}"),
            &[("jobPid", &pid.to_string())],
        )?;
        self.track_job(&format!("Transfer for {}", transfer.name), pid, job_handle)
    }

    /// Test runs only register with the job tracker; the persistent row is
    /// left untouched.
    pub fn set_running_collection_system_transfer_test(
        &self,
        id: &str,
        pid: u32,
        job_handle: &str,
    ) -> Result<()> {
        let transfer = self
            .collection_system_transfer(id)?
            .with_context(|| format!("invalid collection system transfer id: {id}"))?;
        self.track_job(&format!("Transfer test for {}", transfer.name), pid, job_handle)
    }

    pub fn set_idle_collection_system_transfer(&self, id: &str) -> Result<()> {
        self.get_ok(&format!(
            "api/collectionSystemTransfers/setIdleCollectionSystemTransfer/{id}"
        ))
    }

    pub fn set_error_collection_system_transfer(&self, id: &str, reason: &str) -> Result<()> {
        let transfer = self
            .collection_system_transfer(id)?
            .with_context(|| format!("invalid collection system transfer id: {id}"))?;
        self.get_ok(&format!(
            "api/collectionSystemTransfers/setErrorCollectionSystemTransfer/{id}"
        ))?;
        self.send_msg(&format!("{} Data Transfer failed", transfer.name), reason)
    }

    pub fn set_error_collection_system_transfer_test(&self, id: &str, reason: &str) -> Result<()> {
        let transfer = self
            .collection_system_transfer(id)?
            .with_context(|| format!("invalid collection system transfer id: {id}"))?;
        self.get_ok(&format!(
            "api/collectionSystemTransfers/setErrorCollectionSystemTransfer/{id}"
        ))?;
        self.send_msg(&format!("{} Connection test failed", transfer.name), reason)
    }

    // --- cruise data transfers ---

    pub fn cruise_data_transfers(&self) -> Result<Vec<CruiseDataTransfer>> {
        let value = self.get_json("api/cruiseDataTransfers/getCruiseDataTransfers")?;
        serde_json::from_value(value).context("failed to decode cruise data transfers")
    }

    pub fn required_cruise_data_transfers(&self) -> Result<Vec<CruiseDataTransfer>> {
        let value = self.get_json("api/cruiseDataTransfers/getRequiredCruiseDataTransfers")?;
        serde_json::from_value(value).context("failed to decode required cruise data transfers")
    }

    pub fn cruise_data_transfer(&self, id: &str) -> Result<Option<CruiseDataTransfer>> {
        let value =
            self.get_json(&format!("api/cruiseDataTransfers/getCruiseDataTransfer/{id}"))?;
        let mut rows: Vec<CruiseDataTransfer> =
            serde_json::from_value(value).context("failed to decode cruise data transfer")?;
        Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
    }

    pub fn required_cruise_data_transfer_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CruiseDataTransfer>> {
        Ok(self
            .required_cruise_data_transfers()?
            .into_iter()
            .find(|t| t.name == name))
    }

    pub fn set_running_cruise_data_transfer(
        &self,
        id: &str,
        pid: u32,
        job_handle: &str,
    ) -> Result<()> {
        let transfer = self
            .cruise_data_transfer(id)?
            .with_context(|| format!("invalid cruise data transfer id: {id}"))?;
        self.post_form(
            &format!("api/cruiseDataTransfers/setRunningCruiseDataTransfer/{id}"),
            &[("jobPid", &pid.to_string())],
        )?;
        self.track_job(&format!("Transfer for {}", transfer.name), pid, job_handle)
    }

    pub fn set_running_cruise_data_transfer_test(
        &self,
        id: &str,
        pid: u32,
        job_handle: &str,
    ) -> Result<()> {
        let transfer = self
            .cruise_data_transfer(id)?
            .with_context(|| format!("invalid cruise data transfer id: {id}"))?;
        self.track_job(&format!("Transfer test for {}", transfer.name), pid, job_handle)
    }

    pub fn set_idle_cruise_data_transfer(&self, id: &str) -> Result<()> {
        self.get_ok(&format!("api/cruiseDataTransfers/setIdleCruiseDataTransfer/{id}"))
    }

    pub fn set_error_cruise_data_transfer(&self, id: &str, reason: &str) -> Result<()> {
        let transfer = self
            .cruise_data_transfer(id)?
            .with_context(|| format!("invalid cruise data transfer id: {id}"))?;
        self.get_ok(&format!("api/cruiseDataTransfers/setErrorCruiseDataTransfer/{id}"))?;
        self.send_msg(&format!("{} Data Transfer failed", transfer.name), reason)
    }

    pub fn set_error_cruise_data_transfer_test(&self, id: &str, reason: &str) -> Result<()> {
        let transfer = self
            .cruise_data_transfer(id)?
            .with_context(|| format!("invalid cruise data transfer id: {id}"))?;
        self.get_ok(&format!("api/cruiseDataTransfers/setErrorCruiseDataTransfer/{id}"))?;
        self.send_msg(&format!("{} Connection test failed", transfer.name), reason)
    }

    // --- ship-to-shore transfers ---

    pub fn ship_to_shore_transfers(&self) -> Result<Vec<ShipToShoreTransfer>> {
        let value = self.get_json("api/shipToShoreTransfers/getShipToShoreTransfers")?;
        serde_json::from_value(value).context("failed to decode ship-to-shore transfers")
    }

    pub fn required_ship_to_shore_transfers(&self) -> Result<Vec<ShipToShoreTransfer>> {
        let value = self.get_json("api/shipToShoreTransfers/getRequiredShipToShoreTransfers")?;
        serde_json::from_value(value).context("failed to decode required ship-to-shore transfers")
    }

    // --- tasks ---

    pub fn tasks(&self) -> Result<Vec<TaskRecord>> {
        let value = self.get_json("api/tasks/getTasks")?;
        serde_json::from_value(value).context("failed to decode tasks")
    }

    pub fn task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let value = self.get_json(&format!("api/tasks/getTask/{id}"))?;
        let mut rows: Vec<TaskRecord> =
            serde_json::from_value(value).context("failed to decode task")?;
        Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
    }

    pub fn task_by_name(&self, name: &str) -> Result<Option<TaskRecord>> {
        Ok(self.tasks()?.into_iter().find(|t| t.name == name))
    }

    pub fn set_running_task(&self, id: &str, pid: u32, job_handle: &str) -> Result<()> {
        let task = self
            .task(id)?
            .with_context(|| format!("invalid task id: {id}"))?;
        self.post_form(
            &format!("api/tasks/setRunningTask/{id}"),
            &[("jobPid", &pid.to_string())],
        )?;
        self.track_job(&task.long_name, pid, job_handle)
    }

    pub fn set_idle_task(&self, id: &str) -> Result<()> {
        self.get_ok(&format!("api/tasks/setIdleTask/{id}"))
    }

    pub fn set_error_task(&self, id: &str, reason: &str) -> Result<()> {
        let task = self
            .task(id)?
            .with_context(|| format!("invalid task id: {id}"))?;
        self.get_ok(&format!("api/tasks/setErrorTask/{id}"))?;
        self.send_msg(&format!("{} failed", task.name), reason)
    }

    // --- extra directories ---

    pub fn extra_directories(&self) -> Result<Vec<ExtraDirectory>> {
        let value = self.get_json("api/extraDirectories/getExtraDirectories")?;
        serde_json::from_value(value).context("failed to decode extra directories")
    }

    pub fn active_extra_directories(
        &self,
        cruise: bool,
        lowering: bool,
    ) -> Result<Vec<ExtraDirectory>> {
        let value = self.get_json("api/extraDirectories/getActiveExtraDirectories")?;
        let mut dirs: Vec<ExtraDirectory> =
            serde_json::from_value(value).context("failed to decode active extra directories")?;
        if !cruise {
            dirs.retain(|d| d.cruise_or_lowering != "0");
        }
        if !lowering {
            dirs.retain(|d| d.cruise_or_lowering != "1");
        }
        Ok(dirs)
    }

    pub fn required_extra_directories(&self) -> Result<Vec<ExtraDirectory>> {
        let value = self.get_json("api/extraDirectories/getRequiredExtraDirectories")?;
        serde_json::from_value(value).context("failed to decode required extra directories")
    }

    pub fn extra_directory(&self, id: &str) -> Result<Option<ExtraDirectory>> {
        let value = self.get_json(&format!("api/extraDirectories/getExtraDirectory/{id}"))?;
        let mut rows: Vec<ExtraDirectory> =
            serde_json::from_value(value).context("failed to decode extra directory")?;
        Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
    }

    pub fn required_extra_directory_by_name(&self, name: &str) -> Result<Option<ExtraDirectory>> {
        Ok(self
            .required_extra_directories()?
            .into_iter()
            .find(|d| d.name == name))
    }

    // --- job tracking & messages ---

    /// Record a broker job (handle, name, pid) so the UI can display and
    /// stop it.
    pub fn track_job(&self, job_name: &str, pid: u32, job_handle: &str) -> Result<()> {
        self.post_form(
            &format!("api/gearman/newJob/{job_handle}"),
            &[("jobName", job_name), ("jobPid", &pid.to_string())],
        )
    }

    pub fn clear_all_jobs(&self) -> Result<()> {
        self.get_ok("api/gearman/clearAllJobsFromDB")
    }

    /// Post a user-visible message to the control-plane message bus.
    pub fn send_msg(&self, title: &str, body: &str) -> Result<()> {
        self.post_form(
            "api/messages/newMessage",
            &[("messageTitle", title), ("messageBody", body)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    /// One-shot control-plane stub: answers each request path with the
    /// configured body and records what was requested.
    fn spawn_stub(
        routes: Vec<(&'static str, &'static str)>,
    ) -> (String, mpsc::Receiver<String>, thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", server.server_addr().to_ip().unwrap());
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            for _ in 0..routes.len() {
                let request = server.recv().unwrap();
                let url = request.url().to_string();
                let body = routes
                    .iter()
                    .find(|(path, _)| url.ends_with(path))
                    .map(|(_, body)| *body)
                    .unwrap_or("{}");
                tx.send(url).unwrap();
                let _ = request.respond(tiny_http::Response::from_string(body));
            }
        });

        (addr, rx, handle)
    }

    #[test]
    fn cruise_id_round_trip() {
        let (addr, rx, handle) =
            spawn_stub(vec![("getCruiseID", r#"{"cruiseID": "FK250801"}"#)]);
        let client = ApiClient::new(&addr).unwrap();
        assert_eq!(client.cruise_id().unwrap().as_deref(), Some("FK250801"));
        assert!(rx.recv().unwrap().contains("api/warehouse/getCruiseID"));
        handle.join().unwrap();
    }

    #[test]
    fn empty_lowering_id_is_none() {
        let (addr, _rx, handle) =
            spawn_stub(vec![("getLoweringID", r#"{"loweringID": ""}"#)]);
        let client = ApiClient::new(&addr).unwrap();
        assert_eq!(client.lowering_id().unwrap(), None);
        handle.join().unwrap();
    }

    #[test]
    fn active_transfers_filter_by_scope() {
        let body = r#"[
            {"collectionSystemTransferID":"1","name":"A","cruiseOrLowering":"0"},
            {"collectionSystemTransferID":"2","name":"B","cruiseOrLowering":"1"}
        ]"#;
        let (addr, _rx, handle) = spawn_stub(vec![
            ("getActiveCollectionSystemTransfers", body),
            ("getActiveCollectionSystemTransfers", body),
        ]);
        let client = ApiClient::new(&addr).unwrap();

        let cruise_only = client.active_collection_system_transfers(true, false).unwrap();
        assert_eq!(cruise_only.len(), 1);
        assert_eq!(cruise_only[0].name, "A");

        let lowering_only = client.active_collection_system_transfers(false, true).unwrap();
        assert_eq!(lowering_only.len(), 1);
        assert_eq!(lowering_only[0].name, "B");
        handle.join().unwrap();
    }

    #[test]
    fn single_record_lookup_unwraps_array() {
        let (addr, _rx, handle) = spawn_stub(vec![(
            "getCollectionSystemTransfer/3",
            r#"[{"collectionSystemTransferID":"3","name":"SCS"}]"#,
        )]);
        let client = ApiClient::new(&addr).unwrap();
        let transfer = client.collection_system_transfer("3").unwrap().unwrap();
        assert_eq!(transfer.name, "SCS");
        handle.join().unwrap();
    }

    #[test]
    fn missing_record_lookup_is_none() {
        let (addr, _rx, handle) = spawn_stub(vec![("getTask/99", "[]")]);
        let client = ApiClient::new(&addr).unwrap();
        assert!(client.task("99").unwrap().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn bw_limit_status_decodes_on_off() {
        let (addr, _rx, handle) = spawn_stub(vec![
            ("getShipToShoreBWLimitStatus", r#"{"shipToShoreBWLimitStatus":"On"}"#),
        ]);
        let client = ApiClient::new(&addr).unwrap();
        assert!(client.ship_to_shore_bw_limit_enabled().unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn unreachable_server_is_a_transport_error() {
        // Port 9 (discard) is a safe dead endpoint.
        let client = ApiClient::new("http://127.0.0.1:9").unwrap();
        assert!(client.cruise_id().is_err());
    }
}
