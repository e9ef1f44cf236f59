//! Concrete task procedures, one module per worker family.

pub mod collection_system;
pub mod cruise;
pub mod cruise_directory;
pub mod cruise_data;
pub mod data_dashboard;
pub mod lowering;
pub mod lowering_directory;
pub mod md5_summary;
pub mod post_hooks;
pub mod ship_to_shore;
pub mod stop_job;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::filters::TokenContext;
use crate::types::{ScopeJobPayload, WarehouseConfig};
use crate::worker::JobContext;

/// The cruise/lowering scope a job operates in: ids from the payload when
/// present, live from the control plane otherwise.
#[derive(Debug, Clone)]
pub struct Scope {
    pub cruise_id: String,
    pub lowering_id: Option<String>,
    pub warehouse: WarehouseConfig,
    pub cruise_dir: PathBuf,
}

impl Scope {
    pub fn resolve(ctx: &JobContext) -> Result<Self> {
        let payload: ScopeJobPayload = ctx.payload().unwrap_or_default();

        let cruise_id = match payload.cruise_id {
            Some(id) if !id.is_empty() => id,
            _ => ctx
                .api
                .cruise_id()?
                .context("no current cruise configured")?,
        };
        let lowering_id = match payload.lowering_id {
            Some(id) if !id.is_empty() => Some(id),
            Some(_) => None,
            None => ctx.api.lowering_id()?,
        };

        let warehouse = ctx.api.warehouse_config()?;
        let cruise_dir = warehouse.cruise_dir(&cruise_id);

        Ok(Self {
            cruise_id,
            lowering_id,
            warehouse,
            cruise_dir,
        })
    }

    pub fn token_ctx(&self) -> TokenContext {
        TokenContext::new(
            &self.cruise_id,
            self.lowering_id.as_deref(),
            &self.warehouse.lowering_data_base_dir,
        )
    }

    pub fn lowering_dir(&self) -> Option<PathBuf> {
        self.lowering_id
            .as_ref()
            .map(|id| self.warehouse.lowering_dir(&self.cruise_id, id))
    }
}

/// UTC timestamp used in transfer log filenames.
pub fn timestamp_utc() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// Path of the cruise's transfer-log directory (`Transfer_Logs` required
/// extra directory).
pub fn transfer_log_dir(ctx: &JobContext, scope: &Scope) -> Result<PathBuf> {
    let extra_dir = ctx
        .api
        .required_extra_directory_by_name("Transfer_Logs")?
        .context("no Transfer_Logs extra directory configured")?;
    Ok(scope.cruise_dir.join(&extra_dir.dest_dir))
}

/// Path of the cruise's dashboard directory (`Dashboard_Data` required
/// extra directory).
pub fn dashboard_dir(ctx: &JobContext, scope: &Scope) -> Result<PathBuf> {
    let extra_dir = ctx
        .api
        .required_extra_directory_by_name("Dashboard_Data")?
        .context("no Dashboard_Data extra directory configured")?;
    Ok(scope.cruise_dir.join(&extra_dir.dest_dir))
}

/// Write a transfer log file and hand it to the warehouse user.
pub fn write_transfer_log(
    ctx: &JobContext,
    scope: &Scope,
    filename: &str,
    contents: &Value,
) -> Result<()> {
    let log_dir = transfer_log_dir(ctx, scope)?;
    let path = log_dir.join(filename);
    crate::fsutil::write_json_atomic(&path, contents)?;
    crate::fsutil::set_owner_group_permissions(&scope.warehouse.username, &path)
}
