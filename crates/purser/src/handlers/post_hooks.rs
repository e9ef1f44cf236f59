//! Post-hook runner: execute user-configured commands after lifecycle and
//! transfer milestones, with token substitution.

use std::process::Command;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::HookCommand;
use crate::types::{FilesJobPayload, JobReport};
use crate::worker::{JobContext, OwnerSpec, TaskRegistration};

pub const POST_CST_TASK: &str = "postCollectionSystemTransfer";
pub const POST_DASHBOARD_TASK: &str = "postDataDashboard";
pub const POST_CREATE_CRUISE_TASK: &str = "postSetupNewCruise";
pub const POST_CREATE_LOWERING_TASK: &str = "postSetupNewLowering";
pub const PRE_FINALIZE_CRUISE_TASK: &str = "preFinalizeCurrentCruise";
pub const POST_FINALIZE_CRUISE_TASK: &str = "postFinalizeCurrentCruise";
pub const PRE_FINALIZE_LOWERING_TASK: &str = "preFinalizeCurrentLowering";
pub const POST_FINALIZE_LOWERING_TASK: &str = "postFinalizeCurrentLowering";

const SYNTHETIC: &[(&str, &str)] = &[
    (POST_CST_TASK, "Post collection system transfer"),
    (POST_DASHBOARD_TASK, "Post data dashboard processing"),
    (POST_CREATE_CRUISE_TASK, "Post setup new cruise"),
    (POST_CREATE_LOWERING_TASK, "Post setup new lowering"),
    (PRE_FINALIZE_CRUISE_TASK, "Pre finalize current cruise"),
    (POST_FINALIZE_CRUISE_TASK, "Post finalize current cruise"),
    (PRE_FINALIZE_LOWERING_TASK, "Pre finalize current lowering"),
    (POST_FINALIZE_LOWERING_TASK, "Post finalize current lowering"),
];

pub fn registrations() -> Vec<TaskRegistration> {
    SYNTHETIC
        .iter()
        .map(|&(name, _)| TaskRegistration::new(name, OwnerSpec::Task(SYNTHETIC), run_post_hook))
        .collect()
}

/// Token replacements available to hook commands. Unset values leave their
/// tokens untouched.
fn build_replacements(
    ctx: &JobContext,
    payload: &FilesJobPayload,
    cst: Option<&crate::types::CollectionSystemTransfer>,
) -> Vec<(String, String)> {
    let files = &payload.files;
    let mut replacements = Vec::new();

    let cruise_id = payload
        .cruise_id
        .clone()
        .or_else(|| ctx.api.cruise_id().ok().flatten());
    if let Some(cruise_id) = cruise_id {
        replacements.push(("{cruiseID}".to_string(), cruise_id));
    }

    let lowering_id = payload
        .lowering_id
        .clone()
        .or_else(|| ctx.api.lowering_id().ok().flatten());
    if let Some(lowering_id) = lowering_id {
        replacements.push(("{loweringID}".to_string(), lowering_id));
    }

    if let Some(cst) = cst {
        replacements.push(("{collectionSystemTransferID}".to_string(), cst.id.clone()));
        replacements.push(("{collectionSystemTransferName}".to_string(), cst.name.clone()));
    }

    if !files.new.is_empty() {
        replacements.push(("{newFiles}".to_string(), files.new.join(" ")));
    }
    if !files.updated.is_empty() {
        replacements.push(("{updatedFiles}".to_string(), files.updated.join(" ")));
    }

    replacements
}

fn substitute(command: &HookCommand, replacements: &[(String, String)]) -> HookCommand {
    let argv = command
        .command
        .iter()
        .map(|arg| {
            let mut arg = arg.clone();
            for (token, value) in replacements {
                arg = arg.replace(token, value);
            }
            arg
        })
        .collect();
    HookCommand {
        name: command.name.clone(),
        command: argv,
    }
}

/// The command list for this hook invocation, or a Fail/Ignore report when
/// there is nothing runnable.
fn resolve_commands(ctx: &JobContext) -> Result<Vec<HookCommand>, JobReport> {
    let hook_name = ctx.job.function.as_str();
    let sets = ctx.config.post_hook_command_sets(hook_name);
    if sets.is_empty() {
        return Err(JobReport::ignored("Retrieve commands", "No commands found"));
    }

    let payload: FilesJobPayload = ctx.payload().unwrap_or_default();

    let (command_list, cst) =
        if matches!(hook_name, POST_CST_TASK | POST_DASHBOARD_TASK) {
            let cst_id = payload.collection_system_transfer_id.clone().unwrap_or_default();
            let cst = match ctx.api.collection_system_transfer(&cst_id) {
                Ok(Some(cst)) => cst,
                Ok(None) => {
                    return Err(JobReport::failed(
                        "Get command list",
                        "Could not find collection system transfer",
                    ));
                }
                Err(err) => {
                    return Err(JobReport::failed("Get command list", format!("{err:#}")));
                }
            };
            let command_list = sets
                .iter()
                .find(|set| set.collection_system_transfer_name.as_deref() == Some(&cst.name))
                .map(|set| set.command_list.clone())
                .unwrap_or_default();
            (command_list, Some(cst))
        } else {
            (sets[0].command_list.clone(), None)
        };

    if command_list.is_empty() {
        return Err(JobReport::ignored("Running commands", "No commands found"));
    }

    let replacements = build_replacements(ctx, &payload, cst.as_ref());
    Ok(command_list
        .iter()
        .map(|cmd| substitute(cmd, &replacements))
        .collect())
}

fn run_command(command: &HookCommand) -> Result<(), String> {
    if command.command.is_empty() {
        return Err(format!("Empty command for {}", command.name));
    }

    debug!("command: {}", command.command.join(" "));
    let output = Command::new(&command.command[0])
        .args(&command.command[1..])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            if !output.stdout.is_empty() {
                debug!("stdout: {}", String::from_utf8_lossy(&output.stdout));
            }
            if !output.stderr.is_empty() {
                debug!("stderr: {}", String::from_utf8_lossy(&output.stderr));
            }
            Ok(())
        }
        _ => {
            let reason = format!(
                "Error executing {}: {}",
                command.name,
                command.command.join(" ")
            );
            warn!("{reason}");
            Err(reason)
        }
    }
}

fn run_post_hook(ctx: &JobContext) -> Result<JobReport> {
    let mut report = JobReport::new();

    info!("retrieving commands");
    ctx.send_status(1, 10);

    let commands = match resolve_commands(ctx) {
        Ok(commands) => commands,
        Err(report) => return Ok(report),
    };
    report.pass("Get Commands");

    info!("running commands");
    ctx.send_status(2, 10);

    let mut reasons = Vec::new();
    let total = commands.len() as u64;
    for (index, command) in commands.iter().enumerate() {
        ctx.send_status(80 * (index as u64 + 1) / total + 20, 100);

        info!("executing: {}", command.name);
        if let Err(reason) = run_command(command) {
            reasons.push(reason);
        }
    }

    if reasons.is_empty() {
        report.pass("Running commands");
    } else {
        report.fail("Running commands", reasons.join("\n"));
    }

    ctx.send_status(10, 10);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_known_tokens_only() {
        let command = HookCommand {
            name: "notify".into(),
            command: vec![
                "/usr/local/bin/notify".into(),
                "{cruiseID}".into(),
                "{newFiles}".into(),
                "{unknownToken}".into(),
            ],
        };
        let replacements = vec![
            ("{cruiseID}".to_string(), "FK250801".to_string()),
            ("{newFiles}".to_string(), "a.txt b.txt".to_string()),
        ];

        let substituted = substitute(&command, &replacements);
        assert_eq!(
            substituted.command,
            vec!["/usr/local/bin/notify", "FK250801", "a.txt b.txt", "{unknownToken}"]
        );
    }

    #[test]
    fn failing_command_produces_reason() {
        let command = HookCommand {
            name: "broken".into(),
            command: vec!["/bin/false".into()],
        };
        let err = run_command(&command).unwrap_err();
        assert!(err.contains("Error executing broken"));
    }

    #[test]
    fn succeeding_command_is_ok() {
        let command = HookCommand {
            name: "noop".into(),
            command: vec!["/bin/true".into()],
        };
        assert!(run_command(&command).is_ok());
    }
}
