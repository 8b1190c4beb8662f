//! The agent-facing command operations.
//!
//! Each issuer builds an envelope, submits it through the bridge, waits
//! for the correlated result, and folds every outcome (success, reported
//! failure, timeout, refusal) into one human-readable `[TOOL]` sentence.
//! Issuers never return errors and never panic; the caller always gets
//! text it can relay verbatim.

use std::sync::atomic::Ordering;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use easel_blockspec::parse_with_repair;

use crate::envelope::{CommandEnvelope, CommandKind, Placement, PortSpec, ResultEnvelope};
use crate::session::Bridge;
use crate::waiter::WaitError;

/// Raw placement as it arrives from the agent side; resolved into a
/// [`Placement`] before anything is queued.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlacementRequest {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub input_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("unknown placement mode '{mode}' (expected 'slot' or 'under')")]
    UnknownMode { mode: String },
    #[error("slot placement needs a target like 'R3', got '{target}'")]
    InvalidSlot { target: String },
    #[error("slot placement needs a target slot")]
    MissingSlot,
    #[error("under placement needs a parent block id")]
    MissingParent,
}

fn resolve_placement(
    request: Option<PlacementRequest>,
) -> Result<Option<Placement>, PlacementError> {
    let Some(request) = request else {
        return Ok(None);
    };
    match request.mode.as_str() {
        "" => Ok(None),
        "slot" => {
            if request.target.is_empty() {
                return Err(PlacementError::MissingSlot);
            }
            if !is_slot_name(&request.target) {
                return Err(PlacementError::InvalidSlot {
                    target: request.target,
                });
            }
            Ok(Some(Placement::Slot {
                slot: request.target,
            }))
        }
        "under" => {
            if request.target.is_empty() {
                return Err(PlacementError::MissingParent);
            }
            Ok(Some(Placement::Under {
                parent_id: request.target,
                input_name: request.input_name.filter(|name| !name.is_empty()),
            }))
        }
        _ => Err(PlacementError::UnknownMode { mode: request.mode }),
    }
}

/// Result slots are named `R1`, `R2`, ...
fn is_slot_name(target: &str) -> bool {
    match target.strip_prefix('R') {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

fn action(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::Delete => "block deletion",
        CommandKind::Create => "block creation",
        CommandKind::Variable => "variable creation",
        CommandKind::Edit => "interface update",
        CommandKind::Replace => "block replacement",
    }
}

fn error_text(result: &ResultEnvelope) -> &str {
    result
        .error
        .as_deref()
        .unwrap_or("the workspace reported an unspecified error")
}

fn failure_message(kind: CommandKind, err: &WaitError) -> String {
    match err {
        WaitError::Timeout { timeout_secs, .. } => format!(
            "[TOOL] Timed out waiting for {} (no response from the workspace within {timeout_secs}s)",
            action(kind)
        ),
        WaitError::AlreadyPending { key } => format!(
            "[TOOL] A {} request for this target is already in flight ({key}); wait for it to finish",
            action(kind)
        ),
        WaitError::ChannelClosed { .. } => {
            format!(
                "[TOOL] Internal bridge error while waiting for {}: {err}",
                action(kind)
            )
        }
    }
}

impl Bridge {
    /// Registers the waiter before queueing, so a fast callback can
    /// never slip past it and a duplicate in-flight key is refused
    /// before anything reaches the client.
    async fn run_command(&self, envelope: CommandEnvelope) -> Result<ResultEnvelope, WaitError> {
        let ticket = self.waiter.register(envelope.delivery_key())?;
        self.submit(envelope);
        let outcome = ticket.wait(self.config.result_timeout).await;
        if let Err(err) = &outcome {
            warn!(error = %err, "command did not resolve");
        }
        outcome
    }

    pub async fn delete_block(&self, block_id: &str) -> String {
        let block_id = block_id.trim();
        if block_id.is_empty() {
            return "[TOOL] Cannot delete a block without its id".to_string();
        }
        let envelope = CommandEnvelope::Delete {
            block_id: block_id.to_string(),
        };
        match self.run_command(envelope).await {
            Ok(result) if result.success => {
                format!("[TOOL] Successfully deleted block: {block_id}")
            }
            Ok(result) => format!(
                "[TOOL] Failed to delete block {block_id}: {}",
                error_text(&result)
            ),
            Err(err) => failure_message(CommandKind::Delete, &err),
        }
    }

    /// Validates (and, for a single missing parenthesis, repairs) the
    /// spec before anything is queued; a spec the workspace could not
    /// parse must never reach it.
    pub async fn create_block(
        &self,
        block_spec: &str,
        placement: Option<PlacementRequest>,
    ) -> String {
        let block_spec = block_spec.trim();
        if block_spec.is_empty() {
            return "[TOOL] Cannot create a block from an empty spec".to_string();
        }
        let placement = match resolve_placement(placement) {
            Ok(placement) => placement,
            Err(err) => return format!("[TOOL] Invalid placement: {err}"),
        };
        let checked = match parse_with_repair(block_spec) {
            Ok(checked) => checked,
            Err(err) => {
                return format!("[TOOL] Invalid block specification ({err}); received: {block_spec}");
            }
        };
        if checked.repaired {
            debug!(patched = %checked.text, "auto-repaired a missing closing parenthesis");
        }
        if let Some(Placement::Slot { slot }) = &placement {
            // One warning per interaction, then the swap disarms it and
            // the repeated request goes through.
            if self.slot_warning_armed.swap(false, Ordering::Relaxed) {
                return format!(
                    "[TOOL] Warning: creating into result slot {slot} replaces its current occupant; repeat the request to proceed"
                );
            }
        }
        let envelope = CommandEnvelope::Create {
            request_id: Uuid::new_v4().to_string(),
            block_spec: checked.text,
            placement,
        };
        match self.run_command(envelope).await {
            Ok(result) if result.success => match result.created_id {
                Some(block_id) => format!("[TOOL] Successfully created block: {block_id}"),
                None => "[TOOL] Successfully created block (id not reported)".to_string(),
            },
            Ok(result) => format!("[TOOL] Failed to create block: {}", error_text(&result)),
            Err(err) => failure_message(CommandKind::Create, &err),
        }
    }

    pub async fn create_variable(&self, variable_name: &str) -> String {
        let variable_name = variable_name.trim();
        if variable_name.is_empty() {
            return "[TOOL] Cannot create a variable without a name".to_string();
        }
        let envelope = CommandEnvelope::Variable {
            request_id: Uuid::new_v4().to_string(),
            variable_name: variable_name.to_string(),
        };
        match self.run_command(envelope).await {
            Ok(result) if result.success => {
                let name = result.created_id.as_deref().unwrap_or(variable_name);
                format!("[TOOL] Successfully created variable: {name}")
            }
            Ok(result) => format!(
                "[TOOL] Failed to create variable {variable_name}: {}",
                error_text(&result)
            ),
            Err(err) => failure_message(CommandKind::Variable, &err),
        }
    }

    /// Rewrites the workspace interface. Empty port lists are legal;
    /// that clears the corresponding side.
    pub async fn edit_interface(&self, inputs: Vec<PortSpec>, outputs: Vec<PortSpec>) -> String {
        let envelope = CommandEnvelope::Edit {
            request_id: Uuid::new_v4().to_string(),
            inputs,
            outputs,
        };
        match self.run_command(envelope).await {
            Ok(result) if result.success => {
                "[TOOL] Successfully updated the workspace interface".to_string()
            }
            Ok(result) => format!(
                "[TOOL] Failed to update the workspace interface: {}",
                error_text(&result)
            ),
            Err(err) => failure_message(CommandKind::Edit, &err),
        }
    }

    pub async fn replace_block(&self, block_id: &str, block_spec: &str) -> String {
        let block_id = block_id.trim();
        if block_id.is_empty() {
            return "[TOOL] Cannot replace a block without its id".to_string();
        }
        let block_spec = block_spec.trim();
        if block_spec.is_empty() {
            return "[TOOL] Cannot replace a block with an empty spec".to_string();
        }
        let checked = match parse_with_repair(block_spec) {
            Ok(checked) => checked,
            Err(err) => {
                return format!("[TOOL] Invalid block specification ({err}); received: {block_spec}");
            }
        };
        if checked.repaired {
            debug!(patched = %checked.text, "auto-repaired a missing closing parenthesis");
        }
        let envelope = CommandEnvelope::Replace {
            request_id: Uuid::new_v4().to_string(),
            block_id: block_id.to_string(),
            block_spec: checked.text,
        };
        match self.run_command(envelope).await {
            Ok(result) if result.success => {
                let replaced = result.created_id.as_deref().unwrap_or(block_id);
                format!("[TOOL] Successfully replaced block: {replaced}")
            }
            Ok(result) => format!(
                "[TOOL] Failed to replace block {block_id}: {}",
                error_text(&result)
            ),
            Err(err) => failure_message(CommandKind::Replace, &err),
        }
    }
}
