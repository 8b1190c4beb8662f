//! Wire types shared by both halves of the bridge: command envelopes
//! pushed to the workspace client and result callbacks posted back.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The five command families a workspace client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Delete,
    Create,
    Variable,
    Edit,
    Replace,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Delete => "delete",
            CommandKind::Create => "create",
            CommandKind::Variable => "variable",
            CommandKind::Edit => "edit",
            CommandKind::Replace => "replace",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command as pushed over the stream. The `type` tag and field names
/// are the contract with the browser side; keep them stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandEnvelope {
    /// Remove a block; correlated by the id of the block being removed.
    Delete { block_id: String },
    /// Build a block tree from a spec string, optionally at a placement.
    Create {
        request_id: String,
        block_spec: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        placement: Option<Placement>,
    },
    /// Declare a workspace variable.
    Variable {
        request_id: String,
        variable_name: String,
    },
    /// Rewrite the workspace's input/output interface.
    Edit {
        request_id: String,
        inputs: Vec<PortSpec>,
        outputs: Vec<PortSpec>,
    },
    /// Swap an existing block for one built from a spec string.
    Replace {
        request_id: String,
        block_id: String,
        block_spec: String,
    },
}

impl CommandEnvelope {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandEnvelope::Delete { .. } => CommandKind::Delete,
            CommandEnvelope::Create { .. } => CommandKind::Create,
            CommandEnvelope::Variable { .. } => CommandKind::Variable,
            CommandEnvelope::Edit { .. } => CommandKind::Edit,
            CommandEnvelope::Replace { .. } => CommandKind::Replace,
        }
    }

    /// The id a result callback will echo. Deletions correlate on the
    /// target block id, everything else on the generated request id.
    pub fn correlation_key(&self) -> &str {
        match self {
            CommandEnvelope::Delete { block_id } => block_id,
            CommandEnvelope::Create { request_id, .. }
            | CommandEnvelope::Variable { request_id, .. }
            | CommandEnvelope::Edit { request_id, .. }
            | CommandEnvelope::Replace { request_id, .. } => request_id,
        }
    }

    pub fn delivery_key(&self) -> CorrelationKey {
        CorrelationKey {
            kind: self.kind(),
            key: self.correlation_key().to_string(),
        }
    }
}

/// Where a created block tree should land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Placement {
    /// A numbered result slot, e.g. `R3`. Placing here replaces the
    /// slot's current occupant.
    Slot { slot: String },
    /// Nested under an existing block, optionally into a named input.
    Under {
        parent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_name: Option<String>,
    },
}

/// One interface port for `edit` commands. The browser side calls the
/// type field `type` and assumes string-typed ports when omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_port_type")]
    pub port_type: String,
}

fn default_port_type() -> String {
    "string".to_string()
}

/// Kind plus correlation id. Two commands of different kinds may share
/// an id without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub kind: CommandKind,
    pub key: String,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// A normalized command outcome, ready for correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEnvelope {
    pub kind: CommandKind,
    pub key: String,
    pub success: bool,
    pub error: Option<String>,
    /// The id the workspace assigned to whatever the command created.
    pub created_id: Option<String>,
}

impl ResultEnvelope {
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            kind: self.kind,
            key: self.key.clone(),
        }
    }
}

/// The callback body the workspace client posts after executing a
/// command. Field usage varies by kind, so everything but `kind` is
/// optional here and checked in [`ResultCallback::into_envelope`].
#[derive(Debug, Clone, Deserialize)]
pub struct ResultCallback {
    pub kind: CommandKind,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub block_id: Option<String>,
    #[serde(default)]
    pub variable_id: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("{kind} callback is missing its '{field}' correlation id")]
    MissingKey {
        kind: CommandKind,
        field: &'static str,
    },
}

impl ResultCallback {
    /// Normalizes the wire shape into a [`ResultEnvelope`], enforcing the
    /// per-kind correlation field.
    pub fn into_envelope(self) -> Result<ResultEnvelope, CallbackError> {
        let kind = self.kind;
        let missing = |field| CallbackError::MissingKey { kind, field };
        let (key, created_id) = match kind {
            CommandKind::Delete => (self.block_id.ok_or(missing("block_id"))?, None),
            CommandKind::Create | CommandKind::Replace => {
                (self.request_id.ok_or(missing("request_id"))?, self.block_id)
            }
            CommandKind::Variable => (
                self.request_id.ok_or(missing("request_id"))?,
                self.variable_id,
            ),
            CommandKind::Edit => (self.request_id.ok_or(missing("request_id"))?, None),
        };
        Ok(ResultEnvelope {
            kind,
            key,
            success: self.success,
            error: self.error.filter(|message| !message.is_empty()),
            created_id: created_id.filter(|id| !id.is_empty()),
        })
    }
}
