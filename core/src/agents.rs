//! Agent definitions: built-in CLI agents compiled in, custom agents persisted
//! in the store. A definition's `commandTemplate` carries a mandatory
//! `{{prompt}}` placeholder; `continueTemplate` resumes a previous
//! conversation after restart or revival.

use std::collections::HashMap;

use crate::db::{self, AgentRow, Db};
use crate::error::CoreError;

pub const PROMPT_PLACEHOLDER: &str = "{{prompt}}";

/// Fallback agent when a stored id is no longer registered.
pub const DEFAULT_AGENT_ID: &str = "claude-code-builtin";

/// Regex fragments the detector runs against the stripped stream tail.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPatterns {
    #[serde(default)]
    pub asking_patterns: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub command_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headless_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_built_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_patterns: Option<ActivityPatterns>,
}

impl AgentDefinition {
    pub fn asking_patterns(&self) -> Vec<String> {
        self.activity_patterns
            .as_ref()
            .map(|p| p.asking_patterns.clone())
            .unwrap_or_default()
    }

    /// Command line to run in the worker PTY. `continue_conversation` prefers
    /// the continue template; the prompt is single-quoted for the shell.
    pub fn render_command(&self, prompt: Option<&str>, continue_conversation: bool) -> String {
        if continue_conversation {
            if let Some(cont) = &self.continue_template {
                return cont.clone();
            }
        }
        let rendered = match prompt {
            Some(p) if !p.is_empty() => {
                let escaped = p.replace('\'', "'\"'\"'");
                self.command_template
                    .replace(PROMPT_PLACEHOLDER, &format!("'{escaped}'"))
            }
            _ => self.command_template.replace(PROMPT_PLACEHOLDER, ""),
        };
        rendered.trim().to_string()
    }

    fn from_row(row: AgentRow) -> Self {
        let activity_patterns = row
            .activity_patterns
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());
        Self {
            id: row.id,
            name: row.name,
            command_template: row.command_template,
            continue_template: row.continue_template,
            headless_template: row.headless_template,
            description: row.description,
            is_built_in: row.is_built_in,
            activity_patterns,
        }
    }
}

/// Everything a new custom agent needs; the rest is defaulted.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAgent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub continue_command: Option<String>,
    #[serde(default)]
    pub headless_command: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub activity_patterns: Option<ActivityPatterns>,
}

fn builtin_agents() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition {
            id: "claude-code-builtin".into(),
            name: "Claude Code".into(),
            command_template: "claude {{prompt}}".into(),
            continue_template: Some("claude --continue".into()),
            headless_template: Some("claude -p {{prompt}}".into()),
            description: Some("Anthropic Claude Code CLI".into()),
            is_built_in: true,
            activity_patterns: Some(ActivityPatterns {
                asking_patterns: vec![
                    r"Do you want".into(),
                    r"Would you like".into(),
                    r"\(y/n\)".into(),
                    r"❯\s+1\.\s+Yes".into(),
                ],
            }),
        },
        AgentDefinition {
            id: "gemini-builtin".into(),
            name: "Gemini CLI".into(),
            command_template: "gemini -i {{prompt}}".into(),
            continue_template: Some("gemini".into()),
            headless_template: Some("gemini -p {{prompt}}".into()),
            description: Some("Google Gemini CLI".into()),
            is_built_in: true,
            activity_patterns: Some(ActivityPatterns {
                asking_patterns: vec![r"Apply this change\?".into(), r"\(y/n\)".into()],
            }),
        },
        AgentDefinition {
            id: "codex-builtin".into(),
            name: "Codex".into(),
            command_template: "codex {{prompt}}".into(),
            continue_template: Some("codex resume --last".into()),
            headless_template: None,
            description: Some("OpenAI Codex CLI".into()),
            is_built_in: true,
            activity_patterns: Some(ActivityPatterns {
                asking_patterns: vec![r"Allow command\?".into(), r"\(y/n\)".into()],
            }),
        },
    ]
}

/// Registry over built-ins plus the custom agents in the store.
pub struct AgentRegistry {
    db: Db,
    builtins: HashMap<String, AgentDefinition>,
}

impl AgentRegistry {
    pub fn new(db: Db) -> Self {
        let builtins = builtin_agents()
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        Self { db, builtins }
    }

    pub fn get(&self, id: &str) -> Option<AgentDefinition> {
        if let Some(b) = self.builtins.get(id) {
            return Some(b.clone());
        }
        self.db
            .with(|c| db::get_agent(c, id))
            .ok()
            .flatten()
            .map(AgentDefinition::from_row)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Built-ins first, then custom agents by name.
    pub fn list(&self) -> Vec<AgentDefinition> {
        let mut out: Vec<AgentDefinition> = builtin_agents();
        if let Ok(rows) = self.db.with(db::list_agents) {
            out.extend(rows.into_iter().map(AgentDefinition::from_row));
        }
        out
    }

    /// Register a custom agent. The command must carry `{{prompt}}`.
    pub fn register(&self, new: NewAgent) -> Result<AgentDefinition, CoreError> {
        if new.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("agent name is required".into()));
        }
        if !new.command.contains(PROMPT_PLACEHOLDER) {
            return Err(CoreError::InvalidInput(format!(
                "command must contain the {PROMPT_PLACEHOLDER} placeholder"
            )));
        }
        let now = db::now_rfc3339();
        let row = AgentRow {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            command_template: new.command,
            continue_template: new.continue_command,
            headless_template: new.headless_command,
            description: new.description,
            is_built_in: false,
            activity_patterns: new
                .activity_patterns
                .as_ref()
                .map(|p| serde_json::to_string(p))
                .transpose()?,
            created_at: now.clone(),
            updated_at: now,
        };
        self.db.with(|c| db::insert_agent(c, &row))?;
        Ok(AgentDefinition::from_row(row))
    }

    /// Patch a custom agent. Built-ins cannot be updated.
    pub fn update(&self, id: &str, new: NewAgent) -> Result<Option<AgentDefinition>, CoreError> {
        if self.builtins.contains_key(id) {
            return Err(CoreError::InvalidInput(
                "built-in agents cannot be updated".into(),
            ));
        }
        if !new.command.contains(PROMPT_PLACEHOLDER) {
            return Err(CoreError::InvalidInput(format!(
                "command must contain the {PROMPT_PLACEHOLDER} placeholder"
            )));
        }
        let Some(existing) = self.db.with(|c| db::get_agent(c, id))? else {
            return Ok(None);
        };
        let row = AgentRow {
            id: id.to_string(),
            name: new.name,
            command_template: new.command,
            continue_template: new.continue_command,
            headless_template: new.headless_command,
            description: new.description,
            is_built_in: false,
            activity_patterns: new
                .activity_patterns
                .as_ref()
                .map(|p| serde_json::to_string(p))
                .transpose()?,
            created_at: existing.created_at,
            updated_at: db::now_rfc3339(),
        };
        self.db.with(|c| db::update_agent(c, &row))?;
        Ok(Some(AgentDefinition::from_row(row)))
    }

    /// Delete a custom agent. Deleting a built-in is a precondition violation.
    pub fn delete(&self, id: &str) -> Result<bool, CoreError> {
        if self.builtins.contains_key(id) {
            return Err(CoreError::InvalidInput(
                "built-in agents cannot be deleted".into(),
            ));
        }
        self.db.with(|c| db::delete_agent(c, id)).map_err(Into::into)
    }

    /// Resolve an effective agent id: the stored id if registered, else the
    /// repository default, else the built-in fallback. Logs when falling back.
    pub fn resolve_effective(
        &self,
        stored_id: &str,
        repository_default: Option<&str>,
    ) -> AgentDefinition {
        if let Some(def) = self.get(stored_id) {
            return def;
        }
        let fallback_id = repository_default
            .filter(|id| self.is_registered(id))
            .unwrap_or(DEFAULT_AGENT_ID);
        tracing::warn!(
            stored = %stored_id,
            fallback = %fallback_id,
            "stored agent id is no longer registered, falling back"
        );
        self.get(fallback_id)
            .unwrap_or_else(|| self.builtins[DEFAULT_AGENT_ID].clone())
    }
}
