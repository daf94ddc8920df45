//! Static prompt, skill and agent definitions served through
//! `prompts/*` and `resources/*`.
//!
//! Definitions come from configuration or from directories of Markdown
//! files (file stem = name, first non-empty line = description).

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

pub const SKILL_SCHEME: &str = "skill";
pub const AGENT_SCHEME: &str = "agent";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

/// An agent definition. Agents with a `command` can be run via `run_agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Entry in a `resources/list` response
#[derive(Debug, Clone, Serialize)]
pub struct ResourceEntry {
    pub uri: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "mimeType")]
    pub mime_type: &'static str,
}

/// Body of a `resources/read` response entry
#[derive(Debug, Clone, Serialize)]
pub struct ResourceContent {
    pub uri: String,
    #[serde(rename = "mimeType")]
    pub mime_type: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    Prompts,
    Skills,
    Agents,
}

#[derive(Debug, Clone, Default)]
pub struct Library {
    prompts: BTreeMap<String, PromptDef>,
    skills: BTreeMap<String, SkillDef>,
    agents: BTreeMap<String, AgentDef>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_prompt(&mut self, prompt: PromptDef) {
        self.prompts.insert(prompt.name.clone(), prompt);
    }

    pub fn add_skill(&mut self, skill: SkillDef) {
        self.skills.insert(skill.name.clone(), skill);
    }

    pub fn add_agent(&mut self, agent: AgentDef) {
        self.agents.insert(agent.name.clone(), agent);
    }

    /// Load every `*.md` file under `dir`. Returns how many were loaded.
    ///
    /// Entries already defined (e.g. from configuration) are kept.
    pub fn load_dir(&mut self, dir: &Path, kind: LibraryKind) -> std::io::Result<usize> {
        let mut loaded = 0;
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(std::io::Error::other)?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };

            let content = std::fs::read_to_string(path)?;
            let description = first_line(&content);
            let inserted = match kind {
                LibraryKind::Prompts => insert_missing(
                    &mut self.prompts,
                    PromptDef { name, description, content },
                    |p| &p.name,
                ),
                LibraryKind::Skills => insert_missing(
                    &mut self.skills,
                    SkillDef { name, description, content },
                    |s| &s.name,
                ),
                LibraryKind::Agents => insert_missing(
                    &mut self.agents,
                    AgentDef {
                        name,
                        description,
                        instructions: content,
                        command: None,
                        args: Vec::new(),
                    },
                    |a| &a.name,
                ),
            };
            if inserted {
                loaded += 1;
            }
        }

        tracing::debug!(dir = %dir.display(), kind = ?kind, loaded, "library directory scanned");
        Ok(loaded)
    }

    pub fn prompts(&self) -> impl Iterator<Item = &PromptDef> {
        self.prompts.values()
    }

    pub fn prompt(&self, name: &str) -> Option<&PromptDef> {
        self.prompts.get(name)
    }

    pub fn skills(&self) -> impl Iterator<Item = &SkillDef> {
        self.skills.values()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentDef> {
        self.agents.values()
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDef> {
        self.agents.get(name)
    }

    /// Skills and agents as `skill://<name>` / `agent://<name>` resources.
    pub fn resources(&self) -> Vec<ResourceEntry> {
        let skills = self.skills.values().map(|s| ResourceEntry {
            uri: format!("{}://{}", SKILL_SCHEME, s.name),
            name: s.name.clone(),
            description: s.description.clone(),
            mime_type: "text/markdown",
        });
        let agents = self.agents.values().map(|a| ResourceEntry {
            uri: format!("{}://{}", AGENT_SCHEME, a.name),
            name: a.name.clone(),
            description: a.description.clone(),
            mime_type: "text/markdown",
        });
        skills.chain(agents).collect()
    }

    pub fn read_resource(&self, uri: &str) -> HubResult<ResourceContent> {
        let not_found = || HubError::ResourceNotFound { uri: uri.to_string() };
        let (scheme, name) = uri.split_once("://").ok_or_else(not_found)?;

        let text = match scheme {
            SKILL_SCHEME => self.skills.get(name).map(|s| s.content.clone()),
            AGENT_SCHEME => self.agents.get(name).map(|a| a.instructions.clone()),
            _ => None,
        }
        .ok_or_else(not_found)?;

        Ok(ResourceContent {
            uri: uri.to_string(),
            mime_type: "text/markdown",
            text,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty() && self.skills.is_empty() && self.agents.is_empty()
    }
}

fn insert_missing<T>(map: &mut BTreeMap<String, T>, value: T, key: impl Fn(&T) -> &String) -> bool {
    let k = key(&value).clone();
    if map.contains_key(&k) {
        return false;
    }
    map.insert(k, value);
    true
}

fn first_line(content: &str) -> String {
    content
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}
