//! Skill definitions: markdown files with YAML front matter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AgentFlowError, Result};

static FRONT_MATTER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)^---\n(.+?)\n---\n(.*)$").ok());

/// A skill loaded from a markdown file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Skill {
    /// Unique skill name.
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Markdown body after the front matter.
    #[serde(skip)]
    pub content: String,

    /// Path to the source file.
    #[serde(skip)]
    pub path: PathBuf,
}

impl Skill {
    /// Parse a skill from markdown with optional `---` delimited YAML front matter.
    /// Without front matter the whole text is the content and the name is `unnamed`.
    pub fn parse(text: &str) -> Result<Self> {
        let captures = FRONT_MATTER.as_ref().and_then(|re| re.captures(text));
        let Some(caps) = captures else {
            return Ok(Skill {
                name: "unnamed".into(),
                content: text.to_string(),
                ..Skill::default()
            });
        };

        let mut skill: Skill = serde_yaml::from_str(&caps[1])
            .map_err(|e| AgentFlowError::Config(format!("parse front matter: {e}")))?;
        skill.content = caps[2].trim().to_string();
        Ok(skill)
    }

    /// Load a skill from a markdown file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut skill = Self::parse(&text)?;
        skill.path = path.to_path_buf();
        Ok(skill)
    }
}

/// Lookup interface the agent uses to resolve skill names.
pub trait SkillSource: Send + Sync {
    fn get(&self, name: &str) -> Option<Skill>;
}

/// Registry of loaded skills.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load skills from each path. Directories contribute `*.md` files and
    /// `<subdir>/SKILL.md`; single `.md` files are loaded directly. Missing
    /// paths are skipped; unreadable or malformed skills are logged and skipped.
    pub fn load_from_paths(paths: &[PathBuf]) -> Self {
        let mut registry = Self::new();
        for path in paths {
            if path.is_dir() {
                registry.load_dir(path);
            } else if path.extension().is_some_and(|e| e == "md") && path.is_file() {
                registry.load_file(path);
            } else {
                debug!(path = %path.display(), "Skill path not found, skipping");
            }
        }
        info!(count = registry.skills.len(), "Skills loaded");
        registry
    }

    fn load_dir(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(%e, dir = %dir.display(), "Failed to read skills directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let nested = path.join("SKILL.md");
                if nested.is_file() {
                    self.load_file(&nested);
                }
            } else if path.extension().is_some_and(|e| e == "md") {
                self.load_file(&path);
            }
        }
    }

    fn load_file(&mut self, path: &Path) {
        match Skill::load_from_file(path) {
            Ok(skill) => {
                debug!(name = %skill.name, path = %path.display(), "Loaded skill");
                self.insert(skill);
            }
            Err(e) => warn!(%e, path = %path.display(), "Failed to load skill"),
        }
    }

    /// Add or replace a skill by name.
    pub fn insert(&mut self, skill: Skill) {
        self.skills.insert(skill.name.clone(), skill);
    }

    /// Sorted skill names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.skills.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn list(&self) -> Vec<&Skill> {
        self.skills.values().collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Skills whose name, description or tags contain any word of `description`.
    pub fn matching(&self, description: &str) -> Vec<&Skill> {
        let lowered = description.to_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();

        let mut matches: Vec<&Skill> = self
            .skills
            .values()
            .filter(|skill| {
                let haystack = format!(
                    "{} {} {}",
                    skill.name,
                    skill.description,
                    skill.tags.join(" ")
                )
                .to_lowercase();
                words.iter().any(|w| haystack.contains(w))
            })
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches
    }
}

impl SkillSource for SkillRegistry {
    fn get(&self, name: &str) -> Option<Skill> {
        self.skills.get(name).cloned()
    }
}
