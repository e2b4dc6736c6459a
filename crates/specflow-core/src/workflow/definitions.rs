//! Agent, gate and prompt definitions plus two-tier file lookup.
//!
//! Definitions are markdown files with YAML front matter; the body is the
//! prompt template.
//!
//! ```markdown
//! ---
//! name: security-reviewer
//! description: Reviews changes for security problems
//! tools: [Read, Grep, Glob]
//! model: opus
//! outputSchema: review-result
//! runCondition: changed-files-match
//! filePatterns: ["src/**/*.rs"]
//! ---
//! Review the changes in {{branch}} ...
//! ```
//!
//! Lookup checks `<project>/<kind>/` first and then `<builtin>/<kind>/`;
//! the first file found wins.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{DefinitionError, ValidationError};

/// The directories definitions live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Agent,
    Gate,
    Prompt,
    Schema,
}

impl DefinitionKind {
    pub const ALL: [DefinitionKind; 4] = [
        DefinitionKind::Agent,
        DefinitionKind::Gate,
        DefinitionKind::Prompt,
        DefinitionKind::Schema,
    ];

    pub fn dir(&self) -> &'static str {
        match self {
            DefinitionKind::Agent => "agents",
            DefinitionKind::Gate => "gates",
            DefinitionKind::Prompt => "prompts",
            DefinitionKind::Schema => "schemas",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DefinitionKind::Schema => "json",
            _ => "md",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DefinitionKind::Agent => "agent",
            DefinitionKind::Gate => "gate",
            DefinitionKind::Prompt => "prompt",
            DefinitionKind::Schema => "schema",
        }
    }
}

/// Which directory a definition was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Project,
    Builtin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Project => "project",
            Tier::Builtin => "builtin",
        }
    }
}

/// When a gate takes part in a gate-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunCondition {
    #[default]
    Always,
    ChangedFilesMatch,
    Manual,
}

impl RunCondition {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always" => Some(RunCondition::Always),
            "changed-files-match" => Some(RunCondition::ChangedFilesMatch),
            "manual" => Some(RunCondition::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    /// Allowed tools; empty means the agent's default set
    pub tools: Vec<String>,
    pub model: Option<String>,
    /// Name of a file under `schemas/`
    pub output_schema: Option<String>,
    /// Prompt template (the markdown body)
    pub prompt: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateDefinition {
    pub agent: AgentDefinition,
    pub run_condition: RunCondition,
    pub file_patterns: Vec<String>,
    pub enabled: bool,
}

impl GateDefinition {
    /// Wrap a plain agent so it can sit in a gate-group.
    pub fn from_agent(agent: AgentDefinition) -> Self {
        Self {
            agent,
            run_condition: RunCondition::Always,
            file_patterns: Vec::new(),
            enabled: true,
        }
    }

    /// Whether the gate runs for this change set. Without a known change set
    /// `changed-files-match` gates run.
    pub fn should_run(&self, changed_files: Option<&[String]>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.run_condition {
            RunCondition::Always => true,
            RunCondition::Manual => false,
            RunCondition::ChangedFilesMatch => {
                let Some(files) = changed_files else {
                    return true;
                };
                let patterns: Vec<glob::Pattern> = self
                    .file_patterns
                    .iter()
                    .filter_map(|p| match glob::Pattern::new(p) {
                        Ok(pattern) => Some(pattern),
                        Err(e) => {
                            tracing::warn!(
                                "[Definitions] Gate '{}' has invalid file pattern '{}': {}",
                                self.agent.name,
                                p,
                                e
                            );
                            None
                        }
                    })
                    .collect();
                files
                    .iter()
                    .any(|file| patterns.iter().any(|pattern| pattern.matches(file)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptDefinition {
    pub name: String,
    pub description: Option<String>,
    pub body: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontMatter {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
    model: Option<String>,
    output_schema: Option<String>,
    run_condition: Option<String>,
    #[serde(default)]
    file_patterns: Vec<String>,
    enabled: Option<bool>,
}

/// Split `---\n<yaml>\n---\n<body>`. `Ok(None)` when the file has no front
/// matter at all.
fn split_front_matter(content: &str) -> Result<Option<(&str, &str)>, ValidationError> {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return Ok(None);
    };
    let parts: Vec<&str> = rest.splitn(2, "\n---").collect();
    if parts.len() < 2 {
        return Err(ValidationError::new("frontMatter", "unterminated front matter"));
    }
    let body = parts[1]
        .split_once('\n')
        .map(|(_, body)| body)
        .unwrap_or("");
    Ok(Some((parts[0], body.trim())))
}

fn parse_front_matter(yaml: &str, path: &Path) -> Result<FrontMatter, DefinitionError> {
    if yaml.trim().is_empty() {
        return Ok(FrontMatter::default());
    }
    serde_yaml::from_str(yaml).map_err(|e| DefinitionError::Parse {
        path: path.display().to_string(),
        message: format!("front matter: {}", e),
    })
}

fn require(value: Option<String>, field: &str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::new(field, format!("'{}' is required", field))),
    }
}

fn read(path: &Path) -> Result<String, DefinitionError> {
    std::fs::read_to_string(path).map_err(|e| DefinitionError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn annotate(err: ValidationError, path: &Path) -> DefinitionError {
    DefinitionError::Invalid(ValidationError::new(
        format!("{}: {}", path.display(), err.path),
        err.message,
    ))
}

fn load_front_matter<'c>(content: &'c str, path: &Path) -> Result<(FrontMatter, &'c str), DefinitionError> {
    let (yaml, body) = split_front_matter(content)
        .map_err(|e| annotate(e, path))?
        .ok_or_else(|| annotate(ValidationError::new("frontMatter", "missing front matter"), path))?;
    Ok((parse_front_matter(yaml, path)?, body))
}

impl FrontMatter {
    /// Move the agent fields out, leaving gate-only keys behind.
    fn take_agent(&mut self, body: &str, path: &Path) -> Result<AgentDefinition, DefinitionError> {
        Ok(AgentDefinition {
            name: require(self.name.take(), "name").map_err(|e| annotate(e, path))?,
            description: require(self.description.take(), "description").map_err(|e| annotate(e, path))?,
            tools: std::mem::take(&mut self.tools),
            model: self.model.take(),
            output_schema: self.output_schema.take(),
            prompt: body.to_string(),
            path: path.to_path_buf(),
        })
    }
}

impl AgentDefinition {
    /// Gate-only keys (`runCondition`, `filePatterns`, `enabled`) are not
    /// interpreted here.
    pub fn parse(content: &str, path: &Path) -> Result<Self, DefinitionError> {
        let (mut fm, body) = load_front_matter(content, path)?;
        fm.take_agent(body, path)
    }

    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        Self::parse(&read(path)?, path)
    }
}

impl GateDefinition {
    pub fn parse(content: &str, path: &Path) -> Result<Self, DefinitionError> {
        let (mut fm, body) = load_front_matter(content, path)?;

        let run_condition = match fm.run_condition.as_deref() {
            None => RunCondition::Always,
            Some(s) => RunCondition::parse(s).ok_or_else(|| {
                annotate(
                    ValidationError::new(
                        "runCondition",
                        format!("unknown run condition '{}' (expected always, changed-files-match or manual)", s),
                    ),
                    path,
                )
            })?,
        };

        let agent = fm.take_agent(body, path)?;

        Ok(Self {
            agent,
            run_condition,
            file_patterns: fm.file_patterns,
            enabled: fm.enabled.unwrap_or(true),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        Self::parse(&read(path)?, path)
    }
}

impl PromptDefinition {
    /// Prompts may be bare markdown; front matter, when present, still needs
    /// a name.
    pub fn parse(content: &str, name: &str, path: &Path) -> Result<Self, DefinitionError> {
        match split_front_matter(content).map_err(|e| annotate(e, path))? {
            None => Ok(Self {
                name: name.to_string(),
                description: None,
                body: content.trim().to_string(),
                path: path.to_path_buf(),
            }),
            Some((yaml, body)) => {
                let fm = parse_front_matter(yaml, path)?;
                Ok(Self {
                    name: require(fm.name, "name").map_err(|e| annotate(e, path))?,
                    description: fm.description,
                    body: body.to_string(),
                    path: path.to_path_buf(),
                })
            }
        }
    }
}

/// One entry of [`DefinitionLocator::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListedDefinition {
    pub name: String,
    pub tier: Tier,
    pub path: PathBuf,
}

/// Resolves definition names against the project and builtin directories.
#[derive(Debug, Clone, Default)]
pub struct DefinitionLocator {
    pub project_dir: Option<PathBuf>,
    pub builtin_dir: Option<PathBuf>,
}

impl DefinitionLocator {
    pub fn new(project_dir: Option<PathBuf>, builtin_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            builtin_dir,
        }
    }

    fn tiers(&self) -> impl Iterator<Item = (Tier, &PathBuf)> {
        self.project_dir
            .iter()
            .map(|d| (Tier::Project, d))
            .chain(self.builtin_dir.iter().map(|d| (Tier::Builtin, d)))
    }

    fn check_name(kind: DefinitionKind, name: &str) -> Result<(), DefinitionError> {
        let bad = name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.split('.').any(|part| part.is_empty());
        if bad {
            return Err(DefinitionError::Invalid(ValidationError::new(
                kind.label(),
                format!("'{}' is not a valid definition name", name),
            )));
        }
        Ok(())
    }

    /// Find the file for `name`, project tier first.
    pub fn find(&self, kind: DefinitionKind, name: &str) -> Result<(PathBuf, Tier), DefinitionError> {
        Self::check_name(kind, name)?;
        let file = format!("{}.{}", name, kind.extension());
        let mut searched = Vec::new();
        for (tier, dir) in self.tiers() {
            let candidate = dir.join(kind.dir()).join(&file);
            if candidate.is_file() {
                tracing::debug!(
                    "[Definitions] {} '{}' resolved from {} tier: {}",
                    kind.label(),
                    name,
                    tier.as_str(),
                    candidate.display()
                );
                return Ok((candidate, tier));
            }
            searched.push(candidate.display().to_string());
        }
        Err(DefinitionError::NotFound {
            kind: kind.label(),
            name: name.to_string(),
            searched: if searched.is_empty() {
                "no definition directories configured".to_string()
            } else {
                searched.join(", ")
            },
        })
    }

    pub fn load_agent(&self, name: &str) -> Result<AgentDefinition, DefinitionError> {
        let (path, _) = self.find(DefinitionKind::Agent, name)?;
        AgentDefinition::from_file(&path)
    }

    /// Gates are looked up under `gates/` and then fall back to `agents/`.
    pub fn load_gate(&self, name: &str) -> Result<GateDefinition, DefinitionError> {
        match self.find(DefinitionKind::Gate, name) {
            Ok((path, _)) => GateDefinition::from_file(&path),
            Err(DefinitionError::NotFound { .. }) => {
                self.load_agent(name).map(GateDefinition::from_agent)
            }
            Err(e) => Err(e),
        }
    }

    pub fn load_prompt(&self, name: &str) -> Result<PromptDefinition, DefinitionError> {
        let (path, _) = self.find(DefinitionKind::Prompt, name)?;
        PromptDefinition::parse(&read(&path)?, name, &path)
    }

    pub fn load_schema(&self, name: &str) -> Result<Value, DefinitionError> {
        let (path, _) = self.find(DefinitionKind::Schema, name)?;
        serde_json::from_str(&read(&path)?).map_err(|e| DefinitionError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Every resolvable definition of `kind`, project overrides shadowing
    /// builtins, sorted by name.
    pub fn list(&self, kind: DefinitionKind) -> Vec<ListedDefinition> {
        let mut listed: Vec<ListedDefinition> = Vec::new();
        for (tier, dir) in self.tiers() {
            let base = glob::Pattern::escape(&dir.join(kind.dir()).to_string_lossy());
            let pattern = format!("{}/*.{}", base, kind.extension());
            let Ok(paths) = glob::glob(&pattern) else {
                continue;
            };
            for path in paths.flatten() {
                let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                    continue;
                };
                if listed.iter().any(|d| d.name == name) {
                    continue;
                }
                listed.push(ListedDefinition { name, tier, path });
            }
        }
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }
}
