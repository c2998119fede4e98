//! Prompt templates: `{variable}` substitution over commit data.
//!
//! `{{` and `}}` are literal braces. Any other brace must open or close a
//! placeholder naming one of the template's declared `variables`.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisMode, CommitRef};
use crate::error::TemplateError;

/// Variables filled from commit data. Declared names outside this set render empty.
pub const VARIABLES: &[&str] = &[
    "commit_hash",
    "commit_hash_full",
    "message",
    "author",
    "date",
    "files_changed",
    "changed_paths",
    "insertions",
    "deletions",
    "total_changes",
];

/// Paths beyond this many are summarized in `changed_paths`.
const MAX_LISTED_PATHS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PromptTemplate {
    pub name: String,
    pub mode: AnalysisMode,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Placeholders the body may use. Omitted in config means every commit variable.
    #[serde(default = "default_variables")]
    pub variables: Vec<String>,
    pub body: String,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_variables() -> Vec<String> {
    VARIABLES.iter().map(|v| v.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Brace(char),
    Var(&'a str),
}

/// Split a template into literal text and placeholders, collecting every problem.
fn parse<'a>(name: &str, body: &'a str, declared: &[String]) -> Result<Vec<Segment<'a>>, Vec<TemplateError>> {
    let bytes = body.as_bytes();
    let mut segments = Vec::new();
    let mut errors = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                segments.push(Segment::Text(&body[text_start..i]));
                segments.push(Segment::Brace('{'));
                i += 2;
                text_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                segments.push(Segment::Text(&body[text_start..i]));
                segments.push(Segment::Brace('}'));
                i += 2;
                text_start = i;
            }
            b'{' => {
                segments.push(Segment::Text(&body[text_start..i]));
                let close = body[i + 1..]
                    .find(['{', '}'])
                    .map(|rel| i + 1 + rel)
                    .filter(|&j| bytes[j] == b'}');
                let Some(j) = close else {
                    errors.push(TemplateError::UnbalancedBrace {
                        template: name.to_string(),
                        offset: i,
                    });
                    i += 1;
                    text_start = i;
                    continue;
                };
                let var = body[i + 1..j].trim();
                if var.is_empty() {
                    errors.push(TemplateError::EmptyPlaceholder {
                        template: name.to_string(),
                        offset: i,
                    });
                } else if !declared.iter().any(|d| d == var) {
                    errors.push(TemplateError::UndeclaredPlaceholder {
                        template: name.to_string(),
                        placeholder: var.to_string(),
                    });
                } else {
                    segments.push(Segment::Var(var));
                }
                i = j + 1;
                text_start = i;
            }
            b'}' => {
                errors.push(TemplateError::UnbalancedBrace {
                    template: name.to_string(),
                    offset: i,
                });
                i += 1;
                text_start = i;
            }
            _ => i += 1,
        }
    }
    segments.push(Segment::Text(&body[text_start..]));

    if errors.is_empty() {
        Ok(segments)
    } else {
        Err(errors)
    }
}

/// Check a template body without rendering it.
pub fn validate(template: &PromptTemplate) -> Result<(), Vec<TemplateError>> {
    parse(&template.name, &template.body, &template.variables).map(|_| ())
}

fn variable_value(var: &str, commit: &CommitRef) -> String {
    match var {
        "commit_hash" => commit.short_hash().to_string(),
        "commit_hash_full" => commit.hash.clone(),
        "message" => commit.message.clone(),
        "author" => commit.author.clone(),
        "date" => commit.timestamp.clone(),
        "files_changed" => commit.changed_paths.len().to_string(),
        "changed_paths" => list_paths(&commit.changed_paths),
        "insertions" => commit.insertions.to_string(),
        "deletions" => commit.deletions.to_string(),
        "total_changes" => commit.total_changes().to_string(),
        _ => String::new(),
    }
}

fn list_paths(paths: &[String]) -> String {
    let mut listed: Vec<&str> = paths.iter().take(MAX_LISTED_PATHS).map(String::as_str).collect();
    let rest = paths.len().saturating_sub(MAX_LISTED_PATHS);
    let more = format!("... and {rest} more");
    if rest > 0 {
        listed.push(&more);
    }
    listed.join("\n")
}

/// Built-in and user templates, keyed by name.
#[derive(Debug, Clone)]
pub struct PromptResolver {
    templates: BTreeMap<String, PromptTemplate>,
    rejected: Vec<(String, Vec<TemplateError>)>,
}

impl Default for PromptResolver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PromptResolver {
    /// Built-ins first, then user templates. A user template with a built-in's
    /// name replaces it; one that fails validation is kept out entirely.
    pub fn new(user_templates: Vec<PromptTemplate>) -> Self {
        let mut templates: BTreeMap<String, PromptTemplate> = builtin_templates()
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        let mut rejected = Vec::new();

        for template in user_templates {
            match validate(&template) {
                Ok(()) => {
                    if templates.contains_key(&template.name) {
                        tracing::info!(template = %template.name, "user template overrides built-in");
                    }
                    templates.insert(template.name.clone(), template);
                }
                Err(errors) => {
                    for e in &errors {
                        tracing::warn!("rejecting template: {e}");
                    }
                    rejected.push((template.name.clone(), errors));
                }
            }
        }

        Self {
            templates,
            rejected,
        }
    }

    /// Default template name for a provider-backed mode.
    pub fn default_for(mode: AnalysisMode) -> Option<&'static str> {
        match mode {
            AnalysisMode::Pattern => None,
            AnalysisMode::Brief => Some("brief_default"),
            AnalysisMode::Deep => Some("deep_default"),
        }
    }

    pub fn get(&self, name: &str) -> Result<&PromptTemplate, TemplateError> {
        self.templates.get(name).ok_or_else(|| {
            if self.rejected.iter().any(|(n, _)| n == name) {
                TemplateError::Rejected(name.to_string())
            } else {
                TemplateError::Unknown(name.to_string())
            }
        })
    }

    /// Template to use for `mode`: the requested one, or the mode default.
    /// A requested template written for another mode is refused.
    pub fn select(&self, mode: AnalysisMode, requested: Option<&str>) -> Result<&PromptTemplate, TemplateError> {
        let Some(name) = requested.or(Self::default_for(mode)) else {
            return Err(TemplateError::Unknown(format!("<no default for {mode}>")));
        };
        let template = self.get(name)?;
        if template.mode != mode {
            return Err(TemplateError::ModeMismatch {
                template: template.name.clone(),
                template_mode: template.mode,
                requested: mode,
            });
        }
        Ok(template)
    }

    pub fn render(&self, name: &str, commit: &CommitRef) -> Result<String, TemplateError> {
        let template = self.get(name)?;
        render_template(template, commit)
    }

    pub fn list(&self) -> Vec<&PromptTemplate> {
        self.templates.values().collect()
    }

    /// Template names grouped by category.
    pub fn categories(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for t in self.templates.values() {
            out.entry(t.category.clone()).or_default().push(t.name.clone());
        }
        out
    }

    pub fn rejected(&self) -> &[(String, Vec<TemplateError>)] {
        &self.rejected
    }
}

/// Render one template. Variables with empty values render as empty strings.
pub fn render_template(template: &PromptTemplate, commit: &CommitRef) -> Result<String, TemplateError> {
    let segments = parse(&template.name, &template.body, &template.variables)
        .map_err(|mut errors| errors.remove(0))?;
    let mut out = String::with_capacity(template.body.len() + commit.message.len());
    for segment in segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Brace(c) => out.push(c),
            Segment::Var(v) => out.push_str(&variable_value(v, commit)),
        }
    }
    Ok(out)
}

fn builtin(
    name: &str,
    mode: AnalysisMode,
    category: &str,
    description: &str,
    variables: &[&str],
    body: &str,
) -> PromptTemplate {
    PromptTemplate {
        name: name.to_string(),
        mode,
        category: category.to_string(),
        description: description.to_string(),
        variables: variables.iter().map(|v| v.to_string()).collect(),
        body: body.to_string(),
    }
}

const BRIEF_VARIABLES: &[&str] = &["commit_hash", "message", "files_changed", "insertions", "deletions"];

const DEEP_VARIABLES: &[&str] = &[
    "commit_hash_full",
    "author",
    "date",
    "message",
    "insertions",
    "deletions",
    "total_changes",
    "changed_paths",
];

const COMMIT_BLOCK: &str = "\
Commit: {commit_hash}
Message: {message}
Files changed: {files_changed}
Lines: +{insertions}, -{deletions}";

const DEEP_COMMIT_BLOCK: &str = "\
Commit: {commit_hash_full}
Author: {author}
Date: {date}
Message: {message}
Lines: +{insertions}, -{deletions} ({total_changes} total)
Files:
{changed_paths}";

const JSON_CONTRACT: &str = "\
Respond with a single JSON object with keys \"summary\" (one sentence), \
\"details\" (a paragraph), \"risks\" (array of strings) and \"recommendations\" \
(array of strings). Example: {{\"summary\": \"...\", \"risks\": []}}";

pub fn builtin_templates() -> Vec<PromptTemplate> {
    vec![
        builtin(
            "brief_default",
            AnalysisMode::Brief,
            "general",
            "One-sentence summary of the change",
            BRIEF_VARIABLES,
            &format!(
                "Analyze this git commit briefly.\n\n{COMMIT_BLOCK}\n\n\
                 Provide a concise one-line summary of what this commit does and why it matters."
            ),
        ),
        builtin(
            "brief_security",
            AnalysisMode::Brief,
            "security",
            "One-sentence security assessment",
            BRIEF_VARIABLES,
            &format!(
                "Analyze this git commit for security implications.\n\n{COMMIT_BLOCK}\n\n\
                 Focus on authentication, authorization, input validation, data exposure and \
                 cryptography. Answer in one sentence."
            ),
        ),
        builtin(
            "deep_default",
            AnalysisMode::Deep,
            "general",
            "Structured analysis with risks and recommendations",
            DEEP_VARIABLES,
            &format!(
                "Analyze this git commit in detail.\n\n{DEEP_COMMIT_BLOCK}\n\n{JSON_CONTRACT}"
            ),
        ),
        builtin(
            "deep_security_audit",
            AnalysisMode::Deep,
            "security",
            "Structured security audit of the change",
            DEEP_VARIABLES,
            &format!(
                "Perform a security audit of this git commit.\n\n{DEEP_COMMIT_BLOCK}\n\n\
                 Look for injection, broken access control, secret exposure, unsafe \
                 deserialization and weakened crypto. List every concrete risk.\n\n{JSON_CONTRACT}"
            ),
        ),
        builtin(
            "deep_code_review",
            AnalysisMode::Deep,
            "quality",
            "Structured code review of the change",
            DEEP_VARIABLES,
            &format!(
                "Review this git commit as a senior engineer.\n\n{DEEP_COMMIT_BLOCK}\n\n\
                 Consider correctness, maintainability, test coverage and API design.\n\n{JSON_CONTRACT}"
            ),
        ),
    ]
}
