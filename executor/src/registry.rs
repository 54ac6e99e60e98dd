//! The table of supported languages.
//!
//! The registry is built once at startup and is immutable afterwards; lookups
//! need no locking. Every command template is parsed while building it, so a
//! template that could leave a placeholder unresolved never makes it past
//! startup.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    err::{ConfigurationError, ValidationError},
    runner::model::{SCRATCH_MOUNT, SOURCE_MOUNT},
};

/// Values a command template can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// `{filename}`: the submitted file name, e.g. `Main.java`.
    Filename,
    /// `{classname}`: the file name without its extension, e.g. `Main`.
    ClassName,
    /// `{time_limit}`: the time limit in whole seconds.
    TimeLimit,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Placeholder> {
        match name {
            "filename" => Some(Placeholder::Filename),
            "classname" => Some(Placeholder::ClassName),
            "time_limit" => Some(Placeholder::TimeLimit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Concrete values for one run. Callers must have validated `filename` and
/// `classname` against the allow-lists in [`crate::util::path_security`];
/// they are inserted into a shell command verbatim.
#[derive(Debug, Clone, Copy)]
pub struct TemplateArgs<'a> {
    pub filename: &'a str,
    pub classname: &'a str,
    pub time_limit_secs: u64,
}

/// A shell command with `{placeholder}`s. `{{` and `}}` stand for literal
/// braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn parse(language: &str, raw: &str) -> Result<Self, ConfigurationError> {
        let unbalanced = || ConfigurationError::UnbalancedBraces {
            language: language.to_owned(),
        };

        let mut segments = vec![];
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(unbalanced()),
                            Some(c) => name.push(c),
                        }
                    }
                    let placeholder = Placeholder::from_name(&name).ok_or_else(|| {
                        ConfigurationError::UnknownPlaceholder {
                            language: language.to_owned(),
                            placeholder: name.clone(),
                        }
                    })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(placeholder));
                }
                '}' => return Err(unbalanced()),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if segments.is_empty() || raw.trim().is_empty() {
            return Err(ConfigurationError::InvalidProfile {
                language: language.to_owned(),
                reason: "command template is empty".into(),
            });
        }

        Ok(CommandTemplate {
            raw: raw.to_owned(),
            segments,
        })
    }

    /// Whether this template refers to `placeholder` anywhere.
    pub fn uses(&self, placeholder: Placeholder) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(p) if *p == placeholder))
    }

    pub fn resolve(&self, args: &TemplateArgs) -> String {
        let mut out = String::with_capacity(self.raw.len() + args.filename.len() * 2);
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Placeholder(Placeholder::Filename) => out.push_str(args.filename),
                Segment::Placeholder(Placeholder::ClassName) => out.push_str(args.classname),
                Segment::Placeholder(Placeholder::TimeLimit) => {
                    out.push_str(&args.time_limit_secs.to_string())
                }
            }
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A language profile as written in the configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfileConfig {
    pub id: String,
    /// Image reference, e.g. `python:3.9`.
    pub image: String,
    /// Required file extension including the leading dot, e.g. `.py`.
    pub extension: String,
    /// Command template, run with `sh -c` inside the container.
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub id: String,
    pub image: String,
    pub extension: String,
    pub command: CommandTemplate,
}

impl LanguageProfile {
    pub fn from_config(cfg: &LanguageProfileConfig) -> Result<Self, ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidProfile {
            language: cfg.id.clone(),
            reason: reason.to_owned(),
        };

        if cfg.id.trim().is_empty() {
            return Err(invalid("language id is empty"));
        }
        if cfg.image.trim().is_empty() || cfg.image.chars().any(char::is_whitespace) {
            return Err(invalid("image reference is empty or contains whitespace"));
        }
        let ext_body = cfg.extension.strip_prefix('.').unwrap_or("");
        if ext_body.is_empty() || !ext_body.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid(
                "extension must be a dot followed by ASCII letters or digits",
            ));
        }

        Ok(LanguageProfile {
            id: cfg.id.clone(),
            image: cfg.image.clone(),
            extension: cfg.extension.clone(),
            command: CommandTemplate::parse(&cfg.id, &cfg.command)?,
        })
    }

    /// Whether the run command needs a class name derived from the file name.
    pub fn needs_class_name(&self) -> bool {
        self.command.uses(Placeholder::ClassName)
    }
}

/// The default language table.
pub fn builtin_profiles() -> Vec<LanguageProfileConfig> {
    let profile = |id: &str, image: &str, extension: &str, command: String| {
        LanguageProfileConfig {
            id: id.into(),
            image: image.into(),
            extension: extension.into(),
            command,
        }
    };
    vec![
        profile(
            "python",
            "python:3.9",
            ".py",
            format!("python3 {}/{{filename}}", SOURCE_MOUNT),
        ),
        profile(
            "cpp",
            "gcc:latest",
            ".cpp",
            format!(
                "g++ -O2 -o {scratch}/a.out {src}/{{filename}} && {scratch}/a.out",
                scratch = SCRATCH_MOUNT,
                src = SOURCE_MOUNT
            ),
        ),
        profile(
            "java",
            "openjdk:17",
            ".java",
            format!(
                "javac -d {scratch} {src}/{{filename}} && java -cp {scratch} {{classname}}",
                scratch = SCRATCH_MOUNT,
                src = SOURCE_MOUNT
            ),
        ),
        profile(
            "javascript",
            "node:22",
            ".js",
            format!("node {}/{{filename}}", SOURCE_MOUNT),
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: Arc<HashMap<String, Arc<LanguageProfile>>>,
}

impl LanguageRegistry {
    pub fn from_profiles(
        profiles: impl IntoIterator<Item = LanguageProfileConfig>,
    ) -> Result<Self, ConfigurationError> {
        let mut map = HashMap::new();
        for cfg in profiles {
            let profile = LanguageProfile::from_config(&cfg)?;
            if map.contains_key(&profile.id) {
                return Err(ConfigurationError::DuplicateLanguage(profile.id));
            }
            map.insert(profile.id.clone(), Arc::new(profile));
        }
        if map.is_empty() {
            return Err(ConfigurationError::InvalidProfile {
                language: String::new(),
                reason: "no language is configured".into(),
            });
        }
        tracing::debug!(languages = map.len(), "Language registry built");
        Ok(LanguageRegistry {
            profiles: Arc::new(map),
        })
    }

    /// The registry holding [`builtin_profiles`].
    pub fn builtin() -> Self {
        // The builtin table is covered by `test_builtin_registry`.
        Self::from_profiles(builtin_profiles()).expect("builtin language table is invalid")
    }

    pub fn lookup(&self, language: &str) -> Result<Arc<LanguageProfile>, ValidationError> {
        self.profiles
            .get(language)
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedLanguage(language.to_owned()))
    }

    /// All profiles, ordered by language id.
    pub fn profiles(&self) -> Vec<Arc<LanguageProfile>> {
        let mut res: Vec<_> = self.profiles.values().cloned().collect();
        res.sort_by(|a, b| a.id.cmp(&b.id));
        res
    }
}
