//! Proxy configuration rendering.
//!
//! Templates are plain text with `{{name}}` placeholders and exactly one
//! `{{#rules}} ... {{/rules}}` block repeated per enabled rule.
//!
//! Global placeholders: `generated_at`, `rule_count`.
//! Per-rule placeholders (inside the block only): `id`, `path`,
//! `target_host`, `target_port`, `description`, `health_check_path`.

use chrono::{DateTime, SecondsFormat, Utc};
use common::{Error, Result};
use rulestore::Rule;
use std::path::{Path, PathBuf};

const BLOCK_OPEN: &str = "#rules";
const BLOCK_CLOSE: &str = "/rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    GeneratedAt,
    RuleCount,
    Id,
    Path,
    TargetHost,
    TargetPort,
    Description,
    HealthCheckPath,
}

impl Field {
    fn parse(name: &str, in_block: bool) -> Option<Self> {
        let field = match name {
            "generated_at" => Field::GeneratedAt,
            "rule_count" => Field::RuleCount,
            "id" => Field::Id,
            "path" => Field::Path,
            "target_host" => Field::TargetHost,
            "target_port" => Field::TargetPort,
            "description" => Field::Description,
            "health_check_path" => Field::HealthCheckPath,
            _ => return None,
        };
        if !in_block && field.is_per_rule() {
            return None;
        }
        Some(field)
    }

    fn is_per_rule(self) -> bool {
        !matches!(self, Field::GeneratedAt | Field::RuleCount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(Field),
}

/// Parsed configuration template.
#[derive(Debug, Clone)]
pub struct Template {
    head: Vec<Segment>,
    block: Vec<Segment>,
    tail: Vec<Segment>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Head,
    Block,
    Tail,
}

impl Template {
    /// Load and parse a template file. A missing file is a `TemplateError`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::template(format!("cannot read template {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut head = Vec::new();
        let mut block = Vec::new();
        let mut tail = Vec::new();
        let mut section = Section::Head;
        let mut rest = text;

        loop {
            let Some(open) = rest.find("{{") else {
                push_text(current(section, &mut head, &mut block, &mut tail), rest);
                break;
            };
            push_text(
                current(section, &mut head, &mut block, &mut tail),
                &rest[..open],
            );

            let after_open = &rest[open + 2..];
            let close = after_open
                .find("}}")
                .ok_or_else(|| Error::template("unterminated placeholder"))?;
            let name = after_open[..close].trim();
            rest = &after_open[close + 2..];

            match name {
                BLOCK_OPEN => {
                    if section != Section::Head {
                        return Err(Error::template("only one {{#rules}} block is allowed"));
                    }
                    section = Section::Block;
                    rest = rest.strip_prefix('\n').unwrap_or(rest);
                }
                BLOCK_CLOSE => {
                    if section != Section::Block {
                        return Err(Error::template("{{/rules}} without matching {{#rules}}"));
                    }
                    section = Section::Tail;
                    rest = rest.strip_prefix('\n').unwrap_or(rest);
                }
                _ => {
                    let field = Field::parse(name, section == Section::Block).ok_or_else(|| {
                        Error::template(format!("unknown placeholder {{{{{name}}}}}"))
                    })?;
                    current(section, &mut head, &mut block, &mut tail)
                        .push(Segment::Field(field));
                }
            }
        }

        match section {
            Section::Head => Err(Error::template("template has no {{#rules}} block")),
            Section::Block => Err(Error::template("{{#rules}} block is not closed")),
            Section::Tail => Ok(Self { head, block, tail }),
        }
    }

    /// Substitute `rules` into the template. Output depends only on the
    /// arguments.
    pub fn render(&self, rules: &[Rule], generated_at: DateTime<Utc>) -> String {
        let stamp = generated_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let count = rules.len().to_string();
        let mut out = String::new();

        let globals = |out: &mut String, field: Field| match field {
            Field::GeneratedAt => out.push_str(&stamp),
            Field::RuleCount => out.push_str(&count),
            _ => {}
        };

        for seg in &self.head {
            match seg {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(field) => globals(&mut out, *field),
            }
        }

        for rule in rules {
            for seg in &self.block {
                match seg {
                    Segment::Text(text) => out.push_str(text),
                    Segment::Field(Field::Id) => out.push_str(&rule.id),
                    Segment::Field(Field::Path) => out.push_str(&rule.path),
                    Segment::Field(Field::TargetHost) => out.push_str(&rule.target_host),
                    Segment::Field(Field::TargetPort) => {
                        out.push_str(&rule.target_port.to_string())
                    }
                    Segment::Field(Field::Description) => {
                        if let Some(desc) = &rule.description {
                            out.push_str(&flatten(desc));
                        }
                    }
                    Segment::Field(Field::HealthCheckPath) => {
                        if let Some(hc) = &rule.health_check_path {
                            out.push_str(hc);
                        }
                    }
                    Segment::Field(field) => globals(&mut out, *field),
                }
            }
        }

        for seg in &self.tail {
            match seg {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(field) => globals(&mut out, *field),
            }
        }

        out
    }
}

fn current<'a>(
    section: Section,
    head: &'a mut Vec<Segment>,
    block: &'a mut Vec<Segment>,
    tail: &'a mut Vec<Segment>,
) -> &'a mut Vec<Segment> {
    match section {
        Section::Head => head,
        Section::Block => block,
        Section::Tail => tail,
    }
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
}

// Keep descriptions on one line so they cannot escape a comment.
fn flatten(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Rendered proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub text: String,
    pub generated_at: DateTime<Utc>,
    pub rule_count: usize,
}

/// Renders rules with the template at a fixed path.
///
/// The template is re-read on every call so edits take effect on the next
/// reconcile.
#[derive(Debug, Clone)]
pub struct Renderer {
    template_path: PathBuf,
}

impl Renderer {
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
        }
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    pub fn render(&self, rules: &[Rule]) -> Result<RenderedConfig> {
        let template = Template::load(&self.template_path)?;
        let generated_at = Utc::now();
        Ok(RenderedConfig {
            text: template.render(rules, generated_at),
            generated_at,
            rule_count: rules.len(),
        })
    }
}
