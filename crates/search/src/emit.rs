#![forbid(unsafe_code)]

use crate::args::RunArgs;
use crate::error::SearchError;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};

pub const RUNSET_SECTION: &str = "hyperparameter-runset";

/// YAML document `{hyperparameter-runset: {...}}` for one child run.
pub fn runset_yaml(args: &RunArgs) -> Result<String, SearchError> {
    let mut inner = Mapping::new();
    for (name, value) in args.iter() {
        inner.insert(YamlValue::String(name.to_string()), serde_yaml::to_value(value)?);
    }
    let mut doc = Mapping::new();
    doc.insert(YamlValue::String(RUNSET_SECTION.to_string()), YamlValue::Mapping(inner));
    Ok(serde_yaml::to_string(&doc)?)
}

/// Command-line text of one argument value.
pub fn render_arg_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// Insert `<prefix><name>=<value>` arguments into a command.
///
/// For `python[3] [flags] script.py ...` the arguments go right after the
/// script, ahead of any user overrides; likewise after the script name for
/// shell scripts. Anything else gets them appended.
pub fn insert_hparam_args(cmd_parts: &[String], prefix: &str, args: &RunArgs) -> Vec<String> {
    let rendered = args
        .iter()
        .map(|(name, value)| format!("{prefix}{name}={}", render_arg_value(value)));
    let at = insertion_index(cmd_parts);
    let mut out = Vec::with_capacity(cmd_parts.len() + args.len());
    out.extend_from_slice(&cmd_parts[..at]);
    out.extend(rendered);
    out.extend_from_slice(&cmd_parts[at..]);
    out
}

fn insertion_index(parts: &[String]) -> usize {
    let Some(first) = parts.first() else {
        return 0;
    };
    let program = base_name(first).to_ascii_lowercase();

    if program.starts_with("python") {
        return parts
            .iter()
            .position(|p| p.to_ascii_lowercase().ends_with(".py"))
            .map_or(parts.len(), |i| i + 1);
    }
    if is_script(&program) {
        return 1;
    }
    if matches!(program.as_str(), "bash" | "sh" | "zsh" | "cmd" | "cmd.exe") {
        if let Some(i) = parts
            .iter()
            .skip(1)
            .position(|p| is_script(&p.to_ascii_lowercase()))
        {
            return i + 2;
        }
    }
    parts.len()
}

fn is_script(name: &str) -> bool {
    [".sh", ".bat", ".cmd", ".ps1"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Split a command string into tokens, honouring single and double quotes.
pub fn split_cmd(cmd: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for ch in cmd.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    out.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if in_token {
        out.push(current);
    }
    out
}
