use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use toml_edit::ArrayOfTables;
use toml_edit::DocumentMut;
use toml_edit::Item as TomlItem;
use toml_edit::Table as TomlTable;
use toml_edit::value;

use crate::atomic_write::write_atomic_text;

/// A persisted tool rule, as stored in `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRule {
    pub tool_name: String,
    pub action: String,
    pub added_by: String,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Project-scoped config: `{projectDir}/.athena/config.toml`.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(".athena").join("config.toml"))
    }

    /// Operator-global config: `~/.athena/config.toml`.
    pub fn global() -> anyhow::Result<Self> {
        let Some(home) = dirs::home_dir() else {
            anyhow::bail!("cannot determine home directory for config path");
        };
        Ok(Self::new(home.join(".athena").join("config.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read persisted `[[rules]]`, in file order.
    ///
    /// Invalid TOML degrades to an empty list rather than blocking startup;
    /// appends still go through the text fallback so nothing is clobbered.
    pub fn load_rules(&self) -> anyhow::Result<Vec<StoredRule>> {
        let Some(content) = read_document_string(&self.path)? else {
            return Ok(Vec::new());
        };

        let doc = match content.parse::<DocumentMut>() {
            Ok(doc) => doc,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "invalid config.toml, ignoring rules: {err}");
                return Ok(Vec::new());
            }
        };

        Ok(read_rules(&doc))
    }

    /// Append one rule, preserving comments and unrelated keys.
    pub fn append_rule(&self, rule: &StoredRule) -> anyhow::Result<()> {
        let content = match read_document_string(&self.path) {
            Ok(Some(existing)) => existing,
            Ok(None) => String::new(),
            Err(err) => {
                // If we can't read the existing file, avoid clobbering it.
                return Err(err);
            }
        };

        let updated = match content.parse::<DocumentMut>() {
            Ok(mut doc) => {
                append_rule_to_doc(&mut doc, rule);
                doc.to_string()
            }
            Err(_) => append_rule_fallback(&content, rule),
        };

        write_atomic_text(&self.path, &updated)
    }

    /// Whether an equivalent rule is already persisted.
    pub fn contains_rule(&self, rule: &StoredRule) -> anyhow::Result<bool> {
        Ok(self
            .load_rules()?
            .iter()
            .any(|existing| existing.tool_name == rule.tool_name && existing.action == rule.action))
    }
}

fn read_rules(doc: &DocumentMut) -> Vec<StoredRule> {
    let Some(array) = doc.get("rules").and_then(TomlItem::as_array_of_tables) else {
        return Vec::new();
    };

    array
        .iter()
        .filter_map(|table| {
            let tool_name = table.get("tool_name")?.as_str()?;
            let action = table.get("action")?.as_str()?;
            if tool_name.is_empty() || !matches!(action, "approve" | "deny") {
                return None;
            }
            Some(StoredRule {
                tool_name: tool_name.to_string(),
                action: action.to_string(),
                added_by: table
                    .get("added_by")
                    .and_then(TomlItem::as_str)
                    .unwrap_or("config")
                    .to_string(),
            })
        })
        .collect()
}

fn append_rule_to_doc(doc: &mut DocumentMut, rule: &StoredRule) {
    if doc
        .get("rules")
        .and_then(TomlItem::as_array_of_tables)
        .is_none()
    {
        doc["rules"] = TomlItem::ArrayOfTables(ArrayOfTables::new());
    }

    let mut table = TomlTable::new();
    table["tool_name"] = value(&rule.tool_name);
    table["action"] = value(&rule.action);
    table["added_by"] = value(&rule.added_by);

    match &mut doc["rules"] {
        TomlItem::ArrayOfTables(array) => array.push(table),
        _ => unreachable!("expected `rules` to be an array of tables"),
    }
}

fn append_rule_fallback(existing: &str, rule: &StoredRule) -> String {
    let mut out = existing.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str("[[rules]]\n");
    out.push_str(&format!("tool_name = {:?}\n", rule.tool_name));
    out.push_str(&format!("action = {:?}\n", rule.action));
    out.push_str(&format!("added_by = {:?}\n", rule.added_by));
    out
}

fn read_document_string(path: &Path) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow::Error::new(err).context("read config.toml")),
    }
}
