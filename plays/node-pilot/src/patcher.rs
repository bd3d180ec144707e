//! Scoped `key = value` rewriting for the node's TOML config files.
//!
//! Only the value itself is replaced. Comments (inline ones included), blank
//! lines, ordering, spacing and line endings stay byte-identical. Values
//! spanning several lines (arrays, triple-quoted strings) are left alone.

use std::{fs, path::Path};

use crate::{
    config::{NodeConfig, PortLayout},
    NodeError, Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleValue {
    /// Rendered as a TOML basic string: `"value"`.
    Quoted(String),
    /// Rendered verbatim (numbers, booleans).
    Bare(String),
}

impl RuleValue {
    fn render(&self) -> String {
        match self {
            RuleValue::Quoted(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            RuleValue::Bare(s) => s.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    /// `None` matches the key in any section, including the root table.
    pub section: Option<String>,
    pub key: String,
    pub value: RuleValue,
}

impl Rule {
    pub fn quoted(section: Option<&str>, key: &str, value: impl Into<String>) -> Self {
        Self {
            section: section.map(String::from),
            key: key.to_string(),
            value: RuleValue::Quoted(value.into()),
        }
    }

    pub fn bare(section: Option<&str>, key: &str, value: impl ToString) -> Self {
        Self {
            section: section.map(String::from),
            key: key.to_string(),
            value: RuleValue::Bare(value.to_string()),
        }
    }

    fn matches(&self, section: &str, key: &str) -> bool {
        self.key == key && self.section.as_deref().is_none_or(|s| s == section)
    }
}

// ── Line scanning ──

enum Line<'a> {
    Section(&'a str),
    Pair { key: &'a str, value_start: usize },
    Other,
}

fn classify(body: &str) -> Line<'_> {
    let trimmed = body.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Other;
    }
    if trimmed.starts_with('[') {
        let name = trimmed.trim_start_matches('[');
        return match name.find(']') {
            Some(end) => Line::Section(name[..end].trim()),
            None => Line::Other,
        };
    }
    match body.find('=') {
        Some(eq) => {
            let key = body[..eq].trim();
            let after = &body[eq + 1..];
            let ws = after.len() - after.trim_start().len();
            Line::Pair {
                key,
                value_start: eq + 1 + ws,
            }
        }
        None => Line::Other,
    }
}

/// A value still open at the end of its first line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Open {
    /// Unclosed `[` nesting depth.
    Array(usize),
    /// `"""` or `'''`.
    Triple(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Extent {
    /// The value occupies this many bytes; whatever follows (spacing, a
    /// comment) belongs to the line, not the value.
    Closed(usize),
    Open(Open),
}

/// Byte length of the string starting at `s[0]`, closing quote included.
/// An unterminated string runs to the end of the line.
fn string_end(s: &str) -> usize {
    let bytes = s.as_bytes();
    let quote = bytes[0];
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote == b'"' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Track `[`/`]` nesting from `depth`. `Ok(end)` once it drops to zero,
/// `Err(depth)` if the line runs out first.
fn scan_array(s: &str, mut depth: usize) -> std::result::Result<usize, usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'#' => break,
            b'"' | b'\'' => {
                i += string_end(&s[i..]);
                continue;
            }
            b'[' => depth += 1,
            b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(depth)
}

fn value_extent(value: &str) -> Extent {
    for delim in ["\"\"\"", "'''"] {
        if let Some(inner) = value.strip_prefix(delim) {
            return match inner.find(delim) {
                Some(i) => Extent::Closed(delim.len() * 2 + i),
                None => Extent::Open(Open::Triple(delim)),
            };
        }
    }
    if value.starts_with('[') {
        return match scan_array(value, 0) {
            Ok(end) => Extent::Closed(end),
            Err(depth) => Extent::Open(Open::Array(depth)),
        };
    }
    if value.starts_with('"') || value.starts_with('\'') {
        return Extent::Closed(string_end(value));
    }
    let end = value.find('#').unwrap_or(value.len());
    Extent::Closed(value[..end].trim_end().len())
}

fn continue_open(open: Open, body: &str) -> Option<Open> {
    match open {
        Open::Triple(delim) => (!body.contains(delim)).then_some(open),
        Open::Array(depth) => scan_array(body, depth).err().map(Open::Array),
    }
}

enum Item<'a> {
    Pair {
        key: &'a str,
        value_start: usize,
        extent: Extent,
    },
    Passthrough,
}

/// Walks a file line by line, tracking the current section and stepping
/// over the continuation lines of multi-line values.
#[derive(Default)]
struct Scanner<'a> {
    section: &'a str,
    open: Option<Open>,
}

impl<'a> Scanner<'a> {
    fn line(&mut self, body: &'a str) -> Item<'a> {
        if let Some(open) = self.open {
            self.open = continue_open(open, body);
            return Item::Passthrough;
        }
        match classify(body) {
            Line::Section(name) => {
                self.section = name;
                Item::Passthrough
            }
            Line::Pair { key, value_start } => {
                let extent = value_extent(&body[value_start..]);
                if let Extent::Open(open) = extent {
                    self.open = Some(open);
                }
                Item::Pair {
                    key,
                    value_start,
                    extent,
                }
            }
            Line::Other => Item::Passthrough,
        }
    }
}

fn split_eol(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

// ── Rewriting ──

/// Apply every rule to `text`. Returns the rewritten text and the number of
/// lines whose content changed. Keys that never appear are skipped.
pub fn apply_rules(text: &str, rules: &[Rule]) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut scanner = Scanner::default();
    let mut changed = 0;

    for line in text.split_inclusive('\n') {
        let (body, eol) = split_eol(line);
        let Item::Pair {
            key,
            value_start,
            extent,
        } = scanner.line(body)
        else {
            out.push_str(line);
            continue;
        };
        let Some(rule) = rules.iter().rev().find(|r| r.matches(scanner.section, key)) else {
            out.push_str(line);
            continue;
        };
        match extent {
            Extent::Closed(len) => {
                let rewritten = format!(
                    "{}{}{}",
                    &body[..value_start],
                    rule.value.render(),
                    &body[value_start + len..]
                );
                if rewritten != body {
                    changed += 1;
                }
                out.push_str(&rewritten);
                out.push_str(eol);
            }
            Extent::Open(_) => {
                tracing::warn!(
                    "  {} in [{}] spans several lines; left unchanged",
                    key,
                    scanner.section
                );
                out.push_str(line);
            }
        }
    }
    (out, changed)
}

/// Read a single-line value as written in the file, with surrounding quotes
/// and any trailing comment removed.
pub fn read_value(text: &str, section: Option<&str>, key: &str) -> Option<String> {
    let mut scanner = Scanner::default();
    for line in text.lines() {
        if let Item::Pair {
            key: k,
            value_start,
            extent: Extent::Closed(len),
        } = scanner.line(line)
        {
            if k == key && section.is_none_or(|s| s == scanner.section) {
                let raw = &line[value_start..value_start + len];
                let raw = raw
                    .strip_prefix('"')
                    .and_then(|r| r.strip_suffix('"'))
                    .unwrap_or(raw);
                return Some(raw.to_string());
            }
        }
    }
    None
}

/// Rewrite `path` in place. When `backup_suffix` is set, the original is
/// first copied to `<path><suffix>`. Existing file permissions are kept.
pub fn patch_file(path: &Path, rules: &[Rule], backup_suffix: Option<&str>) -> Result<usize> {
    if !path.is_file() {
        return Err(NodeError::ConfigMissing {
            path: path.to_path_buf(),
        });
    }
    let original = fs::read_to_string(path)?;
    let (patched, changed) = apply_rules(&original, rules);
    if changed == 0 {
        tracing::debug!("{} already up to date", path.display());
        return Ok(0);
    }
    if let Some(suffix) = backup_suffix {
        let mut backup = path.as_os_str().to_owned();
        backup.push(suffix);
        fs::copy(path, &backup)?;
    }
    fs::write(path, patched)?;
    tracing::info!("  Patched {} ({} lines)", path.display(), changed);
    Ok(changed)
}

/// Rules for the consensus client's `config.toml`.
pub fn consensus_rules(
    cfg: &NodeConfig,
    moniker: &str,
    ports: &PortLayout,
    external_ip: Option<&str>,
) -> Vec<Rule> {
    let mut rules = vec![
        Rule::quoted(None, "moniker", moniker),
        Rule::quoted(None, "proxy_app", format!("tcp://127.0.0.1:{}", ports.proxy_app)),
        Rule::quoted(Some("rpc"), "laddr", format!("tcp://127.0.0.1:{}", ports.rpc)),
        Rule::quoted(Some("rpc"), "pprof_laddr", format!("localhost:{}", ports.pprof)),
        Rule::quoted(Some("p2p"), "laddr", format!("tcp://0.0.0.0:{}", ports.p2p)),
        Rule::quoted(Some("tx_index"), "indexer", &cfg.indexer),
        Rule::bare(Some("instrumentation"), "prometheus", cfg.prometheus),
        Rule::quoted(
            Some("instrumentation"),
            "prometheus_listen_addr",
            format!(":{}", ports.prometheus),
        ),
    ];
    if !cfg.seeds.is_empty() {
        rules.push(Rule::quoted(Some("p2p"), "seeds", &cfg.seeds));
    }
    if !cfg.persistent_peers.is_empty() {
        rules.push(Rule::quoted(Some("p2p"), "persistent_peers", &cfg.persistent_peers));
    }
    if let Some(ip) = external_ip {
        rules.push(Rule::quoted(
            Some("p2p"),
            "external_address",
            format!("{}:{}", ip, ports.p2p),
        ));
    }
    rules
}

/// Rules for the companion `app.toml`: the two API listener ports.
pub fn companion_rules(ports: &PortLayout) -> Vec<Rule> {
    vec![
        Rule::quoted(Some("api"), "address", format!("tcp://0.0.0.0:{}", ports.api)),
        Rule::quoted(Some("grpc"), "address", format!("0.0.0.0:{}", ports.grpc)),
    ]
}
