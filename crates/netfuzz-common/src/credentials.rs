//! openrc credential resolution.
//!
//! Control-plane clients read their connection parameters (`OS_AUTH_URL`,
//! `OS_USERNAME`, ...) from the environment. Operators keep them in a shell
//! `openrc` file, which we parse without running a shell:
//!
//! ```text
//! export OS_TENANT_NAME=admin
//! export OS_USERNAME="$OS_TENANT_NAME"   ; trailing statements are dropped
//! export OS_AUTH_URL=http://${OS_HOST}:5000/v2.0
//! ```
//!
//! Resolution is a pure function of the file contents plus an optional seed
//! environment (usually the process environment, so `PATH` survives into
//! children). File entries override seed entries.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read credentials file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: cannot split {text:?} into a key and a value")]
    MalformedLine { line: usize, text: String },
    #[error("{key} references undefined variable ${reference}")]
    UnresolvedReference { key: String, reference: String },
    #[error("{key} is part of a cyclic variable reference")]
    CyclicReference { key: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Credentials ─────────────────────────────────────────────────────

/// Fully resolved connection parameters.
///
/// Immutable once built; handed to every child process as its complete
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ── Resolver ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Single-quoted and seed values are taken verbatim.
    literal: bool,
}

/// Parses openrc files and resolves variable references.
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    seed: BTreeMap<String, String>,
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the resolver with entries that file lines may reference or override.
    pub fn with_seed<K, V>(mut self, seed: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.seed
            .extend(seed.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Seed with the current process environment.
    pub fn with_process_env(self) -> Self {
        self.with_seed(std::env::vars())
    }

    /// Read and resolve a credentials file.
    pub fn resolve(&self, path: &Path) -> Result<Credentials, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.resolve_str(&contents)
    }

    /// Resolve credentials from file contents already in memory.
    pub fn resolve_str(&self, contents: &str) -> Result<Credentials, ConfigError> {
        let mut entries: BTreeMap<String, Entry> = self
            .seed
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    Entry {
                        value: v.clone(),
                        literal: true,
                    },
                )
            })
            .collect();

        for (idx, raw) in contents.lines().enumerate() {
            if let Some((key, entry)) = parse_line(idx + 1, raw)? {
                entries.insert(key, entry);
            }
        }

        Ok(Credentials(expand_all(&entries)?))
    }
}

/// Parse one line into a key and an unresolved value.
///
/// Returns `Ok(None)` for blanks, comments, and lines without `=`.
fn parse_line(line: usize, raw: &str) -> Result<Option<(String, Entry)>, ConfigError> {
    let mut text = raw.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }
    if let Some(rest) = text.strip_prefix("export ") {
        text = rest.trim_start();
    }
    let text = strip_trailing_statement(text).trim();

    let Some((key, value)) = text.split_once('=') else {
        return Ok(None);
    };
    let key = key.trim();
    if !is_identifier(key) {
        return Err(ConfigError::MalformedLine {
            line,
            text: raw.trim().to_string(),
        });
    }

    let value = value.trim();
    let (value, literal) = unquote(value);
    Ok(Some((
        key.to_string(),
        Entry {
            value: value.to_string(),
            literal,
        },
    )))
}

/// Cut at the first `;` outside quotes.
fn strip_trailing_statement(text: &str) -> &str {
    let mut quote: Option<char> = None;
    for (pos, ch) in text.char_indices() {
        match (quote, ch) {
            (None, '"' | '\'') => quote = Some(ch),
            (Some(q), c) if c == q => quote = None,
            (None, ';') => return &text[..pos],
            _ => {}
        }
    }
    text
}

fn unquote(value: &str) -> (&str, bool) {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return (&value[1..value.len() - 1], first == b'\'');
        }
    }
    (value, false)
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A `$NAME` or `${NAME}` occurrence inside a value.
#[derive(Debug, PartialEq, Eq)]
struct Reference<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

fn find_references(value: &str) -> Vec<Reference<'_>> {
    let bytes = value.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i;
        if bytes.get(i + 1) == Some(&b'{') {
            if let Some(close) = value[i + 2..].find('}') {
                let name = &value[i + 2..i + 2 + close];
                if is_identifier(name) {
                    let end = i + 2 + close + 1;
                    refs.push(Reference { start, end, name });
                    i = end;
                    continue;
                }
            }
            i += 1;
            continue;
        }
        let name_len = value[i + 1..]
            .char_indices()
            .take_while(|(n, c)| {
                c.is_ascii_alphanumeric() && !(*n == 0 && c.is_ascii_digit()) || *c == '_'
            })
            .count();
        if name_len == 0 {
            i += 1;
            continue;
        }
        let end = i + 1 + name_len;
        refs.push(Reference {
            start,
            end,
            name: &value[i + 1..end],
        });
        i = end;
    }
    refs
}

/// Expand every value exactly once.
///
/// References are resolved recursively and memoized; the text a reference
/// expands to is never rescanned, so a `$` that arrives through a literal
/// value stays a `$`.
fn expand_all(entries: &BTreeMap<String, Entry>) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut resolved = BTreeMap::new();
    let mut in_progress = BTreeSet::new();
    for (key, entry) in entries {
        expand(key, entry, entries, &mut resolved, &mut in_progress)?;
    }
    Ok(resolved)
}

fn expand<'a>(
    key: &'a str,
    entry: &'a Entry,
    entries: &'a BTreeMap<String, Entry>,
    resolved: &mut BTreeMap<String, String>,
    in_progress: &mut BTreeSet<&'a str>,
) -> Result<String, ConfigError> {
    if let Some(value) = resolved.get(key) {
        return Ok(value.clone());
    }
    if entry.literal {
        resolved.insert(key.to_string(), entry.value.clone());
        return Ok(entry.value.clone());
    }

    in_progress.insert(key);
    let raw = entry.value.as_str();
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for r in find_references(raw) {
        let (name, target) = entries
            .get_key_value(r.name)
            .ok_or_else(|| ConfigError::UnresolvedReference {
                key: key.to_string(),
                reference: r.name.to_string(),
            })?;
        if in_progress.contains(name.as_str()) {
            return Err(ConfigError::CyclicReference { key: name.clone() });
        }
        let value = expand(name, target, entries, resolved, in_progress)?;
        out.push_str(&raw[last..r.start]);
        out.push_str(&value);
        last = r.end;
    }
    out.push_str(&raw[last..]);
    in_progress.remove(key);

    resolved.insert(key.to_string(), out.clone());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(contents: &str) -> Result<Credentials, ConfigError> {
        CredentialResolver::new().resolve_str(contents)
    }

    #[test]
    fn plain_values_are_unchanged() {
        let creds = resolve("A=1\nB=two\nC=http://host:5000/v2.0\n").unwrap();
        let expected: Credentials = [("A", "1"), ("B", "two"), ("C", "http://host:5000/v2.0")]
            .into_iter()
            .collect();
        assert_eq!(creds, expected);
    }

    #[test]
    fn simple_reference_resolves() {
        let creds = resolve("A=1\nB=$A\n").unwrap();
        assert_eq!(creds.get("A"), Some("1"));
        assert_eq!(creds.get("B"), Some("1"));
    }

    #[test]
    fn braced_and_embedded_references() {
        let creds = resolve(
            "export OS_HOST=10.1.1.1\n\
             export OS_AUTH_URL=\"http://${OS_HOST}:5000/v2.0\"\n\
             export OS_USERNAME=$OS_TENANT_NAME\n\
             export OS_TENANT_NAME=admin\n",
        )
        .unwrap();
        assert_eq!(creds.get("OS_AUTH_URL"), Some("http://10.1.1.1:5000/v2.0"));
        assert_eq!(creds.get("OS_USERNAME"), Some("admin"));
    }

    #[test]
    fn chained_references_resolve_in_any_order() {
        let creds = resolve("A=$B-x\nB=$C-y\nC=z\n").unwrap();
        assert_eq!(creds.get("A"), Some("z-y-x"));
    }

    #[test]
    fn cycle_is_config_error() {
        let err = resolve("A=$B\nB=$A\n").unwrap_err();
        assert!(matches!(err, ConfigError::CyclicReference { .. }), "{err}");
    }

    #[test]
    fn self_reference_is_config_error() {
        let err = resolve("A=x$A\n").unwrap_err();
        assert!(matches!(err, ConfigError::CyclicReference { ref key } if key == "A"));
    }

    #[test]
    fn undefined_reference_is_config_error() {
        let err = resolve("A=$MISSING\n").unwrap_err();
        match err {
            ConfigError::UnresolvedReference { key, reference } => {
                assert_eq!(key, "A");
                assert_eq!(reference, "MISSING");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn export_comments_and_statements_are_stripped() {
        let creds = resolve(
            "# openrc\n\
             \n\
             export OS_PASSWORD='se;cret'; echo done\n\
             OS_REGION=RegionOne ;\n\
             echo no assignment here\n",
        )
        .unwrap();
        assert_eq!(creds.get("OS_PASSWORD"), Some("se;cret"));
        assert_eq!(creds.get("OS_REGION"), Some("RegionOne"));
        assert_eq!(creds.len(), 2);
    }

    #[test]
    fn single_quoted_values_are_literal() {
        let creds = resolve("A=1\nB='$A'\n").unwrap();
        assert_eq!(creds.get("B"), Some("$A"));
    }

    #[test]
    fn bare_dollar_is_not_a_reference() {
        let creds = resolve("PRICE=5$\nP=a$1b\n").unwrap();
        assert_eq!(creds.get("PRICE"), Some("5$"));
        assert_eq!(creds.get("P"), Some("a$1b"));
    }

    #[test]
    fn malformed_key_is_config_error() {
        let err = resolve("A=1\nNOT A KEY=2\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedLine { line: 2, .. }), "{err}");
        assert!(resolve("=value\n").is_err());
    }

    #[test]
    fn seed_entries_are_referenced_and_overridden() {
        let creds = CredentialResolver::new()
            .with_seed([("PATH", "/usr/bin"), ("OS_REGION", "seeded"), ("HOME", "/root")])
            .resolve_str("OS_REGION=file\nOS_CACERT=$HOME/ca.pem\n")
            .unwrap();
        assert_eq!(creds.get("PATH"), Some("/usr/bin"));
        assert_eq!(creds.get("OS_REGION"), Some("file"));
        assert_eq!(creds.get("OS_CACERT"), Some("/root/ca.pem"));
    }

    #[test]
    fn seed_values_are_never_expanded() {
        let creds = CredentialResolver::new()
            .with_seed([("PS1", "$USER> ")])
            .resolve_str("")
            .unwrap();
        assert_eq!(creds.get("PS1"), Some("$USER> "));
    }

    #[test]
    fn dollar_copied_from_a_literal_is_not_expanded_again() {
        let creds = resolve("OS_PASSWORD='pa$$word'\nOS_PW_COPY=$OS_PASSWORD\n").unwrap();
        assert_eq!(creds.get("OS_PASSWORD"), Some("pa$$word"));
        assert_eq!(creds.get("OS_PW_COPY"), Some("pa$$word"));

        // The copied text names its own source key; still not a cycle.
        let creds = resolve("A='$A'\nB=$A\n").unwrap();
        assert_eq!(creds.get("B"), Some("$A"));
    }

    #[test]
    fn dollar_copied_from_a_seed_is_not_expanded_again() {
        let creds = CredentialResolver::new()
            .with_seed([("PROMPT", "$HOSTNAME> ")])
            .resolve_str("MY_PROMPT=$PROMPT\n")
            .unwrap();
        assert_eq!(creds.get("MY_PROMPT"), Some("$HOSTNAME> "));
    }

    #[test]
    fn shared_references_expand_once_each() {
        let creds = resolve("HOST=h\nA=$HOST:1\nB=$HOST:2\nC=$A,$B\n").unwrap();
        assert_eq!(creds.get("C"), Some("h:1,h:2"));
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let err = CredentialResolver::new()
            .resolve(Path::new("/nonexistent/netfuzz/openrc"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn reference_scanner_handles_both_syntaxes() {
        let refs = find_references("${A}-$B_1/${not valid}$");
        let names: Vec<&str> = refs.iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["A", "B_1"]);
    }
}
