//! Secret and configuration token expansion for pipeline scripts.
//!
//! Given a string, [`SecretResolver::resolve`] expands every unescaped
//! `${PREFIX:KEY}` token into the result of the matching [`LookupProvider`],
//! recursively: inner tokens are expanded before the outer token that
//! contains them, and default values (`${PREFIX:KEY:-DEFAULT}`) are used
//! when a lookup fails. `^${...}` suppresses expansion and the escape
//! character is consumed on output.
//!
//! Resolution never raises: a token that cannot be resolved and carries no
//! default becomes an empty string, and the failure is recorded as a
//! [`Diagnostic`] on the returned [`ResolveOutcome`] so the caller can log
//! it without interrupting the pipeline.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Hard ceiling on the number of token substitutions a single `resolve`
/// call will perform, so a token that expands to itself (directly or
/// through a cycle of providers) cannot loop forever. The spec requires
/// at least 16; we allow a few passes of headroom for deeply nested,
/// non-cyclic input.
pub const MAX_SUBSTITUTIONS: usize = 64;

/// Why a single token failed to resolve to a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// The raw token text, e.g. `env:MISSING_VAR`.
    pub token: String,
    /// Human-readable reason the lookup failed.
    pub reason: String,
}

/// The result of expanding a string: the fully-substituted value, plus any
/// lookups that fell back to a default or an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// The expanded string.
    pub value: String,
    /// One entry per token that could not be resolved by its provider
    /// (whether or not it had a default to fall back on).
    pub diagnostics: Vec<Diagnostic>,
}

/// A named lookup function consulted by the resolver for one `PREFIX:`.
pub trait LookupProvider: Send + Sync {
    /// The provider's canonical name, used only for diagnostics.
    fn name(&self) -> &str;

    /// Resolve `key` to a value, or fail with a human-readable reason.
    fn lookup(&self, key: &str) -> Result<String, String>;
}

/// `env` — OS environment variable by name.
pub struct EnvProvider;

impl LookupProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        std::env::var(key).map_err(|_| format!("environment variable `{key}` is not set"))
    }
}

/// `sysProp` — process-level configuration property by name, backed by an
/// in-memory map the host installs at startup (the engine's analogue of
/// JVM system properties).
#[derive(Default)]
pub struct SysPropProvider {
    properties: HashMap<String, String>,
}

impl SysPropProvider {
    pub fn new(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }
}

impl LookupProvider for SysPropProvider {
    fn name(&self) -> &str {
        "sysProp"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        self.properties
            .get(key)
            .cloned()
            .ok_or_else(|| format!("system property `{key}` is not set"))
    }
}

/// `file` / `readFile` — UTF-8 file contents at the given path.
pub struct FileProvider;

impl LookupProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        fs::read_to_string(key).map_err(|e| format!("failed to read `{key}`: {e}"))
    }
}

/// `fileBase64` / `readFileBase64` — base64-encoded bytes of the file.
pub struct FileBase64Provider;

impl LookupProvider for FileBase64Provider {
    fn name(&self) -> &str {
        "fileBase64"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        let bytes = fs::read(key).map_err(|e| format!("failed to read `{key}`: {e}"))?;
        Ok(BASE64.encode(bytes))
    }
}

/// `base64` — base64-encode the key literal.
pub struct Base64EncodeProvider;

impl LookupProvider for Base64EncodeProvider {
    fn name(&self) -> &str {
        "base64"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        Ok(BASE64.encode(key.as_bytes()))
    }
}

/// `decodeBase64` — base64-decode the key.
pub struct Base64DecodeProvider;

impl LookupProvider for Base64DecodeProvider {
    fn name(&self) -> &str {
        "decodeBase64"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        let bytes = BASE64
            .decode(key)
            .map_err(|e| format!("`{key}` is not valid base64: {e}"))?;
        String::from_utf8(bytes).map_err(|e| format!("decoded bytes are not valid UTF-8: {e}"))
    }
}

/// `json` — parse `field:json-text`, return the primitive value of `field`.
pub struct JsonProvider;

impl LookupProvider for JsonProvider {
    fn name(&self) -> &str {
        "json"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        let (field, text) = key
            .split_once(':')
            .ok_or_else(|| "expected `field:json-text`".to_string())?;
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| format!("malformed json: {e}"))?;
        let field_value = value
            .get(field)
            .ok_or_else(|| format!("no field `{field}` in json value"))?;
        Ok(stringify_primitive(field_value))
    }
}

/// `yaml` — parse `field:path-to-yaml-file`, return the stringified value
/// of `field`.
pub struct YamlProvider;

impl LookupProvider for YamlProvider {
    fn name(&self) -> &str {
        "yaml"
    }

    fn lookup(&self, key: &str) -> Result<String, String> {
        let (field, path) = key
            .split_once(':')
            .ok_or_else(|| "expected `field:path-to-yaml-file`".to_string())?;
        let text = fs::read_to_string(path).map_err(|e| format!("failed to read `{path}`: {e}"))?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| format!("malformed yaml: {e}"))?;
        let field_value = value
            .get(field)
            .ok_or_else(|| format!("no field `{field}` in yaml document"))?;
        Ok(stringify_yaml_primitive(field_value))
    }
}

fn stringify_primitive(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn stringify_yaml_primitive(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

/// A token parsed out of a `${...}` body: `${PREFIX:KEY:-DEFAULT}`, where
/// `PREFIX` defaults to `env` when the body has no `:` outside the default
/// operator.
struct ParsedToken<'a> {
    prefix: &'a str,
    key: &'a str,
    default: Option<&'a str>,
}

fn parse_token(body: &str) -> ParsedToken<'_> {
    let (main, default) = match body.find(":-") {
        Some(idx) => (&body[..idx], Some(&body[idx + 2..])),
        None => (body, None),
    };

    match main.split_once(':') {
        Some((prefix, key)) => ParsedToken {
            prefix,
            key,
            default,
        },
        None => ParsedToken {
            prefix: "env",
            key: main,
            default,
        },
    }
}

/// Find the innermost complete `${...}` span in `s`, i.e. a pair with no
/// nested, complete token inside it. Returns the byte range `(open, close)`
/// of the `$` and the matching `}`, both inclusive.
fn find_innermost_token(s: &str) -> Option<(usize, usize)> {
    let bytes = s.as_bytes();
    let mut stack = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            stack.push(i);
            i += 2;
            continue;
        }
        if bytes[i] == b'}' {
            if let Some(open) = stack.pop() {
                return Some((open, i));
            }
        }
        i += 1;
    }
    None
}

/// Find the `}` matching the `${` that starts at `open`, counting nested
/// `${...}` pairs so the whole escaped block can be excised as one unit.
fn match_brace(s: &str, open: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut i = open;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
            continue;
        }
        if bytes[i] == b'}' {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
            i += 1;
            continue;
        }
        i += 1;
    }
    None
}

const ESCAPE_MARK_OPEN: char = '\u{E000}';
const ESCAPE_MARK_CLOSE: char = '\u{E001}';

/// Replace every `^${...}` with a private-use-area placeholder so the
/// expansion loop never touches it, and return the literal text (with the
/// caret consumed) to restore once expansion is done.
fn excise_escaped(input: &str) -> (String, Vec<String>) {
    let mut literals = Vec::new();
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'^'
            && i + 2 < bytes.len()
            && bytes[i + 1] == b'$'
            && bytes[i + 2] == b'{'
        {
            if let Some(close) = match_brace(input, i + 1) {
                let literal = &input[i + 1..=close];
                literals.push(literal.to_string());
                out.push(ESCAPE_MARK_OPEN);
                out.push_str(&(literals.len() - 1).to_string());
                out.push(ESCAPE_MARK_CLOSE);
                i = close + 1;
                continue;
            }
        }
        // Safe: we always advance by a full char boundary below.
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    (out, literals)
}

fn restore_escaped(input: &str, literals: &[String]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch == ESCAPE_MARK_OPEN {
            let mut digits = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d == ESCAPE_MARK_CLOSE {
                    chars.next();
                    break;
                }
                digits.push(d);
                chars.next();
            }
            if let Ok(idx) = digits.parse::<usize>() {
                if let Some(literal) = literals.get(idx) {
                    out.push_str(literal);
                    continue;
                }
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Expands `${PREFIX:KEY}`-style tokens against a set of registered
/// [`LookupProvider`]s.
pub struct SecretResolver {
    providers: HashMap<String, Arc<dyn LookupProvider>>,
}

impl SecretResolver {
    /// An empty resolver with no providers registered.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// A resolver with every built-in provider registered under its spec
    /// prefix (and aliases), ready to use.
    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        resolver.register("env", Arc::new(EnvProvider));
        resolver.register("sysprop", Arc::new(SysPropProvider::default()));
        resolver.register("file", Arc::new(FileProvider));
        resolver.register("readfile", Arc::new(FileProvider));
        resolver.register("filebase64", Arc::new(FileBase64Provider));
        resolver.register("readfilebase64", Arc::new(FileBase64Provider));
        resolver.register("base64", Arc::new(Base64EncodeProvider));
        resolver.register("decodebase64", Arc::new(Base64DecodeProvider));
        resolver.register("json", Arc::new(JsonProvider));
        resolver.register("yaml", Arc::new(YamlProvider));
        resolver
    }

    /// Register a provider for `prefix` (or replace the existing one;
    /// matching is case-insensitive, so callers should pass a lowercase
    /// prefix). Useful for tests and for the `sysProp` provider, which
    /// needs a concrete property map.
    pub fn register(&mut self, prefix: &str, provider: Arc<dyn LookupProvider>) {
        self.providers.insert(prefix.to_lowercase(), provider);
    }

    fn lookup(&self, prefix: &str, key: &str) -> Result<String, String> {
        match self.providers.get(&prefix.to_lowercase()) {
            Some(provider) => provider.lookup(key),
            None => Err(format!("no lookup provider registered for `{prefix}`")),
        }
    }

    /// Expand every unescaped `${...}` token in `input`, recursively.
    pub fn resolve(&self, input: &str) -> ResolveOutcome {
        let (mut working, literals) = excise_escaped(input);
        let mut diagnostics = Vec::new();

        for _ in 0..MAX_SUBSTITUTIONS {
            let Some((open, close)) = find_innermost_token(&working) else {
                break;
            };
            let body = &working[open + 2..close];
            let parsed = parse_token(body);

            let replacement = match self.lookup(parsed.prefix, parsed.key) {
                Ok(value) => value,
                Err(reason) => {
                    diagnostics.push(Diagnostic {
                        token: body.to_string(),
                        reason,
                    });
                    parsed.default.unwrap_or("").to_string()
                }
            };

            working.replace_range(open..=close, &replacement);
        }

        ResolveOutcome {
            value: restore_escaped(&working, &literals),
            diagnostics,
        }
    }
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix_is_env() {
        temp_env::with_var("PIPELINE_RESOLVER_TEST_TOKEN", Some("hello"), || {
            let resolver = SecretResolver::with_defaults();
            let outcome = resolver.resolve("value=${PIPELINE_RESOLVER_TEST_TOKEN}");
            assert_eq!(outcome.value, "value=hello");
            assert!(outcome.diagnostics.is_empty());
        });
    }

    #[test]
    fn explicit_env_prefix_is_case_insensitive() {
        temp_env::with_var("PIPELINE_RESOLVER_TEST_TOKEN2", Some("world"), || {
            let resolver = SecretResolver::with_defaults();
            let outcome = resolver.resolve("${ENV:PIPELINE_RESOLVER_TEST_TOKEN2}");
            assert_eq!(outcome.value, "world");
        });
    }

    #[test]
    fn missing_lookup_falls_back_to_default() {
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve("${env:DEFINITELY_NOT_SET:-fallback}");
        assert_eq!(outcome.value, "fallback");
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn missing_lookup_without_default_becomes_empty_and_logs() {
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve("x${env:DEFINITELY_NOT_SET}y");
        assert_eq!(outcome.value, "xy");
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn nested_tokens_resolve_inner_first() {
        temp_env::with_vars(
            [
                ("PIPELINE_RESOLVER_OUTER_KEY", Some("PIPELINE_RESOLVER_INNER")),
                ("PIPELINE_RESOLVER_INNER", Some("resolved")),
            ],
            || {
                let resolver = SecretResolver::with_defaults();
                let outcome =
                    resolver.resolve("${env:${env:PIPELINE_RESOLVER_OUTER_KEY}}");
                assert_eq!(outcome.value, "resolved");
            },
        );
    }

    #[test]
    fn escaped_token_is_left_literal_with_caret_consumed() {
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve("literal ^${env:NOT_EXPANDED} here");
        assert_eq!(outcome.value, "literal ${env:NOT_EXPANDED} here");
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn base64_round_trip() {
        let resolver = SecretResolver::with_defaults();
        let encoded = resolver.resolve("${base64:hello}");
        assert_eq!(encoded.value, "aGVsbG8=");
        let decoded = resolver.resolve("${decodeBase64:aGVsbG8=}");
        assert_eq!(decoded.value, "hello");
    }

    #[test]
    fn file_provider_reads_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.txt");
        std::fs::write(&path, "file-contents").unwrap();
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve(&format!("${{file:{}}}", path.display()));
        assert_eq!(outcome.value, "file-contents");
    }

    #[test]
    fn file_base64_provider_encodes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        std::fs::write(&path, b"hi").unwrap();
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve(&format!("${{fileBase64:{}}}", path.display()));
        assert_eq!(outcome.value, BASE64.encode(b"hi"));
    }

    #[test]
    fn json_provider_extracts_field() {
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve(r#"${json:token:{"token":"abc123"}}"#);
        assert_eq!(outcome.value, "abc123");
    }

    #[test]
    fn yaml_provider_extracts_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "token: abc123\n").unwrap();
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve(&format!("${{yaml:token:{}}}", path.display()));
        assert_eq!(outcome.value, "abc123");
    }

    #[test]
    fn sysprop_provider_looks_up_registered_property() {
        let mut properties = HashMap::new();
        properties.insert("build.number".to_string(), "42".to_string());
        let mut resolver = SecretResolver::new();
        resolver.register("sysprop", Arc::new(SysPropProvider::new(properties)));
        let outcome = resolver.resolve("${sysProp:build.number}");
        assert_eq!(outcome.value, "42");
    }

    #[test]
    fn unknown_prefix_is_a_lookup_failure_not_a_panic() {
        let resolver = SecretResolver::with_defaults();
        let outcome = resolver.resolve("${notaprovider:key}");
        assert_eq!(outcome.value, "");
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn self_referential_token_terminates_within_the_substitution_budget() {
        temp_env::with_var("PIPELINE_RESOLVER_CYCLE", Some("${env:PIPELINE_RESOLVER_CYCLE}"), || {
            let resolver = SecretResolver::with_defaults();
            let outcome = resolver.resolve("${env:PIPELINE_RESOLVER_CYCLE}");
            // Terminates instead of looping forever; the exact surviving
            // text isn't load-bearing, only that resolve() returns.
            let _ = outcome.value;
        });
    }

    #[test]
    fn key_may_itself_contain_colons() {
        temp_env::with_var("A:B", Some("weird-but-legal"), || {
            let resolver = SecretResolver::with_defaults();
            let outcome = resolver.resolve("${env:A:B}");
            assert_eq!(outcome.value, "weird-but-legal");
        });
    }
}
