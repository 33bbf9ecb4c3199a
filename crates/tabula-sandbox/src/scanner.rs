//! Static threat scanning of plugin source text.
//!
//! The scanner runs line-by-line regex rules over whatever source text a
//! plugin ships. It is a pre-load gate, independent of how the code is
//! later executed. Only [`Severity::Critical`] findings make a report
//! unsafe; lower severities are surfaced for audit and logging.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tabula_audit::Severity;
use tracing::warn;

use crate::error::{SandboxError, SandboxResult};

/// Broad class of a threat rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    /// Spawning subprocesses or shell commands.
    Subprocess,
    /// Evaluating strings as code.
    DynamicEval,
    /// Touching the host process (exit, env, native bindings).
    ProcessAccess,
    /// Raw filesystem access.
    Filesystem,
    /// Prototype pollution.
    PrototypePollution,
    /// Loading modules from computed specifiers.
    DynamicImport,
    /// Direct network primitives that bypass metered host calls.
    Network,
    /// Host-supplied rule.
    Custom,
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subprocess => "subprocess",
            Self::DynamicEval => "dynamic_eval",
            Self::ProcessAccess => "process_access",
            Self::Filesystem => "filesystem",
            Self::PrototypePollution => "prototype_pollution",
            Self::DynamicImport => "dynamic_import",
            Self::Network => "network",
            Self::Custom => "custom",
        })
    }
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threat {
    /// Identifier of the rule that fired.
    pub rule: String,
    /// Category of the rule.
    pub category: ThreatCategory,
    /// Severity of the rule.
    pub severity: Severity,
    /// 1-based line number.
    pub line: usize,
    /// Trimmed excerpt of the offending line.
    pub snippet: String,
}

/// Result of scanning one source text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// False when any critical threat was found.
    pub safe: bool,
    /// All findings, in source order.
    pub threats: Vec<Threat>,
    /// Highest severity found.
    pub highest: Option<Severity>,
}

impl ScanReport {
    fn from_threats(threats: Vec<Threat>) -> Self {
        let highest = threats.iter().map(|t| t.severity).max();
        Self {
            safe: !highest.is_some_and(Severity::is_blocking),
            threats,
            highest,
        }
    }

    /// The findings that block execution.
    #[must_use]
    pub fn blocking(&self) -> Vec<Threat> {
        self.threats
            .iter()
            .filter(|t| t.severity.is_blocking())
            .cloned()
            .collect()
    }
}

const MAX_SNIPPET_CHARS: usize = 120;

struct Rule {
    id: String,
    category: ThreatCategory,
    severity: Severity,
    regex: Regex,
}

/// (id, category, severity, pattern)
const BUILTIN_RULES: &[(&str, ThreatCategory, Severity, &str)] = &[
    (
        "child-process-module",
        ThreatCategory::Subprocess,
        Severity::Critical,
        r"\bchild_process\b",
    ),
    (
        "spawn-call",
        ThreatCategory::Subprocess,
        Severity::Critical,
        r"\b(?:spawn|spawnSync|execSync|execFile|execFileSync)\s*\(",
    ),
    (
        "python-subprocess",
        ThreatCategory::Subprocess,
        Severity::Critical,
        r"\bsubprocess\.(?:run|call|Popen|check_output|check_call)\b",
    ),
    (
        "os-system",
        ThreatCategory::Subprocess,
        Severity::Critical,
        r"\bos\.(?:system|popen|execv\w*|spawn\w*)\s*\(",
    ),
    (
        "eval-call",
        ThreatCategory::DynamicEval,
        Severity::Critical,
        r"\beval\s*\(",
    ),
    (
        "function-constructor",
        ThreatCategory::DynamicEval,
        Severity::Critical,
        r"\bnew\s+Function\s*\(",
    ),
    (
        "string-timer",
        ThreatCategory::DynamicEval,
        Severity::Critical,
        r#"\b(?:setTimeout|setInterval)\s*\(\s*['"`]"#,
    ),
    (
        "vm-module",
        ThreatCategory::DynamicEval,
        Severity::Critical,
        r"\bvm\.(?:runIn\w+|Script|compileFunction)\b",
    ),
    (
        "process-control",
        ThreatCategory::ProcessAccess,
        Severity::High,
        r"\bprocess\.(?:exit|kill|abort|binding|dlopen|env|mainModule)\b",
    ),
    (
        "fs-module",
        ThreatCategory::Filesystem,
        Severity::High,
        r#"(?:require\s*\(\s*|from\s+)['"](?:node:)?fs(?:/promises)?['"]"#,
    ),
    (
        "fs-call",
        ThreatCategory::Filesystem,
        Severity::High,
        r"\bfs\.(?:readFile|writeFile|appendFile|unlink|rm|rmdir|mkdir|readdir|open|createReadStream|createWriteStream)\w*\s*\(",
    ),
    (
        "proto-access",
        ThreatCategory::PrototypePollution,
        Severity::High,
        r"__proto__",
    ),
    (
        "constructor-prototype",
        ThreatCategory::PrototypePollution,
        Severity::High,
        r"\bconstructor\s*\.\s*prototype\b",
    ),
    (
        "set-prototype-of",
        ThreatCategory::PrototypePollution,
        Severity::High,
        r"\bObject\.setPrototypeOf\s*\(",
    ),
    (
        "computed-require",
        ThreatCategory::DynamicImport,
        Severity::Medium,
        r#"\brequire\s*\(\s*[^'"`\s)]"#,
    ),
    (
        "dynamic-import",
        ThreatCategory::DynamicImport,
        Severity::Medium,
        r"\bimport\s*\(",
    ),
    (
        "fetch-call",
        ThreatCategory::Network,
        Severity::Medium,
        r"\bfetch\s*\(",
    ),
    (
        "raw-socket",
        ThreatCategory::Network,
        Severity::Medium,
        r"\b(?:XMLHttpRequest|WebSocket)\b",
    ),
    (
        "net-module",
        ThreatCategory::Network,
        Severity::Medium,
        r#"(?:require\s*\(\s*|from\s+)['"](?:node:)?(?:net|http|https|dgram|tls)['"]"#,
    ),
];

/// Regex-based static scanner.
pub struct ThreatScanner {
    rules: Vec<Rule>,
}

impl fmt::Debug for ThreatScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreatScanner")
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl Default for ThreatScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreatScanner {
    /// Create a scanner with the built-in rule set.
    #[must_use]
    pub fn new() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .filter_map(|(id, category, severity, pattern)| match Regex::new(pattern) {
                Ok(regex) => Some(Rule {
                    id: (*id).to_owned(),
                    category: *category,
                    severity: *severity,
                    regex,
                }),
                Err(e) => {
                    warn!(rule = id, error = %e, "Skipping threat rule that failed to compile");
                    None
                },
            })
            .collect();
        Self { rules }
    }

    /// Add a host-supplied rule.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidPattern`] if `pattern` is not a valid regex.
    pub fn with_rule(
        mut self,
        id: impl Into<String>,
        severity: Severity,
        pattern: &str,
    ) -> SandboxResult<Self> {
        let id = id.into();
        let regex = Regex::new(pattern).map_err(|source| SandboxError::InvalidPattern {
            rule: id.clone(),
            source,
        })?;
        self.rules.push(Rule {
            id,
            category: ThreatCategory::Custom,
            severity,
            regex,
        });
        Ok(self)
    }

    /// Number of active rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Scan `source` and report every rule hit.
    #[must_use]
    pub fn scan(&self, source: &str) -> ScanReport {
        let mut threats = Vec::new();
        for (index, line) in source.lines().enumerate() {
            for rule in &self.rules {
                if rule.regex.is_match(line) {
                    threats.push(Threat {
                        rule: rule.id.clone(),
                        category: rule.category,
                        severity: rule.severity,
                        line: index.saturating_add(1),
                        snippet: snippet(line),
                    });
                }
            }
        }
        ScanReport::from_threats(threats)
    }
}

fn snippet(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() <= MAX_SNIPPET_CHARS {
        return trimmed.to_owned();
    }
    let mut s: String = trimmed.chars().take(MAX_SNIPPET_CHARS).collect();
    s.push('…');
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_builtin_rules_compile() {
        assert_eq!(ThreatScanner::new().rule_count(), BUILTIN_RULES.len());
    }

    #[test]
    fn test_clean_source_is_safe() {
        let report = ThreatScanner::new().scan("export function area(r) {\n  return Math.PI * r * r;\n}\n");
        assert!(report.safe);
        assert!(report.threats.is_empty());
        assert_eq!(report.highest, None);
    }

    #[test]
    fn test_subprocess_spawn_is_critical() {
        let report =
            ThreatScanner::new().scan("const cp = require('child_process');\ncp.spawn('rm', ['-rf', '/']);\n");
        assert!(!report.safe);
        assert_eq!(report.highest, Some(Severity::Critical));
        assert!(report.threats.iter().all(|t| t.category == ThreatCategory::Subprocess));
        assert_eq!(report.threats[0].line, 1);
        assert!(report.threats.iter().any(|t| t.line == 2));
    }

    #[test]
    fn test_eval_is_critical() {
        let report = ThreatScanner::new().scan("const f = eval(userInput);");
        assert!(!report.safe);
        assert_eq!(report.blocking()[0].category, ThreatCategory::DynamicEval);
    }

    #[test]
    fn test_network_only_is_safe() {
        let report = ThreatScanner::new().scan("const res = await fetch('https://tiles.example.com');");
        assert!(report.safe);
        assert_eq!(report.highest, Some(Severity::Medium));
        assert_eq!(report.threats[0].category, ThreatCategory::Network);
    }

    #[test]
    fn test_high_severity_does_not_block() {
        let report = ThreatScanner::new().scan("obj.__proto__.polluted = true;\nprocess.exit(1);");
        assert!(report.safe);
        assert_eq!(report.highest, Some(Severity::High));
        assert_eq!(report.threats.len(), 2);
    }

    #[test]
    fn test_literal_require_is_not_dynamic() {
        let scanner = ThreatScanner::new();
        assert!(scanner.scan("const x = require('lodash');").threats.is_empty());
        let report = scanner.scan("const x = require(name);");
        assert_eq!(report.threats[0].category, ThreatCategory::DynamicImport);
    }

    #[test]
    fn test_evaluate_identifier_is_not_eval() {
        let report = ThreatScanner::new().scan("formula.evaluate(cells);");
        assert!(report.threats.is_empty());
    }

    #[test]
    fn test_custom_rule() {
        let scanner = ThreatScanner::new()
            .with_rule("crypto-miner", Severity::Critical, r"\bCoinHive\b")
            .unwrap();
        let report = scanner.scan("new CoinHive.Anonymous('key');");
        assert!(!report.safe);
        assert_eq!(report.threats[0].category, ThreatCategory::Custom);
    }

    #[test]
    fn test_invalid_custom_rule() {
        let result = ThreatScanner::new().with_rule("bad", Severity::Low, "(unclosed");
        assert!(matches!(result, Err(SandboxError::InvalidPattern { .. })));
    }

    #[test]
    fn test_long_lines_are_truncated() {
        let line = format!("eval(\"{}\")", "a".repeat(500));
        let report = ThreatScanner::new().scan(&line);
        assert!(report.threats[0].snippet.chars().count() <= MAX_SNIPPET_CHARS + 1);
    }
}
