//! Static validation of generated tool code before it is accepted.
//!
//! Tool source is Python-style script text. It is lexed (strings, f-string expressions,
//! comments, names, dots) and every name is checked against the deny lists below; imports
//! must come from `ALLOWED_MODULES`. Code is never executed here.

use serde::Serialize;
use tracing::info;
use unicode_normalization::UnicodeNormalization;

use crate::config::SandboxConfig;

pub const ALLOWED_MODULES: &[&str] = &[
    "json",
    "re",
    "math",
    "datetime",
    "time",
    "decimal",
    "statistics",
    "collections",
    "itertools",
    "functools",
    "typing",
    "uuid",
    "random",
    "string",
    "calendar",
    "dataclasses",
    "enum",
];

pub const BLOCKED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "input",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "memoryview",
    "exit",
    "quit",
    "help",
];

/// Dunder names that may not appear even as bare identifiers.
const BLOCKED_DUNDER_NAMES: &[&str] = &[
    "__builtins__",
    "__loader__",
    "__spec__",
    "__class__",
    "__globals__",
    "__code__",
    "__subclasses__",
    "__bases__",
    "__mro__",
    "__dict__",
    "__getattribute__",
];

/// Dunder attributes generated tools commonly need. All other `.__x__` access is rejected.
const SAFE_DUNDER_ATTRIBUTES: &[&str] = &[
    "__name__",
    "__doc__",
    "__init__",
    "__str__",
    "__repr__",
    "__len__",
    "__iter__",
    "__next__",
];

/// Frame, generator and code-object attributes.
const BLOCKED_ATTRIBUTES: &[&str] = &[
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "f_code",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "cr_code",
    "ag_frame",
    "tb_frame",
    "tb_next",
    "co_code",
    "func_globals",
    "func_code",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    EmptyCode,
    CodeTooLarge,
    UnterminatedString,
    BlockedBuiltin,
    BlockedName,
    BlockedAttribute,
    DisallowedImport,
    RelativeImport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub line: usize,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
    pub imports: Vec<String>,
}

impl SandboxReport {
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Dot,
    Op(char),
    Newline,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "b" | "u" | "f" | "rb" | "br" | "fr" | "rf"
    )
}

/// Any non-ASCII, non-space character may be part of a name; the name is checked after NFKC.
fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || (!c.is_ascii() && !c.is_whitespace())
}

/// Names are compared the way the interpreter sees them: NFKC-normalized.
fn normalize_name(raw: &[char]) -> String {
    raw.iter().copied().nfkc().collect()
}

fn lex(src: &str, first_line: usize, tokens: &mut Vec<Token>, violations: &mut Vec<Violation>) {
    let chars: Vec<char> = src.chars().collect();
    let len = chars.len();
    let mut i = 0;
    let mut line = first_line;
    // Newlines inside brackets do not end a logical line.
    let mut depth = 0usize;

    while i < len {
        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(Token { tok: Tok::Newline, line });
                }
                line += 1;
                i += 1;
            }
            '#' => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\\' if chars.get(i + 1) == Some(&'\n') => {
                line += 1;
                i += 2;
            }
            '\'' | '"' => {
                i = lex_string(&chars, i, false, &mut line, tokens, violations);
            }
            c if is_name_char(c) && !c.is_ascii_digit() => {
                let start = i;
                while i < len && is_name_char(chars[i]) {
                    i += 1;
                }
                let word = normalize_name(&chars[start..i]);
                if i < len && (chars[i] == '\'' || chars[i] == '"') && is_string_prefix(&word) {
                    let fstring = word.to_ascii_lowercase().contains('f');
                    i = lex_string(&chars, i, fstring, &mut line, tokens, violations);
                } else {
                    tokens.push(Token { tok: Tok::Name(word), line });
                }
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                while i < len && (chars[i].is_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
            }
            '.' => {
                tokens.push(Token { tok: Tok::Dot, line });
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            c => {
                match c {
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' | '}' => depth = depth.saturating_sub(1),
                    _ => {}
                }
                tokens.push(Token { tok: Tok::Op(c), line });
                i += 1;
            }
        }
    }
}

/// Consume a string literal starting at the opening quote; returns the index after it.
fn lex_string(
    chars: &[char],
    start: usize,
    fstring: bool,
    line: &mut usize,
    tokens: &mut Vec<Token>,
    violations: &mut Vec<Violation>,
) -> usize {
    let len = chars.len();
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let qlen = if triple { 3 } else { 1 };
    let start_line = *line;
    let content_start = start + qlen;
    let mut i = content_start;

    loop {
        if i >= len {
            violations.push(Violation {
                kind: ViolationKind::UnterminatedString,
                line: start_line,
                detail: "string literal is never closed".to_string(),
            });
            return len;
        }
        match chars[i] {
            '\\' => {
                if chars.get(i + 1) == Some(&'\n') {
                    *line += 1;
                }
                i += 2;
            }
            '\n' if !triple => {
                violations.push(Violation {
                    kind: ViolationKind::UnterminatedString,
                    line: start_line,
                    detail: "string literal is never closed".to_string(),
                });
                return i;
            }
            '\n' => {
                *line += 1;
                i += 1;
            }
            c if c == quote
                && (!triple || (chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote))) =>
            {
                if fstring {
                    let content: String = chars[content_start..i].iter().collect();
                    lex_fstring_expressions(&content, start_line, tokens, violations);
                }
                return i + qlen;
            }
            _ => i += 1,
        }
    }
}

/// Lex the `{...}` replacement fields of an f-string body as code.
fn lex_fstring_expressions(body: &str, first_line: usize, tokens: &mut Vec<Token>, violations: &mut Vec<Violation>) {
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    let mut line = first_line;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => i += 2,
            '{' => {
                let expr_line = line;
                let mut depth = 1;
                let start = i + 1;
                i += 1;
                while i < chars.len() && depth > 0 {
                    match chars[i] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        '\n' => line += 1,
                        _ => {}
                    }
                    i += 1;
                }
                let end = if depth == 0 { i - 1 } else { i };
                let expr: String = chars[start..end].iter().collect();
                lex(&expr, expr_line, tokens, violations);
                tokens.push(Token { tok: Tok::Newline, line: expr_line });
            }
            '\n' => {
                line += 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

pub struct SandboxValidator {
    max_code_bytes: usize,
    allowed_modules: Vec<String>,
}

impl SandboxValidator {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            max_code_bytes: config.max_code_bytes,
            allowed_modules: ALLOWED_MODULES.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn allowed_modules(&self) -> &[String] {
        &self.allowed_modules
    }

    pub fn validate(&self, code: &str) -> SandboxReport {
        let mut violations = Vec::new();
        let mut imports = Vec::new();

        if code.trim().is_empty() {
            violations.push(Violation {
                kind: ViolationKind::EmptyCode,
                line: 0,
                detail: "code is empty".to_string(),
            });
        } else if code.len() > self.max_code_bytes {
            violations.push(Violation {
                kind: ViolationKind::CodeTooLarge,
                line: 0,
                detail: format!("code is {} bytes; limit is {}", code.len(), self.max_code_bytes),
            });
        } else {
            let mut tokens = Vec::new();
            lex(code, 1, &mut tokens, &mut violations);
            self.analyze(&tokens, &mut violations, &mut imports);
        }

        violations.sort_by_key(|v| v.line);
        let report = SandboxReport {
            valid: violations.is_empty(),
            violations,
            imports,
        };
        info!(
            target: "pam::sandbox",
            valid = report.valid,
            violations = report.violations.len(),
            bytes = code.len(),
            "Tool code validated"
        );
        report
    }

    fn analyze(&self, tokens: &[Token], violations: &mut Vec<Violation>, imports: &mut Vec<String>) {
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            if let Tok::Name(name) = &token.tok {
                match name.as_str() {
                    "import" => {
                        i = self.check_import(tokens, i + 1, violations, imports);
                        continue;
                    }
                    "from" => {
                        if let Some(next) = self.check_from_import(tokens, i + 1, violations, imports) {
                            i = next;
                            continue;
                        }
                    }
                    _ => {
                        let after_dot = i > 0 && tokens[i - 1].tok == Tok::Dot;
                        check_name(name, after_dot, token.line, violations);
                    }
                }
            }
            i += 1;
        }
    }

    fn check_module(&self, root: &str, line: usize, violations: &mut Vec<Violation>, imports: &mut Vec<String>) {
        if !imports.iter().any(|m| m == root) {
            imports.push(root.to_string());
        }
        if !self.allowed_modules.iter().any(|m| m == root) {
            violations.push(Violation {
                kind: ViolationKind::DisallowedImport,
                line,
                detail: format!("import of '{}' is not allowed", root),
            });
        }
    }

    /// `import a.b [as c], d ...` starting after the keyword. Returns the index after the clause.
    fn check_import(
        &self,
        tokens: &[Token],
        mut j: usize,
        violations: &mut Vec<Violation>,
        imports: &mut Vec<String>,
    ) -> usize {
        loop {
            let Some(Token { tok: Tok::Name(root), line }) = tokens.get(j) else { return j };
            self.check_module(root, *line, violations, imports);
            j += 1;
            while tokens.get(j).map(|t| &t.tok) == Some(&Tok::Dot) {
                j += 2;
            }
            if let Some(Token { tok: Tok::Name(kw), .. }) = tokens.get(j) {
                if kw == "as" {
                    if let Some(Token { tok: Tok::Name(alias), line }) = tokens.get(j + 1) {
                        check_name(alias, false, *line, violations);
                    }
                    j += 2;
                }
            }
            match tokens.get(j).map(|t| &t.tok) {
                Some(Tok::Op(',')) => j += 1,
                _ => return j,
            }
        }
    }

    /// `from x.y import ...`. Returns the index after `import`, or `None` when this `from`
    /// belongs to `yield from` / `raise ... from`.
    fn check_from_import(
        &self,
        tokens: &[Token],
        mut j: usize,
        violations: &mut Vec<Violation>,
        imports: &mut Vec<String>,
    ) -> Option<usize> {
        let first = tokens.get(j)?;
        if first.tok == Tok::Dot {
            violations.push(Violation {
                kind: ViolationKind::RelativeImport,
                line: first.line,
                detail: "relative imports are not allowed".to_string(),
            });
            while let Some(t) = tokens.get(j) {
                j += 1;
                if t.tok == Tok::Name("import".to_string()) || t.tok == Tok::Newline {
                    break;
                }
            }
            return Some(j);
        }

        let Tok::Name(root) = &first.tok else { return None };
        let mut k = j + 1;
        while tokens.get(k).map(|t| &t.tok) == Some(&Tok::Dot) {
            k += 2;
        }
        match tokens.get(k) {
            Some(Token { tok: Tok::Name(kw), .. }) if kw == "import" => {
                self.check_module(root, first.line, violations, imports);
                Some(k + 1)
            }
            _ => None,
        }
    }
}

fn check_name(name: &str, after_dot: bool, line: usize, violations: &mut Vec<Violation>) {
    if after_dot {
        let blocked = BLOCKED_ATTRIBUTES.contains(&name)
            || (is_dunder(name) && !SAFE_DUNDER_ATTRIBUTES.contains(&name));
        if blocked {
            violations.push(Violation {
                kind: ViolationKind::BlockedAttribute,
                line,
                detail: format!("attribute '{}' is not allowed", name),
            });
        }
        return;
    }
    if BLOCKED_BUILTINS.contains(&name) {
        violations.push(Violation {
            kind: ViolationKind::BlockedBuiltin,
            line,
            detail: format!("'{}' is not allowed", name),
        });
    } else if BLOCKED_DUNDER_NAMES.contains(&name) {
        violations.push(Violation {
            kind: ViolationKind::BlockedName,
            line,
            detail: format!("'{}' is not allowed", name),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SandboxValidator {
        SandboxValidator::new(&SandboxConfig::default())
    }

    #[test]
    fn accepts_allowlisted_tool() {
        let code = r#"
import json
import math, re
from datetime import datetime, timedelta
from collections import defaultdict as dd

class FuelCalculator:
    """Estimate fuel cost for a leg."""
    def __init__(self, mpg):
        self.mpg = mpg

    def cost(self, miles, price):
        gallons = miles / self.mpg
        return round(gallons * price, 2)

def run(params):
    calc = FuelCalculator(params["mpg"])
    total = calc.cost(params["miles"], params["price"])
    label = f"Total: {total:.2f} for {params['miles']} miles"
    return json.dumps({"total": total, "label": label, "when": datetime.now().isoformat()})
"#;
        let report = validator().validate(code);
        assert!(report.valid, "{:?}", report.violations);
        assert_eq!(report.imports, vec!["json", "math", "re", "datetime", "collections"]);
    }

    #[test]
    fn rejects_eval_exec_and_dunder_import() {
        for (code, name) in [
            ("x = eval('1+1')", "eval"),
            ("exec(payload)", "exec"),
            ("os = __import__('os')", "__import__"),
            ("f = compile(src, 'x', 'exec')", "compile"),
            ("data = open('/etc/passwd').read()", "open"),
        ] {
            let report = validator().validate(code);
            assert!(!report.valid, "{} should be rejected", code);
            assert!(report.has(ViolationKind::BlockedBuiltin));
            assert!(report.violations[0].detail.contains(name));
        }
    }

    #[test]
    fn rejects_dunder_attribute_escape() {
        let code = "subs = ().__class__.__bases__[0].__subclasses__()";
        let report = validator().validate(code);
        assert!(!report.valid);
        let attrs: Vec<&str> = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::BlockedAttribute)
            .map(|v| v.detail.as_str())
            .collect();
        assert_eq!(attrs.len(), 3, "{:?}", attrs);
    }

    #[test]
    fn rejects_frame_walking() {
        let report = validator().validate("g = (x for x in []).gi_frame.f_globals");
        assert_eq!(
            report.violations.iter().filter(|v| v.kind == ViolationKind::BlockedAttribute).count(),
            2
        );
    }

    #[test]
    fn rejects_bare_blocked_dunder_names() {
        let report = validator().validate("b = __builtins__");
        assert!(report.has(ViolationKind::BlockedName));
    }

    #[test]
    fn safe_dunders_are_allowed() {
        let code = "class A(B):\n    def __init__(self):\n        super().__init__()\n        self.n = type(self).__name__\n";
        let report = validator().validate(code);
        assert!(report.valid, "{:?}", report.violations);
    }

    #[test]
    fn disallowed_imports() {
        let report = validator().validate("import os\nimport json\nfrom subprocess import run\nimport urllib.request as u");
        let bad: Vec<usize> = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::DisallowedImport)
            .map(|v| v.line)
            .collect();
        assert_eq!(bad, vec![1, 3, 4]);
    }

    #[test]
    fn relative_import_rejected() {
        let report = validator().validate("from . import helpers\nfrom ..pkg import thing");
        assert_eq!(
            report.violations.iter().filter(|v| v.kind == ViolationKind::RelativeImport).count(),
            2
        );
    }

    #[test]
    fn yield_from_and_raise_from_are_not_imports() {
        let code = "def gen(items):\n    yield from items\n\ndef f(e):\n    raise ValueError('bad') from e\n";
        let report = validator().validate(code);
        assert!(report.valid, "{:?}", report.violations);
        assert!(report.imports.is_empty());
    }

    #[test]
    fn strings_and_comments_are_ignored() {
        let code = "# eval(x) would be bad\nmsg = 'call exec() later'\ndoc = \"\"\"\n__import__('os')\n\"\"\"\n";
        let report = validator().validate(code);
        assert!(report.valid, "{:?}", report.violations);
    }

    #[test]
    fn fstring_expressions_are_checked() {
        let report = validator().validate("msg = f\"{eval('2')} and {{literal}}\"");
        assert!(report.has(ViolationKind::BlockedBuiltin));

        let ok = validator().validate("msg = f\"{{eval}} is just text\"");
        assert!(ok.valid, "{:?}", ok.violations);
    }

    #[test]
    fn line_numbers_follow_triple_quoted_strings() {
        let code = "x = '''\none\ntwo\n'''\ny = eval('1')\n";
        let report = validator().validate(code);
        assert_eq!(report.violations[0].line, 5);
    }

    #[test]
    fn fullwidth_names_are_normalized_before_checks() {
        let report = validator().validate("x = \u{FF45}val('1+1')\n");
        assert!(report.has(ViolationKind::BlockedBuiltin), "{:?}", report.violations);
        assert!(report.violations[0].detail.contains("'eval'"));

        let report = validator().validate("b = \u{FF3F}_builtins__\n");
        assert!(report.has(ViolationKind::BlockedName), "{:?}", report.violations);

        let report = validator().validate("g = f.\u{FF3F}_globals__\n");
        assert!(report.has(ViolationKind::BlockedAttribute), "{:?}", report.violations);
    }

    #[test]
    fn non_ascii_names_are_still_allowed() {
        let report = validator().validate("caf\u{E9} = 3\nprint(caf\u{E9})\n");
        assert!(report.valid, "{:?}", report.violations);
    }

    #[test]
    fn attribute_split_across_lines_inside_brackets() {
        let report = validator().validate("g = (f.\n__closure__)\nh = (f.  # c\n__self__)\n");
        let attrs: Vec<usize> = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::BlockedAttribute)
            .map(|v| v.line)
            .collect();
        assert_eq!(attrs, vec![2, 4]);
    }

    #[test]
    fn bracketed_import_list_spans_lines() {
        let report = validator().validate("from math import (\n    sqrt,\n    floor,\n)\nimport os\n");
        let bad: Vec<usize> = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::DisallowedImport)
            .map(|v| v.line)
            .collect();
        assert_eq!(bad, vec![5]);
    }

    #[test]
    fn unterminated_string() {
        let report = validator().validate("x = 'oops\ny = 2\n");
        assert!(report.has(ViolationKind::UnterminatedString));
    }

    #[test]
    fn size_and_empty_limits() {
        let v = SandboxValidator::new(&SandboxConfig { max_code_bytes: 10 });
        assert!(v.validate("x = 1234567890").has(ViolationKind::CodeTooLarge));
        assert!(v.validate("   \n").has(ViolationKind::EmptyCode));
    }

    #[test]
    fn attribute_named_like_builtin_is_fine() {
        let report = validator().validate("import re\nm = re.compile('a+')\nfmt = obj.open");
        assert!(report.valid, "{:?}", report.violations);
    }
}
