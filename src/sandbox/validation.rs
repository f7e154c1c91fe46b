// src/sandbox/validation.rs
// Pre-container validation: command allow-listing and a syntactic scan of
// Python source. Runs on the calling side before any container starts.

use crate::error::{AgentError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Modules the sandbox permits Python code to import
pub const ALLOWED_IMPORTS: &[&str] = &[
    // Safe standard library
    "json", "csv", "datetime", "math", "statistics", "random", "collections", "itertools",
    "functools", "typing", "re", "string", "decimal", "fractions", "hashlib", "base64", "uuid",
    "pathlib", "time", "copy", "pprint", "textwrap",
    // Data analysis core
    "pandas", "numpy", "scipy", "statsmodels",
    // Excel handling
    "openpyxl", "xlrd", "xlsxwriter",
    // Visualization
    "matplotlib", "seaborn", "plotly",
];

pub fn default_allowed_imports() -> HashSet<String> {
    ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect()
}

/// Split a command line shell-style: whitespace-separated tokens with
/// single/double quoting. Unterminated quotes are an error.
pub fn shell_split(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_token = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(AgentError::BadInput("unterminated quote in command".to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Check that the executable (first token) is on the allow-list.
pub fn validate_command(command: &str, whitelist: &[String]) -> Result<()> {
    let tokens = shell_split(command.trim())?;
    let Some(executable) = tokens.first() else {
        return Err(AgentError::BadInput("empty command".to_string()));
    };
    if !whitelist.iter().any(|allowed| allowed == executable) {
        return Err(AgentError::NotPermitted(format!(
            "command '{}' is not whitelisted (allowed: {})",
            executable,
            whitelist.join(", ")
        )));
    }
    Ok(())
}

fn dangerous_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bimport\s+(os|subprocess|shutil|sys|socket|ctypes)\b",
            r"(?i)\bfrom\s+(os|subprocess|shutil|sys|socket|ctypes)\b",
            r"\bexec\s*\(",
            r"\beval\s*\(",
            r"\b__import__\s*\(",
            r"\bcompile\s*\(",
            // Writes through the standard open-with-write pattern
            r#"\bopen\s*\([^)]*,\s*['"][wax]"#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    })
}

/// Syntactic scan of Python source before it reaches a container.
///
/// Rejects imports outside the allow-list, dynamic execution primitives,
/// and file writes. The AST pass (tree-sitter) is authoritative for
/// imports; the regex patterns supplement it for shell-style smells and
/// stand in entirely when the `parsers` feature is off.
pub fn validate_python_code(code: &str, allowed: &HashSet<String>) -> Result<()> {
    if code.trim().is_empty() {
        return Err(AgentError::BadInput("code must not be empty".to_string()));
    }

    for pattern in dangerous_patterns() {
        if pattern.is_match(code) {
            return Err(AgentError::NotPermitted(format!(
                "code contains a forbidden construct: {}",
                pattern.as_str()
            )));
        }
    }

    #[cfg(feature = "parsers")]
    scan_imports_ast(code, allowed)?;

    #[cfg(not(feature = "parsers"))]
    scan_imports_regex(code, allowed)?;

    Ok(())
}

/// AST import scan via tree-sitter-python.
#[cfg(feature = "parsers")]
fn scan_imports_ast(code: &str, allowed: &HashSet<String>) -> Result<()> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| AgentError::Internal(format!("tree-sitter init failed: {}", e)))?;
    let tree = parser
        .parse(code, None)
        .ok_or_else(|| AgentError::BadInput("code could not be parsed".to_string()))?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(AgentError::BadInput("code has syntax errors".to_string()));
    }

    let mut cursor = root.walk();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "import_statement" => {
                for child in node.named_children(&mut cursor) {
                    let name_node = match child.kind() {
                        "dotted_name" => Some(child),
                        "aliased_import" => child.child_by_field_name("name"),
                        _ => None,
                    };
                    if let Some(name_node) = name_node {
                        check_module(module_text(code, name_node), allowed)?;
                    }
                }
            }
            "import_from_statement" => {
                if let Some(module) = node.child_by_field_name("module_name") {
                    check_module(module_text(code, module), allowed)?;
                }
            }
            _ => {}
        }
        for i in 0..node.named_child_count() {
            if let Some(child) = node.named_child(i) {
                stack.push(child);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "parsers")]
fn module_text<'a>(code: &'a str, node: tree_sitter::Node) -> &'a str {
    node.utf8_text(code.as_bytes()).unwrap_or("")
}

/// Regex import scan, used when the parser feature is disabled.
#[cfg(not(feature = "parsers"))]
fn scan_imports_regex(code: &str, allowed: &HashSet<String>) -> Result<()> {
    static IMPORT_RE: OnceLock<Regex> = OnceLock::new();
    let import_re = IMPORT_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_.]*)").expect("valid regex")
    });
    for caps in import_re.captures_iter(code) {
        check_module(&caps[1], allowed)?;
    }
    Ok(())
}

fn check_module(module: &str, allowed: &HashSet<String>) -> Result<()> {
    let module = module.trim();
    if module.is_empty() || module.starts_with('.') {
        // Relative imports have no top-level module to check
        return Ok(());
    }
    let root = module.split('.').next().unwrap_or(module);
    if allowed.contains(module) || allowed.contains(root) {
        return Ok(());
    }
    let mut names: Vec<&str> = allowed.iter().map(String::as_str).collect();
    names.sort_unstable();
    Err(AgentError::NotPermitted(format!(
        "import of module '{}' is not allowed (allowed: {})",
        root,
        names.join(", ")
    )))
}
