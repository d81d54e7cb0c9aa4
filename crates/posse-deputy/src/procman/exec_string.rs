//! Exec-string parsing: tokenization, environment prefixes, and
//! variable expansion.
//!
//! An exec string is split with shell-style rules: whitespace separates
//! tokens, single and double quotes group, and `\` escapes the next
//! character (including inside quotes). Leading `KEY=VALUE` tokens are
//! environment assignments for the child, not argv entries. After the
//! split, each argv token undergoes `$NAME` / `${NAME}` expansion
//! against the supervisor's variable table, falling back to the process
//! environment. References that are malformed or undefined are left
//! textually unchanged; `\$` produces a literal `$`.

use std::collections::HashMap;

/// Split an exec string into tokens.
///
/// A `\$` sequence survives tokenization verbatim so that
/// [`expand_variables`] can see the escape and suppress expansion; every
/// other escape collapses to the escaped character here.
pub fn separate_args(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            match c {
                '\\' => {
                    push_escaped(&mut current, chars.next());
                }
                _ if c == q => quote = None,
                _ => current.push(c),
            }
            continue;
        }
        match c {
            '\\' => {
                in_token = true;
                push_escaped(&mut current, chars.next());
            }
            '\'' | '"' => {
                in_token = true;
                quote = Some(c);
            }
            _ if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn push_escaped(current: &mut String, next: Option<char>) {
    match next {
        // Keep the escape in front of `$` for the expander.
        Some('$') => {
            current.push('\\');
            current.push('$');
        }
        Some(c) => current.push(c),
        // Trailing backslash stays literal.
        None => current.push('\\'),
    }
}

/// Split leading `KEY=VALUE` tokens off as environment assignments.
///
/// Only the leading run counts; an `=` token after the first argv entry
/// is an ordinary argument. The key is everything before the first `=`.
pub fn separate_env_prefix(tokens: Vec<String>) -> (Vec<(String, String)>, Vec<String>) {
    let mut environment = Vec::new();
    let mut argv = Vec::new();
    for (index, token) in tokens.into_iter().enumerate() {
        if index == environment.len() && token.contains('=') {
            let (key, value) = token.split_once('=').unwrap_or((token.as_str(), ""));
            environment.push((key.to_string(), value.to_string()));
        } else {
            argv.push(token);
        }
    }
    (environment, argv)
}

fn is_name_char(c: char, offset: usize) -> bool {
    if offset == 0 {
        c.is_ascii_alphabetic() || c == '_'
    } else {
        c.is_ascii_alphanumeric() || c == '_'
    }
}

/// Expand `$NAME` and `${NAME}` references in one token.
///
/// `NAME` matches `[A-Za-z_][A-Za-z0-9_]*`. Lookup order: `vars`, then
/// the process environment. On any failure (bad name, missing closing
/// brace, undefined variable) the consumed text is emitted unchanged.
pub fn expand_variables(input: &str, vars: &HashMap<String, String>) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;

    while pos < chars.len() {
        match chars[pos] {
            '\\' => {
                if pos + 1 < chars.len() {
                    out.push(chars[pos + 1]);
                    pos += 2;
                } else {
                    out.push('\\');
                    pos += 1;
                }
            }
            '$' => {
                let start = pos;
                pos += 1;
                if pos >= chars.len() {
                    out.push('$');
                    break;
                }
                let braced = chars[pos] == '{';
                if braced {
                    pos += 1;
                }
                let name_start = pos;
                while pos < chars.len() && is_name_char(chars[pos], pos - name_start) {
                    pos += 1;
                }
                let name: String = chars[name_start..pos].iter().collect();

                let mut ok = !name.is_empty();
                if braced {
                    if pos < chars.len() && chars[pos] == '}' {
                        pos += 1;
                    } else {
                        ok = false;
                    }
                }
                if ok {
                    match vars
                        .get(&name)
                        .cloned()
                        .or_else(|| std::env::var(&name).ok())
                    {
                        Some(value) => out.push_str(&value),
                        None => ok = false,
                    }
                }
                if !ok {
                    out.extend(&chars[start..pos]);
                }
            }
            c => {
                out.push(c);
                pos += 1;
            }
        }
    }
    out
}
