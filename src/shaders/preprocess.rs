//! Conditional-block preprocessor for WGSL templates.
//!
//! Supported directives, one per line:
//!
//! - `#define NAME`
//! - `#ifdef NAME` / `#ifndef NAME`
//! - `#if A`, `#if A && B && ...`, `#if A || B || ...` (no mixing)
//! - `#else`, `#endif`
//!
//! Directive lines and lines in inactive blocks are replaced by empty lines
//! so compiler diagnostics keep their line numbers.

use std::collections::HashSet;

use crate::error::CompileError;

struct Block {
    /// Whether the enclosing block is emitting.
    parent_active: bool,
    condition: bool,
    in_else: bool,
    opened_at: usize,
}

impl Block {
    fn active(&self) -> bool {
        self.parent_active && (self.condition != self.in_else)
    }
}

/// Expands `source` with the given names defined.
pub fn preprocess<'a>(
    source: &str,
    defines: impl IntoIterator<Item = &'a str>,
) -> Result<String, CompileError> {
    let mut defined: HashSet<String> = defines.into_iter().map(str::to_string).collect();
    let mut stack: Vec<Block> = Vec::new();
    let mut output = String::with_capacity(source.len());

    for (index, line) in source.lines().enumerate() {
        let number = index + 1;
        let active = stack.last().map(Block::active).unwrap_or(true);
        let trimmed = line.trim();
        let Some(directive) = trimmed.strip_prefix('#') else {
            if active {
                output.push_str(line);
            }
            output.push('\n');
            continue;
        };

        let (keyword, rest) = directive
            .split_once(char::is_whitespace)
            .map(|(k, r)| (k, r.trim()))
            .unwrap_or((directive, ""));
        let error = |message: String| CompileError::Preprocess {
            line: number,
            message,
        };
        match keyword {
            "define" => {
                if rest.is_empty() {
                    return Err(error("#define without a name".to_string()));
                }
                if active {
                    defined.insert(rest.to_string());
                }
            }
            "ifdef" | "ifndef" | "if" => {
                let condition = match keyword {
                    "ifdef" => defined.contains(single_name(rest).map_err(error)?),
                    "ifndef" => !defined.contains(single_name(rest).map_err(error)?),
                    _ => evaluate(rest, &defined).map_err(error)?,
                };
                stack.push(Block {
                    parent_active: active,
                    condition,
                    in_else: false,
                    opened_at: number,
                });
            }
            "else" => match stack.last_mut() {
                Some(block) if !block.in_else => block.in_else = true,
                Some(_) => return Err(error("duplicate #else".to_string())),
                None => return Err(error("#else without an open block".to_string())),
            },
            "endif" => {
                if stack.pop().is_none() {
                    return Err(error("#endif without an open block".to_string()));
                }
            }
            other => return Err(error(format!("unknown directive #{}", other))),
        }
        output.push('\n');
    }

    if let Some(block) = stack.last() {
        return Err(CompileError::Preprocess {
            line: block.opened_at,
            message: "block is never closed with #endif".to_string(),
        });
    }
    Ok(output)
}

fn single_name(rest: &str) -> Result<&str, String> {
    let mut words = rest.split_whitespace();
    match (words.next(), words.next()) {
        (Some(name), None) => Ok(name),
        _ => Err(format!("expected a single name, got `{}`", rest)),
    }
}

fn evaluate(expression: &str, defined: &HashSet<String>) -> Result<bool, String> {
    let has_and = expression.contains("&&");
    let has_or = expression.contains("||");
    if has_and && has_or {
        return Err(format!("cannot mix && and || in `{}`", expression));
    }
    let separator = if has_or { "||" } else { "&&" };
    let mut names = expression.split(separator).map(str::trim).peekable();
    if names.peek().is_none_or(|name| name.is_empty()) {
        return Err("#if without a condition".to_string());
    }
    let mut values = Vec::new();
    for name in names {
        let negated = name.strip_prefix('!').map(str::trim);
        let value = match negated {
            Some(name) => !defined.contains(single_name(name)?),
            None => defined.contains(single_name(name)?),
        };
        values.push(value);
    }
    Ok(if has_or {
        values.into_iter().any(|v| v)
    } else {
        values.into_iter().all(|v| v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(output: &str) -> Vec<&str> {
        output.lines().filter(|l| !l.is_empty()).collect()
    }

    #[test]
    fn ifdef_else_selects_branch() {
        let source = "#ifdef LIGHT\nlit\n#else\nunlit\n#endif\nalways";
        assert_eq!(lines(&preprocess(source, ["LIGHT"]).unwrap()), vec!["lit", "always"]);
        assert_eq!(lines(&preprocess(source, []).unwrap()), vec!["unlit", "always"]);
    }

    #[test]
    fn nested_blocks_respect_parent() {
        let source = "#ifndef A\n#ifdef B\ninner\n#endif\n#endif";
        assert!(lines(&preprocess(source, ["A", "B"]).unwrap()).is_empty());
        assert_eq!(lines(&preprocess(source, ["B"]).unwrap()), vec!["inner"]);
    }

    #[test]
    fn and_or_conditions() {
        let source = "#if A && B\nboth\n#endif\n#if A || B\neither\n#endif";
        assert_eq!(lines(&preprocess(source, ["A"]).unwrap()), vec!["either"]);
        assert_eq!(lines(&preprocess(source, ["A", "B"]).unwrap()), vec!["both", "either"]);
    }

    #[test]
    fn define_inside_source() {
        let source = "#define X\n#ifdef X\nyes\n#endif";
        assert_eq!(lines(&preprocess(source, []).unwrap()), vec!["yes"]);
    }

    #[test]
    fn keeps_line_numbers() {
        let output = preprocess("#ifdef A\na\n#endif\nb", []).unwrap();
        assert_eq!(output.lines().nth(3), Some("b"));
    }

    #[test]
    fn reports_unbalanced_blocks() {
        assert_eq!(
            preprocess("x\n#ifdef A\ny", []),
            Err(CompileError::Preprocess {
                line: 2,
                message: "block is never closed with #endif".to_string()
            })
        );
        assert!(matches!(
            preprocess("#endif", []),
            Err(CompileError::Preprocess { line: 1, .. })
        ));
        assert!(matches!(
            preprocess("#if A && B || C\n#endif", []),
            Err(CompileError::Preprocess { line: 1, .. })
        ));
    }
}
