//! Root-output parsing: the model must reply with exactly one fenced `repl`
//! block and nothing else.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeBlockError {
    #[error("no fenced repl block found")]
    Missing,

    #[error("expected exactly one repl block, found {0}")]
    Multiple(usize),

    #[error("fenced block is not tagged `repl` (found `{0}`)")]
    WrongLanguage(String),

    #[error("unterminated fenced block")]
    Unterminated,

    #[error("content outside the repl block")]
    ContentOutside,
}

/// Extract the single `repl` step from a root model output.
///
/// Whitespace around the block is tolerated; any other text outside it is a
/// parse failure that gets recorded on the turn and surfaced to the model.
pub fn extract_repl_block(output: &str) -> Result<String, CodeBlockError> {
    let mut blocks: Vec<(String, String)> = Vec::new();
    let mut outside = String::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        match &mut current {
            None => {
                if let Some(rest) = trimmed.strip_prefix("```") {
                    current = Some((rest.trim().to_string(), Vec::new()));
                } else {
                    outside.push_str(trimmed);
                }
            }
            Some((language, body)) => {
                if trimmed == "```" {
                    blocks.push((language.clone(), body.join("\n")));
                    current = None;
                } else {
                    body.push(line);
                }
            }
        }
    }
    if current.is_some() {
        return Err(CodeBlockError::Unterminated);
    }
    if blocks.is_empty() {
        return Err(CodeBlockError::Missing);
    }
    if blocks.len() > 1 {
        return Err(CodeBlockError::Multiple(blocks.len()));
    }
    if !outside.trim().is_empty() {
        return Err(CodeBlockError::ContentOutside);
    }
    let (language, body) = blocks.remove(0);
    if language != "repl" {
        return Err(CodeBlockError::WrongLanguage(language));
    }
    let mut code = body;
    if !code.ends_with('\n') {
        code.push('\n');
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_single_block() {
        let output = "```repl\nsnippet = context[0][0:5]\ntool.FINAL(snippet)\n```";
        assert_eq!(
            extract_repl_block(output).unwrap(),
            "snippet = context[0][0:5]\ntool.FINAL(snippet)\n"
        );
    }

    #[test]
    fn tolerates_surrounding_whitespace_only() {
        let output = "\n\n```repl\nx = 1\n```\n\n";
        assert_eq!(extract_repl_block(output).unwrap(), "x = 1\n");
    }

    #[test]
    fn rejects_prose_around_block() {
        let output = "Here is my plan:\n```repl\nx = 1\n```";
        assert_eq!(
            extract_repl_block(output).unwrap_err(),
            CodeBlockError::ContentOutside
        );
    }

    #[test]
    fn rejects_zero_and_multiple_blocks() {
        assert_eq!(
            extract_repl_block("no code here").unwrap_err(),
            CodeBlockError::Missing
        );
        let two = "```repl\na = 1\n```\n```repl\nb = 2\n```";
        assert_eq!(
            extract_repl_block(two).unwrap_err(),
            CodeBlockError::Multiple(2)
        );
    }

    #[test]
    fn rejects_wrong_language_and_unterminated() {
        assert_eq!(
            extract_repl_block("```python\nx = 1\n```").unwrap_err(),
            CodeBlockError::WrongLanguage("python".to_string())
        );
        assert_eq!(
            extract_repl_block("```repl\nx = 1\n").unwrap_err(),
            CodeBlockError::Unterminated
        );
    }

    #[test]
    fn preserves_indentation_inside_block() {
        let output = "```repl\nif x:\n    y = 1\n```";
        assert_eq!(extract_repl_block(output).unwrap(), "if x:\n    y = 1\n");
    }
}
