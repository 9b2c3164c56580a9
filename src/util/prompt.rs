//! Interactive confirmation before destructive operations.
use std::io::{self, BufRead, Write};

use anyhow::Result;

/// Ask `question` on stdout and accept only a typed `yes`.
/// `assume_yes` (the `--yes` flag) skips the prompt.
pub fn confirm(question: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    confirm_with(&mut stdin.lock(), &mut stdout, question, "yes", false)
}

/// Stronger confirmation: the operator must type `phrase` exactly.
pub fn confirm_phrase(question: &str, phrase: &str) -> Result<bool> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    confirm_with(&mut stdin.lock(), &mut stdout, question, phrase, true)
}

pub fn confirm_with<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    question: &str,
    expected: &str,
    case_sensitive: bool,
) -> Result<bool> {
    write!(writer, "{question} (type '{expected}' to proceed): ")?;
    writer.flush()?;

    let mut input = String::new();
    reader.read_line(&mut input)?;
    let answer = input.trim();
    Ok(if case_sensitive {
        answer == expected
    } else {
        answer.eq_ignore_ascii_case(expected)
    })
}
