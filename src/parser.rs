//! Parser for test-definition files.
//!
//! A definition file is line-oriented UTF-8 text:
//! - `#` opens a new question, the rest of the line is the prompt
//! - `+` adds an answer option marked correct
//! - `*` or `-` adds an answer option not marked correct
//! - any other non-blank line continues the prompt or the latest option
//!
//! Correctness is captured by option position at parse time. Options are
//! never reordered afterwards.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// A single multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Prompt text, possibly multi-line.
    pub prompt: String,
    /// Answer options in file order.
    pub options: Vec<String>,
    /// Positions of the correct options within `options`.
    pub correct: BTreeSet<usize>,
}

/// An immutable test: a name and its questions in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Test {
    pub name: String,
    pub questions: Vec<Question>,
}

/// Errors raised while loading a single test-definition file.
///
/// These are fatal only for the test being loaded, never for the whole
/// catalog.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("test file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read test file {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("malformed test file: line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Load and parse one test-definition file.
pub fn load_test(path: &Path, name: &str) -> Result<Test, ParseError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ParseError::NotFound(path.to_path_buf())
        } else {
            ParseError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    parse_test(name, &contents)
}

/// Parse test-definition text into a `Test`.
///
/// An empty input yields a test with zero questions.
pub fn parse_test(name: &str, contents: &str) -> Result<Test, ParseError> {
    let mut questions: Vec<Question> = Vec::new();
    // The current question plus the line it was opened on, so malformed
    // questions are reported where they start.
    let mut current: Option<(usize, Question)> = None;

    for (idx, raw) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('#') {
            if let Some((opened_at, done)) = current.take() {
                questions.push(finish_question(done, opened_at)?);
            }
            current = Some((
                line_no,
                Question {
                    prompt: rest.trim().to_string(),
                    options: Vec::new(),
                    correct: BTreeSet::new(),
                },
            ));
        } else if let Some(rest) = line.strip_prefix('+') {
            let (_, question) = current.as_mut().ok_or_else(|| ParseError::Malformed {
                line: line_no,
                reason: "option before the first question".to_string(),
            })?;
            question.correct.insert(question.options.len());
            question.options.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix('*').or_else(|| line.strip_prefix('-')) {
            let (_, question) = current.as_mut().ok_or_else(|| ParseError::Malformed {
                line: line_no,
                reason: "option before the first question".to_string(),
            })?;
            question.options.push(rest.trim().to_string());
        } else {
            // Continuation line: extends the prompt until the first option
            // appears, afterwards the most recently added option.
            let (_, question) = current.as_mut().ok_or_else(|| ParseError::Malformed {
                line: line_no,
                reason: "continuation before the first question".to_string(),
            })?;
            match question.options.last_mut() {
                Some(option) => {
                    option.push('\n');
                    option.push_str(line);
                }
                None => {
                    question.prompt.push('\n');
                    question.prompt.push_str(line);
                }
            }
        }
    }

    if let Some((opened_at, done)) = current.take() {
        questions.push(finish_question(done, opened_at)?);
    }

    Ok(Test {
        name: name.to_string(),
        questions,
    })
}

fn finish_question(question: Question, line: usize) -> Result<Question, ParseError> {
    if question.correct.is_empty() {
        return Err(ParseError::Malformed {
            line,
            reason: format!("question '{}' has no correct option", question.prompt),
        });
    }
    Ok(question)
}
