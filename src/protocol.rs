//! Wire protocol: request decoding, command dispatch, response encoding.
//!
//! Each connection carries exactly one JSON request and receives exactly
//! one JSON response. All durable state lives in the session registry,
//! addressed by the (user, test) pair carried in the request.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::parser::Question;
use crate::session::{SessionError, SessionRegistry};

/// One request per connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub user: String,
    pub command: String,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub question_index: Option<usize>,
    #[serde(default)]
    pub chosen_indices: Option<Vec<usize>>,
}

/// A question as disclosed to clients. Carries no correctness data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionView {
    pub prompt: String,
    pub options: Vec<String>,
}

impl From<Question> for QuestionView {
    fn from(question: Question) -> Self {
        QuestionView {
            prompt: question.prompt,
            options: question.options,
        }
    }
}

/// One response per connection.
#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Done {
        done: bool,
    },
    Banner {
        description: String,
    },
    Variant {
        questions: Vec<QuestionView>,
    },
    Answer {
        accepted: bool,
        next: Option<QuestionView>,
    },
    Finished {
        done: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        score: Option<u32>,
    },
    Tests {
        tests: Vec<String>,
    },
    Error {
        error: &'static str,
        message: String,
    },
}

impl Response {
    pub fn malformed(message: impl Into<String>) -> Self {
        Response::Error {
            error: "malformed_request",
            message: message.into(),
        }
    }
}

impl From<SessionError> for Response {
    fn from(err: SessionError) -> Self {
        let code = match err {
            SessionError::Unauthorized => "unauthorized",
            SessionError::NoActiveSession => "no_active_session",
            SessionError::AlreadySessionActive => "already_active",
            SessionError::AttemptsExhausted => "attempts_exhausted",
            SessionError::SessionExpired => "session_expired",
            SessionError::OutOfOrder => "out_of_order",
        };
        Response::Error {
            error: code,
            message: err.to_string(),
        }
    }
}

fn views(questions: Vec<Question>) -> Vec<QuestionView> {
    questions.into_iter().map(QuestionView::from).collect()
}

/// Authorize the request and run the corresponding registry transition.
/// Per-request failures become structured error responses; they never
/// escape to the connection handler.
pub fn dispatch(catalog: &Catalog, registry: &SessionRegistry, request: &Request) -> Response {
    let now = Utc::now();
    let user = request.user.as_str();

    if request.command == "list_tests" {
        if !catalog.knows_user(user) {
            return SessionError::Unauthorized.into();
        }
        return Response::Tests {
            tests: catalog.tests_for(user),
        };
    }

    let Some(test) = request.test.as_deref() else {
        return Response::malformed("missing field 'test'");
    };

    if !catalog.knows_user(user) {
        return SessionError::Unauthorized.into();
    }

    match request.command.as_str() {
        "check_done" => match registry.check_done(user, test) {
            Ok(done) => Response::Done { done },
            Err(err) => err.into(),
        },

        "get_banner" => match catalog.get(test) {
            Some(entry) if entry.policy.valid_users.contains(user) => Response::Banner {
                description: entry.policy.description.clone(),
            },
            // Existence of tests the user may not take is not disclosed.
            _ => SessionError::Unauthorized.into(),
        },

        "get_variant" => match registry.get_variant(user, test, now) {
            Ok(questions) => Response::Variant {
                questions: views(questions),
            },
            Err(err) => err.into(),
        },

        "check_answer" => {
            let (Some(question_index), Some(chosen)) =
                (request.question_index, request.chosen_indices.as_ref())
            else {
                return Response::malformed(
                    "check_answer requires 'question_index' and 'chosen_indices'",
                );
            };
            let chosen: BTreeSet<usize> = chosen.iter().copied().collect();
            match registry.add_answer(user, test, question_index, chosen, now) {
                Ok(next) => Response::Answer {
                    accepted: true,
                    next: next.map(QuestionView::from),
                },
                Err(err) => err.into(),
            }
        }

        "end_test" => match registry.end_test(user, test, now) {
            Ok(score) => Response::Finished { done: true, score },
            Err(err) => err.into(),
        },

        other => Response::malformed(format!("unrecognized command '{other}'")),
    }
}
