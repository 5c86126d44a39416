//! Session registry and state machine.
//!
//! The registry is the only shared structure mutated after startup. Every
//! transition for a given (user, test) key runs under the registry lock;
//! the lock is never held across network I/O. Expiry is enforced lazily:
//! each operation on an existing record first checks the duration budget
//! and transitions `Active -> Expired` when it is exceeded.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::debug;

use crate::catalog::{Catalog, CatalogEntry, Policy};
use crate::parser::{Question, Test};

/// Per-request failures of session transitions. Surfaced to the caller as
/// a structured error response; never fatal for the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("user is not allowed to take this test")]
    Unauthorized,

    #[error("no active session for this user and test")]
    NoActiveSession,

    #[error("a session for this user and test is already active")]
    AlreadySessionActive,

    #[error("no attempts left for this test")]
    AttemptsExhausted,

    #[error("the session has expired")]
    SessionExpired,

    #[error("answer submitted out of order")]
    OutOfOrder,
}

/// Lifecycle state of a session record. Absence of a record is the
/// implicit fourth state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
    Completed,
}

/// The live record of one user's attempt at one test.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// Set when the record turns terminal; drives sweep retention.
    pub ended_at: Option<DateTime<Utc>>,
    /// Question indices this attempt must answer, in order.
    pub variant: Vec<usize>,
    /// Position within `variant` of the next unanswered question.
    pub cursor: usize,
    /// One slot per variant entry; `None` until answered.
    pub answers: Vec<Option<BTreeSet<usize>>>,
    /// Attempts consumed before this session started. A terminal record
    /// accounts for one more.
    pub attempts_used: u32,
}

impl Session {
    fn attempts_consumed(&self) -> u32 {
        match self.state {
            SessionState::Active => self.attempts_used,
            SessionState::Expired | SessionState::Completed => self.attempts_used + 1,
        }
    }
}

type SessionKey = (String, String);

/// Mutable mapping from (user, test) to session. One lock guards the whole
/// map, which serializes transitions per key.
pub struct SessionRegistry {
    catalog: Arc<Catalog>,
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl SessionRegistry {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        SessionRegistry {
            catalog,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn authorize(&self, user: &str, test: &str) -> Result<&CatalogEntry, SessionError> {
        let entry = self.catalog.get(test).ok_or(SessionError::Unauthorized)?;
        if !entry.policy.valid_users.contains(user) {
            return Err(SessionError::Unauthorized);
        }
        Ok(entry)
    }

    /// Start a fresh attempt. Fails when the user is not authorized, an
    /// active session already exists, or the attempt limit is reached.
    /// Returns the variant's questions in order.
    pub fn start_test(
        &self,
        user: &str,
        test: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Question>, SessionError> {
        let entry = self.authorize(user, test)?;
        let mut sessions = self.sessions.write().unwrap();
        Self::start_locked(&mut sessions, entry, user, test, now)
    }

    /// Session creation under an already-held registry lock, so callers
    /// can combine it with other checks in one critical section.
    fn start_locked(
        sessions: &mut HashMap<SessionKey, Session>,
        entry: &CatalogEntry,
        user: &str,
        test: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Question>, SessionError> {
        let key = (user.to_string(), test.to_string());

        let prior_attempts = match sessions.get_mut(&key) {
            None => 0,
            Some(session) => {
                expire_if_stale(session, &entry.policy, now);
                if session.state == SessionState::Active {
                    return Err(SessionError::AlreadySessionActive);
                }
                // An expired record that was never explicitly ended still
                // counts: the attempt was consumed when it timed out.
                session.attempts_consumed()
            }
        };

        if prior_attempts >= entry.policy.max_attempts {
            return Err(SessionError::AttemptsExhausted);
        }

        let variant: Vec<usize> = (0..entry.test.questions.len()).collect();
        let session = Session {
            state: SessionState::Active,
            started_at: now,
            ended_at: None,
            cursor: 0,
            answers: vec![None; variant.len()],
            attempts_used: prior_attempts,
            variant,
        };
        let questions = variant_questions(&session, &entry.test);
        sessions.insert(key, session);

        debug!(user, test, attempt = prior_attempts + 1, "Session started");
        Ok(questions)
    }

    /// Return the question set of the active session, starting a fresh
    /// attempt when no active session exists.
    pub fn get_variant(
        &self,
        user: &str,
        test: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Question>, SessionError> {
        let entry = self.authorize(user, test)?;
        let key = (user.to_string(), test.to_string());

        // Resume-or-start must be one critical section: releasing the
        // lock between the check and the start would let a concurrent
        // call for the same key observe AlreadySessionActive.
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(&key) {
            expire_if_stale(session, &entry.policy, now);
            if session.state == SessionState::Active {
                return Ok(variant_questions(session, &entry.test));
            }
        }

        Self::start_locked(&mut sessions, entry, user, test, now)
    }

    /// Return the question at the cursor, or `None` when every variant
    /// slot has been answered. Does not advance the cursor.
    pub fn next_question(
        &self,
        user: &str,
        test: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Question>, SessionError> {
        let entry = self.authorize(user, test)?;
        let key = (user.to_string(), test.to_string());
        let mut sessions = self.sessions.write().unwrap();

        let session = sessions
            .get_mut(&key)
            .ok_or(SessionError::NoActiveSession)?;
        expire_if_stale(session, &entry.policy, now);

        match session.state {
            SessionState::Expired => Err(SessionError::SessionExpired),
            SessionState::Completed => Err(SessionError::NoActiveSession),
            SessionState::Active => Ok(current_question(session, &entry.test)),
        }
    }

    /// Record the chosen option positions for the question at the cursor
    /// and advance. `question_index` is the variant position the caller
    /// believes it is answering; a mismatch with the cursor is rejected.
    /// Returns the next question, or `None` when the variant is finished.
    pub fn add_answer(
        &self,
        user: &str,
        test: &str,
        question_index: usize,
        chosen: BTreeSet<usize>,
        now: DateTime<Utc>,
    ) -> Result<Option<Question>, SessionError> {
        let entry = self.authorize(user, test)?;
        let key = (user.to_string(), test.to_string());
        let mut sessions = self.sessions.write().unwrap();

        let session = sessions
            .get_mut(&key)
            .ok_or(SessionError::NoActiveSession)?;
        expire_if_stale(session, &entry.policy, now);

        match session.state {
            SessionState::Expired => Err(SessionError::SessionExpired),
            SessionState::Completed => Err(SessionError::NoActiveSession),
            SessionState::Active => {
                if session.cursor >= session.variant.len()
                    || question_index != session.cursor
                {
                    return Err(SessionError::OutOfOrder);
                }
                session.answers[session.cursor] = Some(chosen);
                session.cursor += 1;
                Ok(current_question(session, &entry.test))
            }
        }
    }

    /// Finalize the attempt and score it. Unanswered slots count as
    /// incorrect. Returns the score only when the policy discloses it.
    pub fn end_test(
        &self,
        user: &str,
        test: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, SessionError> {
        let entry = self.authorize(user, test)?;
        let key = (user.to_string(), test.to_string());
        let mut sessions = self.sessions.write().unwrap();

        let session = sessions
            .get_mut(&key)
            .ok_or(SessionError::NoActiveSession)?;
        expire_if_stale(session, &entry.policy, now);

        if session.state == SessionState::Completed {
            return Err(SessionError::NoActiveSession);
        }

        let score = score_attempt(session, &entry.test);
        session.state = SessionState::Completed;
        session.ended_at = Some(now);

        debug!(user, test, score, "Session completed");
        Ok(entry.policy.show_results.then_some(score))
    }

    /// Whether the record for this key is `Completed`.
    pub fn check_done(&self, user: &str, test: &str) -> Result<bool, SessionError> {
        self.authorize(user, test)?;
        let key = (user.to_string(), test.to_string());
        let sessions = self.sessions.read().unwrap();
        Ok(sessions
            .get(&key)
            .is_some_and(|s| s.state == SessionState::Completed))
    }

    /// Current lifecycle state of a record, if one exists.
    pub fn state_of(&self, user: &str, test: &str) -> Option<SessionState> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(&(user.to_string(), test.to_string()))
            .map(|s| s.state)
    }

    /// Evict terminal records whose end timestamp is older than the
    /// retention window. Memory housekeeping only: active records are
    /// never touched.
    pub fn sweep(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|_, session| match session.ended_at {
            Some(ended) if session.state != SessionState::Active => now - ended <= retention,
            _ => true,
        });
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

/// Transition `Active -> Expired` once the duration budget is exceeded.
/// Applied as the first step of every operation on an existing record.
fn expire_if_stale(session: &mut Session, policy: &Policy, now: DateTime<Utc>) {
    if session.state == SessionState::Active && now - session.started_at > policy.duration {
        session.state = SessionState::Expired;
        session.ended_at = Some(now);
    }
}

fn current_question(session: &Session, test: &Test) -> Option<Question> {
    session
        .variant
        .get(session.cursor)
        .map(|&i| test.questions[i].clone())
}

fn variant_questions(session: &Session, test: &Test) -> Vec<Question> {
    session
        .variant
        .iter()
        .map(|&i| test.questions[i].clone())
        .collect()
}

/// Count of variant slots whose recorded choice set equals the question's
/// correct set exactly.
fn score_attempt(session: &Session, test: &Test) -> u32 {
    session
        .variant
        .iter()
        .zip(&session.answers)
        .filter(|(&i, answer)| answer.as_ref() == Some(&test.questions[i].correct))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::parser;
    use std::thread;

    const MATH: &str = "#2+2\n+4\n*5\n#3*3\n*6\n+9\n";

    fn policy(max_attempts: u32, show_results: bool) -> Policy {
        Policy {
            valid_users: ["student".to_string()].into_iter().collect(),
            duration: Duration::seconds(300),
            max_attempts,
            show_results,
            description: "math test".to_string(),
        }
    }

    fn registry(max_attempts: u32, show_results: bool) -> SessionRegistry {
        let mut catalog = Catalog::new();
        catalog.insert(
            parser::parse_test("math", MATH).unwrap(),
            policy(max_attempts, show_results),
        );
        SessionRegistry::new(Arc::new(catalog))
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn answer(indices: &[usize]) -> BTreeSet<usize> {
        indices.iter().copied().collect()
    }

    #[test]
    fn test_start_returns_variant_in_stored_order() {
        let registry = registry(1, true);
        let questions = registry.start_test("student", "math", now()).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].prompt, "2+2");
        assert_eq!(questions[1].prompt, "3*3");
    }

    #[test]
    fn test_unauthorized_user_and_unknown_test() {
        let registry = registry(1, true);
        assert_eq!(
            registry.start_test("mallory", "math", now()),
            Err(SessionError::Unauthorized)
        );
        assert_eq!(
            registry.start_test("student", "history", now()),
            Err(SessionError::Unauthorized)
        );
    }

    #[test]
    fn test_double_start_is_rejected() {
        let registry = registry(3, true);
        let t = now();
        registry.start_test("student", "math", t).unwrap();
        assert_eq!(
            registry.start_test("student", "math", t),
            Err(SessionError::AlreadySessionActive)
        );
    }

    #[test]
    fn test_attempts_exhausted_after_completed_attempts() {
        let registry = registry(2, true);
        let t = now();

        for _ in 0..2 {
            registry.start_test("student", "math", t).unwrap();
            registry.end_test("student", "math", t).unwrap();
        }

        assert_eq!(
            registry.start_test("student", "math", t),
            Err(SessionError::AttemptsExhausted)
        );
    }

    #[test]
    fn test_lazy_expiry_on_next_question() {
        let registry = registry(1, true);
        let t0 = now();
        registry.start_test("student", "math", t0).unwrap();

        // Within budget: still active. The cursor does not advance.
        let q = registry
            .next_question("student", "math", t0 + Duration::seconds(300))
            .unwrap();
        assert_eq!(q.unwrap().prompt, "2+2");

        let err = registry
            .next_question("student", "math", t0 + Duration::seconds(301))
            .unwrap_err();
        assert_eq!(err, SessionError::SessionExpired);
        assert_eq!(
            registry.state_of("student", "math"),
            Some(SessionState::Expired)
        );
    }

    #[test]
    fn test_expired_session_rejects_answers() {
        let registry = registry(1, true);
        let t0 = now();
        registry.start_test("student", "math", t0).unwrap();

        let err = registry
            .add_answer(
                "student",
                "math",
                0,
                answer(&[0]),
                t0 + Duration::seconds(400),
            )
            .unwrap_err();
        assert_eq!(err, SessionError::SessionExpired);
    }

    #[test]
    fn test_perfect_score() {
        let registry = registry(1, true);
        let t = now();
        registry.start_test("student", "math", t).unwrap();

        let next = registry
            .add_answer("student", "math", 0, answer(&[0]), t)
            .unwrap();
        assert_eq!(next.unwrap().prompt, "3*3");

        let next = registry
            .add_answer("student", "math", 1, answer(&[1]), t)
            .unwrap();
        assert!(next.is_none());

        let score = registry.end_test("student", "math", t).unwrap();
        assert_eq!(score, Some(2));
        assert_eq!(registry.check_done("student", "math"), Ok(true));
    }

    #[test]
    fn test_unanswered_and_inexact_answers_score_zero() {
        let registry = registry(1, true);
        let t = now();
        registry.start_test("student", "math", t).unwrap();

        // Superset of the correct positions is not an exact match.
        registry
            .add_answer("student", "math", 0, answer(&[0, 1]), t)
            .unwrap();
        // Second question left unanswered.

        let score = registry.end_test("student", "math", t).unwrap();
        assert_eq!(score, Some(0));
    }

    #[test]
    fn test_score_hidden_when_results_not_shown() {
        let registry = registry(1, false);
        let t = now();
        registry.start_test("student", "math", t).unwrap();
        let score = registry.end_test("student", "math", t).unwrap();
        assert_eq!(score, None);
    }

    #[test]
    fn test_answer_out_of_order() {
        let registry = registry(1, true);
        let t = now();
        registry.start_test("student", "math", t).unwrap();

        // Cursor is at 0; answering slot 1 is out of order.
        assert_eq!(
            registry.add_answer("student", "math", 1, answer(&[0]), t),
            Err(SessionError::OutOfOrder)
        );

        registry
            .add_answer("student", "math", 0, answer(&[0]), t)
            .unwrap();
        registry
            .add_answer("student", "math", 1, answer(&[1]), t)
            .unwrap();

        // Every slot answered; further submissions are out of order.
        assert_eq!(
            registry.add_answer("student", "math", 2, answer(&[0]), t),
            Err(SessionError::OutOfOrder)
        );
    }

    #[test]
    fn test_end_without_session() {
        let registry = registry(1, true);
        assert_eq!(
            registry.end_test("student", "math", now()),
            Err(SessionError::NoActiveSession)
        );
    }

    #[test]
    fn test_end_twice_is_rejected() {
        let registry = registry(2, true);
        let t = now();
        registry.start_test("student", "math", t).unwrap();
        registry.end_test("student", "math", t).unwrap();
        assert_eq!(
            registry.end_test("student", "math", t),
            Err(SessionError::NoActiveSession)
        );
    }

    #[test]
    fn test_end_test_finalizes_expired_session() {
        let registry = registry(1, true);
        let t0 = now();
        registry.start_test("student", "math", t0).unwrap();
        registry
            .add_answer("student", "math", 0, answer(&[0]), t0)
            .unwrap();

        let score = registry
            .end_test("student", "math", t0 + Duration::seconds(500))
            .unwrap();
        assert_eq!(score, Some(1));
        assert_eq!(
            registry.state_of("student", "math"),
            Some(SessionState::Completed)
        );
    }

    #[test]
    fn test_abandoned_expired_attempt_counts() {
        let registry = registry(2, true);
        let t0 = now();
        registry.start_test("student", "math", t0).unwrap();

        // First attempt timed out without an explicit end; the restart
        // consumes it and begins attempt two.
        let t1 = t0 + Duration::seconds(400);
        registry.start_test("student", "math", t1).unwrap();

        let t2 = t1 + Duration::seconds(400);
        assert_eq!(
            registry.start_test("student", "math", t2),
            Err(SessionError::AttemptsExhausted)
        );
    }

    #[test]
    fn test_get_variant_resumes_active_session() {
        let registry = registry(1, true);
        let t = now();
        registry.start_test("student", "math", t).unwrap();
        registry
            .add_answer("student", "math", 0, answer(&[0]), t)
            .unwrap();

        // Resuming returns the question set without resetting progress.
        let questions = registry.get_variant("student", "math", t).unwrap();
        assert_eq!(questions.len(), 2);
        let q = registry.next_question("student", "math", t).unwrap();
        assert_eq!(q.unwrap().prompt, "3*3");
    }

    #[test]
    fn test_next_question_reports_end_of_variant() {
        let registry = registry(1, true);
        let t = now();
        registry.start_test("student", "math", t).unwrap();
        registry
            .add_answer("student", "math", 0, answer(&[0]), t)
            .unwrap();
        registry
            .add_answer("student", "math", 1, answer(&[1]), t)
            .unwrap();

        // Every slot is answered; the session is still active and the
        // cursor sits past the last variant entry.
        assert_eq!(registry.next_question("student", "math", t), Ok(None));
        assert_eq!(
            registry.state_of("student", "math"),
            Some(SessionState::Active)
        );
    }

    #[test]
    fn test_get_variant_starts_when_absent() {
        let registry = registry(1, true);
        let questions = registry.get_variant("student", "math", now()).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(
            registry.state_of("student", "math"),
            Some(SessionState::Active)
        );
    }

    #[test]
    fn test_concurrent_starts_one_winner() {
        let registry = Arc::new(registry(1, true));
        let t = now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.start_test("student", "math", t))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            assert_eq!(result.clone().unwrap_err(), SessionError::AlreadySessionActive);
        }
        assert_eq!(registry.session_count(), 1);
        assert_eq!(
            registry.state_of("student", "math"),
            Some(SessionState::Active)
        );
    }

    #[test]
    fn test_concurrent_get_variant_never_conflicts() {
        // Resume-or-start is atomic: for an authorized user, simultaneous
        // calls on an absent key must all succeed against one session.
        for _ in 0..200 {
            let registry = Arc::new(registry(1, true));
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let t = now();

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        registry.get_variant("student", "math", t)
                    })
                })
                .collect();

            for handle in handles {
                let questions = handle.join().unwrap().unwrap();
                assert_eq!(questions.len(), 2);
            }

            assert_eq!(registry.session_count(), 1);
            assert_eq!(
                registry.state_of("student", "math"),
                Some(SessionState::Active)
            );
        }
    }

    #[test]
    fn test_sweep_evicts_only_stale_terminal_records() {
        let mut catalog = Catalog::new();
        catalog.insert(parser::parse_test("math", MATH).unwrap(), {
            let mut p = policy(1, true);
            p.valid_users.insert("other".to_string());
            p
        });
        let registry = SessionRegistry::new(Arc::new(catalog));

        let t0 = now();
        registry.start_test("student", "math", t0).unwrap();
        registry.end_test("student", "math", t0).unwrap();
        registry.start_test("other", "math", t0).unwrap();

        let retention = Duration::seconds(60);

        // Inside the retention window nothing is evicted.
        assert_eq!(registry.sweep(retention, t0 + Duration::seconds(30)), 0);
        assert_eq!(registry.session_count(), 2);

        // Past the window only the completed record goes; the active one
        // stays even though its duration budget has long passed.
        assert_eq!(registry.sweep(retention, t0 + Duration::seconds(120)), 1);
        assert_eq!(registry.session_count(), 1);
        assert!(registry.state_of("student", "math").is_none());
        assert!(registry.state_of("other", "math").is_some());
    }
}
