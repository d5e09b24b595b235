#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use jitgate_engine::crypto;
use jitgate_engine::{Actor, ChallengeQuestion, Gate, GateConfig, ManualClock};
use jitgate_storage::{
    CaseId, GateStorage, MemoryStorage, NewQuestion, NewUser, QuestionCategory, QuestionId, Role,
    UserRecord,
};
use time::macros::datetime;
use time::OffsetDateTime;

pub const OWNER_PASSWORD: &str = "original-password";

/// Two questions per category with their plaintext answers.
const BANK: [(QuestionCategory, &str, &str); 6] = [
    (QuestionCategory::Static, "What is your account PIN?", "1234"),
    (QuestionCategory::Static, "What city were you born in?", "Bandung"),
    (QuestionCategory::History, "In which month did you open the account?", "june"),
    (QuestionCategory::History, "What was your first top-up amount?", "50000"),
    (QuestionCategory::Usage, "Which phone do you use most?", "iphone"),
    (QuestionCategory::Usage, "Which feature do you use daily?", "transfer"),
];

pub fn start_time() -> OffsetDateTime {
    datetime!(2026-06-01 10:00 UTC)
}

pub struct Harness<S: GateStorage> {
    pub gate: Gate<S>,
    pub clock: Arc<ManualClock>,
    pub owner: UserRecord,
    pub agent_a: Actor,
    pub agent_b: Actor,
    pub auditor: Actor,
    pub case_id: CaseId,
    answers: HashMap<QuestionId, String>,
}

pub async fn harness() -> Harness<MemoryStorage> {
    harness_on(MemoryStorage::new(), GateConfig::default()).await
}

pub async fn harness_with(config: GateConfig) -> Harness<MemoryStorage> {
    harness_on(MemoryStorage::new(), config).await
}

/// An owner with risk score 10, two agents, an auditor, a full question
/// bank and one OPEN case belonging to the owner.
pub async fn harness_on<S: GateStorage>(storage: S, config: GateConfig) -> Harness<S> {
    let storage = Arc::new(storage);
    let clock = Arc::new(ManualClock::new(start_time()));
    let gate = Gate::new(
        storage.clone(),
        config,
        b"engine-test-secret".to_vec(),
        clock.clone(),
    );

    let owner = seed_user(storage.as_ref(), "owner@example.com", Role::User, 10).await;
    let a = seed_user(storage.as_ref(), "agent.a@example.com", Role::Agent, 0).await;
    let b = seed_user(storage.as_ref(), "agent.b@example.com", Role::Agent, 0).await;
    let auditor = seed_user(storage.as_ref(), "auditor@example.com", Role::Auditor, 0).await;
    let answers = seed_bank(storage.as_ref()).await;

    let case = gate
        .claims
        .open_case(Actor::user(owner.id), "cannot log in")
        .await
        .unwrap();

    Harness {
        gate,
        clock,
        owner,
        agent_a: Actor::agent(a.id),
        agent_b: Actor::agent(b.id),
        auditor: Actor::auditor(auditor.id),
        case_id: case.id,
        answers,
    }
}

pub async fn seed_user<S: GateStorage>(
    storage: &S,
    email: &str,
    role: Role,
    risk_score: i64,
) -> UserRecord {
    let mut snap = storage.begin_snapshot().await.unwrap();
    let user = storage
        .insert_user(
            &mut snap,
            NewUser {
                email: email.to_string(),
                role,
                risk_score,
                credential_digest: crypto::hash_password(OWNER_PASSWORD),
                created_at: start_time(),
            },
        )
        .await
        .unwrap();
    storage.commit_snapshot(snap).await.unwrap();
    user
}

async fn seed_bank<S: GateStorage>(storage: &S) -> HashMap<QuestionId, String> {
    let mut snap = storage.begin_snapshot().await.unwrap();
    let mut answers = HashMap::new();
    for (category, prompt, answer) in BANK {
        let q = storage
            .insert_question(
                &mut snap,
                NewQuestion {
                    category,
                    prompt: prompt.to_string(),
                    answer_digest: crypto::hash_answer(answer),
                },
            )
            .await
            .unwrap();
        answers.insert(q.id, answer.to_string());
    }
    storage.commit_snapshot(snap).await.unwrap();
    answers
}

/// The session id is the last path segment of the verification URL.
pub fn session_id(verification_url: &str) -> String {
    verification_url
        .rsplit('/')
        .next()
        .unwrap()
        .to_string()
}

impl<S: GateStorage> Harness<S> {
    pub fn owner(&self) -> Actor {
        Actor::user(self.owner.id)
    }

    pub fn correct_answers(&self, questions: &[ChallengeQuestion]) -> HashMap<QuestionId, String> {
        questions
            .iter()
            .map(|q| (q.id, self.answers[&q.id].clone()))
            .collect()
    }

    /// Correct for every question except the last.
    pub fn one_wrong_answer(&self, questions: &[ChallengeQuestion]) -> HashMap<QuestionId, String> {
        let mut answers = self.correct_answers(questions);
        let last = questions.last().unwrap().id;
        answers.insert(last, "definitely wrong".to_string());
        answers
    }

    /// Claim the harness case as agent A and start a session; returns its id.
    pub async fn claimed_session(&self) -> String {
        self.gate
            .claims
            .claim(self.agent_a, self.case_id)
            .await
            .unwrap();
        let link = self
            .gate
            .verification
            .start(self.agent_a, self.case_id)
            .await
            .unwrap();
        session_id(&link.verification_url)
    }

    /// Run a session to PASSED.
    pub async fn passed_session(&self) -> String {
        let session = self.claimed_session().await;
        let questions = self.gate.verification.get_challenge(&session).await.unwrap();
        let outcome = self
            .gate
            .verification
            .submit_answers(&session, &self.correct_answers(&questions))
            .await
            .unwrap();
        assert!(outcome.passed);
        session
    }
}
