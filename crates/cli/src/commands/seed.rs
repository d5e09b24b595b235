//! Demo data for a fresh database.

use std::path::PathBuf;

use jitgate_engine::crypto;
use jitgate_storage::{
    GateStorage, NewQuestion, NewUser, QuestionCategory, Role, SqliteStorage, StorageError,
    UserRecord,
};
use time::OffsetDateTime;
use tracing::info;

use crate::{CliError, OutputFormat};

pub(crate) const DEMO_PASSWORD: &str = "password123";

const DEMO_USERS: [(&str, Role, i64); 4] = [
    ("user@example.com", Role::User, 10),
    ("cs1@example.com", Role::Agent, 0),
    ("cs2@example.com", Role::Agent, 0),
    ("auditor@example.com", Role::Auditor, 0),
];

const QUESTION_BANK: [(QuestionCategory, &str, &str); 3] = [
    (
        QuestionCategory::Static,
        "What are the last 4 digits of your registered phone number?",
        "1234",
    ),
    (
        QuestionCategory::History,
        "In which month did you make your last top-up?",
        "june",
    ),
    (
        QuestionCategory::Usage,
        "Which device did you use for your last login?",
        "iphone",
    ),
];

pub(crate) async fn cmd_seed(db: PathBuf, output: OutputFormat) -> Result<(), CliError> {
    let storage = SqliteStorage::open(&db)?;
    let now = OffsetDateTime::now_utc();

    let mut snap = storage.begin_snapshot().await?;
    let mut users: Vec<UserRecord> = Vec::new();
    for (email, role, risk_score) in DEMO_USERS {
        let inserted = storage
            .insert_user(
                &mut snap,
                NewUser {
                    email: email.to_string(),
                    role,
                    risk_score,
                    credential_digest: crypto::hash_password(DEMO_PASSWORD),
                    created_at: now,
                },
            )
            .await;
        match inserted {
            Ok(user) => users.push(user),
            Err(StorageError::Duplicate { .. }) => {
                return Err(CliError::Other(format!(
                    "{} is already seeded",
                    db.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    for (category, prompt, answer) in QUESTION_BANK {
        storage
            .insert_question(
                &mut snap,
                NewQuestion {
                    category,
                    prompt: prompt.to_string(),
                    answer_digest: crypto::hash_answer(answer),
                },
            )
            .await?;
    }
    storage.commit_snapshot(snap).await?;
    info!(users = users.len(), questions = QUESTION_BANK.len(), "database seeded");

    match output {
        OutputFormat::Text => {
            for user in &users {
                println!("{:>4}  {:<8} {}", user.id, user.role, user.email);
            }
            println!("{} challenge questions", QUESTION_BANK.len());
        }
        OutputFormat::Json => {
            let users: Vec<serde_json::Value> = users
                .iter()
                .map(|u| serde_json::json!({ "id": u.id, "email": u.email, "role": u.role }))
                .collect();
            println!(
                "{}",
                serde_json::json!({ "users": users, "questions": QUESTION_BANK.len() })
            );
        }
    }
    Ok(())
}
