//! Seed sample AI-memory documents into the embedded store.
//!
//! Applies the bundled n8n manifest, inserts a short conversation, shows the
//! validator rejecting a malformed message, then runs one TTL purge pass.
//! Run: cargo run --bin seed_memory [data_dir]

use chrono::{Duration, Utc};
use serde_json::json;

use doc_bootstrap::config::Manifest;
use doc_bootstrap::engine::{ApplyPolicy, Bootstrapper};
use doc_bootstrap::report::{print_report, ReportFormat};
use doc_bootstrap::storage::Storage;
use doc_bootstrap::validation::date_value;

const DATABASE: &str = "n8n_ai_memory";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "bootstrap_data".to_string());
    let storage = Storage::open(&data_dir)?;

    let specs = Manifest::parse(include_str!("../manifests/n8n_ai_memory.json"))?.into_specs()?;
    let results = Bootstrapper::new(&storage, ApplyPolicy::default()).run(&specs).await;
    print_report(&results, ReportFormat::Text)?;

    let now = Utc::now();
    let session = format!("session-{}", uuid::Uuid::new_v4());

    let turns = [
        ("human", "What did we decide about the deployment window?"),
        ("ai", "You chose Saturday 02:00 UTC, with a rollback checkpoint at 03:00."),
        ("system", "Conversation summarized."),
    ];
    for (i, (message_type, content)) in turns.iter().enumerate() {
        storage.insert_doc(
            DATABASE,
            "chat_memory",
            json!({
                "sessionId": session,
                "messageType": message_type,
                "content": content,
                "createdAt": date_value(now + Duration::seconds(i as i64)),
            }),
        )?;
    }

    storage.insert_doc(
        DATABASE,
        "ai_sessions",
        json!({
            "sessionId": session,
            "userId": "user-42",
            "context": { "topic": "deployments" },
            "createdAt": date_value(now),
            "lastAccessedAt": date_value(now),
            "expiresAt": date_value(now + Duration::hours(24)),
        }),
    )?;

    storage.insert_doc(
        DATABASE,
        "memory_summaries",
        json!({
            "sessionId": session,
            "summary": "Deployment scheduled for Saturday 02:00 UTC.",
            "keywords": ["deployment", "schedule"],
            "importance": 7,
            "createdAt": date_value(now),
        }),
    )?;
    println!("✅ Seeded session {session}");

    match storage.insert_doc(
        DATABASE,
        "chat_memory",
        json!({ "sessionId": session, "messageType": "robot", "content": "beep" }),
    ) {
        Ok(id) => println!("⚠️  Malformed message was accepted as {id}"),
        Err(e) => println!("✅ Malformed message rejected: {e}"),
    }

    let purged = storage.purge_expired(Utc::now())?;
    println!(
        "📊 chat_memory: {} docs, ai_sessions: {} docs, purged {purged} expired",
        storage.count_docs(DATABASE, "chat_memory")?,
        storage.count_docs(DATABASE, "ai_sessions")?
    );

    Ok(())
}
