use std::sync::Arc;

use ember_memory::config::{Config, MemoryConfig, RateLimitConfig, StoreConfig};
use ember_memory::interfaces::ConversationMemory;
use ember_memory::memory::{strip_directive_tags, LearnOutcome, MemoryManager};
use ember_memory::store::{FactCategory, FactSource, Role, StorageEngine};
use ember_memory::subsystem::MemorySubsystem;
use ember_memory::EmberError;

async fn manager_with_engine(dir: &tempfile::TempDir) -> (MemoryManager, Arc<StorageEngine>) {
    let cfg = StoreConfig::at(dir.path().join("ember.db"));
    let engine = Arc::new(StorageEngine::open(cfg).await.unwrap());
    (
        MemoryManager::new(engine.clone(), MemoryConfig::default()),
        engine,
    )
}

fn stored_count(outcomes: &[LearnOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, LearnOutcome::Stored(_)))
        .count()
}

#[tokio::test]
async fn later_name_statement_replaces_the_earlier_one() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, engine) = manager_with_engine(&dir).await;

    manager
        .learn_from_text("Ich heiße Anna.", FactSource::default())
        .await;
    manager
        .learn_from_text("Moment, ich heiße Bernd.", FactSource::default())
        .await;

    let names: Vec<String> = engine
        .facts()
        .await
        .unwrap()
        .into_iter()
        .filter(|f| f.category == FactCategory::Name)
        .map(|f| f.value)
        .collect();
    assert_eq!(names, vec!["Bernd"]);
}

#[tokio::test]
async fn within_one_text_only_the_last_name_span_wins() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, engine) = manager_with_engine(&dir).await;

    let outcomes = manager
        .learn_from_text(
            "Ich heiße Anna. Quatsch, ich heiße Bernd.",
            FactSource::default(),
        )
        .await;
    assert_eq!(stored_count(&outcomes), 1);

    let facts = engine.facts().await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].value, "Bernd");
}

#[tokio::test]
async fn interests_accumulate_without_case_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, engine) = manager_with_engine(&dir).await;

    manager
        .learn_from_text("Ich mag Lesen.", FactSource::default())
        .await;
    manager
        .learn_from_text("Ich mag Wandern.", FactSource::default())
        .await;
    let outcomes = manager
        .learn_from_text("Ich mag LESEN.", FactSource::default())
        .await;
    assert_eq!(stored_count(&outcomes), 0);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, LearnOutcome::Dropped { .. })));

    let interests: Vec<String> = engine
        .facts()
        .await
        .unwrap()
        .into_iter()
        .filter(|f| f.category == FactCategory::Interest)
        .map(|f| f.value)
        .collect();
    assert_eq!(interests, vec!["Lesen", "Wandern"]);
}

#[tokio::test]
async fn directives_store_notes_verbatim_and_strip_for_display() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, engine) = manager_with_engine(&dir).await;

    let reply = "Verstanden! [MERKEN: Nutzer ist Vegetarier] Was koche ich heute?";
    let outcomes = manager.learn_from_text(reply, FactSource::default()).await;
    assert_eq!(stored_count(&outcomes), 1);

    let facts = engine.facts().await.unwrap();
    assert_eq!(facts[0].category, FactCategory::Note);
    assert_eq!(facts[0].value, "Nutzer ist Vegetarier");
    assert_eq!(facts[0].confidence, Some(0.95));

    assert_eq!(
        strip_directive_tags(reply),
        "Verstanden! Was koche ich heute?"
    );
}

#[tokio::test]
async fn unmatched_text_learns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, engine) = manager_with_engine(&dir).await;
    let outcomes = manager
        .learn_from_text("Wie spät ist es?", FactSource::default())
        .await;
    assert!(outcomes.is_empty());
    assert!(engine.facts().await.unwrap().is_empty());
}

#[tokio::test]
async fn summary_respects_priority_and_budget() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _engine) = manager_with_engine(&dir).await;

    manager
        .learn_from_text(
            "Ich heiße Anna. Ich wohne in Berlin. Ich bin 29 Jahre alt. Ich mag Lesen. Ich mag Wandern.",
            FactSource::default(),
        )
        .await;

    let full = manager.summary().await.unwrap();
    assert_eq!(
        full,
        "Name: Anna\nWohnort: Berlin\nAlter: 29 Jahre\nMag: Lesen, Wandern"
    );

    // A tight budget drops whole lines from the bottom, values stay intact.
    let tight = manager.summary_with_budget(26).await.unwrap();
    assert_eq!(tight, "Name: Anna\nWohnort: Berlin");
}

#[tokio::test]
async fn subsystem_rate_limits_user_turns() {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreConfig::at(dir.path().join("ember.db"));
    let cfg = Config {
        store,
        rate_limit: RateLimitConfig {
            max_requests: 2,
            window_seconds: 60,
        },
        memory: MemoryConfig::default(),
    };
    let subsystem = MemorySubsystem::open(cfg).await.unwrap();
    let session = subsystem.engine().create_session("Limitiert").await.unwrap();

    subsystem
        .record_message("anna", session.id, Role::User, "eins")
        .await
        .unwrap();
    subsystem
        .record_message("anna", session.id, Role::User, "zwei")
        .await
        .unwrap();
    let err = subsystem
        .record_message("anna", session.id, Role::User, "drei")
        .await
        .unwrap_err();
    assert!(matches!(err, EmberError::RateLimited));

    // Assistant turns are replies, not requests.
    subsystem
        .record_message("anna", session.id, Role::Assistant, "antwort")
        .await
        .unwrap();

    let summary = subsystem.context_summary().await.unwrap();
    assert!(summary.is_empty());
}

#[tokio::test]
async fn subsystem_learns_through_the_trait() {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreConfig::at(dir.path().join("ember.db"));
    let cfg = Config {
        store,
        rate_limit: RateLimitConfig::default(),
        memory: MemoryConfig::default(),
    };
    let subsystem = MemorySubsystem::open(cfg).await.unwrap();

    let outcomes = subsystem
        .learn_from_text("anna", "Ich wohne in Köln.", FactSource::default())
        .await
        .unwrap();
    assert_eq!(stored_count(&outcomes), 1);
    assert_eq!(
        subsystem.context_summary().await.unwrap(),
        "Wohnort: Köln"
    );
}

#[tokio::test]
async fn interest_dedup_holds_for_umlauts_across_texts() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, engine) = manager_with_engine(&dir).await;

    manager
        .learn_from_text("Ich mag München.", FactSource::default())
        .await;
    let outcomes = manager
        .learn_from_text("Ich mag MÜNCHEN.", FactSource::default())
        .await;
    assert_eq!(stored_count(&outcomes), 0);

    let interests: Vec<String> = engine
        .facts()
        .await
        .unwrap()
        .into_iter()
        .filter(|f| f.category == FactCategory::Interest)
        .map(|f| f.value)
        .collect();
    assert_eq!(interests, vec!["München"]);
}

#[tokio::test]
async fn admit_check_does_not_consume_window_slots() {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreConfig::at(dir.path().join("ember.db"));
    let cfg = Config {
        store,
        rate_limit: RateLimitConfig {
            max_requests: 2,
            window_seconds: 60,
        },
        memory: MemoryConfig::default(),
    };
    let subsystem = MemorySubsystem::open(cfg).await.unwrap();
    let session = subsystem.engine().create_session("Vorschau").await.unwrap();

    // Check-then-persist spends one slot per turn, however often the
    // caller peeks first.
    for _ in 0..10 {
        assert!(subsystem.admit("anna"));
    }
    subsystem
        .record_message("anna", session.id, Role::User, "eins")
        .await
        .unwrap();
    assert!(subsystem.admit("anna"));
    subsystem
        .record_message("anna", session.id, Role::User, "zwei")
        .await
        .unwrap();

    assert!(!subsystem.admit("anna"));
    let err = subsystem
        .record_message("anna", session.id, Role::User, "drei")
        .await
        .unwrap_err();
    assert!(matches!(err, EmberError::RateLimited));
}
