mod common;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use common::{new_message, pipeline, seed_facts, FakeNlu, FakeProvider};
use mailfacts::models::{FactType, IntentAction, NewFact, QueryDocuments};
use mailfacts::nlu::NluError;
use mailfacts::ErrorKind;
use serde_json::{json, Value};
use tempfile::TempDir;

fn mid_march() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
}

fn price(value: &str, confidence: f64) -> NewFact {
    NewFact {
        fact_type: FactType::Price,
        value: value.to_string(),
        confidence,
        metadata: json!({"currency": "USD"}),
    }
}

fn scripted(intent: Value, answer: Result<&'static str, ()>) -> Arc<FakeNlu> {
    Arc::new(
        FakeNlu::default()
            .on_json(move |_| Ok(intent.clone()))
            .on_text(move |_| {
                answer
                    .map(str::to_string)
                    .map_err(|()| NluError::Network("connection reset".to_string()))
            }),
    )
}

#[tokio::test]
async fn total_spent_this_month_end_to_end() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(
        json!({"action": "sum", "entity": "price", "filter": {"month": "current"}, "limit": 100}),
        Ok("You spent $199.50 this month."),
    );
    let (db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), Arc::clone(&nlu));

    seed_facts(&db, "u1", "march", &[price("199.50", 0.95)], Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
    seed_facts(&db, "u1", "february", &[price("80.00", 0.95)], Utc.with_ymd_and_hms(2026, 2, 27, 9, 0, 0).unwrap());
    seed_facts(&db, "u1", "unsure", &[price("15.00", 0.3)], Utc.with_ymd_and_hms(2026, 3, 11, 9, 0, 0).unwrap());
    seed_facts(&db, "u2", "someone-else", &[price("999.00", 0.99)], Utc.with_ymd_and_hms(2026, 3, 12, 9, 0, 0).unwrap());

    let reply = pipeline
        .answer_query_at("u1", "Total spent this month", mid_march())
        .await
        .unwrap();

    assert_eq!(reply.answer, "You spent $199.50 this month.");
    assert_eq!(reply.intent.action, IntentAction::Sum);
    assert_eq!(reply.data.total, Some(199.5));
    assert_eq!(reply.data.count, 1);

    let requests = nlu.recorded();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].system.contains("Current date: 2026-03-15"));
    assert_eq!(requests[0].temperature, 0.0);
    assert_eq!(requests[0].max_tokens, 300);
    assert!(requests[1].user.starts_with("User asked: \"Total spent this month\""));
    assert!(requests[1].user.contains("\"total\":199.5"));
    assert!((requests[1].temperature - 0.3).abs() < f32::EPSILON);

    let body = serde_json::to_value(&reply).unwrap();
    assert_eq!(body["data"]["action"], "sum");
    assert_eq!(body["data"]["documents"][0]["type"], "price");
}

#[tokio::test]
async fn stored_price_sums_exactly() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(json!({"action": "sum", "entity": "price"}), Ok("ok"));
    let (db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), nlu);
    seed_facts(&db, "u1", "m1", &[price("349.00", 0.9)], mid_march());

    let reply = pipeline.answer_query_at("u1", "How much?", mid_march()).await.unwrap();
    assert_eq!(reply.data.total, Some(349.0));
    assert_eq!(reply.data.count, 1);
}

#[tokio::test]
async fn confidence_threshold_is_strict() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(json!({"action": "list", "entity": "price"}), Ok("One price."));
    let (db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), nlu);
    seed_facts(&db, "u1", "m1", &[price("10.00", 0.4), price("11.00", 0.41)], mid_march());

    let reply = pipeline.answer_query_at("u1", "List prices", mid_march()).await.unwrap();
    assert_eq!(reply.data.count, 1);
    match &reply.data.documents {
        QueryDocuments::Facts(rows) => assert_eq!(rows[0].value, "11.00"),
        QueryDocuments::Messages(_) => panic!("expected facts"),
    }
}

#[tokio::test]
async fn merchant_filter_matches_substring_case_insensitively() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(
        json!({"action": "count", "entity": "merchant", "filter": {"merchant": "bottle"}}),
        Ok("Twice."),
    );
    let (db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), nlu);
    let merchant = |value: &str| NewFact {
        fact_type: FactType::Merchant,
        value: value.to_string(),
        confidence: 0.9,
        metadata: json!({}),
    };
    seed_facts(&db, "u1", "m1", &[merchant("Blue Bottle Coffee")], mid_march());
    seed_facts(&db, "u1", "m2", &[merchant("BLUE BOTTLE")], mid_march());
    seed_facts(&db, "u1", "m3", &[merchant("Bottleneck_Inc 100%")], mid_march());
    seed_facts(&db, "u1", "m4", &[merchant("Blue Cup")], mid_march());

    let reply = pipeline.answer_query_at("u1", "How often at Blue Bottle?", mid_march()).await.unwrap();
    assert_eq!(reply.data.count, 3);
    assert_eq!(reply.data.total, None);
}

#[tokio::test]
async fn narration_failure_uses_template() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(json!({"action": "list", "entity": "price"}), Err(()));
    let (db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), nlu);
    seed_facts(&db, "u1", "m1", &[price("5.00", 0.9), price("6.00", 0.9)], mid_march());

    let reply = pipeline.answer_query_at("u1", "List prices", mid_march()).await.unwrap();
    assert_eq!(reply.answer, "Found 2 results. Please see data below.");
}

#[tokio::test]
async fn empty_narration_uses_template() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(json!({"action": "list", "entity": "otp"}), Ok("   "));
    let (_db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), nlu);

    let reply = pipeline.answer_query_at("u1", "Any codes?", mid_march()).await.unwrap();
    assert_eq!(reply.answer, "Found 0 results. Please see data below.");
}

#[tokio::test]
async fn email_entity_searches_subjects() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(
        json!({"action": "find", "entity": "email", "filter": {"keyword": "invoice", "month": "2026-03"}}),
        Ok("Two invoices."),
    );
    let (db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), nlu);

    let in_march = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2026, 3, 20, 10, 0, 0).unwrap();
    let april = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
    db.insert_message(&new_message("u1", "a", "Invoice #12", in_march), in_march).unwrap();
    db.insert_message(&new_message("u1", "b", "Your invoice is ready", later), later).unwrap();
    db.insert_message(&new_message("u1", "c", "Invoice #13", april), april).unwrap();
    db.insert_message(&new_message("u1", "d", "Lunch?", in_march), in_march).unwrap();

    let reply = pipeline.answer_query_at("u1", "Find invoice emails", mid_march()).await.unwrap();
    assert_eq!(reply.data.count, 2);
    match &reply.data.documents {
        QueryDocuments::Messages(rows) => {
            assert_eq!(rows[0].subject, "Your invoice is ready");
            assert_eq!(rows[1].subject, "Invoice #12");
        }
        QueryDocuments::Facts(_) => panic!("expected messages"),
    }
}

#[tokio::test]
async fn unusable_intent_is_not_understood() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(json!({"action": "delete", "entity": "price"}), Ok("unused"));
    let (_db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), Arc::clone(&nlu));

    let err = pipeline.answer_query_at("u1", "Drop everything", mid_march()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotUnderstood);
    assert_eq!(err.status_code(), 422);
    assert_eq!(nlu.recorded().len(), 1);
}

#[tokio::test]
async fn overlong_question_is_invalid_input() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(json!({}), Ok("unused"));
    let (_db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), Arc::clone(&nlu));

    let err = pipeline
        .answer_query_at("u1", &"a".repeat(501), mid_march())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(nlu.recorded().is_empty());
}

#[tokio::test]
async fn store_read_failure_is_query_failed() {
    let dir = TempDir::new().unwrap();
    let nlu = scripted(json!({"action": "list", "entity": "price"}), Ok("unused"));
    let (db, pipeline) = pipeline(&dir, Arc::new(FakeProvider::default()), Arc::clone(&nlu));
    db.get_connection().unwrap().execute_batch("DROP TABLE facts;").unwrap();

    let err = pipeline.answer_query_at("u1", "List prices", mid_march()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryFailed);
    assert_eq!(err.status_code(), 500);
    // Parsing succeeded, narration never ran
    assert_eq!(nlu.recorded().len(), 1);
}
