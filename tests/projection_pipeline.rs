//! Envelope in, search result out: dispatcher, projections, index and query
//! parser wired together over the in-memory index.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use overflow_sync::api::{search_router, SearchState};
use overflow_sync::event::{
    AnswerAccepted, AnswerCountChanged, QuestionCreated, QuestionDeleted, QuestionUpdated,
};
use overflow_sync::index::{ensure_schema, question_schema, BootstrapOutcome, MemoryIndex};
use overflow_sync::{query, Dispatcher, Disposition, DomainEvent, SearchIndex};
use overflow_sync::dispatch::IncomingMessage;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const COLLECTION: &str = "questions";

struct Pipeline {
    memory: Arc<MemoryIndex>,
    dispatcher: Dispatcher,
}

impl Pipeline {
    async fn new() -> Self {
        let memory = Arc::new(MemoryIndex::new());
        let schema = question_schema(COLLECTION);
        assert_eq!(
            ensure_schema(memory.as_ref(), &schema).await.unwrap(),
            BootstrapOutcome::Created
        );
        assert_eq!(
            ensure_schema(memory.as_ref(), &schema).await.unwrap(),
            BootstrapOutcome::Existing
        );

        let index: Arc<dyn SearchIndex> = memory.clone();
        Self {
            memory,
            dispatcher: Dispatcher::with_projections(index, COLLECTION),
        }
    }

    async fn deliver(&self, event: &DomainEvent) -> Disposition {
        let body = event.to_envelope().unwrap();
        self.dispatcher
            .handle(IncomingMessage {
                body: &body,
                type_hint: Some(event.kind().as_str()),
                retry_count: 0,
            })
            .await
    }

    async fn search(&self, raw: &str) -> Vec<String> {
        let query = query::parse(raw).to_search_query(20);
        self.memory
            .search(COLLECTION, &query)
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.id)
            .collect()
    }
}

fn created(id: &str, title: &str, content: &str, tags: &[&str]) -> DomainEvent {
    DomainEvent::QuestionCreated(QuestionCreated {
        question_id: id.into(),
        title: title.into(),
        content: content.into(),
        created_at: "2025-12-24T14:11:34Z".parse().unwrap(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    })
}

#[tokio::test]
async fn test_question_lifecycle() {
    let pipeline = Pipeline::new().await;

    let create = created(
        "q1",
        "Design patterns in Rust",
        "<p>Which <b>patterns</b> survive the borrow checker?</p>",
        &["rust", "design"],
    );
    assert_eq!(pipeline.deliver(&create).await, Disposition::Ack);

    let doc = pipeline.memory.document(COLLECTION, "q1").await.unwrap();
    assert_eq!(doc.content, "Which patterns survive the borrow checker?");
    assert_eq!(doc.created_at, 1_766_585_494);
    assert!(!doc.has_accepted_answer);
    assert_eq!(doc.answer_count, 0);

    assert_eq!(pipeline.search("design patterns [rust]").await, vec!["q1"]);
    assert!(pipeline.search("design patterns [go]").await.is_empty());

    // Redelivered create leaves the document as it was
    assert_eq!(pipeline.deliver(&create).await, Disposition::Ack);
    assert_eq!(pipeline.memory.document_count(COLLECTION).await, 1);

    let update = DomainEvent::QuestionUpdated(QuestionUpdated {
        question_id: "q1".into(),
        title: "Idiomatic patterns in Rust".into(),
        content: "<i>Typestate</i> and builders".into(),
        tags: vec!["rust".into()],
    });
    assert_eq!(pipeline.deliver(&update).await, Disposition::Ack);
    assert_eq!(pipeline.search("typestate").await, vec!["q1"]);
    assert!(pipeline.search("[design]").await.is_empty());

    let count = DomainEvent::AnswerCountChanged(AnswerCountChanged {
        question_id: "q1".into(),
        answer_count: 2,
    });
    let before = pipeline.memory.document(COLLECTION, "q1").await.unwrap();
    assert_eq!(pipeline.deliver(&count).await, Disposition::Ack);
    let after = pipeline.memory.document(COLLECTION, "q1").await.unwrap();
    assert_eq!(after.answer_count, 2);
    assert_eq!(after.title, before.title);
    assert_eq!(after.content, before.content);
    assert_eq!(after.tags, before.tags);
    assert_eq!(after.has_accepted_answer, before.has_accepted_answer);

    let accepted = DomainEvent::AnswerAccepted(AnswerAccepted {
        question_id: "q1".into(),
        answer_id: "a7".into(),
    });
    assert_eq!(pipeline.deliver(&accepted).await, Disposition::Ack);
    assert!(
        pipeline
            .memory
            .document(COLLECTION, "q1")
            .await
            .unwrap()
            .has_accepted_answer
    );

    let delete = DomainEvent::QuestionDeleted(QuestionDeleted {
        question_id: "q1".into(),
    });
    assert_eq!(pipeline.deliver(&delete).await, Disposition::Ack);
    assert_eq!(pipeline.deliver(&delete).await, Disposition::Ack);
    assert!(pipeline.search("patterns").await.is_empty());
}

#[tokio::test]
async fn test_events_for_unknown_question_are_retried() {
    let pipeline = Pipeline::new().await;

    let count = DomainEvent::AnswerCountChanged(AnswerCountChanged {
        question_id: "ghost".into(),
        answer_count: 1,
    });

    assert!(matches!(
        pipeline.deliver(&count).await,
        Disposition::Retry { retry_count: 1, .. }
    ));
}

#[tokio::test]
async fn test_search_endpoint_over_projected_documents() {
    let pipeline = Pipeline::new().await;
    for event in [
        created("q1", "Async traits", "object safety", &["rust"]),
        created("q2", "Async generators", "yield in python", &["python"]),
    ] {
        assert_eq!(pipeline.deliver(&event).await, Disposition::Ack);
    }

    let index: Arc<dyn SearchIndex> = pipeline.memory.clone();
    let app = search_router(Arc::new(SearchState::new(index, COLLECTION, 20)));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/search?query=async%20%5Bpython%5D")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let hits = body.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], "q2");
    assert_eq!(hits[0]["tags"][0], "python");
}
