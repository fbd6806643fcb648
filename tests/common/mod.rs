//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::OnceCell;

use simple_bank::api::{build_app, AppState};
use simple_bank::mail::MemorySender;
use simple_bank::store::{AddAccountBalanceParams, MemoryStore, Store};
use simple_bank::worker::{
    BrokerTaskDistributor, MemoryBroker, SendVerifyEmailHandler, ServeMux, TaskOptions,
    QUEUE_CRITICAL, TASK_SEND_VERIFY_EMAIL,
};
use simple_bank::{Ledger, OperationContext};

pub const VERIFY_URL: &str = "http://localhost:8080/v1/verify_email";

// =========================================================================
// In-memory harness
// =========================================================================

/// Every collaborator of the running service, backed by memory
#[derive(Clone)]
pub struct Harness {
    pub store: MemoryStore,
    pub broker: MemoryBroker,
    pub mailer: MemorySender,
    pub ledger: Ledger,
    pub app: Router,
}

impl Harness {
    pub fn new() -> Self {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new().with_broker(broker.clone());
        let mailer = MemorySender::new();

        let distributor = Arc::new(BrokerTaskDistributor::new(Arc::new(broker.clone())));
        let ledger = Ledger::new(Arc::new(store.clone()), distributor);

        let options = TaskOptions::new()
            .queue(QUEUE_CRITICAL)
            .max_retry(10)
            .process_in(Duration::from_secs(10));
        let app = build_app(AppState::new(ledger.clone(), options));

        Self {
            store,
            broker,
            mailer,
            ledger,
            app,
        }
    }

    /// Routes the verification task to the in-memory mailer
    pub fn mux(&self) -> ServeMux {
        let mut mux = ServeMux::new();
        mux.handle(
            TASK_SEND_VERIFY_EMAIL,
            Arc::new(SendVerifyEmailHandler::new(
                Arc::new(self.store.clone()),
                Arc::new(self.mailer.clone()),
                VERIFY_URL,
            )),
        );
        mux
    }

    pub async fn fund(&self, account_id: i64, amount: i64) {
        let ctx = OperationContext::new();
        let mut conn = self.store.connect(&ctx).await.unwrap();
        conn.add_account_balance(
            &ctx,
            &AddAccountBalanceParams {
                id: account_id,
                amount,
            },
        )
        .await
        .unwrap();
    }

    pub async fn send(&self, request: Request<Body>) -> (Response<Body>, Value) {
        use tower::util::ServiceExt;

        let response = self.app.clone().oneshot(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (Response::from_parts(parts, Body::empty()), json)
    }
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// =========================================================================
// PostgreSQL
// =========================================================================

static SCHEMA: OnceCell<()> = OnceCell::const_new();

/// Connect to `DATABASE_URL`, creating the schema on first use.
///
/// Tables are not truncated; tests use unique names so they can share a
/// database and run in parallel.
pub async fn setup_test_db() -> PgPool {
    setup_test_db_with(PgPoolOptions::new().max_connections(20)).await
}

/// Like `setup_test_db` with caller-chosen pool limits
pub async fn setup_test_db_with(options: PgPoolOptions) -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    SCHEMA
        .get_or_init(|| async {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(&database_url)
                .await
                .expect("Failed to connect to DB");

            if !simple_bank::db::check_schema(&pool).await.unwrap() {
                let migration = include_str!("../../migrations/0001_init.sql");
                for statement in migration.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                    sqlx::query(statement)
                        .execute(&pool)
                        .await
                        .expect("Failed to apply migration");
                }
            }
            pool.close().await;
        })
        .await;

    options
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB")
}

/// Lower-case name unique to this test run
pub fn unique(prefix: &str) -> String {
    format!(
        "{}_{}",
        prefix,
        simple_bank::worker::random_string(12).to_lowercase()
    )
}
