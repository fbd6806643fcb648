//! Send-verify-email task
//!
//! Enqueued after a user is created. The handler issues a fresh
//! verification record and mails its link. Delivery is at-least-once:
//! a redelivered task issues another record and another mail.

use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::domain::OperationContext;
use crate::mail::{Email, EmailSender};
use crate::store::{CreateVerifyEmailParams, Store, StoreError};

use super::{Task, TaskError, TaskHandler, TaskOptions, TaskRequest};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

const SECRET_CODE_LEN: usize = 32;
const SUBJECT: &str = "Welcome to Simple Bank";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

impl PayloadSendVerifyEmail {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn to_request(&self, options: TaskOptions) -> Result<TaskRequest, serde_json::Error> {
        Ok(TaskRequest::new(
            Task::from_payload(TASK_SEND_VERIFY_EMAIL, self)?,
            options,
        ))
    }
}

pub struct SendVerifyEmailHandler {
    store: Arc<dyn Store>,
    mailer: Arc<dyn EmailSender>,
    verify_url: String,
}

impl SendVerifyEmailHandler {
    /// `verify_url` is the link target without query string
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn EmailSender>,
        verify_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            verify_url: verify_url.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    #[instrument(skip_all, fields(kind = %task.kind))]
    async fn process_task(&self, ctx: &OperationContext, task: &Task) -> Result<(), TaskError> {
        let payload: PayloadSendVerifyEmail = task
            .decode()
            .map_err(|e| TaskError::skip_retry(format!("failed to unmarshal payload: {}", e)))?;

        let mut conn = self.store.connect(ctx).await.map_err(TaskError::retry)?;

        let user = conn
            .get_user(ctx, &payload.username)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => {
                    TaskError::skip_retry(format!("user {} does not exist", payload.username))
                }
                other => TaskError::retry(format!("failed to get user: {}", other)),
            })?;

        let verify_email = conn
            .create_verify_email(
                ctx,
                &CreateVerifyEmailParams {
                    username: user.username.clone(),
                    email: user.email.clone(),
                    secret_code: random_string(SECRET_CODE_LEN),
                },
            )
            .await
            .map_err(|e| match e {
                StoreError::NotFound => {
                    TaskError::skip_retry(format!("user {} does not exist", user.username))
                }
                other => TaskError::retry(format!("failed to create verify email: {}", other)),
            })?;
        drop(conn);

        let link = format!(
            "{}?email_id={}&secret_code={}",
            self.verify_url, verify_email.id, verify_email.secret_code
        );
        let email = Email::new(SUBJECT, render_body(&user.full_name, &link)).to(user.email.clone());
        self.mailer
            .send_email(&email)
            .await
            .map_err(|e| TaskError::retry(format!("failed to send verify email: {}", e)))?;

        tracing::info!(
            username = %user.username,
            email = %user.email,
            verify_email_id = verify_email.id,
            "Sent verify email"
        );
        Ok(())
    }
}

fn render_body(full_name: &str, link: &str) -> String {
    format!(
        "<h1>Hello {}</h1>\
         <p>Thank you for registering with us!</p>\
         <p>Please <a href=\"{}\">click here</a> to verify your email address</p>",
        escape_html(full_name),
        escape_html(link)
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Random alphanumeric string
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
