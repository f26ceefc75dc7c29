//! The `SendEmail` job.

use std::sync::Arc;

use async_trait::async_trait;
use jobhub_engine::{JobArgs, JobContext, JobType, RawArgs, RegistryError, ValidationErrors};
use jobhub_queue::JobQueueError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::JobError;
use crate::job_types;

/// Arguments of a `SendEmail` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmail {
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

impl JobArgs for SendEmail {}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &SendEmail) -> Result<(), JobError>;
}

/// Mailer that only records the message in the process log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &SendEmail) -> Result<(), JobError> {
        info!(to = %message.to, subject = %message.subject, "email delivered to log");
        Ok(())
    }
}

pub fn parse(raw: &RawArgs) -> Result<SendEmail, ValidationErrors> {
    let to = raw.required_email("to");
    let subject = raw.optional_str("subject").unwrap_or_default();
    let body = raw.optional_str("body").unwrap_or_default();
    raw.finish(to.map(|to| SendEmail { to, subject, body }))
}

pub async fn run(ctx: JobContext<SendEmail>, mailer: Arc<dyn Mailer>) -> Result<(), JobQueueError> {
    let message = &ctx.args;
    ctx.append_log(format!("preparing message to {}", message.to))
        .await?;
    ctx.set_progress(10).await?;
    ctx.check_interrupted()?;

    mailer.send(message).await?;
    ctx.set_progress(50).await?;
    ctx.append_log("sent half").await?;
    ctx.check_interrupted()?;

    ctx.set_progress_text(summary_markup(message)).await?;
    ctx.set_progress(100).await?;
    ctx.append_log("message sent").await?;
    info!(job_id = %ctx.job_id(), to = %message.to, "email sent");
    Ok(())
}

/// Progress text is rendered as HTML, so every user value is escaped.
fn summary_markup(message: &SendEmail) -> String {
    format!(
        "<dl><dt>To</dt><dd>{}</dd><dt>Subject</dt><dd>{}</dd></dl>",
        html_escape::encode_safe(&message.to),
        html_escape::encode_safe(&message.subject)
    )
}

pub fn job_type(mailer: Arc<dyn Mailer>) -> Result<JobType, RegistryError> {
    JobType::builder(job_types::SEND_EMAIL)
        .description("Send an email message")
        .resource("mail")
        .parser(parse)
        .handler(move |ctx: JobContext<SendEmail>| run(ctx, Arc::clone(&mailer)))
        .build()
}
