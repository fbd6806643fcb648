//! SMTP sender over `lettre`

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailConfig;

use super::{Email, EmailSender, MailError};

/// Sends mail through an authenticated STARTTLS relay
#[derive(Clone)]
pub struct SmtpSender {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    pub fn new(config: &EmailConfig) -> Result<Self, MailError> {
        let from = format!("{} <{}>", config.sender_name, config.sender_address)
            .parse::<Mailbox>()
            .map_err(|e| MailError::InvalidAddress(e.to_string()))?;

        let credentials = Credentials::new(
            config.sender_address.clone(),
            config.sender_password.clone(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| MailError::Send(e.to_string()))?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();

        Ok(Self { from, transport })
    }

    async fn build_message(&self, email: &Email) -> Result<Message, MailError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(email.subject.as_str());
        for to in &email.to {
            builder = builder.to(parse_mailbox(to)?);
        }
        for cc in &email.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        for bcc in &email.bcc {
            builder = builder.bcc(parse_mailbox(bcc)?);
        }

        let mut body = MultiPart::mixed().singlepart(SinglePart::html(email.content.clone()));
        for path in &email.attach_files {
            let attachment_error = |reason: String| MailError::Attachment {
                path: path.display().to_string(),
                reason,
            };
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| attachment_error(e.to_string()))?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| attachment_error("path has no file name".to_string()))?;
            let content_type = ContentType::parse("application/octet-stream")
                .map_err(|e| attachment_error(e.to_string()))?;
            body = body.singlepart(Attachment::new(filename).body(bytes, content_type));
        }

        builder
            .multipart(body)
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .parse()
        .map_err(|e| MailError::InvalidAddress(format!("{}: {}", address, e)))
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send_email(&self, email: &Email) -> Result<(), MailError> {
        let message = self.build_message(email).await?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Send(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailConfig {
        EmailConfig {
            sender_name: "Simple Bank".to_string(),
            sender_address: "bank@example.com".to_string(),
            sender_password: "secret".to_string(),
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
        }
    }

    #[tokio::test]
    async fn test_build_message_with_recipients() {
        let sender = SmtpSender::new(&config()).unwrap();
        let email = Email::new("Welcome", "<h1>Hello</h1>")
            .to("alice@example.com")
            .cc("bob@example.com");

        let message = sender.build_message(&email).await.unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Welcome"));
        assert!(raw.contains("alice@example.com"));
    }

    #[tokio::test]
    async fn test_invalid_recipient() {
        let sender = SmtpSender::new(&config()).unwrap();
        let email = Email::new("Welcome", "hi").to("not an address");

        let err = sender.build_message(&email).await.unwrap_err();
        assert!(matches!(err, MailError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_missing_attachment() {
        let sender = SmtpSender::new(&config()).unwrap();
        let email = Email::new("Report", "see attached")
            .to("alice@example.com")
            .attach("/nonexistent/report.pdf");

        let err = sender.build_message(&email).await.unwrap_err();
        assert!(matches!(err, MailError::Attachment { .. }));
    }
}
