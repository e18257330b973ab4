use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::antiflutter::AntiFlutter;
use super::operator::{OperatorEvent, OperatorSink};

/// SMTP alerts for operator events, rate-limited per event kind.
pub struct EmailSink {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    gate: Mutex<AntiFlutter>,
}

impl EmailSink {
    /// Build from `SMTP_HOST`, `SMTP_USER`, `SMTP_PASS`, `NOTIFY_EMAIL_FROM` and
    /// `NOTIFY_EMAIL_TO`. Returns `Ok(None)` when `SMTP_HOST` is not set.
    pub fn from_env(cooldown_secs: i64) -> Result<Option<Self>> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };
        let user = std::env::var("SMTP_USER").context("SMTP_USER missing")?;
        let pass = std::env::var("SMTP_PASS").context("SMTP_PASS missing")?;
        let from_addr = std::env::var("NOTIFY_EMAIL_FROM").context("NOTIFY_EMAIL_FROM missing")?;
        let to_addr = std::env::var("NOTIFY_EMAIL_TO").context("NOTIFY_EMAIL_TO missing")?;

        let creds = Credentials::new(user, pass);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .context("invalid SMTP_HOST")?
            .credentials(creds)
            .build();

        let from = from_addr.parse().context("invalid NOTIFY_EMAIL_FROM")?;
        let to = to_addr.parse().context("invalid NOTIFY_EMAIL_TO")?;

        Ok(Some(Self {
            mailer,
            from,
            to,
            gate: Mutex::new(AntiFlutter::new(cooldown_secs)),
        }))
    }

    pub fn build_message(&self, ev: &OperatorEvent) -> Result<Message> {
        let subject = format!("finnews-digest: {}", ev.kind());
        let body = format!(
            "{}\n\nDetails: {}\nTimestamp: {}\n",
            ev.summary(),
            serde_json::to_string_pretty(ev).unwrap_or_default(),
            Utc::now().to_rfc3339()
        );

        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(body)
            .context("build email")
    }

    async fn send_event(&self, ev: &OperatorEvent) -> Result<()> {
        let msg = self.build_message(ev)?;
        self.mailer.send(msg).await.context("send email")?;
        Ok(())
    }
}

#[async_trait]
impl OperatorSink for EmailSink {
    async fn notify(&self, event: &OperatorEvent) {
        let now = Utc::now();
        {
            let gate = self.gate.lock().expect("email gate poisoned");
            if !gate.should_alert(event.kind(), now) {
                tracing::debug!(kind = event.kind(), "email alert suppressed by cooldown");
                return;
            }
        }
        match self.send_event(event).await {
            Ok(()) => self
                .gate
                .lock()
                .expect("email gate poisoned")
                .record_alert(event.kind(), now),
            Err(e) => tracing::warn!(error = ?e, kind = event.kind(), "operator email failed"),
        }
    }
}
