use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{auth::ClientOrigin, otp::OtpPurpose};

const SEND_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Outbound security mail. Every method returns once the message was handed
/// off, or with the last delivery error.
#[async_trait]
pub trait SecurityNotifier: Send + Sync {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> anyhow::Result<()>;

    async fn send_invitation(&self, to: &str, name: &str, link: &str) -> anyhow::Result<()>;

    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()>;

    /// A login code was requested but not confirmed in time.
    async fn send_security_alert(
        &self,
        to: &str,
        origin: &ClientOrigin,
        requested_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailService {
    /// Returns None if SMTP is not fully configured.
    pub fn new(config: &Config) -> Option<Self> {
        let host = config.smtp_host.as_deref()?;
        let username = config.smtp_username.clone()?;
        let password = config.smtp_password.clone()?;
        let from_addr = config.smtp_from.as_deref()?;

        let port = config.smtp_port.unwrap_or(587);
        let creds = Credentials::new(username, password);

        let transport = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .ok()?
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .ok()?
                .port(port)
                .credentials(creds)
                .build()
        };

        let from: Mailbox = from_addr.parse().ok()?;

        Some(Self { transport, from })
    }

    // ─── Private helpers ─────────────────────────────────────────────────────

    fn new_message_id(&self) -> String {
        format!("<{}@{}>", Uuid::new_v4(), self.from.email.domain())
    }

    fn wrap_html(title: &str, content: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width,initial-scale=1">
  <title>{title}</title>
</head>
<body style="margin:0;padding:40px 16px;background-color:#f1f5f9;font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,Helvetica,Arial,sans-serif">
  <div style="max-width:520px;margin:0 auto;background:#ffffff;border-radius:12px;padding:40px">
    <h1 style="margin:0 0 16px 0;font-size:22px;font-weight:700;color:#0f172a">{title}</h1>
    {content}
  </div>
</body>
</html>"#
        )
    }

    async fn send_email(&self, to: &str, subject: &str, text: &str, html: &str) -> anyhow::Result<()> {
        let to: Mailbox = to.parse().context("Invalid recipient address")?;
        let email = Message::builder()
            .message_id(Some(self.new_message_id()))
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.to_string()),
                    ),
            )
            .context("Failed to build email message")?;

        let mut attempt = 1;
        loop {
            match self.transport.send(email.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < SEND_ATTEMPTS => {
                    warn!(attempt, error = %e, "email send failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e).context("Failed to send email"),
            }
        }
    }
}

fn otp_subject(purpose: OtpPurpose) -> &'static str {
    match purpose {
        OtpPurpose::Login => "Your sign-in code",
        OtpPurpose::EmailUpdate => "Confirm your email change",
        OtpPurpose::PasswordUpdate => "Confirm your password change",
    }
}

#[async_trait]
impl SecurityNotifier for EmailService {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> anyhow::Result<()> {
        let subject = otp_subject(purpose);
        let text = format!(
            "Your verification code is: {code}\n\n\
            This code expires in 5 minutes.\n\n\
            If you did not request it, you can ignore this email."
        );
        let content = format!(
            r#"<p style="margin:0 0 24px 0;font-size:15px;color:#64748b">Your one-time verification code:</p>
<p style="margin:0 0 24px 0;text-align:center;font-size:44px;font-weight:800;letter-spacing:14px;color:#0f172a">{code}</p>
<p style="margin:0;font-size:13px;color:#94a3b8">This code expires in <strong>5 minutes</strong>. If you did not request it, you can ignore this email.</p>"#
        );
        let html = Self::wrap_html(subject, &content);
        self.send_email(to, subject, &text, &html).await
    }

    async fn send_invitation(&self, to: &str, name: &str, link: &str) -> anyhow::Result<()> {
        let subject = "You have been invited to the back office";
        let text = format!(
            "Hello {name},\n\n\
            An account was created for you. Choose your password here (valid 1 hour):\n\
            {link}\n"
        );
        let content = format!(
            r#"<p style="margin:0 0 28px 0;font-size:15px;color:#64748b">Hello <strong>{name}</strong>, an account was created for you.</p>
<p style="margin:0 0 28px 0"><a href="{link}" style="display:inline-block;padding:13px 28px;background:#2563eb;color:#ffffff;text-decoration:none;font-weight:600;border-radius:8px">Set my password</a></p>
<p style="margin:0;font-size:13px;color:#94a3b8">This link expires in <strong>1 hour</strong>.</p>"#
        );
        let html = Self::wrap_html("You're invited", &content);
        self.send_email(to, subject, &text, &html).await
    }

    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()> {
        let subject = "Reset your password";
        let text = format!(
            "A password reset was requested for your account.\n\n\
            Choose a new password here (valid 1 hour):\n\
            {link}\n\n\
            If you did not request it, you can ignore this email."
        );
        let content = format!(
            r#"<p style="margin:0 0 28px 0;font-size:15px;color:#64748b">A password reset was requested for your account.</p>
<p style="margin:0 0 28px 0"><a href="{link}" style="display:inline-block;padding:13px 28px;background:#2563eb;color:#ffffff;text-decoration:none;font-weight:600;border-radius:8px">Choose a new password</a></p>
<p style="margin:0;font-size:13px;color:#94a3b8">This link expires in <strong>1 hour</strong>. If you did not request it, you can ignore this email.</p>"#
        );
        let html = Self::wrap_html(subject, &content);
        self.send_email(to, subject, &text, &html).await
    }

    async fn send_security_alert(
        &self,
        to: &str,
        origin: &ClientOrigin,
        requested_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let subject = "Unconfirmed sign-in to your account";
        let when = requested_at.format("%Y-%m-%d %H:%M UTC");
        let text = format!(
            "Someone entered your password at {when} but did not confirm the sign-in code.\n\n\
            IP address: {}\n\
            Device: {}\n\n\
            If this was not you, change your password now.",
            origin.ip_address, origin.user_agent
        );
        let content = format!(
            r#"<p style="margin:0 0 16px 0;font-size:15px;color:#64748b">Someone entered your password at <strong>{when}</strong> but did not confirm the sign-in code.</p>
<p style="margin:0 0 16px 0;font-size:14px;color:#334155">IP address: {}<br>Device: {}</p>
<p style="margin:0;font-size:13px;color:#94a3b8">If this was not you, change your password now.</p>"#,
            origin.ip_address, origin.user_agent
        );
        let html = Self::wrap_html("Security alert", &content);
        self.send_email(to, subject, &text, &html).await
    }
}

/// Stand-in used when SMTP is not configured. Codes and links only show up
/// at debug level so a local run stays usable.
pub struct LogNotifier;

#[async_trait]
impl SecurityNotifier for LogNotifier {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> anyhow::Result<()> {
        info!(to, %purpose, "SMTP not configured, OTP email not sent");
        debug!(to, code, "otp");
        Ok(())
    }

    async fn send_invitation(&self, to: &str, name: &str, link: &str) -> anyhow::Result<()> {
        info!(to, name, "SMTP not configured, invitation email not sent");
        debug!(to, link, "invitation link");
        Ok(())
    }

    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()> {
        info!(to, "SMTP not configured, password reset email not sent");
        debug!(to, link, "reset link");
        Ok(())
    }

    async fn send_security_alert(
        &self,
        to: &str,
        origin: &ClientOrigin,
        requested_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        warn!(
            to,
            ip = %origin.ip_address,
            user_agent = %origin.user_agent,
            %requested_at,
            "SMTP not configured, security alert not sent"
        );
        Ok(())
    }
}
