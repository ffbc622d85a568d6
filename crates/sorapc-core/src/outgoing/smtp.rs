//! SMTP delivery through `lettre`.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{MailBody, MailTransport, OutgoingMail};
use crate::error::RemoteError;

/// Connection security of the SMTP submission port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS (port 587).
    #[default]
    StartTls,
    /// TLS from the first byte (port 465).
    Tls,
}

const fn default_port() -> u16 {
    587
}

const fn default_timeout_secs() -> u64 {
    30
}

/// SMTP submission settings. The password lives in the keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Server host name.
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user name.
    pub username: String,
    /// Sender address, e.g. `Shop <shop@example.com>`.
    pub from: String,
    /// Connection security.
    #[serde(default)]
    pub security: SmtpSecurity,
    /// Timeout of each SMTP command.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// [`MailTransport`] over authenticated SMTP submission.
pub struct SmtpMailTransport {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpMailTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailTransport")
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl SmtpMailTransport {
    /// Creates a transport for the given server. No connection is opened
    /// until the first mail is sent.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Protocol`] if the sender address or the host is
    /// invalid.
    pub fn new(config: &SmtpConfig, password: String) -> Result<Self, RemoteError> {
        let from = parse_mailbox(&config.from)?;
        let builder = match config.security {
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host),
        }
        .map_err(|e| RemoteError::Protocol(format!("invalid SMTP host {}: {e}", config.host)))?;

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(config.username.clone(), password))
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .build();

        Ok(Self { from, transport })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), RemoteError> {
        let message = build_message(&self.from, mail)?;
        debug!(
            to = ?mail.to,
            attachments = mail.attachments.len(),
            "Submitting mail"
        );
        self.transport
            .send(message)
            .await
            .map_err(|e| classify(&e))?;
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, RemoteError> {
    address
        .parse()
        .map_err(|e| RemoteError::Protocol(format!("invalid address {address:?}: {e}")))
}

/// Builds the MIME message: a single body part, or `multipart/mixed` when
/// there are attachments.
pub(crate) fn build_message(from: &Mailbox, mail: &OutgoingMail) -> Result<Message, RemoteError> {
    if mail.to.is_empty() {
        return Err(RemoteError::Protocol("mail has no recipients".into()));
    }

    let mut builder = Message::builder()
        .from(from.clone())
        .subject(mail.subject.clone());
    for to in &mail.to {
        builder = builder.to(parse_mailbox(to)?);
    }

    let body = match &mail.body {
        MailBody::Text(text) => SinglePart::plain(text.clone()),
        MailBody::Html(html) => SinglePart::html(html.clone()),
    };

    let message = if mail.attachments.is_empty() {
        builder.singlepart(body)
    } else {
        let mut mixed = MultiPart::mixed().singlepart(body);
        for attachment in &mail.attachments {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                RemoteError::Protocol(format!(
                    "invalid content type {:?}: {e}",
                    attachment.content_type
                ))
            })?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.file_name.clone())
                    .body(attachment.data.clone(), content_type),
            );
        }
        builder.multipart(mixed)
    };

    message.map_err(|e| RemoteError::Protocol(format!("cannot build mail: {e}")))
}

/// Maps an SMTP failure onto the retry taxonomy.
fn classify(err: &lettre::transport::smtp::Error) -> RemoteError {
    let message = err.to_string();
    if err.is_permanent() {
        let rejected_login = err
            .status()
            .is_some_and(|code| matches!(code.to_string().as_str(), "530" | "534" | "535"));
        if rejected_login {
            RemoteError::Auth(message)
        } else {
            RemoteError::Protocol(message)
        }
    } else if err.is_client() {
        RemoteError::Protocol(message)
    } else {
        RemoteError::TransientNetwork(message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::outgoing::MailAttachment;

    fn from() -> Mailbox {
        "SORAPC <store@sorapc.example>".parse().unwrap()
    }

    fn formatted(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).into_owned()
    }

    #[test]
    fn test_plain_mail_has_single_part() {
        let mail = OutgoingMail::new(
            "buyer@example.com",
            "Your code",
            MailBody::Text("123456".into()),
        );

        let text = formatted(&build_message(&from(), &mail).unwrap());

        assert!(text.contains("To: buyer@example.com"));
        assert!(text.contains("Subject: Your code"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8"));
        assert!(!text.contains("multipart/mixed"));
    }

    #[test]
    fn test_receipt_is_multipart_with_attachment() {
        let mail = OutgoingMail::new(
            "buyer@example.com",
            "Receipt",
            MailBody::Html("<p>Thanks</p>".into()),
        )
        .with_attachment(MailAttachment {
            file_name: "receipt.pdf".into(),
            content_type: "application/pdf".into(),
            data: b"%PDF-1.4".to_vec(),
        });

        let text = formatted(&build_message(&from(), &mail).unwrap());

        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8"));
        assert!(text.contains("Content-Type: application/pdf"));
        assert!(text.contains("filename=\"receipt.pdf\""));
    }

    #[test]
    fn test_invalid_recipient_is_protocol_error() {
        let mail = OutgoingMail::new("not an address", "Hi", MailBody::Text(String::new()));

        let err = build_message(&from(), &mail).unwrap_err();

        assert!(matches!(err, RemoteError::Protocol(_)));
    }

    #[test]
    fn test_mail_without_recipients_is_rejected() {
        let mut mail = OutgoingMail::new("buyer@example.com", "Hi", MailBody::Text(String::new()));
        mail.to.clear();

        assert!(matches!(
            build_message(&from(), &mail),
            Err(RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn test_invalid_sender_is_rejected() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "shop".into(),
            from: "no at sign".into(),
            security: SmtpSecurity::StartTls,
            timeout_secs: 30,
        };

        assert!(matches!(
            SmtpMailTransport::new(&config, "secret".into()),
            Err(RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: SmtpConfig = serde_json::from_str(
            r#"{"host": "smtp.example.com", "username": "shop", "from": "shop@example.com"}"#,
        )
        .unwrap();

        assert_eq!(config.port, 587);
        assert_eq!(config.security, SmtpSecurity::StartTls);
        assert_eq!(config.timeout_secs, 30);
    }
}
