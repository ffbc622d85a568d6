//! Outgoing mail.
//!
//! Mail composed on the device (order receipts, verification codes) is queued
//! in the local cache and handed to a [`MailTransport`] by the next sync run.
//! Mail written while offline is delivered once the network is back.

mod smtp;

use async_trait::async_trait;

use crate::error::RemoteError;

pub use smtp::{SmtpConfig, SmtpMailTransport, SmtpSecurity};

/// Body of an outgoing mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailBody {
    /// `text/plain; charset=utf-8`.
    Text(String),
    /// `text/html; charset=utf-8`.
    Html(String),
}

impl MailBody {
    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Html(_) => "html",
        }
    }

    pub(crate) fn content(&self) -> &str {
        match self {
            Self::Text(content) | Self::Html(content) => content,
        }
    }

    pub(crate) fn from_parts(kind: &str, content: String) -> Self {
        if kind == "html" {
            Self::Html(content)
        } else {
            Self::Text(content)
        }
    }
}

/// A file attached to an outgoing mail.
#[derive(Clone, PartialEq, Eq)]
pub struct MailAttachment {
    /// File name shown to the recipient.
    pub file_name: String,
    /// MIME type, e.g. `application/pdf`.
    pub content_type: String,
    /// Raw file contents.
    pub data: Vec<u8>,
}

impl std::fmt::Debug for MailAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailAttachment")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A mail waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Body.
    pub body: MailBody,
    /// Attachments, in order.
    pub attachments: Vec<MailAttachment>,
}

impl OutgoingMail {
    /// A mail to one recipient without attachments.
    #[must_use]
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: MailBody) -> Self {
        Self {
            to: vec![to.into()],
            subject: subject.into(),
            body,
            attachments: Vec::new(),
        }
    }

    /// Adds an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: MailAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Delivers outgoing mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send one mail.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`]; only transient ones are worth retrying.
    async fn send(&self, mail: &OutgoingMail) -> Result<(), RemoteError>;
}
