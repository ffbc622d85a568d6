//! `sorapc` - offline-first mail client.
//!
//! Thin command-line front end over `sorapc-core`.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sorapc_core::{
    Account, AccountId, Endpoint, HttpDocumentStore, HttpImageFetcher, HttpMessageSource,
    ImageAssetLoader, ImageLoad, LocalCache, LocalEdit, MailAttachment, MailBody, MessageId,
    OutgoingMail, Page, Settings, SmtpConfig, SmtpMailTransport, SmtpSecurity, SyncCoordinator,
    SyncOutcome, SyncReport, credentials,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sorapc=info,sorapc_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings_path = cli.config.clone().unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&settings_path)
        .await
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;

    match cli.command {
        Command::Login {
            id,
            email,
            mail_url,
            cloud_url,
            token,
        } => {
            let account = Account::new(
                AccountId::new(id),
                email,
                Endpoint::new(mail_url),
                Endpoint::new(cloud_url),
            );
            credentials::store_access_token(&account.id, &token)?;
            info!(account = %account.id, "Stored access token");
            settings.account = Some(account);
            settings.save(&settings_path).await?;
            println!("Signed in. Run `sorapc sync` to fetch messages.");
        }
        Command::Logout => {
            let account = configured_account(&settings)?;
            let coordinator = open_coordinator(&settings).await?;
            coordinator.sign_out(&account).await?;
            credentials::delete_access_token(&account.id)?;
            credentials::delete_smtp_password(&account.id)?;
            settings.account = None;
            settings.save(&settings_path).await?;
            println!("Signed out of {}.", account.label());
        }
        Command::Sync => {
            let account = signed_in(&settings)?;
            let coordinator = open_coordinator(&settings).await?;
            match coordinator.sync(&account).await? {
                SyncOutcome::Completed(report) => print_report(&report),
                SyncOutcome::Coalesced => println!("A sync is already running."),
            }
        }
        Command::Watch => {
            let account = signed_in(&settings)?;
            let coordinator = Arc::new(open_coordinator(&settings).await?);
            let mut handle = coordinator.spawn_periodic(account.clone());
            info!(
                interval_secs = settings.sync.interval_secs,
                "Watching for changes, press Ctrl-C to stop"
            );

            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl-C")?;
                    coordinator.cancel(&account.id);
                    handle.await?;
                }
                joined = &mut handle => joined?,
            }
        }
        Command::List { offset, limit } => {
            let account = signed_in(&settings)?;
            let coordinator = open_coordinator(&settings).await?;
            let limit = limit.unwrap_or(settings.sync.page_size);
            let page = coordinator.request_page(&account, offset, limit).await?;
            print_page(&page);
        }
        Command::Read { id } => edit(&settings, LocalEdit::MarkRead(MessageId::new(id))).await?,
        Command::Unread { id } => {
            edit(&settings, LocalEdit::MarkUnread(MessageId::new(id))).await?;
        }
        Command::Delete { id } => edit(&settings, LocalEdit::Delete(MessageId::new(id))).await?,
        Command::Smtp {
            host,
            port,
            username,
            from,
            tls,
            password,
        } => {
            let account = configured_account(&settings)?;
            let config = SmtpConfig {
                host,
                port,
                username,
                from,
                security: if tls {
                    SmtpSecurity::Tls
                } else {
                    SmtpSecurity::StartTls
                },
                timeout_secs: 30,
            };
            // Rejects a malformed sender or host before anything is stored.
            SmtpMailTransport::new(&config, password.clone())?;
            credentials::store_smtp_password(&account.id, &password)?;
            settings.smtp = Some(config);
            settings.save(&settings_path).await?;
            println!("Outgoing mail configured.");
        }
        Command::Send {
            to,
            subject,
            body,
            html,
            attachments,
        } => {
            let account = signed_in(&settings)?;
            let body = if html {
                MailBody::Html(body)
            } else {
                MailBody::Text(body)
            };
            let mut mail = OutgoingMail::new(to, subject, body);
            for path in attachments {
                mail = mail.with_attachment(read_attachment(&path).await?);
            }

            let coordinator = open_coordinator(&settings).await?;
            coordinator.queue_mail(&account, &mail).await?;
            match coordinator.sync(&account).await {
                Ok(SyncOutcome::Completed(report)) if report.mail_deferred == 0 => {
                    println!("Sent.");
                }
                Ok(_) => println!("Queued; it will be sent on a later sync."),
                Err(e) => println!("Queued; delivery deferred: {e}"),
            }
        }
        Command::Image { uri } => {
            let loader = ImageAssetLoader::new(
                &settings.images,
                Arc::new(HttpImageFetcher::new(reqwest::Client::new())),
                tokio::runtime::Handle::current(),
            );
            let image = match loader.load(&uri) {
                ImageLoad::Ready(image) => image,
                ImageLoad::Pending(pending) => pending.await?,
            };
            println!("{}: {}x{}", image.uri(), image.width(), image.height());
        }
    }

    Ok(())
}

fn configured_account(settings: &Settings) -> Result<Account> {
    settings
        .account
        .clone()
        .context("no account configured, run `sorapc login` first")
}

/// The configured account with its token loaded from the keyring.
fn signed_in(settings: &Settings) -> Result<Account> {
    let account = configured_account(settings)?;
    let token = credentials::load_access_token(&account.id)?
        .context("no stored access token, run `sorapc login` again")?;
    Ok(account.with_access_token(token))
}

async fn open_coordinator(settings: &Settings) -> Result<SyncCoordinator> {
    let database = settings.resolved_database_path();
    create_parent(&database).await?;
    let cache = LocalCache::new(&database.to_string_lossy())
        .await
        .with_context(|| format!("failed to open cache at {}", database.display()))?;

    let client = reqwest::Client::new();
    let coordinator = SyncCoordinator::new(
        Arc::new(cache),
        Arc::new(HttpMessageSource::new(client.clone())),
        Arc::new(HttpDocumentStore::new(client)),
        settings.sync.clone(),
    );

    let (Some(smtp), Some(account)) = (&settings.smtp, &settings.account) else {
        return Ok(coordinator);
    };
    let Some(password) = credentials::load_smtp_password(&account.id)? else {
        warn!("SMTP is configured but no password is stored; outgoing mail stays queued");
        return Ok(coordinator);
    };
    let transport = SmtpMailTransport::new(smtp, password)?;
    Ok(coordinator.with_mail_transport(Arc::new(transport)))
}

async fn read_attachment(path: &Path) -> Result<MailAttachment> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} is not a file", path.display()))?;
    Ok(MailAttachment {
        content_type: content_type_for(path).to_string(),
        file_name,
        data,
    })
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        _ => "application/octet-stream",
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

async fn edit(settings: &Settings, edit: LocalEdit) -> Result<()> {
    let account = signed_in(settings)?;
    let coordinator = open_coordinator(settings).await?;
    match coordinator.apply_local_change(&account, &edit).await? {
        Some(change) => println!(
            "{} is now at {}; it will be pushed on the next sync.",
            change.id(),
            change.revision()
        ),
        None => println!("Nothing to change."),
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "Synced: {} applied, {} duplicate, {} stale, {} pushed, {} superseded",
        report.applied, report.duplicates, report.stale, report.pushed, report.superseded
    );
    if report.mail_sent + report.mail_deferred > 0 {
        println!(
            "Mail: {} sent, {} still queued",
            report.mail_sent, report.mail_deferred
        );
    }
    for failure in &report.failures {
        println!("  {failure}");
    }
}

fn print_page(page: &Page) {
    for message in &page.messages {
        println!(
            "{} {}  {:<32} {}  [{}]",
            if message.is_read { ' ' } else { '*' },
            message.timestamp.format("%Y-%m-%d %H:%M"),
            message.sender,
            message.subject,
            message.id
        );
    }
    let end = page.offset + page.messages.len() as u64;
    println!("{}-{end} of {}", page.offset, page.total);
    if page.has_more() {
        println!("More: --offset {end}");
    }
}
