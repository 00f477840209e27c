//! Client commands: each one drives the shim and reports to the terminal.

use std::path::Path;

use crate::config::{AdminCommand, Command};
use crate::context::AppContext;
use crate::error::{AppError, AppResult};
use crate::storage::MediaUpload;
use crate::sync::Draft;

fn draft(text: Option<String>, media: Option<&Path>) -> AppResult<Draft> {
    let media = media.map(MediaUpload::from_path).transpose()?;
    Ok(Draft { text, media })
}

pub async fn run(ctx: &AppContext, command: Command) -> AppResult<()> {
    let default_page = ctx.config().site.default_page.clone();
    let page_or_default = |page: Option<String>| page.unwrap_or_else(|| default_page.clone());

    match command {
        Command::Serve { .. } => {
            return Err(AppError::BadRequest(
                "serve is not a client command".into(),
            ))
        }
        Command::Register { username, password } => {
            ctx.gate().register(&username, &password).await?;
            println!(
                "Registration received. The administrator has to approve {} before you can log in.",
                username.trim()
            );
        }
        Command::Login { username, password } => {
            let session = ctx.gate().login(&username, &password).await?;
            println!("Logged in as {}", session.username);
        }
        Command::Logout => {
            ctx.gate().logout().await?;
            println!("Logged out");
        }
        Command::Whoami => {
            match ctx.session() {
                Some(session) => println!("{}", session.username),
                None => println!("Not logged in"),
            }
            println!("storage: {}", ctx.mode());
        }
        Command::Feed { page, watch } => {
            let page = page_or_default(page);
            if watch {
                ctx.reconciler().watch(&page);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Cannot wait for interrupt: {}", e);
                }
            } else {
                ctx.reconciler().list_posts(&page).await?;
            }
        }
        Command::Post { text, page, media } => {
            let page = page_or_default(page);
            let session = ctx.session();
            let post = ctx
                .reconciler()
                .create_post(&page, session.as_ref(), draft(text, media.as_deref())?)
                .await?;
            println!("Posted {} to {}", post.id().unwrap_or("?"), page);
        }
        Command::Comment {
            post_id,
            text,
            page,
            media,
        } => {
            let page = page_or_default(page);
            let session = ctx.session();
            let comment = ctx
                .reconciler()
                .add_comment(
                    &page,
                    &post_id,
                    session.as_ref(),
                    draft(text, media.as_deref())?,
                )
                .await?;
            println!("Commented as {}", comment.username);
        }
        Command::Delete { post_id, page } => {
            let page = page_or_default(page);
            let session = ctx.session();
            ctx.reconciler()
                .delete_post(&page, &post_id, session.as_ref())
                .await?;
            println!("Deleted {}", post_id);
        }
        Command::Admin { action } => {
            let moderation = ctx.moderation()?;
            match action {
                AdminCommand::Pending => {
                    let pending = moderation.list_pending().await?;
                    if pending.is_empty() {
                        println!("No pending registrations");
                    }
                    for entry in pending {
                        println!(
                            "{}  (requested {})",
                            entry.username,
                            crate::render::format_relative_time(&entry.requested_at)
                        );
                    }
                }
                AdminCommand::Approved => {
                    let users = moderation.list_approved().await?;
                    if users.is_empty() {
                        println!("No approved users");
                    }
                    for user in users {
                        println!("{}", user.username);
                    }
                }
                AdminCommand::Approve { username } => {
                    moderation.approve(&username).await?;
                    println!("Approved {}", username);
                }
                AdminCommand::Reject { username } => {
                    moderation.reject(&username).await?;
                    println!("Rejected {}", username);
                }
            }
        }
    }
    Ok(())
}
