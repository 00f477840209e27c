use std::io::Write;

use chrono::{DateTime, Utc};

use crate::db::models::Post;

/// View hook called with the full feed of a page whenever it changes.
pub trait Render: Send + Sync {
    fn render(&self, page: &str, posts: &[Post]);
}

/// Discards every view. Used by the server and by tests.
pub struct NullRenderer;

impl Render for NullRenderer {
    fn render(&self, _page: &str, _posts: &[Post]) {}
}

/// Prints feeds to stdout.
pub struct TerminalRenderer;

impl Render for TerminalRenderer {
    fn render(&self, page: &str, posts: &[Post]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(format_feed(page, posts).as_bytes());
        let _ = out.flush();
    }
}

pub fn format_feed(page: &str, posts: &[Post]) -> String {
    let mut out = format!("== {} ({} posts) ==\n", page, posts.len());
    if posts.is_empty() {
        out.push_str("  nothing here yet\n");
    }
    for post in posts {
        out.push_str(&format!(
            "\n[{}] {} · {}\n",
            post.id().unwrap_or("?"),
            post.username,
            format_relative_time(&post.date)
        ));
        if let Some(text) = &post.text {
            for line in text.lines() {
                out.push_str(&format!("  {}\n", line));
            }
        }
        if let Some(media) = &post.media {
            out.push_str(&format!("  {}\n", describe_media(media, post.media_type.as_deref())));
        }
        for comment in &post.comments {
            let body = comment.text.as_deref().unwrap_or("");
            out.push_str(&format!(
                "    > {} ({}): {}\n",
                comment.username,
                format_relative_time(&comment.date),
                body
            ));
            if let Some(media) = &comment.media {
                out.push_str(&format!(
                    "      {}\n",
                    describe_media(media, comment.media_type.as_deref())
                ));
            }
        }
    }
    out
}

/// Inline data URIs are far too long for a terminal; show their size instead.
fn describe_media(media: &str, media_type: Option<&str>) -> String {
    let kind = media_type.unwrap_or("file");
    if media.starts_with("data:") {
        format!("[{} attachment, {} bytes inline]", kind, media.len())
    } else {
        format!("[{}] {}", kind, media)
    }
}

pub fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let diff = Utc::now().signed_duration_since(*dt);

    let seconds = diff.num_seconds();
    if seconds < 60 {
        return "just now".to_string();
    }

    let minutes = diff.num_minutes();
    if minutes < 60 {
        return format!("{}m ago", minutes);
    }

    let hours = diff.num_hours();
    if hours < 24 {
        return format!("{}h ago", hours);
    }

    let days = diff.num_days();
    if days < 7 {
        return format!("{}d ago", days);
    }

    dt.format("%b %-d, %Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Comment;
    use chrono::TimeZone;

    #[test]
    fn format_relative_time_just_now() {
        assert_eq!(format_relative_time(&Utc::now()), "just now");
    }

    #[test]
    fn format_relative_time_minutes() {
        let dt = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(format_relative_time(&dt), "5m ago");
    }

    #[test]
    fn format_relative_time_hours() {
        let dt = Utc::now() - chrono::Duration::hours(3);
        assert_eq!(format_relative_time(&dt), "3h ago");
    }

    #[test]
    fn format_relative_time_days() {
        let dt = Utc::now() - chrono::Duration::days(2);
        assert_eq!(format_relative_time(&dt), "2d ago");
    }

    #[test]
    fn format_relative_time_old_date() {
        let dt = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        assert_eq!(format_relative_time(&dt), "Jan 15, 2025");
    }

    #[test]
    fn feed_lists_posts_and_comments() {
        let date = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let post = Post {
            id: Some("p1".into()),
            page: "daily".into(),
            username: "alice".into(),
            text: Some("hello".into()),
            media: Some("data:image/png;base64,AAAA".into()),
            media_type: Some("image/png".into()),
            date,
            comments: vec![Comment {
                username: "anonymous".into(),
                text: Some("hi back".into()),
                media: None,
                media_type: None,
                date,
            }],
        };
        let text = format_feed("daily", &[post]);
        assert!(text.starts_with("== daily (1 posts) =="));
        assert!(text.contains("alice"));
        assert!(text.contains("  hello"));
        assert!(text.contains("[image/png attachment, 26 bytes inline]"));
        assert!(text.contains("> anonymous (Jan 15, 2025): hi back"));
    }

    #[test]
    fn empty_feed_says_so() {
        assert!(format_feed("music", &[]).contains("nothing here yet"));
    }
}
