//! Desktop notification support for new inbound messages

use crate::config::NotificationConfig;
use crate::message::types::{CanonicalMessage, Channel};
use crate::view::projector::truncate_preview;

const PREVIEW_CHARS: usize = 100;

/// Send one desktop notification covering `messages` (newest first).
pub fn notify_new_messages(config: &NotificationConfig, messages: &[&CanonicalMessage]) {
    if !config.enabled {
        return;
    }
    let Some((summary, body)) = alert_text(messages, config.show_preview) else {
        return;
    };

    // Fire and forget, don't block on errors
    if let Err(e) = send_notification(&summary, body.as_deref()) {
        tracing::warn!("Failed to send desktop notification: {}", e);
    }
}

fn channel_label(channel: Channel) -> &'static str {
    match channel {
        Channel::Sms => "SMS",
        Channel::Email => "Email",
    }
}

fn alert_text(messages: &[&CanonicalMessage], show_preview: bool) -> Option<(String, Option<String>)> {
    let newest = messages.first()?;

    let summary = if messages.len() == 1 {
        format!("New {} from {}", channel_label(newest.channel), newest.lead_id)
    } else {
        format!("{} new messages", messages.len())
    };

    let body = show_preview
        .then(|| truncate_preview(newest.preview_text(), PREVIEW_CHARS))
        .filter(|preview| !preview.is_empty());

    Some((summary, body))
}

/// Low-level notification sending
fn send_notification(summary: &str, body: Option<&str>) -> Result<(), notify_rust::error::Error> {
    use notify_rust::Notification;

    let mut notification = Notification::new();
    notification
        .summary(summary)
        .appname("crm-inbox")
        .timeout(notify_rust::Timeout::Milliseconds(5000));

    if let Some(body) = body {
        notification.body(body);
    }

    notification.icon("mail-unread");

    notification.show()?;
    Ok(())
}
