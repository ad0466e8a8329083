//! System prompt interpolation and history conversion.

use chrono::{DateTime, TimeZone};

use super::tools::notes::slug;
use crate::models::{DeviceMessage, DeviceNote, Entry};
use crate::services::completion::CompletionMessage;
use crate::services::maps::LocalTime;

// ---

fn format_time<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    time.format("%-I:%M %P, %b %-d %Y").to_string()
}

/// Battery fraction as a whole percentage.
pub fn format_battery(battery: f64) -> String {
    format!("{:.0}%", battery * 100.0)
}

/// Notes as `- slug: title` lines followed by their indented content.
pub fn note_listing(notes: &[Entry<DeviceNote>]) -> String {
    // ---
    if notes.is_empty() {
        return "(no notes)".to_string();
    }

    notes
        .iter()
        .map(|n| {
            let content = n.body.content.replace('\n', "\n  ");
            format!("- {}: {}\n  {}", slug(&n.body.title), n.body.title, content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fill the `{utc_time}`, `{local_time}`, `{timezone}`, `{battery}` and
/// `{notes}` placeholders of a prompt template.
pub fn interpolate(template: &str, time: &LocalTime, battery: f64, notes: &[Entry<DeviceNote>]) -> String {
    // ---
    template
        .replace("{utc_time}", &format_time(&time.utc))
        .replace("{local_time}", &format_time(&time.local))
        .replace("{timezone}", &time.timezone_name)
        .replace("{battery}", &format_battery(battery))
        .replace("{notes}", &note_listing(notes))
}

/// Stored exchanges (newest first) as chronological user/assistant turns.
pub fn history(messages: &[Entry<DeviceMessage>]) -> Vec<CompletionMessage> {
    // ---
    messages
        .iter()
        .rev()
        .flat_map(|m| {
            [
                CompletionMessage::user(m.body.user_msg.clone()),
                CompletionMessage::assistant(m.body.assistant_msg.clone()),
            ]
        })
        .collect()
}
