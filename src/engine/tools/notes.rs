//! Note taking. Notes are addressed by a slug derived from their title.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Tool, ToolContext, ToolError, ToolOutput};
use crate::models::{ContentKind, DeviceNote};
use crate::services::completion::ToolDefinition;
use crate::sync::SyncEvent;

// ---

/// Lowercase, alphanumerics and single hyphens: "Grocery List!" → "grocery-list".
pub fn slug(title: &str) -> String {
    // ---
    let cleaned: String = title
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();

    let mut out = String::with_capacity(cleaned.len());
    for c in cleaned.chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Deserialize)]
pub struct UpsertArgs {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub content: String,
}

pub struct UpsertNote;

#[async_trait]
impl Tool for UpsertNote {
    type Args = UpsertArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "upsert_note",
            description: "Create a note, or replace the content of an existing note given its slug.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "slug": {"type": "string", "description": "Slug of the note to update"},
                    "title": {"type": "string", "description": "Title; required when creating"},
                    "content": {"type": "string"}
                },
                "required": ["content"]
            }),
        }
    }

    async fn run(&self, args: UpsertArgs, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        // ---
        let repo = ctx.repos.notes();

        let entry = match args.slug.as_deref().filter(|s| !s.is_empty()) {
            Some(wanted) => {
                let stored = ctx
                    .notes
                    .iter()
                    .find(|n| slug(&n.body.title) == wanted)
                    .ok_or_else(|| ToolError::Execution(format!("No note has the slug '{wanted}'.")))?;

                let mut patch = json!({"content": args.content});
                if let Some(title) = args.title {
                    patch["title"] = json!(title);
                }
                repo.update(ctx.device_id, &stored.id, patch).await?
            }
            None => {
                let title = args
                    .title
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| ToolError::Argument("title is required when no slug is given".to_string()))?;
                let note = DeviceNote {
                    title,
                    content: args.content,
                };
                repo.add(ctx.device_id, &note, None).await?
            }
        };

        tracing::debug!("Device {} upserted note '{}'", ctx.device_id, entry.body.title);
        ctx.sync
            .publish(SyncEvent::content(ctx.device_id, ContentKind::Notes, std::slice::from_ref(&entry)));

        Ok(ToolOutput::text(format!("Note '{}' saved.", entry.body.title)))
    }
}
