use serde::Deserialize;

use anima_core::content::{ContentBlock, ImageSource};

/// An attachment on an incoming turn.
///
/// Text files are inlined into the persisted user turn so future
/// retrievals can find them. Images are ephemeral: they ride on the LLM
/// call only and never reach the database or the vector store.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Text {
        name: String,
        content: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded image bytes.
        data: String,
    },
}

/// Fold attachments into the turn: text files append to the message
/// content, images become content blocks for the model.
pub fn apply_attachments(
    message: Option<String>,
    attachments: Vec<Attachment>,
) -> (Option<String>, Vec<ContentBlock>) {
    if attachments.is_empty() {
        return (message, Vec::new());
    }

    let mut text_sections: Vec<String> = Vec::new();
    let mut image_blocks: Vec<ContentBlock> = Vec::new();

    for attachment in attachments {
        match attachment {
            Attachment::Text { name, content } => {
                text_sections.push(format!(
                    "[ATTACHED FILE: {name}]\n{content}\n[/ATTACHED FILE]"
                ));
            }
            Attachment::Image { media_type, data } => {
                image_blocks.push(ContentBlock::Image {
                    source: ImageSource::base64(media_type, data),
                });
            }
        }
    }

    let message = if text_sections.is_empty() {
        message
    } else {
        let files = text_sections.join("\n\n");
        Some(match message {
            Some(m) if !m.is_empty() => format!("{m}\n\n{files}"),
            _ => files,
        })
    };

    (message, image_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_attachments_inline_into_message() {
        let (message, images) = apply_attachments(
            Some("please review".to_string()),
            vec![Attachment::Text {
                name: "notes.txt".to_string(),
                content: "line one".to_string(),
            }],
        );
        let message = message.expect("message");
        assert!(message.starts_with("please review"));
        assert!(message.contains("[ATTACHED FILE: notes.txt]"));
        assert!(message.contains("line one"));
        assert!(images.is_empty());
    }

    #[test]
    fn image_attachments_become_blocks_not_text() {
        let (message, images) = apply_attachments(
            Some("what is this?".to_string()),
            vec![Attachment::Image {
                media_type: "image/png".to_string(),
                data: "aGVsbG8=".to_string(),
            }],
        );
        assert_eq!(message.as_deref(), Some("what is this?"));
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn text_attachment_without_message_still_yields_content() {
        let (message, _) = apply_attachments(
            None,
            vec![Attachment::Text {
                name: "a.txt".to_string(),
                content: "standalone".to_string(),
            }],
        );
        assert!(message.expect("message").contains("standalone"));
    }
}
