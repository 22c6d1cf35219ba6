//! Gemma chat-turn rendering.

use crate::conversation::{ConversationStore, Turn};

const START_OF_TURN: &str = "<start_of_turn>";
const END_OF_TURN: &str = "<end_of_turn>";

/// Render a conversation into a single prompt primed for a model reply.
pub fn render(store: &ConversationStore, system_template: Option<&str>) -> String {
    render_turns(store.turns(), system_template)
}

pub fn render_turns<'a>(
    turns: impl IntoIterator<Item = &'a Turn>,
    system_template: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if let Some(template) = system_template.filter(|t| !t.is_empty()) {
        prompt.push_str(template);
        prompt.push_str("\n\n");
    }

    for turn in turns {
        prompt.push_str(START_OF_TURN);
        prompt.push_str(turn.role.as_prompt_role());
        prompt.push('\n');
        prompt.push_str(&turn.text());
        prompt.push_str(END_OF_TURN);
        prompt.push('\n');
    }

    prompt.push_str(START_OF_TURN);
    prompt.push_str("model\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ChatRole, ContentItem};
    use crate::media::ImageAsset;
    use image::RgbImage;

    #[test]
    fn renders_single_user_turn() {
        let mut store = ConversationStore::new(10);
        store.append_text(ChatRole::User, "hi", true);
        assert_eq!(
            render(&store, None),
            "<start_of_turn>user\nhi<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn assistant_turns_use_model_role_and_template_is_prefixed() {
        let mut store = ConversationStore::new(10);
        store.append_text(ChatRole::User, "hello", true);
        store.append_text(ChatRole::Assistant, "hey there", false);
        store.append_text(ChatRole::User, "how are you?", true);

        let prompt = render(&store, Some("Be brief."));
        assert_eq!(
            prompt,
            "Be brief.\n\n\
             <start_of_turn>user\nhello<end_of_turn>\n\
             <start_of_turn>model\nhey there<end_of_turn>\n\
             <start_of_turn>user\nhow are you?<end_of_turn>\n\
             <start_of_turn>model\n"
        );
    }

    #[test]
    fn empty_template_adds_no_prefix() {
        let mut store = ConversationStore::new(10);
        store.append_text(ChatRole::User, "hi", true);
        assert_eq!(render(&store, Some("")), render(&store, None));
    }

    #[test]
    fn media_items_contribute_no_text() {
        let mut store = ConversationStore::new(10);
        store.append_media(
            ChatRole::User,
            vec![
                ContentItem::text("describe"),
                ContentItem::Image(ImageAsset::from_rgb(RgbImage::new(2, 2))),
                ContentItem::text(" this"),
            ],
            true,
        );
        assert_eq!(
            render(&store, None),
            "<start_of_turn>user\ndescribe this<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut store = ConversationStore::new(10);
        store.append_text(ChatRole::User, "same", true);
        assert_eq!(render(&store, Some("x")), render(&store, Some("x")));
    }
}
