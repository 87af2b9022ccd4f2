use teloxide::types::{Message, User};

/// A mention of a user found in a message.
#[derive(Clone, Debug, PartialEq)]
pub enum Mention<'a> {
    /// A mention by username, like `@Architector_4`. Stored without the `@`.
    Username(&'a str),
    /// A link mention of a user, which is what Telegram makes for users
    /// without a username. Carries the whole user object.
    User(&'a User),
}

/// Looks through the message's text or caption and returns all mentions of users in it,
/// in the order they appear. This does not return the sender, the person the message is
/// forwarded from, or who it is a reply to.
#[must_use]
pub fn get_mentions(message: &Message) -> Vec<Mention<'_>> {
    let mut output = vec![];
    if let Some(ents) = message
        .parse_entities()
        .or_else(|| message.parse_caption_entities())
    {
        for ent in ents {
            use teloxide::types::MessageEntityKind as Kind;
            match ent.kind() {
                Kind::Mention => {
                    let name = ent.text().trim_start_matches('@');
                    if !name.is_empty() {
                        output.push(Mention::Username(name));
                    }
                }
                Kind::TextMention { user } => output.push(Mention::User(user)),
                _ => (), // none other contain users
            }
        }
    }
    output
}

/// Normalizes a username for comparisons: strips the leading `@` and lowercases it,
/// since Telegram usernames are case-insensitive.
#[must_use]
pub fn normalize_username(username: &str) -> String {
    username.trim().trim_start_matches('@').to_lowercase()
}

#[cfg(test)]
mod tests {
    use teloxide::types::UserId;

    use super::*;

    fn message(json: &str) -> Message {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn mentions_in_text() {
        let message = message(
            r#"{
                "message_id": 1,
                "date": 1700000000,
                "chat": {"id": -100123, "type": "supergroup", "title": "Amogus"},
                "from": {"id": 5, "is_bot": false, "first_name": "Red"},
                "text": "hi @Bob and Carl, really",
                "entities": [
                    {"type": "mention", "offset": 3, "length": 4},
                    {"type": "text_mention", "offset": 12, "length": 4,
                        "user": {"id": 7, "is_bot": false, "first_name": "Carl"}},
                    {"type": "bold", "offset": 18, "length": 6}
                ]
            }"#,
        );

        let mentions = get_mentions(&message);
        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0], Mention::Username("Bob"));
        let Mention::User(user) = mentions[1] else {
            panic!("Expected a text mention, got {:?}", mentions[1]);
        };
        assert_eq!(user.id, UserId(7));
    }

    #[test]
    fn mentions_in_caption() {
        let message = message(
            r#"{
                "message_id": 2,
                "date": 1700000000,
                "chat": {"id": -100123, "type": "supergroup", "title": "Amogus"},
                "from": {"id": 5, "is_bot": false, "first_name": "Red"},
                "photo": [{"file_id": "a", "file_unique_id": "b", "width": 1, "height": 1, "file_size": 1}],
                "caption": "look @Crewmate",
                "caption_entities": [{"type": "mention", "offset": 5, "length": 9}]
            }"#,
        );

        assert_eq!(get_mentions(&message), [Mention::Username("Crewmate")]);
    }

    #[test]
    fn no_mentions() {
        let message = message(
            r#"{
                "message_id": 3,
                "date": 1700000000,
                "chat": {"id": 5, "type": "private", "first_name": "Red"},
                "from": {"id": 5, "is_bot": false, "first_name": "Red"},
                "text": "nobody @ here"
            }"#,
        );

        assert!(get_mentions(&message).is_empty());
    }

    #[test]
    fn username_normalization() {
        assert_eq!(normalize_username("@Architector_4"), "architector_4");
        assert_eq!(normalize_username("architector_4"), "architector_4");
        assert_eq!(normalize_username("  @SomeBot "), "somebot");
        assert_eq!(normalize_username("@"), "");
    }
}
