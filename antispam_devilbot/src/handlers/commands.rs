use std::{future::Future, pin::Pin};

use bot_commons::is_chat_admin;
use chrono::Utc;
use html_escape::encode_text;
use teloxide::{
    types::{BotCommand, ChatId, Me, Message, UserId},
    Bot,
};

use crate::{
    actions::send_html,
    app::App,
    store::{AnnouncementQueue, ChatDirectory, ErrorTracker},
    Error,
};

pub const COMMANDS: &[Command] = &[
    START,
    HELP,
    DONT_DISTURB_ME,
    LIST,
    STATS,
    TOP,
    MENTION_BAN,
    FORGIVE,
    CHAT_ID,
    VERSION,
    STATUS,
    ANNOUNCE,
    ERRORS,
    CLEAR_ERRORS,
    GEN_ERROR,
];

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

pub struct CommandParams<'a> {
    pub bot: &'a Bot,
    pub app: &'a App,
    pub message: &'a Message,
    pub message_text: &'a str,
    pub command_len: usize,
}

impl CommandParams<'_> {
    /// Text parameters of the command.
    ///
    /// If the input command is `/announce Hello everyone`,
    /// this will be the substring `Hello everyone`.
    pub fn get_params(&self) -> &str {
        self.message_text[self.command_len..].trim()
    }

    async fn reply(&self, text: &str) -> Result<(), Error> {
        send_html(self.bot, self.message.chat.id, text).await?;
        Ok(())
    }

    /// If this is not a group, say so and return `false`.
    async fn require_group(&self) -> Result<bool, Error> {
        if self.message.chat.is_private() {
            self.reply("This command only works in groups.").await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// If the sender is not a bot operator, say so and return `false`.
    async fn require_operator(&self) -> Result<bool, Error> {
        let allowed = self
            .message
            .from
            .as_ref()
            .is_some_and(|x| self.app.config.is_admin(x.id));
        if !allowed {
            log::debug!(
                "Operator command refused in chat {}",
                self.message.chat.id
            );
            self.reply("Only operators of this bot can do that.").await?;
        }
        Ok(allowed)
    }
}

pub struct Command {
    pub callname: &'static str,
    pub description: &'static str,
    pub function: for<'a> fn(CommandParams<'a>) -> CommandFuture<'a>,
    /// Not shown in the help or in the command list.
    hidden: bool,
}

impl Command {
    pub fn is_matching_callname(&self, command: &str) -> bool {
        self.callname
            .split_ascii_whitespace()
            .next()
            .is_some_and(|x| x.eq_ignore_ascii_case(command))
    }
}

/// Help text, with a greeting on top.
pub fn help_text(first_line: &str) -> String {
    let mut response = format!(
        concat!(
            "{}\n\n",
            "This bot punishes people for mentioning those who asked not to be mentioned. ",
            "Add it to a group and make it an admin with the ability to restrict members.\n\n",
        ),
        encode_text(first_line)
    );
    for command in COMMANDS {
        if command.hidden {
            continue;
        }
        response += &encode_text(command.callname);
        response += " - ";
        response += command.description;
        response += "\n";
    }
    response.pop();
    response
}

pub fn generate_bot_commands() -> Vec<BotCommand> {
    let mut output = Vec::new();

    for command in COMMANDS {
        if command.hidden {
            continue;
        }
        let Some(callname) = command.callname.split_ascii_whitespace().next() else {
            continue;
        };

        // Cut off the /
        output.push(BotCommand {
            command: callname[1..].to_string(),
            description: command.description.to_string(),
        });
    }

    output
}

/// Returns `true` if a command was parsed and responded to.
pub async fn handle_command(
    bot: &Bot,
    me: &Me,
    message: &Message,
    app: &App,
) -> Result<bool, Error> {
    let Some(text) = message.text() else {
        return Ok(false);
    };
    if !text.starts_with('/') {
        return Ok(false);
    }
    let Some(command) = text.split_whitespace().next() else {
        return Ok(false);
    };
    let command_len = command.len();

    // If the command is "/top@Antispam_Devilbot",
    // trim the "@" and everything after it.
    let callname = if let Some(username_start) = command.find('@') {
        if !command[username_start + '@'.len_utf8()..].eq_ignore_ascii_case(me.username()) {
            // Not for us.
            return Ok(false);
        }
        &command[..username_start]
    } else {
        command
    };

    let Some(found) = COMMANDS.iter().find(|x| x.is_matching_callname(callname)) else {
        return Ok(false);
    };

    log::debug!("Running {callname} in chat {}", message.chat.id);

    (found.function)(CommandParams {
        bot,
        app,
        message,
        message_text: text,
        command_len,
    })
    .await?;

    Ok(true)
}

/// A @username, or a placeholder with the ID if we don't know it.
pub async fn user_display_name(app: &App, user_id: UserId) -> Result<String, Error> {
    Ok(match app.usernames.username_of(user_id).await? {
        Some(username) => format!("@{username}"),
        None => format!("Unnamed user ({user_id})"),
    })
}

const START: Command = Command {
    callname: "/start",
    description: "Start the bot and show this help.",
    function: start,
    hidden: false,
};

fn start(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        let chat_id = params.message.chat.id;
        log::info!("Chat {chat_id} will be added to the database after /start");
        params.app.database.add_chat(chat_id).await?;
        params.reply(&help_text("Welcome!")).await
    })
}

const HELP: Command = Command {
    callname: "/help",
    description: "Show this help.",
    function: help,
    hidden: false,
};

fn help(params: CommandParams) -> CommandFuture {
    Box::pin(async move { params.reply(&help_text("Need help? Here!")).await })
}

const DONT_DISTURB_ME: Command = Command {
    callname: "/dont_disturb_me",
    description: "Ask everyone to not mention you in this chat, or allow it again.",
    function: dont_disturb_me,
    hidden: false,
};

fn dont_disturb_me(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        if !params.require_group().await? {
            return Ok(());
        }
        let Some(user) = &params.message.from else {
            return Ok(());
        };
        // Without a username, nobody can @mention them anyway.
        let Some(username) = &user.username else {
            return params
                .reply("You don't have a username. Set one in Telegram settings and try again.")
                .await;
        };

        let banned = params
            .app
            .engine
            .set_mention_ban(params.message.chat.id, user.id, None)
            .await?;

        let username = encode_text(username);
        if banned {
            params
                .reply(&format!("Now only I can mention @{username}!"))
                .await
        } else {
            params
                .reply(&format!("Everyone can mention @{username} again!"))
                .await
        }
    })
}

const LIST: Command = Command {
    callname: "/list",
    description: "List people who can't be mentioned in this chat.",
    function: list,
    hidden: false,
};

fn list(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        let chat_id = params.message.chat.id;
        log::info!("Listing users with mention bans in chat {chat_id}");

        let users = params.app.engine.mention_banned_users(chat_id).await?;
        let mut text = String::from("People who can't be mentioned here:\n\n");
        if users.is_empty() {
            text += "Nobody!";
        }
        for user_id in users {
            text += &encode_text(&user_display_name(params.app, user_id).await?);
            text += "\n";
        }
        params.reply(&text).await
    })
}

const STATS: Command = Command {
    callname: "/stats",
    description: "Show your violations in this chat.",
    function: stats,
    hidden: false,
};

fn stats(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        let Some(user) = &params.message.from else {
            return Ok(());
        };
        let record = params
            .app
            .engine
            .violations_of(params.message.chat.id, user.id)
            .await?;

        let Some(record) = record else {
            return params
                .reply("You haven't done anything wrong yet, wonderful!")
                .await;
        };

        let (today, month, total) = record.counters_as_of(Utc::now().date_naive());
        params
            .reply(&format!(
                concat!(
                    "Alas, you have violations:\n\n",
                    "Today: {}\n",
                    "This month: {}\n",
                    "Total: {}"
                ),
                today, month, total
            ))
            .await
    })
}

const TOP: Command = Command {
    callname: "/top",
    description: "Show the top 5 violators in this chat.",
    function: top,
    hidden: false,
};

fn top(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        let chat_id = params.message.chat.id;
        log::info!("Printing top violators of chat {chat_id}");

        let top = params.app.engine.top_violators(chat_id, 5).await?;
        let mut text = String::from("Top 5 people with the most violations:\n\n");
        if top.is_empty() {
            text += "Nobody's in the top :)";
        }
        for (user_id, violations) in top {
            let name = user_display_name(params.app, user_id).await?;
            text += &format!("{}: {violations}\n", encode_text(&name));
        }
        params.reply(&text).await
    })
}

const MENTION_BAN: Command = Command {
    callname: "/mention_ban on|off",
    description: "(chat admins only) Reply to someone to set whether they can be mentioned.",
    function: mention_ban,
    hidden: false,
};

fn mention_ban(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        if !params.require_group().await? {
            return Ok(());
        }
        let chat_id = params.message.chat.id;
        let Some(sender) = &params.message.from else {
            return Ok(());
        };

        if !is_chat_admin(params.bot, chat_id, sender.id).await? {
            return params.reply("Only admins of this chat can do that.").await;
        }

        let value = match params.get_params().to_lowercase().as_str() {
            "on" => true,
            "off" => false,
            _ => {
                return params
                    .reply("Usage: reply to someone with <code>/mention_ban on</code> or <code>/mention_ban off</code>.")
                    .await
            }
        };

        let Some(target) = params
            .message
            .reply_to_message()
            .and_then(|x| x.from.as_ref())
        else {
            return params
                .reply("Reply to a message of the person this is for.")
                .await;
        };

        params
            .app
            .engine
            .set_mention_ban(chat_id, target.id, Some(value))
            .await?;

        let name = encode_text(&crate::actions::user_name_prettyprint(target)).into_owned();
        if value {
            params
                .reply(&format!("{name} can't be mentioned here anymore."))
                .await
        } else {
            params
                .reply(&format!("{name} can be mentioned here again."))
                .await
        }
    })
}

const FORGIVE: Command = Command {
    callname: "/forgive",
    description: "(chat admins only) Reply to someone to forgive their violations.",
    function: forgive,
    hidden: false,
};

fn forgive(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        if !params.require_group().await? {
            return Ok(());
        }
        let Some(sender) = &params.message.from else {
            return Ok(());
        };
        let Some(target) = params
            .message
            .reply_to_message()
            .and_then(|x| x.from.as_ref())
        else {
            return params
                .reply("Reply to a message of the person this is for.")
                .await;
        };

        match params
            .app
            .engine
            .forgive_violation(params.message.chat.id, target.id, sender.id)
            .await
        {
            Ok(()) => params.reply("Forgiven.").await,
            Err(Error::Unsupported(what)) => {
                params
                    .reply(&format!("Sorry, {what} is not supported. What's done is done."))
                    .await
            }
            Err(e) => Err(e),
        }
    })
}

const CHAT_ID: Command = Command {
    callname: "/chat_id",
    description: "Show the ID of this chat.",
    function: chat_id,
    hidden: false,
};

fn chat_id(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        let chat_id = params.message.chat.id;
        params
            .reply(&format!("Current chat ID: <code>{chat_id}</code>"))
            .await
    })
}

const VERSION: Command = Command {
    callname: "/version",
    description: "Show the version of this bot.",
    function: version,
    hidden: false,
};

fn version(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        params
            .reply(concat!(
                env!("CARGO_PKG_NAME"),
                " ",
                env!("CARGO_PKG_VERSION"),
                "\n",
                env!("CARGO_PKG_DESCRIPTION"),
            ))
            .await
    })
}

const STATUS: Command = Command {
    callname: "/status",
    description: "Show whether the bot is doing fine.",
    function: status,
    hidden: false,
};

fn status_text(error_count: i64, database_connected: bool) -> String {
    format!(
        "Status: {}\nUnexpected errors: {error_count}\nDatabase: {}",
        if error_count == 0 { "Stable" } else { "Unstable" },
        if database_connected {
            "connected"
        } else {
            "disconnected"
        }
    )
}

fn status(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        log::info!("Printing status in chat {}", params.message.chat.id);
        let database = &params.app.database;
        let connected = database.is_connected().await;
        // Can't count errors without the database.
        let count = if connected {
            database.error_count().await?
        } else {
            0
        };
        params.reply(&status_text(count, connected)).await
    })
}

const ANNOUNCE: Command = Command {
    callname: "/announce",
    description: "Send a message to every chat this bot is in.",
    function: announce,
    hidden: true,
};

fn announce(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        if !params.require_operator().await? {
            return Ok(());
        }
        let text = params.get_params();
        if text.is_empty() {
            return params
                .reply("Usage: <code>/announce text of the announcement</code>")
                .await;
        }

        let id = params.app.database.push_announcement(text).await?;
        params
            .reply(&format!(
                "Announcement #{id} queued. It will go out on the next broadcast cycle."
            ))
            .await
    })
}

const ERRORS: Command = Command {
    callname: "/errors",
    description: "Show how many unexpected errors happened.",
    function: errors,
    hidden: true,
};

fn errors(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        if !params.require_operator().await? {
            return Ok(());
        }
        let count = params.app.database.error_count().await?;
        let mut text = format!("Unexpected errors: {count} (/clear_errors)");
        if let Some((name, details)) = params.app.database.latest_error().await? {
            text += &format!(
                "\n\nLatest: <b>{}</b>\n<code>{}</code>",
                encode_text(&name),
                encode_text(&details)
            );
        }
        params.reply(&text).await
    })
}

const CLEAR_ERRORS: Command = Command {
    callname: "/clear_errors",
    description: "Forget all the unexpected errors.",
    function: clear_errors,
    hidden: true,
};

fn clear_errors(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        if !params.require_operator().await? {
            return Ok(());
        }
        log::info!("Clearing all errors, asked in chat {}", params.message.chat.id);
        params.app.database.clear_errors().await?;
        params.reply("All errors deleted.").await
    })
}

const GEN_ERROR: Command = Command {
    callname: "/gen_error",
    description: "Report a sample error, to see that error reporting works.",
    function: gen_error,
    hidden: true,
};

async fn report_sample_error<R: ErrorTracker>(tracker: &R, user_id: UserId, chat_id: ChatId) {
    log::info!("Generating a sample error, asked by user {user_id} in chat {chat_id}");
    tracker
        .report_error(
            "Sample error",
            &format!("Generated on purpose by user {user_id} in chat {chat_id}"),
        )
        .await;
}

fn gen_error(params: CommandParams) -> CommandFuture {
    Box::pin(async move {
        if !params.require_operator().await? {
            return Ok(());
        }
        let Some(user) = &params.message.from else {
            return Ok(());
        };
        report_sample_error(&*params.app.database, user.id, params.message.chat.id).await;
        params.reply("Sample error reported. See /errors").await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn status_messages() {
        assert_eq!(
            status_text(0, true),
            "Status: Stable\nUnexpected errors: 0\nDatabase: connected"
        );
        assert_eq!(
            status_text(3, false),
            "Status: Unstable\nUnexpected errors: 3\nDatabase: disconnected"
        );
    }

    #[tokio::test]
    async fn sample_error_is_tracked() {
        let db = Database::new_in_memory().await.unwrap();
        report_sample_error(&db, UserId(42), ChatId(-100)).await;

        assert_eq!(db.error_count().await.unwrap(), 1);
        let (name, details) = db.latest_error().await.unwrap().unwrap();
        assert_eq!(name, "Sample error");
        assert!(details.contains("user 42"));
        assert!(details.contains("chat -100"));
    }

    #[test]
    fn callnames_match() {
        assert!(MENTION_BAN.is_matching_callname("/mention_ban"));
        assert!(MENTION_BAN.is_matching_callname("/MENTION_BAN"));
        assert!(!MENTION_BAN.is_matching_callname("/mention"));
        assert!(TOP.is_matching_callname("/top"));
    }

    #[test]
    fn bot_commands_skip_hidden() {
        let commands = generate_bot_commands();
        let names: Vec<&str> = commands.iter().map(|x| x.command.as_str()).collect();
        assert!(names.contains(&"start"));
        assert!(names.contains(&"mention_ban"));
        assert!(!names.contains(&"announce"));
        assert!(!names.contains(&"clear_errors"));
        assert!(!names.contains(&"gen_error"));
        assert!(names.contains(&"status"));
        assert_eq!(names.len(), COMMANDS.iter().filter(|x| !x.hidden).count());
    }

    #[test]
    fn help_lists_visible_commands() {
        let help = help_text("Hi <3");
        assert!(help.starts_with("Hi &lt;3\n\n"));
        assert!(help.contains("/dont_disturb_me - "));
        assert!(help.contains("/mention_ban on|off - "));
        assert!(!help.contains("/announce"));
        assert!(!help.ends_with('\n'));
    }
}
