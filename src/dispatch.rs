//! First-phase parsing of worker output lines: extract a leading bracketed
//! tag, map it onto the closed tag set, and decode the structured payload
//! formats. Routing lives in the orchestrator so the match over `OutputTag`
//! stays exhaustive at compile time.

/// A tag further into the line than this is game output, not a marker.
pub const MAX_TAG_OFFSET: usize = 20;

/// User name attributed to actions the system issues on its own behalf.
pub const SERVER_USERNAME: &str = "<server>";

/// Admin token the game emits for actions the system itself issued; the
/// sentence-final period of the ban line is part of the token. Such lines
/// must not be re-applied, or every fan-out would echo forever.
pub const SERVER_ADMIN_TOKEN: &str = "<server>.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTag {
    Chat,
    Discord,
    DiscordRaw,
    DiscordBold,
    DiscordAdmin,
    DiscordAdminRaw,
    DiscordEmbed,
    DiscordEmbedRaw,
    DiscordAdminEmbed,
    DiscordAdminEmbedRaw,
    Join,
    Leave,
    RegularPromote,
    RegularDemote,
    StartScenario,
    Ban,
    Unbanned,
    Ping,
    DataSet,
    DataGet,
    DataGetAll,
    DataTracked,
}

impl OutputTag {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "CHAT" => Some(OutputTag::Chat),
            "DISCORD" => Some(OutputTag::Discord),
            "DISCORD-RAW" => Some(OutputTag::DiscordRaw),
            "DISCORD-BOLD" => Some(OutputTag::DiscordBold),
            "DISCORD-ADMIN" => Some(OutputTag::DiscordAdmin),
            "DISCORD-ADMIN-RAW" => Some(OutputTag::DiscordAdminRaw),
            "DISCORD-EMBED" => Some(OutputTag::DiscordEmbed),
            "DISCORD-EMBED-RAW" => Some(OutputTag::DiscordEmbedRaw),
            "DISCORD-ADMIN-EMBED" => Some(OutputTag::DiscordAdminEmbed),
            "DISCORD-ADMIN-EMBED-RAW" => Some(OutputTag::DiscordAdminEmbedRaw),
            "JOIN" => Some(OutputTag::Join),
            "LEAVE" => Some(OutputTag::Leave),
            "REGULAR-PROMOTE" => Some(OutputTag::RegularPromote),
            "REGULAR-DEMOTE" => Some(OutputTag::RegularDemote),
            "START-SCENARIO" => Some(OutputTag::StartScenario),
            "BAN" => Some(OutputTag::Ban),
            "UNBANNED" => Some(OutputTag::Unbanned),
            "PING" => Some(OutputTag::Ping),
            "DATA-SET" => Some(OutputTag::DataSet),
            "DATA-GET" => Some(OutputTag::DataGet),
            "DATA-GET-ALL" => Some(OutputTag::DataGetAll),
            "DATA-TRACKED" => Some(OutputTag::DataTracked),
            _ => None,
        }
    }
}

/// Extracts `(tag, payload)` from a worker output line. Returns `None` for
/// untagged lines, tags past `MAX_TAG_OFFSET`, and tags outside the closed
/// set; those lines are archived only.
pub fn parse_line(line: &str) -> Option<(OutputTag, &str)> {
    let open = line.find('[')?;
    if open > MAX_TAG_OFFSET {
        return None;
    }

    let close = line[open + 1..].find(']')? + open + 1;
    let tag = &line[open + 1..close];
    if tag.is_empty() || tag.contains('[') {
        return None;
    }

    let payload = line[close + 1..].trim();
    OutputTag::from_tag(tag).map(|tag| (tag, payload))
}

/// Splits a callback payload into `(function token, argument text)`.
pub fn split_callback(payload: &str) -> Option<(&str, &str)> {
    let space = payload.find(' ')?;
    let rest = &payload[space + 1..];
    if rest.is_empty() {
        return None;
    }
    Some((&payload[..space], rest))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEvent {
    pub username: String,
    pub admin: String,
    pub reason: String,
}

/// Parses the game's ban announcement, e.g.
/// `player1 was banned by admin1. Reason: grief.` or
/// `player1 (not on map) was banned by admin1. Reason: grief.`
/// The admin token keeps its trailing period; `<server>.` marks system bans.
pub fn parse_ban(payload: &str) -> Option<BanEvent> {
    let words: Vec<&str> = payload.split(' ').collect();
    if words.len() < 7 {
        return None;
    }

    let username = words[0];
    let mut index = 4;
    if words[1] == "(not" {
        if words.len() < 10 {
            return None;
        }
        index += 3;
    }

    let admin = words[index];
    index += 2;
    let reason = words[index..].join(" ");

    Some(BanEvent {
        username: username.to_string(),
        admin: admin.to_string(),
        reason,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbanEvent {
    pub username: String,
    pub admin: String,
}

/// Parses `player1 was unbanned by admin1.`
pub fn parse_unban(payload: &str) -> Option<UnbanEvent> {
    let words: Vec<&str> = payload.split(' ').collect();
    if words.len() < 5 {
        return None;
    }

    Some(UnbanEvent {
        username: words[0].to_string(),
        admin: words[4].to_string(),
    })
}

/// Escapes chat-platform markdown so player text renders literally.
pub fn sanitize_chat(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '*' | '_' | '~' | '`' | '|') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escapes text destined for an in-game `game.print` single-quoted string.
pub fn sanitize_game_chat(text: &str) -> String {
    text.replace('\'', "\\'").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_leading_tags() {
        assert_eq!(
            parse_line("[CHAT] player1: hello"),
            Some((OutputTag::Chat, "player1: hello"))
        );
        assert_eq!(
            parse_line("2024-01-01 [JOIN] player1 joined the game"),
            Some((OutputTag::Join, "player1 joined the game"))
        );
    }

    #[test]
    fn rejects_tags_past_the_offset_limit() {
        let line = format!("{}[CHAT] too late", " ".repeat(MAX_TAG_OFFSET + 1));
        assert_eq!(parse_line(&line), None);
    }

    #[test]
    fn unknown_or_malformed_tags_are_ignored() {
        assert_eq!(parse_line("[WHATEVER] content"), None);
        assert_eq!(parse_line("no tag at all"), None);
        assert_eq!(parse_line("[] empty"), None);
        assert_eq!(parse_line("[unclosed content"), None);
    }

    #[test]
    fn parses_plain_ban_line() {
        let event = parse_ban("player1 was banned by admin1. Reason: some reason.").unwrap();
        assert_eq!(event.username, "player1");
        assert_eq!(event.admin, "admin1.");
        assert_eq!(event.reason, "some reason.");
    }

    #[test]
    fn parses_offline_ban_line() {
        let event =
            parse_ban("player1 (not on map) was banned by admin1. Reason: some reason.").unwrap();
        assert_eq!(event.username, "player1");
        assert_eq!(event.admin, "admin1.");
        assert_eq!(event.reason, "some reason.");
    }

    #[test]
    fn server_issued_ban_carries_the_server_token() {
        let event = parse_ban("player1 was banned by <server>. Reason: echo.").unwrap();
        assert_eq!(event.admin, SERVER_ADMIN_TOKEN);
    }

    #[test]
    fn short_ban_lines_are_rejected() {
        assert_eq!(parse_ban("player1 was banned"), None);
        assert_eq!(parse_ban("player1 (not on map) was banned by x."), None);
    }

    #[test]
    fn parses_unban_line() {
        let event = parse_unban("player1 was unbanned by admin1.").unwrap();
        assert_eq!(event.username, "player1");
        assert_eq!(event.admin, "admin1.");
        assert_eq!(parse_unban("player1 was unbanned"), None);
    }

    #[test]
    fn callback_payload_splits_on_first_space() {
        assert_eq!(
            split_callback("cb.1 {data_set=\"ds\"}"),
            Some(("cb.1", "{data_set=\"ds\"}"))
        );
        assert_eq!(split_callback("lonely"), None);
        assert_eq!(split_callback("trailing "), None);
    }

    #[test]
    fn chat_sanitizer_escapes_markdown() {
        assert_eq!(sanitize_chat("a*b_c`d"), "a\\*b\\_c\\`d");
        assert_eq!(sanitize_chat("plain"), "plain");
    }

    #[test]
    fn game_chat_sanitizer_escapes_quotes_and_newlines() {
        assert_eq!(sanitize_game_chat("it's\nme"), "it\\'s me");
    }
}
