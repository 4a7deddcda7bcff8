//! Recognizes engine-relevant lines in the server's console output.

use diffbackup::InfoEvent;

/// The message part of a log line, after the `[time] [thread/LEVEL]: ` prefix
fn message(line: &str) -> &str {
    match line.find("]: ") {
        Some(pos) => &line[pos + 3..],
        None => line,
    }
    .trim_end()
}

fn is_player_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn parse_line(line: &str) -> Option<InfoEvent> {
    let message = message(line);
    // chat
    if message.starts_with('<') {
        return None;
    }

    if message.ends_with("Saved the game") || message.ends_with("Saved the world") {
        return Some(InfoEvent::SaveCompleted);
    }
    if let Some(name) = message.strip_suffix(" joined the game") {
        return is_player_name(name).then(|| InfoEvent::PlayerJoined(name.to_string()));
    }
    if let Some(name) = message.strip_suffix(" left the game") {
        return is_player_name(name).then(|| InfoEvent::PlayerLeft(name.to_string()));
    }
    None
}
