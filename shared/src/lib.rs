//! Wire grammar shared by the lobby server and its clients.
//!
//! Every message is a single line of UTF-8 text. Commands start with `:`
//! and carry at most one argument, separated from the command word by the
//! first space. Plain lines (no leading `:`) are words or names depending
//! on where the sender is in the protocol.

use std::fmt;

pub const MAX_NAME_LEN: usize = 10;
/// Lobby ids are drawn from `0..LOBBY_ID_UPPER`.
pub const LOBBY_ID_UPPER: u32 = 9999;

/// Suffix a host appends to a word it has already solved.
pub const PRESOLVED_MARK: &str = "y";

pub const HOST: &str = ":host";
pub const JOIN: &str = ":join";
pub const END_WORDS: &str = ":endwords";
pub const ATTEMPT: &str = ":attempt";
pub const GIVE_UP: &str = ":giveup";
pub const UNGIVE_UP: &str = ":ungiveup";

/// Returns true if `name` may be used as a player name.
///
/// A name must be non-empty, at most [`MAX_NAME_LEN`] characters long and
/// made only of letters and digits.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= MAX_NAME_LEN
        && name.chars().all(char::is_alphanumeric)
}

/// Splits a message into its command word and optional argument.
///
/// The argument is everything after the first space, so it may itself
/// contain spaces.
pub fn split_command(msg: &str) -> (&str, Option<&str>) {
    match msg.split_once(' ') {
        Some((command, arg)) => (command, Some(arg)),
        None => (msg, None),
    }
}

/// A line sent by the host while it is still listing the lobby's words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordSubmission<'a> {
    Word { word: &'a str, presolved: bool },
    Done,
}

impl<'a> WordSubmission<'a> {
    pub fn parse(msg: &'a str) -> Self {
        let (word, rest) = split_command(msg);
        if word == END_WORDS {
            return WordSubmission::Done;
        }
        WordSubmission::Word {
            word,
            presolved: rest == Some(PRESOLVED_MARK),
        }
    }
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    BadName,
    NoLobby,
    Player { connected: bool, name: String },
    EndPlayers,
    Word(String),
    EndWords,
    Attempt { word: String, player: String },
    GiveUp(String),
    UngiveUp(String),
    AllGiveUp,
    Join(String),
    Quit(String),
    LobbyId(String),
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::BadName => f.write_str(":badname"),
            ServerMessage::NoLobby => f.write_str(":nolobby"),
            ServerMessage::Player { connected, name } => {
                let flag = if *connected { "y" } else { "n" };
                write!(f, ":player {} {}", flag, name)
            }
            ServerMessage::EndPlayers => f.write_str(":endplayers"),
            ServerMessage::Word(word) => f.write_str(word),
            ServerMessage::EndWords => f.write_str(END_WORDS),
            ServerMessage::Attempt { word, player } => {
                write!(f, "{} {} {}", ATTEMPT, word, player)
            }
            ServerMessage::GiveUp(name) => write!(f, "{} {}", GIVE_UP, name),
            ServerMessage::UngiveUp(name) => write!(f, "{} {}", UNGIVE_UP, name),
            ServerMessage::AllGiveUp => f.write_str(":allgiveup"),
            ServerMessage::Join(name) => write!(f, "{} {}", JOIN, name),
            ServerMessage::Quit(name) => write!(f, ":quit {}", name),
            ServerMessage::LobbyId(id) => f.write_str(id),
        }
    }
}
