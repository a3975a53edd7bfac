//! Texts of relay-originated notices and client speaker labels.

use super::identity::ConnectionId;

/// Language of system notices, picked from the configured locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Russian,
    English,
}

impl Language {
    /// `ru`, `ru-RU`, `ru_RU` and friends select Russian; anything else English.
    pub fn from_locale(locale: &str) -> Self {
        let primary = locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .trim();
        if primary.eq_ignore_ascii_case("ru") {
            Self::Russian
        } else {
            Self::English
        }
    }

    pub fn welcome(self, id: ConnectionId) -> String {
        match self {
            Self::Russian => format!("Добро пожаловать, Участник №{id}."),
            Self::English => format!("Welcome, participant #{id}."),
        }
    }

    pub fn joined(self, id: ConnectionId) -> String {
        match self {
            Self::Russian => format!("Участник №{id} присоединился к чату."),
            Self::English => format!("Participant #{id} joined the chat."),
        }
    }

    pub fn farewell(self) -> &'static str {
        match self {
            Self::Russian => "Вы покидаете чат. Ждём вас снова!",
            Self::English => "You are leaving the chat. Come back soon!",
        }
    }

    pub fn left(self, id: ConnectionId) -> String {
        match self {
            Self::Russian => format!("Участник №{id} покинул чат."),
            Self::English => format!("Participant #{id} left the chat."),
        }
    }

    pub fn kicked(self) -> &'static str {
        match self {
            Self::Russian => "Вы отключаетесь от чата по запросу администратора.",
            Self::English => "You are being disconnected by the administrator.",
        }
    }

    pub fn no_such_participant(self) -> &'static str {
        match self {
            Self::Russian => "Нет участника с таким номером!",
            Self::English => "There is no participant with that number!",
        }
    }

    pub fn admin_granted(self) -> &'static str {
        match self {
            Self::Russian => "Вы назначены администратором чата.",
            Self::English => "You are now the chat administrator.",
        }
    }

    pub fn label_me(self) -> &'static str {
        match self {
            Self::Russian => "Вы:",
            Self::English => "You:",
        }
    }

    pub fn label_server(self) -> &'static str {
        match self {
            Self::Russian => "Сервер:",
            Self::English => "Server:",
        }
    }

    pub fn label_participant(self, id: ConnectionId) -> String {
        match self {
            Self::Russian => format!("Участник №{id}:"),
            Self::English => format!("Participant #{id}:"),
        }
    }
}
