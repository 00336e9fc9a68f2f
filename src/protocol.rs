//! Line-delimited JSON exchanged between `client` and the server. Each side
//! writes one serialized value followed by `\n`.

use serde::{Deserialize, Serialize};

use crate::models::{Chat, Id, Message};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Register { name: String, password: String },
    Login { name: String, password: String },
    OpenPersonalChat { peer: String },
    CreateGroup { name: String, members: Vec<String> },
    AddMember { chat_id: Id, user: String },
    Send { chat_id: Id, text: String },
    History { chat_id: Id },
    FindMessage { chat_id: Id, text: String },
    DeleteMessage { chat_id: Id, message_id: Id },
    MarkRead { chat_id: Id, message_id: Id },
    ShowChat { chat_id: Id },
    ListChats,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ServerResponse {
    Prompt(String),
    Success { message: String, id: Option<Id> },
    Error(String),
    Chat(Chat),
    Chats(Vec<Id>),
    Message(Message),
    Messages(Vec<Message>),
}

impl ServerResponse {
    pub fn success(message: impl Into<String>, id: Option<Id>) -> Self {
        ServerResponse::Success {
            message: message.into(),
            id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerResponse::Error(message.into())
    }
}

pub fn encode_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}
