use std::env;

use anyhow::Result;
use dotenv::dotenv;
use log::{debug, warn};
use messenger::config::DEFAULT_SERVER_ADDR;
use messenger::protocol::{decode_line, encode_line, ClientMessage, ServerResponse};
use messenger::{Id, Message};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const HELP: &str = "\
commands:
  register <name> <password>
  login <name> <password>
  chat <user>                  open a personal chat
  group <name> [user ...]      create a group chat
  invite <chat_id> <user>      add a user to a group chat
  send <chat_id> <text>
  history <chat_id>
  find <chat_id> <text>
  delete <chat_id> <message_id>
  read <chat_id> <message_id>
  show <chat_id>
  chats
  exit";

fn parse_id(raw: Option<&str>) -> Result<Id, String> {
    raw.ok_or_else(|| "missing id".to_string())?
        .parse::<i64>()
        .map(Id)
        .map_err(|e| format!("bad id: {}", e))
}

/// Rest of the line after skipping `skip` words, as typed.
fn tail(input: &str, skip: usize) -> String {
    let mut rest = input.trim_start();
    for _ in 0..skip {
        rest = rest
            .split_once(char::is_whitespace)
            .map_or("", |(_, after)| after)
            .trim_start();
    }
    rest.to_string()
}

/// Maps one input line to a request. `Ok(None)` means nothing to send.
fn parse_command(input: &str) -> Result<Option<ClientMessage>, String> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let Some(command) = parts.first() else {
        return Ok(None);
    };

    let command = command.to_lowercase();
    let msg = match command.as_str() {
        "register" | "login" if parts.len() >= 3 => {
            let name = parts[1].to_string();
            let password = tail(input, 2);
            if command == "register" {
                ClientMessage::Register { name, password }
            } else {
                ClientMessage::Login { name, password }
            }
        }
        "chat" if parts.len() == 2 => ClientMessage::OpenPersonalChat {
            peer: parts[1].to_string(),
        },
        "group" if parts.len() >= 2 => ClientMessage::CreateGroup {
            name: parts[1].to_string(),
            members: parts[2..].iter().map(|s| s.to_string()).collect(),
        },
        "invite" if parts.len() == 3 => ClientMessage::AddMember {
            chat_id: parse_id(parts.get(1).copied())?,
            user: parts[2].to_string(),
        },
        "send" if parts.len() >= 3 => ClientMessage::Send {
            chat_id: parse_id(parts.get(1).copied())?,
            text: tail(input, 2),
        },
        "find" if parts.len() >= 3 => ClientMessage::FindMessage {
            chat_id: parse_id(parts.get(1).copied())?,
            text: tail(input, 2),
        },
        "history" if parts.len() == 2 => ClientMessage::History {
            chat_id: parse_id(parts.get(1).copied())?,
        },
        "show" if parts.len() == 2 => ClientMessage::ShowChat {
            chat_id: parse_id(parts.get(1).copied())?,
        },
        "delete" if parts.len() == 3 => ClientMessage::DeleteMessage {
            chat_id: parse_id(parts.get(1).copied())?,
            message_id: parse_id(parts.get(2).copied())?,
        },
        "read" if parts.len() == 3 => ClientMessage::MarkRead {
            chat_id: parse_id(parts.get(1).copied())?,
            message_id: parse_id(parts.get(2).copied())?,
        },
        "chats" => ClientMessage::ListChats,
        "help" => {
            println!("{}", HELP);
            return Ok(None);
        }
        _ => return Err(format!("unknown command '{}', try 'help'", input.trim())),
    };
    Ok(Some(msg))
}

fn print_message(message: &Message) {
    let when = message
        .sent_at
        .map(|at| at.format("%H:%M").to_string())
        .unwrap_or_default();
    let id = message.id.map(|id| id.to_string()).unwrap_or_default();
    println!("[chat {} #{} {}] user {}: {}", message.chat_id, id, when, message.sender_id, message.text);
}

fn print_response(response: ServerResponse) {
    match response {
        ServerResponse::Prompt(msg) => println!("{}", msg),
        ServerResponse::Success { message, id: Some(id) } => println!("Success: {} (id {})", message, id),
        ServerResponse::Success { message, id: None } => println!("Success: {}", message),
        ServerResponse::Error(msg) => println!("Error: {}", msg),
        ServerResponse::Chat(chat) => {
            let members: Vec<String> = chat.members().iter().map(Id::to_string).collect();
            println!(
                "Chat {} ({}{}): members {}",
                chat.id().map(|id| id.to_string()).unwrap_or_default(),
                chat.kind(),
                chat.name().map(|name| format!(" '{}'", name)).unwrap_or_default(),
                members.join(", ")
            );
        }
        ServerResponse::Chats(ids) => {
            let ids: Vec<String> = ids.iter().map(Id::to_string).collect();
            println!("Chats: {}", ids.join(", "));
        }
        ServerResponse::Message(message) => print_message(&message),
        ServerResponse::Messages(messages) => messages.iter().for_each(print_message),
    }
}

pub async fn run_client(addr: &str) -> Result<()> {
    let stream = TcpStream::connect(addr).await?;
    println!("Connected to {}", addr);

    let (reader, mut writer) = tokio::io::split(stream);

    // Spawn a task to read server responses
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_line::<ServerResponse>(&line) {
                    Ok(response) => print_response(response),
                    Err(e) => warn!("Invalid response {:?}: {}", line, e),
                },
                Ok(None) => {
                    println!("Server disconnected");
                    break;
                }
                Err(e) => {
                    println!("Error reading: {}", e);
                    break;
                }
            }
        }
    });

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut input = String::new();

    loop {
        input.clear();
        if reader.read_line(&mut input).await? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("exit") {
            println!("Exiting client...");
            break;
        }

        let msg = match parse_command(input) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        let line = encode_line(&msg)?;
        debug!("Sending {}", line.trim_end());
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| env::var("SERVER_ADDR").unwrap_or(DEFAULT_SERVER_ADDR.to_string()));

    run_client(&addr).await
}
