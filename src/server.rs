use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::hash::PasswordHasher;
use crate::models::{Chat, Id, Message, User};
use crate::protocol::{decode_line, encode_line, ClientMessage, ServerResponse};
use crate::storage::Engine;

const GREETING: &str = "Send 'register <name> <password>' or 'login <name> <password>' to start";

type Clients = Arc<Mutex<HashMap<Id, mpsc::Sender<ServerResponse>>>>;

/// TCP front end. Owns nothing but plumbing: every storage call goes through
/// the repositories on a blocking thread.
pub struct Server {
    engine: Arc<Engine>,
    clients: Clients,
    hasher: PasswordHasher,
}

impl Server {
    pub fn new(engine: Arc<Engine>) -> Self {
        Server::with_hasher(engine, PasswordHasher::new())
    }

    pub fn with_hasher(engine: Arc<Engine>, hasher: PasswordHasher) -> Self {
        Server {
            engine,
            clients: Arc::new(Mutex::new(HashMap::new())),
            hasher,
        }
    }

    pub async fn run(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server running on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let tag = Uuid::new_v4();
            info!("New connection {} from {}", tag, peer);

            let session = Session {
                tag,
                user_id: None,
                engine: Arc::clone(&self.engine),
                clients: Arc::clone(&self.clients),
                hasher: self.hasher.clone(),
            };

            tokio::spawn(async move {
                if let Err(e) = session.run(socket).await {
                    warn!("Error handling client {}: {}", tag, e);
                }
            });
        }
    }
}

struct Session {
    tag: Uuid,
    user_id: Option<Id>,
    engine: Arc<Engine>,
    clients: Clients,
    hasher: PasswordHasher,
}

impl Session {
    async fn run(mut self, socket: TcpStream) -> Result<()> {
        let (reader, mut socket_write) = tokio::io::split(socket);
        let mut reader = BufReader::new(reader);
        let (tx, mut rx) = mpsc::channel::<ServerResponse>(100);

        let tag = self.tag;
        tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let line = encode_line(&response)?;
                debug!("Sending to {}: {}", tag, line.trim_end());
                socket_write.write_all(line.as_bytes()).await?;
                socket_write.flush().await?;
            }
            Ok::<(), anyhow::Error>(())
        });

        tx.send(ServerResponse::Prompt(GREETING.to_string())).await?;

        let mut line = String::new();
        let result = loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!("Connection {} closed", self.tag);
                    break Ok(());
                }
                Ok(_) => {
                    let response = match decode_line::<ClientMessage>(&line) {
                        Ok(message) => self.handle(message, &tx).await,
                        Err(_) => ServerResponse::error("Invalid message format"),
                    };
                    tx.send(response).await?;
                }
                Err(e) => {
                    warn!("Error reading from {}: {}", self.tag, e);
                    break Err(e.into());
                }
            }
        };

        if let Some(id) = self.user_id {
            self.clients.lock().await.remove(&id);
        }
        result
    }

    async fn handle(&mut self, message: ClientMessage, tx: &mpsc::Sender<ServerResponse>) -> ServerResponse {
        let outcome = match (self.user_id, message) {
            (Some(me), message) => self.handle_authenticated(me, message).await,
            (None, ClientMessage::Register { name, password }) => self.register(name, password, tx).await,
            (None, ClientMessage::Login { name, password }) => self.login(name, password, tx).await,
            (None, _) => Ok(ServerResponse::error("Not authenticated")),
        };
        outcome.unwrap_or_else(|e| {
            error!("Request from {} failed: {}", self.tag, e);
            ServerResponse::error("Internal error")
        })
    }

    async fn handle_authenticated(&self, me: Id, message: ClientMessage) -> Result<ServerResponse> {
        match message {
            ClientMessage::OpenPersonalChat { peer } => self.open_personal_chat(me, peer).await,
            ClientMessage::CreateGroup { name, members } => self.create_group(me, name, members).await,
            ClientMessage::AddMember { chat_id, user } => {
                self.with_membership(me, chat_id, move |engine| {
                    let Some(user_id) = engine.users().find_by_name(&user).and_then(|found| found.id) else {
                        return ServerResponse::error(format!("User {} not found", user));
                    };
                    match engine.chats().try_add_member(chat_id, user_id) {
                        Ok(()) => ServerResponse::success(format!("{} joined chat {}", user, chat_id), Some(chat_id)),
                        Err(e) => ServerResponse::error(format!("Cannot add {}: {}", user, e)),
                    }
                })
                .await
            }
            ClientMessage::Send { chat_id, text } => self.send(me, chat_id, text).await,
            ClientMessage::History { chat_id } => {
                self.with_membership(me, chat_id, move |engine| {
                    ServerResponse::Messages(engine.messages().history(chat_id))
                })
                .await
            }
            ClientMessage::FindMessage { chat_id, text } => {
                self.with_membership(me, chat_id, move |engine| match engine.messages().find_by_text(chat_id, &text) {
                    Some(found) => ServerResponse::Message(found),
                    None => ServerResponse::error("Message not found"),
                })
                .await
            }
            ClientMessage::DeleteMessage { chat_id, message_id } => {
                self.with_membership(me, chat_id, move |engine| {
                    if engine.messages().delete(chat_id, message_id) {
                        ServerResponse::success(format!("Message {} deleted", message_id), Some(message_id))
                    } else {
                        ServerResponse::error("Message not found")
                    }
                })
                .await
            }
            ClientMessage::MarkRead { chat_id, message_id } => {
                self.with_membership(me, chat_id, move |engine| {
                    if engine.messages().mark_read(chat_id, message_id) {
                        ServerResponse::success("Marked as read", Some(message_id))
                    } else {
                        ServerResponse::error("Message not found")
                    }
                })
                .await
            }
            ClientMessage::ShowChat { chat_id } => {
                self.with_membership(me, chat_id, move |engine| match engine.chats().find(chat_id) {
                    Some(chat) => ServerResponse::Chat(chat),
                    None => ServerResponse::error("Chat not found"),
                })
                .await
            }
            ClientMessage::ListChats => {
                blocking(&self.engine, move |engine| ServerResponse::Chats(engine.chats().chats_of(me))).await
            }
            ClientMessage::Register { .. } | ClientMessage::Login { .. } => {
                Ok(ServerResponse::error("Already logged in"))
            }
        }
    }

    async fn register(
        &mut self,
        name: String,
        password: String,
        tx: &mpsc::Sender<ServerResponse>,
    ) -> Result<ServerResponse> {
        let hasher = self.hasher.clone();
        let saved = blocking(&self.engine, move |engine| -> Result<Option<User>> {
            let mut user = User::new(name, hasher.hash(&password)?);
            Ok(engine.users().save(&mut user).then_some(user))
        })
        .await??;

        match saved {
            Some(User { id: Some(id), name, .. }) => {
                self.attach(id, tx).await;
                Ok(ServerResponse::success(format!("Registered and logged in as {}", name), Some(id)))
            }
            _ => Ok(ServerResponse::error("Registration failed: name is taken")),
        }
    }

    async fn login(
        &mut self,
        name: String,
        password: String,
        tx: &mpsc::Sender<ServerResponse>,
    ) -> Result<ServerResponse> {
        let hasher = self.hasher.clone();
        let lookup = name.clone();
        let user = blocking(&self.engine, move |engine| {
            engine
                .users()
                .find_by_name(&lookup)
                .filter(|user| hasher.verify(&password, &user.password_hash))
        })
        .await?;

        match user.and_then(|user| user.id) {
            Some(id) => {
                self.attach(id, tx).await;
                Ok(ServerResponse::success(format!("Logged in as {}", name), Some(id)))
            }
            None => Ok(ServerResponse::error("Invalid name or password")),
        }
    }

    async fn open_personal_chat(&self, me: Id, peer: String) -> Result<ServerResponse> {
        blocking(&self.engine, move |engine| {
            let Some(peer_id) = engine.users().find_by_name(&peer).and_then(|user| user.id) else {
                return ServerResponse::error(format!("User {} not found", peer));
            };
            let mut chat = match Chat::personal(me, peer_id) {
                Ok(chat) => chat,
                Err(e) => return ServerResponse::error(e.to_string()),
            };
            match engine.chats().try_save(&mut chat) {
                Ok(id) => ServerResponse::success(format!("Chat with {} opened", peer), Some(id)),
                Err(e) => ServerResponse::error(format!("Cannot open chat: {}", e)),
            }
        })
        .await
    }

    async fn create_group(&self, me: Id, name: String, members: Vec<String>) -> Result<ServerResponse> {
        blocking(&self.engine, move |engine| {
            let users = engine.users();
            let mut ids = vec![me];
            for member in &members {
                match users.find_by_name(member).and_then(|user| user.id) {
                    Some(id) => ids.push(id),
                    None => return ServerResponse::error(format!("User {} not found", member)),
                }
            }
            let mut chat = match Chat::group(name, ids) {
                Ok(chat) => chat,
                Err(e) => return ServerResponse::error(e.to_string()),
            };
            match engine.chats().try_save(&mut chat) {
                Ok(id) => ServerResponse::success(
                    format!("Group {} created with {} members", chat.name().unwrap_or_default(), chat.members().len()),
                    Some(id),
                ),
                Err(e) => ServerResponse::error(format!("Cannot create group: {}", e)),
            }
        })
        .await
    }

    async fn send(&self, me: Id, chat_id: Id, text: String) -> Result<ServerResponse> {
        let delivered = blocking(&self.engine, move |engine| -> std::result::Result<(Message, Vec<Id>), String> {
            let chat = engine
                .chats()
                .find(chat_id)
                .filter(|chat| chat.has_member(me))
                .ok_or_else(|| "Chat not found".to_string())?;
            let mut message = Message::new(chat_id, me, text).map_err(|e| e.to_string())?;
            if !engine.messages().save(&mut message) {
                return Err("Message was not saved".to_string());
            }
            Ok((message, chat.members().iter().copied().collect()))
        })
        .await?;

        let (message, members) = match delivered {
            Ok(delivered) => delivered,
            Err(reason) => return Ok(ServerResponse::error(reason)),
        };

        let clients = self.clients.lock().await;
        for member in members.iter().filter(|member| **member != me) {
            if let Some(member_tx) = clients.get(member) {
                if member_tx.send(ServerResponse::Message(message.clone())).await.is_err() {
                    debug!("Member {} went away before delivery", member);
                }
            }
        }
        Ok(ServerResponse::success(format!("Message sent to chat {}", chat_id), message.id))
    }

    /// Runs `f` only if `me` belongs to `chat_id`.
    async fn with_membership<F>(&self, me: Id, chat_id: Id, f: F) -> Result<ServerResponse>
    where
        F: FnOnce(&Engine) -> ServerResponse + Send + 'static,
    {
        blocking(&self.engine, move |engine| {
            let member = engine.chats().find(chat_id).is_some_and(|chat| chat.has_member(me));
            if member {
                f(engine)
            } else {
                ServerResponse::error("Chat not found")
            }
        })
        .await
    }

    async fn attach(&mut self, id: Id, tx: &mpsc::Sender<ServerResponse>) {
        let mut clients = self.clients.lock().await;
        if let Some(previous) = self.user_id.replace(id) {
            clients.remove(&previous);
        }
        clients.insert(id, tx.clone());
    }
}

/// Runs a storage call on the blocking pool; the engine itself never awaits.
async fn blocking<T, F>(engine: &Arc<Engine>, f: F) -> Result<T>
where
    F: FnOnce(&Engine) -> T + Send + 'static,
    T: Send + 'static,
{
    let engine = Arc::clone(engine);
    Ok(tokio::task::spawn_blocking(move || f(&engine)).await?)
}
