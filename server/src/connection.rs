use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};
use serde::Deserialize;

use system::{ClientCommand, ConnectionId, ServerEvent, UserInfo};

use crate::auth::IdentityVerifier;
use crate::connection_tx_storage::ConnectionTx;
use crate::server::ServerTx;

#[derive(Debug)]
pub enum ConnectionCommand {
    Connect {
        tx: ConnectionTx,
        user: UserInfo,
    },
    Disconnect {
        from: ConnectionId,
    },
    ClientCommand {
        from: ConnectionId,
        command: ClientCommand,
    },
}

#[derive(Debug)]
pub enum ConnectionEvent {
    /// Actor-internal; tells the actor its coordinator-assigned id. Never
    /// serialized to the client.
    Connected { connection_id: ConnectionId },
    Event(ServerEvent),
}

#[derive(Message)]
#[rtype(result = "()")]
struct ConnectionActorMessage(ConnectionEvent);

enum ConnectionState {
    Idle,
    Connected(ConnectionId),
}

struct ConnectionActor {
    state: ConnectionState,
    srv_tx: ServerTx,
    user: UserInfo,
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<ConnectionEvent>(32);

        self.srv_tx
            .try_send(ConnectionCommand::Connect {
                tx,
                user: self.user.clone(),
            })
            .expect("server must not be closed yet");

        let addr = ctx.address().recipient();

        tokio::spawn(async move {
            let addr = addr;
            log::debug!("connection green thread - started");
            while let Some(msg) = rx.recv().await {
                if addr.try_send(ConnectionActorMessage(msg)).is_err() {
                    break;
                }
            }
            log::debug!("connection green thread - terminated");
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        if let ConnectionState::Connected(id) = self.state {
            let _ = self.srv_tx.try_send(ConnectionCommand::Disconnect { from: id });
        }

        Running::Stop
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Text(text)) => {
                if let ConnectionState::Connected(from) = self.state {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(command) => {
                            log::debug!("Ingress {:?}", command);
                            if self
                                .srv_tx
                                .try_send(ConnectionCommand::ClientCommand { from, command })
                                .is_err()
                            {
                                log::warn!("Coordinator channel is full, dropping frame");
                            }
                        }
                        Err(_) => {
                            ctx.close(Some(CloseReason {
                                code: CloseCode::Invalid,
                                description: None,
                            }));
                            ctx.stop();
                        }
                    }
                }
            }
            Ok(ws::Message::Close(_)) => {
                if let ConnectionState::Connected(id) = self.state {
                    let _ = self.srv_tx.try_send(ConnectionCommand::Disconnect { from: id });
                    self.state = ConnectionState::Idle;
                }
                ctx.stop();
            }
            _ => (),
        }
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(
        &mut self,
        msg: ConnectionActorMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Self::Result {
        let connection_event = msg.0;
        log::debug!("Egress {:?}", connection_event);
        match connection_event {
            ConnectionEvent::Connected { connection_id } => {
                self.state = ConnectionState::Connected(connection_id);
            }
            ConnectionEvent::Event(event) => match serde_json::to_string(&event) {
                Ok(serialized) => ctx.text(serialized),
                Err(error) => log::error!("Failed to serialize egress event: {}", error),
            },
        }
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsQuery>,
    srv_tx: web::Data<ServerTx>,
    verifier: web::Data<dyn IdentityVerifier>,
) -> Result<HttpResponse, Error> {
    let identity = match verifier.verify(&query.token).await {
        Ok(identity) if identity.is_active => identity,
        Ok(identity) => {
            log::info!("Refusing handshake for inactive user {}", identity.user.id);
            return Ok(HttpResponse::Unauthorized().finish());
        }
        Err(error) => {
            log::info!("Refusing handshake: {}", error);
            return Ok(HttpResponse::Unauthorized().finish());
        }
    };
    ws::start(
        ConnectionActor {
            srv_tx: srv_tx.get_ref().clone(),
            state: ConnectionState::Idle,
            user: identity.user,
        },
        &req,
        stream,
    )
}
