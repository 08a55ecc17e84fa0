use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{channel, Sender};
use tokio::time::MissedTickBehavior;

use system::{
    CanvasId, ClientCommand, ConnectionId, DrawingData, Permission, RoomUser, ServerEvent,
    SessionError, TimestampMs,
};

use super::connection::{ConnectionCommand, ConnectionEvent};
use crate::connection_tx_storage::ConnectionTxStorage;
use crate::server_state::{ServerState, REAP_INTERVAL};
use crate::store::{CanvasStore, DrawingEvent};

pub type ServerTx = Sender<ConnectionCommand>;

fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// The Session Coordinator. Owns all session state; runs on a single
/// spawned task fed by the `ConnectionCommand` channel, so every operation
/// is atomic relative to every other, including its store I/O.
struct Server {
    server_state: ServerState,
    connections: ConnectionTxStorage,
    store: Arc<dyn CanvasStore>,
}

impl Server {
    fn new(store: Arc<dyn CanvasStore>) -> Self {
        Self {
            server_state: ServerState::new(),
            connections: ConnectionTxStorage::new(),
            store,
        }
    }

    async fn handle_connection_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect { tx, user } => {
                let connection_id = self.server_state.create_connection(user);
                self.connections.insert(connection_id, tx);
                self.connections
                    .send(connection_id, ConnectionEvent::Connected { connection_id })
                    .await;
                log::info!("Connection {} established", connection_id);
            }
            ConnectionCommand::Disconnect { from } => {
                self.leave_room(from).await;
                if let Some(connection) = self.server_state.remove_connection(from) {
                    log::info!(
                        "Connection {} disconnected after {:?}",
                        from,
                        connection.connected_at.elapsed()
                    );
                }
                self.connections.remove(from);
            }
            ConnectionCommand::ClientCommand { from, command } => {
                // errors go to the originating connection only and are
                // never fatal to it or the coordinator
                if let Err(error) = self.handle_client_command(from, command).await {
                    self.connections
                        .send(
                            from,
                            ConnectionEvent::Event(ServerEvent::Error {
                                message: error.to_string(),
                            }),
                        )
                        .await;
                }
            }
        }
    }

    async fn handle_client_command(
        &mut self,
        from: ConnectionId,
        command: ClientCommand,
    ) -> Result<(), SessionError> {
        match command {
            ClientCommand::JoinCanvas { canvas_id } => self.join_canvas(from, canvas_id).await,
            ClientCommand::LeaveCanvas => {
                self.leave_room(from).await;
                Ok(())
            }
            ClientCommand::Drawing { canvas_id, drawing } => {
                self.handle_drawing(from, &canvas_id, drawing).await
            }
            ClientCommand::CursorMove { canvas_id, x, y } => {
                self.handle_cursor_move(from, &canvas_id, x, y).await
            }
            ClientCommand::SaveCanvas {
                canvas_id,
                canvas_data,
                thumbnail,
            } => {
                self.handle_save_canvas(from, &canvas_id, canvas_data, thumbnail)
                    .await
            }
        }
    }

    async fn join_canvas(
        &mut self,
        from: ConnectionId,
        canvas_id: CanvasId,
    ) -> Result<(), SessionError> {
        if canvas_id.is_empty() {
            return Err(SessionError::NotFound);
        }
        let user = match self.server_state.connection(from) {
            Some(connection) => connection.user.clone(),
            None => {
                log::warn!("join-canvas from unknown connection {}", from);
                return Ok(());
            }
        };
        let canvas = self
            .store
            .find_by_id(&canvas_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        let permission = match canvas.effective_permission(&user.id) {
            Permission::None if canvas.is_public => Permission::View,
            Permission::None => {
                return Err(SessionError::Forbidden("no access to this canvas".into()))
            }
            permission => permission,
        };

        // at most one room membership per connection
        let previous_room = self
            .server_state
            .connection(from)
            .and_then(|c| c.current_room.clone());
        if previous_room.map_or(false, |room| room != canvas_id) {
            self.leave_room(from).await;
        }

        if let Some(displaced) =
            self.server_state
                .join_room(from, user.clone(), &canvas_id, permission)
        {
            log::info!(
                "Connection {} displaced stale occupancy {} in room {}",
                from,
                displaced,
                canvas_id
            );
        }
        log::info!("Connection {} joined room {}", from, canvas_id);

        // joiner gets the full roster, itself included; everyone else
        // hears about the new occupant
        let users = self.server_state.room_users(&canvas_id);
        self.connections
            .send(
                from,
                ConnectionEvent::Event(ServerEvent::CanvasJoined {
                    canvas_id: canvas_id.clone(),
                    users,
                }),
            )
            .await;
        self.broadcast(
            &canvas_id,
            ServerEvent::UserJoined {
                user: RoomUser { user, permission },
            },
            Some(from),
        )
        .await;
        Ok(())
    }

    async fn handle_drawing(
        &mut self,
        from: ConnectionId,
        canvas_id: &CanvasId,
        drawing: DrawingData,
    ) -> Result<(), SessionError> {
        let occupancy = self
            .server_state
            .occupancy_for(from, canvas_id)
            .ok_or_else(|| SessionError::Forbidden("not joined to this canvas".into()))?;
        if !occupancy.permission.can_edit() {
            return Err(SessionError::Forbidden("no edit permission".into()));
        }
        let user = occupancy.user.clone();
        let timestamp = now_ms();

        self.broadcast(
            canvas_id,
            ServerEvent::Drawing {
                user_id: user.id.clone(),
                username: user.username,
                drawing: drawing.clone(),
                timestamp,
            },
            Some(from),
        )
        .await;

        if drawing.save {
            // the broadcast above already went out; persistence is
            // independent and its failure is reported to the sender only
            self.store
                .persist_drawing_event(
                    canvas_id,
                    DrawingEvent {
                        user_id: user.id,
                        tool: drawing.tool,
                        payload: drawing.payload,
                        timestamp,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_cursor_move(
        &mut self,
        from: ConnectionId,
        canvas_id: &CanvasId,
        x: f32,
        y: f32,
    ) -> Result<(), SessionError> {
        let occupancy = match self.server_state.occupancy_for(from, canvas_id) {
            Some(occupancy) => occupancy,
            // stale clients keep streaming cursor positions after leaving;
            // never answer them with error traffic
            None => return Ok(()),
        };
        let user_id = occupancy.user.id.clone();
        let username = occupancy.user.username.clone();
        self.broadcast(
            canvas_id,
            ServerEvent::CursorMove {
                user_id,
                username,
                x,
                y,
                timestamp: now_ms(),
            },
            Some(from),
        )
        .await;
        Ok(())
    }

    async fn handle_save_canvas(
        &mut self,
        from: ConnectionId,
        canvas_id: &CanvasId,
        canvas_data: String,
        thumbnail: Option<String>,
    ) -> Result<(), SessionError> {
        let occupancy = self
            .server_state
            .occupancy_for(from, canvas_id)
            .ok_or_else(|| SessionError::Forbidden("not joined to this canvas".into()))?;
        if !occupancy.permission.can_edit() {
            return Err(SessionError::Forbidden("no edit permission".into()));
        }
        let saved_by = occupancy.user.clone();

        let timestamp = self
            .store
            .persist_snapshot(canvas_id, canvas_data, thumbnail)
            .await?;

        // the saver hears this too, as confirmation the save took effect
        self.broadcast(
            canvas_id,
            ServerEvent::CanvasSaved {
                saved_by,
                timestamp,
            },
            None,
        )
        .await;
        Ok(())
    }

    async fn leave_room(&mut self, connection_id: ConnectionId) {
        if let Some((canvas_id, user)) = self.server_state.leave_room(connection_id) {
            log::info!("Connection {} left room {}", connection_id, canvas_id);
            self.broadcast(&canvas_id, ServerEvent::UserLeft { user }, Some(connection_id))
                .await;
        }
    }

    /// Fan-out over the room's occupancy set as it stands right now.
    /// At-most-once per recipient; no acknowledgment, retry, or ordering
    /// guarantee across rooms.
    async fn broadcast(
        &mut self,
        canvas_id: &CanvasId,
        event: ServerEvent,
        without: Option<ConnectionId>,
    ) {
        for connection_id in self.server_state.room_connection_ids(canvas_id) {
            if without == Some(connection_id) {
                continue;
            }
            self.connections
                .send(connection_id, ConnectionEvent::Event(event.clone()))
                .await;
        }
    }
}

pub fn spawn_server(store: Arc<dyn CanvasStore>) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ConnectionCommand>(64);

    tokio::spawn(async move {
        let mut server = Box::new(Server::new(store));
        let mut reap_timer = tokio::time::interval(REAP_INTERVAL);
        reap_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = srv_rx.recv() => match command {
                    Some(command) => server.handle_connection_command(command).await,
                    None => break,
                },
                _ = reap_timer.tick() => {
                    server.server_state.sweep_idle_rooms(Instant::now());
                }
            }
        }
    });

    srv_tx
}
