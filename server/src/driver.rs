//! Fixed-period world tick driver
//!
//! Owns the world outright and advances it at a fixed cadence. Every tick
//! runs the same phases in the same order: drain the reactor's inbound
//! events, run the scheduler pass, advance the tick counter, run the update
//! pipeline, then flush. Late ticks are delayed rather than skipped, so no
//! tick's work is ever dropped under load.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;

use protocol::frames::{outbound, LoginResponse, SUPPORTED_REVISION};

use crate::content::{self, FrameAction};
use crate::pipeline::UpdatePipeline;
use crate::reactor::{InboundEvent, ReactorCommand};
use crate::scheduler::{TaskFailure, TaskScheduler, TaskSpec};
use crate::session::{login_success_block, LoginRequest, SessionId};
use crate::world::{EntityId, World};

const WELCOME_MESSAGE: &str = "Welcome to the realm.";

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub tick: Duration,
    pub max_players: usize,
    pub workers: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(600),
            max_players: 2000,
            workers: 4,
        }
    }
}

pub struct WorldTickDriver {
    world: World,
    scheduler: TaskScheduler<World>,
    pipeline: UpdatePipeline,
    inbound: UnboundedReceiver<InboundEvent>,
    commands: UnboundedSender<ReactorCommand>,
    session_entities: HashMap<SessionId, EntityId>,
    tick: Duration,
}

impl WorldTickDriver {
    pub fn new(
        config: DriverConfig,
        inbound: UnboundedReceiver<InboundEvent>,
        commands: UnboundedSender<ReactorCommand>,
    ) -> Self {
        let mut world = World::new(config.max_players);
        let mut scheduler = TaskScheduler::new();

        // Movement pulse: one walk-queue step per entity per tick, always
        // before the pipeline reads positions.
        scheduler.submit(
            &mut world,
            TaskSpec::repeating(1, 1, |world: &mut World| {
                world.step_walk_queues();
                Ok::<(), TaskFailure>(())
            }),
        );
        // Fires once, on the tick the world first becomes populated
        scheduler.submit(
            &mut world,
            TaskSpec::event_listener(
                |world: &mut World| !world.is_empty(),
                |world: &mut World| {
                    info!("world populated on tick {}", world.tick);
                    Ok(())
                },
            ),
        );

        Self {
            world,
            scheduler,
            pipeline: UpdatePipeline::new(config.workers),
            inbound,
            commands,
            session_entities: HashMap::new(),
            tick: config.tick,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Drives ticks at the configured period until the reactor hangs up
    pub async fn run(mut self) {
        let mut cadence = tokio::time::interval(self.tick);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            cadence.tick().await;
            if !self.run_tick() {
                info!("inbound channel closed, driver stopping");
                return;
            }
        }
    }

    /// One complete world tick. Returns false once the reactor is gone.
    pub fn run_tick(&mut self) -> bool {
        let mut connected = true;

        // Phase 1: apply everything the reactor decoded since last tick
        loop {
            match self.inbound.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    connected = false;
                    break;
                }
            }
        }

        // Phase 2: scheduled tasks, then the tick counter they observe
        self.scheduler.tick(&mut self.world);
        self.world.tick += 1;

        // Phase 3: concurrent delta build, fan the results back out
        for delta in self.pipeline.run(&self.world) {
            self.send_frame(delta.session, outbound::PLAYER_UPDATE, delta.bytes);
        }
        self.world.clear_transient();

        // Phase 4: tick boundary
        let _ = self.commands.send(ReactorCommand::Flush);
        connected
    }

    fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Frame(frame) => {
                let entity = match self.session_entities.get(&frame.session) {
                    Some(&entity) => entity,
                    None => {
                        debug!("frame from unbound session {}", frame.session);
                        return;
                    }
                };
                let action =
                    content::dispatch(&mut self.world, &mut self.scheduler, entity, &frame);
                if action == FrameAction::Logout {
                    self.logout(frame.session, entity);
                }
            }
            InboundEvent::Login { session, request } => self.handle_login(session, request),
            InboundEvent::SessionClosed { session } => {
                if let Some(entity) = self.session_entities.remove(&session) {
                    self.world.unbind(entity);
                    self.scheduler.cancel_by_key(entity.bind_key());
                }
            }
        }
    }

    /// World-level login validation; the protocol-level checks already
    /// passed in the session.
    fn handle_login(&mut self, session: SessionId, request: LoginRequest) {
        if request.revision != SUPPORTED_REVISION {
            warn!(
                "session {}: revision {} not supported",
                session, request.revision
            );
            self.reject(session, LoginResponse::RevisionMismatch);
            return;
        }
        if request.username.is_empty() || request.password.is_empty() {
            self.reject(session, LoginResponse::InvalidCredentials);
            return;
        }
        if self.world.is_name_online(&request.username) {
            self.reject(session, LoginResponse::AccountOnline);
            return;
        }

        let entity = match self.world.bind(session, request.username.clone()) {
            Some(entity) => entity,
            None => {
                self.reject(session, LoginResponse::WorldFull);
                return;
            }
        };
        self.session_entities.insert(session, entity);

        let response = login_success_block(0, entity.index as u16);
        let _ = self.commands.send(ReactorCommand::CompleteLogin {
            session,
            entity,
            response,
        });

        let mut welcome = WELCOME_MESSAGE.as_bytes().to_vec();
        welcome.push(0);
        self.send_frame(session, outbound::SERVER_MESSAGE, welcome);
        info!("{} logged in as entity {:?}", request.username, entity);
    }

    fn logout(&mut self, session: SessionId, entity: EntityId) {
        self.send_frame(session, outbound::LOGOUT, Vec::new());
        let _ = self.commands.send(ReactorCommand::Disconnect { session });
        self.session_entities.remove(&session);
        self.world.unbind(entity);
        self.scheduler.cancel_by_key(entity.bind_key());
    }

    fn reject(&mut self, session: SessionId, code: LoginResponse) {
        let _ = self
            .commands
            .send(ReactorCommand::RejectLogin { session, code });
    }

    fn send_frame(&mut self, session: SessionId, opcode: u8, payload: Vec<u8>) {
        let _ = self.commands.send(ReactorCommand::Send {
            session,
            opcode,
            payload,
        });
    }
}
