//! Inbound frame handlers: the game logic applied during the tick's frame
//! phase
//!
//! Dispatch runs single-threaded on the driver with exclusive world access.
//! A malformed payload is a client problem, not a server problem: the frame
//! is logged and discarded, the session stays up.

use log::{debug, info, warn};

use protocol::codec::{CodecError, Reader};
use protocol::frames::inbound;

use crate::scheduler::{TaskScheduler, TaskSpec};
use crate::session::PendingFrame;
use crate::world::{EntityId, World, SPAWN_X, SPAWN_Y};

/// Interface button that requests a clean logout
const LOGOUT_BUTTON: u16 = 2458;

/// What the driver must do after a frame has been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    None,
    Logout,
}

/// Applies one decoded frame to the world. Unhandled-but-tabled opcodes are
/// accepted silently; the framing layer already consumed their payloads.
pub fn dispatch(
    world: &mut World,
    scheduler: &mut TaskScheduler<World>,
    entity: EntityId,
    frame: &PendingFrame,
) -> FrameAction {
    let result = match frame.opcode {
        inbound::IDLE => Ok(FrameAction::None),
        inbound::IDLE_LOGOUT => Ok(FrameAction::Logout),
        inbound::WALK | inbound::MINIMAP_WALK => handle_walk(world, entity, &frame.payload),
        inbound::PUBLIC_CHAT => handle_chat(world, entity, &frame.payload),
        inbound::COMMAND => handle_command(world, scheduler, entity, &frame.payload),
        inbound::BUTTON_CLICK => handle_button(entity, &frame.payload),
        _ => {
            debug!("unhandled opcode {} from entity {:?}", frame.opcode, entity);
            Ok(FrameAction::None)
        }
    };

    match result {
        Ok(action) => action,
        Err(e) => {
            warn!(
                "discarding malformed opcode {} from entity {:?}: {}",
                frame.opcode, entity, e
            );
            FrameAction::None
        }
    }
}

/// Destination tile, x with the +128 offset transform and y byte-swapped.
/// Any trailing path waypoints and anti-cheat bytes are ignored; the server
/// walks its own straight line.
fn handle_walk(world: &mut World, entity: EntityId, payload: &[u8]) -> Result<FrameAction, CodecError> {
    let mut reader = Reader::new(payload);
    let dest_x = reader.read_u16_add()?;
    let dest_y = reader.read_u16_le()?;

    if let Some(entity) = world.get_mut(entity) {
        entity.walk_to(dest_x, dest_y);
    }
    Ok(FrameAction::None)
}

fn handle_chat(world: &mut World, entity: EntityId, payload: &[u8]) -> Result<FrameAction, CodecError> {
    let mut reader = Reader::new(payload);
    let _effects = reader.read_u8()?;
    let _color = reader.read_u8()?;
    let text = reader.read_cstring()?;

    if let Some(entity) = world.get_mut(entity) {
        entity.chat = Some(text);
    }
    Ok(FrameAction::None)
}

fn handle_command(
    world: &mut World,
    scheduler: &mut TaskScheduler<World>,
    entity: EntityId,
    payload: &[u8],
) -> Result<FrameAction, CodecError> {
    let mut reader = Reader::new(payload);
    let command = reader.read_cstring()?;

    match command.as_str() {
        "home" => {
            info!("entity {:?} walking home", entity);
            // One tile per tick toward spawn until arrival; cancelled early
            // by logout through the bind key.
            let spec = TaskSpec::until(
                move |world: &mut World| match world.get(entity) {
                    Some(e) => (e.x, e.y) == (SPAWN_X, SPAWN_Y),
                    None => true,
                },
                move |world: &mut World| {
                    if let Some(e) = world.get_mut(entity) {
                        let (x, y) = (e.x, e.y);
                        e.walk_to(
                            step_axis(x, SPAWN_X),
                            step_axis(y, SPAWN_Y),
                        );
                    }
                    Ok(())
                },
            )
            .bound_to(entity.bind_key());
            scheduler.submit(world, spec);
        }
        "pos" => {
            if let Some(e) = world.get(entity) {
                info!("entity {:?} at ({}, {})", entity, e.x, e.y);
            }
        }
        other => debug!("unknown command '{}' from entity {:?}", other, entity),
    }
    Ok(FrameAction::None)
}

fn step_axis(from: u16, to: u16) -> u16 {
    match from.cmp(&to) {
        std::cmp::Ordering::Less => from + 1,
        std::cmp::Ordering::Greater => from - 1,
        std::cmp::Ordering::Equal => from,
    }
}

fn handle_button(entity: EntityId, payload: &[u8]) -> Result<FrameAction, CodecError> {
    let mut reader = Reader::new(payload);
    let button = reader.read_u16()?;

    match button {
        LOGOUT_BUTTON => Ok(FrameAction::Logout),
        other => {
            debug!("button {} from entity {:?}", other, entity);
            Ok(FrameAction::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::codec::Writer;

    fn setup() -> (World, TaskScheduler<World>, EntityId) {
        let mut world = World::new(10);
        let id = world.bind(1, "alice".to_string()).unwrap();
        (world, TaskScheduler::new(), id)
    }

    fn frame(opcode: u8, payload: Vec<u8>) -> PendingFrame {
        PendingFrame {
            session: 1,
            opcode,
            payload,
        }
    }

    #[test]
    fn test_walk_frame_queues_path() {
        let (mut world, mut scheduler, id) = setup();

        let mut w = Writer::new();
        w.put_u16_add(SPAWN_X + 3);
        w.put_u16_le(SPAWN_Y);
        let action = dispatch(&mut world, &mut scheduler, id, &frame(inbound::WALK, w.into_bytes()));

        assert_eq!(action, FrameAction::None);
        assert_eq!(world.get(id).unwrap().walk_queue.len(), 3);
    }

    #[test]
    fn test_chat_frame_sets_broadcast() {
        let (mut world, mut scheduler, id) = setup();

        let mut w = Writer::new();
        w.put_u8(0);
        w.put_u8(0);
        w.put_cstring("hello world");
        dispatch(
            &mut world,
            &mut scheduler,
            id,
            &frame(inbound::PUBLIC_CHAT, w.into_bytes()),
        );

        assert_eq!(world.get(id).unwrap().chat.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_logout_button() {
        let (mut world, mut scheduler, id) = setup();

        let mut w = Writer::new();
        w.put_u16(LOGOUT_BUTTON);
        let action = dispatch(
            &mut world,
            &mut scheduler,
            id,
            &frame(inbound::BUTTON_CLICK, w.into_bytes()),
        );
        assert_eq!(action, FrameAction::Logout);

        let mut w = Writer::new();
        w.put_u16(100);
        let action = dispatch(
            &mut world,
            &mut scheduler,
            id,
            &frame(inbound::BUTTON_CLICK, w.into_bytes()),
        );
        assert_eq!(action, FrameAction::None);
    }

    #[test]
    fn test_idle_logout() {
        let (mut world, mut scheduler, id) = setup();
        let action = dispatch(&mut world, &mut scheduler, id, &frame(inbound::IDLE_LOGOUT, vec![]));
        assert_eq!(action, FrameAction::Logout);
    }

    #[test]
    fn test_malformed_payload_discarded() {
        let (mut world, mut scheduler, id) = setup();

        // WALK needs four bytes of destination; give it one
        let action = dispatch(&mut world, &mut scheduler, id, &frame(inbound::WALK, vec![9]));
        assert_eq!(action, FrameAction::None);
        assert!(world.get(id).unwrap().walk_queue.is_empty());
    }

    #[test]
    fn test_home_command_walks_to_spawn() {
        let (mut world, mut scheduler, id) = setup();
        {
            let entity = world.get_mut(id).unwrap();
            entity.x = SPAWN_X + 2;
            entity.y = SPAWN_Y;
        }

        let mut w = Writer::new();
        w.put_cstring("home");
        dispatch(&mut world, &mut scheduler, id, &frame(inbound::COMMAND, w.into_bytes()));
        assert_eq!(scheduler.len(), 1);

        // Each pass queues one step, the movement pulse consumes it
        for _ in 0..4 {
            scheduler.tick(&mut world);
            world.step_walk_queues();
        }

        let entity = world.get(id).unwrap();
        assert_eq!((entity.x, entity.y), (SPAWN_X, SPAWN_Y));
        // Arrival condition observed, task gone
        scheduler.tick(&mut world);
        assert!(scheduler.is_empty());
    }
}
