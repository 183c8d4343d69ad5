//! Particle simulation over chunked storage.
//!
//! Spawns particles, moves them with a system, ages them, and lets expired
//! particles lose their velocity (migrating to a resting archetype) or
//! despawn. Set `RUST_LOG=chunk_ecs=debug` to watch archetypes and blocks
//! come and go.
//!
//! Run with: `cargo run -p chunk-ecs --example particles`

use std::cell::RefCell;

use bytemuck_derive::{Pod, Zeroable};
use chunk_ecs::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Velocity {
    dx: f32,
    dy: f32,
}

/// Remaining lifetime in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Lifetime(u32);

impl Default for Lifetime {
    fn default() -> Self {
        Lifetime(60)
    }
}

const PARTICLES: usize = 5_000;
const TICKS: u32 = 90;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = StoreConfig::from_json_str(r#"{ "block_size": 8192, "initial_blocks": 8 }"#)?;
    let mut world = World::with_config(config)?;
    let pos = world.register::<Position>("position")?;
    let vel = world.register::<Velocity>("velocity")?;
    let life = world.register::<Lifetime>("lifetime")?;
    let resting = world.register_type("resting", 0, 1, ComponentHooks::NONE)?;

    for i in 0..PARTICLES {
        let e = world.allocate_entity(&[pos, vel, life])?;
        let angle = i as f32 * 0.01;
        world.set(e, Velocity { dx: angle.cos(), dy: angle.sin() })?;
        world.set(e, Lifetime(30 + (i % 60) as u32))?;
    }

    // Entities whose lifetime ran out this tick.
    let expired: RefCell<Vec<EntityId>> = RefCell::new(Vec::new());

    let mut movement = world.make_system("movement", &[pos, vel], |chunk: &mut ChunkView<'_>| {
        let mut columns = chunk.columns_mut().into_iter();
        let (Some(p), Some(v)) = (columns.next(), columns.next()) else {
            return Ok(());
        };
        let positions = p.cast::<Position>()?;
        let velocities = v.cast::<Velocity>()?;
        for (p, v) in positions.iter_mut().zip(velocities.iter()) {
            p.x += v.dx;
            p.y += v.dy;
        }
        Ok(())
    })?;

    let mut aging = world.make_system("aging", &[life], |chunk: &mut ChunkView<'_>| {
        let entities = chunk.entities().to_vec();
        let lifetimes = chunk.column_mut::<Lifetime>(0)?;
        let mut expired = expired.borrow_mut();
        for (e, l) in entities.into_iter().zip(lifetimes.iter_mut()) {
            l.0 = l.0.saturating_sub(1);
            if l.0 == 0 {
                expired.push(e);
            }
        }
        Ok(())
    })?;

    for tick in 0..TICKS {
        world.execute_system(&mut movement)?;
        world.execute_system(&mut aging)?;

        for e in expired.borrow_mut().drain(..) {
            // Even indices come to rest, odd ones vanish.
            if e.index() % 2 == 0 {
                world.detach(e, vel)?;
                world.detach(e, life)?;
                world.attach(e, resting)?;
            } else {
                world.deallocate_entity(e)?;
            }
        }

        if tick % 30 == 0 {
            let stats = world.pool_stats();
            println!(
                "tick {tick:>3}: {} entities, {} archetypes, {} blocks in use ({} pooled)",
                world.entity_count(),
                world.archetype_count(),
                stats.in_use,
                stats.pooled,
            );
        }
    }

    world.check_invariants()?;
    let stats = world.pool_stats();
    println!(
        "done: {} entities, {} archetypes, {} blocks allocated, {} released by flush",
        world.entity_count(),
        world.archetype_count(),
        stats.allocated,
        world.flush_pool(),
    );
    Ok(())
}
