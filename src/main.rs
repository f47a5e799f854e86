use anyhow::Result;
use devctl::command::CommandExecutionError;
use devctl::marshal::ConsumerLoop;
use devctl::{EngineHandle, Event, HandleConfig, SimConfig, SimEntity, SimulatedEngine};
use devctl_shared::{
    AcmpCommand, AemCommand, EntityId, StatisticsCounterFlag, StreamIdentification, StreamInputCounterFlag,
    StreamInputCounters,
};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TALKER: EntityId = EntityId::new(0x001B_92FF_FE00_0001);
const LISTENER: EntityId = EntityId::new(0x001B_92FF_FE00_0002);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = HandleConfig {
        discovery_delay: Duration::from_secs(10),
        ..Default::default()
    };
    let (handle, mut events) = EngineHandle::new(config);

    let engine = SimulatedEngine::new(SimConfig::default());
    handle.set_engine(engine.clone());
    info!("Simulated engine installed");

    let mut counters = StreamInputCounters::new();
    counters.insert(StreamInputCounterFlag::StreamInterrupted, 0);
    counters.insert(StreamInputCounterFlag::MediaUnlocked, 0);
    engine.add_entity(SimEntity::new(TALKER).with_statistics(StatisticsCounterFlag::AecpRetries, 2));
    engine.add_entity(SimEntity::new(LISTENER).with_stream_input(0, false, counters));

    wait_for_entities(&mut events, 2).await?;

    // Configure the listener under exclusive access
    handle.create_command_queue(LISTENER, true, |queue| {
        queue.add_aem_command(AemCommand::SetEntityName { name: "Stage Box".into() });
        queue.add_aem_command(AemCommand::SetConfiguration { configuration: 0 });
        queue.add_aem_command(AemCommand::StartStreamInput { stream: 0 });
    });

    // Acquire both entities, then connect the stream
    let mut chain = handle.create_command_chain();
    chain
        .new_set()
        .append_aem(TALKER, AemCommand::AcquireEntity { persistent: false })
        .append_aem(LISTENER, AemCommand::AcquireEntity { persistent: false });
    chain.new_set().append_acmp(
        StreamIdentification { entity: TALKER, stream: 0 },
        StreamIdentification { entity: LISTENER, stream: 0 },
        AcmpCommand::ConnectStream,
    );
    chain.exec();

    let mut pending_queues = 1;
    let mut pending_chains = 1;
    while pending_queues + pending_chains > 0 {
        match next_event(&mut events).await? {
            Event::QueueCompleted { .. } => pending_queues -= 1,
            Event::ChainCompleted { .. } => pending_chains -= 1,
            _ => {}
        }
    }

    // Stream errors now count since the stream is connected
    let mut update = StreamInputCounters::new();
    update.insert(StreamInputCounterFlag::StreamInterrupted, 3);
    update.insert(StreamInputCounterFlag::MediaUnlocked, 1);
    engine.update_stream_input_counters(LISTENER, 0, update)?;
    engine.update_statistics_counter(TALKER, StatisticsCounterFlag::AecpTimeouts, 1)?;
    engine.update_stream_input_latency_error(LISTENER, 0, true)?;

    // Give the engine time to deliver, then drain
    tokio::time::sleep(Duration::from_millis(50)).await;
    for event in events.drain() {
        log_event(&event);
    }

    handle.foreach_entity(|id, _entity| {
        for (key, delta) in handle.all_counter_deltas(id) {
            info!("{} {} = {}", id, key, delta);
        }
    });
    if handle.stream_input_latency_error(LISTENER, 0) {
        warn!("Listener stream 0 still reports a latency error");
    }

    handle.clear_all_counters(LISTENER);
    for event in events.drain() {
        log_event(&event);
    }

    handle.release_engine();
    for event in events.drain() {
        log_event(&event);
    }

    info!("Done");
    Ok(())
}

async fn next_event(events: &mut ConsumerLoop) -> Result<Event> {
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("Event channel closed"))?;
    log_event(&event);
    Ok(event)
}

async fn wait_for_entities(events: &mut ConsumerLoop, count: usize) -> Result<()> {
    let mut online = 0;
    while online < count {
        if let Event::EntityOnline(_) = next_event(events).await? {
            online += 1;
        }
    }
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::EngineOnline => info!("Engine online"),
        Event::EngineOffline => info!("Engine offline"),
        Event::EntityOnline(id) => info!("Entity online: {}", id),
        Event::EntityOffline(id) => info!("Entity offline: {}", id),
        Event::CounterDeltaChanged { entity, scope, deltas } => {
            info!("Counters {} {:?}: {:?}", entity, scope, deltas);
        }
        Event::StreamInputLatencyErrorChanged { entity, stream, error } => {
            if *error {
                warn!("Stream input {} of {} is over latency", stream, entity);
            } else {
                info!("Stream input {} of {} is back within latency", stream, entity);
            }
        }
        Event::QueueProgress {
            queue,
            entity,
            current,
            total,
        } => debug!("{} on {}: {}/{}", queue, entity, current, total),
        Event::QueueCompleted { queue, entity, result } => match result {
            Ok(()) => info!("{} on {} completed", queue, entity),
            Err(e) => warn!("{} on {} failed: {}", queue, entity, e),
        },
        Event::ChainSetCompleted { chain, set, error } => {
            debug!("{} set {} completed (error={})", chain, set, error);
        }
        Event::ChainProgress { chain, completed, total } => debug!("{}: {}/{}", chain, completed, total),
        Event::ChainCompleted { chain, error, errors } => {
            if *error {
                for info in errors {
                    let timeout = info.error == CommandExecutionError::Timeout;
                    error!(
                        "{}: {:?} failed on {} (timeout={})",
                        chain, info.command, info.entity, timeout
                    );
                }
            } else {
                info!("{} completed", chain);
            }
        }
    }
}
