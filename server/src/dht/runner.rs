//! The Kademlia runner.
//!
//! One task per process owns the libp2p swarm. Subsystems talk to it
//! through a command channel; replies travel back over oneshot
//! channels. Values are stored as JSON string sets so multiple writers
//! can append under one key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use libp2p::kad::store::{MemoryStore, RecordStore};
use libp2p::kad::{self, GetRecordOk, QueryId, QueryResult, Quorum, Record, RecordKey};
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{identify, noise, tcp, yamux, Multiaddr};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::hash_key;

/// Lifetime of a transient record.
const RECORD_TTL: Duration = Duration::from_secs(600);

const PROTOCOL_VERSION: &str = "/narpool/1.0.0";

/// A request to the runner.
#[derive(Debug)]
pub enum Command {
    Put {
        key: String,
        value: String,
        permanent: bool,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
}

#[derive(NetworkBehaviour)]
pub(super) struct Behaviour {
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
}

struct GetState {
    reply: oneshot::Sender<Option<Vec<String>>>,
    values: Vec<String>,
}

/// Builds the swarm and dials the bootstrap node, if any.
pub(super) fn build(port: u16, bootstrap: Option<(String, u16)>) -> Result<Swarm<Behaviour>> {
    let mut swarm = libp2p::SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_dns()?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            Behaviour {
                kad: kad::Behaviour::new(peer_id, MemoryStore::new(peer_id)),
                identify: identify::Behaviour::new(identify::Config::new(
                    PROTOCOL_VERSION.to_string(),
                    key.public(),
                )),
            }
        })?
        .with_swarm_config(|config| config.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    swarm.behaviour_mut().kad.set_mode(Some(kad::Mode::Server));
    swarm.listen_on(format!("/ip4/0.0.0.0/tcp/{}", port).parse::<Multiaddr>()?)?;

    if let Some((host, port)) = bootstrap {
        let address: Multiaddr = match host.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(ip)) => format!("/ip4/{}/tcp/{}", ip, port),
            Ok(std::net::IpAddr::V6(ip)) => format!("/ip6/{}/tcp/{}", ip, port),
            Err(_) => format!("/dns4/{}/tcp/{}", host, port),
        }
        .parse()?;

        tracing::info!("Bootstrapping from {}", address);

        if let Err(e) = swarm.dial(address) {
            tracing::warn!("Bootstrap dial failed, staying alone for now: {}", e);
        }
    }

    Ok(swarm)
}

/// Drives the swarm until shutdown.
pub(super) async fn run(
    mut swarm: Swarm<Behaviour>,
    mut commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut gets: HashMap<QueryId, GetState> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            command = commands.recv() => match command {
                Some(Command::Put { key, value, permanent }) => {
                    handle_put(&mut swarm, &key, &value, permanent);
                }
                Some(Command::Get { key, reply }) => {
                    let id = swarm
                        .behaviour_mut()
                        .kad
                        .get_record(record_key(&key));
                    gets.insert(
                        id,
                        GetState {
                            reply,
                            values: Vec::new(),
                        },
                    );
                }
                None => break,
            },

            event = swarm.select_next_some() => {
                handle_event(&mut swarm, &mut gets, event);
            }
        }
    }

    Ok(())
}

fn record_key(key: &str) -> RecordKey {
    RecordKey::new(&hash_key(key))
}

fn handle_put(swarm: &mut Swarm<Behaviour>, key: &str, value: &str, permanent: bool) {
    let record_key = record_key(key);

    // Merge with what we already know locally so repeated puts append
    // rather than overwrite.
    let mut values = swarm
        .behaviour_mut()
        .kad
        .store_mut()
        .get(&record_key)
        .map(|record| decode_values(&record.value))
        .unwrap_or_default();

    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }

    let mut record = Record::new(
        record_key,
        serde_json::to_vec(&values).expect("string vec always serializes"),
    );
    record.expires = if permanent {
        None
    } else {
        Some(Instant::now() + RECORD_TTL)
    };

    if let Err(e) = swarm
        .behaviour_mut()
        .kad
        .put_record(record, Quorum::One)
    {
        tracing::warn!("DHT put for {} failed: {}", key, e);
    }
}

fn handle_event(
    swarm: &mut Swarm<Behaviour>,
    gets: &mut HashMap<QueryId, GetState>,
    event: SwarmEvent<BehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!("DHT listening on {}", address);
        }

        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            // Learn the bootstrap node's identity and walk the overlay.
            for address in info.listen_addrs {
                swarm.behaviour_mut().kad.add_address(&peer_id, address);
            }

            let _ = swarm.behaviour_mut().kad.bootstrap();
        }

        SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
            id,
            result,
            step,
            ..
        })) => match result {
            QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(peer_record))) => {
                if let Some(state) = gets.get_mut(&id) {
                    for value in decode_values(&peer_record.record.value) {
                        if !state.values.iter().any(|v| v == &value) {
                            state.values.push(value);
                        }
                    }
                }

                if step.last {
                    finish_get(gets, id);
                }
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FinishedWithNoAdditionalRecord {
                ..
            })) => {
                finish_get(gets, id);
            }
            QueryResult::GetRecord(Err(e)) => {
                tracing::debug!("DHT get failed: {}", e);
                finish_get(gets, id);
            }
            QueryResult::PutRecord(Err(e)) => {
                tracing::debug!("DHT put replication failed: {}", e);
            }
            _ => {}
        },

        _ => {}
    }
}

fn finish_get(gets: &mut HashMap<QueryId, GetState>, id: QueryId) {
    if let Some(state) = gets.remove(&id) {
        let values = state.values;

        let _ = state.reply.send(if values.is_empty() {
            None
        } else {
            Some(values)
        });
    }
}

fn decode_values(raw: &[u8]) -> Vec<String> {
    match serde_json::from_slice::<Vec<String>>(raw) {
        Ok(values) => values,
        // A peer published something that is not a narpool value set;
        // treat the raw bytes as a single opaque value.
        Err(_) => String::from_utf8(raw.to_vec())
            .map(|v| vec![v])
            .unwrap_or_default(),
    }
}
