//! Conditions, actions and native scripts the command line host ships with

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail};
use chrono::{Local, Timelike};
use homescript_events::{EventPayload, HostEvent};
use homescript_host::{
    register_scripts, Action, Condition, RawConditionSchema, RawEventSchema, Script,
    ScriptContext, ScriptRegistry, Vocabulary,
};
use tracing::info;

/// Last known state of every entity seen on stdin
#[derive(Clone, Default)]
pub struct StateStore {
    states: Arc<RwLock<HashMap<String, String>>>,
}

impl StateStore {
    pub fn get(&self, entity_id: &str) -> Option<String> {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(entity_id)
            .cloned()
    }

    pub fn set(&self, entity_id: &str, state: &str) {
        self.states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(entity_id.to_string(), state.to_string());
    }

    /// Record the new state carried by `event`, if any
    pub fn observe(&self, event: &HostEvent) {
        if let EventPayload::State {
            entity_id,
            new: Some(new),
            ..
        } = &event.payload
        {
            self.set(entity_id, new);
        }
    }
}

fn is_night_at(hour: u32) -> bool {
    !(6..20).contains(&hour)
}

pub fn vocabulary(states: &StateStore) -> Vocabulary {
    let lights = states.clone();
    let on = states.clone();
    let off = states.clone();

    Vocabulary::new()
        .with_condition(Condition::nullary("is_night", || {
            is_night_at(Local::now().hour())
        }))
        .with_condition(Condition::nullary("is_day", || {
            !is_night_at(Local::now().hour())
        }))
        .with_condition(Condition::unary("turned_on", |payload| {
            payload.new_state() == Some("on")
        }))
        .with_condition(Condition::nullary("light_is_on", move || {
            lights.get("light.living_room").as_deref() == Some("on")
        }))
        .with_action(Action::nullary("turn_on_light", move || {
            info!(target: "rules", "Turning on light.living_room");
            on.set("light.living_room", "on");
        }))
        .with_action(Action::nullary("turn_off_light", move || {
            info!(target: "rules", "Turning off light.living_room");
            off.set("light.living_room", "off");
        }))
        .with_action(Action::unary("log_event", |payload| {
            info!(target: "rules", "Event: {:?}", payload);
        }))
}

/// Logs arrivals and departures of one person entity
#[derive(Default)]
pub struct PresenceLogger {
    entity: String,
}

impl Script for PresenceLogger {
    fn id(&self) -> &str {
        "presence_logger"
    }

    fn description(&self) -> &str {
        "Logs when a person entity comes home or leaves"
    }

    fn on_load(&mut self, ctx: &mut ScriptContext) -> anyhow::Result<()> {
        self.entity = ctx
            .settings()
            .get("entity")
            .and_then(|v| v.as_str())
            .unwrap_or("person.me")
            .to_string();
        let greeting = ctx
            .settings()
            .get("greeting")
            .and_then(|v| v.as_str())
            .unwrap_or("welcome home")
            .to_string();

        let arrived = Condition::unary("arrived", |payload| payload.new_state() == Some("home"));
        let entity = self.entity.clone();
        let schema = RawEventSchema::new().on(
            format!("state:{}", self.entity),
            RawConditionSchema::conditions()
                .when(
                    arrived.clone(),
                    Action::nullary("greet", move || info!(target: "rules", "{}", greeting)),
                )
                .when(
                    !arrived,
                    Action::nullary("note_departure", move || {
                        info!(target: "rules", "{} left", entity)
                    }),
                ),
        );
        ctx.add_event_schema(schema)?;

        let entity = self.entity.clone();
        ctx.spawn("heartbeat", async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            for beat in 1u64.. {
                ticker.tick().await;
                tracing::debug!(target: "rules", "Watching {} ({})", entity, beat);
            }
            Ok(())
        });

        info!(target: "scripting", "Presence logger watching {}", self.entity);
        Ok(())
    }

    fn on_unload(&mut self) {
        info!(target: "scripting", "Presence logger stopped watching {}", self.entity);
    }
}

pub fn scripts() -> ScriptRegistry {
    let mut registry = ScriptRegistry::new();
    register_scripts!(registry, "presence_logger" => PresenceLogger::default);
    registry
}

/// Parse one line of stdin into an event.
///
/// - `state <entity_id> <old> <new>` is a state change (`-` for no state)
/// - `bus <name> [key=value ...]` is a bus event with data
/// - `<name>` is a bus event without data
pub fn parse_event_line(line: &str) -> anyhow::Result<Option<HostEvent>> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(None);
    };
    if first.starts_with('#') {
        return Ok(None);
    }

    let event = match first {
        "state" => {
            let (Some(entity), Some(old), Some(new), None) =
                (words.next(), words.next(), words.next(), words.next())
            else {
                bail!("usage: state <entity_id> <old> <new>");
            };
            let state = |s: &str| (s != "-").then(|| s.to_string());
            format!("state:{}", entity)
                .parse::<homescript_events::EventKind>()
                .map_err(|e| anyhow!("{}: {}", entity, e))?;
            HostEvent::state_changed(entity, state(old), state(new))
        }
        "bus" => {
            let name = words.next().ok_or_else(|| anyhow!("usage: bus <name> [key=value ...]"))?;
            let mut data = BTreeMap::new();
            for pair in words {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected key=value, found '{}'", pair))?;
                data.insert(key.to_string(), value.to_string());
            }
            bus_event(name, data)?
        }
        name => {
            if words.next().is_some() {
                bail!("unknown command '{}'", name);
            }
            bus_event(name, BTreeMap::new())?
        }
    };
    Ok(Some(event))
}

fn bus_event(name: &str, data: BTreeMap<String, String>) -> anyhow::Result<HostEvent> {
    name.parse::<homescript_events::EventKind>()
        .map_err(|e| anyhow!("{}: {}", name, e))?;
    Ok(HostEvent::bus(name, data))
}
