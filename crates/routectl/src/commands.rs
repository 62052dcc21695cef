//! Line command parser.
//!
//! One command per line; `#` starts a comment. Ids are decimal, raw event
//! kinds and payloads may also be given as `0x..` hex.

use anyhow::{Context, Result, anyhow, bail};

use audio_route_types::{ClientClass, EndpointId, EventKind, RouteId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start(RouteId),
    Stop(RouteId),
    SetRoute {
        route: RouteId,
        endpoint: EndpointId,
        bound: bool,
    },
    Session(RouteId),
    Volume { session: SessionId, level: u32 },
    Device { endpoint: EndpointId, on: bool },
    Bind {
        endpoint: EndpointId,
        class: ClientClass,
        bound: bool,
    },
    /// Raw notification for the hardware-event thread.
    Notify { kind: u32, id: u32, payload: u32 },
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
start <route>                  enable a route
stop <route>                   disable a route
route <route> <endpoint> on|off
session <route>                print the session id of a route
volume <session> <0..16383>
device <endpoint> on|off       power an endpoint up or down
bind <endpoint> <class>        bind voice|decoder|encoder outside any route
unbind <endpoint> <class>
ready <endpoint>               hardware reports the endpoint ready
release <endpoint>             hardware reports the endpoint released
notify <kind> <id> [payload]   raw hardware event (kind: name or code)
status                         print routing status as JSON
quit";

/// Parse one input line. Blank lines and comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = words.collect();

    let cmd = match (verb.as_str(), args.as_slice()) {
        ("start", [route]) => Command::Start(RouteId(number(route, "route")?)),
        ("stop", [route]) => Command::Stop(RouteId(number(route, "route")?)),
        ("route", [route, endpoint, state]) => Command::SetRoute {
            route: RouteId(number(route, "route")?),
            endpoint: EndpointId(number(endpoint, "endpoint")?),
            bound: switch(state)?,
        },
        ("session", [route]) => Command::Session(RouteId(number(route, "route")?)),
        ("volume", [session, level]) => Command::Volume {
            session: SessionId(number(session, "session")?),
            level: raw_u32(level).context("volume level")?,
        },
        ("device", [endpoint, state]) => Command::Device {
            endpoint: EndpointId(number(endpoint, "endpoint")?),
            on: switch(state)?,
        },
        ("bind" | "unbind", [endpoint, class]) => Command::Bind {
            endpoint: EndpointId(number(endpoint, "endpoint")?),
            class: client_class(class)?,
            bound: verb == "bind",
        },
        ("ready", [endpoint]) => Command::Notify {
            kind: EventKind::DeviceReady.bit(),
            id: u32::from(number(endpoint, "endpoint")?),
            payload: 0,
        },
        ("release", [endpoint]) => Command::Notify {
            kind: EventKind::DeviceReleased.bit(),
            id: u32::from(number(endpoint, "endpoint")?),
            payload: 0,
        },
        ("notify", [kind, id, rest @ ..]) if rest.len() <= 1 => Command::Notify {
            kind: event_kind(kind)?,
            id: raw_u32(id).context("event subject id")?,
            payload: match rest.first() {
                Some(payload) => raw_u32(payload).context("event payload")?,
                None => 0,
            },
        },
        ("status", []) => Command::Status,
        ("help", []) | ("?", []) => Command::Help,
        ("quit", []) | ("exit", []) => Command::Quit,
        (verb, _) => bail!("unrecognized command '{verb}' (try 'help')"),
    };
    Ok(Some(cmd))
}

fn number(word: &str, what: &str) -> Result<u16> {
    word.parse::<u16>()
        .with_context(|| format!("invalid {what} id '{word}'"))
}

fn raw_u32(word: &str) -> Result<u32> {
    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => word.parse::<u32>(),
    };
    parsed.map_err(|e| anyhow!("'{word}': {e}"))
}

fn switch(word: &str) -> Result<bool> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => bail!("expected on/off, got '{other}'"),
    }
}

fn client_class(word: &str) -> Result<ClientClass> {
    match word.to_ascii_lowercase().as_str() {
        "voice" => Ok(ClientClass::Voice),
        "decoder" | "dec" => Ok(ClientClass::Decoder),
        "encoder" | "enc" => Ok(ClientClass::Encoder),
        other => {
            let raw = other
                .parse::<u8>()
                .with_context(|| format!("unknown client class '{other}'"))?;
            ClientClass::try_from(raw).map_err(|raw| anyhow!("unknown client class {raw}"))
        }
    }
}

/// Event kinds by name; anything else goes through as a raw code so the
/// core can reject it.
fn event_kind(word: &str) -> Result<u32> {
    let kind = match word.to_ascii_lowercase().as_str() {
        "ready" => EventKind::DeviceReady,
        "release" | "released" => EventKind::DeviceReleased,
        "pending" => EventKind::ReleasePending,
        "volume" => EventKind::VolumeChanged,
        "route" => EventKind::RouteChanged,
        "voice" => EventKind::VoiceDeviceChanged,
        _ => return raw_u32(word).context("event kind"),
    };
    Ok(kind.bit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_line("").expect("blank"), None);
        assert_eq!(parse_line("   # just a note").expect("comment"), None);
    }

    #[test]
    fn parses_route_commands() {
        assert_eq!(
            parse_line("start 4").expect("start"),
            Some(Command::Start(RouteId(4)))
        );
        assert_eq!(
            parse_line("route 1 5 on  # bind").expect("route"),
            Some(Command::SetRoute {
                route: RouteId(1),
                endpoint: EndpointId(5),
                bound: true
            })
        );
        assert_eq!(
            parse_line("DEVICE 2 off").expect("device"),
            Some(Command::Device {
                endpoint: EndpointId(2),
                on: false
            })
        );
    }

    #[test]
    fn parses_class_bindings() {
        assert_eq!(
            parse_line("bind 5 encoder").expect("bind"),
            Some(Command::Bind {
                endpoint: EndpointId(5),
                class: ClientClass::Encoder,
                bound: true
            })
        );
        assert_eq!(
            parse_line("unbind 5 0").expect("unbind raw"),
            Some(Command::Bind {
                endpoint: EndpointId(5),
                class: ClientClass::Voice,
                bound: false
            })
        );
    }

    #[test]
    fn readiness_shortcuts_become_raw_notifications() {
        assert_eq!(
            parse_line("ready 3").expect("ready"),
            Some(Command::Notify {
                kind: 0x02,
                id: 3,
                payload: 0
            })
        );
        assert_eq!(
            parse_line("notify 0x10 1").expect("raw"),
            Some(Command::Notify {
                kind: 0x10,
                id: 1,
                payload: 0
            })
        );
        assert_eq!(
            parse_line("notify volume 1 0x3fff").expect("volume"),
            Some(Command::Notify {
                kind: 0x20,
                id: 1,
                payload: 16_383
            })
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("start").is_err());
        assert!(parse_line("start x").is_err());
        assert!(parse_line("route 1 2 maybe").is_err());
        assert!(parse_line("notify ready 1 2 3").is_err());
        assert!(parse_line("bind 1 speaker").is_err());
        assert!(parse_line("unbind 1 7").is_err());
        assert!(parse_line("dance").is_err());
    }
}
