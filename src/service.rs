//! The bouncer's administrative service user.
//!
//! Clients drive network and account management by messaging `BouncerServ`:
//!
//! ```text
//! /msg BouncerServ network create -addr ircs://irc.libera.chat -name libera
//! /msg BouncerServ channel update #chan -detached true
//! /msg BouncerServ user update -password hunter2
//! ```
//!
//! Flags are `-key value` pairs; network names may not start with a dash
//! for exactly this reason.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use crate::db::{self, NetworkRecord, RelayPolicy};
use crate::error::HandlerError;
use crate::user::User;

pub(crate) const SERVICE_NICK: &str = "BouncerServ";

/// Handle one service command line from a client, on the user dispatcher.
pub(crate) async fn handle_command(
    user: &mut User,
    dc_id: u64,
    line: &str,
) -> Result<(), HandlerError> {
    let words: Vec<&str> = line.split_whitespace().collect();

    match words.as_slice() {
        [] | ["help"] => {
            for text in [
                "available commands:",
                "  network create -addr <url> [-name <name>] [-nick <nick>] [-username <username>] [-pass <pass>] [-realname <realname>] [-enabled true|false]",
                "  network update <name> [flags...]",
                "  network delete <name>",
                "  network status",
                "  channel update <name> [-detached true|false] [-relay-detached default|message|highlight|none] [-detach-after <seconds>]",
                "  user update [-password <password>] [-admin true|false]",
            ] {
                reply(user, dc_id, text);
            }
        }
        ["network", "create", flags @ ..] => {
            let flags = match parse_flags(flags) {
                Ok(flags) => flags,
                Err(err) => return Ok(reply(user, dc_id, &err)),
            };
            let mut record = NetworkRecord::default();
            if let Err(err) = apply_network_flags(&mut record, &flags) {
                return Ok(reply(user, dc_id, &err));
            }
            if record.addr.is_empty() {
                return Ok(reply(user, dc_id, "missing required flag -addr"));
            }
            match user.create_network(record).await {
                Ok(id) => {
                    let name = user
                        .networks
                        .iter()
                        .find(|net| net.record.id == id)
                        .map(|net| net.get_name().to_owned())
                        .unwrap_or_default();
                    reply(user, dc_id, &format!("created network {name}"));
                }
                Err(err) => reply(user, dc_id, &format!("could not create network: {err}")),
            }
        }
        ["network", "update", name, flags @ ..] => {
            let flags = match parse_flags(flags) {
                Ok(flags) => flags,
                Err(err) => return Ok(reply(user, dc_id, &err)),
            };
            let Some(idx) = user.network_idx_by_name(name) else {
                return Ok(reply(user, dc_id, &format!("unknown network {name:?}")));
            };
            let mut record = user.networks[idx].record.clone();
            if let Err(err) = apply_network_flags(&mut record, &flags) {
                return Ok(reply(user, dc_id, &err));
            }
            match user.update_network(record).await {
                Ok(()) => reply(user, dc_id, &format!("updated network {name}")),
                Err(err) => reply(user, dc_id, &format!("could not update network: {err}")),
            }
        }
        ["network", "delete", name] => {
            let Some(idx) = user.network_idx_by_name(name) else {
                return Ok(reply(user, dc_id, &format!("unknown network {name:?}")));
            };
            let id = user.networks[idx].record.id;
            match user.delete_network(id).await {
                Ok(()) => reply(user, dc_id, &format!("deleted network {name}")),
                Err(err) => reply(user, dc_id, &format!("could not delete network: {err}")),
            }
        }
        ["network", "status"] => {
            if user.networks.is_empty() {
                reply(user, dc_id, "no networks configured");
            }
            let mut lines = Vec::new();
            for net in &user.networks {
                let status = match (&net.conn, &net.last_error) {
                    (Some(uc), _) => format!("connected as {}", uc.nick),
                    (None, Some(err)) => format!("disconnected ({err})"),
                    (None, None) => "disconnected".to_owned(),
                };
                lines.push(format!("{} ({}): {}", net.get_name(), net.record.addr, status));
            }
            for line in lines {
                reply(user, dc_id, &line);
            }
        }
        ["channel", "update", name, flags @ ..] => {
            let flags = match parse_flags(flags) {
                Ok(flags) => flags,
                Err(err) => return Ok(reply(user, dc_id, &err)),
            };
            if let Err(err) = update_channel(user, dc_id, name, &flags).await {
                reply(user, dc_id, &format!("could not update channel: {err}"));
            }
        }
        ["user", "update", flags @ ..] => {
            let flags = match parse_flags(flags) {
                Ok(flags) => flags,
                Err(err) => return Ok(reply(user, dc_id, &err)),
            };
            if let Err(err) = update_user(user, dc_id, &flags).await {
                reply(user, dc_id, &format!("could not update user: {err}"));
            }
        }
        _ => {
            reply(
                user,
                dc_id,
                &format!("unknown command {:?}; try \"help\"", words.join(" ")),
            );
        }
    }

    Ok(())
}

fn reply(user: &User, dc_id: u64, text: &str) {
    if let Some(dc) = user.downstreams.iter().find(|dc| dc.id == dc_id) {
        user.send_service_notice(dc, text);
    }
}

/// Collect `-key value` pairs.
fn parse_flags(words: &[&str]) -> Result<HashMap<String, String>, String> {
    let mut flags = HashMap::new();
    let mut iter = words.iter();
    while let Some(word) = iter.next() {
        let Some(key) = word.strip_prefix('-') else {
            return Err(format!("unexpected argument {word:?}"));
        };
        let Some(value) = iter.next() else {
            return Err(format!("flag -{key} requires a value"));
        };
        flags.insert(key.to_owned(), (*value).to_owned());
    }
    Ok(flags)
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("expected true or false, got {value:?}")),
    }
}

fn apply_network_flags(
    record: &mut NetworkRecord,
    flags: &HashMap<String, String>,
) -> Result<(), String> {
    for (key, value) in flags {
        match key.as_str() {
            "addr" => record.addr = value.clone(),
            "name" => record.name = value.clone(),
            "nick" => record.nick = value.clone(),
            "username" => record.username = value.clone(),
            "realname" => record.realname = value.clone(),
            "pass" => record.pass = value.clone(),
            "enabled" => record.enabled = parse_bool(value)?,
            _ => return Err(format!("unknown flag -{key}")),
        }
    }
    Ok(())
}

async fn update_channel(
    user: &mut User,
    dc_id: u64,
    raw_name: &str,
    flags: &HashMap<String, String>,
) -> Result<(), String> {
    let dc_idx = user
        .downstreams
        .iter()
        .position(|dc| dc.id == dc_id)
        .ok_or_else(|| "client is gone".to_owned())?;
    let (net_idx, name) = crate::downstream::resolve_entity(user, dc_idx, raw_name)
        .map_err(|_| format!("unknown channel {raw_name:?}"))?;
    if !user.networks[net_idx].channels.contains_key(&name) {
        return Err(format!("unknown channel {raw_name:?}"));
    }

    let events = user.events();
    let store = user.msg_store.clone();
    let hostname = user.config.get().hostname.clone();
    let db = user.db.clone();
    let net_id = user.networks[net_idx].record.id;

    let mut detach = None;
    {
        let net = &mut user.networks[net_idx];
        let Some(ch) = net.channels.get_mut(&name) else {
            return Err(format!("unknown channel {raw_name:?}"));
        };
        for (key, value) in flags {
            match key.as_str() {
                "detached" => detach = Some(parse_bool(value)?),
                "relay-detached" => {
                    ch.relay_detached = RelayPolicy::parse(value)
                        .ok_or_else(|| format!("unknown relay policy {value:?}"))?;
                }
                "detach-after" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| format!("invalid duration {value:?}"))?;
                    ch.detach_after = Duration::from_secs(secs);
                }
                "key" => ch.key = value.clone(),
                _ => return Err(format!("unknown flag -{key}")),
            }
        }
    }

    match detach {
        Some(true) => {
            user.networks[net_idx]
                .detach(&name, &user.downstreams, store.as_ref(), &hostname, &events)
                .await;
        }
        Some(false) => {
            user.networks[net_idx]
                .attach(&name, &user.downstreams, store.as_ref(), &hostname, &events)
                .await;
        }
        None => {
            // A changed detach-after takes effect on the live channel.
            let detach_after = user.networks[net_idx]
                .channels
                .get(&name)
                .map(|ch| ch.detach_after)
                .unwrap_or(Duration::ZERO);
            if let Some(uc) = &mut user.networks[net_idx].conn {
                let seq = uc.seq;
                if let Some(uch) = uc.channels.get_mut(&name) {
                    uch.update_auto_detach(detach_after, &events, net_id, seq);
                }
            }
        }
    }

    if let Some(mut ch) = user.networks[net_idx].channels.get(&name).cloned() {
        if let Err(err) = db.store_channel(net_id, &mut ch).await {
            warn!(channel = %ch.name, error = %err, "failed to store channel");
            return Err(err.to_string());
        }
    }

    reply(user, dc_id, &format!("updated channel {name}"));
    Ok(())
}

async fn update_user(
    user: &mut User,
    dc_id: u64,
    flags: &HashMap<String, String>,
) -> Result<(), String> {
    let mut record = user.record.clone();
    let mut password_changed = false;

    for (key, value) in flags {
        match key.as_str() {
            "password" => {
                record.password = db::hash_password(value).map_err(|err| err.to_string())?;
                password_changed = true;
            }
            "admin" => record.admin = parse_bool(value)?,
            "realname" => record.realname = value.clone(),
            _ => return Err(format!("unknown flag -{key}")),
        }
    }

    user.update_user(record).await.map_err(|err| err.to_string())?;
    reply(user, dc_id, "updated user");

    if password_changed {
        for dc in &user.downstreams {
            dc.close();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_pairs() {
        let flags = parse_flags(&["-addr", "ircs://irc.libera.chat", "-name", "libera"]).unwrap();
        assert_eq!(flags["addr"], "ircs://irc.libera.chat");
        assert_eq!(flags["name"], "libera");

        assert!(parse_flags(&["oops"]).is_err());
        assert!(parse_flags(&["-addr"]).is_err());
    }

    #[test]
    fn network_flags_apply() {
        let mut record = NetworkRecord::default();
        let flags = parse_flags(&[
            "-addr",
            "ircs://irc.libera.chat",
            "-name",
            "libera",
            "-enabled",
            "false",
        ])
        .unwrap();
        apply_network_flags(&mut record, &flags).unwrap();
        assert_eq!(record.addr, "ircs://irc.libera.chat");
        assert_eq!(record.name, "libera");
        assert!(!record.enabled);

        let bad = parse_flags(&["-bogus", "x"]).unwrap();
        assert!(apply_network_flags(&mut record, &bad).is_err());
    }
}
