//! Per-connection protocol engine.
//!
//! One [`handle_connection`] call owns exactly one TCP socket end to end:
//! it reads lines, dispatches them, and writes replies/broadcasts back out
//! on the same task, so there is never a risk of two writers interleaving
//! partial lines on one connection. Queued outbound traffic (broadcasts
//! from other connections, a `$!!` kill) arrives through an mpsc channel
//! registered in the [`ClientRegistry`] under this client's callsign and is
//! raced against the next inbound read and an idle-timeout sleep via
//! `tokio::select!`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::auth::{Authenticator, LoginResult};
use crate::broadcast::{
    all_atc_checker, all_pilot_checker, always_checker, at_checker, broadcast_message_checker,
    broadcast_position_checker, is_multicast, BroadcastChecker,
};
use crate::client::{Client, ClientType};
use crate::config::ServerConfig;
use crate::error::ErrNo;
use crate::packet::{concat, decode, encode, is_callsign_valid, join_lines, str_to_float, str_to_int, Command, CLIENT_USED_COMMANDS};
use crate::plugin::{AuditResult, PluginManager};
use crate::registry::{ClientRegistry, OutboundMessage, OutboundSender};
use crate::weather::manager::MetarManager;
use crate::weather::profile::WeatherProfile;

/// How long a connection may sit idle before being dropped with `# Timeout`.
/// The historic server hardcodes 800 seconds; kept configurable here only
/// so tests don't have to wait that long for the timeout path.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(800);

/// Everything a connection needs to read from or act on shared server
/// state. Cheap to clone (every field is already `Arc`-backed or `Copy`).
#[derive(Clone)]
pub struct Shared {
    pub registry: ClientRegistry,
    pub credentials: Arc<dyn Authenticator>,
    pub metar: Arc<MetarManager>,
    pub plugins: Arc<PluginManager>,
    pub config: Arc<ServerConfig>,
    pub idle_timeout: Duration,
}

impl Shared {
    pub fn new(
        registry: ClientRegistry,
        credentials: Arc<dyn Authenticator>,
        metar: Arc<MetarManager>,
        plugins: Arc<PluginManager>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            registry,
            credentials,
            metar,
            plugins,
            config,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Tracks the logged-in identity of a connection once `#AA`/`#AP` succeeds.
/// Before that, a connection may only send `#AA`/`#AP` (or junk that gets
/// rejected); every other handler requires this to be populated.
struct LoggedInState {
    callsign: Vec<u8>,
    client_type: ClientType,
}

/// Outcome of handling one line, distinct from [`AuditResult`] only in that
/// it additionally says whether the connection should close.
struct PacketOutcome {
    success: bool,
    packet_ok: bool,
    close: bool,
}

impl PacketOutcome {
    fn ok() -> Self {
        Self { success: true, packet_ok: true, close: false }
    }

    /// Delivery (or the requested action) failed, but the packet itself
    /// was well-formed and targeted correctly - e.g. "callsign in use" or
    /// a multicast with no matching recipients.
    fn failed_without_packet() -> Self {
        Self { success: false, packet_ok: true, close: false }
    }

    /// The packet failed a structural or login check before any delivery
    /// was attempted.
    fn all_failed() -> Self {
        Self { success: false, packet_ok: false, close: false }
    }

    /// A fatal `$ER` was sent; the connection closes right after.
    fn fatal() -> Self {
        Self { success: false, packet_ok: false, close: true }
    }
}

fn with_crlf(mut packet: Vec<u8>) -> Vec<u8> {
    packet.extend_from_slice(b"\r\n");
    packet
}

fn send_line(tx: &OutboundSender, packet: Vec<u8>) {
    let _ = tx.send(OutboundMessage::Write(with_crlf(packet)));
}

fn send_error(tx: &OutboundSender, callsign: Option<&[u8]>, errno: ErrNo, env: &[u8]) {
    let cs = callsign.unwrap_or(b"unknown");
    let head = concat(Command::Error, b"server");
    let code = format!("{:03}", errno.code());
    let packet = encode([head.as_slice(), cs, code.as_bytes(), env, errno.message().as_bytes()]);
    send_line(tx, packet);
}

fn send_motd(callsign: &[u8], shared: &Shared, tx: &OutboundSender) {
    let head = concat(Command::Message, b"server");
    let mut lines = Vec::new();
    let banner = format!("FSDD {}", env!("CARGO_PKG_VERSION"));
    lines.push(encode([head.as_slice(), callsign, banner.as_bytes()]));
    for line in &shared.config.motd {
        lines.push(encode([head.as_slice(), callsign, line.as_bytes()]));
    }
    let refs: Vec<&[u8]> = lines.iter().map(|l| l.as_slice()).collect();
    let _ = tx.send(OutboundMessage::Write(join_lines(refs)));
}

/// Queue `packet` for every client matched by `checker`, excluding `from`
/// itself. Returns whether at least one recipient received it.
fn broadcast(registry: &ClientRegistry, from: &Client, packet: &[u8], checker: BroadcastChecker) -> bool {
    let mut any = false;
    for callsign in registry.matching_fn(from, checker) {
        if registry.send_to(&callsign, with_crlf(packet.to_vec())) {
            any = true;
        }
    }
    any
}

/// Shared `checkPacket`-equivalent validation: field count, then (when
/// `need_login`) that the connection is logged in and `fields[callsign_position]`
/// matches its own callsign. Returns `Some(outcome)` when the caller should
/// stop and return that outcome instead of continuing to handle the packet.
fn check_packet(
    fields: &[&[u8]],
    require: usize,
    callsign_position: usize,
    logged_in: Option<&LoggedInState>,
    tx: &OutboundSender,
    need_login: bool,
) -> Option<PacketOutcome> {
    if fields.len() < require {
        send_error(tx, logged_in.map(|l| l.callsign.as_slice()), ErrNo::Syntax, b"");
        return Some(PacketOutcome::all_failed());
    }
    if need_login {
        let Some(logged) = logged_in else {
            return Some(PacketOutcome::all_failed());
        };
        if fields.get(callsign_position).copied().unwrap_or(b"") != logged.callsign.as_slice() {
            send_error(tx, Some(&logged.callsign), ErrNo::SourceInvalid, fields[0]);
            return Some(PacketOutcome::all_failed());
        }
    }
    None
}

/// Generic multicast/unicast relay used by every packet type that just
/// forwards its tail fields to a named or wildcard recipient, re-addressed
/// from the sender rather than re-encoded verbatim.
fn handle_cast(
    command: Command,
    fields: &[&[u8]],
    require_param: usize,
    multicast_able: bool,
    custom_at_checker: Option<BroadcastChecker>,
    logged: &LoggedInState,
    registry: &ClientRegistry,
    tx: &OutboundSender,
) -> PacketOutcome {
    if let Some(outcome) = check_packet(fields, require_param, 0, Some(logged), tx, true) {
        return outcome;
    }
    let to_callsign = fields[1];
    let head = concat(command, &logged.callsign);
    let mut out_fields: Vec<&[u8]> = vec![head.as_slice(), to_callsign];
    if fields.len() > 2 {
        out_fields.extend_from_slice(&fields[2..]);
    } else {
        out_fields.push(b"");
    }
    let out_packet = encode(out_fields);

    let to_str = String::from_utf8_lossy(to_callsign);
    let mut packet_ok = true;
    let success = if is_multicast(&to_str) {
        if !multicast_able {
            packet_ok = false;
            false
        } else {
            match registry.get(&logged.callsign) {
                Some(from_client) => {
                    let checker: BroadcastChecker = match to_str.as_ref() {
                        "*" => always_checker,
                        "*A" => all_atc_checker,
                        "*P" => all_pilot_checker,
                        _ => custom_at_checker.unwrap_or(at_checker),
                    };
                    broadcast(registry, &from_client, &out_packet, checker)
                }
                None => false,
            }
        }
    } else {
        registry.send_to(to_callsign, with_crlf(out_packet))
    };

    if packet_ok && success {
        PacketOutcome::ok()
    } else if packet_ok {
        PacketOutcome::failed_without_packet()
    } else {
        PacketOutcome::all_failed()
    }
}

async fn handle_add_client(
    command: Command,
    fields: &[&[u8]],
    logged_in: &mut Option<LoggedInState>,
    shared: &Shared,
    tx: &OutboundSender,
) -> PacketOutcome {
    let client_type = if command == Command::AddAtc { ClientType::Atc } else { ClientType::Pilot };
    let require = if client_type == ClientType::Pilot { 8 } else { 7 };
    if fields.len() < require {
        send_error(tx, None, ErrNo::Syntax, b"");
        return PacketOutcome::all_failed();
    }
    if logged_in.is_some() {
        send_error(tx, None, ErrNo::AlreadyRegistered, b"");
        return PacketOutcome::all_failed();
    }

    let callsign = fields[0].to_vec();
    let (realname, cid, password, req_rating_field, protocol_field, sim_type_int) = if client_type == ClientType::Pilot
    {
        (fields[7].to_vec(), fields[2], fields[3], fields[4], fields[5], str_to_int(fields[6], 0))
    } else {
        (fields[2].to_vec(), fields[3], fields[4], fields[5], fields[6], -1)
    };

    let req_rating_int = if req_rating_field.is_empty() { 1 } else { str_to_int(req_rating_field, 0) };
    let protocol_int = str_to_int(protocol_field, -1);

    if !is_callsign_valid(&callsign) {
        send_error(tx, None, ErrNo::CallsignInvalid, b"");
        return PacketOutcome::fatal();
    }
    if protocol_int != 9 {
        send_error(tx, None, ErrNo::InvalidRevision, b"");
        return PacketOutcome::fatal();
    }
    let (Ok(cid_str), Ok(password_str)) = (std::str::from_utf8(cid), std::str::from_utf8(password)) else {
        send_error(tx, None, ErrNo::CidInvalid, cid);
        return PacketOutcome::fatal();
    };

    if shared.registry.contains(&callsign) {
        send_error(tx, None, ErrNo::CallsignInUse, b"");
        return PacketOutcome::failed_without_packet();
    }

    let rating = match shared.credentials.login(cid_str, password_str).await {
        Ok(LoginResult::Authorized { rating }) => rating as i64,
        Ok(LoginResult::Unauthorized) => {
            send_error(tx, None, ErrNo::CidInvalid, cid);
            return PacketOutcome::fatal();
        }
        Err(err) => {
            tracing::warn!("credential lookup failed for cid {}: {:#}", cid_str, err);
            send_error(tx, None, ErrNo::CidInvalid, cid);
            return PacketOutcome::fatal();
        }
    };
    if rating == 0 {
        send_error(tx, None, ErrNo::CidSuspended, b"");
        return PacketOutcome::fatal();
    }
    if rating < req_rating_int {
        send_error(tx, None, ErrNo::LevelTooHigh, req_rating_field);
        return PacketOutcome::fatal();
    }

    let client = Client::new(client_type, callsign.clone(), rating, cid_str.to_string(), protocol_int, realname.clone(), sim_type_int);
    shared.registry.insert(client, tx.clone());
    *logged_in = Some(LoggedInState { callsign: callsign.clone(), client_type });

    // The success broadcast deliberately doesn't re-encode the inbound
    // packet: password is blanked, req_rating is sent twice (not a typo),
    // and protocol/realname are dropped from the pilot variant.
    let broadcast_packet = if client_type == ClientType::Pilot {
        let head = concat(Command::AddPilot, &callsign);
        encode([head.as_slice(), b"SERVER", cid, b"", req_rating_field, req_rating_field, fields[6]])
    } else {
        let head = concat(Command::AddAtc, &callsign);
        encode([head.as_slice(), b"SERVER", realname.as_slice(), cid, b"", req_rating_field])
    };
    if let Some(from_client) = shared.registry.get(&callsign) {
        broadcast(&shared.registry, &from_client, &broadcast_packet, always_checker);
    }

    send_motd(&callsign, shared, tx);
    shared.plugins.fire_new_client_created(&callsign).await;

    PacketOutcome::ok()
}

fn handle_remove_client(fields: &[&[u8]], logged_in: &Option<LoggedInState>, tx: &OutboundSender) -> PacketOutcome {
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    if let Some(outcome) = check_packet(fields, 1, 0, Some(logged), tx, true) {
        return outcome;
    }
    PacketOutcome { success: true, packet_ok: true, close: true }
}

fn handle_plan(fields: &[&[u8]], logged_in: &Option<LoggedInState>, shared: &Shared, tx: &OutboundSender) -> PacketOutcome {
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    if let Some(outcome) = check_packet(fields, 17, 0, Some(logged), tx, true) {
        return outcome;
    }
    // Only the first byte of the plan type field is kept on the wire.
    let plan_type = fields[2].get(0..1).map(|s| s.to_vec()).unwrap_or_default();
    let aircraft = fields[3].to_vec();
    let dep_airport = fields[5].to_vec();
    let alt = fields[8].to_vec();
    let dest_airport = fields[9].to_vec();
    let alt_airport = fields[14].to_vec();
    let remarks = fields[15].to_vec();
    let route = fields[16].to_vec();

    shared.registry.update(&logged.callsign, |c| {
        c.update_plan(
            plan_type.clone(),
            aircraft.clone(),
            str_to_int(fields[4], 0),
            dep_airport.clone(),
            str_to_int(fields[6], 0),
            str_to_int(fields[7], 0),
            alt.clone(),
            dest_airport.clone(),
            str_to_int(fields[10], 0),
            str_to_int(fields[11], 0),
            str_to_int(fields[12], 0),
            str_to_int(fields[13], 0),
            alt_airport.clone(),
            remarks.clone(),
            route.clone(),
        );
    });

    let head = concat(Command::Plan, &logged.callsign);
    let out_packet = encode([
        head.as_slice(),
        b"*A",
        &plan_type,
        &aircraft,
        fields[4],
        &dep_airport,
        fields[6],
        fields[7],
        &alt,
        &dest_airport,
        fields[10],
        fields[11],
        fields[12],
        fields[13],
        &alt_airport,
        &remarks,
        &route,
    ]);
    if let Some(from_client) = shared.registry.get(&logged.callsign) {
        broadcast(&shared.registry, &from_client, &out_packet, all_atc_checker);
    }
    PacketOutcome::ok()
}

fn warn_if_position_out_of_range(callsign: &[u8], lat: f64, lon: f64) {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        debug!("position out of range from {}: {}, {}", String::from_utf8_lossy(callsign), lat, lon);
    }
}

fn handle_pilot_position(
    fields: &[&[u8]],
    logged_in: &Option<LoggedInState>,
    shared: &Shared,
    tx: &OutboundSender,
) -> PacketOutcome {
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    if let Some(outcome) = check_packet(fields, 10, 1, Some(logged), tx, true) {
        return outcome;
    }
    let mode = fields[0];
    let transponder = str_to_int(fields[2], 0);
    let lat = str_to_float(fields[4], 0.0);
    let lon = str_to_float(fields[5], 0.0);
    let altitude = str_to_int(fields[6], 0);
    let ground_speed = str_to_int(fields[7], 0);
    let pbh = str_to_int(fields[8], 0) & 0xFFFF_FFFF;
    let flags = str_to_int(fields[9], 0);
    warn_if_position_out_of_range(&logged.callsign, lat, lon);

    shared.registry.update(&logged.callsign, |c| {
        c.update_pilot_position(transponder, lat, lon, altitude, ground_speed, pbh, flags);
    });

    let rating = shared.registry.get(&logged.callsign).map(|c| c.rating).unwrap_or(0);
    let head = concat(Command::PilotPosition, mode);
    let rating_str = rating.to_string();
    let lat_str = format!("{:.5}", lat);
    let lon_str = format!("{:.5}", lon);
    let out_packet = encode([
        head.as_slice(),
        &logged.callsign,
        fields[2],
        rating_str.as_bytes(),
        lat_str.as_bytes(),
        lon_str.as_bytes(),
        fields[6],
        fields[7],
        fields[8],
        fields[9],
    ]);
    if let Some(from_client) = shared.registry.get(&logged.callsign) {
        broadcast(&shared.registry, &from_client, &out_packet, broadcast_position_checker);
    }
    PacketOutcome::ok()
}

fn handle_atc_position(
    fields: &[&[u8]],
    logged_in: &Option<LoggedInState>,
    shared: &Shared,
    tx: &OutboundSender,
) -> PacketOutcome {
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    if let Some(outcome) = check_packet(fields, 8, 0, Some(logged), tx, true) {
        return outcome;
    }
    let frequency = str_to_int(fields[1], 0);
    let facility_type = str_to_int(fields[2], 0);
    let visual_range = str_to_int(fields[3], 0);
    let lat = str_to_float(fields[5], 0.0);
    let lon = str_to_float(fields[6], 0.0);
    let altitude = str_to_int(fields[7], 0);
    warn_if_position_out_of_range(&logged.callsign, lat, lon);

    shared.registry.update(&logged.callsign, |c| {
        c.update_atc_position(frequency, facility_type, visual_range, lat, lon, altitude);
    });

    let rating = shared.registry.get(&logged.callsign).map(|c| c.rating).unwrap_or(0);
    let head = concat(Command::AtcPosition, &logged.callsign);
    let rating_str = rating.to_string();
    let lat_str = format!("{:.5}", lat);
    let lon_str = format!("{:.5}", lon);
    let out_packet = encode([
        head.as_slice(),
        fields[1],
        fields[2],
        fields[3],
        rating_str.as_bytes(),
        lat_str.as_bytes(),
        lon_str.as_bytes(),
        fields[7],
    ]);
    if let Some(from_client) = shared.registry.get(&logged.callsign) {
        broadcast(&shared.registry, &from_client, &out_packet, broadcast_position_checker);
    }
    PacketOutcome::ok()
}

fn handle_ping(fields: &[&[u8]], logged_in: &Option<LoggedInState>, shared: &Shared, tx: &OutboundSender) -> PacketOutcome {
    if fields.len() > 1 && fields[1].eq_ignore_ascii_case(b"server") {
        let Some(logged) = logged_in.as_ref() else {
            return PacketOutcome::all_failed();
        };
        if let Some(outcome) = check_packet(fields, 2, 0, Some(logged), tx, true) {
            return outcome;
        }
        let head = concat(Command::Pong, b"server");
        let mut out: Vec<&[u8]> = vec![head.as_slice(), &logged.callsign];
        if fields.len() > 2 {
            out.extend_from_slice(&fields[2..]);
        } else {
            out.push(b"");
        }
        send_line(tx, encode(out));
        PacketOutcome::ok()
    } else {
        let Some(logged) = logged_in.as_ref() else {
            return PacketOutcome::all_failed();
        };
        handle_cast(Command::Ping, fields, 2, true, None, logged, &shared.registry, tx)
    }
}

async fn handle_weather(
    fields: &[&[u8]],
    logged_in: &Option<LoggedInState>,
    shared: &Shared,
    tx: &OutboundSender,
) -> PacketOutcome {
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    if let Some(outcome) = check_packet(fields, 3, 0, Some(logged), tx, true) {
        return outcome;
    }
    let icao = String::from_utf8_lossy(fields[2]).to_string();
    let Some(metar) = shared.metar.query(&icao).await else {
        send_error(tx, Some(&logged.callsign), ErrNo::NoSuchWeather, fields[2]);
        return PacketOutcome::failed_without_packet();
    };
    let position = shared.registry.get(&logged.callsign).map(|c| c.position).unwrap_or((0.0, 0.0));
    let mut profile = WeatherProfile::from_metar(None, &metar);
    profile.fix(position);

    let temp_fields: Vec<String> = profile.temps.iter().map(|t| format!("{}:{}", t.ceiling, t.temp)).collect();
    let temp_head = concat(Command::TempData, b"server");
    let barometer_str = profile.barometer.to_string();
    let mut temp_out: Vec<&[u8]> = vec![temp_head.as_slice(), &logged.callsign];
    let temp_bytes: Vec<&[u8]> = temp_fields.iter().map(|s| s.as_bytes()).collect();
    temp_out.extend(temp_bytes.iter());
    temp_out.push(barometer_str.as_bytes());

    let wind_fields: Vec<String> = profile
        .winds
        .iter()
        .map(|w| format!("{}:{}:{}:{}:{}:{}", w.ceiling, w.floor, w.direction, w.speed, w.gusting, w.turbulence))
        .collect();
    let wind_head = concat(Command::WindData, b"server");
    let mut wind_out: Vec<&[u8]> = vec![wind_head.as_slice(), &logged.callsign];
    let wind_bytes: Vec<&[u8]> = wind_fields.iter().map(|s| s.as_bytes()).collect();
    wind_out.extend(wind_bytes.iter());

    let mut cloud_fields: Vec<String> = profile
        .clouds
        .iter()
        .map(|c| format!("{}:{}:{}:{}:{}", c.ceiling, c.floor, c.coverage, c.icing, c.turbulence))
        .collect();
    cloud_fields.push(format!(
        "{}:{}:{}:{}:{}",
        profile.tstorm.ceiling, profile.tstorm.floor, profile.tstorm.coverage, profile.tstorm.icing, profile.tstorm.turbulence
    ));
    let cloud_head = concat(Command::CloudData, b"server");
    let visibility_str = format!("{:.2}", profile.visibility);
    let mut cloud_out: Vec<&[u8]> = vec![cloud_head.as_slice(), &logged.callsign];
    let cloud_bytes: Vec<&[u8]> = cloud_fields.iter().map(|s| s.as_bytes()).collect();
    cloud_out.extend(cloud_bytes.iter());
    cloud_out.push(visibility_str.as_bytes());

    send_line(tx, encode(temp_out));
    send_line(tx, encode(wind_out));
    send_line(tx, encode(cloud_out));
    PacketOutcome::ok()
}

async fn handle_acars(
    fields: &[&[u8]],
    logged_in: &Option<LoggedInState>,
    shared: &Shared,
    tx: &OutboundSender,
) -> PacketOutcome {
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    if let Some(outcome) = check_packet(fields, 3, 0, Some(logged), tx, true) {
        return outcome;
    }
    if fields[2].eq_ignore_ascii_case(b"METAR") && fields.len() > 3 {
        let icao = String::from_utf8_lossy(fields[3]).to_string();
        let Some(metar) = shared.metar.query(&icao).await else {
            send_error(tx, Some(&logged.callsign), ErrNo::NoSuchWeather, fields[3]);
            return PacketOutcome::failed_without_packet();
        };
        let head = concat(Command::ReplyAcars, b"server");
        send_line(tx, encode([head.as_slice(), &logged.callsign, b"METAR", metar.code.as_bytes()]));
    }
    PacketOutcome::ok()
}

fn handle_cq(fields: &[&[u8]], logged_in: &Option<LoggedInState>, shared: &Shared, tx: &OutboundSender) -> PacketOutcome {
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    if let Some(outcome) = check_packet(fields, 3, 0, Some(logged), tx, true) {
        return outcome;
    }
    if !fields[1].eq_ignore_ascii_case(b"SERVER") {
        return handle_cast(Command::Cq, fields, 3, true, None, logged, &shared.registry, tx);
    }
    if fields[2].eq_ignore_ascii_case(b"FP") {
        if fields.len() < 4 {
            send_error(tx, Some(&logged.callsign), ErrNo::Syntax, b"");
            return PacketOutcome::failed_without_packet();
        }
        let target_cs = fields[3];
        let Some(target) = shared.registry.get(target_cs) else {
            send_error(tx, Some(&logged.callsign), ErrNo::NoSuchCallsign, target_cs);
            return PacketOutcome::failed_without_packet();
        };
        let Some(plan) = target.flight_plan.as_ref() else {
            send_error(tx, Some(&logged.callsign), ErrNo::NoFlightPlan, b"");
            return PacketOutcome::failed_without_packet();
        };
        if logged.client_type != ClientType::Atc {
            return PacketOutcome::all_failed();
        }
        let head = concat(Command::Plan, target_cs);
        let tas = plan.tas_cruise.to_string();
        let dep_time = plan.dep_time.to_string();
        let act_dep_time = plan.actual_dep_time.to_string();
        let hrs_enroute = plan.hrs_enroute.to_string();
        let min_enroute = plan.min_enroute.to_string();
        let hrs_fuel = plan.hrs_fuel.to_string();
        let min_fuel = plan.min_fuel.to_string();
        send_line(
            tx,
            encode([
                head.as_slice(),
                &logged.callsign,
                &plan.plan_type,
                &plan.aircraft,
                tas.as_bytes(),
                &plan.dep_airport,
                dep_time.as_bytes(),
                act_dep_time.as_bytes(),
                &plan.alt,
                &plan.dest_airport,
                hrs_enroute.as_bytes(),
                min_enroute.as_bytes(),
                hrs_fuel.as_bytes(),
                min_fuel.as_bytes(),
                &plan.alt_airport,
                &plan.remarks,
                &plan.route,
            ]),
        );
        PacketOutcome::ok()
    } else if fields[2].eq_ignore_ascii_case(b"RN") {
        // `packet[1]` is used here rather than the requester's own
        // callsign - by this point `packet[1]` is already known to equal
        // `b"SERVER"` (the `upper() != b"SERVER"` branch above is the only
        // other path), so this lookup only ever resolves a client literally
        // named "SERVER" and the success arm below is effectively dead.
        // Preserved as-is rather than silently rewritten to use the
        // requester's callsign.
        let target_cs = fields[1];
        let Some(target) = shared.registry.get(target_cs) else {
            return PacketOutcome::failed_without_packet();
        };
        let head = concat(Command::Cr, target_cs);
        let rating_str = target.rating.to_string();
        send_line(tx, encode([head.as_slice(), &logged.callsign, b"RN", &target.realname, b"USER", rating_str.as_bytes()]));
        PacketOutcome::ok()
    } else {
        PacketOutcome::ok()
    }
}

fn handle_kill(fields: &[&[u8]], logged_in: &Option<LoggedInState>, shared: &Shared, tx: &OutboundSender) -> PacketOutcome {
    if fields.len() < 3 {
        send_error(tx, logged_in.as_ref().map(|l| l.callsign.as_slice()), ErrNo::Syntax, b"");
        return PacketOutcome::all_failed();
    }
    let Some(logged) = logged_in.as_ref() else {
        return PacketOutcome::all_failed();
    };
    let target_cs = fields[1];
    let reason = fields[2];
    if shared.registry.get(target_cs).is_none() {
        send_error(tx, Some(&logged.callsign), ErrNo::NoSuchCallsign, target_cs);
        return PacketOutcome::failed_without_packet();
    }

    let requester_rating = shared.registry.get(&logged.callsign).map(|c| c.rating).unwrap_or(0);
    if requester_rating < 11 {
        let head = concat(Command::Message, b"server");
        send_line(tx, encode([head.as_slice(), &logged.callsign, b"You are not allowed to kill users!"]));
        return PacketOutcome::failed_without_packet();
    }

    let ack_head = concat(Command::Message, b"server");
    let ack_text = format!("Attempting to kill {}", String::from_utf8_lossy(target_cs));
    send_line(tx, encode([ack_head.as_slice(), &logged.callsign, ack_text.as_bytes()]));

    let kill_head = concat(Command::Kill, b"SERVER");
    shared.registry.send_to(target_cs, with_crlf(encode([kill_head.as_slice(), target_cs, reason])));
    shared.registry.close(target_cs);
    PacketOutcome::ok()
}

async fn dispatch_packet(line: &[u8], logged_in: &mut Option<LoggedInState>, shared: &Shared, tx: &OutboundSender) -> PacketOutcome {
    let (command, fields) = decode(line, CLIENT_USED_COMMANDS);
    let Some(command) = command else {
        send_error(tx, logged_in.as_ref().map(|l| l.callsign.as_slice()), ErrNo::Syntax, b"");
        return PacketOutcome::all_failed();
    };

    macro_rules! need_login_or_fail {
        () => {
            match logged_in.as_ref() {
                Some(logged) => logged,
                None => return PacketOutcome::all_failed(),
            }
        };
    }

    match command {
        Command::AddAtc | Command::AddPilot => handle_add_client(command, &fields, logged_in, shared, tx).await,
        Command::RemoveAtc | Command::RemovePilot => handle_remove_client(&fields, logged_in, tx),
        Command::Plan => handle_plan(&fields, logged_in, shared, tx),
        Command::PilotPosition => handle_pilot_position(&fields, logged_in, shared, tx),
        Command::AtcPosition => handle_atc_position(&fields, logged_in, shared, tx),
        Command::Ping => handle_ping(&fields, logged_in, shared, tx),
        Command::Pong => {
            let logged = need_login_or_fail!();
            handle_cast(Command::Pong, &fields, 2, true, None, logged, &shared.registry, tx)
        }
        Command::Message => {
            let logged = need_login_or_fail!();
            handle_cast(Command::Message, &fields, 3, true, Some(broadcast_message_checker), logged, &shared.registry, tx)
        }
        Command::RequestHandoff | Command::AcHandoff => {
            let logged = need_login_or_fail!();
            handle_cast(command, &fields, 3, false, None, logged, &shared.registry, tx)
        }
        Command::Sb | Command::Pc | Command::RequestComm => {
            let logged = need_login_or_fail!();
            handle_cast(command, &fields, 2, false, None, logged, &shared.registry, tx)
        }
        Command::ReplyComm => {
            let logged = need_login_or_fail!();
            handle_cast(command, &fields, 3, false, None, logged, &shared.registry, tx)
        }
        Command::Cr => {
            let logged = need_login_or_fail!();
            handle_cast(command, &fields, 4, false, None, logged, &shared.registry, tx)
        }
        Command::Weather => handle_weather(&fields, logged_in, shared, tx).await,
        Command::RequestAcars => handle_acars(&fields, logged_in, shared, tx).await,
        Command::Cq => handle_cq(&fields, logged_in, shared, tx),
        Command::Kill => handle_kill(&fields, logged_in, shared, tx),
        _ => {
            send_error(tx, logged_in.as_ref().map(|l| l.callsign.as_slice()), ErrNo::Syntax, b"");
            PacketOutcome::all_failed()
        }
    }
}

fn trim_crlf(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &buf[..end]
}

/// Drive one accepted connection to completion: handshake, packet loop,
/// idle timeout, and the disconnect trailer (broadcast `#D*`, fire
/// `client_disconnected`). Returns once the socket is closed.
pub async fn handle_connection(stream: TcpStream, peer: String, shared: Shared) {
    shared.plugins.fire_new_connection_established(&peer).await;

    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let mut logged_in: Option<LoggedInState> = None;
    let mut deadline = Instant::now() + shared.idle_timeout;
    let mut buf = Vec::new();

    'connection: loop {
        buf.clear();
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                let _ = writer.write_all(b"# Timeout\r\n").await;
                break 'connection;
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(OutboundMessage::Write(payload)) => {
                        if writer.write_all(&payload).await.is_err() {
                            break 'connection;
                        }
                    }
                    Some(OutboundMessage::Close) | None => break 'connection,
                }
                continue;
            }
            result = read_line(&mut reader, &mut buf) => {
                match result {
                    Ok(0) => break 'connection,
                    Ok(_) => deadline = Instant::now() + shared.idle_timeout,
                    Err(_) => break 'connection,
                }
            }
        }

        let line = trim_crlf(&buf).to_vec();
        if line.is_empty() {
            continue;
        }

        let callsign_for_plugins: Vec<u8> = logged_in.as_ref().map(|l| l.callsign.clone()).unwrap_or_default();
        let preempt = shared.plugins.fire_line_received(&callsign_for_plugins, &line).await;
        let (audit, close) = match preempt {
            Some(result) => (AuditResult::from_preempt(result), false),
            None => {
                let outcome = dispatch_packet(&line, &mut logged_in, &shared, &tx).await;
                (AuditResult::from_engine(outcome.success, outcome.packet_ok), outcome.close)
            }
        };
        shared.plugins.fire_audit(&callsign_for_plugins, &line, &audit).await;
        if close {
            break 'connection;
        }
    }

    if let Some(logged) = logged_in.take() {
        if let Some(client) = shared.registry.remove(&logged.callsign) {
            let remove_command = match logged.client_type {
                ClientType::Atc => Command::RemoveAtc,
                ClientType::Pilot => Command::RemovePilot,
            };
            let head = concat(remove_command, &logged.callsign);
            let packet = encode([head.as_slice(), client.cid.as_bytes()]);
            broadcast(&shared.registry, &client, &packet, always_checker);
        }
        shared.plugins.fire_client_disconnected(&logged.callsign).await;
    }
}

/// Thin wrapper over `read_until(b'\n', ..)` so the call site above reads
/// as a plain future rather than a method with an awkward turbofish.
async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    use tokio::io::AsyncBufReadExt;
    reader.read_until(b'\n', buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weather::fetch::MetarFetcher;
    use crate::weather::metar::ParsedMetar;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    struct StubAuthenticator {
        result: LoginResult,
    }

    #[async_trait]
    impl Authenticator for StubAuthenticator {
        async fn login(&self, _cid: &str, _password: &str) -> Result<LoginResult> {
            Ok(self.result)
        }
    }

    struct StubMetarFetcher {
        metar: Option<ParsedMetar>,
    }

    #[async_trait]
    impl MetarFetcher for StubMetarFetcher {
        fn name(&self) -> &'static str {
            "STUB"
        }

        async fn fetch(&self, _icao: &str) -> Result<Option<ParsedMetar>> {
            Ok(self.metar.clone())
        }

        async fn fetch_all(&self) -> Result<HashMap<String, ParsedMetar>> {
            Ok(HashMap::new())
        }
    }

    fn make_channel() -> (OutboundSender, mpsc::UnboundedReceiver<OutboundMessage>) {
        mpsc::unbounded_channel()
    }

    fn written(msg: OutboundMessage) -> Vec<u8> {
        match msg {
            OutboundMessage::Write(bytes) => bytes,
            OutboundMessage::Close => panic!("expected Write, got Close"),
        }
    }

    fn shared_with_auth_and_metar(result: LoginResult, metar: Arc<MetarManager>) -> Shared {
        Shared::new(
            ClientRegistry::new(),
            Arc::new(StubAuthenticator { result }),
            metar,
            Arc::new(PluginManager::new()),
            Arc::new(ServerConfig::default()),
        )
    }

    fn shared_with_auth(result: LoginResult) -> Shared {
        shared_with_auth_and_metar(result, Arc::new(MetarManager::for_test(vec![])))
    }

    #[tokio::test]
    async fn add_pilot_with_old_protocol_is_fatal() {
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (tx, mut rx) = make_channel();
        let mut logged_in = None;
        let line = b"#APN1AB:SERVER:100001:pw:1:8:0:Test Pilot";
        let outcome = dispatch_packet(line, &mut logged_in, &shared, &tx).await;
        assert!(outcome.close);
        assert!(!outcome.success);
        let reply = written(rx.try_recv().unwrap());
        assert!(reply.starts_with(b"$ERserver:unknown:010:"));
        assert!(logged_in.is_none());
    }

    #[tokio::test]
    async fn add_pilot_success_registers_and_broadcasts_motd() {
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (tx, mut rx) = make_channel();
        let mut logged_in = None;
        let line = b"#APN1AB:SERVER:100001:pw:1:9:0:Test Pilot";
        let outcome = dispatch_packet(line, &mut logged_in, &shared, &tx).await;
        assert!(outcome.success);
        assert!(logged_in.is_some());
        assert!(shared.registry.contains(b"N1AB"));

        // The add-broadcast excludes the sender (registry::matching()), so
        // N1AB's own channel only ever sees its MOTD here.
        let motd = written(rx.try_recv().unwrap());
        assert!(motd.starts_with(b"#TMserver:N1AB:FSDD"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn add_pilot_broadcast_reaches_other_connected_clients() {
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (observer_tx, mut observer_rx) = make_channel();
        let mut observer = None;
        dispatch_packet(b"#APN2CD:SERVER:100002:pw:1:9:0:Observer", &mut observer, &shared, &observer_tx).await;
        let _ = observer_rx.try_recv(); // MOTD for N2CD

        let (tx, _rx) = make_channel();
        let mut logged_in = None;
        let line = b"#APN1AB:SERVER:100001:pw:1:9:0:Test Pilot";
        let outcome = dispatch_packet(line, &mut logged_in, &shared, &tx).await;
        assert!(outcome.success);

        let broadcast_packet = written(observer_rx.try_recv().unwrap());
        assert!(broadcast_packet.starts_with(b"#APN1AB:SERVER:100001::1:1:0"));
    }

    #[tokio::test]
    async fn duplicate_callsign_is_rejected_without_closing() {
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (tx1, _rx1) = make_channel();
        let mut first = None;
        dispatch_packet(b"#APN1AB:SERVER:100001:pw:1:9:0:Pilot One", &mut first, &shared, &tx1).await;

        let (tx2, mut rx2) = make_channel();
        let mut second = None;
        let outcome = dispatch_packet(b"#APN1AB:SERVER:100002:pw:1:9:0:Pilot Two", &mut second, &shared, &tx2).await;
        assert!(!outcome.success);
        assert!(!outcome.close);
        assert!(second.is_none());
        let reply = written(rx2.try_recv().unwrap());
        assert!(reply.starts_with(b"$ERserver:unknown:001:"));
    }

    #[tokio::test]
    async fn unauthorized_credentials_close_the_connection() {
        let shared = shared_with_auth(LoginResult::Unauthorized);
        let (tx, mut rx) = make_channel();
        let mut logged_in = None;
        let outcome = dispatch_packet(b"#APN1AB:SERVER:100001:wrong:1:9:0:Test Pilot", &mut logged_in, &shared, &tx).await;
        assert!(outcome.close);
        let reply = written(rx.try_recv().unwrap());
        assert!(reply.starts_with(b"$ERserver:unknown:006:"));
    }

    #[tokio::test]
    async fn ping_server_is_answered_directly() {
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (tx, mut rx) = make_channel();
        let mut logged_in = None;
        dispatch_packet(b"#APN1AB:SERVER:100001:pw:1:9:0:Test Pilot", &mut logged_in, &shared, &tx).await;
        let _ = rx.try_recv(); // motd

        let outcome = dispatch_packet(b"$PIN1AB:SERVER", &mut logged_in, &shared, &tx).await;
        assert!(outcome.success);
        let pong = written(rx.try_recv().unwrap());
        assert!(pong.starts_with(b"$POserver:N1AB"));
    }

    #[tokio::test]
    async fn kill_below_rating_eleven_is_refused() {
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (killer_tx, mut killer_rx) = make_channel();
        let mut killer = None;
        dispatch_packet(b"#APN1AB:SERVER:100001:pw:1:9:0:Killer", &mut killer, &shared, &killer_tx).await;
        let _ = killer_rx.try_recv(); // motd

        let (victim_tx, _victim_rx) = make_channel();
        let mut victim = None;
        dispatch_packet(b"#APN2CD:SERVER:100002:pw:1:9:0:Victim", &mut victim, &shared, &victim_tx).await;

        let outcome = dispatch_packet(b"$!!N1AB:N2CD:too slow", &mut killer, &shared, &killer_tx).await;
        assert!(!outcome.success);
        let reply = written(killer_rx.try_recv().unwrap());
        assert!(reply.starts_with(b"#TMserver:N1AB:You are not allowed"));
        assert!(shared.registry.contains(b"N2CD"));
    }

    #[tokio::test]
    async fn cq_rn_uses_packet_field_not_requester_callsign() {
        // Preserves the historic oddity: since packet[1] must already equal
        // "SERVER" to reach this branch, the RN lookup can never resolve a
        // real client and always falls through to FAILED_WITHOUT_PACKET.
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (tx, mut rx) = make_channel();
        let mut logged_in = None;
        dispatch_packet(b"#APN1AB:SERVER:100001:pw:1:9:0:Test Pilot", &mut logged_in, &shared, &tx).await;
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        let outcome = dispatch_packet(b"$CQN1AB:SERVER:RN", &mut logged_in, &shared, &tx).await;
        assert!(!outcome.success);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn weather_request_without_any_fetcher_reports_no_such_weather() {
        let shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        let (tx, mut rx) = make_channel();
        let mut logged_in = None;
        dispatch_packet(b"#APN1AB:SERVER:100001:pw:1:9:0:Test Pilot", &mut logged_in, &shared, &tx).await;
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        let outcome = dispatch_packet(b"#WXN1AB:SERVER:KJFK", &mut logged_in, &shared, &tx).await;
        assert!(!outcome.success);
        let reply = written(rx.try_recv().unwrap());
        assert!(reply.starts_with(b"$ERserver:N1AB:009:"));
    }

    #[tokio::test]
    async fn weather_request_with_a_hit_replies_with_temp_wind_and_cloud_packets() {
        let metar = crate::weather::metar::parse("KJFK 121851Z 18010KT 10SM SCT030 18/12 A2992");
        let fetcher: Arc<dyn MetarFetcher> = Arc::new(StubMetarFetcher { metar: Some(metar) });
        let shared = shared_with_auth_and_metar(
            LoginResult::Authorized { rating: 5 },
            Arc::new(MetarManager::for_test(vec![fetcher])),
        );
        let (tx, mut rx) = make_channel();
        let mut logged_in = None;
        dispatch_packet(b"#APN1AB:SERVER:100001:pw:1:9:0:Test Pilot", &mut logged_in, &shared, &tx).await;
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        let outcome = dispatch_packet(b"#WXN1AB:SERVER:KJFK", &mut logged_in, &shared, &tx).await;
        assert!(outcome.success);

        let temp = written(rx.try_recv().unwrap());
        assert!(temp.starts_with(b"#TDserver:N1AB:"));
        let wind = written(rx.try_recv().unwrap());
        assert!(wind.starts_with(b"#WDserver:N1AB:"));
        let cloud = written(rx.try_recv().unwrap());
        assert!(cloud.starts_with(b"#CDserver:N1AB:"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_connection_login_and_idle_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        let mut shared = shared_with_auth(LoginResult::Authorized { rating: 5 });
        shared.idle_timeout = Duration::from_millis(80);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(stream, "test-peer".to_string(), shared).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"#APN1AB:SERVER:100001:pw:1:9:0:Test Pilot\r\n").await.unwrap();

        let mut response = Vec::new();
        let mut tmp = [0u8; 256];
        // read broadcast + motd, then wait for the idle timeout banner.
        loop {
            let n = client.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&tmp[..n]);
            if response.windows(b"# Timeout".len()).any(|w| w == b"# Timeout") {
                break;
            }
        }
        assert!(response.windows(b"# Timeout".len()).any(|w| w == b"# Timeout"));
        server.await.unwrap();
    }
}
