//! Visibility predicates controlling which connected clients receive a
//! broadcast or multicast packet.
//!
//! These reproduce the historic FSD network's broadcast rules bug-for-bug
//! - `all_pilot_checker` really does check for ATC, and that's preserved
//! deliberately rather than "fixed", since a fix would silently change
//! on-the-wire behavior for clients that depend on it.

use crate::client::{Client, ClientType};
use crate::geo::haversine_distance_nm;

/// Predicate deciding whether `to` should receive a packet sent `from`.
pub type BroadcastChecker = fn(from: &Client, to: &Client) -> bool;

/// `*` - deliver to every client, no filtering at all.
pub fn always_checker(_from: &Client, _to: &Client) -> bool {
    true
}

/// `*A` - deliver to ATC clients only.
///
/// Note: `*P` is wired to this same predicate (a long-standing quirk of
/// the historic broadcast logic), so pilot-directed multicasts have always
/// reached only ATC. Reproduced here unchanged.
pub fn all_atc_checker(_from: &Client, to: &Client) -> bool {
    to.client_type == ClientType::Atc
}

/// `*P` - nominally "all pilots", actually identical to [`all_atc_checker`].
pub fn all_pilot_checker(_from: &Client, to: &Client) -> bool {
    to.client_type == ClientType::Atc
}

/// `@` - deliver within `from`'s own visibility range, using `from`'s
/// range rather than `to`'s (this is a directed, not mutual, check).
pub fn at_checker(from: &Client, to: &Client) -> bool {
    if !from.position_ok() || !to.position_ok() {
        return false;
    }
    let distance = haversine_distance_nm(from.position.0, from.position.1, to.position.0, to.position.1);
    distance < from.range() as f64
}

/// Used for `#TM` (text message) multicasts: pilot-to-pilot ranges add
/// together, anything involving ATC uses the larger of the two ranges.
pub fn broadcast_message_checker(from: &Client, to: &Client) -> bool {
    create_range_checker(combined_range_for_message)(from, to)
}

fn combined_range_for_message(from: &Client, to: &Client) -> i64 {
    if from.client_type == ClientType::Pilot && to.client_type == ClientType::Pilot {
        from.range() + to.range()
    } else {
        from.range().max(to.range())
    }
}

/// Used for position-update broadcasts (`@`/`%` packets): ATC's own
/// visual range wins when the recipient is ATC, pilot-to-pilot ranges
/// add together, otherwise the larger range wins.
pub fn broadcast_position_checker(from: &Client, to: &Client) -> bool {
    create_range_checker(combined_range_for_position)(from, to)
}

fn combined_range_for_position(from: &Client, to: &Client) -> i64 {
    if to.client_type == ClientType::Atc {
        to.visual_range
    } else if from.client_type == ClientType::Pilot {
        from.range() + to.range()
    } else {
        from.range().max(to.range())
    }
}

/// Build a checker out of a visual-range function: both ends must have a
/// usable position and be within the computed range of each other.
fn create_range_checker(range_fn: fn(&Client, &Client) -> i64) -> impl Fn(&Client, &Client) -> bool {
    move |from, to| {
        if !from.position_ok() || !to.position_ok() {
            return false;
        }
        let distance = haversine_distance_nm(from.position.0, from.position.1, to.position.0, to.position.1);
        distance < range_fn(from, to) as f64
    }
}

/// `*`/`*A`/`*P`/`@...` - the set of multicast addressing forms a
/// callsign field can take instead of naming a specific client.
pub fn is_multicast(callsign: &str) -> bool {
    callsign == "*" || callsign == "*A" || callsign == "*P" || callsign.starts_with('@')
}

/// Conjunction of checkers: every one must pass. Used to combine a
/// range/visibility checker with an additional constraint supplied by a
/// packet handler (e.g. "and only ATC clients").
pub fn all_of<'a>(checkers: &'a [BroadcastChecker]) -> impl Fn(&Client, &Client) -> bool + 'a {
    move |from, to| checkers.iter().all(|check| check(from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientType;

    fn atc(lat: f64, lon: f64, facility_type: i64) -> Client {
        let mut c = Client::new(ClientType::Atc, b"LAX_TWR".to_vec(), 5, "1".into(), 9, b"".to_vec(), -1);
        c.facility_type = facility_type;
        c.update_atc_position(12345, facility_type, 40, lat, lon, 0);
        c
    }

    fn pilot(lat: f64, lon: f64, altitude: i64) -> Client {
        let mut c = Client::new(ClientType::Pilot, b"N1AB".to_vec(), 1, "2".into(), 9, b"".to_vec(), 0);
        c.update_pilot_position(1200, lat, lon, altitude, 100, 0, 0);
        c
    }

    #[test]
    fn all_pilot_checker_actually_matches_atc_only() {
        let from = pilot(0.0, 0.0, 1000);
        let atc_to = atc(0.0, 0.0, 5);
        let pilot_to = pilot(0.0, 0.0, 1000);
        assert!(all_pilot_checker(&from, &atc_to));
        assert!(!all_pilot_checker(&from, &pilot_to));
    }

    #[test]
    fn at_checker_uses_senders_range_only() {
        let big_range_from = atc(0.0, 0.0, 6); // range 400
        let near_to = pilot(0.1, 0.1, 0);
        assert!(at_checker(&big_range_from, &near_to));
    }

    #[test]
    fn position_required_on_both_ends() {
        let from = pilot(0.0, 0.0, 1000);
        let mut to = pilot(1.0, 1.0, 1000);
        to.position = (0.0, 0.0);
        assert!(!broadcast_position_checker(&from, &to));
    }

    #[test]
    fn multicast_forms_recognized() {
        assert!(is_multicast("*"));
        assert!(is_multicast("*A"));
        assert!(is_multicast("*P"));
        assert!(is_multicast("@N1AB"));
        assert!(!is_multicast("N1AB"));
    }

    #[test]
    fn pilot_to_pilot_message_ranges_add_together() {
        let from = pilot(0.0, 0.0, 0); // range 10
        let to = pilot(0.0, 0.3, 0); // ~18nm away, range 10
        assert!(!at_checker(&from, &to)); // at_checker alone (range 10) fails
        assert!(broadcast_message_checker(&from, &to)); // combined range 20 passes
    }
}
