//! In-memory representation of a connected ATC or pilot client.
//!
//! Field order and defaults follow the historic FSD wire protocol closely
//! enough that anyone cross-checking behavior against it can follow along
//! field-by-field.

use std::time::{SystemTime, UNIX_EPOCH};

/// Latitude, longitude in degrees.
pub type Position = (f64, f64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Atc,
    Pilot,
}

/// A filed flight plan. `revision` starts at 0 and is bumped by
/// [`Client::update_plan`] on every refile.
#[derive(Debug, Clone)]
pub struct FlightPlan {
    pub revision: i64,
    pub plan_type: Vec<u8>,
    pub aircraft: Vec<u8>,
    pub tas_cruise: i64,
    pub dep_airport: Vec<u8>,
    pub dep_time: i64,
    pub actual_dep_time: i64,
    pub alt: Vec<u8>,
    pub dest_airport: Vec<u8>,
    pub hrs_enroute: i64,
    pub min_enroute: i64,
    pub hrs_fuel: i64,
    pub min_fuel: i64,
    pub alt_airport: Vec<u8>,
    pub remarks: Vec<u8>,
    pub route: Vec<u8>,
}

#[allow(clippy::too_many_arguments)]
impl FlightPlan {
    pub fn new(
        revision: i64,
        plan_type: Vec<u8>,
        aircraft: Vec<u8>,
        tas_cruise: i64,
        dep_airport: Vec<u8>,
        dep_time: i64,
        actual_dep_time: i64,
        alt: Vec<u8>,
        dest_airport: Vec<u8>,
        hrs_enroute: i64,
        min_enroute: i64,
        hrs_fuel: i64,
        min_fuel: i64,
        alt_airport: Vec<u8>,
        remarks: Vec<u8>,
        route: Vec<u8>,
    ) -> Self {
        Self {
            revision,
            plan_type,
            aircraft,
            tas_cruise,
            dep_airport,
            dep_time,
            actual_dep_time,
            alt,
            dest_airport,
            hrs_enroute,
            min_enroute,
            hrs_fuel,
            min_fuel,
            alt_airport,
            remarks,
            route,
        }
    }
}

/// A connected client's negotiated identity and last-known state.
#[derive(Debug, Clone)]
pub struct Client {
    pub client_type: ClientType,
    pub callsign: Vec<u8>,
    pub rating: i64,
    pub cid: String,
    pub protocol: i64,
    pub realname: Vec<u8>,
    pub sim_type: i64,
    pub position: Position,
    pub transponder: i64,
    pub altitude: i64,
    pub ground_speed: i64,
    pub frequency: i64,
    pub facility_type: i64,
    pub visual_range: i64,
    pub flags: i64,
    pub pbh: i64,
    pub flight_plan: Option<FlightPlan>,
    pub ident_flag: Option<bool>,
    pub start_time: u64,
    pub last_updated: u64,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Client {
    pub fn new(
        client_type: ClientType,
        callsign: Vec<u8>,
        rating: i64,
        cid: String,
        protocol: i64,
        realname: Vec<u8>,
        sim_type: i64,
    ) -> Self {
        let now = now_unix();
        Self {
            client_type,
            callsign,
            rating,
            cid,
            protocol,
            realname,
            sim_type,
            position: (0.0, 0.0),
            transponder: 0,
            altitude: 0,
            ground_speed: 0,
            frequency: 0,
            facility_type: 0,
            visual_range: 40,
            flags: 0,
            pbh: 0,
            flight_plan: None,
            ident_flag: None,
            start_time: now,
            last_updated: now,
        }
    }

    /// A client hasn't reported a usable position until it has moved off
    /// `(0, 0)` and is below the (deliberately generous) altitude ceiling
    /// FSD uses to flag garbage reports.
    pub fn position_ok(&self) -> bool {
        self.position != (0.0, 0.0) && self.altitude < 100_000
    }

    pub fn frequency_ok(&self) -> bool {
        self.frequency != 0 && self.frequency < 100_000
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_plan(
        &mut self,
        plan_type: Vec<u8>,
        aircraft: Vec<u8>,
        tas_cruise: i64,
        dep_airport: Vec<u8>,
        dep_time: i64,
        actual_dep_time: i64,
        alt: Vec<u8>,
        dest_airport: Vec<u8>,
        hrs_enroute: i64,
        min_enroute: i64,
        hrs_fuel: i64,
        min_fuel: i64,
        alt_airport: Vec<u8>,
        remarks: Vec<u8>,
        route: Vec<u8>,
    ) {
        let revision = match &self.flight_plan {
            Some(plan) => plan.revision + 1,
            None => 0,
        };
        self.flight_plan = Some(FlightPlan::new(
            revision,
            plan_type,
            aircraft,
            tas_cruise,
            dep_airport,
            dep_time,
            actual_dep_time,
            alt,
            dest_airport,
            hrs_enroute,
            min_enroute,
            hrs_fuel,
            min_fuel,
            alt_airport,
            remarks,
            route,
        ));
        self.last_updated = now_unix();
    }

    pub fn update_pilot_position(
        &mut self,
        transponder: i64,
        lat: f64,
        lon: f64,
        altitude: i64,
        ground_speed: i64,
        pbh: i64,
        flags: i64,
    ) {
        self.transponder = transponder;
        self.position = (lat, lon);
        self.altitude = altitude;
        self.ground_speed = ground_speed;
        self.pbh = pbh;
        self.flags = flags;
        self.last_updated = now_unix();
    }

    pub fn update_atc_position(
        &mut self,
        frequency: i64,
        facility_type: i64,
        visual_range: i64,
        lat: f64,
        lon: f64,
        altitude: i64,
    ) {
        self.frequency = frequency;
        self.facility_type = facility_type;
        self.visual_range = visual_range;
        self.position = (lat, lon);
        self.altitude = altitude;
        self.last_updated = now_unix();
    }

    /// Visibility range in nautical miles, used by broadcast checkers.
    /// ATC range depends on facility type; pilot range grows with altitude.
    pub fn range(&self) -> i64 {
        match self.client_type {
            ClientType::Atc => match self.facility_type {
                2 | 3 => 5,
                4 => 30,
                5 => 100,
                6 => 400,
                1 | 7 => 1500,
                _ => 40,
            },
            ClientType::Pilot => {
                let altitude = self.altitude.max(0) as f64;
                (10.0 + 1.414 * altitude.sqrt()) as i64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pilot() -> Client {
        Client::new(
            ClientType::Pilot,
            b"N1AB".to_vec(),
            1,
            "100001".into(),
            9,
            b"Test Pilot".to_vec(),
            0,
        )
    }

    #[test]
    fn fresh_client_position_not_ok() {
        let client = make_pilot();
        assert!(!client.position_ok());
    }

    #[test]
    fn position_ok_once_moved_off_origin_and_below_ceiling() {
        let mut client = make_pilot();
        client.update_pilot_position(1200, 51.5, -0.1, 5000, 120, 0, 0);
        assert!(client.position_ok());
        client.altitude = 200_000;
        assert!(!client.position_ok());
    }

    #[test]
    fn first_flight_plan_has_revision_zero_then_increments() {
        let mut client = make_pilot();
        assert!(client.flight_plan.is_none());
        client.update_plan(
            b"I".to_vec(),
            b"C172".to_vec(),
            110,
            b"KJFK".to_vec(),
            0,
            0,
            b"8000".to_vec(),
            b"KBOS".to_vec(),
            1,
            0,
            2,
            0,
            b"".to_vec(),
            b"".to_vec(),
            b"".to_vec(),
        );
        assert_eq!(client.flight_plan.as_ref().unwrap().revision, 0);
        client.update_plan(
            b"I".to_vec(),
            b"C172".to_vec(),
            110,
            b"KJFK".to_vec(),
            0,
            0,
            b"8000".to_vec(),
            b"KBOS".to_vec(),
            1,
            0,
            2,
            0,
            b"".to_vec(),
            b"".to_vec(),
            b"".to_vec(),
        );
        assert_eq!(client.flight_plan.as_ref().unwrap().revision, 1);
    }

    #[test]
    fn atc_range_follows_facility_type_table() {
        let mut client = Client::new(
            ClientType::Atc,
            b"LAX_TWR".to_vec(),
            5,
            "100002".into(),
            9,
            b"Tower".to_vec(),
            -1,
        );
        client.facility_type = 5;
        assert_eq!(client.range(), 100);
        client.facility_type = 99;
        assert_eq!(client.range(), 40);
    }

    #[test]
    fn pilot_range_grows_with_altitude() {
        let mut client = make_pilot();
        client.altitude = 0;
        assert_eq!(client.range(), 10);
        client.altitude = 10_000;
        assert!(client.range() > 10);
    }
}
