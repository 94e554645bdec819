//! Zone and VNIC inventories, parsed from colon-delimited command output.
//!
//! - `zoneadm list -cp` prints `zoneid:zonename:state:zonepath:uuid:brand:ip-type:debugid`
//! - `dladm show-vnic -po link,zone,over,speed` prints `link:zone:over:speed`
//!
//! Malformed lines are skipped. When two lines have the same name, the last one wins.

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Number of fields in a line of `zoneadm list -p`.
pub const ZONE_FIELDS: usize = 8;
/// Number of fields in a line of `dladm show-vnic -po link,zone,over,speed`.
pub const VNIC_FIELDS: usize = 4;

/// Placeholder printed in the first field when the entity is not active, e.g. the id of an installed zone.
const INACTIVE: &str = "-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("record {name:?} is not active")]
    Inactive { name: String },
}

/// A zone, as described by `zoneadm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: i32,
    pub name: String,
    pub state: String,
    pub path: String,
    pub uuid: String,
    pub brand: String,
    pub ip_type: String,
    pub debug_id: i32,
}

/// A VNIC, as described by `dladm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vnic {
    pub name: String,
    pub zone: String,
    /// The physical link over which the VNIC is built.
    pub link: String,
    /// Speed in Mbit/s.
    pub speed: u64,
}

/// Splits `line` on `:` and checks that it has exactly `expected` fields
/// and that the first one is not the "inactive" placeholder `-`.
pub fn split_record(line: &str, expected: usize) -> Result<Vec<&str>, RecordError> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != expected {
        return Err(RecordError::FieldCount {
            expected,
            found: fields.len(),
        });
    }
    if fields[0] == INACTIVE {
        let name = fields.get(1).copied().unwrap_or_default().to_owned();
        return Err(RecordError::Inactive { name });
    }
    Ok(fields)
}

/// Parses one line of `zoneadm list -p`.
///
/// Numeric ids that cannot be parsed are read as 0.
pub fn parse_zone_line(line: &str) -> Result<Zone, RecordError> {
    let f = split_record(line, ZONE_FIELDS)?;
    Ok(Zone {
        id: f[0].parse().unwrap_or_default(),
        name: f[1].to_owned(),
        state: f[2].to_owned(),
        path: f[3].to_owned(),
        uuid: f[4].to_owned(),
        brand: f[5].to_owned(),
        ip_type: f[6].to_owned(),
        debug_id: f[7].parse().unwrap_or_default(),
    })
}

/// Parses one line of `dladm show-vnic -po link,zone,over,speed`.
///
/// A speed that cannot be parsed is read as 0.
pub fn parse_vnic_line(line: &str) -> Result<Vnic, RecordError> {
    let f = split_record(line, VNIC_FIELDS)?;
    Ok(Vnic {
        name: f[0].to_owned(),
        zone: f[1].to_owned(),
        link: f[2].to_owned(),
        speed: f[3].parse().unwrap_or_default(),
    })
}

/// Maps zone names to zones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneMap(FxHashMap<String, Zone>);

/// Maps VNIC names to VNICs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VnicMap(FxHashMap<String, Vnic>);

/// Parses the whole output of `zoneadm list -cp`.
pub fn parse_zones(raw: &str) -> ZoneMap {
    let mut zones = FxHashMap::default();
    for line in raw.lines() {
        match parse_zone_line(line) {
            Ok(zone) => {
                zones.insert(zone.name.clone(), zone);
            }
            Err(e) => log::trace!("skipping zoneadm line {line:?}: {e}"),
        }
    }
    ZoneMap(zones)
}

/// Parses the whole output of `dladm show-vnic -po link,zone,over,speed`.
pub fn parse_vnics(raw: &str) -> VnicMap {
    let mut vnics = FxHashMap::default();
    for line in raw.lines() {
        match parse_vnic_line(line) {
            Ok(vnic) => {
                vnics.insert(vnic.name.clone(), vnic);
            }
            Err(e) => log::trace!("skipping dladm line {line:?}: {e}"),
        }
    }
    VnicMap(vnics)
}

impl ZoneMap {
    pub fn get(&self, name: &str) -> Option<&Zone> {
        self.0.get(name)
    }

    /// Returns the names of the zones, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Finds a zone by id, for kstats whose instance is the zone id.
    pub fn zone_by_id(&self, id: i32) -> Option<&Zone> {
        self.0.values().find(|z| z.id == id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl VnicMap {
    pub fn get(&self, name: &str) -> Option<&Vnic> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ZONEADM_OUTPUT: &str = "0:global:running:/::ipkg:shared:0
42:cube-media:running:/zones/cube-media:c624d04f-d0d9-e1e6-822e-acebc78ec9ff:lipkg:excl:128
44:cube-ws:installed:/zones/cube-ws:0f9c56f4-9810-6d45-f801-d34bf27cc13f:pkgsrc:excl:179
-:cube-build:installed:/zones/cube-build:1a2b3c4d-0000-1111-2222-333344445555:lipkg:excl:0";

    #[test]
    fn parse_global_zone() {
        let zone = parse_zone_line("0:global:running:/::ipkg:shared:0").unwrap();
        assert_eq!(
            zone,
            Zone {
                id: 0,
                name: "global".to_owned(),
                state: "running".to_owned(),
                path: "/".to_owned(),
                uuid: String::new(),
                brand: "ipkg".to_owned(),
                ip_type: "shared".to_owned(),
                debug_id: 0,
            }
        );
    }

    #[test]
    fn reject_inactive_and_malformed_records() {
        assert_eq!(
            parse_zone_line("-:x:installed:/zones/x:uuid:lipkg:excl:0"),
            Err(RecordError::Inactive { name: "x".to_owned() })
        );
        assert_eq!(
            parse_zone_line("1:x:running"),
            Err(RecordError::FieldCount { expected: 8, found: 3 })
        );
        assert_eq!(
            parse_zone_line(""),
            Err(RecordError::FieldCount { expected: 8, found: 1 })
        );
        assert_eq!(
            parse_vnic_line("a:b:c:d:e"),
            Err(RecordError::FieldCount { expected: 4, found: 5 })
        );
    }

    #[test]
    fn parse_zone_map() {
        let zones = parse_zones(ZONEADM_OUTPUT);
        assert_eq!(zones.len(), 3);
        assert_eq!(zones.names(), vec!["cube-media", "cube-ws", "global"]);
        assert_eq!(zones.zone_by_id(42).map(|z| z.brand.as_str()), Some("lipkg"));
        assert_eq!(zones.get("cube-ws").map(|z| z.debug_id), Some(179));
        assert!(zones.zone_by_id(7).is_none());
        assert!(zones.get("cube-build").is_none());
    }

    #[test]
    fn last_duplicate_wins() {
        let raw = "3:dup:running:/zones/a:u1:lipkg:excl:1\n4:dup:running:/zones/b:u2:lipkg:excl:2";
        let zones = parse_zones(raw);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones.get("dup").map(|z| z.id), Some(4));
    }

    #[test]
    fn lenient_numbers() {
        let zone = parse_zone_line("x:odd:running:/zones/odd:u:lipkg:excl:y").unwrap();
        assert_eq!(zone.id, 0);
        assert_eq!(zone.debug_id, 0);
    }

    #[test]
    fn parse_vnic_map() {
        let raw = "dns_net0:dns:rge0:1000\nwww_net0:www:rge0:1000\nbroken\nfast0:build:ixgbe0:10000";
        let vnics = parse_vnics(raw);
        assert_eq!(vnics.len(), 3);
        assert_eq!(
            vnics.get("fast0"),
            Some(&Vnic {
                name: "fast0".to_owned(),
                zone: "build".to_owned(),
                link: "ixgbe0".to_owned(),
                speed: 10000,
            })
        );
        assert!(parse_vnics("").is_empty());
    }
}
