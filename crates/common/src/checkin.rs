//! Helpers the HTTP check-in layer calls into.

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::beacon::{BeaconReporter, BeaconRequest};
use crate::registry::{DeviceEntry, DeviceRegistry};
use crate::tasks::TaskStore;
use crate::unix_now;

pub const DEFAULT_BEACON_ICON: &str = "Q";

#[derive(Debug, Error, PartialEq)]
pub enum CheckInError {
    #[error("check-in carries no device id")]
    MissingDeviceId,

    #[error("location ({latitude}, {longitude}) is not a valid fix")]
    InvalidFix { latitude: f64, longitude: f64 },

    #[error("unknown device {0}")]
    UnknownDevice(String),
}

fn device_key(device_id: &str) -> Result<&str, CheckInError> {
    let trimmed = device_id.trim();
    if trimmed.is_empty() {
        Err(CheckInError::MissingDeviceId)
    } else {
        Ok(trimmed)
    }
}

/// Merge a check-in report into the registry, stamping `update_time`.
pub fn record_check_in(
    registry: &DeviceRegistry,
    device_id: &str,
    mut fields: DeviceEntry,
) -> Result<(), CheckInError> {
    let id = device_key(device_id)?;
    fields.insert("update_time".into(), json!(unix_now()));
    registry.merge(id, fields);
    debug!(device = %id, "check-in recorded");
    Ok(())
}

/// Device login: a device seen for the first time gets the default tasks.
pub fn register_login(tasks: &TaskStore, device_id: &str) -> Result<bool, CheckInError> {
    let id = device_key(device_id)?;
    let added = tasks.add_default_tasks(id);
    if added {
        info!(device = %id, "new device, default tasks added");
    }
    Ok(added)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// Store a location fix and forward it to the beacon collaborator.
///
/// The beacon call runs without the registry lock. Returns the alias now
/// stored against the device, if any.
pub fn record_location(
    registry: &DeviceRegistry,
    beacon: &dyn BeaconReporter,
    device_id: &str,
    location: Location,
) -> Result<Option<String>, CheckInError> {
    let id = device_key(device_id)?;
    if location.latitude == 0.0 && location.longitude == 0.0 {
        return Err(CheckInError::InvalidFix {
            latitude: location.latitude,
            longitude: location.longitude,
        });
    }

    let entry = registry.get(id);
    let previous = entry.get("location");
    let request = BeaconRequest {
        latitude: location.latitude,
        longitude: location.longitude,
        device_id: id.to_string(),
        device_name: text_at(&entry, &["deviceInfo", "wholeInfo", "alias"]),
        radio_id: text_at(&entry, &["deviceInfo", "nbInfo", "issiRadioId"]),
        previous_alias: previous
            .and_then(|loc| loc.get("aprs_ssid"))
            .and_then(Value::as_str)
            .filter(|alias| !alias.is_empty())
            .map(str::to_string),
        icon: previous
            .and_then(|loc| loc.get("aprs_icon"))
            .and_then(Value::as_str)
            .filter(|icon| !icon.is_empty())
            .unwrap_or(DEFAULT_BEACON_ICON)
            .to_string(),
    };

    let alias = beacon.report(&request).filter(|alias| !alias.is_empty());

    let now = unix_now();
    let mut stored = json!({
        "latitude": location.latitude,
        "longitude": location.longitude,
        "altitude": location.altitude,
        "update_time": now,
    });
    if let (Some(alias), Value::Object(fields)) = (&alias, &mut stored) {
        fields.insert("aprs_ssid".into(), json!(alias));
        fields.insert("aprs_icon".into(), json!(request.icon));
    }

    registry.update(id, |entry| {
        entry.insert("location".into(), stored);
        entry.insert("update_time".into(), json!(now));
    });
    debug!(device = %id, alias = ?alias, "location recorded");
    Ok(alias)
}

/// Override the beacon alias and icon stored against a known device.
///
/// The `location` object is created when the device has never reported one;
/// its other fields are left as they are.
pub fn set_beacon_alias(
    registry: &DeviceRegistry,
    device_id: &str,
    alias: &str,
    icon: Option<&str>,
) -> Result<(), CheckInError> {
    let id = device_key(device_id)?;
    if !registry.contains(id) {
        return Err(CheckInError::UnknownDevice(id.to_string()));
    }
    let icon = icon
        .map(str::trim)
        .filter(|icon| !icon.is_empty())
        .unwrap_or(DEFAULT_BEACON_ICON);

    registry.update(id, |entry| {
        let location = entry
            .entry("location")
            .or_insert_with(|| Value::Object(Default::default()));
        if !location.is_object() {
            *location = Value::Object(Default::default());
        }
        if let Value::Object(fields) = location {
            fields.insert("aprs_ssid".into(), json!(alias));
            fields.insert("aprs_icon".into(), json!(icon));
        }
    });
    info!(device = %id, alias = %alias, icon = %icon, "beacon alias changed");
    Ok(())
}

fn text_at(entry: &DeviceEntry, path: &[&str]) -> String {
    let Some((first, rest)) = path.split_first() else {
        return String::new();
    };
    let mut cursor = entry.get(*first);
    for key in rest {
        cursor = cursor.and_then(|value| value.get(*key));
    }
    match cursor {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::DisabledBeacon;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingBeacon {
        seen: Mutex<Vec<BeaconRequest>>,
        answer: Option<String>,
    }

    impl BeaconReporter for RecordingBeacon {
        fn report(&self, request: &BeaconRequest) -> Option<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.answer.clone().or_else(|| request.previous_alias.clone())
        }
    }

    fn fields(value: Value) -> DeviceEntry {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn check_in_stamps_update_time() {
        let dir = tempdir().unwrap();
        let registry = DeviceRegistry::open(dir.path().join("d.json"));

        record_check_in(&registry, " dev-1 ", fields(json!({"sn": "X"}))).unwrap();
        let entry = registry.get("dev-1");
        assert_eq!(entry["sn"], "X");
        assert!(entry["update_time"].as_i64().unwrap() > 0);

        assert_eq!(
            record_check_in(&registry, "  ", DeviceEntry::new()),
            Err(CheckInError::MissingDeviceId)
        );
    }

    #[test]
    fn null_island_fix_is_rejected() {
        let dir = tempdir().unwrap();
        let registry = DeviceRegistry::open(dir.path().join("d.json"));
        let fix = Location {
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
        };
        assert!(matches!(
            record_location(&registry, &DisabledBeacon, "dev-1", fix),
            Err(CheckInError::InvalidFix { .. })
        ));
        assert!(!registry.contains("dev-1"));
    }

    #[test]
    fn location_feeds_beacon_and_stores_alias() {
        let dir = tempdir().unwrap();
        let registry = DeviceRegistry::open(dir.path().join("d.json"));
        registry.merge(
            "dev-1",
            fields(json!({
                "sn": "keep-me",
                "deviceInfo": {"wholeInfo": {"alias": "Truck 7"}, "nbInfo": {"issiRadioId": 4601234}},
                "location": {"aprs_ssid": "BG7-1", "aprs_icon": ">"}
            })),
        );
        let beacon = RecordingBeacon {
            seen: Mutex::new(Vec::new()),
            answer: Some("BG7-2".into()),
        };

        let fix = Location {
            latitude: 22.5,
            longitude: 114.1,
            altitude: Some(12.0),
        };
        let alias = record_location(&registry, &beacon, "dev-1", fix).unwrap();
        assert_eq!(alias.as_deref(), Some("BG7-2"));

        let seen = beacon.seen.lock().unwrap();
        assert_eq!(seen[0].device_name, "Truck 7");
        assert_eq!(seen[0].radio_id, "4601234");
        assert_eq!(seen[0].previous_alias.as_deref(), Some("BG7-1"));
        assert_eq!(seen[0].icon, ">");

        let entry = registry.get("dev-1");
        assert_eq!(entry["sn"], "keep-me");
        assert_eq!(entry["location"]["latitude"], 22.5);
        assert_eq!(entry["location"]["aprs_ssid"], "BG7-2");
        assert_eq!(entry["location"]["aprs_icon"], ">");
    }

    #[test]
    fn disabled_beacon_keeps_previous_alias() {
        let dir = tempdir().unwrap();
        let registry = DeviceRegistry::open(dir.path().join("d.json"));
        let fix = Location {
            latitude: 1.0,
            longitude: 2.0,
            altitude: None,
        };

        assert_eq!(record_location(&registry, &DisabledBeacon, "dev-1", fix).unwrap(), None);
        let location = &registry.get("dev-1")["location"];
        assert!(location.get("aprs_ssid").is_none());
        assert_eq!(location["altitude"], Value::Null);
    }

    #[test]
    fn beacon_alias_override() {
        let dir = tempdir().unwrap();
        let registry = DeviceRegistry::open(dir.path().join("d.json"));
        registry.merge(
            "dev-1",
            fields(json!({"location": {"latitude": 3.0, "aprs_ssid": "OLD-1", "aprs_icon": ">"}})),
        );
        registry.merge("dev-2", fields(json!({"sn": "B"})));

        set_beacon_alias(&registry, "dev-1", "NEW-9", Some("k")).unwrap();
        let location = &registry.get("dev-1")["location"];
        assert_eq!(location["aprs_ssid"], "NEW-9");
        assert_eq!(location["aprs_icon"], "k");
        assert_eq!(location["latitude"], 3.0);

        // No location yet: one is created, icon falls back to the default.
        set_beacon_alias(&registry, "dev-2", "B-1", None).unwrap();
        let entry = registry.get("dev-2");
        assert_eq!(entry["location"]["aprs_ssid"], "B-1");
        assert_eq!(entry["location"]["aprs_icon"], DEFAULT_BEACON_ICON);
        assert_eq!(entry["sn"], "B");

        assert_eq!(
            set_beacon_alias(&registry, "dev-404", "X", None),
            Err(CheckInError::UnknownDevice("dev-404".into()))
        );
        assert!(!registry.contains("dev-404"));
    }

    #[test]
    fn login_assigns_defaults_once() {
        let dir = tempdir().unwrap();
        let mut doc = crate::tasks::TaskDocument::default();
        doc.templates.insert(
            "locate".into(),
            crate::tasks::TaskTemplate::new("locate", json!({})),
        );
        doc.default_tasks.push(crate::tasks::DefaultTask::new("locate", 60));
        let tasks = TaskStore::with_document(&dir.path().join("t.json"), doc);

        assert_eq!(register_login(&tasks, "dev-1"), Ok(true));
        assert_eq!(register_login(&tasks, "dev-1"), Ok(false));
        assert_eq!(register_login(&tasks, ""), Err(CheckInError::MissingDeviceId));
    }
}
