//! Position beacon collaborator.
//!
//! Location check-ins can be re-broadcast to a third-party position network
//! under an alias derived from the device's radio callsign. The integration
//! itself lives outside this crate; the daemon only sees this trait.

/// Input of one beacon report.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub device_id: String,
    pub device_name: String,
    pub radio_id: String,
    /// Alias assigned by a previous report, if any.
    pub previous_alias: Option<String>,
    pub icon: String,
}

pub trait BeaconReporter: Send + Sync {
    /// Report a position and return the alias to store against the device.
    ///
    /// Implementations swallow their own failures and return
    /// `previous_alias` unchanged.
    fn report(&self, request: &BeaconRequest) -> Option<String>;
}

/// Reporter used when no beacon integration is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBeacon;

impl BeaconReporter for DisabledBeacon {
    fn report(&self, request: &BeaconRequest) -> Option<String> {
        request.previous_alias.clone()
    }
}
