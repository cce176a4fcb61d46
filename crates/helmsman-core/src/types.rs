//! Process identity and locality types shared across the workspace.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Stable identifier of an OS process.
///
/// Assigned once per process directory and reused across reboots, so the
/// controller can correlate re-registrations of the same process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(String);

impl ProcessId {
    /// Creates a new process ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Datacenter identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DcId(String);

impl DcId {
    /// Creates a new datacenter ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DcId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The locality attributes a replication policy may quorum over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalityScope {
    /// Individual process.
    Process,
    /// Physical machine; several processes may share one.
    Machine,
    /// Failure zone (typically a rack).
    Zone,
    /// Data hall within a datacenter.
    DataHall,
    /// Datacenter.
    Datacenter,
}

/// Where a process runs: datacenter, data hall, zone, machine.
///
/// Every worker announces its locality at registration; the recruiter and
/// the replication policies never look at anything else when spreading
/// roles across failure domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locality {
    /// Stable process identifier.
    pub process_id: ProcessId,
    /// Machine identifier, if declared.
    pub machine_id: Option<String>,
    /// Failure-zone identifier, if declared.
    pub zone_id: Option<String>,
    /// Data-hall identifier, if declared.
    pub data_hall_id: Option<String>,
    /// Datacenter identifier, if declared.
    pub dc_id: Option<DcId>,
}

impl Locality {
    /// Creates a locality with only a process ID set.
    pub fn new(process_id: impl Into<ProcessId>) -> Self {
        Self {
            process_id: process_id.into(),
            machine_id: None,
            zone_id: None,
            data_hall_id: None,
            dc_id: None,
        }
    }

    /// Sets the machine ID.
    #[must_use]
    pub fn with_machine(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    /// Sets the zone ID.
    #[must_use]
    pub fn with_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    /// Sets the data-hall ID.
    #[must_use]
    pub fn with_data_hall(mut self, data_hall_id: impl Into<String>) -> Self {
        self.data_hall_id = Some(data_hall_id.into());
        self
    }

    /// Sets the datacenter ID.
    #[must_use]
    pub fn with_dc(mut self, dc_id: impl Into<DcId>) -> Self {
        self.dc_id = Some(dc_id.into());
        self
    }

    /// Returns the value of the given attribute, if declared.
    pub fn get(&self, scope: LocalityScope) -> Option<&str> {
        match scope {
            LocalityScope::Process => Some(self.process_id.as_str()),
            LocalityScope::Machine => self.machine_id.as_deref(),
            LocalityScope::Zone => self.zone_id.as_deref(),
            LocalityScope::DataHall => self.data_hall_id.as_deref(),
            LocalityScope::Datacenter => self.dc_id.as_ref().map(DcId::as_str),
        }
    }
}

/// An operator-declared exclusion: a whole IP or a single `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressExclusion {
    /// Excluded IP address.
    pub ip: std::net::IpAddr,
    /// Excluded port; `None` excludes every process on the IP.
    pub port: Option<u16>,
}

impl AddressExclusion {
    /// Excludes every process on the given IP.
    pub fn ip(ip: std::net::IpAddr) -> Self {
        Self { ip, port: None }
    }

    /// Excludes a single process address.
    pub fn address(addr: SocketAddr) -> Self {
        Self { ip: addr.ip(), port: Some(addr.port()) }
    }

    /// Returns true if the exclusion covers `addr`.
    pub fn excludes(&self, addr: SocketAddr) -> bool {
        self.ip == addr.ip() && self.port.is_none_or(|p| p == addr.port())
    }
}

/// Monotonic wall-clock in seconds, anchored at an arbitrary epoch.
///
/// Components that reason about elapsed time (grace windows, request ages)
/// take `f64` timestamps from a shared clock so tests can reason about
/// offsets without sleeping.
#[derive(Debug, Clone)]
pub struct Clock(std::time::Instant);

impl Clock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Self {
        Self(std::time::Instant::now())
    }

    /// Seconds elapsed since the clock was created.
    pub fn now(&self) -> f64 {
        self.0.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locality_get() {
        let loc = Locality::new("p1").with_zone("z1").with_dc("dc1").with_data_hall("h1");
        assert_eq!(loc.get(LocalityScope::Process), Some("p1"));
        assert_eq!(loc.get(LocalityScope::Zone), Some("z1"));
        assert_eq!(loc.get(LocalityScope::Datacenter), Some("dc1"));
        assert_eq!(loc.get(LocalityScope::DataHall), Some("h1"));
        assert_eq!(loc.get(LocalityScope::Machine), None);
    }

    #[test]
    fn test_address_exclusion() {
        let addr: SocketAddr = "10.0.0.1:4500".parse().unwrap();
        let other: SocketAddr = "10.0.0.1:4501".parse().unwrap();
        let elsewhere: SocketAddr = "10.0.0.2:4500".parse().unwrap();

        let by_ip = AddressExclusion::ip(addr.ip());
        assert!(by_ip.excludes(addr));
        assert!(by_ip.excludes(other));
        assert!(!by_ip.excludes(elsewhere));

        let by_addr = AddressExclusion::address(addr);
        assert!(by_addr.excludes(addr));
        assert!(!by_addr.excludes(other));
    }

    #[test]
    fn test_clock_monotone() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
