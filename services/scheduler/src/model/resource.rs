//! Resources and offers.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Sub};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-9;

/// Scalar resources of a task, pod, offer or node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cpus: f64,
    /// Memory in MiB.
    pub mem: f64,
    /// Disk in MiB.
    pub disk: f64,
    #[serde(default)]
    pub gpus: f64,
}

impl Resource {
    pub fn new(cpus: f64, mem: f64, disk: f64) -> Self {
        Self {
            cpus,
            mem,
            disk,
            gpus: 0.0,
        }
    }

    /// Whether every component of `self` is at most the one in `available`.
    pub fn fits_in(&self, available: &Resource) -> bool {
        self.cpus <= available.cpus + EPSILON
            && self.mem <= available.mem + EPSILON
            && self.disk <= available.disk + EPSILON
            && self.gpus <= available.gpus + EPSILON
    }

    pub fn is_zero(&self) -> bool {
        self.cpus.abs() < EPSILON
            && self.mem.abs() < EPSILON
            && self.disk.abs() < EPSILON
            && self.gpus.abs() < EPSILON
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        Resource {
            cpus: self.cpus + rhs.cpus,
            mem: self.mem + rhs.mem,
            disk: self.disk + rhs.disk,
            gpus: self.gpus + rhs.gpus,
        }
    }
}

impl AddAssign for Resource {
    fn add_assign(&mut self, rhs: Resource) {
        *self = *self + rhs;
    }
}

/// Component-wise subtraction, floored at zero.
impl Sub for Resource {
    type Output = Resource;

    fn sub(self, rhs: Resource) -> Resource {
        Resource {
            cpus: (self.cpus - rhs.cpus).max(0.0),
            mem: (self.mem - rhs.mem).max(0.0),
            disk: (self.disk - rhs.disk).max(0.0),
            gpus: (self.gpus - rhs.gpus).max(0.0),
        }
    }
}

impl std::iter::Sum for Resource {
    fn sum<I: Iterator<Item = Resource>>(iter: I) -> Resource {
        iter.fold(Resource::default(), Add::add)
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u32,
    pub end: u32,
}

impl PortRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.begin {
            0
        } else {
            (self.end - self.begin) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u32) -> bool {
        port >= self.begin && port <= self.end
    }
}

/// Resources advertised by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Identifier assigned by the resource manager.
    pub id: String,

    /// Pool-local, monotonically increasing identifier. Zero until pooled.
    #[serde(default)]
    pub pool_id: u64,

    pub agent_id: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ip: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub resources: Resource,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    pub received_at: DateTime<Utc>,

    /// Resources on this agent committed in place but not yet reflected in the offer.
    #[serde(default)]
    pub delta: Resource,
}

impl Offer {
    /// Resources usable by a new placement.
    pub fn available(&self) -> Resource {
        self.resources - self.delta
    }

    pub fn port_count(&self) -> usize {
        self.ports.iter().map(PortRange::len).sum()
    }

    /// Attribute value used by placement constraints; `hostname` is implicit.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        if name == "hostname" {
            return Some(&self.hostname);
        }
        if name == "agentip" {
            return self.agent_ip.as_deref();
        }
        self.attributes.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_in() {
        let need = Resource::new(0.5, 256.0, 0.0);
        assert!(need.fits_in(&Resource::new(0.5, 256.0, 10.0)));
        assert!(!need.fits_in(&Resource::new(0.4, 1024.0, 10.0)));
    }

    #[test]
    fn test_sub_floors_at_zero() {
        let r = Resource::new(1.0, 100.0, 0.0) - Resource::new(2.0, 50.0, 1.0);
        assert_eq!(r, Resource::new(0.0, 50.0, 0.0));
    }

    #[test]
    fn test_port_range_len() {
        assert_eq!(PortRange::new(31000, 31009).len(), 10);
        assert!(PortRange::new(5, 4).is_empty());
    }

    #[test]
    fn test_offer_available_subtracts_delta() {
        let offer = Offer {
            id: "o1".into(),
            pool_id: 0,
            agent_id: "a1".into(),
            hostname: "node-1".into(),
            agent_ip: None,
            attributes: BTreeMap::from([("rack".to_string(), "r1".to_string())]),
            resources: Resource::new(4.0, 4096.0, 1000.0),
            ports: vec![PortRange::new(31000, 31001)],
            received_at: Utc::now(),
            delta: Resource::new(1.0, 1024.0, 0.0),
        };
        assert_eq!(offer.available(), Resource::new(3.0, 3072.0, 1000.0));
        assert_eq!(offer.attribute("hostname"), Some("node-1"));
        assert_eq!(offer.attribute("rack"), Some("r1"));
        assert_eq!(offer.port_count(), 2);
    }
}
