//! Resource fit and placement constraints.
//!
//! Placement is first-fit: the engine walks the offer pool and takes the first
//! offer this module accepts.

use regex::Regex;
use tracing::warn;

use crate::model::{Constraint, ConstraintOp, Offer, Resource, TaskGroup};

/// What a pod needs from an offer.
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    pub resources: Resource,
    pub ports: usize,
    pub constraints: &'a [Constraint],
    /// Other live pods of the same application.
    pub peers: &'a [TaskGroup],
    /// Only this host is acceptable while a retention window is open.
    pub retain_host: Option<&'a str>,
}

/// Why an offer was not taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Resources,
    Ports { needed: usize, available: usize },
    Constraint { attribute: String, op: ConstraintOp },
    HostRetention,
}

/// Checks one offer against a request.
pub fn check(request: &PlacementRequest<'_>, offer: &Offer) -> Result<(), Rejection> {
    if let Some(host) = request.retain_host {
        if offer.hostname != host {
            return Err(Rejection::HostRetention);
        }
    }

    if !request.resources.fits_in(&offer.available()) {
        return Err(Rejection::Resources);
    }

    let available = offer.port_count();
    if request.ports > available {
        return Err(Rejection::Ports {
            needed: request.ports,
            available,
        });
    }

    for constraint in request.constraints {
        if !satisfies(constraint, offer, request.peers) {
            return Err(Rejection::Constraint {
                attribute: constraint.attribute.clone(),
                op: constraint.op,
            });
        }
    }

    Ok(())
}

/// Rejects constraints that could never be evaluated.
pub fn validate_constraints(constraints: &[Constraint]) -> Result<(), String> {
    for c in constraints {
        match c.op {
            ConstraintOp::Unique | ConstraintOp::Cluster => {}
            ConstraintOp::Exclude => {
                if c.value.is_none() {
                    return Err(format!("EXCLUDE on {} needs a value", c.attribute));
                }
            }
            ConstraintOp::Like | ConstraintOp::Unlike => {
                let pattern = c
                    .value
                    .as_deref()
                    .ok_or_else(|| format!("{:?} on {} needs a pattern", c.op, c.attribute))?;
                anchored(pattern).map_err(|e| format!("bad pattern for {}: {e}", c.attribute))?;
            }
            ConstraintOp::Maxper => {
                let n = c
                    .value
                    .as_deref()
                    .and_then(|v| v.parse::<usize>().ok())
                    .filter(|n| *n > 0);
                if n.is_none() {
                    return Err(format!("MAXPER on {} needs a positive count", c.attribute));
                }
            }
        }
    }
    Ok(())
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

fn satisfies(constraint: &Constraint, offer: &Offer, peers: &[TaskGroup]) -> bool {
    let attr = constraint.attribute.as_str();
    let value = offer.attribute(attr);

    match constraint.op {
        ConstraintOp::Unique => {
            value.is_some_and(|v| !peers.iter().any(|p| p.attribute(attr) == Some(v)))
        }
        ConstraintOp::Cluster => match (&constraint.value, value) {
            (Some(want), Some(v)) => want == v,
            (Some(_), None) => false,
            (None, v) => match peers.iter().find_map(|p| p.attribute(attr)) {
                Some(first) => v == Some(first),
                None => v.is_some(),
            },
        },
        ConstraintOp::Like | ConstraintOp::Unlike => {
            let Some(pattern) = constraint.value.as_deref() else {
                return false;
            };
            let re = match anchored(pattern) {
                Ok(re) => re,
                Err(e) => {
                    warn!(attribute = attr, error = %e, "Invalid constraint pattern");
                    return false;
                }
            };
            match (constraint.op, value) {
                (ConstraintOp::Like, Some(v)) => re.is_match(v),
                (ConstraintOp::Like, None) => false,
                (_, Some(v)) => !re.is_match(v),
                (_, None) => true,
            }
        }
        ConstraintOp::Maxper => {
            let Some(limit) = constraint
                .value
                .as_deref()
                .and_then(|v| v.parse::<usize>().ok())
            else {
                return false;
            };
            value.is_some_and(|v| peers.iter().filter(|p| p.attribute(attr) == Some(v)).count() < limit)
        }
        ConstraintOp::Exclude => {
            let excluded = constraint.value.as_deref().unwrap_or_default();
            value.is_none_or(|v| !excluded.split(',').map(str::trim).any(|e| e == v))
        }
    }
}
