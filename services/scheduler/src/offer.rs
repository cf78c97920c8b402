//! Offer pool.
//!
//! Holds the offers currently granted by the resource manager. Iteration works
//! on snapshots so a scan never blocks consumption; consumption itself is
//! serialized by the pool lock and is first-writer-wins: of any number of
//! concurrent `use_offer` calls for one offer, exactly one gets it.
//!
//! Offers leaving the pool are handed back to the caller, which either launches
//! against them or declines them. The pool never drops an offer silently,
//! except on rescind or agent loss, where the resource manager already took it
//! back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::{after, elapsed};
use crate::model::{Offer, Resource};

#[derive(Debug, Default)]
struct PoolInner {
    next_id: u64,
    offers: BTreeMap<u64, Offer>,
    /// Agent id to the time its lost mark expires.
    lost_agents: HashMap<String, DateTime<Utc>>,
    /// In-place grants per agent, stamped onto that agent's offers.
    agent_deltas: HashMap<String, Resource>,
}

/// Pool of live offers.
#[derive(Debug, Default)]
pub struct OfferPool {
    inner: Mutex<PoolInner>,
}

impl OfferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds newly advertised offers, returning their pool ids.
    pub fn add_offers(&self, offers: Vec<Offer>) -> Vec<u64> {
        let mut inner = self.lock();
        let mut ids = Vec::with_capacity(offers.len());
        for mut offer in offers {
            inner.next_id += 1;
            offer.pool_id = inner.next_id;
            offer.delta = inner
                .agent_deltas
                .get(&offer.agent_id)
                .copied()
                .unwrap_or_default();
            debug!(
                offer_id = %offer.id,
                pool_id = offer.pool_id,
                hostname = %offer.hostname,
                "Offer added"
            );
            ids.push(offer.pool_id);
            inner.offers.insert(offer.pool_id, offer);
        }
        ids
    }

    /// Restartable snapshot of the held offers.
    ///
    /// Offers from agents with a live lost mark come after every other offer.
    pub fn snapshot(&self, now: DateTime<Utc>) -> OfferSnapshot {
        let mut inner = self.lock();
        inner.lost_agents.retain(|_, until| *until > now);

        let (mut healthy, lost): (Vec<Offer>, Vec<Offer>) = inner
            .offers
            .values()
            .cloned()
            .partition(|o| !inner.lost_agents.contains_key(&o.agent_id));
        healthy.extend(lost);

        OfferSnapshot {
            offers: healthy,
            pos: 0,
        }
    }

    /// First offer of a fresh snapshot.
    pub fn first_offer(&self, now: DateTime<Utc>) -> Option<Offer> {
        self.snapshot(now).next()
    }

    /// Held offer following `pool_id` in pool order.
    pub fn next_offer(&self, pool_id: u64) -> Option<Offer> {
        self.lock()
            .offers
            .range(pool_id + 1..)
            .next()
            .map(|(_, o)| o.clone())
    }

    /// Atomically takes an offer out of the pool.
    ///
    /// Returns `None` if another caller consumed it first.
    pub fn use_offer(&self, pool_id: u64) -> Option<Offer> {
        self.lock().offers.remove(&pool_id)
    }

    /// Drops a rescinded offer. Returns whether it was still held.
    pub fn rescind(&self, offer_id: &str) -> bool {
        let mut inner = self.lock();
        let found = inner
            .offers
            .iter()
            .find(|(_, o)| o.id == offer_id)
            .map(|(id, _)| *id);
        match found {
            Some(pool_id) => {
                inner.offers.remove(&pool_id);
                true
            }
            None => false,
        }
    }

    /// Removes offers held longer than `ttl`; the caller declines them.
    pub fn expire(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Offer> {
        let mut inner = self.lock();
        let expired: Vec<u64> = inner
            .offers
            .values()
            .filter(|o| elapsed(o.received_at, now) > ttl)
            .map(|o| o.pool_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| inner.offers.remove(&id))
            .collect()
    }

    /// Removes every held offer; the caller declines them.
    pub fn drain(&self) -> Vec<Offer> {
        std::mem::take(&mut self.lock().offers).into_values().collect()
    }

    /// Marks an agent unreachable until `now + ttl` and drops its offers.
    pub fn mark_lost(&self, agent_id: &str, now: DateTime<Utc>, ttl: Duration) -> Vec<Offer> {
        let mut inner = self.lock();
        inner
            .lost_agents
            .insert(agent_id.to_string(), after(now, ttl));
        let gone: Vec<u64> = inner
            .offers
            .values()
            .filter(|o| o.agent_id == agent_id)
            .map(|o| o.pool_id)
            .collect();
        gone.into_iter()
            .filter_map(|id| inner.offers.remove(&id))
            .collect()
    }

    pub fn is_lost(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.lock()
            .lost_agents
            .get(agent_id)
            .is_some_and(|until| *until > now)
    }

    /// Records the in-place grants on an agent and restamps its held offers.
    pub fn set_agent_delta(&self, agent_id: &str, delta: Resource) {
        let mut inner = self.lock();
        if delta.is_zero() {
            inner.agent_deltas.remove(agent_id);
        } else {
            inner.agent_deltas.insert(agent_id.to_string(), delta);
        }
        for offer in inner.offers.values_mut().filter(|o| o.agent_id == agent_id) {
            offer.delta = delta;
        }
    }

    /// Resources a new grant on `agent_id` could use right now.
    pub fn agent_headroom(&self, agent_id: &str) -> Resource {
        self.lock()
            .offers
            .values()
            .filter(|o| o.agent_id == agent_id)
            .map(Offer::available)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.lock().offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time view over the pool's offers.
#[derive(Debug, Clone)]
pub struct OfferSnapshot {
    offers: Vec<Offer>,
    pos: usize,
}

impl OfferSnapshot {
    /// Starts the iteration over from the first offer.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

impl Iterator for OfferSnapshot {
    type Item = Offer;

    fn next(&mut self) -> Option<Offer> {
        let offer = self.offers.get(self.pos).cloned();
        if offer.is_some() {
            self.pos += 1;
        }
        offer
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::model::PortRange;

    fn offer(id: &str, agent: &str, at: DateTime<Utc>) -> Offer {
        Offer {
            id: id.to_string(),
            pool_id: 0,
            agent_id: agent.to_string(),
            hostname: format!("host-{agent}"),
            agent_ip: None,
            attributes: BTreeMap::new(),
            resources: Resource::new(2.0, 2048.0, 1000.0),
            ports: vec![PortRange::new(31000, 31100)],
            received_at: at,
            delta: Resource::default(),
        }
    }

    #[test]
    fn test_ids_increase_and_iteration_restarts() {
        let clock = ManualClock::at_epoch();
        let pool = OfferPool::new();
        let ids = pool.add_offers(vec![offer("o1", "a1", clock.now()), offer("o2", "a2", clock.now())]);
        assert!(ids[0] < ids[1]);

        let mut snapshot = pool.snapshot(clock.now());
        assert_eq!(snapshot.by_ref().count(), 2);
        snapshot.restart();
        assert_eq!(snapshot.next().map(|o| o.id), Some("o1".to_string()));

        let first = pool.first_offer(clock.now()).unwrap();
        assert_eq!(pool.next_offer(first.pool_id).map(|o| o.id), Some("o2".to_string()));
        assert!(pool.next_offer(ids[1]).is_none());
    }

    #[test]
    fn test_use_offer_is_first_writer_wins() {
        let clock = ManualClock::at_epoch();
        let pool = OfferPool::new();
        let ids = pool.add_offers(vec![offer("o1", "a1", clock.now())]);

        let snapshot = pool.snapshot(clock.now());
        assert!(pool.use_offer(ids[0]).is_some());
        assert!(pool.use_offer(ids[0]).is_none());
        // The snapshot still lists it; consuming from a stale view fails cleanly.
        assert_eq!(snapshot.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_lost_agents_sort_last_until_mark_expires() {
        let clock = ManualClock::at_epoch();
        let pool = OfferPool::new();
        pool.mark_lost("a1", clock.now(), Duration::from_secs(60));
        pool.add_offers(vec![offer("o1", "a1", clock.now()), offer("o2", "a2", clock.now())]);

        let order: Vec<String> = pool.snapshot(clock.now()).map(|o| o.id).collect();
        assert_eq!(order, vec!["o2", "o1"]);
        assert!(pool.is_lost("a1", clock.now()));

        clock.advance(Duration::from_secs(61));
        let order: Vec<String> = pool.snapshot(clock.now()).map(|o| o.id).collect();
        assert_eq!(order, vec!["o1", "o2"]);
        assert!(!pool.is_lost("a1", clock.now()));
    }

    #[test]
    fn test_mark_lost_drops_held_offers() {
        let clock = ManualClock::at_epoch();
        let pool = OfferPool::new();
        pool.add_offers(vec![offer("o1", "a1", clock.now()), offer("o2", "a2", clock.now())]);
        let dropped = pool.mark_lost("a1", clock.now(), Duration::from_secs(60));
        assert_eq!(dropped.len(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_expire_and_rescind() {
        let clock = ManualClock::at_epoch();
        let pool = OfferPool::new();
        pool.add_offers(vec![offer("old", "a1", clock.now())]);
        clock.advance(Duration::from_secs(20));
        pool.add_offers(vec![offer("new", "a2", clock.now())]);

        let expired = pool.expire(clock.now(), Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");

        assert!(pool.rescind("new"));
        assert!(!pool.rescind("new"));
        assert!(pool.drain().is_empty());
    }

    #[test]
    fn test_agent_delta_stamped_on_offers() {
        let clock = ManualClock::at_epoch();
        let pool = OfferPool::new();
        pool.add_offers(vec![offer("o1", "a1", clock.now())]);
        pool.set_agent_delta("a1", Resource::new(1.0, 1024.0, 0.0));
        assert_eq!(pool.agent_headroom("a1"), Resource::new(1.0, 1024.0, 1000.0));

        pool.add_offers(vec![offer("o2", "a1", clock.now())]);
        let deltas: Vec<Resource> = pool.snapshot(clock.now()).map(|o| o.delta).collect();
        assert!(deltas.iter().all(|d| *d == Resource::new(1.0, 1024.0, 0.0)));
        assert_eq!(pool.agent_headroom("missing"), Resource::default());
    }

    proptest! {
        #[test]
        fn prop_concurrent_use_offer_has_one_winner(contenders in 2usize..16) {
            let clock = ManualClock::at_epoch();
            let pool = Arc::new(OfferPool::new());
            let ids = pool.add_offers(vec![offer("o1", "a1", clock.now())]);
            let pool_id = ids[0];

            let handles: Vec<_> = (0..contenders)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    std::thread::spawn(move || pool.use_offer(pool_id).is_some())
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            prop_assert_eq!(winners, 1);
        }
    }
}
