//! Rotating pools of interchangeable resources (proxies, cookie sets).
//!
//! A [`Rotator`] hands out one variant per request. Pools can be replaced or reshuffled while
//! requests are running; a selection always comes from one consistent snapshot of the pool.
//!
//! Strategies:
//! - [`Strategy::RoundRobin`]: cycles through the variants in order.
//! - [`Strategy::LeastRecentlyUsed`]: weighted random draw favoring variants idle the longest;
//!   a variant's weight is `1 + hours since it was last handed out`.

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, MonotonicClock};
use rand::seq::SliceRandom;
use rand::{rng, Rng};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// How a [`Rotator`] picks the next variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(rename_all = "snake_case"))]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastRecentlyUsed,
}

#[derive(Debug)]
struct Pool<T> {
    variants: Vec<T>,
    cursor: AtomicU64,
    last_used: Mutex<Vec<u64>>,
}

impl<T> Pool<T> {
    fn new(variants: Vec<T>, now: u64) -> Self {
        let last_used = Mutex::new(vec![now; variants.len()]);
        Self { variants, cursor: AtomicU64::new(0), last_used }
    }
}

/// Selection weight for a variant last used at `last_used`.
pub fn idle_weight(now_millis: u64, last_used_millis: u64) -> f64 {
    1.0 + now_millis.saturating_sub(last_used_millis) as f64 / MILLIS_PER_HOUR
}

/// Thread-safe rotating pool. Clones share the pool.
pub struct Rotator<T> {
    pool: DynamicConfig<Arc<Pool<T>>>,
    strategy: Strategy,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for Rotator<T> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), strategy: self.strategy, clock: self.clock.clone() }
    }
}

impl<T> fmt::Debug for Rotator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rotator")
            .field("strategy", &self.strategy)
            .field("count", &self.pool.get().variants.len())
            .finish()
    }
}

impl<T> Rotator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(variants: Vec<T>, strategy: Strategy) -> Self {
        Self::with_clock(variants, strategy, MonotonicClock::default())
    }

    pub fn with_clock<C: Clock + 'static>(variants: Vec<T>, strategy: Strategy, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let pool = Arc::new(Pool::new(variants, clock.now_millis()));
        Self { pool: DynamicConfig::new(pool), strategy, clock }
    }

    /// Next variant, or `None` for an empty pool.
    pub fn select(&self) -> Option<T> {
        let pool = self.pool.get();
        if pool.variants.is_empty() {
            return None;
        }
        let index = match self.strategy {
            Strategy::RoundRobin => {
                let turn = pool.cursor.fetch_add(1, Ordering::Relaxed);
                (turn % pool.variants.len() as u64) as usize
            }
            Strategy::LeastRecentlyUsed => self.draw_weighted(&pool, &mut rng()),
        };
        pool.variants.get(index).cloned()
    }

    fn draw_weighted<R: Rng>(&self, pool: &Pool<T>, rng: &mut R) -> usize {
        let now = self.clock.now_millis();
        let mut last_used = pool.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        let weights: Vec<f64> = last_used.iter().map(|&used| idle_weight(now, used)).collect();
        let total: f64 = weights.iter().sum();

        let mut target = rng.random_range(0.0..total);
        let mut chosen = weights.len() - 1;
        for (index, weight) in weights.iter().enumerate() {
            if target < *weight {
                chosen = index;
                break;
            }
            target -= weight;
        }
        last_used[chosen] = now;
        chosen
    }

    /// Replace the pool; selections already made are unaffected.
    pub fn update_pool(&self, variants: Vec<T>) {
        let pool = Arc::new(Pool::new(variants, self.clock.now_millis()));
        self.pool.set(pool);
        tracing::debug!(count = self.count(), "rotation pool replaced");
    }

    /// Randomly reorder the pool.
    pub fn shuffle(&self) {
        let now = self.clock.now_millis();
        self.pool.update(|current| {
            let mut variants = current.variants.clone();
            variants.shuffle(&mut rng());
            Arc::new(Pool::new(variants, now))
        });
    }

    pub fn count(&self) -> usize {
        self.pool.get().variants.len()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Snapshot of the variants in pool order.
    pub fn variants(&self) -> Vec<T> {
        self.pool.get().variants.clone()
    }

    /// Current selection weights, in pool order.
    pub fn weights(&self) -> Vec<f64> {
        let now = self.clock.now_millis();
        let pool = self.pool.get();
        let last_used = pool.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        last_used.iter().map(|&used| idle_weight(now, used)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn empty_pool_selects_nothing() {
        let rotator: Rotator<&str> = Rotator::new(Vec::new(), Strategy::RoundRobin);
        assert_eq!(rotator.select(), None);
        assert_eq!(rotator.count(), 0);
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let rotator = Rotator::new(vec!["a", "b", "c"], Strategy::RoundRobin);
        let picks: Vec<_> = (0..7).filter_map(|_| rotator.select()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn round_robin_is_fair_under_contention() {
        let rotator = Rotator::new(vec![0usize, 1, 2, 3], Strategy::RoundRobin);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rotator = rotator.clone();
                thread::spawn(move || (0..100).filter_map(|_| rotator.select()).collect::<Vec<_>>())
            })
            .collect();
        let mut tally = [0usize; 4];
        for h in handles {
            for pick in h.join().unwrap() {
                tally[pick] += 1;
            }
        }
        assert_eq!(tally, [100, 100, 100, 100]);
    }

    fn picks_stay_in_some_pool_while_swapping(strategy: Strategy) {
        let small: Vec<usize> = (0..3).collect();
        let large: Vec<usize> = (100..107).collect();
        let rotator = Rotator::new(small.clone(), strategy);
        let stop = Arc::new(AtomicBool::new(false));

        let selectors: Vec<_> = (0..4)
            .map(|_| {
                let rotator = rotator.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut picks = Vec::new();
                    loop {
                        picks.extend(rotator.select());
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    picks
                })
            })
            .collect();

        for round in 0..200 {
            if round % 2 == 0 {
                rotator.update_pool(large.clone());
            } else {
                rotator.update_pool(small.clone());
            }
            rotator.shuffle();
            thread::yield_now();
        }
        stop.store(true, Ordering::Relaxed);

        let mut total = 0;
        for handle in selectors {
            for pick in handle.join().unwrap() {
                assert!(small.contains(&pick) || large.contains(&pick), "stray pick {pick}");
                total += 1;
            }
        }
        assert!(total > 0);
        let count = rotator.count();
        assert!(count == small.len() || count == large.len());
    }

    #[test]
    fn round_robin_select_races_pool_swaps() {
        picks_stay_in_some_pool_while_swapping(Strategy::RoundRobin);
    }

    #[test]
    fn least_recently_used_select_races_pool_swaps() {
        picks_stay_in_some_pool_while_swapping(Strategy::LeastRecentlyUsed);
    }

    #[test]
    fn update_pool_swaps_variants() {
        let rotator = Rotator::new(vec!["old"], Strategy::RoundRobin);
        let before = rotator.variants();
        rotator.update_pool(vec!["new-1", "new-2"]);
        assert_eq!(before, vec!["old"]);
        assert_eq!(rotator.count(), 2);
        assert_eq!(rotator.select(), Some("new-1"));
    }

    #[test]
    fn shuffle_keeps_the_same_members() {
        let rotator = Rotator::new((0..20).collect::<Vec<u32>>(), Strategy::RoundRobin);
        rotator.shuffle();
        let members: HashSet<u32> = rotator.variants().into_iter().collect();
        assert_eq!(members, (0..20).collect());
    }

    #[test]
    fn idle_variants_gain_weight() {
        let clock = ManualClock::new();
        let rotator =
            Rotator::with_clock(vec!["a", "b"], Strategy::LeastRecentlyUsed, clock.clone());
        assert_eq!(rotator.weights(), vec![1.0, 1.0]);

        clock.advance(Duration::from_secs(5 * 3600));
        let picked = rotator.select().unwrap();
        let weights = rotator.weights();
        let (used, idle) = if picked == "a" { (weights[0], weights[1]) } else { (weights[1], weights[0]) };
        assert_eq!(used, 1.0);
        assert_eq!(idle, 6.0);
    }

    #[test]
    fn least_recently_used_reaches_every_variant() {
        let clock = ManualClock::new();
        let rotator =
            Rotator::with_clock(vec![1, 2, 3], Strategy::LeastRecentlyUsed, clock.clone());
        let mut seen = HashSet::new();
        for _ in 0..300 {
            clock.advance(Duration::from_secs(600));
            seen.extend(rotator.select());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn idle_weight_formula() {
        assert_eq!(idle_weight(0, 0), 1.0);
        assert_eq!(idle_weight(7_200_000, 0), 3.0);
        assert_eq!(idle_weight(0, 10), 1.0);
    }
}
