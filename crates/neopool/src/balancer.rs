//! Pluggable selection strategies over a pool's idle connections.
//!
//! The pool hands each balancer a snapshot of the idle candidates (the
//! balancer never sees busy or failed connections) and gets back an index
//! into that snapshot, or `None` when nothing is eligible — the pool reads
//! `None` as the cue to create a connection or fail.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// What a balancer sees about one idle connection.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Pool-assigned connection id, stable across selections.
    pub id: u64,
    pub total_requests: u64,
    pub avg_response_time: Duration,
    pub last_response_time: Duration,
    pub created_at: Instant,
    /// Seconds since the connection last carried a request.
    pub idle_secs: f64,
}

/// Selection strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    Random,
    RoundRobin,
    LeastConnections,
    ResponseTime,
    #[default]
    WeightedResponseTime,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::ResponseTime => "response_time",
            Strategy::WeightedResponseTime => "weighted_response_time",
        }
    }

    /// Lenient parse; unknown names fall back to `Random`, matching the
    /// factory behavior callers of this family of pools expect.
    pub fn parse(name: &str) -> Self {
        match name {
            "round_robin" => Strategy::RoundRobin,
            "least_connections" => Strategy::LeastConnections,
            "response_time" => Strategy::ResponseTime,
            "weighted_response_time" => Strategy::WeightedResponseTime,
            _ => Strategy::Random,
        }
    }
}

/// A selector over idle candidates.
pub trait Balancer: Send {
    /// Pick an index into `candidates`, or `None` when the list is empty.
    fn select(&mut self, candidates: &[Candidate]) -> Option<usize>;
}

/// Build the balancer for a strategy tag.
pub fn create_balancer(strategy: Strategy) -> Box<dyn Balancer> {
    match strategy {
        Strategy::Random => Box::new(RandomBalancer),
        Strategy::RoundRobin => Box::new(RoundRobinBalancer::default()),
        Strategy::LeastConnections => Box::new(LeastConnectionsBalancer),
        Strategy::ResponseTime => Box::new(ResponseTimeBalancer),
        Strategy::WeightedResponseTime => Box::new(WeightedResponseTimeBalancer::default()),
    }
}

/// Uniform choice.
pub struct RandomBalancer;

impl Balancer for RandomBalancer {
    fn select(&mut self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

/// Monotonically advancing index modulo the filtered list.
#[derive(Default)]
pub struct RoundRobinBalancer {
    current: usize,
}

impl Balancer for RoundRobinBalancer {
    fn select(&mut self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        self.current = (self.current + 1) % candidates.len();
        Some(self.current)
    }
}

/// Minimum `total_requests`; oldest connection wins ties.
pub struct LeastConnectionsBalancer;

impl Balancer for LeastConnectionsBalancer {
    fn select(&mut self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (c.total_requests, c.created_at))
            .map(|(i, _)| i)
    }
}

/// Minimum `avg_response_time`; oldest connection wins ties.
pub struct ResponseTimeBalancer;

impl Balancer for ResponseTimeBalancer {
    fn select(&mut self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (c.avg_response_time, c.created_at))
            .map(|(i, _)| i)
    }
}

/// Blend of historical and most-recent response time, with an idle-time
/// scale so a slow connection still gets traffic eventually.
pub struct WeightedResponseTimeBalancer {
    /// Weight of the historical average; the rest goes to the last sample.
    recent_weight: f64,
    last_selected: HashMap<u64, Instant>,
}

impl Default for WeightedResponseTimeBalancer {
    fn default() -> Self {
        Self {
            recent_weight: 0.7,
            last_selected: HashMap::new(),
        }
    }
}

impl Balancer for WeightedResponseTimeBalancer {
    fn select(&mut self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            let avg_ms = c.avg_response_time.as_secs_f64() * 1000.0;
            let last_ms = c.last_response_time.as_secs_f64() * 1000.0;
            let mut score = self.recent_weight * avg_ms + (1.0 - self.recent_weight) * last_ms;
            // Idle-time scale, fixed at 0.1 per idle second.
            score *= 1.0 + c.idle_secs * 0.1;

            match best {
                Some((_, best_score)) if score >= best_score => {}
                _ => best = Some((i, score)),
            }
        }

        let (index, _) = best?;
        self.last_selected
            .insert(candidates[index].id, Instant::now());
        Some(index)
    }
}
