//! Rolling 5-minute per-route request/error counters (§4.O).
//!
//! Buckets are 1-minute wide; the ring holds 5 of them. Old buckets age
//! out lazily on the next record/read rather than via a background timer
//! — there is no external metrics backend in scope.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

const BUCKET_MS: i64 = 60_000;
const WINDOW_BUCKETS: i64 = 5;

#[derive(Default, Clone, Copy)]
struct Bucket {
    index: i64,
    requests: u64,
    errors: u64,
}

#[derive(Default)]
struct RouteCounters {
    buckets: Vec<Bucket>,
}

impl RouteCounters {
    fn record(&mut self, now_bucket: i64, is_error: bool) {
        self.buckets.retain(|b| now_bucket - b.index < WINDOW_BUCKETS);
        match self.buckets.iter_mut().find(|b| b.index == now_bucket) {
            Some(b) => {
                b.requests += 1;
                if is_error {
                    b.errors += 1;
                }
            }
            None => self.buckets.push(Bucket {
                index: now_bucket,
                requests: 1,
                errors: if is_error { 1 } else { 0 },
            }),
        }
    }

    fn totals(&self, now_bucket: i64) -> (u64, u64) {
        self.buckets
            .iter()
            .filter(|b| now_bucket - b.index < WINDOW_BUCKETS)
            .fold((0, 0), |(req, err), b| (req + b.requests, err + b.errors))
    }
}

#[derive(Default)]
pub struct Metrics {
    routes: Mutex<HashMap<String, RouteCounters>>,
}

#[derive(Serialize)]
pub struct RouteMetric {
    pub route: String,
    pub requests: u64,
    pub errors: u64,
}

impl Metrics {
    pub fn record(&self, route: &str, is_error: bool) {
        let now_bucket = crate::models::now() / BUCKET_MS;
        let mut routes = self.routes.lock().expect("metrics mutex poisoned");
        routes
            .entry(route.to_string())
            .or_default()
            .record(now_bucket, is_error);
    }

    pub fn snapshot(&self) -> Vec<RouteMetric> {
        let now_bucket = crate::models::now() / BUCKET_MS;
        let routes = self.routes.lock().expect("metrics mutex poisoned");
        let mut out: Vec<RouteMetric> = routes
            .iter()
            .map(|(route, counters)| {
                let (requests, errors) = counters.totals(now_bucket);
                RouteMetric {
                    route: route.clone(),
                    requests,
                    errors,
                }
            })
            .collect();
        out.sort_by(|a, b| a.route.cmp(&b.route));
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_requests_and_errors_separately() {
        let metrics = Metrics::default();
        metrics.record("/sessions", false);
        metrics.record("/sessions", true);
        let snapshot = metrics.snapshot();
        let route = snapshot.iter().find(|r| r.route == "/sessions").unwrap();
        assert_eq!(route.requests, 2);
        assert_eq!(route.errors, 1);
    }

    #[test]
    fn old_buckets_are_dropped_on_record() {
        let mut counters = RouteCounters::default();
        counters.record(0, false);
        counters.record(100, false);
        assert_eq!(counters.buckets.len(), 1);
    }
}
