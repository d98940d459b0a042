//! Process metrics: counters, gauges and request-duration histograms,
//! rendered in the Prometheus text exposition format.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

const BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Default)]
struct Histogram {
    bucket_counts: [u64; BUCKETS.len()],
    sum_secs: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, secs: f64) {
        for (i, bound) in BUCKETS.iter().enumerate() {
            if secs <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.sum_secs += secs;
        self.count += 1;
    }
}

#[derive(Default)]
struct HistogramVec {
    families: Mutex<BTreeMap<&'static str, Histogram>>,
}

impl HistogramVec {
    fn observe(&self, label: &'static str, secs: f64) {
        let mut families = self.families.lock().expect("metrics lock");
        families.entry(label).or_default().observe(secs);
    }

    fn render(&self, name: &str, out: &mut String) {
        use std::fmt::Write;
        let families = self.families.lock().expect("metrics lock");
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for (label, hist) in families.iter() {
            for (i, bound) in BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}_bucket{{label=\"{}\",le=\"{}\"}} {}",
                    name, label, bound, hist.bucket_counts[i]
                );
            }
            let _ = writeln!(out, "{}_bucket{{label=\"{}\",le=\"+Inf\"}} {}", name, label, hist.count);
            let _ = writeln!(out, "{}_sum{{label=\"{}\"}} {}", name, label, hist.sum_secs);
            let _ = writeln!(out, "{}_count{{label=\"{}\"}} {}", name, label, hist.count);
        }
    }
}

#[derive(Default)]
struct CounterVec {
    counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl CounterVec {
    fn inc(&self, label: &'static str) {
        self.inc_by(label, 1);
    }

    fn inc_by(&self, label: &'static str, n: u64) {
        let mut counts = self.counts.lock().expect("metrics lock");
        *counts.entry(label).or_default() += n;
    }

    fn render(&self, name: &str, out: &mut String) {
        use std::fmt::Write;
        let counts = self.counts.lock().expect("metrics lock");
        let _ = writeln!(out, "# TYPE {} counter", name);
        for (label, count) in counts.iter() {
            let _ = writeln!(out, "{}{{label=\"{}\"}} {}", name, label, count);
        }
    }
}

/// Measures one request; the duration is recorded when the observer drops.
pub struct RequestObserver<'a> {
    family: &'a HistogramVec,
    label: &'static str,
    start: Instant,
}

impl Drop for RequestObserver<'_> {
    fn drop(&mut self) {
        self.family.observe(self.label, self.start.elapsed().as_secs_f64());
    }
}

/// All metrics the service exposes.
#[derive(Default)]
pub struct Metrics {
    web_requests_in: HistogramVec,
    apub_requests_in: HistogramVec,
    apub_requests_out: HistogramVec,
    feeds_requested: CounterVec,
    post_flow: CounterVec,
    feeds_updated: AtomicU64,
    new_posts_saved: AtomicU64,
    feed_toots_sent: AtomicU64,
    service_started: AtomicU64,
    total_followers: AtomicI64,
    total_posts: AtomicI64,
    toot_queue_length: AtomicI64,
    checkable_feed_count: AtomicI64,
    db_file_size: AtomicI64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn start_web_request_in(&self, label: &'static str) -> RequestObserver<'_> {
        RequestObserver {
            family: &self.web_requests_in,
            label,
            start: Instant::now(),
        }
    }

    pub fn start_apub_request_in(&self, label: &'static str) -> RequestObserver<'_> {
        RequestObserver {
            family: &self.apub_requests_in,
            label,
            start: Instant::now(),
        }
    }

    pub fn start_apub_request_out(&self, label: &'static str) -> RequestObserver<'_> {
        RequestObserver {
            family: &self.apub_requests_out,
            label,
            start: Instant::now(),
        }
    }

    pub fn feed_requested(&self, label: &'static str) {
        self.feeds_requested.inc(label);
    }

    pub fn post_flow(&self, label: &'static str) {
        self.post_flow.inc(label);
    }

    pub fn post_flow_by(&self, label: &'static str, n: u64) {
        self.post_flow.inc_by(label, n);
    }

    pub fn feed_updated(&self) {
        self.feeds_updated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_post_saved(&self) {
        self.new_posts_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn feed_toot_sent(&self) {
        self.feed_toots_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn service_started(&self) {
        self.service_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_followers(&self, count: i64) {
        self.total_followers.store(count, Ordering::Relaxed);
    }

    pub fn total_posts(&self, count: i64) {
        self.total_posts.store(count, Ordering::Relaxed);
    }

    pub fn toot_queue_length(&self, length: i64) {
        self.toot_queue_length.store(length, Ordering::Relaxed);
    }

    pub fn checkable_feed_count(&self, count: i64) {
        self.checkable_feed_count.store(count, Ordering::Relaxed);
    }

    pub fn db_file_size(&self, bytes: i64) {
        self.db_file_size.store(bytes, Ordering::Relaxed);
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        self.web_requests_in.render("web_requests_in_duration", &mut out);
        self.apub_requests_in.render("apub_requests_in_duration", &mut out);
        self.apub_requests_out.render("apub_requests_out_duration", &mut out);
        self.feeds_requested.render("feeds_requested", &mut out);
        self.post_flow.render("post_flow", &mut out);
        for (name, val) in [
            ("feeds_updated", &self.feeds_updated),
            ("new_posts_saved", &self.new_posts_saved),
            ("feed_toots_sent", &self.feed_toots_sent),
            ("service_started", &self.service_started),
        ] {
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, val.load(Ordering::Relaxed));
        }
        for (name, val) in [
            ("total_follower_count", &self.total_followers),
            ("total_post_count", &self.total_posts),
            ("toot_queue_length", &self.toot_queue_length),
            ("checkable_feed_count", &self.checkable_feed_count),
            ("db_file_size", &self.db_file_size),
        ] {
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, val.load(Ordering::Relaxed));
        }
        out
    }
}
