use biometrics::{Collector, Counter, Moments};

pub(crate) static DISPATCH_REQUESTS: Counter = Counter::new("parley.dispatch.requests");
pub(crate) static DISPATCH_BUSY: Counter = Counter::new("parley.dispatch.busy");
pub(crate) static DISPATCH_ERRORS: Counter = Counter::new("parley.dispatch.errors");
pub(crate) static DISPATCH_TIMEOUTS: Counter = Counter::new("parley.dispatch.timeouts");
pub(crate) static DISPATCH_ABORTS: Counter = Counter::new("parley.dispatch.aborts");
pub(crate) static DISPATCH_BUFFERED: Counter = Counter::new("parley.dispatch.buffered");
pub(crate) static DISPATCH_STREAMED: Counter = Counter::new("parley.dispatch.streamed");
pub(crate) static DISPATCH_TTFB: Moments = Moments::new("parley.dispatch.ttfb_seconds");

pub(crate) static STREAM_DELTAS: Counter = Counter::new("parley.stream.deltas");
pub(crate) static STREAM_MALFORMED: Counter = Counter::new("parley.stream.malformed");
pub(crate) static STREAM_BYTES: Counter = Counter::new("parley.stream.bytes");
pub(crate) static STREAM_DURATION: Moments = Moments::new("parley.stream.duration_seconds");

pub(crate) static SESSION_TURNS: Counter = Counter::new("parley.session.turns");
pub(crate) static SESSION_FAILURES: Counter = Counter::new("parley.session.failures");
pub(crate) static COLD_START_COUNTDOWNS: Counter = Counter::new("parley.cold_start.countdowns");
pub(crate) static COLD_START_RETRIES: Counter = Counter::new("parley.cold_start.retries");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&DISPATCH_REQUESTS);
    collector.register_counter(&DISPATCH_BUSY);
    collector.register_counter(&DISPATCH_ERRORS);
    collector.register_counter(&DISPATCH_TIMEOUTS);
    collector.register_counter(&DISPATCH_ABORTS);
    collector.register_counter(&DISPATCH_BUFFERED);
    collector.register_counter(&DISPATCH_STREAMED);
    collector.register_moments(&DISPATCH_TTFB);

    collector.register_counter(&STREAM_DELTAS);
    collector.register_counter(&STREAM_MALFORMED);
    collector.register_counter(&STREAM_BYTES);
    collector.register_moments(&STREAM_DURATION);

    collector.register_counter(&SESSION_TURNS);
    collector.register_counter(&SESSION_FAILURES);
    collector.register_counter(&COLD_START_COUNTDOWNS);
    collector.register_counter(&COLD_START_RETRIES);
}
