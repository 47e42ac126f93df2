//! Feature-gated counter helpers.
//!
//! With the `metrics` feature off these compile to nothing, so call
//! sites stay unconditional.

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_count(name: &'static str, value: u64) {
    ::metrics::counter!(name, value);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_count(_name: &'static str, _value: u64) {}
