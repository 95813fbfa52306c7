//! A process-global statsd metrics sink.
//!
//! Metrics are emitted through the [`metric!`](crate::metric) macro and sent
//! as DogStatsD-style lines over UDP. When no sink is configured, all
//! emission points are no-ops.

use std::fmt::Write as _;
use std::net::{SocketAddr, UdpSocket};
use std::sync::OnceLock;
use std::time::Duration;

static SINK: OnceLock<Option<StatsdSink>> = OnceLock::new();

#[derive(Debug)]
struct StatsdSink {
    socket: UdpSocket,
    target: SocketAddr,
}

/// Installs the global metrics sink.
///
/// Passing `None` disables metrics. Calling this more than once has no
/// effect; the first configuration wins.
pub fn configure(target: Option<SocketAddr>) {
    let sink = target.and_then(|target| {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
            Ok(socket) => socket,
            Err(error) => {
                tracing::error!(%error, "could not create statsd socket, metrics disabled");
                return None;
            }
        };
        Some(StatsdSink { socket, target })
    });

    let _ = SINK.set(sink);
}

fn send(line: &str) {
    if let Some(Some(sink)) = SINK.get() {
        // UDP send never blocks; failures are intentionally dropped.
        let _ = sink.socket.send_to(line.as_bytes(), sink.target);
    }
}

/// Formats one statsd line: `name:value|type[|#tag:value,…]`.
fn format_line(name: &str, value: &str, ty: &str, tags: &[(&str, &str)]) -> String {
    let mut line = format!("{name}:{value}|{ty}");
    for (i, (key, tag_value)) in tags.iter().enumerate() {
        let sep = if i == 0 { "|#" } else { "," };
        let _ = write!(&mut line, "{sep}{key}:{tag_value}");
    }
    line
}

/// Emits a counter increment.
pub fn emit_counter(name: &str, value: i64, tags: &[(&str, &str)]) {
    send(&format_line(name, &value.to_string(), "c", tags));
}

/// Emits a timing in milliseconds.
pub fn emit_timer(name: &str, duration: Duration, tags: &[(&str, &str)]) {
    let millis = duration.as_secs_f64() * 1_000.0;
    send(&format_line(name, &format!("{millis:.3}"), "ms", tags));
}

/// Emits a gauge value.
pub fn emit_gauge(name: &str, value: u64, tags: &[(&str, &str)]) {
    send(&format_line(name, &value.to_string(), "g", tags));
}

/// Emits a histogram sample.
pub fn emit_histogram(name: &str, value: u64, tags: &[(&str, &str)]) {
    send(&format_line(name, &value.to_string(), "h", tags));
}

/// Emits a metric to the global sink.
///
/// ```ignore
/// metric!(counter("symbolicate.request_error") += 1, "reason" => "too_many_jobs");
/// metric!(timer("diskcache.get") = elapsed, "result" => "hit");
/// metric!(gauge("diskcache.usage") = total_bytes);
/// metric!(histogram("symbolicate.jobs_count") = jobs.len() as u64);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($name:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::emit_counter($name, $value, &[$(($k, $v)),*])
    };
    (timer($name:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::emit_timer($name, $value, &[$(($k, $v)),*])
    };
    (gauge($name:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::emit_gauge($name, $value, &[$(($k, $v)),*])
    };
    (histogram($name:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::emit_histogram($name, $value, &[$(($k, $v)),*])
    };
}
