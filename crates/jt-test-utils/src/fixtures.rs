//! Envelope builders used across test suites so scenario tests don't all
//! hand-roll the same boilerplate.

use jt_protocol::{
    Envelope, EventPayload, Level, MetricPayload, Payload, ProgressPayload, ResourcePayload,
};

pub fn event(src: &str, level: Level, msg: &str) -> Envelope {
    Envelope::new(
        src,
        jt_protocol::now_millis(),
        Payload::Event(EventPayload {
            level,
            msg: msg.to_owned(),
            ctx: None,
        }),
    )
}

pub fn metric(src: &str, name: &str, value: f64, unit: &str) -> Envelope {
    Envelope::new(
        src,
        jt_protocol::now_millis(),
        Payload::Metric(MetricPayload {
            name: name.to_owned(),
            value,
            unit: unit.to_owned(),
            tags: None,
        }),
    )
}

pub fn progress(src: &str, job_id: &str, percent: i32, status: &str) -> Envelope {
    Envelope::new(
        src,
        jt_protocol::now_millis(),
        Payload::Progress(ProgressPayload {
            job_id: job_id.to_owned(),
            percent,
            status: status.to_owned(),
        }),
    )
}

pub fn resource(src: &str) -> Envelope {
    Envelope::new(
        src,
        jt_protocol::now_millis(),
        Payload::Resource(ResourcePayload {
            cpu: 0.5,
            mem: 0.4,
            disk: 0.1,
            net: 0.0,
        }),
    )
}

pub fn heartbeat(src: &str) -> Envelope {
    Envelope::new(src, jt_protocol::now_millis(), Payload::Heartbeat)
}

pub fn goodbye(src: &str) -> Envelope {
    Envelope::new(src, jt_protocol::now_millis(), Payload::Goodbye)
}
