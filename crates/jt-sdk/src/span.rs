//! Scoped span guard: a `start_span`/`end_span` pair that closes itself on
//! any exit path, mirroring a context-manager's guarantee without needing
//! one.

use crate::Emitter;

pub struct SpanGuard<'a> {
    emitter: &'a Emitter,
    span_id: String,
    status: String,
    ended: bool,
}

impl<'a> SpanGuard<'a> {
    pub(crate) fn new(emitter: &'a Emitter, span_id: String) -> Self {
        SpanGuard {
            emitter,
            span_id,
            status: "ok".to_owned(),
            ended: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.span_id
    }

    /// Override the status recorded when the guard is dropped (default `"ok"`).
    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if !self.ended {
            self.ended = true;
            self.emitter.end_span(&self.span_id, self.status.clone(), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Emitter, EmitterConfig};

    #[test]
    fn guard_ends_span_on_drop() {
        let emitter = Emitter::connect(EmitterConfig::new("127.0.0.1:1", "unit-test"));
        {
            let mut guard = emitter.scoped_span("work", None);
            guard.set_status("failed");
        }
        let stats = emitter.stats();
        assert_eq!(stats.buffer_size, 2); // span-open + span-close
    }
}
