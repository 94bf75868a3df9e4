//! Record and playback of transport traffic
//!
//! [`RecordingTransport`](crate::transport::RecordingTransport) captures a
//! session as [`MessageEvent`]s; [`PlaybackTransport`] replays such a log into
//! a client and checks what the client sends back.

mod message_event;
mod playback;

pub use message_event::*;
pub use playback::*;

/// Errors reading a traffic log
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Line {line}: malformed event header: {text}")]
    InvalidHeader { line: usize, text: String },

    #[error("Event starting on line {line} has an unterminated payload")]
    UnterminatedPayload { line: usize },

    #[error("Event starting on line {line} has an invalid payload: {source}")]
    InvalidPayload {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event starting on line {line}: payload is not a JSON object")]
    NotAnObject { line: usize },

    #[error("Failed to read log: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `runtime` until `duration` of its clock has passed
#[cfg(test)]
pub(crate) fn run_for(runtime: &lumen_runtime::Runtime, duration: std::time::Duration) {
    let rt = runtime.clone();
    let stopper = runtime.timer(move |timer: &lumen_runtime::Timer| {
        timer.stop();
        rt.stop();
    });
    stopper.start(duration);
    runtime.run().unwrap();
}
