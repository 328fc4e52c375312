use strum::Display;

/// One step of an operation on one resource, reported to the
/// embedding's sink. Ordering beyond per-resource causality is
/// not guaranteed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
  /// Stable resource id, eg. `Container myapp-db-1`.
  pub id: String,
  pub status: EventStatus,
  /// Extra human-readable detail.
  pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum EventStatus {
  Creating,
  Created,
  Recreating,
  Recreated,
  Removing,
  Removed,
  Starting,
  Started,
  Killing,
  Killed,
  Restarting,
  Restarted,
  Running,
  Waiting,
  Healthy,
  Exited,
  Skipped,
  Error,
  Warning,
  Info,
}

impl Event {
  pub fn new(
    id: impl Into<String>,
    status: EventStatus,
  ) -> Event {
    Event {
      id: id.into(),
      status,
      text: None,
    }
  }

  pub fn with_text(
    id: impl Into<String>,
    status: EventStatus,
    text: impl Into<String>,
  ) -> Event {
    Event {
      id: id.into(),
      status,
      text: Some(text.into()),
    }
  }

  pub fn container(
    name: &str,
    status: EventStatus,
  ) -> Event {
    Event::new(format!("Container {name}"), status)
  }

  pub fn network(name: &str, status: EventStatus) -> Event {
    Event::new(format!("Network {name}"), status)
  }

  pub fn volume(name: &str, status: EventStatus) -> Event {
    Event::new(format!("Volume {name}"), status)
  }
}

/// Sink for progress events. Implementations must be cheap and
/// non-blocking; the engine emits and moves on.
pub trait Progress: Send + Sync {
  fn event(&self, event: Event);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
  fn event(&self, _: Event) {}
}

/// Forwards events to the tracing subscriber at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl Progress for TracingProgress {
  fn event(&self, event: Event) {
    match &event.text {
      Some(text) => tracing::info!(
        "{} {} {text}", event.id, event.status
      ),
      None => {
        tracing::info!("{} {}", event.id, event.status)
      }
    }
  }
}

/// Buffers events on an unbounded channel, for tests and
/// stream-style consumers.
#[derive(Debug, Clone)]
pub struct ChannelProgress(
  tokio::sync::mpsc::UnboundedSender<Event>,
);

impl ChannelProgress {
  pub fn new() -> (
    ChannelProgress,
    tokio::sync::mpsc::UnboundedReceiver<Event>,
  ) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (ChannelProgress(tx), rx)
  }
}

impl Progress for ChannelProgress {
  fn event(&self, event: Event) {
    // Receiver dropped means nobody is listening anymore.
    let _ = self.0.send(event);
  }
}
