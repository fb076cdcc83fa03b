use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::timeout_at;

use emberpack_core::diagnostic::Diagnostic;

use crate::protocol::ClientMessage;
use crate::protocol::PROTOCOL_VERSION;
use crate::protocol::ServerMessage;
use crate::protocol::SyncEvent;

pub type SessionId = u32;

/// An unacked chunk batch: until this resolves, later batches are not
/// delivered to the session.
#[derive(Debug)]
struct Awaiting {
  batch: u32,
  /// When suppression lifts regardless of the ack, so one stalled client
  /// cannot dam its own update stream forever.
  deadline: Instant,
}

/// One published batch held back while the session's previous batch is
/// unacked.
#[derive(Debug)]
struct PendingBatch {
  batch: u32,
  frames: Vec<ServerMessage>,
  needs_ack: bool,
}

/// Server-side state for one connected client runtime.
#[derive(Debug)]
struct ClientSession {
  tx: mpsc::UnboundedSender<ServerMessage>,
  route: Option<String>,
  /// Highest batch this client has applied.
  last_ack: u32,
  /// Set when a full reload was pushed; the socket closing afterwards is the
  /// expected outcome, not a failure.
  expecting_reload: bool,
  awaiting: Option<Awaiting>,
  /// Batches queued while delivery is suppressed, in publish order.
  queued: VecDeque<PendingBatch>,
}

impl ClientSession {
  /// Deliver queued batches until one that itself requires an ack.
  fn flush(&mut self, now: Instant, ack_timeout: Duration) {
    while self.awaiting.is_none() {
      let Some(next) = self.queued.pop_front() else {
        break;
      };
      for frame in next.frames {
        let _ = self.tx.send(frame);
      }
      if next.needs_ack {
        self.awaiting = Some(Awaiting {
          batch: next.batch,
          deadline: now + ack_timeout,
        });
      }
    }
  }

  fn release_expired(&mut self, now: Instant, ack_timeout: Duration) {
    if let Some(awaiting) = &self.awaiting {
      if awaiting.deadline <= now {
        self.awaiting = None;
        self.flush(now, ack_timeout);
      }
    }
  }

  fn acked(&mut self, batch: u32, now: Instant, ack_timeout: Duration) {
    self.last_ack = self.last_ack.max(batch);
    // It applied a patch after all; no reload is coming.
    self.expecting_reload = false;
    if self
      .awaiting
      .as_ref()
      .is_some_and(|awaiting| awaiting.batch <= self.last_ack)
    {
      self.awaiting = None;
      self.flush(now, ack_timeout);
    }
  }
}

#[derive(Debug, Default)]
struct Shared {
  sessions: HashMap<SessionId, ClientSession>,
  next_session: SessionId,
  /// Batches published so far. Clients count terminal sync frames on their
  /// side; websocket ordering keeps the two counters in agreement.
  current_batch: u32,
}

/// What one finished build pushes to clients. Chunk frames go out first so a
/// client that acks a batch is guaranteed to have the code; diagnostics
/// suppress the reload frame, since reloading into a broken build would just
/// lose the overlay.
#[derive(Debug, Default)]
pub struct BuildDelivery {
  pub chunks: Vec<ServerMessage>,
  pub errors: Vec<Diagnostic>,
  pub requires_reload: bool,
}

/// Tracks connected HMR clients and fans build results out to them.
///
/// Delivery is ordered per session: a chunk batch is not sent while the
/// session's previous chunk batch is unacked. Suppressed batches queue on the
/// session and are released by the ack, by the session closing, or by
/// `ack_timeout` elapsing, so a stalled client delays only itself and only
/// for a bounded time.
///
/// Shared between the websocket tasks and the build loop; all state sits
/// behind one mutex and every lock section is short and non-async.
#[derive(Debug)]
pub struct HmrCoordinator {
  shared: Mutex<Shared>,
  ack_progress: Notify,
  ack_timeout: Duration,
  weak: Weak<HmrCoordinator>,
}

impl HmrCoordinator {
  pub fn new(ack_timeout: Duration) -> std::sync::Arc<Self> {
    std::sync::Arc::new_cyclic(|weak| HmrCoordinator {
      shared: Mutex::new(Shared::default()),
      ack_progress: Notify::new(),
      ack_timeout,
      weak: weak.clone(),
    })
  }

  /// Register a connected client and send its handshake ack. The session
  /// starts current: it owes acks only for batches published after this
  /// point, since its page load already carries the latest output.
  pub fn connect(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> SessionId {
    let mut shared = self.shared.lock().unwrap();
    let id = shared.next_session;
    shared.next_session += 1;
    let _ = tx.send(ServerMessage::HandshakeAck {
      version: PROTOCOL_VERSION,
    });
    let last_ack = shared.current_batch;
    shared.sessions.insert(
      id,
      ClientSession {
        tx,
        route: None,
        last_ack,
        expecting_reload: false,
        awaiting: None,
        queued: VecDeque::new(),
      },
    );
    tracing::debug!(session = id, "hmr client connected");
    id
  }

  /// Drop a session. Any wait blocked on this client's ack resolves, since a
  /// gone client can no longer hold a batch open.
  pub fn disconnect(&self, id: SessionId) {
    let session = self.shared.lock().unwrap().sessions.remove(&id);
    if let Some(session) = session {
      if session.expecting_reload {
        tracing::debug!(session = id, "hmr client closed for reload");
      } else {
        tracing::debug!(session = id, "hmr client disconnected");
      }
      self.ack_progress.notify_waiters();
    }
  }

  pub fn client_count(&self) -> usize {
    self.shared.lock().unwrap().sessions.len()
  }

  pub fn handle_message(&self, id: SessionId, message: ClientMessage) {
    match message {
      ClientMessage::BatchStart => {
        let shared = self.shared.lock().unwrap();
        if let Some(session) = shared.sessions.get(&id) {
          let _ = session.tx.send(ServerMessage::Sync(SyncEvent::Started));
        }
      }
      ClientMessage::Subscribe { route } => {
        let mut shared = self.shared.lock().unwrap();
        if let Some(session) = shared.sessions.get_mut(&id) {
          tracing::debug!(session = id, route = %route, "hmr client subscribed");
          session.route = Some(route);
        }
      }
      ClientMessage::Ack { batch } => {
        {
          let mut shared = self.shared.lock().unwrap();
          if let Some(session) = shared.sessions.get_mut(&id) {
            session.acked(batch, Instant::now(), self.ack_timeout);
          }
        }
        self.ack_progress.notify_waiters();
      }
    }
  }

  /// Tell clients their write burst was observed, before the build finishes.
  /// Not subject to delivery suppression: it carries no code.
  pub fn seen_files(&self) {
    self.broadcast(ServerMessage::Sync(SyncEvent::SeenFiles));
  }

  /// Push one finished build to every client and close it with the sync
  /// event. A session still awaiting its previous chunk batch has the whole
  /// delivery queued instead of sent. Returns the batch number to pass to
  /// [`wait_for_acks`].
  ///
  /// [`wait_for_acks`]: HmrCoordinator::wait_for_acks
  pub fn publish(&self, event: SyncEvent, delivery: BuildDelivery) -> u32 {
    let BuildDelivery {
      chunks,
      errors,
      requires_reload,
    } = delivery;
    let needs_ack = !chunks.is_empty();
    let reload = requires_reload && errors.is_empty();

    let mut frames = chunks;
    if !errors.is_empty() {
      frames.push(ServerMessage::ErrorOverlay {
        diagnostics: errors,
      });
    } else if requires_reload {
      frames.push(ServerMessage::Reload);
    }
    frames.push(ServerMessage::Sync(event));

    let now = Instant::now();
    let mut any_queued = false;
    let mut dead = Vec::new();
    let batch = {
      let mut shared = self.shared.lock().unwrap();
      shared.current_batch += 1;
      let batch = shared.current_batch;

      for (&id, session) in shared.sessions.iter_mut() {
        if reload {
          session.expecting_reload = true;
        }
        session.release_expired(now, self.ack_timeout);

        if session.awaiting.is_some() {
          session.queued.push_back(PendingBatch {
            batch,
            frames: frames.clone(),
            needs_ack,
          });
          any_queued = true;
          continue;
        }

        let mut failed = false;
        for frame in &frames {
          if session.tx.send(frame.clone()).is_err() {
            failed = true;
            break;
          }
        }
        if failed {
          dead.push(id);
        } else if needs_ack {
          session.awaiting = Some(Awaiting {
            batch,
            deadline: now + self.ack_timeout,
          });
        }
      }
      batch
    };

    for id in dead {
      self.disconnect(id);
    }
    if any_queued {
      self.spawn_release_timer();
    }
    batch
  }

  /// Block until every connected client has acked `batch`, the ack timeout
  /// elapses, or all lagging clients disconnect. Returns whether every
  /// remaining client has acked.
  pub async fn wait_for_acks(&self, batch: u32) -> bool {
    let deadline = Instant::now() + self.ack_timeout;
    loop {
      // Arm the waiter before checking, so an ack landing in between still
      // wakes us.
      let progress = self.ack_progress.notified();
      if self.all_acked(batch) {
        return true;
      }
      if timeout_at(deadline, progress).await.is_err() {
        let acked = self.all_acked(batch);
        if !acked {
          tracing::warn!(batch, "timed out waiting for client acks");
        }
        return acked;
      }
    }
  }

  fn all_acked(&self, batch: u32) -> bool {
    let shared = self.shared.lock().unwrap();
    shared
      .sessions
      .values()
      .all(|session| session.last_ack >= batch)
  }

  fn broadcast(&self, message: ServerMessage) {
    let mut dead = Vec::new();
    {
      let shared = self.shared.lock().unwrap();
      for (&id, session) in &shared.sessions {
        if session.tx.send(message.clone()).is_err() {
          dead.push(id);
        }
      }
    }
    for id in dead {
      self.disconnect(id);
    }
  }

  /// Arrange for suppressed deliveries to be flushed once the oldest
  /// outstanding ack deadline passes.
  fn spawn_release_timer(&self) {
    let Some(this) = self.weak.upgrade() else {
      return;
    };
    let ack_timeout = self.ack_timeout;
    tokio::spawn(async move {
      tokio::time::sleep(ack_timeout).await;
      this.release_expired_sessions();
    });
  }

  fn release_expired_sessions(&self) {
    let now = Instant::now();
    let still_queued = {
      let mut shared = self.shared.lock().unwrap();
      for session in shared.sessions.values_mut() {
        session.release_expired(now, self.ack_timeout);
      }
      shared
        .sessions
        .values()
        .any(|session| !session.queued.is_empty())
    };
    self.ack_progress.notify_waiters();
    if still_queued {
      self.spawn_release_timer();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;

  use super::*;

  fn coordinator(ack_timeout: Duration) -> Arc<HmrCoordinator> {
    HmrCoordinator::new(ack_timeout)
  }

  fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
      messages.push(message);
    }
    messages
  }

  fn chunk_batch(generation: u64) -> BuildDelivery {
    BuildDelivery {
      chunks: vec![ServerMessage::Chunk {
        generation,
        code: b"code".to_vec(),
      }],
      ..Default::default()
    }
  }

  fn generations_of(messages: &[ServerMessage]) -> Vec<u64> {
    messages
      .iter()
      .filter_map(|message| match message {
        ServerMessage::Chunk { generation, .. } => Some(*generation),
        _ => None,
      })
      .collect()
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn handshake_ack_is_sent_on_connect() {
    let coordinator = coordinator(Duration::from_secs(1));
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.connect(tx);

    assert_eq!(
      rx.recv().await.unwrap(),
      ServerMessage::HandshakeAck {
        version: PROTOCOL_VERSION
      }
    );
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn chunks_precede_the_finish_sync_frame() {
    let coordinator = coordinator(Duration::from_secs(1));
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.connect(tx);
    drain(&mut rx);

    coordinator.publish(
      SyncEvent::AnyBuildFinished,
      BuildDelivery {
        chunks: vec![
          ServerMessage::Chunk {
            generation: 1,
            code: b"a".to_vec(),
          },
          ServerMessage::Chunk {
            generation: 1,
            code: b"b".to_vec(),
          },
        ],
        ..Default::default()
      },
    );

    let messages = drain(&mut rx);
    assert!(matches!(messages[0], ServerMessage::Chunk { .. }));
    assert!(matches!(messages[1], ServerMessage::Chunk { .. }));
    assert_eq!(messages[2], ServerMessage::Sync(SyncEvent::AnyBuildFinished));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn next_batch_is_held_until_the_previous_ack() {
    let coordinator = coordinator(Duration::from_secs(5));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = coordinator.connect(tx);
    drain(&mut rx);

    let first = coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(1));
    coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(2));

    // Only the first batch's chunk is on the wire while its ack is pending.
    assert_eq!(generations_of(&drain(&mut rx)), vec![1]);

    coordinator.handle_message(session, ClientMessage::Ack { batch: first });
    assert_eq!(generations_of(&drain(&mut rx)), vec![2]);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn suppressed_batches_release_in_publish_order() {
    let coordinator = coordinator(Duration::from_secs(5));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = coordinator.connect(tx);
    drain(&mut rx);

    let first = coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(1));
    let second = coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(2));
    coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(3));

    coordinator.handle_message(session, ClientMessage::Ack { batch: first });
    assert_eq!(generations_of(&drain(&mut rx)), vec![2]);

    coordinator.handle_message(session, ClientMessage::Ack { batch: second });
    assert_eq!(generations_of(&drain(&mut rx)), vec![3]);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn suppression_lifts_after_the_ack_timeout() {
    let coordinator = coordinator(Duration::from_millis(30));
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.connect(tx);
    drain(&mut rx);

    coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(1));
    coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(2));
    assert_eq!(generations_of(&drain(&mut rx)), vec![1]);

    // A stalled client delays its own stream for at most the ack timeout.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(generations_of(&drain(&mut rx)), vec![2]);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn ackless_batches_are_never_suppressed() {
    let coordinator = coordinator(Duration::from_secs(5));
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.connect(tx);
    drain(&mut rx);

    // No chunks, so nothing to ack and nothing to hold later batches back.
    coordinator.publish(SyncEvent::ResultDidNotBundle, BuildDelivery::default());
    coordinator.publish(SyncEvent::AnyBuildFinished, chunk_batch(1));

    let messages = drain(&mut rx);
    assert_eq!(messages[0], ServerMessage::Sync(SyncEvent::ResultDidNotBundle));
    assert_eq!(generations_of(&messages), vec![1]);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn diagnostics_suppress_the_reload_frame() {
    let coordinator = coordinator(Duration::from_secs(1));
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.connect(tx);
    drain(&mut rx);

    coordinator.publish(
      SyncEvent::AnyBuildFinished,
      BuildDelivery {
        errors: vec![Diagnostic::new("unexpected token")],
        requires_reload: true,
        ..Default::default()
      },
    );

    let messages = drain(&mut rx);
    assert!(messages
      .iter()
      .all(|message| *message != ServerMessage::Reload));
    assert!(matches!(messages[0], ServerMessage::ErrorOverlay { .. }));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn batch_start_is_answered_with_started() {
    let coordinator = coordinator(Duration::from_secs(1));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = coordinator.connect(tx);
    drain(&mut rx);

    coordinator.handle_message(session, ClientMessage::BatchStart);

    assert_eq!(
      rx.recv().await.unwrap(),
      ServerMessage::Sync(SyncEvent::Started)
    );
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn wait_resolves_once_every_client_acks() {
    let coordinator = coordinator(Duration::from_secs(5));
    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    let a = coordinator.connect(tx_a);
    let b = coordinator.connect(tx_b);

    let batch = coordinator.publish(
      SyncEvent::AnyBuildFinishedWaitForWebSockets,
      BuildDelivery::default(),
    );

    let waiter = {
      let coordinator = Arc::clone(&coordinator);
      tokio::spawn(async move { coordinator.wait_for_acks(batch).await })
    };

    coordinator.handle_message(a, ClientMessage::Ack { batch });
    coordinator.handle_message(b, ClientMessage::Ack { batch });

    assert!(waiter.await.unwrap());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn wait_times_out_when_a_client_never_acks() {
    let coordinator = coordinator(Duration::from_millis(30));
    let (tx, _rx) = mpsc::unbounded_channel();
    coordinator.connect(tx);

    let batch = coordinator.publish(
      SyncEvent::AnyBuildFinishedWaitForWebSockets,
      BuildDelivery::default(),
    );

    assert!(!coordinator.wait_for_acks(batch).await);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn disconnect_resolves_a_pending_wait() {
    let coordinator = coordinator(Duration::from_secs(5));
    let (tx, _rx) = mpsc::unbounded_channel();
    let session = coordinator.connect(tx);

    let batch = coordinator.publish(
      SyncEvent::AnyBuildFinishedWaitForWebSockets,
      BuildDelivery::default(),
    );

    let waiter = {
      let coordinator = Arc::clone(&coordinator);
      tokio::spawn(async move { coordinator.wait_for_acks(batch).await })
    };

    coordinator.disconnect(session);

    assert!(waiter.await.unwrap());
    assert_eq!(coordinator.client_count(), 0);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn late_sessions_do_not_owe_earlier_batches() {
    let coordinator = coordinator(Duration::from_secs(5));
    let batch = coordinator.publish(SyncEvent::AnyBuildFinished, BuildDelivery::default());

    let (tx, _rx) = mpsc::unbounded_channel();
    coordinator.connect(tx);

    assert!(coordinator.wait_for_acks(batch).await);
  }
}
